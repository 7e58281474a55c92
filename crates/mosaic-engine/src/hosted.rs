use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{response_json_or_error, truncate_text};

pub const DEFAULT_ASPECT_RATIO: &str = "1:1";
pub const DEFAULT_RESOLUTION: &str = "2K";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub aspect_ratio: Option<String>,
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_images: Vec<String>,
}

impl HostedRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Request body with service defaults filled in.
    pub fn to_payload(&self) -> HostedRequest {
        HostedRequest {
            aspect_ratio: Some(
                self.aspect_ratio
                    .clone()
                    .filter(|value| !value.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_ASPECT_RATIO.to_string()),
            ),
            resolution: Some(
                self.resolution
                    .clone()
                    .filter(|value| !value.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_RESOLUTION.to_string()),
            ),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostedState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedStatus {
    #[serde(rename = "status")]
    pub state: HostedState,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedImage {
    pub job_id: String,
    pub image_url: String,
}

/// A generation service that takes a prompt rather than a graph.
pub trait HostedClient: Send + Sync {
    fn name(&self) -> &str;
    fn submit(&self, request: &HostedRequest) -> Result<String>;
    fn poll_status(&self, id: &str) -> Result<HostedStatus>;
}

pub struct HostedApiClient {
    base_url: String,
    api_token: Option<String>,
    http: HttpClient,
}

impl HostedApiClient {
    pub fn new(base_url: &str, api_token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_token: api_token.filter(|token| !token.trim().is_empty()),
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_token(&self) -> bool {
        self.api_token.is_some()
    }

    /// Status endpoint for `id`, with the id percent-encoded as one path
    /// segment.
    pub fn status_url(&self, id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .with_context(|| format!("invalid hosted base url ({})", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("hosted base url cannot take a path ({})", self.base_url))?
            .pop_if_empty()
            .extend(["api", "generate", "v2", "status", id]);
        Ok(url)
    }
}

impl HostedClient for HostedApiClient {
    fn name(&self) -> &str {
        &self.base_url
    }

    fn submit(&self, request: &HostedRequest) -> Result<String> {
        let Some(token) = self.api_token.as_deref() else {
            bail!("MOSAIC_HOSTED_API_TOKEN is required for hosted generation");
        };
        let endpoint = format!("{}/api/generate/v2", self.base_url);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(token)
            .json(&request.to_payload())
            .send()
            .with_context(|| format!("hosted generation request failed ({endpoint})"))?;
        let status = response.status();
        let body = response
            .text()
            .context("hosted generation response body read failed")?;
        let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        parse_generation_response(status.as_u16(), status.is_success(), &parsed)
            .with_context(|| format!("hosted generation rejected: {}", truncate_text(&body, 256)))
    }

    fn poll_status(&self, id: &str) -> Result<HostedStatus> {
        let endpoint = self.status_url(id)?;
        let response = self
            .http
            .get(endpoint.clone())
            .send()
            .with_context(|| format!("hosted status request failed ({endpoint})"))?;
        let payload = response_json_or_error("hosted status", response)?;
        serde_json::from_value(payload).context("hosted service returned malformed status")
    }
}

fn parse_generation_response(code: u16, ok: bool, payload: &Value) -> Result<String> {
    let success = payload
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !ok || !success {
        let message = payload
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("generation failed ({code})"));
        bail!(message);
    }
    payload
        .get("generationId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .context("hosted service returned no generation id")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn payload_fills_service_defaults() -> anyhow::Result<()> {
        let mut request = HostedRequest::new("a quiet harbor");
        request.model_id = Some("flux-pro".to_string());
        let payload = serde_json::to_value(request.to_payload())?;
        assert_eq!(
            payload,
            json!({
                "prompt": "a quiet harbor",
                "modelId": "flux-pro",
                "aspectRatio": "1:1",
                "resolution": "2K",
            })
        );

        request.aspect_ratio = Some("16:9".to_string());
        request.reference_images = vec!["https://x/ref.png".to_string()];
        let payload = serde_json::to_value(request.to_payload())?;
        assert_eq!(payload["aspectRatio"], json!("16:9"));
        assert_eq!(payload["referenceImages"], json!(["https://x/ref.png"]));
        Ok(())
    }

    #[test]
    fn generation_response_requires_success_and_id() {
        let ok = parse_generation_response(200, true, &json!({"success": true, "generationId": "g-7"}));
        assert_eq!(ok.ok().as_deref(), Some("g-7"));

        let refused = parse_generation_response(
            402,
            false,
            &json!({"success": false, "error": "insufficient credits"}),
        );
        assert_eq!(
            refused.err().map(|err| err.to_string()).as_deref(),
            Some("insufficient credits")
        );

        let missing = parse_generation_response(200, true, &json!({"success": true}));
        assert!(missing.is_err());
        let opaque = parse_generation_response(500, false, &Value::Null);
        assert_eq!(
            opaque.err().map(|err| err.to_string()).as_deref(),
            Some("generation failed (500)")
        );
    }

    #[test]
    fn status_parses_service_shape() -> anyhow::Result<()> {
        let status: HostedStatus = serde_json::from_value(json!({
            "status": "completed",
            "imageUrl": "https://cdn.example/g-7.png",
            "error": null
        }))?;
        assert_eq!(status.state, HostedState::Completed);
        assert_eq!(status.image_url.as_deref(), Some("https://cdn.example/g-7.png"));
        let pending: HostedStatus = serde_json::from_value(json!({"status": "pending"}))?;
        assert_eq!(pending.state, HostedState::Pending);
        assert!(pending.error.is_none());
        Ok(())
    }

    #[test]
    fn status_url_encodes_the_generation_id() -> anyhow::Result<()> {
        let client = HostedApiClient::new("https://hosted.example/", None);
        assert_eq!(
            client.status_url("g-7")?.as_str(),
            "https://hosted.example/api/generate/v2/status/g-7"
        );
        assert_eq!(
            client.status_url("a b/c?d")?.as_str(),
            "https://hosted.example/api/generate/v2/status/a%20b%2Fc%3Fd"
        );
        let nested = HostedApiClient::new("https://hosted.example/proxy", None);
        assert_eq!(
            nested.status_url("g-7")?.as_str(),
            "https://hosted.example/proxy/api/generate/v2/status/g-7"
        );
        Ok(())
    }

    #[test]
    fn missing_token_refuses_to_submit() {
        let client = HostedApiClient::new("https://hosted.example/", Some("  ".to_string()));
        assert!(!client.has_token());
        assert_eq!(client.base_url(), "https://hosted.example");
        let err = client.submit(&HostedRequest::new("x")).err();
        assert!(err
            .map(|err| err.to_string().contains("MOSAIC_HOSTED_API_TOKEN"))
            .unwrap_or(false));
    }
}

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use mosaic_contracts::graph::Graph;
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{response_json_or_error, response_text_or_error, truncate_text};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubmitResponse {
    pub job_id: String,
    /// Per-node reasons the engine refused the graph; empty when accepted.
    pub validation_errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct OutputImage {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SlotOutput {
    #[serde(default)]
    pub images: Vec<OutputImage>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobStatus {
    pub status_label: String,
    pub completed: bool,
    /// Output slots in the order the engine reported them.
    pub outputs: IndexMap<String, SlotOutput>,
}

impl JobStatus {
    pub fn is_error(&self) -> bool {
        self.status_label.eq_ignore_ascii_case("error")
    }

    pub fn first_image(&self) -> Option<&OutputImage> {
        self.outputs
            .values()
            .find_map(|slot| slot.images.first())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetBytes {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// The four engine endpoints a job touches.
pub trait EngineClient: Send + Sync {
    fn name(&self) -> &str;
    fn submit(&self, graph: &Graph) -> Result<SubmitResponse>;
    /// `Ok(None)` while the engine has no record of the job yet.
    fn status(&self, job_id: &str) -> Result<Option<JobStatus>>;
    fn fetch_output(&self, image: &OutputImage) -> Result<AssetBytes>;
    /// Stores `bytes` in the engine's input area, returning the asset name
    /// image-input nodes should reference.
    fn upload_asset(&self, bytes: Vec<u8>, filename: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    status: HistoryStatus,
    #[serde(default)]
    outputs: IndexMap<String, SlotOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct HistoryStatus {
    #[serde(default)]
    status_str: String,
    #[serde(default)]
    completed: bool,
}

pub struct HttpEngineClient {
    base_url: String,
    client_id: String,
    http: HttpClient,
}

impl HttpEngineClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            client_id: uuid::Uuid::new_v4().to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn check_connection(&self) -> Result<()> {
        let endpoint = format!("{}/system_stats", self.base_url);
        let response = self
            .http
            .get(&endpoint)
            .send()
            .with_context(|| format!("engine unreachable ({endpoint})"))?;
        if !response.status().is_success() {
            bail!("engine health check failed ({})", response.status().as_u16());
        }
        Ok(())
    }

    pub fn list_checkpoints(&self) -> Vec<String> {
        let endpoint = format!("{}/models/checkpoints", self.base_url);
        self.http
            .get(&endpoint)
            .send()
            .ok()
            .filter(|response| response.status().is_success())
            .and_then(|response| response.json::<Vec<String>>().ok())
            .unwrap_or_default()
    }
}

impl EngineClient for HttpEngineClient {
    fn name(&self) -> &str {
        &self.base_url
    }

    fn submit(&self, graph: &Graph) -> Result<SubmitResponse> {
        let endpoint = format!("{}/prompt", self.base_url);
        let payload = json!({
            "prompt": graph,
            "client_id": self.client_id,
        });
        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .with_context(|| format!("engine submission failed ({endpoint})"))?;
        let status = response.status();
        let body = response
            .text()
            .context("engine submission response body read failed")?;

        if status.is_client_error() {
            if let Some(rejection) = serde_json::from_str::<Value>(&body)
                .ok()
                .as_ref()
                .and_then(parse_rejection)
            {
                return Ok(rejection);
            }
        }
        if !status.is_success() {
            bail!(
                "engine submission failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }

        let parsed: Value =
            serde_json::from_str(&body).context("engine returned invalid submission JSON")?;
        let job_id = parsed
            .get("prompt_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .with_context(|| format!("engine response has no prompt_id: {}", truncate_text(&body, 256)))?;
        Ok(SubmitResponse {
            job_id,
            validation_errors: parsed
                .get("node_errors")
                .and_then(Value::as_object)
                .map(node_error_reasons)
                .unwrap_or_default(),
        })
    }

    fn status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let endpoint = format!("{}/history/{}", self.base_url, job_id);
        let response = self
            .http
            .get(&endpoint)
            .send()
            .with_context(|| format!("engine status request failed ({endpoint})"))?;
        let body = response_text_or_error("engine status", response)?;
        let mut history: IndexMap<String, HistoryEntry> =
            serde_json::from_str(&body).context("engine returned malformed history")?;
        Ok(history.shift_remove(job_id).map(|entry| JobStatus {
            status_label: entry.status.status_str,
            completed: entry.status.completed,
            outputs: entry.outputs,
        }))
    }

    fn fetch_output(&self, image: &OutputImage) -> Result<AssetBytes> {
        let endpoint = format!("{}/view", self.base_url);
        let response = self
            .http
            .get(&endpoint)
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.location.as_str()),
            ])
            .send()
            .with_context(|| format!("engine image download failed ({})", image.filename))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "engine image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .filter(|value| !value.trim().is_empty());
        let bytes = response
            .bytes()
            .context("failed reading engine image bytes")?
            .to_vec();
        Ok(AssetBytes { bytes, mime_type })
    }

    fn upload_asset(&self, bytes: Vec<u8>, filename: &str) -> Result<String> {
        let endpoint = format!("{}/upload/image", self.base_url);
        let form = MultipartForm::new()
            .part(
                "image",
                MultipartPart::bytes(bytes).file_name(filename.to_string()),
            )
            .text("overwrite", "true");
        let response = self
            .http
            .post(&endpoint)
            .multipart(form)
            .send()
            .with_context(|| format!("engine image upload failed ({endpoint})"))?;
        let payload = response_json_or_error("engine image upload", response)?;
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .with_context(|| format!("engine upload response has no name: {payload}"))?;
        let subfolder = payload
            .get("subfolder")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if subfolder.is_empty() {
            Ok(name.to_string())
        } else {
            Ok(format!("{subfolder}/{name}"))
        }
    }
}

fn parse_rejection(payload: &Value) -> Option<SubmitResponse> {
    let mut reasons = payload
        .get("node_errors")
        .and_then(Value::as_object)
        .map(node_error_reasons)
        .unwrap_or_default();
    if reasons.is_empty() {
        let error = payload.get("error")?;
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        reasons.insert("prompt".to_string(), message);
    }
    Some(SubmitResponse {
        job_id: payload
            .get("prompt_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        validation_errors: reasons,
    })
}

fn node_error_reasons(errors: &Map<String, Value>) -> BTreeMap<String, String> {
    errors
        .iter()
        .map(|(node_id, detail)| (node_id.clone(), describe_node_error(detail)))
        .collect()
}

fn describe_node_error(detail: &Value) -> String {
    if let Some(text) = detail.as_str() {
        return text.to_string();
    }
    let messages: Vec<String> = detail
        .get("errors")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let message = row.get("message").and_then(Value::as_str)?;
                    match row.get("details").and_then(Value::as_str) {
                        Some(details) if !details.is_empty() => {
                            Some(format!("{message}: {details}"))
                        }
                        _ => Some(message.to_string()),
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    if messages.is_empty() {
        detail.to_string()
    } else {
        messages.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn first_image_skips_empty_slots_in_engine_order() -> anyhow::Result<()> {
        let outputs: IndexMap<String, SlotOutput> = serde_json::from_str(
            r#"{
                "12": {"text": ["ignored"]},
                "9": {"images": []},
                "30": {"images": [{"filename": "b.png", "subfolder": "", "type": "output"}]},
                "100": {"images": [{"filename": "a.png", "subfolder": "x", "type": "temp"}]}
            }"#,
        )?;
        let status = JobStatus {
            status_label: "success".to_string(),
            completed: true,
            outputs,
        };
        assert_eq!(
            status.first_image().map(|image| image.filename.as_str()),
            Some("b.png")
        );
        assert!(!status.is_error());
        Ok(())
    }

    #[test]
    fn rejection_collects_node_error_messages() {
        let rejection = parse_rejection(&json!({
            "error": {"type": "prompt_outputs_failed_validation", "message": "Prompt outputs failed validation"},
            "node_errors": {
                "4": {
                    "errors": [{"message": "Value not in list", "details": "ckpt_name: 'missing.safetensors'"}],
                    "class_type": "CheckpointLoaderSimple"
                }
            }
        }));
        let reasons = rejection.map(|value| value.validation_errors).unwrap_or_default();
        assert_eq!(
            reasons.get("4").map(String::as_str),
            Some("Value not in list: ckpt_name: 'missing.safetensors'")
        );
    }

    #[test]
    fn rejection_without_node_errors_uses_top_level_message() {
        let rejection = parse_rejection(&json!({
            "error": {"type": "prompt_no_outputs", "message": "Prompt has no outputs"},
            "node_errors": {}
        }));
        let reasons = rejection.map(|value| value.validation_errors).unwrap_or_default();
        assert_eq!(
            reasons.get("prompt").map(String::as_str),
            Some("Prompt has no outputs")
        );
        assert!(parse_rejection(&json!({"detail": "nope"})).is_none());
    }

    #[test]
    fn http_client_normalizes_base_url() {
        let client = HttpEngineClient::new(" http://127.0.0.1:8188/ ");
        assert_eq!(client.base_url(), "http://127.0.0.1:8188");
        assert_eq!(client.name(), "http://127.0.0.1:8188");
    }
}

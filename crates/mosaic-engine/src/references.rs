use anyhow::{bail, Context, Result};
use mosaic_contracts::events::{
    emit_optional, EventWriter, REFERENCE_SKIPPED, REFERENCE_UPLOADED,
};
use mosaic_contracts::graph::{Graph, NodeId};
use reqwest::blocking::Client as HttpClient;
use serde_json::json;

use crate::client::EngineClient;
use crate::job::JobError;
use crate::{error_chain_text, map_object, truncate_text};

pub const FALLBACK_EXTENSION: &str = "png";

pub const NO_IMAGE_SLOTS_WARNING: &str = "The template has no LoadImage nodes, so reference images were not applied. \
To use reference images, import a template that includes LoadImage nodes (for example an img2img workflow).";

/// Where reference image bytes come from.
pub trait ImageSource: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpImageSource {
    http: HttpClient,
}

impl HttpImageSource {
    pub fn new() -> Self {
        Self {
            http: HttpClient::new(),
        }
    }
}

impl Default for HttpImageSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageSource for HttpImageSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("reference image request failed ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "reference image download failed ({code}): {}",
                truncate_text(&body, 256)
            );
        }
        Ok(response
            .bytes()
            .context("failed reading reference image bytes")?
            .to_vec())
    }
}

/// Moves the request's reference images into the engine and points the
/// template's image-input nodes at them, pairing the i-th URL with the i-th
/// node. URLs beyond the available slots are dropped.
///
/// Transfer failures abort the job. A template without image-input slots
/// only yields a warning.
pub fn apply_reference_images(
    graph: &mut Graph,
    urls: &[String],
    load_images: &[NodeId],
    source: &dyn ImageSource,
    engine: &dyn EngineClient,
    events: Option<&EventWriter>,
) -> Result<Option<String>, JobError> {
    if urls.is_empty() {
        return Ok(None);
    }
    if load_images.is_empty() {
        emit_optional(
            events,
            REFERENCE_SKIPPED,
            map_object(json!({
                "reason": "no_image_inputs",
                "dropped": urls.len(),
            })),
        );
        return Ok(Some(NO_IMAGE_SLOTS_WARNING.to_string()));
    }

    let count = urls.len().min(load_images.len());
    let batch = uuid::Uuid::new_v4().simple().to_string();
    for (index, (url, node_id)) in urls.iter().zip(load_images).enumerate() {
        let bytes = source
            .fetch(url)
            .map_err(|err| JobError::ReferenceFetchFailed {
                url: url.clone(),
                reason: error_chain_text(&err, 512),
            })?;
        let filename = format!("ref_{}_{}.{}", batch, index, reference_extension(url));
        let asset = engine
            .upload_asset(bytes, &filename)
            .map_err(|err| JobError::ReferenceUploadFailed {
                filename: filename.clone(),
                reason: error_chain_text(&err, 512),
            })?;
        if let Some(node) = graph.get_mut(node_id) {
            node.set_scalar("image", asset.clone());
        }
        emit_optional(
            events,
            REFERENCE_UPLOADED,
            map_object(json!({
                "index": index,
                "node_id": node_id,
                "url": url,
                "asset": asset,
            })),
        );
    }

    if urls.len() > count {
        emit_optional(
            events,
            REFERENCE_SKIPPED,
            map_object(json!({
                "reason": "more_urls_than_image_inputs",
                "dropped": urls.len() - count,
            })),
        );
    }
    Ok(None)
}

/// Image extension named by the URL's last path segment, ignoring query
/// and fragment; [`FALLBACK_EXTENSION`] otherwise.
pub fn reference_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let segment = path.rsplit('/').next().unwrap_or_default();
    let Some((_, ext)) = segment.rsplit_once('.') else {
        return FALLBACK_EXTENSION;
    };
    match ext.to_ascii_lowercase().as_str() {
        "jpg" => "jpg",
        "jpeg" => "jpeg",
        "png" => "png",
        "webp" => "webp",
        "gif" => "gif",
        _ => FALLBACK_EXTENSION,
    }
}

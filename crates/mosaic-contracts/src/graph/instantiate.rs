use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::roles::{infer_roles, GraphIncomplete, RoleMap};
use super::summary::calculate_size;
use super::Graph;

/// Exclusive upper bound for generated seeds.
pub const SEED_UPPER_BOUND: u32 = 1 << 31;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt_text: String,
    #[serde(default)]
    pub negative_prompt_text: Option<String>,
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Only consulted when neither `width` nor `height` is set.
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub reference_image_urls: Vec<String>,
}

impl GenerationRequest {
    pub fn new(prompt_text: impl Into<String>) -> Self {
        Self {
            prompt_text: prompt_text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstantiatedGraph {
    pub graph: Graph,
    pub roles: RoleMap,
    pub seed: u32,
}

pub fn instantiate(
    template: &Graph,
    request: &GenerationRequest,
) -> Result<InstantiatedGraph, GraphIncomplete> {
    instantiate_with_rng(template, request, &mut rand::rng())
}

/// Copies `template` and writes the request into the inferred role nodes.
/// The template itself is only read; roles are inferred from it on every
/// call.
pub fn instantiate_with_rng<R: Rng + ?Sized>(
    template: &Graph,
    request: &GenerationRequest,
    rng: &mut R,
) -> Result<InstantiatedGraph, GraphIncomplete> {
    let roles = infer_roles(template)?;
    let mut graph = template.clone();
    let seed = request
        .seed
        .unwrap_or_else(|| rng.random_range(0..SEED_UPPER_BOUND));

    if let Some(node) = graph.get_mut(&roles.positive_prompt) {
        node.set_scalar("text", request.prompt_text.clone());
    }

    let negative_text = request
        .negative_prompt_text
        .as_deref()
        .filter(|text| !text.is_empty());
    if let (Some(text), Some(node_id)) = (negative_text, roles.negative_prompt.as_deref()) {
        if let Some(node) = graph.get_mut(node_id) {
            node.set_scalar("text", text);
        }
    }

    if let Some(node) = graph.get_mut(&roles.sampler) {
        node.set_scalar("seed", seed);
    }

    if let Some(node_id) = roles.latent_image.as_deref() {
        let (width, height) = requested_size(template, node_id, request);
        if let Some(node) = graph.get_mut(node_id) {
            if let Some(width) = width {
                node.set_scalar("width", width);
            }
            if let Some(height) = height {
                node.set_scalar("height", height);
            }
        }
    }

    Ok(InstantiatedGraph { graph, roles, seed })
}

fn requested_size(
    template: &Graph,
    latent_id: &str,
    request: &GenerationRequest,
) -> (Option<u32>, Option<u32>) {
    let width = request.width.filter(|value| *value > 0);
    let height = request.height.filter(|value| *value > 0);
    if width.is_some() || height.is_some() {
        return (width, height);
    }
    let Some(ratio) = request.aspect_ratio.as_deref() else {
        return (None, None);
    };
    let dims = template.get(latent_id).and_then(|node| {
        let width = node.scalar("width").and_then(Value::as_u64)?;
        let height = node.scalar("height").and_then(Value::as_u64)?;
        Some((u32::try_from(width).ok()?, u32::try_from(height).ok()?))
    });
    match dims {
        Some((base_width, base_height)) => {
            let (width, height) = calculate_size(ratio, base_width, base_height);
            (Some(width), Some(height))
        }
        None => (None, None),
    }
}

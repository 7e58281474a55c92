use std::fmt;

use thiserror::Error;

use super::{Graph, Node, NodeId};

/// Semantic slots a template must (or may) expose for generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Sampler,
    Prompt,
    LatentSize,
    Checkpoint,
    OutputSink,
    ImageInput,
}

impl NodeRole {
    pub fn kinds(self) -> &'static [&'static str] {
        match self {
            Self::Sampler => &["KSampler", "KSamplerAdvanced"],
            Self::Prompt => &["CLIPTextEncode"],
            Self::LatentSize => &["EmptyLatentImage"],
            Self::Checkpoint => &["CheckpointLoaderSimple", "CheckpointLoader"],
            Self::OutputSink => &["SaveImage", "PreviewImage"],
            Self::ImageInput => &["LoadImage"],
        }
    }

    pub fn matches(self, node: &Node) -> bool {
        self.kinds().iter().any(|kind| *kind == node.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingRole {
    Sampler,
    Prompt,
}

impl fmt::Display for MissingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sampler => f.write_str("sampler"),
            Self::Prompt => f.write_str("prompt"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("graph incomplete: no {role} node found (expected one of {expected})")]
pub struct GraphIncomplete {
    pub role: MissingRole,
    pub expected: String,
}

impl GraphIncomplete {
    fn missing(role: MissingRole, node_role: NodeRole) -> Self {
        Self {
            role,
            expected: node_role.kinds().join(", "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleMap {
    pub positive_prompt: NodeId,
    pub negative_prompt: Option<NodeId>,
    pub sampler: NodeId,
    pub latent_image: Option<NodeId>,
    pub checkpoint: Option<NodeId>,
    pub save_image: Option<NodeId>,
    pub load_images: Vec<NodeId>,
}

/// Locates the generation roles of `graph`.
///
/// The sampler's `positive`, `negative` and `latent_image` references are
/// trusted first; the first node of the matching kind is the fallback for
/// the positive prompt and latent size. The negative prompt is only ever
/// taken from the sampler's wiring.
pub fn infer_roles(graph: &Graph) -> Result<RoleMap, GraphIncomplete> {
    let sampler = first_of(graph, NodeRole::Sampler)
        .ok_or_else(|| GraphIncomplete::missing(MissingRole::Sampler, NodeRole::Sampler))?;

    let positive_prompt = traced(graph, &sampler, "positive", NodeRole::Prompt)
        .or_else(|| first_of(graph, NodeRole::Prompt))
        .ok_or_else(|| GraphIncomplete::missing(MissingRole::Prompt, NodeRole::Prompt))?;
    let negative_prompt = traced(graph, &sampler, "negative", NodeRole::Prompt);
    let latent_image = traced(graph, &sampler, "latent_image", NodeRole::LatentSize)
        .or_else(|| first_of(graph, NodeRole::LatentSize));

    Ok(RoleMap {
        positive_prompt,
        negative_prompt,
        latent_image,
        checkpoint: first_of(graph, NodeRole::Checkpoint),
        save_image: first_of(graph, NodeRole::OutputSink),
        load_images: graph
            .ordered_nodes()
            .filter(|(_, node)| NodeRole::ImageInput.matches(node))
            .map(|(id, _)| id.to_string())
            .collect(),
        sampler,
    })
}

fn first_of(graph: &Graph, role: NodeRole) -> Option<NodeId> {
    graph
        .ordered_nodes()
        .find(|(_, node)| role.matches(node))
        .map(|(id, _)| id.to_string())
}

fn traced(graph: &Graph, from: &str, input: &str, role: NodeRole) -> Option<NodeId> {
    graph
        .resolve_reference(from, input)
        .filter(|(_, node)| role.matches(node))
        .map(|(id, _)| id.to_string())
}

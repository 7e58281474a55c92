use serde::Serialize;
use serde_json::Value;

use super::roles::{infer_roles, GraphIncomplete};
use super::{Graph, InputValue, Node};

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TemplateSummary {
    pub node_count: usize,
    pub checkpoint: Option<String>,
    pub steps: Option<u64>,
    pub cfg: Option<f64>,
    pub sampler_name: Option<String>,
    pub scheduler: Option<String>,
    pub width: Option<u64>,
    pub height: Option<u64>,
}

/// Best-effort overview of a template. Templates whose roles cannot be
/// inferred still report their node count.
pub fn summarize(graph: &Graph) -> TemplateSummary {
    let mut summary = TemplateSummary {
        node_count: graph.len(),
        ..TemplateSummary::default()
    };
    let Ok(roles) = infer_roles(graph) else {
        return summary;
    };

    if let Some(sampler) = graph.get(&roles.sampler) {
        summary.steps = sampler.scalar("steps").and_then(Value::as_u64);
        summary.cfg = sampler.scalar("cfg").and_then(Value::as_f64);
        summary.sampler_name = scalar_string(sampler, "sampler_name");
        summary.scheduler = scalar_string(sampler, "scheduler");
    }
    if let Some(latent) = roles.latent_image.as_deref().and_then(|id| graph.get(id)) {
        summary.width = latent.scalar("width").and_then(Value::as_u64);
        summary.height = latent.scalar("height").and_then(Value::as_u64);
    }
    if let Some(checkpoint) = roles.checkpoint.as_deref().and_then(|id| graph.get(id)) {
        summary.checkpoint = scalar_string(checkpoint, "ckpt_name");
    }
    summary
}

/// Operator-facing listing of the nodes a generation touches and the
/// scalar inputs that can be edited on the stored template.
pub fn describe_editable_nodes(graph: &Graph) -> Result<String, GraphIncomplete> {
    let roles = infer_roles(graph)?;
    let mut lines: Vec<String> = Vec::new();

    if let Some(sampler) = graph.get(&roles.sampler) {
        lines.push(heading(&roles.sampler, sampler, "Main Sampler"));
        for (key, value) in scalar_inputs(sampler) {
            if key == "seed" {
                lines.push(format!("  {key}: [randomized per generation]"));
            } else {
                lines.push(format!("  {key}: {value}"));
            }
        }
    }

    if let Some(positive) = graph.get(&roles.positive_prompt) {
        lines.push(String::new());
        lines.push(heading(&roles.positive_prompt, positive, "Positive Prompt"));
        lines.push("  text: [replaced by the prompt per generation]".to_string());
    }

    if let Some((id, negative)) = roles
        .negative_prompt
        .as_deref()
        .and_then(|id| graph.get(id).map(|node| (id, node)))
    {
        lines.push(String::new());
        lines.push(heading(id, negative, "Negative Prompt"));
        let text = negative.scalar("text").cloned().unwrap_or(Value::Null);
        lines.push(format!("  text: {text}"));
    }

    for (role_id, fallback_title) in [
        (roles.latent_image.as_deref(), "Image Size"),
        (roles.checkpoint.as_deref(), "Model"),
    ] {
        let Some((id, node)) = role_id.and_then(|id| graph.get(id).map(|node| (id, node))) else {
            continue;
        };
        lines.push(String::new());
        lines.push(heading(id, node, fallback_title));
        for (key, value) in scalar_inputs(node) {
            lines.push(format!("  {key}: {value}"));
        }
    }

    if !roles.load_images.is_empty() {
        lines.push(String::new());
        lines.push(format!(
            "Reference image slots: {}",
            roles
                .load_images
                .iter()
                .map(|id| format!("#{id}"))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    Ok(lines.join("\n"))
}

const ASPECT_RATIOS: &[(&str, u32, u32)] = &[
    ("1:1", 1, 1),
    ("3:4", 3, 4),
    ("4:3", 4, 3),
    ("16:9", 16, 9),
    ("9:16", 9, 16),
];

/// Reshapes `width`x`height` to `aspect_ratio` while keeping the pixel
/// count, snapping both sides to multiples of 8. Unknown ratios return the
/// input unchanged.
pub fn calculate_size(aspect_ratio: &str, width: u32, height: u32) -> (u32, u32) {
    let Some((_, ratio_w, ratio_h)) = ASPECT_RATIOS
        .iter()
        .find(|(label, _, _)| *label == aspect_ratio.trim())
    else {
        return (width, height);
    };
    let total_pixels = f64::from(width) * f64::from(height);
    let new_height = (total_pixels * f64::from(*ratio_h) / f64::from(*ratio_w)).sqrt();
    let new_width = new_height * f64::from(*ratio_w) / f64::from(*ratio_h);
    (snap_to_eight(new_width), snap_to_eight(new_height))
}

fn snap_to_eight(value: f64) -> u32 {
    ((value / 8.0).round() * 8.0) as u32
}

fn heading(id: &str, node: &Node, fallback_title: &str) -> String {
    format!(
        "Node #{id} ({}) - {}",
        node.kind,
        node.title().unwrap_or(fallback_title)
    )
}

fn scalar_inputs(node: &Node) -> impl Iterator<Item = (&str, &Value)> + '_ {
    node.inputs.iter().filter_map(|(key, value)| match value {
        InputValue::Scalar(value) => Some((key.as_str(), value)),
        InputValue::Reference(_) => None,
    })
}

fn scalar_string(node: &Node, name: &str) -> Option<String> {
    node.scalar(name).and_then(Value::as_str).map(str::to_string)
}

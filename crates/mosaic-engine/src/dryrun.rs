use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use indexmap::IndexMap;
use mosaic_contracts::graph::{infer_roles, Graph};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::client::{AssetBytes, EngineClient, JobStatus, OutputImage, SlotOutput, SubmitResponse};

const DEFAULT_SIDE: u32 = 512;
const MAX_SIDE: u32 = 2048;

#[derive(Debug, Clone)]
struct DryrunJob {
    prompt: String,
    seed: u64,
    width: u32,
    height: u32,
    output_node: String,
}

#[derive(Debug, Default)]
struct DryrunState {
    jobs: BTreeMap<String, DryrunJob>,
    uploads: Vec<String>,
    submitted: u64,
}

/// In-process engine that renders a solid-colour PNG derived from the
/// prompt and seed. Every job completes on its first status query.
#[derive(Debug, Default)]
pub struct DryrunEngine {
    state: Mutex<DryrunState>,
}

impl DryrunEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.lock().uploads.clone()
    }

    pub fn submitted(&self) -> u64 {
        self.lock().submitted
    }

    fn lock(&self) -> MutexGuard<'_, DryrunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EngineClient for DryrunEngine {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn submit(&self, graph: &Graph) -> Result<SubmitResponse> {
        let mut state = self.lock();
        state.submitted += 1;
        let roles = match infer_roles(graph) {
            Ok(roles) => roles,
            Err(err) => {
                return Ok(SubmitResponse {
                    job_id: String::new(),
                    validation_errors: BTreeMap::from([("graph".to_string(), err.to_string())]),
                })
            }
        };

        let prompt = graph
            .get(&roles.positive_prompt)
            .and_then(|node| node.scalar("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let seed = graph
            .get(&roles.sampler)
            .and_then(|node| node.scalar("seed"))
            .and_then(Value::as_u64)
            .unwrap_or_default();
        let side = |input: &str| {
            roles
                .latent_image
                .as_deref()
                .and_then(|id| graph.get(id))
                .and_then(|node| node.scalar(input))
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(DEFAULT_SIDE)
                .clamp(8, MAX_SIDE)
        };
        let job = DryrunJob {
            width: side("width"),
            height: side("height"),
            output_node: roles
                .save_image
                .clone()
                .unwrap_or_else(|| roles.sampler.clone()),
            prompt,
            seed,
        };
        let job_id = format!("dryrun-{}", short_id(&job.prompt, state.submitted));
        state.jobs.insert(job_id.clone(), job);
        Ok(SubmitResponse {
            job_id,
            validation_errors: BTreeMap::new(),
        })
    }

    fn status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let state = self.lock();
        let Some(job) = state.jobs.get(job_id) else {
            return Ok(None);
        };
        let mut outputs = IndexMap::new();
        outputs.insert(
            job.output_node.clone(),
            SlotOutput {
                images: vec![OutputImage {
                    filename: format!("{job_id}.png"),
                    subfolder: String::new(),
                    location: "output".to_string(),
                }],
            },
        );
        Ok(Some(JobStatus {
            status_label: "success".to_string(),
            completed: true,
            outputs,
        }))
    }

    fn fetch_output(&self, image: &OutputImage) -> Result<AssetBytes> {
        let job_id = image.filename.trim_end_matches(".png");
        let job = self
            .lock()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| anyhow!("dryrun output {} not found", image.filename))?;
        let bytes = render_dryrun_png(job.width, job.height, &job.prompt, job.seed)?;
        Ok(AssetBytes {
            bytes,
            mime_type: Some("image/png".to_string()),
        })
    }

    fn upload_asset(&self, _bytes: Vec<u8>, filename: &str) -> Result<String> {
        self.lock().uploads.push(filename.to_string());
        Ok(filename.to_string())
    }
}

fn render_dryrun_png(width: u32, height: u32, prompt: &str, seed: u64) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt, seed);
    let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut cursor, ImageFormat::Png)
        .context("failed to encode dryrun image")?;
    Ok(cursor.into_inner())
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

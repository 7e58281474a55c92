pub mod client;
pub mod clock;
pub mod dryrun;
pub mod gate;
pub mod hosted;
pub mod job;
pub mod references;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use mosaic_contracts::config::Config;
use mosaic_contracts::events::{emit_optional, EventWriter, PERMIT_ACQUIRED, PERMIT_RELEASED};
use mosaic_contracts::graph::{instantiate, GenerationRequest, Graph};
use reqwest::blocking::Response as HttpResponse;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

pub use client::{EngineClient, HttpEngineClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dryrun::DryrunEngine;
pub use gate::{ConcurrencyGate, Permit};
pub use hosted::{HostedApiClient, HostedClient, HostedImage, HostedRequest};
pub use job::{GeneratedImage, JobError, JobOrchestrator, PollPolicy, ProgressFn};
pub use references::{apply_reference_images, HttpImageSource, ImageSource};

/// Graph-template generation against one engine.
///
/// One instance is shared by every caller targeting that engine; its gate
/// bounds how many submissions are in flight at once.
pub struct GraphGenerator {
    engine: Arc<dyn EngineClient>,
    images: Arc<dyn ImageSource>,
    clock: Arc<dyn Clock>,
    gate: Arc<ConcurrencyGate>,
    policy: PollPolicy,
    events: Option<EventWriter>,
}

impl GraphGenerator {
    pub fn new(engine: Arc<dyn EngineClient>, gate: Arc<ConcurrencyGate>) -> Self {
        Self {
            engine,
            images: Arc::new(HttpImageSource::new()),
            clock: Arc::new(SystemClock::new()),
            gate,
            policy: PollPolicy::engine(),
            events: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let gate = ConcurrencyGate::new(config.engine_url.clone(), config.max_concurrent_jobs);
        Self::new(
            Arc::new(HttpEngineClient::new(&config.engine_url)),
            Arc::new(gate),
        )
    }

    pub fn with_image_source(mut self, images: Arc<dyn ImageSource>) -> Self {
        self.images = images;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: Option<EventWriter>) -> Self {
        self.events = events;
        self
    }

    pub fn engine(&self) -> &dyn EngineClient {
        self.engine.as_ref()
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// Instantiates `template` for `request`, transfers reference images and
    /// runs the job to completion while holding one gate permit.
    pub fn generate(
        &self,
        template: &Graph,
        request: &GenerationRequest,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<GeneratedImage, JobError> {
        let instantiated = instantiate(template, request)?;
        let mut graph = instantiated.graph;
        let warning = apply_reference_images(
            &mut graph,
            &request.reference_image_urls,
            &instantiated.roles.load_images,
            self.images.as_ref(),
            self.engine.as_ref(),
            self.events.as_ref(),
        )?;

        let outcome = {
            let _permit = self.acquire();
            JobOrchestrator::new(self.clock.as_ref())
                .with_policy(self.policy)
                .with_events(self.events.as_ref())
                .run(self.engine.as_ref(), &graph, warning, progress)
        };
        self.released();
        outcome.map(|image| GeneratedImage {
            seed: Some(instantiated.seed),
            ..image
        })
    }

    fn acquire(&self) -> Permit<'_> {
        let permit = self.gate.acquire();
        emit_optional(
            self.events.as_ref(),
            PERMIT_ACQUIRED,
            map_object(json!({
                "gate": permit.gate_name(),
                "in_flight": self.gate.in_flight(),
                "waiting": self.gate.waiting(),
            })),
        );
        permit
    }

    fn released(&self) {
        emit_optional(
            self.events.as_ref(),
            PERMIT_RELEASED,
            map_object(json!({
                "gate": self.gate.name(),
                "in_flight": self.gate.in_flight(),
            })),
        );
    }
}

/// Prompt-only generation through the hosted service, gated like a graph
/// engine.
pub struct HostedGenerator {
    client: Arc<dyn HostedClient>,
    clock: Arc<dyn Clock>,
    gate: Arc<ConcurrencyGate>,
    events: Option<EventWriter>,
}

impl HostedGenerator {
    pub fn new(client: Arc<dyn HostedClient>, gate: Arc<ConcurrencyGate>) -> Self {
        Self {
            client,
            clock: Arc::new(SystemClock::new()),
            gate,
            events: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let gate = ConcurrencyGate::new(config.hosted_base_url.clone(), config.max_concurrent_jobs);
        Self::new(
            Arc::new(HostedApiClient::new(
                &config.hosted_base_url,
                config.hosted_api_token.clone(),
            )),
            Arc::new(gate),
        )
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Option<EventWriter>) -> Self {
        self.events = events;
        self
    }

    pub fn generate(
        &self,
        request: &HostedRequest,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<HostedImage, JobError> {
        let _permit = self.gate.acquire();
        JobOrchestrator::new(self.clock.as_ref())
            .with_policy(PollPolicy::hosted())
            .with_events(self.events.as_ref())
            .run_hosted(self.client.as_ref(), request, progress)
    }
}

pub(crate) fn response_text_or_error(label: &str, response: HttpResponse) -> Result<String> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{label} response body read failed"))?;
    if !status.is_success() {
        bail!("{label} request failed ({code}): {}", truncate_text(&body, 512));
    }
    Ok(body)
}

pub(crate) fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let body = response_text_or_error(label, response)?;
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{label} returned invalid JSON payload"))?;
    Ok(parsed)
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing: &String| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn graph_fingerprint(graph: &Graph) -> String {
    let bytes = serde_json::to_vec(graph).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

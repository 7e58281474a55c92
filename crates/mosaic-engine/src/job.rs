use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use mosaic_contracts::events::{
    emit_optional, EventWriter, JOB_COMPLETED, JOB_FAILED, JOB_PROGRESS, JOB_SUBMITTED,
    JOB_TIMED_OUT,
};
use mosaic_contracts::graph::{Graph, GraphIncomplete};
use serde_json::json;
use thiserror::Error;

use crate::client::EngineClient;
use crate::clock::Clock;
use crate::hosted::{HostedClient, HostedImage, HostedRequest, HostedState};
use crate::{error_chain_text, graph_fingerprint, map_object};

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const HOSTED_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(300);
pub const PROGRESS_EVERY: Duration = Duration::from_secs(15);
pub const DEFAULT_MIME_TYPE: &str = "image/png";

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    GraphIncomplete(#[from] GraphIncomplete),
    #[error("failed to download reference image {url}: {reason}")]
    ReferenceFetchFailed { url: String, reason: String },
    #[error("failed to upload reference image {filename} to the engine: {reason}")]
    ReferenceUploadFailed { filename: String, reason: String },
    #[error("engine rejected the graph: {}", format_validation_errors(.errors))]
    SubmissionRejected {
        job_id: String,
        errors: BTreeMap<String, String>,
    },
    #[error("submission failed: {reason}")]
    SubmissionError { reason: String },
    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },
    #[error("job {job_id} completed without an output image")]
    JobEmptyResult { job_id: String },
    #[error("job {job_id} timed out after {}s", .after.as_secs())]
    TimedOut { job_id: String, after: Duration },
}

impl JobError {
    /// Stable snake_case label, used in events and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GraphIncomplete(_) => "graph_incomplete",
            Self::ReferenceFetchFailed { .. } => "reference_fetch_failed",
            Self::ReferenceUploadFailed { .. } => "reference_upload_failed",
            Self::SubmissionRejected { .. } => "submission_rejected",
            Self::SubmissionError { .. } => "submission_error",
            Self::JobFailed { .. } => "job_failed",
            Self::JobEmptyResult { .. } => "job_empty_result",
            Self::TimedOut { .. } => "timed_out",
        }
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::SubmissionRejected { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobEmptyResult { job_id }
            | Self::TimedOut { job_id, .. } => Some(job_id.as_str()).filter(|id| !id.is_empty()),
            _ => None,
        }
    }
}

fn format_validation_errors(errors: &BTreeMap<String, String>) -> String {
    if errors.is_empty() {
        return "no details".to_string();
    }
    errors
        .iter()
        .map(|(node, reason)| format!("node {node}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Polling,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    fn can_advance_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Submitted, Self::Polling)
                | (Self::Submitted, Self::Failed)
                | (Self::Polling, Self::Completed)
                | (Self::Polling, Self::Failed)
                | (Self::Polling, Self::TimedOut)
        )
    }
}

/// One submission's lifecycle. States only move forward.
#[derive(Debug, Clone)]
pub struct Job {
    id: String,
    state: JobState,
    submitted_at: DateTime<Utc>,
    last_progress_notified_at: Option<Duration>,
}

impl Job {
    pub fn submitted(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: JobState::Submitted,
            submitted_at: Utc::now(),
            last_progress_notified_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Poll-loop elapsed time at the last progress notification.
    pub fn last_progress_notified_at(&self) -> Option<Duration> {
        self.last_progress_notified_at
    }

    /// Returns false, leaving the state untouched, for backward or
    /// post-terminal transitions.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    pub progress_every: Duration,
}

impl PollPolicy {
    pub fn engine() -> Self {
        Self {
            interval: POLL_INTERVAL,
            timeout: POLL_TIMEOUT,
            progress_every: PROGRESS_EVERY,
        }
    }

    pub fn hosted() -> Self {
        Self {
            interval: HOSTED_POLL_INTERVAL,
            ..Self::engine()
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::engine()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedImage {
    pub job_id: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub warning: Option<String>,
    /// Seed written into the graph, when the caller knows it.
    pub seed: Option<u32>,
}

impl GeneratedImage {
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn extension(&self) -> &'static str {
        let lowered = self.mime_type.to_ascii_lowercase();
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return "jpg";
        }
        if lowered.contains("webp") {
            return "webp";
        }
        if lowered.contains("gif") {
            return "gif";
        }
        "png"
    }
}

/// Progress callbacks receive the elapsed poll time in milliseconds.
pub type ProgressFn<'a> = &'a mut dyn FnMut(u64);

/// Drives one job from submission to a terminal state.
pub struct JobOrchestrator<'a> {
    clock: &'a dyn Clock,
    policy: PollPolicy,
    events: Option<&'a EventWriter>,
}

impl<'a> JobOrchestrator<'a> {
    pub fn new(clock: &'a dyn Clock) -> Self {
        Self {
            clock,
            policy: PollPolicy::engine(),
            events: None,
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: Option<&'a EventWriter>) -> Self {
        self.events = events;
        self
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Submits `graph`, polls until the engine reports an outcome and
    /// downloads the first output image.
    ///
    /// Status-query failures while polling are treated as transient and
    /// retried on the next tick; only the timeout ends a silent job.
    pub fn run(
        &self,
        engine: &dyn EngineClient,
        graph: &Graph,
        warning: Option<String>,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<GeneratedImage, JobError> {
        let started = self.clock.now();
        let response = match engine.submit(graph) {
            Ok(response) => response,
            Err(err) => {
                return Err(self.failed(JobError::SubmissionError {
                    reason: error_chain_text(&err, 512),
                }))
            }
        };
        let mut job = Job::submitted(response.job_id.clone());
        emit_optional(
            self.events,
            JOB_SUBMITTED,
            map_object(json!({
                "job_id": job.id(),
                "engine": engine.name(),
                "node_count": graph.len(),
                "graph_sha256": graph_fingerprint(graph),
            })),
        );
        if !response.validation_errors.is_empty() {
            job.advance(JobState::Failed);
            return Err(self.failed(JobError::SubmissionRejected {
                job_id: response.job_id,
                errors: response.validation_errors,
            }));
        }

        let asset = self.poll(&mut job, progress, |job| {
            let Ok(status) = engine.status(job.id()) else {
                return Ok(None);
            };
            let Some(status) = status else {
                return Ok(None);
            };
            if status.is_error() {
                return Err(JobError::JobFailed {
                    job_id: job.id().to_string(),
                    reason: format!("engine reported status '{}'", status.status_label),
                });
            }
            if !status.completed {
                return Ok(None);
            }
            let Some(image) = status.first_image() else {
                return Err(JobError::JobEmptyResult {
                    job_id: job.id().to_string(),
                });
            };
            engine
                .fetch_output(image)
                .map(Some)
                .map_err(|err| JobError::JobFailed {
                    job_id: job.id().to_string(),
                    reason: format!("result download failed: {}", error_chain_text(&err, 512)),
                })
        });
        let asset = asset.map_err(|err| self.failed(err))?;

        let generated = GeneratedImage {
            job_id: job.id().to_string(),
            mime_type: asset
                .mime_type
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            bytes: asset.bytes,
            warning,
            seed: None,
        };
        emit_optional(
            self.events,
            JOB_COMPLETED,
            map_object(json!({
                "job_id": generated.job_id,
                "elapsed_ms": millis(self.clock.now().saturating_sub(started)),
                "mime_type": generated.mime_type,
                "bytes": generated.bytes.len(),
                "warning": generated.warning,
            })),
        );
        Ok(generated)
    }

    /// Hosted variant: the service returns an image URL rather than
    /// engine-side outputs, so there is no reference pipeline or download.
    pub fn run_hosted(
        &self,
        client: &dyn HostedClient,
        request: &HostedRequest,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<HostedImage, JobError> {
        let started = self.clock.now();
        let job_id = client
            .submit(request)
            .map_err(|err| {
                self.failed(JobError::SubmissionError {
                    reason: error_chain_text(&err, 512),
                })
            })?;
        let mut job = Job::submitted(job_id);
        emit_optional(
            self.events,
            JOB_SUBMITTED,
            map_object(json!({
                "job_id": job.id(),
                "engine": client.name(),
                "model": request.model_id,
            })),
        );

        let image = self
            .poll(&mut job, progress, |job| {
                let Ok(status) = client.poll_status(job.id()) else {
                    return Ok(None);
                };
                match status.state {
                    HostedState::Pending | HostedState::Processing => Ok(None),
                    HostedState::Failed => Err(JobError::JobFailed {
                        job_id: job.id().to_string(),
                        reason: status
                            .error
                            .filter(|text| !text.trim().is_empty())
                            .unwrap_or_else(|| "generation failed".to_string()),
                    }),
                    HostedState::Completed => match status.image_url {
                        Some(url) if !url.trim().is_empty() => Ok(Some(HostedImage {
                            job_id: job.id().to_string(),
                            image_url: url,
                        })),
                        _ => Err(JobError::JobEmptyResult {
                            job_id: job.id().to_string(),
                        }),
                    },
                }
            })
            .map_err(|err| self.failed(err))?;

        emit_optional(
            self.events,
            JOB_COMPLETED,
            map_object(json!({
                "job_id": image.job_id,
                "elapsed_ms": millis(self.clock.now().saturating_sub(started)),
                "image_url": image.image_url,
            })),
        );
        Ok(image)
    }

    fn poll<T>(
        &self,
        job: &mut Job,
        mut progress: Option<ProgressFn<'_>>,
        mut step: impl FnMut(&Job) -> Result<Option<T>, JobError>,
    ) -> Result<T, JobError> {
        job.advance(JobState::Polling);
        let started = self.clock.now();
        let mut last_notified = Duration::ZERO;

        while self.clock.now().saturating_sub(started) < self.policy.timeout {
            self.clock.sleep(self.policy.interval);
            let elapsed = self.clock.now().saturating_sub(started);
            if elapsed.saturating_sub(last_notified) >= self.policy.progress_every {
                last_notified = elapsed;
                job.last_progress_notified_at = Some(elapsed);
                if let Some(callback) = progress.as_deref_mut() {
                    callback(millis(elapsed));
                }
                emit_optional(
                    self.events,
                    JOB_PROGRESS,
                    map_object(json!({
                        "job_id": job.id(),
                        "elapsed_ms": millis(elapsed),
                    })),
                );
            }

            match step(job) {
                Ok(Some(value)) => {
                    job.advance(JobState::Completed);
                    return Ok(value);
                }
                Ok(None) => {}
                Err(err) => {
                    job.advance(JobState::Failed);
                    return Err(err);
                }
            }
        }

        job.advance(JobState::TimedOut);
        Err(JobError::TimedOut {
            job_id: job.id().to_string(),
            after: self.policy.timeout,
        })
    }

    fn failed(&self, err: JobError) -> JobError {
        let event_type = match err {
            JobError::TimedOut { .. } => JOB_TIMED_OUT,
            _ => JOB_FAILED,
        };
        emit_optional(
            self.events,
            event_type,
            map_object(json!({
                "job_id": err.job_id(),
                "kind": err.kind(),
                "error": err.to_string(),
            })),
        );
        err
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::{anyhow, Result};
    use indexmap::IndexMap;
    use mosaic_contracts::graph::Node;
    use serde_json::Value;

    use super::*;
    use crate::client::{AssetBytes, JobStatus, OutputImage, SlotOutput, SubmitResponse};
    use crate::clock::ManualClock;
    use crate::hosted::HostedStatus;

    enum Script {
        Pending,
        Missing,
        Broken,
        Done(Vec<&'static str>),
        Errored,
    }

    struct ScriptedEngine {
        submit: Mutex<Option<Result<SubmitResponse>>>,
        statuses: Mutex<Vec<Script>>,
        status_calls: AtomicUsize,
        fetched: Mutex<Vec<String>>,
        mime_type: Option<String>,
    }

    impl ScriptedEngine {
        fn accepting(statuses: Vec<Script>) -> Self {
            Self {
                submit: Mutex::new(Some(Ok(SubmitResponse {
                    job_id: "job-1".to_string(),
                    validation_errors: BTreeMap::new(),
                }))),
                statuses: Mutex::new(statuses),
                status_calls: AtomicUsize::new(0),
                fetched: Mutex::new(Vec::new()),
                mime_type: None,
            }
        }

        fn calls(&self) -> usize {
            self.status_calls.load(Ordering::SeqCst)
        }
    }

    impl EngineClient for ScriptedEngine {
        fn name(&self) -> &str {
            "scripted"
        }

        fn submit(&self, _graph: &Graph) -> Result<SubmitResponse> {
            self.submit
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .take()
                .unwrap_or_else(|| Err(anyhow!("submitted twice")))
        }

        fn status(&self, _job_id: &str) -> Result<Option<JobStatus>> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock().map_err(|_| anyhow!("poisoned"))?;
            let next = if statuses.len() > 1 {
                statuses.remove(0)
            } else {
                match statuses.first() {
                    Some(Script::Pending) | None => Script::Pending,
                    Some(Script::Missing) => Script::Missing,
                    Some(Script::Broken) => Script::Broken,
                    Some(Script::Errored) => Script::Errored,
                    Some(Script::Done(files)) => Script::Done(files.clone()),
                }
            };
            match next {
                Script::Pending => Ok(Some(JobStatus {
                    status_label: "running".to_string(),
                    completed: false,
                    outputs: IndexMap::new(),
                })),
                Script::Missing => Ok(None),
                Script::Broken => Err(anyhow!("connection reset")),
                Script::Errored => Ok(Some(JobStatus {
                    status_label: "error".to_string(),
                    completed: true,
                    outputs: IndexMap::new(),
                })),
                Script::Done(files) => {
                    let mut outputs = IndexMap::new();
                    outputs.insert(
                        "9".to_string(),
                        SlotOutput {
                            images: files
                                .into_iter()
                                .map(|name| OutputImage {
                                    filename: name.to_string(),
                                    subfolder: String::new(),
                                    location: "output".to_string(),
                                })
                                .collect(),
                        },
                    );
                    Ok(Some(JobStatus {
                        status_label: "success".to_string(),
                        completed: true,
                        outputs,
                    }))
                }
            }
        }

        fn fetch_output(&self, image: &OutputImage) -> Result<AssetBytes> {
            self.fetched
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .push(image.filename.clone());
            Ok(AssetBytes {
                bytes: image.filename.as_bytes().to_vec(),
                mime_type: self.mime_type.clone(),
            })
        }

        fn upload_asset(&self, _bytes: Vec<u8>, filename: &str) -> Result<String> {
            Ok(filename.to_string())
        }
    }

    fn graph() -> Graph {
        Graph::new().with_node("3", Node::new("KSampler").with_scalar("seed", 1))
    }

    #[test]
    fn success_downloads_first_image_with_default_mime() -> anyhow::Result<()> {
        let clock = ManualClock::new();
        let engine = ScriptedEngine::accepting(vec![
            Script::Missing,
            Script::Pending,
            Script::Done(vec!["out_0001.png", "out_0002.png"]),
        ]);
        let image = JobOrchestrator::new(&clock).run(&engine, &graph(), None, None)?;
        assert_eq!(image.job_id, "job-1");
        assert_eq!(image.bytes, b"out_0001.png".to_vec());
        assert_eq!(image.mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(image.extension(), "png");
        assert_eq!(engine.calls(), 3);
        assert_eq!(clock.now(), Duration::from_secs(6));
        Ok(())
    }

    #[test]
    fn rejected_submission_never_polls() {
        let clock = ManualClock::new();
        let engine = ScriptedEngine::accepting(vec![Script::Pending]);
        *engine.submit.lock().unwrap_or_else(|p| p.into_inner()) = Some(Ok(SubmitResponse {
            job_id: "job-2".to_string(),
            validation_errors: BTreeMap::from([(
                "4".to_string(),
                "ckpt_name not in list".to_string(),
            )]),
        }));
        let err = JobOrchestrator::new(&clock).run(&engine, &graph(), None, None).err();
        match err {
            Some(JobError::SubmissionRejected { errors, .. }) => {
                assert_eq!(errors.get("4").map(String::as_str), Some("ckpt_name not in list"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(engine.calls(), 0);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn transport_failure_is_submission_error() {
        let clock = ManualClock::new();
        let engine = ScriptedEngine::accepting(vec![Script::Pending]);
        *engine.submit.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(Err(anyhow!("connection refused")));
        let err = JobOrchestrator::new(&clock).run(&engine, &graph(), None, None).err();
        assert_eq!(err.as_ref().map(JobError::kind), Some("submission_error"));
        assert!(err.map(|err| err.to_string().contains("connection refused")).unwrap_or(false));
        assert_eq!(engine.calls(), 0);
    }

    #[test]
    fn completed_without_images_is_empty_result() {
        let clock = ManualClock::new();
        let engine = ScriptedEngine::accepting(vec![Script::Done(Vec::new())]);
        let err = JobOrchestrator::new(&clock).run(&engine, &graph(), None, None).err();
        assert_eq!(err.map(|err| err.kind()), Some("job_empty_result"));
    }

    #[test]
    fn engine_error_status_is_job_failed() {
        let clock = ManualClock::new();
        let engine = ScriptedEngine::accepting(vec![Script::Pending, Script::Errored]);
        let err = JobOrchestrator::new(&clock).run(&engine, &graph(), None, None).err();
        assert_eq!(err.as_ref().map(JobError::kind), Some("job_failed"));
        assert_eq!(err.as_ref().and_then(JobError::job_id), Some("job-1"));
        assert_eq!(engine.calls(), 2);
    }

    #[test]
    fn transient_status_failures_are_retried() -> anyhow::Result<()> {
        let clock = ManualClock::new();
        let engine = ScriptedEngine::accepting(vec![
            Script::Broken,
            Script::Broken,
            Script::Done(vec!["late.png"]),
        ]);
        let image = JobOrchestrator::new(&clock).run(&engine, &graph(), None, None)?;
        assert_eq!(image.bytes, b"late.png".to_vec());
        assert_eq!(engine.calls(), 3);
        Ok(())
    }

    #[test]
    fn silent_job_times_out_with_bounded_progress() {
        let clock = ManualClock::new();
        let engine = ScriptedEngine::accepting(vec![Script::Pending]);
        let mut ticks = Vec::new();
        let mut on_progress = |elapsed_ms: u64| ticks.push(elapsed_ms);
        let err = JobOrchestrator::new(&clock)
            .run(&engine, &graph(), None, Some(&mut on_progress))
            .err();

        match err {
            Some(JobError::TimedOut { job_id, after }) => {
                assert_eq!(job_id, "job-1");
                assert_eq!(after, POLL_TIMEOUT);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!ticks.is_empty());
        assert!(ticks.len() <= 20, "{} progress calls", ticks.len());
        assert!(ticks.windows(2).all(|pair| pair[1] - pair[0] >= 15_000));
        assert_eq!(engine.calls(), 150);
        assert!(clock.now() >= POLL_TIMEOUT);
    }

    #[test]
    fn warning_is_carried_to_the_result() -> anyhow::Result<()> {
        let clock = ManualClock::new();
        let mut engine = ScriptedEngine::accepting(vec![Script::Done(vec!["a.jpg"])]);
        engine.mime_type = Some("image/jpeg".to_string());
        let image = JobOrchestrator::new(&clock).run(
            &engine,
            &graph(),
            Some("no image inputs".to_string()),
            None,
        )?;
        assert_eq!(image.warning.as_deref(), Some("no image inputs"));
        assert_eq!(image.mime_type, "image/jpeg");
        assert_eq!(image.extension(), "jpg");
        assert_eq!(image.to_base64(), "YS5qcGc=");
        Ok(())
    }

    #[test]
    fn lifecycle_events_are_written() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let events = EventWriter::new(&events_path, "test");
        let clock = ManualClock::new();
        let engine = ScriptedEngine::accepting(vec![Script::Pending]);
        let outcome = JobOrchestrator::new(&clock)
            .with_policy(PollPolicy {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(40),
                progress_every: Duration::from_secs(15),
            })
            .with_events(Some(&events))
            .run(&engine, &graph(), None, None);
        assert!(outcome.is_err());

        let raw = std::fs::read_to_string(events_path)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec!["job_submitted", "job_progress", "job_progress", "job_timed_out"]
        );
        Ok(())
    }

    #[test]
    fn job_states_only_move_forward() {
        let mut job = Job::submitted("job-9");
        assert!(!job.advance(JobState::Completed));
        assert!(job.advance(JobState::Polling));
        assert!(!job.advance(JobState::Submitted));
        assert!(job.advance(JobState::TimedOut));
        assert!(job.state().is_terminal());
        assert!(!job.advance(JobState::Completed));
        assert_eq!(job.state().label(), "timed_out");
        assert!(job.submitted_at() <= Utc::now());
    }

    struct ScriptedHosted {
        states: Mutex<Vec<HostedStatus>>,
    }

    impl HostedClient for ScriptedHosted {
        fn name(&self) -> &str {
            "hosted-test"
        }

        fn submit(&self, _request: &HostedRequest) -> Result<String> {
            Ok("gen-1".to_string())
        }

        fn poll_status(&self, _id: &str) -> Result<HostedStatus> {
            let mut states = self.states.lock().map_err(|_| anyhow!("poisoned"))?;
            if states.len() > 1 {
                Ok(states.remove(0))
            } else {
                states.first().cloned().ok_or_else(|| anyhow!("empty script"))
            }
        }
    }

    fn hosted_status(state: HostedState, url: Option<&str>, error: Option<&str>) -> HostedStatus {
        HostedStatus {
            state,
            image_url: url.map(str::to_string),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn hosted_job_returns_image_url() -> anyhow::Result<()> {
        let clock = ManualClock::new();
        let client = ScriptedHosted {
            states: Mutex::new(vec![
                hosted_status(HostedState::Pending, None, None),
                hosted_status(HostedState::Processing, None, None),
                hosted_status(HostedState::Completed, Some("https://cdn.example/out.png"), None),
            ]),
        };
        let image = JobOrchestrator::new(&clock)
            .with_policy(PollPolicy::hosted())
            .run_hosted(&client, &HostedRequest::new("a lighthouse"), None)?;
        assert_eq!(image.job_id, "gen-1");
        assert_eq!(image.image_url, "https://cdn.example/out.png");
        assert_eq!(clock.now(), Duration::from_secs(9));
        Ok(())
    }

    #[test]
    fn hosted_failures_map_to_job_errors() {
        let clock = ManualClock::new();
        let failed = ScriptedHosted {
            states: Mutex::new(vec![hosted_status(
                HostedState::Failed,
                None,
                Some("content policy"),
            )]),
        };
        let err = JobOrchestrator::new(&clock)
            .run_hosted(&failed, &HostedRequest::new("x"), None)
            .err();
        assert_eq!(err.as_ref().map(JobError::kind), Some("job_failed"));
        assert!(err.map(|err| err.to_string().contains("content policy")).unwrap_or(false));

        let empty = ScriptedHosted {
            states: Mutex::new(vec![hosted_status(HostedState::Completed, None, None)]),
        };
        let err = JobOrchestrator::new(&clock)
            .run_hosted(&empty, &HostedRequest::new("x"), None)
            .err();
        assert_eq!(err.map(|err| err.kind()), Some("job_empty_result"));
    }
}

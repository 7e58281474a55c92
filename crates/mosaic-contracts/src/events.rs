use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

pub const JOB_SUBMITTED: &str = "job_submitted";
pub const JOB_PROGRESS: &str = "job_progress";
pub const JOB_COMPLETED: &str = "job_completed";
pub const JOB_FAILED: &str = "job_failed";
pub const JOB_TIMED_OUT: &str = "job_timed_out";
pub const REFERENCE_UPLOADED: &str = "reference_uploaded";
pub const REFERENCE_SKIPPED: &str = "reference_skipped";
pub const PERMIT_ACQUIRED: &str = "permit_acquired";
pub const PERMIT_RELEASED: &str = "permit_released";

/// JSONL sink for job, reference and gate events.
///
/// Each line carries `type`, `source`, `seq` and `ts` ahead of the payload.
/// `seq` is shared by every clone of a writer and assigned under the file
/// lock, so line order and `seq` order agree even when several generation
/// threads report into one file. The payload is merged last, so a caller
/// may retag `source` for a single event.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<Sink>,
}

#[derive(Debug)]
struct Sink {
    path: PathBuf,
    source: String,
    next_seq: Mutex<u64>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Sink {
                path: path.into(),
                source: source.into(),
                next_seq: Mutex::new(0),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        if let Some(parent) = self.inner.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }

        let mut next_seq = self
            .inner
            .next_seq
            .lock()
            .map_err(|_| anyhow!("event writer lock poisoned"))?;
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert("source".to_string(), Value::String(self.inner.source.clone()));
        event.insert("seq".to_string(), Value::from(*next_seq));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .with_context(|| format!("failed appending to {}", self.inner.path.display()))?;
        *next_seq += 1;

        Ok(Value::Object(event))
    }
}

/// Emits through an optional writer. Write failures are dropped: an event
/// sink must never change the outcome of the job it observes.
pub fn emit_optional(events: Option<&EventWriter>, event_type: &str, payload: EventPayload) {
    if let Some(writer) = events {
        let _ = writer.emit(event_type, payload);
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// One lifecycle step of a generation job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    JobCreated {
        job_id: String,
        model: String,
        aspect_ratio: String,
        resolution: String,
        output_format: String,
    },
    JobPolled {
        job_id: String,
        poll: u32,
        state: String,
        progress: u8,
    },
    JobSucceeded {
        job_id: String,
        polls: u32,
        elapsed_s: f64,
    },
    JobFailed {
        job_id: Option<String>,
        kind: String,
        message: String,
    },
    ArtifactSaved {
        job_id: String,
        url: String,
        path: String,
        bytes: u64,
        sha256: String,
    },
}

/// Append-only writer for `events.jsonl`.
///
/// - every line carries `type`, `session_id` and `ts`
/// - event fields are merged last
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event: &GenerationEvent) -> anyhow::Result<Value> {
        let mut line_payload = Map::new();
        line_payload.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        line_payload.insert("ts".to_string(), Value::String(now_utc_iso()));
        if let Value::Object(fields) = serde_json::to_value(event)? {
            for (key, value) in fields {
                line_payload.insert(key, value);
            }
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&line_payload)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(line_payload))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

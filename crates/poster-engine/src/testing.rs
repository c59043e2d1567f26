//! In-memory stand-ins for the network and the clock.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use poster_contracts::options::GenerationRequest;
use serde_json::{json, Value};

use crate::cancel::{CancelToken, Sleeper};
use crate::client::{JobHandle, JobId, JobStatus, JobTransport};
use crate::error::JobError;
use crate::progress::{ProgressObserver, ProgressUpdate};

pub(crate) const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nnot-really-an-image";

pub(crate) fn waiting() -> Value {
    json!({"code": 200, "msg": "success", "data": {"taskId": "task-1", "state": "waiting"}})
}

pub(crate) fn generating() -> Value {
    json!({"code": 200, "msg": "success", "data": {"taskId": "task-1", "state": "generating"}})
}

pub(crate) fn success(urls: &[&str]) -> Value {
    let result_json = json!({"resultUrls": urls}).to_string();
    json!({
        "code": 200,
        "msg": "success",
        "data": {"taskId": "task-1", "state": "success", "resultJson": result_json}
    })
}

pub(crate) fn failed(code: &str, msg: &str) -> Value {
    json!({
        "code": 200,
        "msg": "success",
        "data": {"taskId": "task-1", "state": "fail", "failCode": code, "failMsg": msg}
    })
}

/// Replays queued `recordInfo` bodies in order; an exhausted script keeps
/// answering `waiting`.
pub(crate) struct ScriptedTransport {
    job_id: String,
    responses: Mutex<VecDeque<Value>>,
    queries: AtomicUsize,
    creates: AtomicUsize,
    downloads: Mutex<Vec<(String, PathBuf)>>,
    fail_downloads: bool,
}

impl ScriptedTransport {
    pub(crate) fn new(responses: Vec<Value>) -> Self {
        Self {
            job_id: "task-1".to_string(),
            responses: Mutex::new(responses.into()),
            queries: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            downloads: Mutex::new(Vec::new()),
            fail_downloads: false,
        }
    }

    pub(crate) fn with_job_id(mut self, job_id: &str) -> Self {
        self.job_id = job_id.to_string();
        self
    }

    pub(crate) fn failing_downloads(mut self) -> Self {
        self.fail_downloads = true;
        self
    }

    pub(crate) fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub(crate) fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub(crate) fn downloads(&self) -> Vec<(String, PathBuf)> {
        self.downloads
            .lock()
            .map(|downloads| downloads.clone())
            .unwrap_or_default()
    }
}

impl JobTransport for ScriptedTransport {
    fn model(&self) -> &str {
        "nano-banana-pro"
    }

    fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle, JobError> {
        if request.prompt.trim().is_empty() {
            return Err(JobError::InvalidRequest("prompt is empty".to_string()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let job_id = JobId::new(self.job_id.clone()).ok_or_else(|| JobError::Protocol {
            operation: "createTask",
            code: 200,
            message: "response carried no taskId".to_string(),
        })?;
        Ok(JobHandle {
            raw: json!({"code": 200, "data": {"taskId": job_id.as_str()}}),
            job_id,
        })
    }

    fn query_job(&self, _job_id: &JobId, _budget: Option<Duration>) -> Result<JobStatus, JobError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front())
            .unwrap_or_else(waiting);
        JobStatus::from_json("recordInfo", next)
    }

    fn download_artifact(&self, url: &str, destination: &Path) -> Result<u64, JobError> {
        if let Ok(mut downloads) = self.downloads.lock() {
            downloads.push((url.to_string(), destination.to_path_buf()));
        }
        if self.fail_downloads {
            return Err(JobError::Download {
                url: url.to_string(),
                detail: "HTTP 404: not found".to_string(),
            });
        }
        fs::write(destination, PNG_BYTES).map_err(|err| JobError::io(destination, err))?;
        Ok(PNG_BYTES.len() as u64)
    }
}

/// Counts sleeps without blocking. Optionally fires the cancel token on the
/// n-th sleep, the way Ctrl-C lands mid-wait.
#[derive(Clone, Default)]
pub(crate) struct CountingSleeper {
    sleeps: Arc<AtomicUsize>,
    cancel_on: Option<usize>,
}

impl CountingSleeper {
    pub(crate) fn cancelling_on(sleep_number: usize) -> Self {
        Self {
            sleeps: Arc::default(),
            cancel_on: Some(sleep_number),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Sleeper for CountingSleeper {
    fn sleep(&self, _duration: Duration, cancel: &CancelToken) -> bool {
        let number = self.sleeps.fetch_add(1, Ordering::SeqCst) + 1;
        if self.cancel_on == Some(number) {
            cancel.cancel();
        }
        !cancel.is_cancelled()
    }
}

#[derive(Debug, Default)]
pub(crate) struct RecordingObserver {
    pub(crate) created: Vec<String>,
    pub(crate) percents: Vec<u8>,
    pub(crate) states: Vec<String>,
    pub(crate) closed: usize,
}

impl ProgressObserver for RecordingObserver {
    fn on_created(&mut self, job_id: &str) {
        self.created.push(job_id.to_string());
    }

    fn on_poll(&mut self, update: &ProgressUpdate<'_>) {
        self.percents.push(update.percent);
        self.states.push(update.state.to_string());
    }

    fn close(&mut self) {
        self.closed += 1;
    }
}

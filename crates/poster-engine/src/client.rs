//! Remote job client: create, query and download against the Kie jobs API.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use poster_contracts::job::{CreateTaskPayload, CreatedTask, Envelope, JobRecord};
use poster_contracts::options::GenerationRequest;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;

use crate::config::ClientConfig;
use crate::download::write_atomically;
use crate::error::{truncate_text, JobError, MAX_BODY_CHARS};

const CREATE_OPERATION: &str = "createTask";
const QUERY_OPERATION: &str = "recordInfo";
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(180);

/// Service-assigned job identifier. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: JobId,
    pub raw: Value,
}

/// One decoded `recordInfo` response.
///
/// The application code is not checked here; the waiter decides what a
/// non-success code means.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub envelope: Envelope<JobRecord>,
    pub raw: Value,
}

impl JobStatus {
    pub fn from_json(operation: &'static str, raw: Value) -> Result<Self, JobError> {
        let envelope = serde_json::from_value(raw.clone()).map_err(|err| {
            JobError::MalformedEnvelope {
                operation,
                detail: err.to_string(),
            }
        })?;
        Ok(Self { envelope, raw })
    }

    pub fn record(&self) -> Option<&JobRecord> {
        self.envelope.data.as_ref()
    }
}

/// The protocol seam between the lifecycle logic and the network.
pub trait JobTransport: Send + Sync {
    fn model(&self) -> &str;

    fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle, JobError>;

    /// `budget` is the wait time left; implementations must not block longer.
    fn query_job(&self, job_id: &JobId, budget: Option<Duration>) -> Result<JobStatus, JobError>;

    /// Returns the number of bytes written to `destination`.
    fn download_artifact(&self, url: &str, destination: &Path) -> Result<u64, JobError>;
}

pub struct KieClient {
    config: ClientConfig,
    http: HttpClient,
}

impl KieClient {
    pub fn new(config: ClientConfig) -> Result<Self, JobError> {
        if config.api_key.trim().is_empty() {
            return Err(JobError::Config("API key is empty".to_string()));
        }
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| JobError::Config(format!("HTTP client setup failed: {err}")))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn query_timeout(&self, budget: Option<Duration>) -> Duration {
        match budget {
            Some(remaining) => remaining
                .min(self.config.request_timeout)
                .max(MIN_REQUEST_TIMEOUT),
            None => self.config.request_timeout,
        }
    }
}

impl fmt::Debug for KieClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KieClient")
            .field("config", &self.config)
            .finish()
    }
}

impl JobTransport for KieClient {
    fn model(&self) -> &str {
        &self.config.model
    }

    fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle, JobError> {
        if request.prompt.trim().is_empty() {
            return Err(JobError::InvalidRequest("prompt is empty".to_string()));
        }
        let endpoint = self.config.create_task_endpoint();
        let payload = CreateTaskPayload::from_request(&self.config.model, request);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .map_err(|err| JobError::transport(CREATE_OPERATION, err))?;
        let raw = response_json_or_error(CREATE_OPERATION, response)?;
        let job_id = parse_created_job(&raw)?;
        tracing::info!(job_id = %job_id, model = %self.config.model, "generation job created");
        Ok(JobHandle { job_id, raw })
    }

    fn query_job(&self, job_id: &JobId, budget: Option<Duration>) -> Result<JobStatus, JobError> {
        let endpoint = self.config.record_info_endpoint();
        let response = self
            .http
            .get(&endpoint)
            .query(&[("taskId", job_id.as_str())])
            .bearer_auth(&self.config.api_key)
            .timeout(self.query_timeout(budget))
            .send()
            .map_err(|err| JobError::transport(QUERY_OPERATION, err))?;
        let raw = response_json_or_error(QUERY_OPERATION, response)?;
        JobStatus::from_json(QUERY_OPERATION, raw)
    }

    fn download_artifact(&self, url: &str, destination: &Path) -> Result<u64, JobError> {
        let download_error = |detail: String| JobError::Download {
            url: url.to_string(),
            detail,
        };
        let response = self
            .http
            .get(url)
            .timeout(DOWNLOAD_TIMEOUT.max(self.config.request_timeout))
            .send()
            .map_err(|err| download_error(err.without_url().to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(download_error(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate_text(body.trim(), MAX_BODY_CHARS)
            )));
        }
        let expected_len = response.content_length();
        let written = write_atomically(response, destination, expected_len)
            .map_err(|err| download_error(format!("{err:#}")))?;
        tracing::debug!(url, bytes = written, path = %destination.display(), "artifact downloaded");
        Ok(written)
    }
}

/// Validates the `createTask` envelope and pulls out a non-empty job id.
pub fn parse_created_job(raw: &Value) -> Result<JobId, JobError> {
    let envelope: Envelope<CreatedTask> =
        serde_json::from_value(raw.clone()).map_err(|err| JobError::MalformedEnvelope {
            operation: CREATE_OPERATION,
            detail: err.to_string(),
        })?;
    if !envelope.is_success() {
        return Err(JobError::Protocol {
            operation: CREATE_OPERATION,
            code: envelope.code,
            message: envelope.message().to_string(),
        });
    }
    envelope
        .data
        .and_then(|data| data.task_id)
        .and_then(JobId::new)
        .ok_or_else(|| JobError::Protocol {
            operation: CREATE_OPERATION,
            code: envelope.code,
            message: "response carried no taskId".to_string(),
        })
}

fn response_json_or_error(
    operation: &'static str,
    response: HttpResponse,
) -> Result<Value, JobError> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| JobError::transport(operation, err))?;
    if !status.is_success() {
        return Err(JobError::http_status(operation, status.as_u16(), &body));
    }
    serde_json::from_str(&body).map_err(|err| JobError::MalformedEnvelope {
        operation,
        detail: format!(
            "{err}; body: {}",
            truncate_text(body.trim(), MAX_BODY_CHARS)
        ),
    })
}

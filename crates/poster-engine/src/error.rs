//! Failure taxonomy for the job lifecycle.
//!
//! Every variant is surfaced to the immediate caller; nothing here is retried
//! internally. Messages carry HTTP status, service codes and truncated bodies
//! but never the API key.

use std::path::PathBuf;
use std::time::Duration;

/// Longest response body fragment embedded in an error message.
pub const MAX_BODY_CHARS: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Missing or unusable client configuration (for example no API key).
    #[error("configuration error: {0}")]
    Config(String),

    /// Rejected locally before anything was sent.
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    /// Network failure, or a non-2xx HTTP status on create/query.
    #[error("{operation} transport failure{}: {detail}", status_suffix(.status))]
    Transport {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },

    /// HTTP 2xx but the outer `{code, msg, data}` envelope did not decode.
    #[error("{operation} returned a malformed envelope: {detail}")]
    MalformedEnvelope {
        operation: &'static str,
        detail: String,
    },

    /// Envelope decoded but carried a non-success application code.
    #[error("{operation} returned error code {code}: {message}")]
    Protocol {
        operation: &'static str,
        code: i64,
        message: String,
    },

    /// The service reported `fail` for the job.
    #[error("job {job_id} failed with code {fail_code}: {fail_msg}")]
    JobFailed {
        job_id: String,
        fail_code: String,
        fail_msg: String,
    },

    /// `resultJson` of a successful job is not decodable.
    #[error("job {job_id} returned a malformed result: {detail}")]
    MalformedResult { job_id: String, detail: String },

    /// `success` with no artifact URL.
    #[error("job {job_id} succeeded without any result URL")]
    EmptyResult { job_id: String },

    #[error("artifact download failed ({url}): {detail}")]
    Download { url: String, detail: String },

    #[error("job {job_id} timed out after {:.1}s", .elapsed.as_secs_f64())]
    Timeout { job_id: String, elapsed: Duration },

    #[error("wait for job {job_id} was interrupted")]
    Interrupted { job_id: String },

    #[error("filesystem error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl JobError {
    /// Stable snake_case label for events and task status records.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Config(_) => "config",
            JobError::InvalidRequest(_) => "invalid_request",
            JobError::Transport { .. } => "transport",
            JobError::MalformedEnvelope { .. } => "malformed_envelope",
            JobError::Protocol { .. } => "protocol",
            JobError::JobFailed { .. } => "job_failed",
            JobError::MalformedResult { .. } => "malformed_result",
            JobError::EmptyResult { .. } => "empty_result",
            JobError::Download { .. } => "download",
            JobError::Timeout { .. } => "timeout",
            JobError::Interrupted { .. } => "interrupted",
            JobError::Io { .. } => "io",
        }
    }

    /// Outcomes decided by this process alone; the remote job may still be running.
    pub fn is_client_side_terminal(&self) -> bool {
        matches!(self, JobError::Timeout { .. } | JobError::Interrupted { .. })
    }

    pub(crate) fn transport(operation: &'static str, err: reqwest::Error) -> Self {
        JobError::Transport {
            operation,
            status: err.status().map(|status| status.as_u16()),
            detail: err.without_url().to_string(),
        }
    }

    pub(crate) fn http_status(operation: &'static str, status: u16, body: &str) -> Self {
        JobError::Transport {
            operation,
            status: Some(status),
            detail: truncate_text(body.trim(), MAX_BODY_CHARS),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        JobError::Io {
            path: path.into(),
            source,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|code| format!(" (HTTP {code})"))
        .unwrap_or_default()
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

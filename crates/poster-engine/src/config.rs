use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::JobError;

pub const DEFAULT_API_BASE: &str = "https://api.kie.ai";
pub const DEFAULT_API_VERSION: &str = "v1";
pub const DEFAULT_MODEL: &str = "nano-banana-pro";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_OUTPUT_DIR: &str = "./outputs/";

pub const API_KEY_ENV: &str = "KIE_AI_API_KEY";
pub const API_BASE_ENV: &str = "KIE_AI_API_BASE";
pub const MODEL_ENV: &str = "KIE_AI_MODEL";

/// Per-instance settings of the remote job client.
#[derive(Clone)]
pub struct ClientConfig {
    pub api_key: String,
    pub api_base: String,
    pub api_version: String,
    pub model: String,
    /// Upper bound for any single HTTP round-trip.
    pub request_timeout: Duration,
    /// Carried for configuration compatibility only: create and query are
    /// single-attempt and surface their first failure.
    pub max_retries: u32,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn from_env() -> Result<Self, JobError> {
        let Some(api_key) = non_empty_env(API_KEY_ENV) else {
            return Err(JobError::Config(format!("{API_KEY_ENV} not set")));
        };
        let mut config = Self::new(api_key);
        if let Some(api_base) = non_empty_env(API_BASE_ENV) {
            config = config.with_api_base(&api_base);
        }
        if let Some(model) = non_empty_env(MODEL_ENV) {
            config.model = model;
        }
        Ok(config)
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        let trimmed = api_base.trim().trim_end_matches('/');
        if !trimmed.is_empty() {
            self.api_base = trimmed.to_string();
        }
        self
    }

    pub fn create_task_endpoint(&self) -> String {
        format!(
            "{}/api/{}/jobs/createTask",
            self.api_base, self.api_version
        )
    }

    pub fn record_info_endpoint(&self) -> String {
        format!(
            "{}/api/{}/jobs/recordInfo",
            self.api_base, self.api_version
        )
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("api_version", &self.api_version)
            .field("model", &self.model)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

/// Budgets for one completion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WaitOptions {
    /// Negative values clamp to zero; NaN, infinite or overflowing values are rejected.
    pub fn try_from_secs_f64(timeout_s: f64, poll_interval_s: f64) -> Result<Self, JobError> {
        Ok(Self {
            timeout: duration_from_secs_f64("timeout", timeout_s)?,
            poll_interval: duration_from_secs_f64("poll interval", poll_interval_s)?,
        })
    }
}

pub fn duration_from_secs_f64(name: &str, seconds: f64) -> Result<Duration, JobError> {
    if seconds.is_nan() {
        return Err(JobError::Config(format!("{name} is not a number")));
    }
    Duration::try_from_secs_f64(seconds.max(0.0)).map_err(|err| {
        JobError::Config(format!("{name} of {seconds} seconds is not usable: {err}"))
    })
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_DIR)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

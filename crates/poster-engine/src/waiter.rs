//! Poll loop driving one job to a terminal state.

use std::time::{Duration, Instant};

use poster_contracts::job::{JobRecord, JobState};
use serde_json::Value;

use crate::cancel::{CancelToken, Sleeper, ThreadSleeper};
use crate::client::{JobId, JobTransport};
use crate::config::WaitOptions;
use crate::error::JobError;
use crate::progress::{ProgressEstimate, ProgressObserver, ProgressUpdate};

const QUERY_OPERATION: &str = "recordInfo";

/// The `success` response of a finished job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: JobId,
    pub record: JobRecord,
    /// Full response body of the final poll.
    pub raw: Value,
    pub polls: u32,
    pub elapsed: Duration,
}

pub struct CompletionWaiter {
    options: WaitOptions,
    sleeper: Box<dyn Sleeper>,
}

impl CompletionWaiter {
    pub fn new(options: WaitOptions) -> Self {
        Self {
            options,
            sleeper: Box::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn options(&self) -> WaitOptions {
        self.options
    }

    /// Polls `job_id` until `success`, `fail`, the timeout, or a cancel.
    ///
    /// The timeout is checked before every query, so a zero timeout returns
    /// [`JobError::Timeout`] without querying. Sleeps never run past the
    /// deadline. `observer` is closed exactly once, whatever the outcome.
    pub fn wait(
        &self,
        transport: &dyn JobTransport,
        job_id: &JobId,
        observer: &mut dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> Result<JobResult, JobError> {
        let result = self.poll_until_terminal(transport, job_id, observer, cancel);
        observer.close();
        result
    }

    fn poll_until_terminal(
        &self,
        transport: &dyn JobTransport,
        job_id: &JobId,
        observer: &mut dyn ProgressObserver,
        cancel: &CancelToken,
    ) -> Result<JobResult, JobError> {
        let started = Instant::now();
        let timeout = self.options.timeout;
        let mut estimate = ProgressEstimate::default();
        let mut polls: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(interrupted(job_id));
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(JobError::Timeout {
                    job_id: job_id.to_string(),
                    elapsed,
                });
            }

            let status = transport.query_job(job_id, Some(timeout - elapsed))?;
            polls += 1;
            if !status.envelope.is_success() {
                return Err(JobError::Protocol {
                    operation: QUERY_OPERATION,
                    code: status.envelope.code,
                    message: status.envelope.message().to_string(),
                });
            }
            let record = status.envelope.data.clone().unwrap_or_default();

            let percent = estimate.observe(&record.state);
            tracing::debug!(
                job_id = %job_id,
                poll = polls,
                state = %record.state,
                percent,
                "job polled"
            );
            observer.on_poll(&ProgressUpdate {
                job_id: job_id.as_str(),
                poll: polls,
                state: &record.state,
                percent,
            });

            if record.state == JobState::Fail {
                return Err(JobError::JobFailed {
                    job_id: job_id.to_string(),
                    fail_code: record.fail_code_or_default().to_string(),
                    fail_msg: record.fail_msg_or_default().to_string(),
                });
            }
            if record.state == JobState::Success {
                return Ok(JobResult {
                    job_id: job_id.clone(),
                    record,
                    raw: status.raw,
                    polls,
                    elapsed: started.elapsed(),
                });
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if !self
                .sleeper
                .sleep(self.options.poll_interval.min(remaining), cancel)
            {
                return Err(interrupted(job_id));
            }
        }
    }
}

fn interrupted(job_id: &JobId) -> JobError {
    tracing::info!(job_id = %job_id, "wait interrupted; remote job keeps running");
    JobError::Interrupted {
        job_id: job_id.to_string(),
    }
}

//! Cosmetic progress estimate.
//!
//! The service reports no percentage, so the waiter synthesizes one and hands
//! it to a [`ProgressObserver`]. Nothing in the poll loop reads it back.

use poster_contracts::job::JobState;

pub const WAITING_FLOOR: u8 = 30;
pub const IN_PROGRESS_CEILING: u8 = 90;
pub const COMPLETE: u8 = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressEstimate {
    percent: u8,
}

impl ProgressEstimate {
    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Never decreases; only `success` reaches [`COMPLETE`].
    pub fn observe(&mut self, state: &JobState) -> u8 {
        let next = match state {
            JobState::Success => COMPLETE,
            JobState::Fail => self.percent,
            JobState::Waiting => self
                .percent
                .saturating_add(1)
                .min(IN_PROGRESS_CEILING)
                .max(WAITING_FLOOR),
            _ if self.percent < IN_PROGRESS_CEILING => self.percent + 1,
            _ => self.percent,
        };
        self.percent = next.max(self.percent);
        self.percent
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate<'a> {
    pub job_id: &'a str,
    pub poll: u32,
    pub state: &'a JobState,
    pub percent: u8,
}

pub trait ProgressObserver {
    /// The service accepted the job; called once, before any poll.
    fn on_created(&mut self, _job_id: &str) {}

    fn on_poll(&mut self, update: &ProgressUpdate<'_>);

    /// Called exactly once when the wait ends, whatever the outcome.
    fn close(&mut self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_poll(&mut self, _update: &ProgressUpdate<'_>) {}
}

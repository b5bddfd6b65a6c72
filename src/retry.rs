//! Retry bookkeeping for a single turn.

use thiserror::Error;

/// Returned when a retry is requested after the ceiling was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("retry limit of {limit} reached")]
pub struct RetryExhausted {
    pub limit: u32,
}

/// Counts regeneration attempts. Never decreases and never exceeds its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounter {
    count: u32,
    limit: u32,
}

impl RetryCounter {
    pub fn new(limit: u32) -> Self {
        Self { count: 0, limit }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn can_retry(&self) -> bool {
        self.count < self.limit
    }

    /// Records one more retry and returns the new count.
    pub fn try_increment(&mut self) -> Result<u32, RetryExhausted> {
        if !self.can_retry() {
            return Err(RetryExhausted { limit: self.limit });
        }
        self.count += 1;
        Ok(self.count)
    }
}

/// Feedback collected across attempts, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedbackAccumulator {
    entries: Vec<String>,
}

impl FeedbackAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends trimmed feedback. Blank text is ignored.
    pub fn push(&mut self, feedback: &str) {
        let feedback = feedback.trim();
        if !feedback.is_empty() {
            self.entries.push(feedback.to_string());
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

//! Auto-retry cooldown policy for durable PDF-resolution jobs.
//!
//! Independent of the in-memory scheduler: this policy survives restarts and
//! decides whether a publication may be queued for another attempt at all.

use chrono::{DateTime, Duration, Utc};
use pubwatch_core::PublicationPdfJob;

#[derive(Debug, Clone, Copy)]
pub struct PdfJobPolicy {
    /// Cooldown before the second attempt.
    pub first_retry_interval: Duration,
    /// Cooldown between later attempts.
    pub retry_interval: Duration,
    pub max_attempts: i64,
}

impl Default for PdfJobPolicy {
    fn default() -> Self {
        Self {
            first_retry_interval: Duration::hours(1),
            retry_interval: Duration::days(1),
            max_attempts: 3,
        }
    }
}

impl PdfJobPolicy {
    fn cooldown_for(&self, attempt_count: i64) -> Duration {
        if attempt_count <= 1 {
            self.first_retry_interval
        } else {
            self.retry_interval
        }
    }

    /// Whether the job may be (re-)enqueued now.
    ///
    /// In-flight jobs are never re-enqueued, not even by a manual retry.
    /// Manual retries bypass both the attempt ceiling and the cooldown.
    pub fn can_enqueue(
        &self,
        job: &PublicationPdfJob,
        force_retry: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if job.status.is_in_flight() {
            return false;
        }
        if force_retry {
            return true;
        }
        if job.attempt_count >= self.max_attempts {
            return false;
        }
        match job.last_attempt_at {
            None => true,
            Some(last) => now - last >= self.cooldown_for(job.attempt_count),
        }
    }
}

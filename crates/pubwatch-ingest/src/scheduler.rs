//! Periodic drain of the continuation queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use pubwatch_scholar::ScholarSource;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::{ContinuationResult, ScholarIngestionService};

pub const DROPPED_REASON_MAX_ATTEMPTS: &str = "max_attempts_exceeded";

/// Exponential backoff for continuation retries: `min(base * 2^N, max)` for
/// the item's new attempt count `N`.
pub fn continuation_delay(base: Duration, max: Duration, attempt_count: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt_count).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DrainStats {
    pub processed: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub dropped: usize,
}

/// Claim due continuation items and resume each one. Failures are isolated
/// per item: one bad continuation never stops the rest of the batch.
pub async fn drain_continuation_queue<S: ScholarSource + 'static>(
    service: &ScholarIngestionService<S>,
) -> DrainStats {
    let mut stats = DrainStats::default();
    let config = service.config().clone();
    let items = match service.store().due_queue_items(config.queue_batch_size).await {
        Ok(items) => items,
        Err(err) => {
            warn!(error = %err, "failed to claim due continuation items");
            return stats;
        }
    };

    for item in items {
        stats.processed += 1;
        let resume_result = service.resume_queue_item(&item).await;
        let failure = match resume_result {
            Ok(ContinuationResult::Completed { new_publication_count }) => {
                info!(
                    queue_item_id = item.id,
                    scholar_profile_id = item.scholar_profile_id,
                    new_publication_count,
                    "continuation drained"
                );
                if let Err(err) = service.store().delete_queue_item(item.id).await {
                    warn!(queue_item_id = item.id, error = %err, "failed to delete drained item");
                } else {
                    stats.completed += 1;
                }
                continue;
            }
            Ok(ContinuationResult::Failed { error }) => error,
            Err(err) => err.to_string(),
        };

        let attempt_count = item.attempt_count + 1;
        if attempt_count > config.continuation_max_attempts {
            if let Err(err) = service
                .store()
                .drop_queue_item(item.id, attempt_count, DROPPED_REASON_MAX_ATTEMPTS, Some(&failure))
                .await
            {
                warn!(queue_item_id = item.id, error = %err, "failed to drop exhausted item");
                continue;
            }
            warn!(
                queue_item_id = item.id,
                attempt_count, last_error = %failure, "continuation dropped after max attempts"
            );
            stats.dropped += 1;
            continue;
        }

        let delay = continuation_delay(
            config.continuation_base_delay,
            config.continuation_max_delay,
            attempt_count as u32,
        );
        let next_attempt_dt = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(6));
        if let Err(err) = service
            .store()
            .reschedule_queue_item(item.id, attempt_count, next_attempt_dt, &failure)
            .await
        {
            warn!(queue_item_id = item.id, error = %err, "failed to reschedule item");
            continue;
        }
        stats.rescheduled += 1;
    }

    stats
}

/// Build (but do not start) the timer that drains the queue every tick.
pub async fn build_queue_scheduler<S: ScholarSource + Send + Sync + 'static>(
    service: Arc<ScholarIngestionService<S>>,
) -> Result<Option<JobScheduler>> {
    if !service.config().scheduler_enabled {
        return Ok(None);
    }
    let tick = service.config().scheduler_tick;
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(tick, move |_uuid, _lock| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            let stats = drain_continuation_queue(service.as_ref()).await;
            if stats.processed > 0 {
                info!(
                    processed = stats.processed,
                    completed = stats.completed,
                    rescheduled = stats.rescheduled,
                    dropped = stats.dropped,
                    "continuation queue tick"
                );
            }
        })
    })
    .context("creating queue drain job")?;
    scheduler.add(job).await.context("adding queue drain job")?;
    Ok(Some(scheduler))
}

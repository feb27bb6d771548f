//! In-memory enrichment scheduler.
//!
//! Guarantees at most one concurrent resolution attempt per (tenant,
//! publication) and at most one attempt per cooldown window, bounding both
//! concurrency and outbound call volume without a durable queue. State is
//! process-local by design: it rate-limits within this process's lifetime,
//! it is not a correctness mechanism.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use pubwatch_core::PublicationListItem;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info};

type ClaimKey = (i64, i64);

#[derive(Default)]
struct SchedulerState {
    inflight: HashSet<ClaimKey>,
    recent_attempts: HashMap<ClaimKey, Instant>,
    tasks: JoinSet<()>,
}

pub struct EnrichmentScheduler {
    cooldown: Duration,
    state: Mutex<SchedulerState>,
}

/// Rows still missing a PDF, bounded to the per-call limit.
pub fn missing_pdf_items(rows: &[PublicationListItem], limit: usize) -> Vec<PublicationListItem> {
    rows.iter()
        .filter(|row| row.pdf_url.is_none())
        .take(limit)
        .cloned()
        .collect()
}

impl EnrichmentScheduler {
    pub fn new(cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            cooldown: cooldown.max(Duration::from_secs(1)),
            state: Mutex::new(SchedulerState::default()),
        })
    }

    fn prune_recent(state: &mut SchedulerState, now: Instant, cooldown: Duration) {
        let expiry = cooldown * 3;
        state
            .recent_attempts
            .retain(|_, attempted| now.duration_since(*attempted) < expiry);
    }

    async fn claim(
        &self,
        user_id: i64,
        items: &[PublicationListItem],
        max_items: usize,
    ) -> Vec<PublicationListItem> {
        let candidates = missing_pdf_items(items, max_items);
        if candidates.is_empty() {
            return Vec::new();
        }
        let now = Instant::now();
        let mut state = self.state.lock().await;
        // Reap finished tasks so the set does not grow without bound.
        while state.tasks.try_join_next().is_some() {}
        Self::prune_recent(&mut state, now, self.cooldown);

        let mut claimed = Vec::new();
        for item in candidates {
            let key = (user_id, item.publication_id);
            if state.inflight.contains(&key) {
                continue;
            }
            if state
                .recent_attempts
                .get(&key)
                .is_some_and(|attempted| now.duration_since(*attempted) < self.cooldown)
            {
                continue;
            }
            state.inflight.insert(key);
            state.recent_attempts.insert(key, now);
            claimed.push(item);
        }
        claimed
    }

    async fn release(&self, user_id: i64, publication_ids: &[i64]) {
        let mut state = self.state.lock().await;
        for publication_id in publication_ids {
            state.inflight.remove(&(user_id, *publication_id));
        }
    }

    /// Claim up to `max_items` rows and hand them to a fire-and-forget
    /// resolution task. Returns the number of claimed rows immediately; the
    /// caller is never blocked on resolution. Claims are released when the
    /// task finishes, success or not.
    pub async fn schedule<F, Fut>(
        self: &Arc<Self>,
        user_id: i64,
        items: &[PublicationListItem],
        max_items: usize,
        resolve: F,
    ) -> usize
    where
        F: FnOnce(Vec<PublicationListItem>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let claimed = self.claim(user_id, items, max_items).await;
        if claimed.is_empty() {
            return 0;
        }
        let claimed_count = claimed.len();
        let publication_ids: Vec<i64> = claimed.iter().map(|i| i.publication_id).collect();
        let scheduler = Arc::clone(self);

        let mut state = self.state.lock().await;
        state.tasks.spawn(async move {
            let result = std::panic::AssertUnwindSafe(resolve(claimed))
                .catch_unwind()
                .await;
            scheduler.release(user_id, &publication_ids).await;
            match result {
                Ok(()) => info!(
                    user_id,
                    publication_count = publication_ids.len(),
                    "enrichment task completed"
                ),
                Err(_) => error!(user_id, "enrichment task panicked"),
            }
        });

        info!(user_id, publication_count = claimed_count, "enrichment scheduled");
        claimed_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn item(publication_id: i64, pdf_url: Option<&str>) -> PublicationListItem {
        PublicationListItem {
            publication_id,
            scholar_profile_id: 1,
            scholar_label: "Scholar".to_string(),
            title: format!("Paper {publication_id}"),
            year: Some(2024),
            citation_count: 0,
            venue_text: None,
            pub_url: None,
            doi: None,
            pdf_url: pdf_url.map(str::to_string),
            is_read: false,
            first_seen_at: Utc::now(),
            is_new_in_latest_run: false,
        }
    }

    #[test]
    fn missing_pdf_items_filters_and_bounds() {
        let rows = vec![
            item(1, Some("https://example.org/a.pdf")),
            item(2, None),
            item(3, None),
            item(4, None),
        ];
        let selected = missing_pdf_items(&rows, 2);
        assert_eq!(
            selected.iter().map(|i| i.publication_id).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(missing_pdf_items(&rows, 0).is_empty());
    }

    #[tokio::test]
    async fn second_schedule_within_cooldown_claims_nothing() {
        let scheduler = EnrichmentScheduler::new(Duration::from_secs(60));
        let rows = vec![item(7, None)];
        let resolved = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&resolved);
        let first = scheduler
            .schedule(1, &rows, 10, move |claimed| async move {
                counter.fetch_add(claimed.len(), Ordering::SeqCst);
                // Keep the claim in flight long enough for the second call.
                tokio::time::sleep(Duration::from_millis(50)).await;
            })
            .await;
        assert_eq!(first, 1);

        let counter = Arc::clone(&resolved);
        let second = scheduler
            .schedule(1, &rows, 10, move |claimed| async move {
                counter.fetch_add(claimed.len(), Ordering::SeqCst);
            })
            .await;
        assert_eq!(second, 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(resolved.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn claims_are_released_after_completion_but_cooldown_still_holds() {
        let scheduler = EnrichmentScheduler::new(Duration::from_secs(60));
        let rows = vec![item(9, None)];

        let first = scheduler.schedule(1, &rows, 10, |_| async {}).await;
        assert_eq!(first, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The in-flight claim is gone, but the recent-attempt cooldown holds.
        let second = scheduler.schedule(1, &rows, 10, |_| async {}).await;
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn different_tenants_do_not_share_claims() {
        let scheduler = EnrichmentScheduler::new(Duration::from_secs(60));
        let rows = vec![item(5, None)];

        assert_eq!(scheduler.schedule(1, &rows, 10, |_| async {}).await, 1);
        assert_eq!(scheduler.schedule(2, &rows, 10, |_| async {}).await, 1);
    }

    #[tokio::test]
    async fn rows_with_pdfs_are_never_claimed() {
        let scheduler = EnrichmentScheduler::new(Duration::from_secs(60));
        let rows = vec![item(1, Some("https://example.org/a.pdf"))];
        assert_eq!(scheduler.schedule(1, &rows, 10, |_| async {}).await, 0);
    }
}

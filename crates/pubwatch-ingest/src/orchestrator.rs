//! Per-tenant ingestion runs: advisory-locked, paginated, aggregated into a
//! structured run report.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use pubwatch_core::fingerprint::publication_fingerprint;
use pubwatch_core::{
    IngestionQueueItem, ParseState, RunStatus, RunTriggerType, ScholarProfile,
};
use pubwatch_scholar::ScholarSource;
use pubwatch_storage::{PgStore, StoreError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::IngestionConfig;
use crate::pagination::{fetch_author_pages, FailureDebug, Termination};

pub const CONTINUATION_REASON_MAX_PAGES: &str = "max_pages_reached";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("a run is already in progress for this account")]
    RunAlreadyInProgress,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub status: RunStatus,
    pub scholar_count: i64,
    pub new_pub_count: i64,
}

/// Outcome of resuming one continuation queue item.
#[derive(Debug, Clone, PartialEq)]
pub enum ContinuationResult {
    Completed { new_publication_count: usize },
    Failed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthorKind {
    Clean,
    Truncated,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
struct AuthorReport {
    scholar_profile_id: i64,
    scholar_id: String,
    scholar_label: String,
    state: ParseState,
    state_reason: String,
    publication_count: usize,
    new_publication_count: usize,
    pages_fetched: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    truncation_reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<FailureDebug>,
}

fn derive_run_status(total: usize, failed: usize, truncated: usize) -> RunStatus {
    if total > 0 && failed == total {
        RunStatus::Failed
    } else if failed > 0 || truncated > 0 {
        RunStatus::PartialFailure
    } else {
        RunStatus::Success
    }
}

fn build_error_log(reports: &[AuthorReport]) -> serde_json::Value {
    let mut failed_state_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut failed_reason_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut failed_count = 0usize;
    let mut partial_count = 0usize;
    for report in reports {
        if report.debug.is_some() {
            failed_count += 1;
            *failed_state_counts.entry(report.state.as_str()).or_default() += 1;
            *failed_reason_counts
                .entry(report.state_reason.as_str())
                .or_default() += 1;
        } else if report.truncation_reason.is_some() {
            partial_count += 1;
        }
    }
    json!({
        "summary": {
            "failed_count": failed_count,
            "partial_count": partial_count,
            "failed_state_counts": failed_state_counts,
            "failed_reason_counts": failed_reason_counts,
        },
        "scholar_results": reports,
    })
}

pub struct ScholarIngestionService<S> {
    store: PgStore,
    source: Arc<S>,
    config: IngestionConfig,
}

impl<S: ScholarSource + 'static> ScholarIngestionService<S> {
    pub fn new(store: PgStore, source: Arc<S>, config: IngestionConfig) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    pub fn store(&self) -> &PgStore {
        &self.store
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Run ingestion for every enabled scholar of one tenant.
    ///
    /// The advisory lock is the sole cross-process exclusion: a second caller
    /// fails immediately, it is never queued behind the running one.
    pub async fn run_for_user(
        &self,
        user_id: i64,
        trigger: RunTriggerType,
    ) -> Result<RunSummary, IngestError> {
        let Some(lock) = self.store.try_acquire_run_lock(user_id).await? else {
            return Err(IngestError::RunAlreadyInProgress);
        };
        let result = self.run_locked(user_id, trigger).await;
        if let Err(err) = lock.release().await {
            warn!(user_id, error = %err, "failed to release run lock");
        }
        result
    }

    async fn run_locked(
        &self,
        user_id: i64,
        trigger: RunTriggerType,
    ) -> Result<RunSummary, IngestError> {
        let run_id = self.store.create_run(user_id, trigger).await?;
        let scholars = self.store.list_enabled_scholars_for_user(user_id).await?;
        info!(
            user_id,
            run_id,
            scholar_count = scholars.len(),
            trigger = trigger.as_str(),
            "ingestion run started"
        );

        let mut reports = Vec::with_capacity(scholars.len());
        let mut kinds = Vec::with_capacity(scholars.len());
        let mut new_pub_count = 0i64;

        for scholar in &scholars {
            let (report, kind) = self.ingest_author(user_id, run_id, scholar, 0).await?;
            new_pub_count += report.new_publication_count as i64;
            reports.push(report);
            kinds.push(kind);
        }

        let failed = kinds.iter().filter(|k| **k == AuthorKind::Failed).count();
        let truncated = kinds.iter().filter(|k| **k == AuthorKind::Truncated).count();
        let status = derive_run_status(scholars.len(), failed, truncated);

        self.store
            .finish_run(
                run_id,
                status,
                scholars.len() as i64,
                new_pub_count,
                &build_error_log(&reports),
            )
            .await?;
        info!(
            user_id,
            run_id,
            status = status.as_str(),
            new_pub_count,
            "ingestion run finished"
        );

        Ok(RunSummary {
            run_id,
            status,
            scholar_count: scholars.len() as i64,
            new_pub_count,
        })
    }

    /// Ingest a single author starting at `start_cstart`, persisting every
    /// previously unseen publication pairing under the given run.
    async fn ingest_author(
        &self,
        user_id: i64,
        run_id: i64,
        scholar: &ScholarProfile,
        start_cstart: u32,
    ) -> Result<(AuthorReport, AuthorKind), StoreError> {
        let known_fingerprint = if start_cstart == 0 {
            scholar.last_page_fingerprint.as_deref()
        } else {
            None
        };
        let outcome = fetch_author_pages(
            self.source.as_ref(),
            &scholar.scholar_id,
            start_cstart,
            known_fingerprint,
            &self.config,
        )
        .await;

        let kind = match &outcome.termination {
            Termination::Completed => AuthorKind::Clean,
            Termination::BudgetExhausted { .. } => AuthorKind::Truncated,
            Termination::Failed { .. } => AuthorKind::Failed,
        };

        let mut new_publication_count = 0usize;
        if kind != AuthorKind::Failed && !outcome.unchanged {
            for candidate in &outcome.candidates {
                let fingerprint = publication_fingerprint(candidate);
                let publication_id = self.store.ensure_publication(candidate, &fingerprint).await?;
                let is_new = self
                    .store
                    .ensure_scholar_publication(scholar.id, publication_id, run_id)
                    .await?;
                if is_new {
                    new_publication_count += 1;
                }
            }
        }
        if kind != AuthorKind::Failed {
            // The first completed pass establishes the baseline; its rows
            // still count as new relative to the empty set.
            if !scholar.baseline_completed {
                self.store.mark_baseline_completed(scholar.id).await?;
            }
            // Remember the initial page shape so an unchanged listing can be
            // skipped next time without a deep diff. Only a budget-complete
            // walk may refresh it: a truncated pass has not seen the tail.
            if start_cstart == 0 && !outcome.unchanged && kind == AuthorKind::Clean {
                if let Some(fingerprint) = outcome.first_page_fingerprint.as_deref() {
                    self.store
                        .set_scholar_page_fingerprint(scholar.id, Some(fingerprint))
                        .await?;
                }
            }
        }

        let (state, state_reason, truncation_reason, debug) = match &outcome.termination {
            Termination::Failed { state, reason, debug } => {
                (*state, reason.clone(), None, Some(debug.clone()))
            }
            Termination::BudgetExhausted { resume_cstart } => {
                self.store
                    .upsert_continuation(
                        user_id,
                        scholar.id,
                        *resume_cstart as i64,
                        CONTINUATION_REASON_MAX_PAGES,
                        Some(run_id),
                    )
                    .await?;
                let (state, reason) = page_state(&outcome.first_page);
                (state, reason, Some(CONTINUATION_REASON_MAX_PAGES.to_string()), None)
            }
            Termination::Completed => {
                let (state, reason) = page_state(&outcome.first_page);
                (state, reason, None, None)
            }
        };

        self.store
            .set_scholar_last_run(scholar.id, state, Utc::now())
            .await?;

        let report = AuthorReport {
            scholar_profile_id: scholar.id,
            scholar_id: scholar.scholar_id.clone(),
            scholar_label: scholar.label().to_string(),
            state,
            state_reason,
            publication_count: outcome.candidates.len(),
            new_publication_count,
            pages_fetched: outcome.pages_fetched,
            truncation_reason,
            warnings: outcome.warnings,
            debug,
        };
        Ok((report, kind))
    }

    /// Resume one paused continuation under its own (continuation-triggered)
    /// run. The caller owns the queue bookkeeping.
    pub async fn resume_queue_item(
        &self,
        item: &IngestionQueueItem,
    ) -> Result<ContinuationResult, IngestError> {
        let Some(lock) = self.store.try_acquire_run_lock(item.user_id).await? else {
            return Ok(ContinuationResult::Failed {
                error: "a run is already in progress for this account".to_string(),
            });
        };
        let result = self.resume_locked(item).await;
        if let Err(err) = lock.release().await {
            warn!(user_id = item.user_id, error = %err, "failed to release run lock");
        }
        result
    }

    async fn resume_locked(
        &self,
        item: &IngestionQueueItem,
    ) -> Result<ContinuationResult, IngestError> {
        let Some(scholar) = self
            .store
            .get_scholar_for_user(item.user_id, item.scholar_profile_id)
            .await?
        else {
            return Ok(ContinuationResult::Failed {
                error: "scholar profile no longer exists".to_string(),
            });
        };

        let run_id = self
            .store
            .create_run(item.user_id, RunTriggerType::Continuation)
            .await?;
        let (report, kind) = self
            .ingest_author(item.user_id, run_id, &scholar, item.resume_cstart as u32)
            .await?;

        let failed = usize::from(kind == AuthorKind::Failed);
        let truncated = usize::from(kind == AuthorKind::Truncated);
        let status = derive_run_status(1, failed, truncated);
        let new_publication_count = report.new_publication_count;
        self.store
            .finish_run(
                run_id,
                status,
                1,
                new_publication_count as i64,
                &build_error_log(std::slice::from_ref(&report)),
            )
            .await?;

        match kind {
            AuthorKind::Failed => Ok(ContinuationResult::Failed {
                error: report.state_reason,
            }),
            _ => Ok(ContinuationResult::Completed {
                new_publication_count,
            }),
        }
    }
}

fn page_state(first_page: &Option<pubwatch_core::ParsedProfilePage>) -> (ParseState, String) {
    match first_page {
        Some(page) => (page.state, page.state_reason.clone()),
        None => (ParseState::Ok, "publications_extracted".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(state: ParseState, reason: &str, truncated: bool, failed: bool) -> AuthorReport {
        AuthorReport {
            scholar_profile_id: 1,
            scholar_id: "abcDEF123456".to_string(),
            scholar_label: "Scholar".to_string(),
            state,
            state_reason: reason.to_string(),
            publication_count: 3,
            new_publication_count: 1,
            pages_fetched: 1,
            truncation_reason: truncated.then(|| CONTINUATION_REASON_MAX_PAGES.to_string()),
            warnings: Vec::new(),
            debug: failed.then(|| FailureDebug {
                status_code: None,
                fetch_error: Some("timed out".to_string()),
                requested_url: "https://scholar.google.com/citations?user=abcDEF123456".to_string(),
                body_excerpt: None,
            }),
        }
    }

    #[test]
    fn run_status_derivation_covers_all_shapes() {
        assert_eq!(derive_run_status(0, 0, 0), RunStatus::Success);
        assert_eq!(derive_run_status(3, 0, 0), RunStatus::Success);
        assert_eq!(derive_run_status(3, 3, 0), RunStatus::Failed);
        assert_eq!(derive_run_status(3, 1, 0), RunStatus::PartialFailure);
        assert_eq!(derive_run_status(3, 0, 1), RunStatus::PartialFailure);
        assert_eq!(derive_run_status(2, 1, 1), RunStatus::PartialFailure);
    }

    #[test]
    fn error_log_aggregates_failure_counts_by_state_and_reason() {
        let reports = vec![
            report(ParseState::Ok, "publications_extracted", false, false),
            report(ParseState::Ok, "publications_extracted", true, false),
            report(ParseState::NetworkError, "network_error_missing_status_code", false, true),
            report(ParseState::BlockedOrCaptcha, "blocked_keyword_detected", false, true),
            report(ParseState::NetworkError, "network_error_missing_status_code", false, true),
        ];
        let log = build_error_log(&reports);

        let summary = &log["summary"];
        assert_eq!(summary["failed_count"], 3);
        assert_eq!(summary["partial_count"], 1);
        assert_eq!(summary["failed_state_counts"]["network_error"], 2);
        assert_eq!(summary["failed_state_counts"]["blocked_or_captcha"], 1);
        assert_eq!(
            summary["failed_reason_counts"]["network_error_missing_status_code"],
            2
        );
        assert_eq!(log["scholar_results"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn failure_debug_context_survives_serialization() {
        let failed = report(ParseState::NetworkError, "network_error_missing_status_code", false, true);
        let log = build_error_log(std::slice::from_ref(&failed));
        let entry = &log["scholar_results"][0];
        assert_eq!(entry["debug"]["fetch_error"], "timed out");
        assert!(entry["debug"]["requested_url"]
            .as_str()
            .unwrap()
            .contains("abcDEF123456"));
    }
}

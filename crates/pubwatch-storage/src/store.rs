//! Postgres store: the persistence boundary every other crate writes through.
//!
//! Queries are runtime-bound (no offline macro data). All tenant-facing
//! lookups are scoped by `user_id` and answer cross-tenant access with
//! `None`, never with a distinct "forbidden" signal.

use chrono::{DateTime, Utc};
use pubwatch_core::{
    CrawlRunRecord, IngestionQueueItem, ParseState, PdfJobStatus, PublicationCandidate,
    PublicationListItem, PublicationPdfJob, QueueStatus, RunStatus, RunTriggerType, ScholarProfile,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;

/// Namespace half of the two-key advisory lock guarding per-tenant runs.
pub const RUN_LOCK_NAMESPACE: i32 = 20_567;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("that scholar is already tracked for this account")]
    DuplicateScholar,
    #[error("queue item transition rejected: {0}")]
    QueueTransition(&'static str),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationViewMode {
    All,
    Unread,
    Latest,
}

impl PublicationViewMode {
    pub fn parse(value: &str) -> Self {
        match value {
            "unread" => PublicationViewMode::Unread,
            "latest" | "new" => PublicationViewMode::Latest,
            _ => PublicationViewMode::All,
        }
    }
}

/// Cross-process run lock held on a dedicated database session.
///
/// Postgres advisory locks are session-scoped, so the guard owns a detached
/// connection for the lifetime of the run. The connection never goes back to
/// the pool: if `release` is skipped (panic, cancellation), dropping the
/// guard tears the session down and the server releases the lock with it.
pub struct RunLock {
    conn: sqlx::PgConnection,
    user_key: i32,
}

impl RunLock {
    pub async fn release(mut self) -> StoreResult<()> {
        sqlx::query("SELECT pg_advisory_unlock($1, $2)")
            .bind(RUN_LOCK_NAMESPACE)
            .bind(self.user_key)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Try to take the per-tenant run lock without waiting.
    pub async fn try_acquire_run_lock(&self, user_id: i64) -> StoreResult<Option<RunLock>> {
        let user_key = (user_id % i32::MAX as i64) as i32;
        let mut conn = self.pool.acquire().await?.detach();
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
            .bind(RUN_LOCK_NAMESPACE)
            .bind(user_key)
            .fetch_one(&mut conn)
            .await?;
        if !acquired {
            return Ok(None);
        }
        Ok(Some(RunLock { conn, user_key }))
    }

    // --- scholar profiles -------------------------------------------------

    pub async fn create_scholar(
        &self,
        user_id: i64,
        scholar_id: &str,
        display_name: Option<&str>,
    ) -> StoreResult<ScholarProfile> {
        let row = sqlx::query(
            "INSERT INTO scholar_profiles (user_id, scholar_id, display_name)
             VALUES ($1, $2, $3)
             RETURNING id, user_id, scholar_id, display_name, is_enabled,
                       baseline_completed, last_run_status, last_run_at,
                    last_page_fingerprint, created_at",
        )
        .bind(user_id)
        .bind(scholar_id)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if let sqlx::Error::Database(db) = &err {
                if db.is_unique_violation() {
                    return StoreError::DuplicateScholar;
                }
            }
            StoreError::Db(err)
        })?;
        Ok(scholar_from_row(&row))
    }

    pub async fn list_scholars_for_user(&self, user_id: i64) -> StoreResult<Vec<ScholarProfile>> {
        let rows = sqlx::query(
            "SELECT id, user_id, scholar_id, display_name, is_enabled,
                    baseline_completed, last_run_status, last_run_at,
                    last_page_fingerprint, created_at
             FROM scholar_profiles
             WHERE user_id = $1
             ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(scholar_from_row).collect())
    }

    pub async fn list_enabled_scholars_for_user(
        &self,
        user_id: i64,
    ) -> StoreResult<Vec<ScholarProfile>> {
        let rows = sqlx::query(
            "SELECT id, user_id, scholar_id, display_name, is_enabled,
                    baseline_completed, last_run_status, last_run_at,
                    last_page_fingerprint, created_at
             FROM scholar_profiles
             WHERE user_id = $1 AND is_enabled
             ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(scholar_from_row).collect())
    }

    pub async fn get_scholar_for_user(
        &self,
        user_id: i64,
        scholar_profile_id: i64,
    ) -> StoreResult<Option<ScholarProfile>> {
        let row = sqlx::query(
            "SELECT id, user_id, scholar_id, display_name, is_enabled,
                    baseline_completed, last_run_status, last_run_at,
                    last_page_fingerprint, created_at
             FROM scholar_profiles
             WHERE id = $1 AND user_id = $2",
        )
        .bind(scholar_profile_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(scholar_from_row))
    }

    pub async fn set_scholar_enabled_for_user(
        &self,
        user_id: i64,
        scholar_profile_id: i64,
        is_enabled: bool,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE scholar_profiles SET is_enabled = $3 WHERE id = $1 AND user_id = $2",
        )
        .bind(scholar_profile_id)
        .bind(user_id)
        .bind(is_enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_scholar_for_user(
        &self,
        user_id: i64,
        scholar_profile_id: i64,
    ) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM scholar_profiles WHERE id = $1 AND user_id = $2")
            .bind(scholar_profile_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_baseline_completed(&self, scholar_profile_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE scholar_profiles SET baseline_completed = TRUE WHERE id = $1")
            .bind(scholar_profile_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_scholar_page_fingerprint(
        &self,
        scholar_profile_id: i64,
        fingerprint: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE scholar_profiles SET last_page_fingerprint = $2 WHERE id = $1")
            .bind(scholar_profile_id)
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_scholar_last_run(
        &self,
        scholar_profile_id: i64,
        state: ParseState,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE scholar_profiles SET last_run_status = $2, last_run_at = $3 WHERE id = $1")
            .bind(scholar_profile_id)
            .bind(state.as_str())
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- publications -----------------------------------------------------

    /// Resolve a candidate to a durable publication id, inserting on first
    /// sighting. Cluster identity is checked before fingerprint identity so a
    /// provider-grouped work never forks on title-normalization collisions.
    pub async fn ensure_publication(
        &self,
        candidate: &PublicationCandidate,
        fingerprint: &str,
    ) -> StoreResult<i64> {
        if let Some(cluster_id) = candidate.cluster_id.as_deref() {
            let existing: Option<i64> =
                sqlx::query_scalar("SELECT id FROM publications WHERE cluster_id = $1")
                    .bind(cluster_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some(id) = existing {
                return Ok(id);
            }
        }

        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO publications
                 (fingerprint, cluster_id, title_raw, year, citation_count,
                  venue_text, pub_url, pdf_url)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (fingerprint) DO NOTHING
             RETURNING id",
        )
        .bind(fingerprint)
        .bind(candidate.cluster_id.as_deref())
        .bind(&candidate.title)
        .bind(candidate.year)
        .bind(candidate.citation_count.unwrap_or(0))
        .bind(candidate.venue_text.as_deref())
        .bind(candidate.title_url.as_deref())
        .bind(candidate.pdf_url.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(id);
        }
        let id: i64 = sqlx::query_scalar("SELECT id FROM publications WHERE fingerprint = $1")
            .bind(fingerprint)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    /// Monotonic improvement: resolved values only ever fill gaps, a `None`
    /// never clobbers a previously stored doi or pdf_url.
    pub async fn update_publication_oa(
        &self,
        publication_id: i64,
        doi: Option<&str>,
        pdf_url: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE publications
             SET doi = COALESCE($2, doi), pdf_url = COALESCE($3, pdf_url)
             WHERE id = $1",
        )
        .bind(publication_id)
        .bind(doi)
        .bind(pdf_url)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns `true` when the (scholar, publication) pairing is new.
    pub async fn ensure_scholar_publication(
        &self,
        scholar_profile_id: i64,
        publication_id: i64,
        first_seen_run_id: i64,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO scholar_publications
                 (scholar_profile_id, publication_id, first_seen_run_id)
             VALUES ($1, $2, $3)
             ON CONFLICT (scholar_profile_id, publication_id) DO NOTHING",
        )
        .bind(scholar_profile_id)
        .bind(publication_id)
        .bind(first_seen_run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // --- crawl runs -------------------------------------------------------

    pub async fn create_run(&self, user_id: i64, trigger: RunTriggerType) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO crawl_runs (user_id, trigger_type, status)
             VALUES ($1, $2, $3)
             RETURNING id",
        )
        .bind(user_id)
        .bind(trigger.as_str())
        .bind(RunStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        scholar_count: i64,
        new_pub_count: i64,
        error_log: &serde_json::Value,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE crawl_runs
             SET status = $2, end_dt = now(), scholar_count = $3,
                 new_pub_count = $4, error_log = $5
             WHERE id = $1",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(scholar_count)
        .bind(new_pub_count)
        .bind(error_log)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_completed_run_id(&self, user_id: i64) -> StoreResult<Option<i64>> {
        let id: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(id) FROM crawl_runs WHERE user_id = $1 AND status <> $2",
        )
        .bind(user_id)
        .bind(RunStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_runs_for_user(
        &self,
        user_id: i64,
        limit: i64,
        failed_only: bool,
    ) -> StoreResult<Vec<CrawlRunRecord>> {
        let mut sql = String::from(
            "SELECT id, user_id, trigger_type, status, start_dt, end_dt,
                    scholar_count, new_pub_count, error_log
             FROM crawl_runs
             WHERE user_id = $1",
        );
        if failed_only {
            sql.push_str(" AND status IN ('failed', 'partial_failure')");
        }
        sql.push_str(" ORDER BY id DESC LIMIT $2");
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(run_from_row).collect())
    }

    pub async fn get_run_for_user(
        &self,
        user_id: i64,
        run_id: i64,
    ) -> StoreResult<Option<CrawlRunRecord>> {
        let row = sqlx::query(
            "SELECT id, user_id, trigger_type, status, start_dt, end_dt,
                    scholar_count, new_pub_count, error_log
             FROM crawl_runs
             WHERE id = $1 AND user_id = $2",
        )
        .bind(run_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(run_from_row))
    }

    // --- publication listing ---------------------------------------------

    pub async fn list_publications_for_user(
        &self,
        user_id: i64,
        mode: PublicationViewMode,
        scholar_profile_id: Option<i64>,
        limit: i64,
    ) -> StoreResult<Vec<PublicationListItem>> {
        let latest_run_id = self.latest_completed_run_id(user_id).await?;
        if mode == PublicationViewMode::Latest && latest_run_id.is_none() {
            return Ok(Vec::new());
        }
        let unread_only = mode == PublicationViewMode::Unread;
        let latest_filter = (mode == PublicationViewMode::Latest)
            .then_some(latest_run_id)
            .flatten();

        let rows = sqlx::query(
            "SELECT p.id AS publication_id, sp.scholar_profile_id,
                    COALESCE(s.display_name, s.scholar_id) AS scholar_label,
                    p.title_raw, p.year, p.citation_count, p.venue_text,
                    p.pub_url, p.doi, p.pdf_url,
                    sp.is_read, sp.first_seen_run_id, sp.created_at
             FROM publications p
             JOIN scholar_publications sp ON sp.publication_id = p.id
             JOIN scholar_profiles s ON s.id = sp.scholar_profile_id
             WHERE s.user_id = $1
               AND ($3::BIGINT IS NULL OR s.id = $3)
               AND (NOT $4::BOOL OR NOT sp.is_read)
               AND ($5::BIGINT IS NULL OR sp.first_seen_run_id = $5)
             ORDER BY sp.created_at DESC, p.id DESC
             LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .bind(scholar_profile_id)
        .bind(unread_only)
        .bind(latest_filter)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| publication_item_from_row(row, latest_run_id))
            .collect())
    }

    pub async fn get_publication_item_for_user(
        &self,
        user_id: i64,
        scholar_profile_id: i64,
        publication_id: i64,
    ) -> StoreResult<Option<PublicationListItem>> {
        let latest_run_id = self.latest_completed_run_id(user_id).await?;
        let row = sqlx::query(
            "SELECT p.id AS publication_id, sp.scholar_profile_id,
                    COALESCE(s.display_name, s.scholar_id) AS scholar_label,
                    p.title_raw, p.year, p.citation_count, p.venue_text,
                    p.pub_url, p.doi, p.pdf_url,
                    sp.is_read, sp.first_seen_run_id, sp.created_at
             FROM publications p
             JOIN scholar_publications sp ON sp.publication_id = p.id
             JOIN scholar_profiles s ON s.id = sp.scholar_profile_id
             WHERE s.user_id = $1 AND s.id = $2 AND p.id = $3",
        )
        .bind(user_id)
        .bind(scholar_profile_id)
        .bind(publication_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row
            .as_ref()
            .map(|row| publication_item_from_row(row, latest_run_id)))
    }

    pub async fn count_publications_for_user(
        &self,
        user_id: i64,
        mode: PublicationViewMode,
    ) -> StoreResult<i64> {
        let latest_run_id = self.latest_completed_run_id(user_id).await?;
        if mode == PublicationViewMode::Latest && latest_run_id.is_none() {
            return Ok(0);
        }
        let unread_only = mode == PublicationViewMode::Unread;
        let latest_filter = (mode == PublicationViewMode::Latest)
            .then_some(latest_run_id)
            .flatten();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)
             FROM scholar_publications sp
             JOIN scholar_profiles s ON s.id = sp.scholar_profile_id
             WHERE s.user_id = $1
               AND (NOT $2::BOOL OR NOT sp.is_read)
               AND ($3::BIGINT IS NULL OR sp.first_seen_run_id = $3)",
        )
        .bind(user_id)
        .bind(unread_only)
        .bind(latest_filter)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn mark_all_unread_as_read_for_user(&self, user_id: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE scholar_publications sp
             SET is_read = TRUE
             FROM scholar_profiles s
             WHERE s.id = sp.scholar_profile_id AND s.user_id = $1 AND NOT sp.is_read",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Selections are (scholar_profile_id, publication_id) pairs; non-positive
    /// ids are discarded before touching the database.
    pub async fn mark_selected_as_read_for_user(
        &self,
        user_id: i64,
        selections: &[(i64, i64)],
    ) -> StoreResult<u64> {
        let pairs: Vec<(i64, i64)> = {
            let mut seen = std::collections::HashSet::new();
            selections
                .iter()
                .copied()
                .filter(|(sp, p)| *sp > 0 && *p > 0 && seen.insert((*sp, *p)))
                .collect()
        };
        if pairs.is_empty() {
            return Ok(0);
        }
        let scholar_ids: Vec<i64> = pairs.iter().map(|(sp, _)| *sp).collect();
        let publication_ids: Vec<i64> = pairs.iter().map(|(_, p)| *p).collect();
        let result = sqlx::query(
            "UPDATE scholar_publications sp
             SET is_read = TRUE
             FROM scholar_profiles s,
                  UNNEST($2::BIGINT[], $3::BIGINT[]) AS sel(scholar_profile_id, publication_id)
             WHERE s.id = sp.scholar_profile_id
               AND s.user_id = $1
               AND sp.scholar_profile_id = sel.scholar_profile_id
               AND sp.publication_id = sel.publication_id
               AND NOT sp.is_read",
        )
        .bind(user_id)
        .bind(&scholar_ids)
        .bind(&publication_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // --- continuation queue -----------------------------------------------

    /// Enqueue (or refresh) the single continuation slot for a scholar.
    pub async fn upsert_continuation(
        &self,
        user_id: i64,
        scholar_profile_id: i64,
        resume_cstart: i64,
        reason: &str,
        last_run_id: Option<i64>,
    ) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO ingestion_queue_items
                 (user_id, scholar_profile_id, resume_cstart, reason, status,
                  attempt_count, next_attempt_dt, last_run_id, updated_at)
             VALUES ($1, $2, $3, $4, 'queued', 0, now(), $5, now())
             ON CONFLICT (scholar_profile_id) DO UPDATE
             SET resume_cstart = EXCLUDED.resume_cstart,
                 reason = EXCLUDED.reason,
                 status = 'queued',
                 attempt_count = 0,
                 next_attempt_dt = now(),
                 last_run_id = EXCLUDED.last_run_id,
                 dropped_reason = NULL,
                 dropped_at = NULL,
                 updated_at = now()
             RETURNING id",
        )
        .bind(user_id)
        .bind(scholar_profile_id)
        .bind(resume_cstart)
        .bind(reason)
        .bind(last_run_id)
        .fetch_one(&self.pool)
        .await?;
        debug!(queue_item_id = id, scholar_profile_id, resume_cstart, "continuation enqueued");
        Ok(id)
    }

    /// Queued items whose next attempt is due, oldest first.
    pub async fn due_queue_items(&self, limit: i64) -> StoreResult<Vec<IngestionQueueItem>> {
        let rows = sqlx::query(&queue_select_sql(
            "WHERE q.status = 'queued' AND q.next_attempt_dt <= now()
             ORDER BY q.next_attempt_dt ASC
             LIMIT $1",
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(queue_item_from_row).collect())
    }

    pub async fn delete_queue_item(&self, queue_item_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM ingestion_queue_items WHERE id = $1")
            .bind(queue_item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn reschedule_queue_item(
        &self,
        queue_item_id: i64,
        attempt_count: i64,
        next_attempt_dt: DateTime<Utc>,
        last_error: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE ingestion_queue_items
             SET attempt_count = $2, next_attempt_dt = $3, last_error = $4, updated_at = now()
             WHERE id = $1",
        )
        .bind(queue_item_id)
        .bind(attempt_count)
        .bind(next_attempt_dt)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn drop_queue_item(
        &self,
        queue_item_id: i64,
        attempt_count: i64,
        dropped_reason: &str,
        last_error: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE ingestion_queue_items
             SET status = 'dropped', attempt_count = $2, dropped_reason = $3,
                 dropped_at = now(), last_error = COALESCE($4, last_error),
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(queue_item_id)
        .bind(attempt_count)
        .bind(dropped_reason)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_queue_items_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> StoreResult<Vec<IngestionQueueItem>> {
        let rows = sqlx::query(&queue_select_sql(
            "WHERE q.user_id = $1 ORDER BY q.updated_at DESC LIMIT $2",
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(queue_item_from_row).collect())
    }

    pub async fn get_queue_item_for_user(
        &self,
        user_id: i64,
        queue_item_id: i64,
    ) -> StoreResult<Option<IngestionQueueItem>> {
        let row = sqlx::query(&queue_select_sql("WHERE q.id = $2 AND q.user_id = $1"))
            .bind(user_id)
            .bind(queue_item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(queue_item_from_row))
    }

    /// Operator retry: legal from both `queued` and `dropped`; resets the
    /// attempt counter and clears the dropped bookkeeping.
    pub async fn retry_queue_item_for_user(
        &self,
        user_id: i64,
        queue_item_id: i64,
    ) -> StoreResult<Option<IngestionQueueItem>> {
        let Some(_item) = self.get_queue_item_for_user(user_id, queue_item_id).await? else {
            return Ok(None);
        };
        sqlx::query(
            "UPDATE ingestion_queue_items
             SET status = 'queued', reason = 'manual_retry', attempt_count = 0,
                 next_attempt_dt = now(), dropped_reason = NULL, dropped_at = NULL,
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(queue_item_id)
        .execute(&self.pool)
        .await?;
        self.get_queue_item_for_user(user_id, queue_item_id).await
    }

    /// Operator drop: legal only from `queued`.
    pub async fn drop_queue_item_for_user(
        &self,
        user_id: i64,
        queue_item_id: i64,
    ) -> StoreResult<Option<IngestionQueueItem>> {
        let Some(item) = self.get_queue_item_for_user(user_id, queue_item_id).await? else {
            return Ok(None);
        };
        if item.status == QueueStatus::Dropped {
            return Err(StoreError::QueueTransition("item is already dropped"));
        }
        sqlx::query(
            "UPDATE ingestion_queue_items
             SET status = 'dropped', dropped_reason = 'manual_drop', dropped_at = now(),
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(queue_item_id)
        .execute(&self.pool)
        .await?;
        self.get_queue_item_for_user(user_id, queue_item_id).await
    }

    /// Operator clear: deletes the row regardless of status.
    pub async fn clear_queue_item_for_user(
        &self,
        user_id: i64,
        queue_item_id: i64,
    ) -> StoreResult<Option<()>> {
        let result = sqlx::query("DELETE FROM ingestion_queue_items WHERE id = $1 AND user_id = $2")
            .bind(queue_item_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok((result.rows_affected() > 0).then_some(()))
    }

    // --- publication pdf jobs ---------------------------------------------

    pub async fn get_pdf_job(&self, publication_id: i64) -> StoreResult<Option<PublicationPdfJob>> {
        let row = sqlx::query(
            "SELECT publication_id, status, attempt_count, last_attempt_at
             FROM publication_pdf_jobs
             WHERE publication_id = $1",
        )
        .bind(publication_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(pdf_job_from_row))
    }

    pub async fn mark_pdf_job_queued(&self, publication_id: i64) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO publication_pdf_jobs (publication_id, status)
             VALUES ($1, 'queued')
             ON CONFLICT (publication_id) DO UPDATE SET status = 'queued'",
        )
        .bind(publication_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_pdf_job_running(&self, publication_id: i64) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO publication_pdf_jobs (publication_id, status)
             VALUES ($1, 'running')
             ON CONFLICT (publication_id) DO UPDATE SET status = 'running'",
        )
        .bind(publication_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_pdf_job(&self, publication_id: i64, succeeded: bool) -> StoreResult<()> {
        let status = if succeeded {
            PdfJobStatus::Succeeded
        } else {
            PdfJobStatus::Failed
        };
        sqlx::query(
            "UPDATE publication_pdf_jobs
             SET status = $2, attempt_count = attempt_count + 1, last_attempt_at = now()
             WHERE publication_id = $1",
        )
        .bind(publication_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// --- row mapping ---------------------------------------------------------

fn scholar_from_row(row: &PgRow) -> ScholarProfile {
    let last_run_status: Option<String> = row.get("last_run_status");
    ScholarProfile {
        id: row.get("id"),
        user_id: row.get("user_id"),
        scholar_id: row.get("scholar_id"),
        display_name: row.get("display_name"),
        is_enabled: row.get("is_enabled"),
        baseline_completed: row.get("baseline_completed"),
        last_run_status: last_run_status.as_deref().and_then(ParseState::parse),
        last_run_at: row.get("last_run_at"),
        last_page_fingerprint: row.get("last_page_fingerprint"),
        created_at: row.get("created_at"),
    }
}

fn run_from_row(row: &PgRow) -> CrawlRunRecord {
    let trigger: String = row.get("trigger_type");
    let status: String = row.get("status");
    CrawlRunRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        trigger_type: match trigger.as_str() {
            "scheduled" => RunTriggerType::Scheduled,
            "continuation" => RunTriggerType::Continuation,
            _ => RunTriggerType::Manual,
        },
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        start_dt: row.get("start_dt"),
        end_dt: row.get("end_dt"),
        scholar_count: row.get("scholar_count"),
        new_pub_count: row.get("new_pub_count"),
        error_log: row.get("error_log"),
    }
}

fn publication_item_from_row(row: &PgRow, latest_run_id: Option<i64>) -> PublicationListItem {
    let first_seen_run_id: Option<i64> = row.get("first_seen_run_id");
    PublicationListItem {
        publication_id: row.get("publication_id"),
        scholar_profile_id: row.get("scholar_profile_id"),
        scholar_label: row.get("scholar_label"),
        title: row.get("title_raw"),
        year: row.get("year"),
        citation_count: row.get("citation_count"),
        venue_text: row.get("venue_text"),
        pub_url: row.get("pub_url"),
        doi: row.get("doi"),
        pdf_url: row.get("pdf_url"),
        is_read: row.get("is_read"),
        first_seen_at: row.get("created_at"),
        is_new_in_latest_run: matches!(
            (latest_run_id, first_seen_run_id),
            (Some(latest), Some(seen)) if latest == seen
        ),
    }
}

fn queue_select_sql(suffix: &str) -> String {
    format!(
        "SELECT q.id, q.user_id, q.scholar_profile_id,
                COALESCE(s.display_name, s.scholar_id) AS scholar_label,
                q.resume_cstart, q.reason, q.status, q.attempt_count,
                q.next_attempt_dt, q.last_error, q.last_run_id,
                q.dropped_reason, q.dropped_at, q.updated_at
         FROM ingestion_queue_items q
         JOIN scholar_profiles s ON s.id = q.scholar_profile_id
         {suffix}"
    )
}

fn queue_item_from_row(row: &PgRow) -> IngestionQueueItem {
    let status: String = row.get("status");
    IngestionQueueItem {
        id: row.get("id"),
        user_id: row.get("user_id"),
        scholar_profile_id: row.get("scholar_profile_id"),
        scholar_label: row.get("scholar_label"),
        resume_cstart: row.get("resume_cstart"),
        reason: row.get("reason"),
        status: QueueStatus::parse(&status).unwrap_or(QueueStatus::Queued),
        attempt_count: row.get("attempt_count"),
        next_attempt_dt: row.get("next_attempt_dt"),
        last_error: row.get("last_error"),
        last_run_id: row.get("last_run_id"),
        dropped_reason: row.get("dropped_reason"),
        dropped_at: row.get("dropped_at"),
        updated_at: row.get("updated_at"),
    }
}

fn pdf_job_from_row(row: &PgRow) -> PublicationPdfJob {
    let status: String = row.get("status");
    PublicationPdfJob {
        publication_id: row.get("publication_id"),
        status: PdfJobStatus::parse(&status).unwrap_or(PdfJobStatus::Failed),
        attempt_count: row.get("attempt_count"),
        last_attempt_at: row.get("last_attempt_at"),
    }
}

//! Application operations tying the waterfall, the durable job policy and
//! the in-memory scheduler to the persistence boundary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use pubwatch_core::PublicationListItem;
use pubwatch_scholar::ScholarSource;
use pubwatch_storage::PgStore;
use tracing::{info, warn};

use crate::crossref::CrossrefClient;
use crate::discovery::PdfProbe;
use crate::jobs::PdfJobPolicy;
use crate::pipeline::{
    PdfResolutionPipeline, ProbeFallbackValidator, ScholarDetailSource, UnpaywallOaResolver,
};
use crate::scheduler::EnrichmentScheduler;
use crate::unpaywall::UnpaywallClient;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub unpaywall_enabled: bool,
    pub unpaywall_email: String,
    pub unpaywall_timeout: Duration,
    pub crossref_enabled: bool,
    pub crossref_max_rows: u32,
    pub crossref_max_lookups_per_batch: usize,
    pub max_items_per_batch: usize,
    pub retry_cooldown: Duration,
    pub job_policy: PdfJobPolicy,
}

impl EnrichmentConfig {
    pub fn from_env() -> Self {
        Self {
            unpaywall_enabled: env_parse("PUBWATCH_UNPAYWALL_ENABLED", true),
            unpaywall_email: env_var("PUBWATCH_UNPAYWALL_EMAIL").unwrap_or_default(),
            unpaywall_timeout: Duration::from_secs(env_parse("PUBWATCH_UNPAYWALL_TIMEOUT_SECS", 10)),
            crossref_enabled: env_parse("PUBWATCH_CROSSREF_ENABLED", true),
            crossref_max_rows: env_parse("PUBWATCH_CROSSREF_MAX_ROWS", 10),
            crossref_max_lookups_per_batch: env_parse("PUBWATCH_CROSSREF_MAX_LOOKUPS", 5),
            max_items_per_batch: env_parse("PUBWATCH_ENRICH_MAX_ITEMS", 10),
            retry_cooldown: Duration::from_secs(env_parse("PUBWATCH_ENRICH_COOLDOWN_SECS", 900)),
            job_policy: PdfJobPolicy::default(),
        }
    }
}

type ProductionPipeline =
    PdfResolutionPipeline<ScholarDetailSource, Option<UnpaywallOaResolver>, ProbeFallbackValidator>;

#[derive(Clone)]
pub struct EnrichmentService {
    store: PgStore,
    scholar_source: Arc<dyn ScholarSource>,
    scheduler: Arc<EnrichmentScheduler>,
    config: EnrichmentConfig,
}

impl EnrichmentService {
    pub fn new(
        store: PgStore,
        scholar_source: Arc<dyn ScholarSource>,
        config: EnrichmentConfig,
    ) -> Self {
        Self {
            store,
            scholar_source,
            scheduler: EnrichmentScheduler::new(config.retry_cooldown),
            config,
        }
    }

    fn effective_email(&self, request_email: Option<&str>) -> Option<String> {
        request_email
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .or_else(|| {
                let configured = self.config.unpaywall_email.trim();
                (!configured.is_empty()).then(|| configured.to_string())
            })
    }

    /// One pipeline per batch: the Crossref budget is a per-batch bound.
    fn build_pipeline(&self, request_email: Option<&str>) -> Result<ProductionPipeline> {
        let probe = PdfProbe::new(self.config.unpaywall_timeout)?;
        let oa_resolver = match self.effective_email(request_email) {
            Some(email) if self.config.unpaywall_enabled => {
                let unpaywall = UnpaywallClient::new(&email, self.config.unpaywall_timeout)?;
                let crossref = if self.config.crossref_enabled {
                    Some(CrossrefClient::new(&email, self.config.unpaywall_timeout)?)
                } else {
                    None
                };
                Some(UnpaywallOaResolver::new(
                    unpaywall,
                    crossref,
                    self.config.crossref_max_rows,
                    self.config.crossref_max_lookups_per_batch,
                    PdfProbe::new(self.config.unpaywall_timeout)?,
                ))
            }
            _ => None,
        };
        Ok(PdfResolutionPipeline::new(
            ScholarDetailSource::new(Arc::clone(&self.scholar_source)),
            oa_resolver,
            ProbeFallbackValidator::new(probe),
        ))
    }

    /// Run the waterfall for each row and persist improvements. `force_retry`
    /// bypasses the durable cooldown but never an in-flight job.
    pub async fn resolve_and_persist(
        &self,
        rows: &[PublicationListItem],
        request_email: Option<&str>,
        force_retry: bool,
    ) -> Result<usize> {
        let targets: Vec<&PublicationListItem> = rows
            .iter()
            .filter(|row| row.pdf_url.is_none())
            .take(self.config.max_items_per_batch)
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let pipeline = self.build_pipeline(request_email)?;
        let now = Utc::now();
        let mut resolved_count = 0usize;

        for row in targets {
            if let Some(job) = self.store.get_pdf_job(row.publication_id).await? {
                if !self.config.job_policy.can_enqueue(&job, force_retry, now) {
                    continue;
                }
            }
            self.store.mark_pdf_job_running(row.publication_id).await?;

            let result = pipeline.resolve_for_row(row).await;
            let succeeded = match result.outcome {
                Some(outcome) => {
                    let found_pdf = outcome.pdf_url.is_some();
                    if outcome.doi.is_some() || found_pdf {
                        self.store
                            .update_publication_oa(
                                row.publication_id,
                                outcome.doi.as_deref(),
                                outcome.pdf_url.as_deref(),
                            )
                            .await?;
                    }
                    if let Some(reason) = &outcome.failure_reason {
                        info!(
                            publication_id = row.publication_id,
                            reason = %reason,
                            "pdf resolution found nothing"
                        );
                    }
                    found_pdf
                }
                None => false,
            };
            self.store
                .finish_pdf_job(row.publication_id, succeeded)
                .await?;
            if succeeded {
                resolved_count += 1;
            }
        }

        info!(
            publication_count = rows.len(),
            resolved_pdf_count = resolved_count,
            "oa resolution completed"
        );
        Ok(resolved_count)
    }

    /// Synchronous operator-facing retry for one publication.
    pub async fn retry_pdf_for_user(
        &self,
        user_id: i64,
        scholar_profile_id: i64,
        publication_id: i64,
        request_email: Option<&str>,
    ) -> Result<Option<PublicationListItem>> {
        let Some(item) = self
            .store
            .get_publication_item_for_user(user_id, scholar_profile_id, publication_id)
            .await?
        else {
            return Ok(None);
        };
        self.resolve_and_persist(std::slice::from_ref(&item), request_email, true)
            .await?;
        let refreshed = self
            .store
            .get_publication_item_for_user(user_id, scholar_profile_id, publication_id)
            .await?;
        Ok(refreshed)
    }

    /// Claim rows missing a PDF and resolve them in the background. Returns
    /// the claimed count; the request path never waits for resolution.
    pub async fn schedule_missing_pdf_enrichment_for_user(
        &self,
        user_id: i64,
        rows: &[PublicationListItem],
        max_items: usize,
        request_email: Option<&str>,
    ) -> usize {
        let service = self.clone();
        let email = request_email.map(str::to_string);
        self.scheduler
            .schedule(user_id, rows, max_items, move |claimed| async move {
                if let Err(err) = service
                    .resolve_and_persist(&claimed, email.as_deref(), false)
                    .await
                {
                    warn!(user_id, error = %err, "background enrichment failed");
                }
            })
            .await
    }
}

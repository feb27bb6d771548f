//! The per-publication PDF resolution waterfall.
//!
//! Order encodes trust: an explicitly labeled in-ecosystem link outranks
//! third-party OA metadata, which outranks an unverified heuristic link.
//! Every stage seam is a trait so the decision logic can be exercised
//! without touching the network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pubwatch_core::PublicationListItem;
use pubwatch_scholar::{
    extract_link_candidates, is_publication_detail_url, FetchResult, LinkCandidate,
    LinkCandidates, ScholarSource,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crossref::CrossrefClient;
use crate::discovery::{looks_like_pdf_url, PdfProbe};
use crate::doi::{normalize_doi, publication_doi};
use crate::unpaywall::{UnpaywallClient, UnpaywallRecord};

pub const PDF_SOURCE_DETAIL_PAGE: &str = "scholar_publication_page";
pub const PDF_SOURCE_DETAIL_PAGE_UNLABELED: &str = "scholar_publication_page_unlabeled_fallback";
pub const PDF_SOURCE_UNPAYWALL: &str = "unpaywall";

pub const FAILURE_NO_PDF_FOUND: &str = "no_pdf_found";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OaResolutionOutcome {
    pub publication_id: i64,
    pub doi: Option<String>,
    pub pdf_url: Option<String>,
    pub failure_reason: Option<String>,
    pub source: String,
    pub used_crossref: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub outcome: Option<OaResolutionOutcome>,
    pub candidates: Option<LinkCandidates>,
}

/// Detail-page link candidates; failures are swallowed into `None`.
#[async_trait]
pub trait DetailCandidateSource: Send + Sync {
    async fn link_candidates(&self, pub_url: Option<&str>) -> Option<LinkCandidates>;
}

/// OA metadata lookup; `None` means "no usable record", never an abort.
#[async_trait]
pub trait OaMetadataResolver: Send + Sync {
    async fn resolve(&self, item: &PublicationListItem) -> Option<OaResolutionOutcome>;
}

/// Validation of an unlabeled fallback link.
#[async_trait]
pub trait FallbackValidator: Send + Sync {
    async fn validated_pdf_url(&self, candidate_url: &str) -> Option<String>;
}

/// A disabled OA stage resolves nothing.
#[async_trait]
impl<T: OaMetadataResolver> OaMetadataResolver for Option<T> {
    async fn resolve(&self, item: &PublicationListItem) -> Option<OaResolutionOutcome> {
        match self {
            Some(resolver) => resolver.resolve(item).await,
            None => None,
        }
    }
}

pub struct PdfResolutionPipeline<C, O, V> {
    candidates: C,
    oa: O,
    validator: V,
}

fn detail_outcome(row: &PublicationListItem, candidate: &LinkCandidate) -> OaResolutionOutcome {
    let source = if candidate.label_present {
        PDF_SOURCE_DETAIL_PAGE
    } else {
        PDF_SOURCE_DETAIL_PAGE_UNLABELED
    };
    OaResolutionOutcome {
        publication_id: row.publication_id,
        doi: row.doi.clone(),
        pdf_url: Some(candidate.url.clone()),
        failure_reason: None,
        source: source.to_string(),
        used_crossref: false,
    }
}

impl<C, O, V> PdfResolutionPipeline<C, O, V>
where
    C: DetailCandidateSource,
    O: OaMetadataResolver,
    V: FallbackValidator,
{
    pub fn new(candidates: C, oa: O, validator: V) -> Self {
        Self {
            candidates,
            oa,
            validator,
        }
    }

    pub async fn resolve_for_row(&self, row: &PublicationListItem) -> PipelineOutcome {
        let candidates = self.candidates.link_candidates(row.pub_url.as_deref()).await;

        if let Some(labeled) = candidates
            .as_ref()
            .and_then(|c| c.labeled_candidate.clone())
        {
            return PipelineOutcome {
                outcome: Some(detail_outcome(row, &labeled)),
                candidates,
            };
        }

        let oa_outcome = self.oa.resolve(row).await;
        if oa_outcome
            .as_ref()
            .is_some_and(|outcome| outcome.pdf_url.is_some())
        {
            return PipelineOutcome {
                outcome: oa_outcome,
                candidates,
            };
        }

        if let Some(fallback) = candidates
            .as_ref()
            .and_then(|c| c.fallback_candidate.clone())
        {
            if let Some(validated_url) = self.validator.validated_pdf_url(&fallback.url).await {
                let validated = LinkCandidate {
                    url: validated_url,
                    ..fallback
                };
                return PipelineOutcome {
                    outcome: Some(detail_outcome(row, &validated)),
                    candidates,
                };
            }
        }

        PipelineOutcome {
            outcome: oa_outcome,
            candidates,
        }
    }
}

// --- production stage implementations -------------------------------------

/// Fetches the publication's detail page through the shared scholar source
/// and extracts link candidates, swallowing every failure.
pub struct ScholarDetailSource {
    source: Arc<dyn ScholarSource>,
}

impl ScholarDetailSource {
    pub fn new(source: Arc<dyn ScholarSource>) -> Self {
        Self { source }
    }

    fn fetch_succeeded(fetch_result: &FetchResult) -> bool {
        fetch_result.status_code == Some(200) && fetch_result.error.is_none()
    }
}

#[async_trait]
impl DetailCandidateSource for ScholarDetailSource {
    async fn link_candidates(&self, pub_url: Option<&str>) -> Option<LinkCandidates> {
        let url = pub_url?;
        if !is_publication_detail_url(Some(url)) {
            return None;
        }
        let fetch_result = self.source.fetch_publication_detail(url).await;
        if !Self::fetch_succeeded(&fetch_result) {
            debug!(url, "detail page fetch did not succeed; candidates unavailable");
            return None;
        }
        match extract_link_candidates(&fetch_result.body) {
            Ok(candidates) => Some(candidates),
            Err(err) => {
                warn!(url, code = err.code, error = %err, "detail page candidates unavailable");
                None
            }
        }
    }
}

/// Unpaywall-by-DOI with optional Crossref cascade under a per-batch budget.
pub struct UnpaywallOaResolver {
    unpaywall: UnpaywallClient,
    crossref: Option<CrossrefClient>,
    crossref_max_rows: u32,
    crossref_budget: AtomicUsize,
    probe: PdfProbe,
}

impl UnpaywallOaResolver {
    pub fn new(
        unpaywall: UnpaywallClient,
        crossref: Option<CrossrefClient>,
        crossref_max_rows: u32,
        crossref_budget: usize,
        probe: PdfProbe,
    ) -> Self {
        Self {
            unpaywall,
            crossref,
            crossref_max_rows,
            crossref_budget: AtomicUsize::new(crossref_budget),
            probe,
        }
    }

    fn try_take_crossref_slot(&self) -> bool {
        self.crossref_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| {
                budget.checked_sub(1)
            })
            .is_ok()
    }

    /// Prefer the record's direct PDF URL; when it does not look direct, try
    /// to discover a direct link on the corresponding landing page.
    async fn resolved_pdf_url(&self, record: &UnpaywallRecord) -> Option<String> {
        let pdf_url = record.best_pdf_url()?;
        if looks_like_pdf_url(Some(&pdf_url)) {
            return Some(pdf_url);
        }
        let landing = record
            .best_oa_location
            .as_ref()
            .and_then(|location| location.url.clone())
            .unwrap_or_else(|| pdf_url.clone());
        match self.probe.resolve_pdf_from_landing_page(&landing).await {
            Some(direct) => Some(direct),
            None => Some(pdf_url),
        }
    }

    async fn outcome_from_record(
        &self,
        item: &PublicationListItem,
        record: &UnpaywallRecord,
        used_crossref: bool,
    ) -> OaResolutionOutcome {
        let pdf_url = self.resolved_pdf_url(record).await;
        OaResolutionOutcome {
            publication_id: item.publication_id,
            doi: normalize_doi(record.doi.as_deref()).or_else(|| item.doi.clone()),
            pdf_url: pdf_url.clone(),
            failure_reason: pdf_url.is_none().then(|| FAILURE_NO_PDF_FOUND.to_string()),
            source: PDF_SOURCE_UNPAYWALL.to_string(),
            used_crossref,
        }
    }
}

#[async_trait]
impl OaMetadataResolver for UnpaywallOaResolver {
    async fn resolve(&self, item: &PublicationListItem) -> Option<OaResolutionOutcome> {
        let direct_doi = publication_doi(item);
        let mut record = None;
        if let Some(doi) = &direct_doi {
            record = self.unpaywall.fetch_by_doi(doi).await;
            if record
                .as_ref()
                .is_some_and(|r| r.best_pdf_url().is_some())
            {
                let record = record.as_ref()?;
                return Some(self.outcome_from_record(item, record, false).await);
            }
        }

        let mut used_crossref = false;
        if let Some(crossref) = &self.crossref {
            if self.try_take_crossref_slot() {
                used_crossref = true;
                if let Some(discovered) = crossref
                    .discover_doi_for_publication(item, self.crossref_max_rows)
                    .await
                {
                    if Some(&discovered) != direct_doi.as_ref() {
                        if let Some(crossref_record) = self.unpaywall.fetch_by_doi(&discovered).await
                        {
                            record = Some(crossref_record);
                        }
                    }
                }
            }
        }

        let record = record?;
        Some(self.outcome_from_record(item, &record, used_crossref).await)
    }
}

/// Accepts direct-looking URLs as-is, otherwise probes content type and
/// finally scans the landing page.
pub struct ProbeFallbackValidator {
    probe: PdfProbe,
}

impl ProbeFallbackValidator {
    pub fn new(probe: PdfProbe) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl FallbackValidator for ProbeFallbackValidator {
    async fn validated_pdf_url(&self, candidate_url: &str) -> Option<String> {
        if looks_like_pdf_url(Some(candidate_url)) {
            return Some(candidate_url.to_string());
        }
        if self.probe.serves_pdf(candidate_url).await {
            return Some(candidate_url.to_string());
        }
        self.probe.resolve_pdf_from_landing_page(candidate_url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    fn row() -> PublicationListItem {
        PublicationListItem {
            publication_id: 1,
            scholar_profile_id: 1,
            scholar_label: "Ada Lovelace".to_string(),
            title: "A paper".to_string(),
            year: Some(2024),
            citation_count: 0,
            venue_text: None,
            pub_url: Some(
                "https://scholar.google.com/citations?view_op=view_citation&citation_for_view=abc:xyz"
                    .to_string(),
            ),
            doi: None,
            pdf_url: None,
            is_read: false,
            first_seen_at: Utc::now(),
            is_new_in_latest_run: true,
        }
    }

    fn candidates(labeled: Option<&str>, fallback: Option<&str>) -> LinkCandidates {
        LinkCandidates {
            container_seen: true,
            labeled_candidate: labeled.map(|url| LinkCandidate {
                url: url.to_string(),
                confidence_score: 0.98,
                label_present: true,
                reason: "scholar_link_labeled_pdf".to_string(),
            }),
            fallback_candidate: fallback.map(|url| LinkCandidate {
                url: url.to_string(),
                confidence_score: 0.2,
                label_present: false,
                reason: "scholar_link_unlabeled_fallback".to_string(),
            }),
            warnings: Vec::new(),
        }
    }

    struct StaticCandidates(Option<LinkCandidates>);

    #[async_trait]
    impl DetailCandidateSource for StaticCandidates {
        async fn link_candidates(&self, _pub_url: Option<&str>) -> Option<LinkCandidates> {
            self.0.clone()
        }
    }

    struct CountingOa {
        calls: AtomicUsize,
        pdf_url: Option<String>,
    }

    impl CountingOa {
        fn new(pdf_url: Option<&str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                pdf_url: pdf_url.map(str::to_string),
            }
        }
    }

    #[async_trait]
    impl OaMetadataResolver for CountingOa {
        async fn resolve(&self, item: &PublicationListItem) -> Option<OaResolutionOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(OaResolutionOutcome {
                publication_id: item.publication_id,
                doi: Some("10.1000/example".to_string()),
                pdf_url: self.pdf_url.clone(),
                failure_reason: self
                    .pdf_url
                    .is_none()
                    .then(|| FAILURE_NO_PDF_FOUND.to_string()),
                source: PDF_SOURCE_UNPAYWALL.to_string(),
                used_crossref: false,
            })
        }
    }

    struct CountingValidator {
        calls: AtomicUsize,
        result: Option<String>,
    }

    impl CountingValidator {
        fn new(result: Option<&str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: result.map(str::to_string),
            }
        }
    }

    #[async_trait]
    impl FallbackValidator for CountingValidator {
        async fn validated_pdf_url(&self, _candidate_url: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    #[tokio::test]
    async fn labeled_candidate_short_circuits_before_oa() {
        let pipeline = PdfResolutionPipeline::new(
            StaticCandidates(Some(candidates(Some("https://arxiv.org/pdf/1703.06103"), None))),
            CountingOa::new(Some("https://oa.example.org/found.pdf")),
            CountingValidator::new(None),
        );

        let result = pipeline.resolve_for_row(&row()).await;

        let outcome = result.outcome.unwrap();
        assert_eq!(outcome.pdf_url.as_deref(), Some("https://arxiv.org/pdf/1703.06103"));
        assert_eq!(outcome.source, PDF_SOURCE_DETAIL_PAGE);
        assert_eq!(pipeline.oa.calls.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.validator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oa_result_preempts_unlabeled_fallback() {
        let pipeline = PdfResolutionPipeline::new(
            StaticCandidates(Some(candidates(None, Some("https://example.org/download/42")))),
            CountingOa::new(Some("https://oa.example.org/found.pdf")),
            CountingValidator::new(Some("https://example.org/fallback.pdf")),
        );

        let result = pipeline.resolve_for_row(&row()).await;

        let outcome = result.outcome.unwrap();
        assert_eq!(outcome.pdf_url.as_deref(), Some("https://oa.example.org/found.pdf"));
        assert_eq!(outcome.source, PDF_SOURCE_UNPAYWALL);
        assert_eq!(pipeline.validator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn validated_fallback_rescues_an_oa_miss() {
        let pipeline = PdfResolutionPipeline::new(
            StaticCandidates(Some(candidates(None, Some("https://example.org/download/42")))),
            CountingOa::new(None),
            CountingValidator::new(Some("https://example.org/fallback.pdf")),
        );

        let result = pipeline.resolve_for_row(&row()).await;

        let outcome = result.outcome.unwrap();
        assert_eq!(outcome.pdf_url.as_deref(), Some("https://example.org/fallback.pdf"));
        assert_eq!(outcome.source, PDF_SOURCE_DETAIL_PAGE_UNLABELED);
    }

    #[tokio::test]
    async fn failed_validation_falls_back_to_the_oa_outcome() {
        let pipeline = PdfResolutionPipeline::new(
            StaticCandidates(Some(candidates(None, Some("https://example.org/download/42")))),
            CountingOa::new(None),
            CountingValidator::new(None),
        );

        let result = pipeline.resolve_for_row(&row()).await;

        let outcome = result.outcome.unwrap();
        assert_eq!(outcome.pdf_url, None);
        assert_eq!(outcome.failure_reason.as_deref(), Some(FAILURE_NO_PDF_FOUND));
        assert_eq!(pipeline.validator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unavailable_candidates_still_run_the_oa_stage() {
        let pipeline = PdfResolutionPipeline::new(
            StaticCandidates(None),
            CountingOa::new(Some("https://oa.example.org/found.pdf")),
            CountingValidator::new(None),
        );

        let result = pipeline.resolve_for_row(&row()).await;

        assert!(result.candidates.is_none());
        assert_eq!(
            result.outcome.unwrap().pdf_url.as_deref(),
            Some("https://oa.example.org/found.pdf")
        );
        assert_eq!(pipeline.oa.calls.load(Ordering::SeqCst), 1);
    }
}

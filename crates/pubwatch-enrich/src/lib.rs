//! Open-access enrichment: DOI derivation, Unpaywall/Crossref lookups, the
//! per-publication PDF resolution waterfall and its concurrency-bounded
//! scheduler.

pub mod crossref;
pub mod discovery;
pub mod doi;
pub mod jobs;
pub mod pipeline;
pub mod scheduler;
pub mod service;
pub mod unpaywall;

pub use jobs::PdfJobPolicy;
pub use pipeline::{
    DetailCandidateSource, FallbackValidator, OaMetadataResolver, OaResolutionOutcome,
    PdfResolutionPipeline, PipelineOutcome, PDF_SOURCE_DETAIL_PAGE,
    PDF_SOURCE_DETAIL_PAGE_UNLABELED, PDF_SOURCE_UNPAYWALL,
};
pub use scheduler::{missing_pdf_items, EnrichmentScheduler};
pub use service::{EnrichmentConfig, EnrichmentService};

pub const CRATE_NAME: &str = "pubwatch-enrich";

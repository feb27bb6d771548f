//! Fetch seam for the scraped source.
//!
//! The trait exists so the ingestion loop and the resolution pipeline can be
//! exercised against scripted pages; `LiveScholarSource` is the production
//! implementation on top of the shared `HttpFetcher`.

use std::sync::Arc;

use async_trait::async_trait;
use pubwatch_core::SCHOLAR_ORIGIN;
use pubwatch_storage::{FetchError, HttpFetcher};
use tracing::debug;

/// Raw fetch outcome handed to the parser.
///
/// Transport failures are data here, not errors: the classifier needs them to
/// produce a NETWORK_ERROR page state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub requested_url: String,
    pub status_code: Option<u16>,
    pub final_url: Option<String>,
    pub body: String,
    pub error: Option<String>,
}

#[async_trait]
pub trait ScholarSource: Send + Sync {
    /// Fetch one listing page of a profile at the given pagination offset.
    async fn fetch_profile_page(&self, scholar_id: &str, cstart: u32, page_size: u32)
        -> FetchResult;

    /// Fetch a publication detail page by absolute URL.
    async fn fetch_publication_detail(&self, url: &str) -> FetchResult;
}

pub struct LiveScholarSource {
    fetcher: Arc<HttpFetcher>,
}

impl LiveScholarSource {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }

    pub fn profile_page_url(scholar_id: &str, cstart: u32, page_size: u32) -> String {
        format!(
            "{SCHOLAR_ORIGIN}/citations?hl=en&user={scholar_id}&cstart={cstart}&pagesize={page_size}"
        )
    }

    async fn fetch(&self, url: String) -> FetchResult {
        match self.fetcher.fetch_text(&url).await {
            Ok(resp) => FetchResult {
                requested_url: url,
                status_code: Some(resp.status.as_u16()),
                final_url: Some(resp.final_url),
                body: resp.body,
                error: None,
            },
            Err(FetchError::HttpStatus { status, url: final_url }) => {
                debug!(status, url = %final_url, "non-success status from scholar source");
                FetchResult {
                    requested_url: url,
                    status_code: Some(status),
                    final_url: Some(final_url),
                    body: String::new(),
                    error: Some(format!("http status {status}")),
                }
            }
            Err(err @ FetchError::Request(_)) => FetchResult {
                requested_url: url,
                status_code: None,
                final_url: None,
                body: String::new(),
                error: Some(err.to_string()),
            },
        }
    }
}

#[async_trait]
impl ScholarSource for LiveScholarSource {
    async fn fetch_profile_page(
        &self,
        scholar_id: &str,
        cstart: u32,
        page_size: u32,
    ) -> FetchResult {
        self.fetch(Self::profile_page_url(scholar_id, cstart, page_size))
            .await
    }

    async fn fetch_publication_detail(&self, url: &str) -> FetchResult {
        self.fetch(url.to_string()).await
    }
}

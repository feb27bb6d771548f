//! PDF discovery helpers: URL-shape heuristics, a bounded content-type probe
//! and a landing-page anchor scan.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

static ANCHOR_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("static selector"));

const PDF_PATH_TOKEN: &str = "/pdf/";

/// The URL path alone already promises a PDF.
pub fn looks_like_pdf_url(url: Option<&str>) -> bool {
    let Some(url) = url else {
        return false;
    };
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let path = parsed.path().to_lowercase();
    path.ends_with(".pdf") || path.contains(PDF_PATH_TOKEN)
}

#[derive(Debug, Clone)]
pub struct PdfProbe {
    client: reqwest::Client,
}

impl PdfProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout.max(pubwatch_storage::http::TIMEOUT_FLOOR))
            .build()
            .context("building pdf probe client")?;
        Ok(Self { client })
    }

    /// Bounded check whether a URL serves a PDF, by content type.
    pub async fn serves_pdf(&self, url: &str) -> bool {
        let response = match self.client.head(url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(url, error = %err, "pdf probe failed");
                return false;
            }
        };
        if !response.status().is_success() {
            return false;
        }
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.to_lowercase().starts_with("application/pdf"))
    }

    /// Fetch a landing page and look for the first PDF-shaped link on it.
    pub async fn resolve_pdf_from_landing_page(&self, page_url: &str) -> Option<String> {
        let response = match self.client.get(page_url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(page_url, error = %err, "landing page fetch failed");
                return None;
            }
        };
        if !response.status().is_success() {
            return None;
        }
        let base = Url::parse(&response.url().to_string()).ok()?;
        let body = response.text().await.ok()?;
        find_pdf_link_in_html(&body, &base)
    }
}

/// First anchor whose resolved target looks like a direct PDF link.
pub fn find_pdf_link_in_html(html: &str, base: &Url) -> Option<String> {
    let document = Html::parse_document(html);
    for anchor in document.select(&ANCHOR_SEL) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        let absolute = resolved.to_string();
        if looks_like_pdf_url(Some(&absolute)) {
            return Some(absolute);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_suffix_and_path_segment_both_count() {
        assert!(looks_like_pdf_url(Some("https://example.org/files/paper.pdf")));
        assert!(looks_like_pdf_url(Some("https://example.org/pdf/42")));
        assert!(looks_like_pdf_url(Some("https://example.org/a/PDF/42")));
        assert!(!looks_like_pdf_url(Some("https://example.org/view?paper=42")));
        assert!(!looks_like_pdf_url(Some("not a url")));
        assert!(!looks_like_pdf_url(None));
    }

    #[test]
    fn query_strings_do_not_fake_a_pdf_path() {
        assert!(!looks_like_pdf_url(Some(
            "https://example.org/view?file=paper.pdf"
        )));
    }

    #[test]
    fn landing_page_scan_finds_and_absolutizes_pdf_links() {
        let html = r#"
        <html><body>
          <a href="/about">About</a>
          <a href="/files/paper-42.pdf">Download PDF</a>
          <a href="https://example.org/other.pdf">Other</a>
        </body></html>
        "#;
        let base = Url::parse("https://journal.example.org/articles/42").unwrap();
        assert_eq!(
            find_pdf_link_in_html(html, &base),
            Some("https://journal.example.org/files/paper-42.pdf".to_string())
        );
    }

    #[test]
    fn landing_page_scan_without_pdf_links_yields_none() {
        let html = "<html><body><a href='/about'>About</a></body></html>";
        let base = Url::parse("https://journal.example.org/").unwrap();
        assert_eq!(find_pdf_link_in_html(html, &base), None);
    }
}

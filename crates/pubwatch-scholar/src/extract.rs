//! Link-candidate extraction from a publication detail page.
//!
//! A missing container is ordinary ("this work has no external link
//! section"). A container that is present but malformed means the upstream
//! layout shifted underneath the parser, and that must surface as a hard
//! error instead of being mistaken for absence.

use std::sync::LazyLock;

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::parser::normalize_space;

const CONTAINER_ID: &str = "gsc_oci_title_gg";
const PDF_LABEL_TOKEN: &str = "[pdf]";
pub const LABELED_CONFIDENCE: f64 = 0.98;
pub const UNLABELED_CONFIDENCE: f64 = 0.2;

pub const REASON_LABELED: &str = "scholar_link_labeled_pdf";
pub const REASON_UNLABELED: &str = "scholar_link_unlabeled_fallback";

static CONTAINER_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div#gsc_oci_title_gg").expect("static selector"));
static ANCHOR_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a").expect("static selector"));

/// Structural assumption about the detail page broke.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DomInvariantError {
    pub code: &'static str,
    pub message: String,
}

impl DomInvariantError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkCandidate {
    pub url: String,
    pub confidence_score: f64,
    pub label_present: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkCandidates {
    pub container_seen: bool,
    pub labeled_candidate: Option<LinkCandidate>,
    pub fallback_candidate: Option<LinkCandidate>,
    pub warnings: Vec<String>,
}

impl LinkCandidates {
    fn none_seen() -> Self {
        Self {
            container_seen: false,
            labeled_candidate: None,
            fallback_candidate: None,
            warnings: Vec::new(),
        }
    }
}

struct ParsedAnchor {
    href: String,
    text: String,
}

/// True for absolute detail-page URLs carrying the view-citation operation.
pub fn is_publication_detail_url(url: Option<&str>) -> bool {
    let Some(url) = url else {
        return false;
    };
    let Ok(parsed) = Url::parse(url.trim()) else {
        return false;
    };
    if !matches!(parsed.scheme(), "http" | "https") {
        return false;
    }
    if parsed.host_str().map(str::to_lowercase).as_deref() != Some("scholar.google.com") {
        return false;
    }
    let mut view_op_ok = false;
    let mut citation_ok = false;
    for (key, value) in parsed.query_pairs() {
        if key == "view_op" && value == "view_citation" {
            view_op_ok = true;
        }
        if key == "citation_for_view" && !value.trim().is_empty() {
            citation_ok = true;
        }
    }
    view_op_ok && citation_ok
}

fn validated_anchors(container: scraper::ElementRef<'_>) -> Result<Vec<ParsedAnchor>, DomInvariantError> {
    let mut anchors = Vec::new();
    for anchor in container.select(&ANCHOR_SEL) {
        let href = anchor.value().attr("href").unwrap_or("").trim().to_string();
        if href.is_empty() {
            return Err(DomInvariantError::new(
                "layout_publication_link_missing_href",
                format!("anchor inside #{CONTAINER_ID} was missing href"),
            ));
        }
        let scheme_ok = Url::parse(&href)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !scheme_ok {
            return Err(DomInvariantError::new(
                "layout_publication_link_invalid_scheme",
                format!("anchor inside #{CONTAINER_ID} used a non-http URL"),
            ));
        }
        anchors.push(ParsedAnchor {
            href,
            text: normalize_space(&anchor.text().collect::<String>()),
        });
    }

    if anchors.is_empty() {
        return Err(DomInvariantError::new(
            "layout_publication_link_container_missing_anchor",
            format!("#{CONTAINER_ID} was present without an anchor"),
        ));
    }
    Ok(anchors)
}

fn select_labeled(anchors: &[ParsedAnchor]) -> Option<LinkCandidate> {
    anchors
        .iter()
        .find(|a| a.text.to_lowercase().contains(PDF_LABEL_TOKEN))
        .map(|a| LinkCandidate {
            url: a.href.clone(),
            confidence_score: LABELED_CONFIDENCE,
            label_present: true,
            reason: REASON_LABELED.to_string(),
        })
}

fn select_fallback(anchors: &[ParsedAnchor], labeled: Option<&LinkCandidate>) -> Option<LinkCandidate> {
    anchors
        .iter()
        .find(|a| labeled.map(|l| l.url != a.href).unwrap_or(true))
        .map(|a| LinkCandidate {
            url: a.href.clone(),
            confidence_score: UNLABELED_CONFIDENCE,
            label_present: false,
            reason: REASON_UNLABELED.to_string(),
        })
}

/// Rank external-link anchors from a detail page.
pub fn extract_link_candidates(html: &str) -> Result<LinkCandidates, DomInvariantError> {
    let document = Html::parse_document(html);
    let Some(container) = document.select(&CONTAINER_SEL).next() else {
        return Ok(LinkCandidates::none_seen());
    };

    let anchors = validated_anchors(container)?;
    let labeled = select_labeled(&anchors);
    let fallback = select_fallback(&anchors, labeled.as_ref());

    let mut warnings = Vec::new();
    if labeled.is_none() && fallback.is_some() {
        warnings.push("scholar_publication_link_unlabeled_only".to_string());
    }

    Ok(LinkCandidates {
        container_seen: true,
        labeled_candidate: labeled,
        fallback_candidate: fallback,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_labeled_pdf_link_from_container() {
        let html = r#"
        <html><body>
          <div id="gsc_oci_title_gg">
            <div class="gsc_oci_title_ggi">
              <a href="https://arxiv.org/pdf/1703.06103" data-clk="x">
                <span class="gsc_vcd_title_ggt">[PDF]</span> from arxiv.org
              </a>
            </div>
          </div>
        </body></html>
        "#;
        let candidates = extract_link_candidates(html).unwrap();
        assert!(candidates.container_seen);
        let labeled = candidates.labeled_candidate.unwrap();
        assert_eq!(labeled.url, "https://arxiv.org/pdf/1703.06103");
        assert!(labeled.label_present);
        assert_eq!(labeled.confidence_score, LABELED_CONFIDENCE);
    }

    #[test]
    fn missing_container_yields_no_candidates_without_error() {
        let html = "<html><body><div id='gsc_oci_title'>No PDF section</div></body></html>";
        let candidates = extract_link_candidates(html).unwrap();
        assert!(!candidates.container_seen);
        assert!(candidates.labeled_candidate.is_none());
        assert!(candidates.fallback_candidate.is_none());
    }

    #[test]
    fn anchor_without_href_fails_fast() {
        let html = r#"
        <html><body>
          <div id="gsc_oci_title_gg">
            <div class="gsc_oci_title_ggi">
              <a data-clk="x"><span class="gsc_vcd_title_ggt">[PDF]</span> from example.org</a>
            </div>
          </div>
        </body></html>
        "#;
        let err = extract_link_candidates(html).unwrap_err();
        assert_eq!(err.code, "layout_publication_link_missing_href");
    }

    #[test]
    fn container_without_anchor_fails_fast() {
        let html = r#"<html><body><div id="gsc_oci_title_gg"><span>nothing here</span></div></body></html>"#;
        let err = extract_link_candidates(html).unwrap_err();
        assert_eq!(err.code, "layout_publication_link_container_missing_anchor");
    }

    #[test]
    fn relative_or_non_http_href_fails_fast() {
        let html = r#"
        <html><body>
          <div id="gsc_oci_title_gg"><a href="javascript:void(0)">[PDF]</a></div>
        </body></html>
        "#;
        let err = extract_link_candidates(html).unwrap_err();
        assert_eq!(err.code, "layout_publication_link_invalid_scheme");
    }

    #[test]
    fn unlabeled_fallback_is_kept_with_warning() {
        let html = r#"
        <html><body>
          <div id="gsc_oci_title_gg">
            <div class="gsc_oci_title_ggi">
              <a href="https://example.org/download?id=42">from example.org</a>
            </div>
          </div>
        </body></html>
        "#;
        let candidates = extract_link_candidates(html).unwrap();
        assert!(candidates.container_seen);
        assert!(candidates.labeled_candidate.is_none());
        let fallback = candidates.fallback_candidate.unwrap();
        assert_eq!(fallback.url, "https://example.org/download?id=42");
        assert!(!fallback.label_present);
        assert!(candidates
            .warnings
            .contains(&"scholar_publication_link_unlabeled_only".to_string()));
    }

    #[test]
    fn fallback_skips_the_labeled_anchor() {
        let html = r#"
        <html><body>
          <div id="gsc_oci_title_gg">
            <a href="https://arxiv.org/pdf/1703.06103">[PDF] from arxiv.org</a>
            <a href="https://publisher.example.org/landing">publisher page</a>
          </div>
        </body></html>
        "#;
        let candidates = extract_link_candidates(html).unwrap();
        assert_eq!(
            candidates.labeled_candidate.unwrap().url,
            "https://arxiv.org/pdf/1703.06103"
        );
        assert_eq!(
            candidates.fallback_candidate.unwrap().url,
            "https://publisher.example.org/landing"
        );
        assert!(candidates.warnings.is_empty());
    }

    #[test]
    fn detail_url_guard_requires_view_citation_params() {
        assert!(is_publication_detail_url(Some(
            "https://scholar.google.com/citations?view_op=view_citation&hl=en&user=8200InoAAAAJ&citation_for_view=8200InoAAAAJ:gsN89kCJA0AC"
        )));
        assert!(!is_publication_detail_url(Some("https://example.org/paper")));
        assert!(!is_publication_detail_url(Some(
            "https://scholar.google.com/citations?hl=en&user=8200InoAAAAJ"
        )));
        assert!(!is_publication_detail_url(None));
    }
}

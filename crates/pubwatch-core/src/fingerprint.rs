//! Deterministic identity hashing for publications and whole pages.
//!
//! A publication fingerprint must stay identical for the same work re-scraped
//! at different times or from different authors' pages, so it is built only
//! from fields that survive formatting drift. The page fingerprint exists for
//! cheap "nothing changed since last run" detection and is never used as a
//! publication identity.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{ParseState, ParsedProfilePage, PublicationCandidate};

/// Rows beyond this cap do not contribute to the page fingerprint.
pub const PAGE_FINGERPRINT_MAX_ROWS: usize = 20;

/// Lowercase and strip every non-alphanumeric character.
pub fn normalize_title(value: &str) -> String {
    value
        .chars()
        .flat_map(|c| c.to_lowercase())
        .filter(|c| c.is_alphanumeric())
        .collect()
}

fn words(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Last word of the text before the first comma in the authors field.
pub fn first_author_last_name(authors_text: Option<&str>) -> String {
    let Some(authors) = authors_text else {
        return String::new();
    };
    let first_author = authors.split(',').next().unwrap_or("");
    words(first_author).last().unwrap_or_default()
}

/// First word of the venue field.
pub fn first_venue_word(venue_text: Option<&str>) -> String {
    let Some(venue) = venue_text else {
        return String::new();
    };
    words(venue).next().unwrap_or_default()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable cross-run identity hash for one publication.
pub fn publication_fingerprint(candidate: &PublicationCandidate) -> String {
    let canonical = [
        normalize_title(&candidate.title),
        candidate.year.map(|y| y.to_string()).unwrap_or_default(),
        first_author_last_name(candidate.authors_text.as_deref()),
        first_venue_word(candidate.venue_text.as_deref()),
    ]
    .join("|");
    sha256_hex(canonical.as_bytes())
}

#[derive(Serialize)]
struct PageFingerprintRow {
    citation_count: Option<i64>,
    cluster_id: String,
    title_normalized: String,
    year: Option<i32>,
}

#[derive(Serialize)]
struct PageFingerprintPayload {
    articles_range: String,
    has_show_more_button: bool,
    profile_name: String,
    publications: Vec<PageFingerprintRow>,
    state: &'static str,
}

/// Change-detection hash over the salient shape of a parsed page.
///
/// Only meaningful for pages that actually rendered; failure states return
/// `None` so a transient block never masquerades as "unchanged".
pub fn page_fingerprint(page: &ParsedProfilePage) -> Option<String> {
    if !matches!(page.state, ParseState::Ok | ParseState::NoResults) {
        return None;
    }
    let rows = page
        .publications
        .iter()
        .take(PAGE_FINGERPRINT_MAX_ROWS)
        .map(|p| PageFingerprintRow {
            citation_count: p.citation_count,
            cluster_id: p.cluster_id.clone().unwrap_or_default(),
            title_normalized: normalize_title(&p.title),
            year: p.year,
        })
        .collect();
    let payload = PageFingerprintPayload {
        articles_range: page.articles_range.clone().unwrap_or_default(),
        has_show_more_button: page.has_show_more_button,
        profile_name: page.profile_name.clone().unwrap_or_default(),
        publications: rows,
        state: page.state.as_str(),
    };
    // Field order in the payload structs is alphabetical, which keeps the
    // serialized document canonical without a key-sorting pass.
    let canonical = serde_json::to_string(&payload).ok()?;
    Some(sha256_hex(canonical.as_bytes()))
}

/// In-page identity used to collapse duplicate rows before persistence.
///
/// Cluster identity wins when present; the composite fallback deliberately
/// keeps raw authors/venue text so distinct same-titled works do not merge.
pub fn candidate_identity(candidate: &PublicationCandidate) -> String {
    if let Some(cluster_id) = candidate.cluster_id.as_deref() {
        return format!("cluster:{cluster_id}");
    }
    [
        "fallback".to_string(),
        normalize_title(&candidate.title),
        candidate.year.map(|y| y.to_string()).unwrap_or_default(),
        candidate.authors_text.clone().unwrap_or_default(),
        candidate.venue_text.clone().unwrap_or_default(),
    ]
    .join("|")
}

/// Drop duplicate rows while preserving first-seen order.
pub fn dedupe_candidates(candidates: Vec<PublicationCandidate>) -> Vec<PublicationCandidate> {
    let mut seen = std::collections::HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(candidate_identity(c)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn candidate(title: &str, year: Option<i32>, authors: Option<&str>, venue: Option<&str>) -> PublicationCandidate {
        PublicationCandidate {
            title: title.to_string(),
            title_url: None,
            cluster_id: None,
            year,
            citation_count: Some(0),
            authors_text: authors.map(str::to_string),
            venue_text: venue.map(str::to_string),
            pdf_url: None,
        }
    }

    #[test]
    fn normalize_title_is_idempotent() {
        let once = normalize_title("Deep Learning: A Survey!! (2nd ed.)");
        assert_eq!(normalize_title(&once), once);
        assert_eq!(once, "deeplearningasurvey2nded");
    }

    #[test]
    fn fingerprint_survives_formatting_drift() {
        let a = candidate(
            "Attention Is All You Need",
            Some(2017),
            Some("A Vaswani, N Shazeer"),
            Some("Advances in neural information processing systems"),
        );
        let b = candidate(
            "attention is ALL you need.",
            Some(2017),
            Some("A.  Vaswani , N Shazeer, et al"),
            Some("ADVANCES in NIPS 30"),
        );
        assert_eq!(publication_fingerprint(&a), publication_fingerprint(&b));
    }

    #[test]
    fn fingerprint_differs_on_year() {
        let a = candidate("Same title", Some(2020), Some("B Author"), Some("Venue"));
        let b = candidate("Same title", Some(2021), Some("B Author"), Some("Venue"));
        assert_ne!(publication_fingerprint(&a), publication_fingerprint(&b));
    }

    #[test]
    fn first_author_last_name_takes_last_word_before_comma() {
        assert_eq!(first_author_last_name(Some("JW van der Berg, X Li")), "berg");
        assert_eq!(first_author_last_name(Some("  ")), "");
        assert_eq!(first_author_last_name(None), "");
    }

    fn parsed_page(state: ParseState, candidates: Vec<PublicationCandidate>) -> ParsedProfilePage {
        ParsedProfilePage {
            state,
            state_reason: "publications_extracted".to_string(),
            profile_name: Some("Ada Lovelace".to_string()),
            profile_image_url: None,
            publications: candidates,
            marker_counts: BTreeMap::new(),
            warnings: Vec::new(),
            has_show_more_button: false,
            has_operation_error_banner: false,
            articles_range: Some("Articles 1-2".to_string()),
        }
    }

    #[test]
    fn page_fingerprint_is_stable_and_skipped_for_failure_states() {
        let page = parsed_page(
            ParseState::Ok,
            vec![candidate("A", Some(2024), Some("X Y"), Some("V"))],
        );
        assert_eq!(page_fingerprint(&page), page_fingerprint(&page.clone()));

        let blocked = parsed_page(ParseState::BlockedOrCaptcha, Vec::new());
        assert_eq!(page_fingerprint(&blocked), None);
    }

    #[test]
    fn page_fingerprint_ignores_rows_past_the_cap() {
        let many: Vec<_> = (0..PAGE_FINGERPRINT_MAX_ROWS as i32 + 5)
            .map(|i| candidate(&format!("Paper {i}"), Some(2000 + i), None, None))
            .collect();
        let mut extended = many.clone();
        extended.push(candidate("Extra beyond cap", Some(2099), None, None));
        let a = parsed_page(ParseState::Ok, many);
        let b = parsed_page(ParseState::Ok, extended);
        assert_eq!(page_fingerprint(&a), page_fingerprint(&b));
    }

    #[test]
    fn dedupe_prefers_cluster_identity() {
        let mut first = candidate("Paper", Some(2024), Some("A B"), Some("V"));
        first.cluster_id = Some("c1".to_string());
        // Same cluster token with entirely different text still collapses.
        let mut second = candidate("Paper (preprint)", Some(2023), Some("Z Q"), Some("Other"));
        second.cluster_id = Some("c1".to_string());
        // No cluster: distinct composite keys survive even with equal titles.
        let third = candidate("Paper", Some(2024), Some("A B"), Some("Different venue"));
        let fourth = candidate("Paper", Some(2024), Some("A B"), Some("V"));

        let deduped = dedupe_candidates(vec![first, second, third, fourth]);
        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[0].cluster_id.as_deref(), Some("c1"));
    }
}

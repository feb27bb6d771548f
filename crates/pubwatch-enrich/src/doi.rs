//! DOI normalization and opportunistic extraction from stored metadata.

use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use pubwatch_core::PublicationListItem;
use regex::Regex;

static DOI_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)10\.\d{4,9}/[-._;()/:A-Z0-9]+").expect("doi pattern"));
static DOI_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bdoi\s*[:=]\s*(10\.\d{4,9}/[-._;()/:A-Z0-9]+)").expect("doi prefix pattern")
});
static DOI_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:https?://)?(?:dx\.)?doi\.org/(10\.\d{4,9}/[-._;()/:A-Z0-9]+)")
        .expect("doi url pattern")
});

/// Strip url/prefix wrappers and trailing punctuation, lowercase.
pub fn normalize_doi(value: Option<&str>) -> Option<String> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }
    let stripped = raw
        .trim_start_matches("https://doi.org/")
        .trim_start_matches("http://doi.org/")
        .trim_start_matches("https://dx.doi.org/")
        .trim_start_matches("http://dx.doi.org/")
        .trim_start_matches("doi:")
        .trim();
    let cleaned = stripped.trim_end_matches([' ', '.', ';', ',', ')']);
    if !cleaned.starts_with("10.") {
        return None;
    }
    Some(cleaned.to_lowercase())
}

fn decoded(text: &str) -> String {
    percent_decode_str(text).decode_utf8_lossy().into_owned()
}

/// Any DOI-shaped token anywhere in the text.
pub fn extract_doi_candidate(text: Option<&str>) -> Option<String> {
    let decoded = decoded(text?);
    let found = DOI_PATTERN.find(&decoded)?;
    let trimmed = found.as_str().trim_end_matches([' ', '.', ';', ',', ')']);
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Only unambiguous `doi.org/...` or `doi:`-prefixed references.
pub fn extract_explicit_doi(text: Option<&str>) -> Option<String> {
    let decoded = decoded(text?);
    if let Some(captures) = DOI_URL_RE.captures(&decoded) {
        return normalize_doi(captures.get(1).map(|m| m.as_str()));
    }
    if let Some(captures) = DOI_PREFIX_RE.captures(&decoded) {
        return normalize_doi(captures.get(1).map(|m| m.as_str()));
    }
    None
}

/// Best DOI for a publication, in trust order: a stored DOI that is verifiably
/// embedded in the publication's own metadata, then any DOI-shaped token in
/// the URL, then explicit patterns in URL or venue text.
pub fn publication_doi(item: &PublicationListItem) -> Option<String> {
    if let Some(stored) = normalize_doi(item.doi.as_deref()) {
        let in_metadata = [item.pub_url.as_deref(), item.venue_text.as_deref()]
            .into_iter()
            .any(|value| extract_explicit_doi(value).as_deref() == Some(stored.as_str()));
        if in_metadata {
            return Some(stored);
        }
    }
    if let Some(candidate) = extract_doi_candidate(item.pub_url.as_deref()) {
        return normalize_doi(Some(&candidate));
    }
    extract_explicit_doi(item.pub_url.as_deref())
        .or_else(|| extract_explicit_doi(item.venue_text.as_deref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn item(doi: Option<&str>, pub_url: Option<&str>, venue: Option<&str>) -> PublicationListItem {
        PublicationListItem {
            publication_id: 1,
            scholar_profile_id: 1,
            scholar_label: "Shinya Yamanaka".to_string(),
            title: "Induction of pluripotent stem cells".to_string(),
            year: Some(2007),
            citation_count: 1000,
            venue_text: venue.map(str::to_string),
            pub_url: pub_url.map(str::to_string),
            doi: doi.map(str::to_string),
            pdf_url: None,
            is_read: false,
            first_seen_at: Utc::now(),
            is_new_in_latest_run: true,
        }
    }

    #[test]
    fn normalize_strips_url_forms_and_trailing_punctuation() {
        assert_eq!(
            normalize_doi(Some("https://doi.org/10.1016/J.CELL.2007.11.019")),
            Some("10.1016/j.cell.2007.11.019".to_string())
        );
        assert_eq!(
            normalize_doi(Some("doi:10.1000/EXAMPLE;")),
            Some("10.1000/example".to_string())
        );
        assert_eq!(normalize_doi(Some("not-a-doi")), None);
        assert_eq!(normalize_doi(None), None);
    }

    #[test]
    fn doi_candidate_is_extracted_from_percent_encoded_urls() {
        assert_eq!(
            extract_doi_candidate(Some(
                "https://example.org/lookup?key=10.1016%2Fj.cell.2007.11.019"
            )),
            Some("10.1016/j.cell.2007.11.019".to_string())
        );
        assert_eq!(extract_doi_candidate(Some("https://example.org/paper/42")), None);
    }

    #[test]
    fn publication_doi_extracts_from_doi_org_url() {
        let row = item(None, Some("https://doi.org/10.1016/j.cell.2007.11.019"), None);
        assert_eq!(
            publication_doi(&row),
            Some("10.1016/j.cell.2007.11.019".to_string())
        );
    }

    #[test]
    fn stored_doi_needs_metadata_corroboration() {
        // Stored value echoed in the venue text: trusted.
        let corroborated = item(
            Some("10.1000/example"),
            None,
            Some("Cell 131 (5), doi:10.1000/example"),
        );
        assert_eq!(publication_doi(&corroborated), Some("10.1000/example".to_string()));

        // Stored value appearing nowhere in the row's own metadata: ignored.
        let uncorroborated = item(Some("10.1000/example"), Some("https://example.org/x"), None);
        assert_eq!(publication_doi(&uncorroborated), None);
    }

    #[test]
    fn venue_text_is_the_last_resort() {
        let row = item(None, None, Some("Nature 591, doi:10.1038/s41586-021-03302-y"));
        assert_eq!(
            publication_doi(&row),
            Some("10.1038/s41586-021-03302-y".to_string())
        );
    }
}

//! Profile listing-page parser and page-state classifier.
//!
//! Pure over the fetched bytes: no I/O happens here. The classifier encodes a
//! strict priority order because a CAPTCHA interstitial may incidentally
//! contain structural markers; redirect/keyword checks must win over
//! marker-presence checks.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use pubwatch_core::{ParseState, ParsedProfilePage, PublicationCandidate, SCHOLAR_ORIGIN};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::source::FetchResult;

const BLOCKED_KEYWORDS: [&str; 5] = [
    "unusual traffic",
    "sorry/index",
    "not a robot",
    "our systems have detected",
    "automated queries",
];

const NO_RESULTS_KEYWORDS: [&str; 4] = [
    "didn't match any articles",
    "did not match any articles",
    "no articles",
    "no documents",
];

/// Layout markers whose occurrence counts are kept for diagnostics.
const MARKER_KEYS: [&str; 8] = [
    "gsc_a_tr", "gsc_a_at", "gsc_a_ac", "gsc_a_h", "gsc_a_y", "gs_gray", "gsc_prf_in", "gsc_rsb_st",
];

static YEAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(19|20)\d{2}\b").expect("year pattern"));
static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("digits pattern"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| selector("tr.gsc_a_tr"));
static TITLE_SEL: LazyLock<Selector> = LazyLock::new(|| selector("a.gsc_a_at"));
static CITATION_SEL: LazyLock<Selector> = LazyLock::new(|| selector("a.gsc_a_ac"));
static YEAR_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector("span.gsc_a_h, a.gsc_a_h, span.gsc_a_y, a.gsc_a_y"));
static GRAY_SEL: LazyLock<Selector> = LazyLock::new(|| selector("div.gs_gray"));
static ANCHOR_SEL: LazyLock<Selector> = LazyLock::new(|| selector("a"));
static PROFILE_NAME_SEL: LazyLock<Selector> = LazyLock::new(|| selector("#gsc_prf_in"));
static OG_IMAGE_SEL: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"meta[property="og:image"]"#));
static PROFILE_IMG_SEL: LazyLock<Selector> = LazyLock::new(|| selector("img#gsc_prf_pup-img"));
static ARTICLES_RANGE_SEL: LazyLock<Selector> = LazyLock::new(|| selector("#gsc_a_nn"));
static SHOW_MORE_SEL: LazyLock<Selector> = LazyLock::new(|| selector("button#gsc_bpf_more"));
static ERROR_BANNER_SEL: LazyLock<Selector> = LazyLock::new(|| selector("#gsc_a_err"));

pub fn normalize_space(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: ElementRef<'_>) -> String {
    normalize_space(&element.text().collect::<String>())
}

/// Resolve a possibly-relative link against the provider origin.
pub fn build_absolute_url(path_or_url: Option<&str>) -> Option<String> {
    let raw = path_or_url?.trim();
    if raw.is_empty() {
        return None;
    }
    let base = Url::parse(SCHOLAR_ORIGIN).ok()?;
    base.join(raw).ok().map(|u| u.to_string())
}

/// Cluster identity from a title href: the `citation_for_view` token
/// (`<user>:<cluster>`, keep the part after the last colon) or a bare
/// `cluster` query parameter.
pub fn parse_cluster_id_from_href(href: Option<&str>) -> Option<String> {
    let href = href?;
    let base = Url::parse(SCHOLAR_ORIGIN).ok()?;
    let parsed = base.join(href).ok()?;

    for (key, value) in parsed.query_pairs() {
        if key == "citation_for_view" {
            let token = value.trim();
            if token.is_empty() {
                continue;
            }
            let cluster = match token.rsplit_once(':') {
                Some((_, tail)) => tail,
                None => token,
            };
            if !cluster.is_empty() {
                return Some(cluster.to_string());
            }
        }
    }
    for (key, value) in parsed.query_pairs() {
        if key == "cluster" {
            let token = value.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    None
}

pub fn parse_year(text: &str) -> Option<i32> {
    YEAR_RE.find(text).and_then(|m| m.as_str().parse().ok())
}

/// Empty cell means zero citations; unparsable text means unknown.
pub fn parse_citation_count(text: &str) -> Option<i64> {
    if text.is_empty() {
        return Some(0);
    }
    DIGITS_RE.find(text).and_then(|m| m.as_str().parse().ok())
}

fn direct_download_href(row: ElementRef<'_>) -> Option<String> {
    for anchor in row.select(&ANCHOR_SEL) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let classes = anchor.value().attr("class").unwrap_or("").to_lowercase();
        if classes.contains("gs_ggs") {
            return Some(href.to_string());
        }
        if element_text(anchor).to_lowercase().contains("[pdf]") {
            return Some(href.to_string());
        }
    }
    None
}

fn parse_publication_row(row: ElementRef<'_>) -> (Option<PublicationCandidate>, Vec<String>) {
    let mut warnings = Vec::new();

    let title_anchor = row.select(&TITLE_SEL).next();
    let title = title_anchor.map(element_text).unwrap_or_default();
    if title.is_empty() {
        warnings.push("row_missing_title".to_string());
        return (None, warnings);
    }
    let title_href = title_anchor.and_then(|a| a.value().attr("href")).map(str::to_string);
    if title_href.is_none() {
        warnings.push("row_missing_title_href".to_string());
    }

    let citation_text = row.select(&CITATION_SEL).next().map(element_text).unwrap_or_default();
    let citation_count = parse_citation_count(&citation_text);
    if !citation_text.is_empty() && citation_count.is_none() {
        warnings.push("layout_row_citation_unparseable".to_string());
    }

    let year_text = row.select(&YEAR_SEL).next().map(element_text).unwrap_or_default();
    let year = parse_year(&year_text);
    if !year_text.is_empty() && year.is_none() {
        warnings.push("layout_row_year_unparseable".to_string());
    }

    let mut gray_texts = row
        .select(&GRAY_SEL)
        .map(element_text)
        .filter(|text| !text.is_empty());
    let authors_text = gray_texts.next();
    let venue_text = gray_texts.next();

    let candidate = PublicationCandidate {
        cluster_id: parse_cluster_id_from_href(title_href.as_deref()),
        title_url: build_absolute_url(title_href.as_deref()),
        title,
        year,
        citation_count,
        authors_text,
        venue_text,
        pdf_url: build_absolute_url(direct_download_href(row).as_deref()),
    };
    (Some(candidate), warnings)
}

fn parse_publications(document: &Html) -> (Vec<PublicationCandidate>, Vec<String>) {
    let mut warnings = Vec::new();
    let mut publications = Vec::new();
    let mut row_count = 0usize;

    for row in document.select(&ROW_SEL) {
        row_count += 1;
        let (candidate, row_warnings) = parse_publication_row(row);
        warnings.extend(row_warnings);
        if let Some(candidate) = candidate {
            publications.push(candidate);
        }
    }

    if row_count == 0 {
        warnings.push("no_rows_detected".to_string());
    }
    if row_count > 0 && publications.is_empty() {
        warnings.push("layout_all_rows_unparseable".to_string());
    }

    (publications, warnings)
}

fn extract_profile_name(document: &Html) -> Option<String> {
    let text = element_text(document.select(&PROFILE_NAME_SEL).next()?);
    (!text.is_empty()).then_some(text)
}

fn extract_profile_image_url(document: &Html) -> Option<String> {
    if let Some(meta) = document.select(&OG_IMAGE_SEL).next() {
        if let Some(url) = build_absolute_url(meta.value().attr("content")) {
            return Some(url);
        }
    }
    let img = document.select(&PROFILE_IMG_SEL).next()?;
    build_absolute_url(img.value().attr("src"))
}

fn extract_articles_range(document: &Html) -> Option<String> {
    let text = element_text(document.select(&ARTICLES_RANGE_SEL).next()?);
    (!text.is_empty()).then_some(text)
}

/// A "show more" control counts only when it is actually operable.
fn has_show_more_button(document: &Html) -> bool {
    let Some(button) = document.select(&SHOW_MORE_SEL).next() else {
        return false;
    };
    let element = button.value();
    if element.attr("disabled").is_some() {
        return false;
    }
    if element
        .attr("aria-disabled")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    {
        return false;
    }
    if element.attr("class").unwrap_or("").to_lowercase().contains("gs_dis") {
        return false;
    }
    true
}

fn has_operation_error_banner(document: &Html) -> bool {
    let Some(banner) = document.select(&ERROR_BANNER_SEL).next() else {
        return false;
    };
    let text = element_text(banner).to_lowercase();
    text.contains("can't perform the operation now")
        || text.contains("cannot perform the operation now")
}

fn count_markers(body: &str) -> BTreeMap<String, usize> {
    let lowered = body.to_lowercase();
    MARKER_KEYS
        .iter()
        .map(|key| (key.to_string(), lowered.matches(key).count()))
        .collect()
}

/// Text a reader would see: script/style contents excluded, tags stripped.
fn visible_text(document: &Html) -> String {
    let mut out = String::new();
    for node in document.tree.nodes() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let inside_script = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|e| e.name().to_lowercase()))
            .is_some_and(|name| name == "script" || name == "style");
        if inside_script {
            continue;
        }
        out.push_str(text);
        out.push(' ');
    }
    normalize_space(&out).to_lowercase()
}

fn is_accounts_signin_redirect(final_url: &str) -> bool {
    final_url.contains("accounts.google.com")
        && (final_url.contains("signin") || final_url.contains("servicelogin"))
}

fn detect_state(
    fetch_result: &FetchResult,
    publications: &[PublicationCandidate],
    marker_counts: &BTreeMap<String, usize>,
    visible: &str,
) -> (ParseState, &'static str) {
    if fetch_result.status_code.is_none() {
        return (ParseState::NetworkError, "network_error_missing_status_code");
    }

    let lowered_body = fetch_result.body.to_lowercase();
    let final_url = fetch_result
        .final_url
        .as_deref()
        .unwrap_or("")
        .to_lowercase();

    if is_accounts_signin_redirect(&final_url) {
        return (ParseState::BlockedOrCaptcha, "blocked_accounts_redirect");
    }
    if BLOCKED_KEYWORDS.iter().any(|kw| lowered_body.contains(kw))
        || final_url.contains("sorry/index")
    {
        return (ParseState::BlockedOrCaptcha, "blocked_keyword_detected");
    }

    if publications.is_empty() && NO_RESULTS_KEYWORDS.iter().any(|kw| visible.contains(kw)) {
        return (ParseState::NoResults, "no_results_keyword_detected");
    }

    if publications.is_empty() {
        let has_profile_markers = marker_counts.get("gsc_prf_in").copied().unwrap_or(0) > 0;
        let has_table_markers = marker_counts.get("gsc_a_tr").copied().unwrap_or(0) > 0
            || marker_counts.get("gsc_a_at").copied().unwrap_or(0) > 0;
        if !has_profile_markers && !has_table_markers {
            return (ParseState::LayoutChanged, "layout_markers_missing");
        }
        return (ParseState::Ok, "no_rows_with_known_markers");
    }

    (ParseState::Ok, "publications_extracted")
}

/// Turn one fetched profile page into a structured, warning-annotated model.
pub fn parse_profile_page(fetch_result: &FetchResult) -> ParsedProfilePage {
    let document = Html::parse_document(&fetch_result.body);

    let (publications, mut warnings) = parse_publications(&document);
    let marker_counts = count_markers(&fetch_result.body);
    let visible = visible_text(&document);

    let show_more = has_show_more_button(&document);
    let operation_error_banner = has_operation_error_banner(&document);

    if show_more {
        warnings.push("possible_partial_page_show_more_present".to_string());
    }
    if operation_error_banner {
        warnings.push("operation_error_banner_present".to_string());
    }
    warnings.sort();
    warnings.dedup();

    let (state, state_reason) = detect_state(fetch_result, &publications, &marker_counts, &visible);

    ParsedProfilePage {
        state,
        state_reason: state_reason.to_string(),
        profile_name: extract_profile_name(&document),
        profile_image_url: extract_profile_image_url(&document),
        publications,
        marker_counts,
        warnings,
        has_show_more_button: show_more,
        has_operation_error_banner: operation_error_banner,
        articles_range: extract_articles_range(&document),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(body: &str) -> FetchResult {
        let url = "https://scholar.google.com/citations?hl=en&user=abcDEF123456";
        FetchResult {
            requested_url: url.to_string(),
            status_code: Some(200),
            final_url: Some(url.to_string()),
            body: body.to_string(),
            error: None,
        }
    }

    const PROFILE_WITH_ROW: &str = r#"
    <html>
      <div id="gsc_prf_in">Test Author</div>
      <span id="gsc_a_nn">Articles 1-1</span>
      <table>
        <tbody id="gsc_a_b">
          <tr class="gsc_a_tr">
            <td class="gsc_a_t">
              <a class="gsc_a_at" href="/citations?view_op=view_citation&citation_for_view=abc:def123">A Test Paper</a>
              <div class="gs_gray">A Person, B Person</div>
              <div class="gs_gray">Journal of Tests 12 (3), 2024</div>
            </td>
            <td class="gsc_a_c"><a class="gsc_a_ac">7</a></td>
            <td class="gsc_a_y"><span class="gsc_a_h">2024</span></td>
          </tr>
        </tbody>
      </table>
    </html>
    "#;

    #[test]
    fn extracts_core_fields_from_a_listing_row() {
        let parsed = parse_profile_page(&fetch(PROFILE_WITH_ROW));

        assert_eq!(parsed.state, ParseState::Ok);
        assert_eq!(parsed.state_reason, "publications_extracted");
        assert_eq!(parsed.profile_name.as_deref(), Some("Test Author"));
        assert_eq!(parsed.articles_range.as_deref(), Some("Articles 1-1"));
        assert_eq!(parsed.publications.len(), 1);

        let publication = &parsed.publications[0];
        assert_eq!(publication.title, "A Test Paper");
        assert_eq!(publication.cluster_id.as_deref(), Some("def123"));
        assert_eq!(publication.year, Some(2024));
        assert_eq!(publication.citation_count, Some(7));
        assert_eq!(publication.authors_text.as_deref(), Some("A Person, B Person"));
        assert_eq!(
            publication.venue_text.as_deref(),
            Some("Journal of Tests 12 (3), 2024")
        );
        assert!(publication
            .title_url
            .as_deref()
            .is_some_and(|u| u.starts_with("https://scholar.google.com/citations")));
    }

    #[test]
    fn missing_optional_metadata_is_not_an_error() {
        let html = r#"
        <html>
          <div id="gsc_prf_in">Test Author</div>
          <table><tbody id="gsc_a_b">
            <tr class="gsc_a_tr">
              <td class="gsc_a_t">
                <a class="gsc_a_at" href="/citations?view_op=view_citation&citation_for_view=abc:def123">A Test Paper</a>
                <div class="gs_gray">A Person</div>
              </td>
              <td class="gsc_a_c"><a class="gsc_a_ac">7</a></td>
              <td class="gsc_a_y"><span class="gsc_a_h"></span></td>
            </tr>
          </tbody></table>
        </html>
        "#;
        let parsed = parse_profile_page(&fetch(html));

        assert_eq!(parsed.state, ParseState::Ok);
        assert_eq!(parsed.publications.len(), 1);
        let publication = &parsed.publications[0];
        assert_eq!(publication.year, None);
        assert_eq!(publication.venue_text, None);
    }

    #[test]
    fn empty_citation_cell_counts_as_zero() {
        let html = PROFILE_WITH_ROW.replace(r#"<a class="gsc_a_ac">7</a>"#, r#"<a class="gsc_a_ac"></a>"#);
        let parsed = parse_profile_page(&fetch(&html));
        assert_eq!(parsed.publications[0].citation_count, Some(0));
    }

    #[test]
    fn unparsable_citation_text_warns_and_yields_none() {
        let html = PROFILE_WITH_ROW.replace(r#"<a class="gsc_a_ac">7</a>"#, r#"<a class="gsc_a_ac">n/a</a>"#);
        let parsed = parse_profile_page(&fetch(&html));
        assert_eq!(parsed.publications[0].citation_count, None);
        assert!(parsed
            .warnings
            .contains(&"layout_row_citation_unparseable".to_string()));
    }

    #[test]
    fn row_missing_title_is_dropped_with_warning() {
        let html = r#"
        <html>
          <div id="gsc_prf_in">Test Author</div>
          <table><tbody id="gsc_a_b">
            <tr class="gsc_a_tr"><td class="gsc_a_t"><a class="gsc_a_at" href="/x"></a></td></tr>
          </tbody></table>
        </html>
        "#;
        let parsed = parse_profile_page(&fetch(html));
        assert!(parsed.publications.is_empty());
        assert!(parsed.warnings.contains(&"row_missing_title".to_string()));
        assert!(parsed
            .warnings
            .contains(&"layout_all_rows_unparseable".to_string()));
    }

    #[test]
    fn accounts_redirect_classifies_as_blocked() {
        let mut fetch_result = fetch("<html><body>Sign in</body></html>");
        fetch_result.final_url =
            Some("https://accounts.google.com/v3/signin/identifier?continue=...".to_string());

        let parsed = parse_profile_page(&fetch_result);

        assert_eq!(parsed.state, ParseState::BlockedOrCaptcha);
        assert_eq!(parsed.state_reason, "blocked_accounts_redirect");
        assert!(parsed.publications.is_empty());
    }

    #[test]
    fn blocked_keyword_wins_over_missing_markers() {
        let parsed = parse_profile_page(&fetch(
            "<html><body>Our systems have detected unusual traffic from your network.</body></html>",
        ));
        assert_eq!(parsed.state, ParseState::BlockedOrCaptcha);
        assert_eq!(parsed.state_reason, "blocked_keyword_detected");
    }

    #[test]
    fn missing_markers_classify_as_layout_change() {
        let parsed = parse_profile_page(&fetch("<html><body><h1>Unexpected page</h1></body></html>"));
        assert_eq!(parsed.state, ParseState::LayoutChanged);
        assert_eq!(parsed.state_reason, "layout_markers_missing");
        assert!(parsed.warnings.contains(&"no_rows_detected".to_string()));
    }

    #[test]
    fn missing_status_code_reports_network_error() {
        let fetch_result = FetchResult {
            requested_url: "https://scholar.google.com/citations?hl=en&user=abcDEF123456".to_string(),
            status_code: None,
            final_url: None,
            body: String::new(),
            error: Some("timed out".to_string()),
        };
        let parsed = parse_profile_page(&fetch_result);
        assert_eq!(parsed.state, ParseState::NetworkError);
        assert_eq!(parsed.state_reason, "network_error_missing_status_code");
    }

    #[test]
    fn no_results_keyword_inside_script_blocks_is_ignored() {
        let html = r#"
        <html>
          <script>
            const message = "didn't match any articles";
          </script>
          <div id="gsc_prf_in">Scripted Author</div>
          <table><tbody id="gsc_a_b"></tbody></table>
        </html>
        "#;
        let parsed = parse_profile_page(&fetch(html));
        assert_eq!(parsed.state, ParseState::Ok);
        assert_eq!(parsed.state_reason, "no_rows_with_known_markers");
    }

    #[test]
    fn visible_no_results_text_classifies_as_no_results() {
        let html = r#"
        <html>
          <div id="gsc_prf_in">Empty Author</div>
          <div>No documents. Your search didn't match any articles.</div>
        </html>
        "#;
        let parsed = parse_profile_page(&fetch(html));
        assert_eq!(parsed.state, ParseState::NoResults);
        assert_eq!(parsed.state_reason, "no_results_keyword_detected");
    }

    #[test]
    fn disabled_show_more_button_counts_as_absent() {
        let html = r#"
        <html>
          <div id="gsc_prf_in">Disabled Show More</div>
          <table><tbody id="gsc_a_b">
            <tr class="gsc_a_tr">
              <td class="gsc_a_t">
                <a class="gsc_a_at" href="/citations?view_op=view_citation&citation_for_view=abc:def">Paper</a>
              </td>
              <td class="gsc_a_c"><a class="gsc_a_ac">1</a></td>
              <td class="gsc_a_y"><span class="gsc_a_h">2024</span></td>
            </tr>
          </tbody></table>
          <button id="gsc_bpf_more" disabled>Show more</button>
        </html>
        "#;
        let parsed = parse_profile_page(&fetch(html));
        assert_eq!(parsed.state, ParseState::Ok);
        assert!(!parsed.has_show_more_button);
        assert!(!parsed
            .warnings
            .contains(&"possible_partial_page_show_more_present".to_string()));
    }

    #[test]
    fn operable_show_more_button_is_reported_with_warning() {
        let html = r#"
        <html>
          <div id="gsc_prf_in">Paged Author</div>
          <table><tbody id="gsc_a_b">
            <tr class="gsc_a_tr">
              <td class="gsc_a_t">
                <a class="gsc_a_at" href="/citations?view_op=view_citation&citation_for_view=abc:def">Paper</a>
              </td>
              <td class="gsc_a_c"><a class="gsc_a_ac">1</a></td>
              <td class="gsc_a_y"><span class="gsc_a_h">2024</span></td>
            </tr>
          </tbody></table>
          <div id="gsc_lwp"><button id="gsc_bpf_more" type="button">Show more</button></div>
        </html>
        "#;
        let parsed = parse_profile_page(&fetch(html));
        assert!(parsed.has_show_more_button);
        assert!(parsed
            .warnings
            .contains(&"possible_partial_page_show_more_present".to_string()));
    }

    #[test]
    fn cluster_id_prefers_citation_for_view_token() {
        assert_eq!(
            parse_cluster_id_from_href(Some(
                "/citations?view_op=view_citation&citation_for_view=user123:clusterA"
            )),
            Some("clusterA".to_string())
        );
        assert_eq!(
            parse_cluster_id_from_href(Some("/scholar?cluster=987654")),
            Some("987654".to_string())
        );
        assert_eq!(parse_cluster_id_from_href(Some("/citations?hl=en")), None);
        assert_eq!(parse_cluster_id_from_href(None), None);
    }

    #[test]
    fn direct_download_link_is_absolute() {
        let html = r#"
        <html>
          <div id="gsc_prf_in">DL Author</div>
          <table><tbody id="gsc_a_b">
            <tr class="gsc_a_tr">
              <td class="gsc_a_t">
                <a class="gsc_a_at" href="/citations?view_op=view_citation&citation_for_view=abc:def">Paper</a>
              </td>
              <td class="gsc_a_c"><a class="gsc_a_ac">1</a></td>
              <td class="gsc_a_y"><span class="gsc_a_h">2024</span></td>
              <td><a class="gs_ggsd" href="https://example.org/paper.pdf">[PDF] example.org</a></td>
            </tr>
          </tbody></table>
        </html>
        "#;
        let parsed = parse_profile_page(&fetch(html));
        assert_eq!(
            parsed.publications[0].pdf_url.as_deref(),
            Some("https://example.org/paper.pdf")
        );
    }

    #[test]
    fn og_image_is_preferred_and_absolutized() {
        let html = r#"
        <html>
          <head><meta property="og:image" content="/citations/images/avatar.png"></head>
          <body><div id="gsc_prf_in">Pic Author</div></body>
        </html>
        "#;
        let parsed = parse_profile_page(&fetch(html));
        assert_eq!(
            parsed.profile_image_url.as_deref(),
            Some("https://scholar.google.com/citations/images/avatar.png")
        );
    }
}

//! Paginated per-author fetching with retry and termination rules.
//!
//! This is deliberately free of persistence so the termination behavior can
//! be tested against scripted sources: the orchestrator feeds the collected
//! candidates to the store afterwards.

use std::collections::HashSet;

use pubwatch_core::fingerprint::{candidate_identity, page_fingerprint};
use pubwatch_core::{ParseState, ParsedProfilePage, PublicationCandidate};
use pubwatch_scholar::{parse_profile_page, FetchResult, ScholarSource};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::IngestionConfig;

const BODY_EXCERPT_MAX_CHARS: usize = 220;

/// Debug context captured for failed author fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDebug {
    pub status_code: Option<u16>,
    pub fetch_error: Option<String>,
    pub requested_url: String,
    pub body_excerpt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Listing exhausted cleanly (show-more absent, empty tail, or a page
    /// that repeated only already-seen rows).
    Completed,
    /// Page budget ran out while show-more was still present.
    BudgetExhausted { resume_cstart: u32 },
    /// The author failed for this run.
    Failed {
        state: ParseState,
        reason: String,
        debug: FailureDebug,
    },
}

#[derive(Debug, Clone)]
pub struct AuthorPages {
    /// Candidates deduplicated across all fetched pages, listing order kept.
    pub candidates: Vec<PublicationCandidate>,
    pub pages_fetched: u32,
    /// First successfully parsed page, for profile-level fields.
    pub first_page: Option<ParsedProfilePage>,
    /// Change-detection hash of the first page, when it rendered.
    pub first_page_fingerprint: Option<String>,
    /// The first page matched the caller's known fingerprint; nothing was
    /// walked beyond it and nothing needs persisting.
    pub unchanged: bool,
    pub termination: Termination,
    /// Union of page warnings, sorted and deduplicated.
    pub warnings: Vec<String>,
}

/// Flatten markup into a short plain-text excerpt for failure diagnostics.
fn body_excerpt(body: &str) -> Option<String> {
    let mut flattened = String::new();
    let mut in_tag = false;
    for ch in body.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                flattened.push(' ');
            }
            _ if !in_tag => flattened.push(ch),
            _ => {}
        }
    }
    let normalized = flattened.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return None;
    }
    if normalized.chars().count() <= BODY_EXCERPT_MAX_CHARS {
        return Some(normalized);
    }
    let truncated: String = normalized.chars().take(BODY_EXCERPT_MAX_CHARS - 1).collect();
    Some(format!("{truncated}..."))
}

/// Offset to resume from: the end of the reported "Articles N-M" range when
/// the page carries one (the listing's own progress counter), otherwise the
/// next page-size step.
fn next_cstart_value(articles_range: Option<&str>, fallback: u32) -> u32 {
    let Some(range) = articles_range else {
        return fallback;
    };
    let mut numbers = Vec::new();
    let mut current = String::new();
    for ch in range.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            numbers.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        numbers.push(current);
    }
    if numbers.len() >= 2 {
        if let Ok(end) = numbers[1].parse() {
            return end;
        }
    }
    fallback
}

fn failure_debug(fetch_result: &FetchResult) -> FailureDebug {
    FailureDebug {
        status_code: fetch_result.status_code,
        fetch_error: fetch_result.error.clone(),
        requested_url: fetch_result.requested_url.clone(),
        body_excerpt: body_excerpt(&fetch_result.body),
    }
}

/// Fetch one page, retrying network errors with a fixed backoff.
async fn fetch_page_with_retry<S: ScholarSource + ?Sized>(
    source: &S,
    scholar_id: &str,
    cstart: u32,
    config: &IngestionConfig,
) -> (FetchResult, ParsedProfilePage) {
    let mut attempt = 0u32;
    loop {
        let fetch_result = source
            .fetch_profile_page(scholar_id, cstart, config.page_size)
            .await;
        let parsed = parse_profile_page(&fetch_result);
        if parsed.state == ParseState::NetworkError && attempt < config.network_error_retries {
            attempt += 1;
            warn!(
                scholar_id,
                cstart, attempt, "network error fetching listing page; retrying"
            );
            tokio::time::sleep(config.retry_backoff).await;
            continue;
        }
        return (fetch_result, parsed);
    }
}

/// Walk an author's listing from `start_cstart` until a termination rule
/// fires. See `Termination` for the rules.
///
/// When `known_page_fingerprint` matches the freshly computed hash of the
/// initial page, the walk short-circuits: nothing past the first page is
/// fetched and the outcome is marked `unchanged`. The comparison only applies
/// to walks starting at offset zero; a continuation resumes mid-listing.
pub async fn fetch_author_pages<S: ScholarSource + ?Sized>(
    source: &S,
    scholar_id: &str,
    start_cstart: u32,
    known_page_fingerprint: Option<&str>,
    config: &IngestionConfig,
) -> AuthorPages {
    let mut seen: HashSet<String> = HashSet::new();
    let mut candidates = Vec::new();
    let mut warnings: Vec<String> = Vec::new();
    let mut first_page = None;
    let mut first_page_fingerprint = None;
    let mut unchanged = false;
    let mut pages_fetched = 0u32;
    let mut cstart = start_cstart;

    let termination = loop {
        let (fetch_result, parsed) = fetch_page_with_retry(source, scholar_id, cstart, config).await;
        pages_fetched += 1;
        warnings.extend(parsed.warnings.iter().cloned());

        if pages_fetched == 1 && start_cstart == 0 {
            first_page_fingerprint = page_fingerprint(&parsed);
            if first_page_fingerprint.is_some()
                && first_page_fingerprint.as_deref() == known_page_fingerprint
            {
                debug!(scholar_id, "initial page unchanged since last pass");
                unchanged = true;
                first_page = Some(parsed);
                break Termination::Completed;
            }
        }

        match parsed.state {
            ParseState::NetworkError | ParseState::BlockedOrCaptcha | ParseState::LayoutChanged => {
                break Termination::Failed {
                    state: parsed.state,
                    reason: parsed.state_reason.clone(),
                    debug: failure_debug(&fetch_result),
                };
            }
            ParseState::NoResults => {
                // Empty profile on the first page, or an empty tail past the
                // end of the listing; either way the author is done cleanly.
                if first_page.is_none() {
                    first_page = Some(parsed);
                }
                break Termination::Completed;
            }
            ParseState::Ok => {}
        }

        let mut new_on_page = 0usize;
        for candidate in &parsed.publications {
            if seen.insert(candidate_identity(candidate)) {
                candidates.push(candidate.clone());
                new_on_page += 1;
            }
        }
        let show_more = parsed.has_show_more_button;
        let articles_range = parsed.articles_range.clone();
        let is_continuation_page = pages_fetched > 1;
        if first_page.is_none() {
            first_page = Some(parsed);
        }

        if is_continuation_page && new_on_page == 0 {
            debug!(scholar_id, cstart, "stalled tail: page added no new rows");
            break Termination::Completed;
        }
        if !show_more {
            break Termination::Completed;
        }
        if pages_fetched >= config.max_pages_per_scholar {
            break Termination::BudgetExhausted {
                resume_cstart: next_cstart_value(
                    articles_range.as_deref(),
                    cstart + config.page_size,
                ),
            };
        }
        cstart += config.page_size;
    };

    warnings.sort();
    warnings.dedup();

    AuthorPages {
        candidates,
        pages_fetched,
        first_page,
        first_page_fingerprint,
        unchanged,
        termination,
        warnings,
    }
}

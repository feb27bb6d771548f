//! Crossref bibliographic search used to discover DOIs for publications that
//! carry none of their own.

use std::time::Duration;

use anyhow::{Context, Result};
use pubwatch_core::fingerprint::{first_author_last_name, first_venue_word, normalize_title};
use pubwatch_core::PublicationListItem;
use serde::Deserialize;
use strsim::jaro_winkler;
use tracing::{debug, warn};

const CROSSREF_API_URL: &str = "https://api.crossref.org/works";

/// A strong title match in the wrong year is a false positive: bibliographic
/// search happily returns re-issues, corrections and homonyms. One year of
/// drift absorbs online-first vs. print dates.
pub const YEAR_TOLERANCE: i32 = 1;

/// Candidates below this title similarity are never accepted.
pub const MIN_TITLE_SIMILARITY: f64 = 0.92;

#[derive(Debug, Clone, Deserialize)]
pub struct CrossrefWork {
    #[serde(rename = "DOI", default)]
    pub doi: String,
    #[serde(default)]
    pub title: Vec<String>,
    #[serde(default)]
    pub author: Vec<CrossrefAuthor>,
    #[serde(rename = "container-title", default)]
    pub container_title: Vec<String>,
    #[serde(default)]
    pub issued: Option<CrossrefIssued>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossrefAuthor {
    #[serde(default)]
    pub family: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossrefIssued {
    #[serde(rename = "date-parts", default)]
    pub date_parts: Vec<Vec<i32>>,
}

impl CrossrefWork {
    pub fn year(&self) -> Option<i32> {
        self.issued
            .as_ref()?
            .date_parts
            .first()?
            .first()
            .copied()
    }

    pub fn primary_title(&self) -> Option<&str> {
        self.title.first().map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct CrossrefResponse {
    message: CrossrefMessage,
}

#[derive(Debug, Deserialize)]
struct CrossrefMessage {
    #[serde(default)]
    items: Vec<CrossrefWork>,
}

/// Score one candidate against the known publication facts.
///
/// Returns `None` when the candidate is disqualified outright (empty DOI or
/// title, similarity below the floor, year outside tolerance).
pub fn score_candidate(
    known_title: &str,
    known_year: Option<i32>,
    known_author_surname: &str,
    known_venue_word: &str,
    work: &CrossrefWork,
) -> Option<f64> {
    if work.doi.trim().is_empty() {
        return None;
    }
    let candidate_title = work.primary_title()?;
    if let (Some(known), Some(candidate)) = (known_year, work.year()) {
        if (known - candidate).abs() > YEAR_TOLERANCE {
            return None;
        }
    }

    let title_score = jaro_winkler(
        &normalize_title(known_title),
        &normalize_title(candidate_title),
    );
    if title_score < MIN_TITLE_SIMILARITY {
        return None;
    }

    let mut score = title_score;
    if !known_author_surname.is_empty()
        && work
            .author
            .iter()
            .any(|a| a.family.to_lowercase() == known_author_surname)
    {
        score += 0.05;
    }
    if !known_venue_word.is_empty()
        && work
            .container_title
            .iter()
            .any(|venue| first_venue_word(Some(venue)) == known_venue_word)
    {
        score += 0.03;
    }
    Some(score)
}

/// Pick the best-scoring candidate's DOI, if any survives the filters.
pub fn best_matching_doi(item: &PublicationListItem, works: &[CrossrefWork]) -> Option<String> {
    let known_author = first_author_last_name(Some(&item.scholar_label));
    let known_venue = first_venue_word(item.venue_text.as_deref());

    works
        .iter()
        .filter_map(|work| {
            score_candidate(&item.title, item.year, &known_author, &known_venue, work)
                .map(|score| (score, work))
        })
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, work)| work.doi.to_lowercase())
}

#[derive(Debug, Clone)]
pub struct CrossrefClient {
    client: reqwest::Client,
    mailto: String,
}

impl CrossrefClient {
    pub fn new(mailto: impl Into<String>, timeout: Duration) -> Result<Self> {
        let mailto = mailto.into();
        let client = reqwest::Client::builder()
            .user_agent(format!("pubwatch/0.1 (mailto:{mailto})"))
            .timeout(timeout.max(pubwatch_storage::http::TIMEOUT_FLOOR))
            .build()
            .context("building crossref http client")?;
        Ok(Self { client, mailto })
    }

    pub async fn search_bibliographic(&self, query: &str, rows: u32) -> Result<Vec<CrossrefWork>> {
        let response = self
            .client
            .get(CROSSREF_API_URL)
            .query(&[
                ("query.bibliographic", query),
                ("rows", &rows.to_string()),
                ("select", "DOI,title,author,container-title,issued"),
                ("mailto", &self.mailto),
            ])
            .send()
            .await
            .context("crossref request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("crossref returned status {}", response.status());
        }
        let payload: CrossrefResponse = response
            .json()
            .await
            .context("decoding crossref response")?;
        Ok(payload.message.items)
    }

    /// Discover a DOI for a publication; failures are logged and answered
    /// with `None` so enrichment never aborts on a flaky lookup.
    pub async fn discover_doi_for_publication(
        &self,
        item: &PublicationListItem,
        max_rows: u32,
    ) -> Option<String> {
        let query = format!("{} {}", item.title, item.scholar_label);
        match self.search_bibliographic(&query, max_rows).await {
            Ok(works) => {
                let doi = best_matching_doi(item, &works);
                debug!(
                    publication_id = item.publication_id,
                    candidates = works.len(),
                    matched = doi.is_some(),
                    "crossref discovery finished"
                );
                doi
            }
            Err(err) => {
                warn!(publication_id = item.publication_id, error = %err, "crossref discovery failed");
                None
            }
        }
    }
}

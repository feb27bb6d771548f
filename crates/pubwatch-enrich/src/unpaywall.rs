//! Unpaywall lookup-by-DOI client.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

const UNPAYWALL_API_BASE: &str = "https://api.unpaywall.org/v2";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OaLocation {
    #[serde(default)]
    pub url_for_pdf: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct UnpaywallRecord {
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub best_oa_location: Option<OaLocation>,
    #[serde(default)]
    pub oa_locations: Vec<OaLocation>,
}

impl UnpaywallRecord {
    /// Best PDF link: the single "best" open-access location wins, otherwise
    /// the first location in the list that actually carries a PDF URL.
    pub fn best_pdf_url(&self) -> Option<String> {
        if let Some(best) = &self.best_oa_location {
            if let Some(url) = non_empty(best.url_for_pdf.as_deref()) {
                return Some(url);
            }
        }
        self.oa_locations
            .iter()
            .find_map(|location| non_empty(location.url_for_pdf.as_deref()))
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Debug, Clone)]
pub struct UnpaywallClient {
    client: reqwest::Client,
    email: String,
}

impl UnpaywallClient {
    pub fn new(email: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout.max(pubwatch_storage::http::TIMEOUT_FLOOR))
            .build()
            .context("building unpaywall http client")?;
        Ok(Self {
            client,
            email: email.into(),
        })
    }

    /// Look a DOI up; any transport or decode failure is logged and treated
    /// as "no record" so the surrounding pipeline never aborts on it.
    pub async fn fetch_by_doi(&self, doi: &str) -> Option<UnpaywallRecord> {
        let url = format!("{UNPAYWALL_API_BASE}/{doi}");
        let response = match self
            .client
            .get(&url)
            .query(&[("email", self.email.as_str())])
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(doi, error = %err, "unpaywall request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            debug!(doi, status = response.status().as_u16(), "unpaywall lookup missed");
            return None;
        }
        match response.json::<UnpaywallRecord>().await {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(doi, error = %err, "unpaywall payload decode failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_location_pdf_wins() {
        let record: UnpaywallRecord = serde_json::from_value(serde_json::json!({
            "doi": "10.1016/j.cell.2007.11.019",
            "best_oa_location": {
                "url_for_pdf": "https://oa.example.org/article.pdf",
                "url": "https://oa.example.org/landing"
            },
            "oa_locations": [
                {"url_for_pdf": "https://mirror.example.org/other.pdf"}
            ]
        }))
        .unwrap();
        assert_eq!(
            record.best_pdf_url(),
            Some("https://oa.example.org/article.pdf".to_string())
        );
    }

    #[test]
    fn falls_back_to_first_location_with_a_pdf() {
        let record: UnpaywallRecord = serde_json::from_value(serde_json::json!({
            "best_oa_location": {"url": "https://oa.example.org/landing"},
            "oa_locations": [
                {"url": "https://oa.example.org/landing-only"},
                {"url_for_pdf": "  https://repo.example.org/paper.pdf  "}
            ]
        }))
        .unwrap();
        assert_eq!(
            record.best_pdf_url(),
            Some("https://repo.example.org/paper.pdf".to_string())
        );
    }

    #[test]
    fn empty_payload_has_no_pdf() {
        let record = UnpaywallRecord::default();
        assert_eq!(record.best_pdf_url(), None);
    }
}

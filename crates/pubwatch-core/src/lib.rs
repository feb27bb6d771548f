//! Core domain model and identity hashing for pubwatch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod fingerprint;

pub const CRATE_NAME: &str = "pubwatch-core";

/// Origin of the scraped profile pages. Relative links are resolved against it.
pub const SCHOLAR_ORIGIN: &str = "https://scholar.google.com";

/// Classifier verdict for a fetched profile page.
///
/// These are expected outcomes, not errors: a blocked page or a layout change
/// is carried through run aggregation and surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseState {
    Ok,
    NoResults,
    BlockedOrCaptcha,
    LayoutChanged,
    NetworkError,
}

impl ParseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseState::Ok => "ok",
            ParseState::NoResults => "no_results",
            ParseState::BlockedOrCaptcha => "blocked_or_captcha",
            ParseState::LayoutChanged => "layout_changed",
            ParseState::NetworkError => "network_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(ParseState::Ok),
            "no_results" => Some(ParseState::NoResults),
            "blocked_or_captcha" => Some(ParseState::BlockedOrCaptcha),
            "layout_changed" => Some(ParseState::LayoutChanged),
            "network_error" => Some(ParseState::NetworkError),
            _ => None,
        }
    }
}

/// One publication row lifted off a profile listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationCandidate {
    pub title: String,
    pub title_url: Option<String>,
    /// Provider-native cluster token, preferred over fingerprint identity.
    pub cluster_id: Option<String>,
    pub year: Option<i32>,
    /// `None` means the cell had text we could not parse; an empty cell is 0.
    pub citation_count: Option<i64>,
    pub authors_text: Option<String>,
    pub venue_text: Option<String>,
    /// Direct download link present on the listing row itself, if any.
    pub pdf_url: Option<String>,
}

/// Structured result of parsing one profile page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedProfilePage {
    pub state: ParseState,
    pub state_reason: String,
    pub profile_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub publications: Vec<PublicationCandidate>,
    /// Occurrence counts for known layout markers, kept for diagnostics.
    pub marker_counts: BTreeMap<String, usize>,
    /// Sorted, deduplicated warning codes.
    pub warnings: Vec<String>,
    pub has_show_more_button: bool,
    pub has_operation_error_banner: bool,
    /// Raw "Articles N-M" range string when present.
    pub articles_range: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    PartialFailure,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "partial_failure" => Some(RunStatus::PartialFailure),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTriggerType {
    Manual,
    Scheduled,
    Continuation,
}

impl RunTriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTriggerType::Manual => "manual",
            RunTriggerType::Scheduled => "scheduled",
            RunTriggerType::Continuation => "continuation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Dropped,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Queued => "queued",
            QueueStatus::Dropped => "dropped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(QueueStatus::Queued),
            "dropped" => Some(QueueStatus::Dropped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PdfJobStatus {
    Queued,
    Running,
    Failed,
    Succeeded,
}

impl PdfJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PdfJobStatus::Queued => "queued",
            PdfJobStatus::Running => "running",
            PdfJobStatus::Failed => "failed",
            PdfJobStatus::Succeeded => "succeeded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(PdfJobStatus::Queued),
            "running" => Some(PdfJobStatus::Running),
            "failed" => Some(PdfJobStatus::Failed),
            "succeeded" => Some(PdfJobStatus::Succeeded),
            _ => None,
        }
    }

    /// Jobs in these states have a resolution attempt in flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, PdfJobStatus::Queued | PdfJobStatus::Running)
    }
}

/// Tenant-scoped publication row as surfaced to the web boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationListItem {
    pub publication_id: i64,
    pub scholar_profile_id: i64,
    pub scholar_label: String,
    pub title: String,
    pub year: Option<i32>,
    pub citation_count: i64,
    pub venue_text: Option<String>,
    pub pub_url: Option<String>,
    pub doi: Option<String>,
    pub pdf_url: Option<String>,
    pub is_read: bool,
    pub first_seen_at: DateTime<Utc>,
    pub is_new_in_latest_run: bool,
}

/// Provider author identifiers are exactly 12 URL-safe characters; anything
/// else is rejected before any I/O happens.
pub fn is_valid_scholar_id(value: &str) -> bool {
    value.len() == 12
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Trimmed display name; empty input means "no display name".
pub fn normalize_display_name(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Tracked author profile owned by one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScholarProfile {
    pub id: i64,
    pub user_id: i64,
    pub scholar_id: String,
    pub display_name: Option<String>,
    pub is_enabled: bool,
    pub baseline_completed: bool,
    /// Page state of the author's most recent ingestion attempt.
    pub last_run_status: Option<ParseState>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Fingerprint of the first listing page as of the last completed pass,
    /// used to skip authors whose listing has not changed.
    pub last_page_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScholarProfile {
    /// Display name when set, provider identifier otherwise.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.scholar_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRunRecord {
    pub id: i64,
    pub user_id: i64,
    pub trigger_type: RunTriggerType,
    pub status: RunStatus,
    pub start_dt: DateTime<Utc>,
    pub end_dt: Option<DateTime<Utc>>,
    pub scholar_count: i64,
    pub new_pub_count: i64,
    pub error_log: serde_json::Value,
}

/// Durable continuation of a paused per-author pagination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionQueueItem {
    pub id: i64,
    pub user_id: i64,
    pub scholar_profile_id: i64,
    pub scholar_label: String,
    pub resume_cstart: i64,
    pub reason: String,
    pub status: QueueStatus,
    pub attempt_count: i64,
    pub next_attempt_dt: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_run_id: Option<i64>,
    pub dropped_reason: Option<String>,
    pub dropped_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Durable cooldown bookkeeping for asynchronous PDF resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationPdfJob {
    pub publication_id: i64,
    pub status: PdfJobStatus,
    pub attempt_count: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

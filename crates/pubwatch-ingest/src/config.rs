//! Ingestion configuration, resolved from the environment with defaults.

use std::time::Duration;

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Rows requested per listing page.
    pub page_size: u32,
    /// Pagination budget per scholar per run.
    pub max_pages_per_scholar: u32,
    /// Same-page retries on a network-error classification.
    pub network_error_retries: u32,
    /// Fixed delay between those retries.
    pub retry_backoff: Duration,
    pub continuation_base_delay: Duration,
    pub continuation_max_delay: Duration,
    pub continuation_max_attempts: i64,
    pub scheduler_enabled: bool,
    pub scheduler_tick: Duration,
    pub queue_batch_size: i64,
    /// Courtesy spacing between requests to the scraped origin.
    pub min_request_interval: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl IngestionConfig {
    pub fn from_env() -> Self {
        Self {
            page_size: env_parse("PUBWATCH_INGESTION_PAGE_SIZE", 100),
            max_pages_per_scholar: env_parse("PUBWATCH_INGESTION_MAX_PAGES_PER_SCHOLAR", 10),
            network_error_retries: env_parse("PUBWATCH_INGESTION_NETWORK_ERROR_RETRIES", 2),
            retry_backoff: Duration::from_secs(env_parse(
                "PUBWATCH_INGESTION_RETRY_BACKOFF_SECS",
                5,
            )),
            continuation_base_delay: Duration::from_secs(env_parse(
                "PUBWATCH_CONTINUATION_BASE_DELAY_SECS",
                300,
            )),
            continuation_max_delay: Duration::from_secs(env_parse(
                "PUBWATCH_CONTINUATION_MAX_DELAY_SECS",
                21_600,
            )),
            continuation_max_attempts: env_parse("PUBWATCH_CONTINUATION_MAX_ATTEMPTS", 5),
            scheduler_enabled: env_var("PUBWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scheduler_tick: Duration::from_secs(env_parse("PUBWATCH_SCHEDULER_TICK_SECS", 60)),
            queue_batch_size: env_parse("PUBWATCH_SCHEDULER_QUEUE_BATCH_SIZE", 5),
            min_request_interval: Duration::from_secs(env_parse(
                "PUBWATCH_MIN_REQUEST_DELAY_SECS",
                3,
            )),
            http_timeout: Duration::from_secs(env_parse("PUBWATCH_HTTP_TIMEOUT_SECS", 20)),
            user_agent: env_var("PUBWATCH_USER_AGENT")
                .unwrap_or_else(|| "pubwatch-bot/0.1".to_string()),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages_per_scholar: 10,
            network_error_retries: 2,
            retry_backoff: Duration::from_secs(5),
            continuation_base_delay: Duration::from_secs(300),
            continuation_max_delay: Duration::from_secs(21_600),
            continuation_max_attempts: 5,
            scheduler_enabled: false,
            scheduler_tick: Duration::from_secs(60),
            queue_batch_size: 5,
            min_request_interval: Duration::from_secs(3),
            http_timeout: Duration::from_secs(20),
            user_agent: "pubwatch-bot/0.1".to_string(),
        }
    }
}

//! HTTP fetch utilities and the Postgres persistence boundary for pubwatch.

pub mod http;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, MinIntervalGate, RetryDisposition,
};
pub use store::{PgStore, PublicationViewMode, RunLock, StoreError};

pub const CRATE_NAME: &str = "pubwatch-storage";

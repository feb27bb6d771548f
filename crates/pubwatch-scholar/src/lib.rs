//! Profile-page parsing, page-state classification and detail-page link
//! extraction for the scraped scholar source.

pub mod extract;
pub mod parser;
pub mod source;

pub use extract::{
    extract_link_candidates, is_publication_detail_url, DomInvariantError, LinkCandidate,
    LinkCandidates,
};
pub use parser::parse_profile_page;
pub use source::{FetchResult, LiveScholarSource, ScholarSource};

pub const CRATE_NAME: &str = "pubwatch-scholar";

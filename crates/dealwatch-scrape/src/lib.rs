//! Forum listing and detail scraping.
//!
//! The listing side turns one page into [`CandidateDeal`] records; the detail side fills in
//! merchant links and post bodies for a subset of them. Selectors are data, loaded from YAML.

use async_trait::async_trait;
use dealwatch_core::CandidateDeal;
use dealwatch_storage::FetchError;
use thiserror::Error;

pub mod detail;
pub mod listing;
pub mod referral;
pub mod selectors;

pub use detail::{parse_detail, DetailEnricher, DetailInfo};
pub use listing::{parse_count, parse_listing, parse_published, ListScraper};
pub use referral::{RedirectorRule, ReferralRules, RetailerRule};
pub use selectors::{
    CompiledSelectors, DetailSelectors, FieldChain, ListingSelectors, SelectorConfig,
    SelectorConfigError,
};

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Outcome of one enrichment pass. Failed records keep whatever fields they already had.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentReport {
    pub resolved: usize,
    pub failed_ids: Vec<String>,
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn scrape_list(&self) -> Result<Vec<CandidateDeal>, ScrapeError>;
}

#[async_trait]
pub trait DetailSource: Send + Sync {
    /// Fills `merchant_url` and `content` in place. Per-record failures never abort the batch.
    async fn fetch_details(&self, deals: &mut [CandidateDeal]) -> EnrichmentReport;
}

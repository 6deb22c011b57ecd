//! Reconciliation cycle orchestration for dealwatch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use dealwatch_core::{DealInvalid, PersistedDeal};
use dealwatch_notify::{WebhookConfig, WebhookNotifier};
use dealwatch_scrape::{DetailEnricher, ListScraper, ScrapeError, SelectorConfig};
use dealwatch_storage::{
    BackoffPolicy, DeadlineStore, FileDealStore, HostAllowList, HttpClientConfig, HttpFetcher,
    StoreDeadlines, StoreError, TokenBucketConfig,
};
use serde::Serialize;
use thiserror::Error;
use url::Url;

mod engine;

pub use engine::ReconciliationEngine;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub listing_url: Option<String>,
    pub webhook_url: Option<String>,
    pub allowed_hosts: Vec<String>,
    pub selectors_path: Option<PathBuf>,
    pub store_dir: PathBuf,
    pub retention_cap: usize,
    pub min_update_interval: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub detail_concurrency: usize,
    pub affiliate_tag: Option<String>,
    pub notify_rate_ms: u64,
    pub utc_offset_minutes: i32,
    pub bind_addr: String,
    pub store_deadlines: StoreDeadlines,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`; unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |key: &str, default: u64| {
            text(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        Self {
            listing_url: text("DEALWATCH_LISTING_URL"),
            webhook_url: text("DEALWATCH_WEBHOOK_URL"),
            allowed_hosts: text("DEALWATCH_ALLOWED_HOSTS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|h| !h.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            selectors_path: text("DEALWATCH_SELECTORS").map(PathBuf::from),
            store_dir: text("DEALWATCH_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/deals")),
            retention_cap: number("DEALWATCH_RETENTION_CAP", 500) as usize,
            min_update_interval: Duration::from_secs(number(
                "DEALWATCH_MIN_UPDATE_INTERVAL_SECS",
                300,
            )),
            user_agent: text("DEALWATCH_USER_AGENT")
                .unwrap_or_else(|| dealwatch_storage::http::DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: number("DEALWATCH_HTTP_TIMEOUT_SECS", 20),
            detail_concurrency: number("DEALWATCH_DETAIL_CONCURRENCY", 5).max(1) as usize,
            affiliate_tag: text("DEALWATCH_AFFILIATE_TAG"),
            notify_rate_ms: number("DEALWATCH_NOTIFY_RATE_MS", 2400),
            utc_offset_minutes: text("DEALWATCH_UTC_OFFSET_MINUTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            bind_addr: text("DEALWATCH_BIND").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            store_deadlines: StoreDeadlines::default(),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            retention_cap: self.retention_cap,
            min_update_interval: self.min_update_interval,
        }
    }
}

/// Cycle policy knobs independent of any transport.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub retention_cap: usize,
    pub min_update_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            retention_cap: 500,
            min_update_interval: Duration::from_secs(300),
        }
    }
}

/// Per-stage counts for one cycle, returned to the trigger as JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub skipped: bool,
    pub scraped: usize,
    pub invalid: usize,
    pub duplicates: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub enriched: usize,
    pub enrichment_failed: usize,
    pub sent: usize,
    pub send_failed: usize,
    pub updates_sent: usize,
    pub update_failed: usize,
    pub deferred: usize,
    pub created: usize,
    pub updated: usize,
    pub conflicts_recovered: usize,
    pub write_failures: usize,
    pub trimmed: usize,
    pub degraded_read: bool,
}

impl CycleReport {
    pub fn skipped(now: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(now),
            finished_at: Some(now),
            skipped: true,
            ..Self::default()
        }
    }
}

/// One record that could not be carried through a cycle.
#[derive(Debug, Error)]
pub enum RecordFailure {
    #[error(transparent)]
    Invalid(#[from] DealInvalid),
    #[error("writing deal {id}: {source}")]
    Store {
        id: String,
        #[source]
        source: StoreError,
    },
    #[error("retention trim: {0}")]
    Trim(#[source] StoreError),
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("listing scrape failed: {0}")]
    Scrape(#[from] ScrapeError),
    #[error("{}", join_failures(.0))]
    Records(Vec<RecordFailure>),
}

fn join_failures(failures: &[RecordFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// AI-generated extras for a new deal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentSummary {
    pub summary: String,
    pub tags: Vec<String>,
}

/// Optional content enrichment for new deals. Errors are logged, never fatal.
#[async_trait]
pub trait ContentEnricher: Send + Sync {
    async fn summarize(&self, deal: &PersistedDeal) -> Result<Option<ContentSummary>>;
}

#[derive(Debug, Default)]
pub struct NoopContentEnricher;

#[async_trait]
impl ContentEnricher for NoopContentEnricher {
    async fn summarize(&self, _deal: &PersistedDeal) -> Result<Option<ContentSummary>> {
        Ok(None)
    }
}

/// Wires the production engine: HTTP scraper, file store with deadlines, webhook notifier.
pub fn build_engine(config: &SyncConfig) -> Result<ReconciliationEngine> {
    let listing_url = config
        .listing_url
        .clone()
        .context("DEALWATCH_LISTING_URL is required")?;
    let webhook_url = config
        .webhook_url
        .clone()
        .context("DEALWATCH_WEBHOOK_URL is required")?;
    let forum_host = Url::parse(&listing_url)
        .with_context(|| format!("parsing listing url {listing_url}"))?
        .host_str()
        .map(ToString::to_string)
        .context("listing url has no host")?;

    let allow_list = if config.allowed_hosts.is_empty() {
        HostAllowList::new([forum_host.as_str()])
    } else {
        HostAllowList::new(config.allowed_hosts.iter().map(String::as_str))
    };
    let offset = FixedOffset::east_opt(config.utc_offset_minutes.saturating_mul(60))
        .context("DEALWATCH_UTC_OFFSET_MINUTES out of range")?;

    let selectors = SelectorConfig::load(config.selectors_path.as_deref())
        .context("loading selector config")?;
    let referral = selectors.referral.clone().with_affiliate_tag(config.affiliate_tag.clone());

    let http = Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            allow_list,
            ..Default::default()
        })
        .context("building http client")?,
    );
    let listing = ListScraper::new(http.clone(), Arc::new(selectors.listing), listing_url, offset);
    let details = DetailEnricher::new(
        http,
        Arc::new(selectors.detail),
        Arc::new(referral),
        forum_host,
        config.detail_concurrency,
    );

    let mut webhook = WebhookConfig::new(webhook_url);
    webhook.timeout = Duration::from_secs(config.http_timeout_secs);
    webhook.rate = TokenBucketConfig {
        capacity: 1,
        refill_every: Duration::from_millis(config.notify_rate_ms),
    };
    webhook.backoff = BackoffPolicy::default();
    let notifier = WebhookNotifier::new(webhook).context("building webhook notifier")?;

    let store = DeadlineStore::new(
        FileDealStore::new(config.store_dir.clone()),
        config.store_deadlines,
    );

    Ok(ReconciliationEngine::new(
        Arc::new(listing),
        Arc::new(details),
        Arc::new(notifier),
        Arc::new(store),
        config.engine_options(),
    ))
}

pub async fn run_cycle_once_from_env() -> Result<CycleReport> {
    let config = SyncConfig::from_env();
    let engine = build_engine(&config)?;
    engine.reconcile().await.context("sync cycle failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_defaults_apply_when_unset_or_garbled() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("DEALWATCH_RETENTION_CAP", "lots"),
            ("DEALWATCH_DETAIL_CONCURRENCY", "0"),
        ]));
        assert_eq!(config.retention_cap, 500);
        assert_eq!(config.detail_concurrency, 1);
        assert_eq!(config.min_update_interval, Duration::from_secs(300));
        assert_eq!(config.notify_rate_ms, 2400);
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert!(config.webhook_url.is_none());
        assert!(config.allowed_hosts.is_empty());
    }

    #[test]
    fn config_reads_prefixed_values() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("DEALWATCH_LISTING_URL", "https://forum.test/deals"),
            ("DEALWATCH_WEBHOOK_URL", "https://hooks.test/abc"),
            ("DEALWATCH_ALLOWED_HOSTS", "forum.test, cdn.forum.test ,"),
            ("DEALWATCH_RETENTION_CAP", "50"),
            ("DEALWATCH_UTC_OFFSET_MINUTES", "540"),
            ("DEALWATCH_AFFILIATE_TAG", "  "),
        ]));
        assert_eq!(config.retention_cap, 50);
        assert_eq!(config.utc_offset_minutes, 540);
        assert_eq!(config.allowed_hosts, vec!["forum.test", "cdn.forum.test"]);
        assert_eq!(config.affiliate_tag, None);
        assert_eq!(config.engine_options().retention_cap, 50);
    }

    #[test]
    fn engine_build_requires_webhook() {
        let env = [("DEALWATCH_LISTING_URL", "https://forum.test/deals")];
        let config = SyncConfig::from_lookup(lookup(&env));
        let err = build_engine(&config).err().unwrap();
        assert!(err.to_string().contains("DEALWATCH_WEBHOOK_URL"));
    }

    #[test]
    fn engine_builds_from_complete_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::from_lookup(lookup(&[
            ("DEALWATCH_LISTING_URL", "https://forum.test/deals"),
            ("DEALWATCH_WEBHOOK_URL", "https://hooks.test/abc"),
        ]));
        config.store_dir = dir.path().join("deals");
        assert!(build_engine(&config).is_ok());
    }

    #[test]
    fn record_failures_join_with_semicolons() {
        let err = CycleError::Records(vec![
            RecordFailure::Store {
                id: "a".into(),
                source: StoreError::NotFound { id: "a".into() },
            },
            RecordFailure::Trim(StoreError::NotFound { id: "b".into() }),
        ]);
        assert_eq!(
            err.to_string(),
            "writing deal a: deal a not found; retention trim: deal b not found"
        );
    }
}

//! Listing page scraping.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use dealwatch_core::CandidateDeal;
use dealwatch_storage::HttpFetcher;
use scraper::{ElementRef, Html};
use tracing::{debug, info};
use url::Url;

use crate::selectors::ListingSelectors;
use crate::{ListingSource, ScrapeError};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y.%m.%d %H:%M:%S",
    "%Y.%m.%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%y.%m.%d %H:%M:%S",
    "%y/%m/%d %H:%M:%S",
];

/// Parses a counter such as `1,234`, `(7)`, `2.5k` or `3M`. Anything unreadable counts as zero.
pub fn parse_count(raw: &str) -> u64 {
    let Some(start) = raw.find(|c: char| c.is_ascii_digit()) else {
        return 0;
    };
    let rest = &raw[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == ',' || c == '.'))
        .unwrap_or(rest.len());
    let number: String = rest[..end].chars().filter(|c| *c != ',').collect();
    let multiplier = match rest[end..].trim_start().chars().next() {
        Some('k' | 'K') => 1_000.0,
        Some('m' | 'M') => 1_000_000.0,
        _ => 1.0,
    };
    number
        .trim_end_matches('.')
        .parse::<f64>()
        .map(|n| (n * multiplier).round() as u64)
        .unwrap_or(0)
}

/// Parses a publish stamp: RFC 3339, unix seconds/millis, or a naive local time in `offset`.
pub fn parse_published(raw: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        let n: i64 = raw.parse().ok()?;
        return match raw.len() {
            13 => Utc.timestamp_millis_opt(n).single(),
            9 | 10 => Utc.timestamp_opt(n, 0).single(),
            _ => None,
        };
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS.iter().find_map(|fmt| {
        NaiveDateTime::parse_from_str(raw, fmt)
            .ok()
            .and_then(|naive| offset.from_local_datetime(&naive).single())
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn resolve(base: &Url, href: Option<String>) -> String {
    href.and_then(|h| base.join(&h).ok())
        .map(|u| u.to_string())
        .unwrap_or_default()
}

fn parse_item(
    item: ElementRef<'_>,
    base: &Url,
    selectors: &ListingSelectors,
    offset: FixedOffset,
) -> CandidateDeal {
    CandidateDeal {
        id: String::new(),
        title: selectors.title.extract(item).unwrap_or_default(),
        url: resolve(base, selectors.url.extract(item)),
        author_name: selectors.author_name.extract(item).unwrap_or_default(),
        author_url: resolve(base, selectors.author_url.extract(item)),
        thumbnail_url: resolve(base, selectors.thumbnail.extract(item)),
        like_count: selectors.likes.extract(item).map(|s| parse_count(&s)).unwrap_or(0),
        comment_count: selectors.comments.extract(item).map(|s| parse_count(&s)).unwrap_or(0),
        view_count: selectors.views.extract(item).map(|s| parse_count(&s)).unwrap_or(0),
        published_at: selectors
            .published
            .extract(item)
            .and_then(|s| parse_published(&s, offset)),
        merchant_url: None,
        content: None,
    }
}

/// Parses a listing document into candidates in page order.
///
/// Ignored items (pinned, sponsored) are skipped. Every other row is returned as found, including
/// rows that will fail `validate()`, so the caller can report them.
pub fn parse_listing(
    html: &str,
    base: &Url,
    selectors: &ListingSelectors,
    offset: FixedOffset,
) -> Vec<CandidateDeal> {
    let document = Html::parse_document(html);
    let Some(items) = selectors
        .item
        .iter()
        .map(|sel| document.select(sel).collect::<Vec<_>>())
        .find(|items| !items.is_empty())
    else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(items.len());
    let mut ignored = 0usize;
    for item in items {
        if selectors.ignore.iter().any(|sel| sel.matches(&item)) {
            ignored += 1;
            continue;
        }
        out.push(parse_item(item, base, selectors, offset));
    }
    debug!(rows = out.len(), ignored, "listing parsed");
    out
}

/// Fetches the configured listing page and parses it.
#[derive(Debug, Clone)]
pub struct ListScraper {
    http: Arc<HttpFetcher>,
    selectors: Arc<ListingSelectors>,
    listing_url: String,
    offset: FixedOffset,
}

impl ListScraper {
    pub fn new(
        http: Arc<HttpFetcher>,
        selectors: Arc<ListingSelectors>,
        listing_url: impl Into<String>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            http,
            selectors,
            listing_url: listing_url.into(),
            offset,
        }
    }
}

#[async_trait]
impl ListingSource for ListScraper {
    async fn scrape_list(&self) -> Result<Vec<CandidateDeal>, ScrapeError> {
        let page = self.http.fetch_text(&self.listing_url).await?;
        let base = Url::parse(&page.final_url).map_err(|e| ScrapeError::InvalidUrl {
            url: page.final_url.clone(),
            reason: e.to_string(),
        })?;
        let deals = parse_listing(&page.body, &base, &self.selectors, self.offset);
        info!(count = deals.len(), url = self.listing_url.as_str(), "listing scraped");
        Ok(deals)
    }
}

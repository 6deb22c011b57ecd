//! Detail page enrichment.

use std::sync::Arc;

use async_trait::async_trait;
use dealwatch_core::CandidateDeal;
use dealwatch_storage::HttpFetcher;
use futures::stream::{self, StreamExt};
use scraper::Html;
use tracing::{debug, warn};
use url::Url;

use crate::referral::{host_matches, ReferralRules};
use crate::selectors::{collapse_whitespace, DetailSelectors};
use crate::{DetailSource, EnrichmentReport, ScrapeError};

const MAX_CONTENT_CHARS: usize = 4000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailInfo {
    pub merchant_url: Option<String>,
    pub content: Option<String>,
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

fn absolute_external(base: &Url, href: &str, forum_host: &str) -> Option<Url> {
    let url = base.join(href.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?;
    (!host_matches(host, forum_host)).then_some(url)
}

/// Extracts the merchant link and post body from a detail document.
///
/// The dedicated deal-link chain wins. Otherwise the first absolute http(s) link in the post body
/// that leaves the forum's own domain is taken.
pub fn parse_detail(
    html: &str,
    base: &Url,
    selectors: &DetailSelectors,
    forum_host: &str,
) -> DetailInfo {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let merchant_url = selectors
        .deal_link
        .extract(root)
        .and_then(|href| base.join(&href).ok())
        .map(|u| u.to_string())
        .or_else(|| {
            selectors.fallback_link.iter().find_map(|sel| {
                document.select(sel).find_map(|node| {
                    let href = node.value().attr("href")?;
                    absolute_external(base, href, forum_host).map(|u| u.to_string())
                })
            })
        });

    let content = selectors
        .content
        .extract(root)
        .map(|text| truncate_chars(&collapse_whitespace(&text), MAX_CONTENT_CHARS))
        .filter(|text| !text.is_empty());

    DetailInfo { merchant_url, content }
}

/// Visits detail pages with bounded parallelism.
#[derive(Debug, Clone)]
pub struct DetailEnricher {
    http: Arc<HttpFetcher>,
    selectors: Arc<DetailSelectors>,
    referral: Arc<ReferralRules>,
    forum_host: String,
    concurrency: usize,
}

impl DetailEnricher {
    pub fn new(
        http: Arc<HttpFetcher>,
        selectors: Arc<DetailSelectors>,
        referral: Arc<ReferralRules>,
        forum_host: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            http,
            selectors,
            referral,
            forum_host: forum_host.into(),
            concurrency: concurrency.max(1),
        }
    }

    async fn fetch_one(&self, url: &str) -> Result<DetailInfo, ScrapeError> {
        let page = self.http.fetch_text_once(url).await?;
        let base = Url::parse(&page.final_url).map_err(|e| ScrapeError::InvalidUrl {
            url: page.final_url.clone(),
            reason: e.to_string(),
        })?;
        let mut info = parse_detail(&page.body, &base, &self.selectors, &self.forum_host);
        info.merchant_url = info.merchant_url.map(|link| self.referral.clean(&link));
        Ok(info)
    }
}

#[async_trait]
impl DetailSource for DetailEnricher {
    async fn fetch_details(&self, deals: &mut [CandidateDeal]) -> EnrichmentReport {
        let jobs: Vec<(usize, String)> = deals.iter().map(|d| d.url.clone()).enumerate().collect();
        let results: Vec<(usize, Result<DetailInfo, ScrapeError>)> = stream::iter(jobs)
            .map(|(idx, url)| async move { (idx, self.fetch_one(&url).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = EnrichmentReport::default();
        for (idx, result) in results {
            let deal = &mut deals[idx];
            match result {
                Ok(info) => {
                    if info.merchant_url.is_some() {
                        deal.merchant_url = info.merchant_url;
                    }
                    if info.content.is_some() {
                        deal.content = info.content;
                    }
                    report.resolved += 1;
                }
                Err(err) => {
                    warn!(
                        id = deal.id.as_str(),
                        url = deal.url.as_str(),
                        error = %err,
                        "detail fetch failed"
                    );
                    report.failed_ids.push(deal.id.clone());
                }
            }
        }
        report.failed_ids.sort();
        debug!(
            resolved = report.resolved,
            failed = report.failed_ids.len(),
            "detail pass finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selectors::SelectorConfig;
    use dealwatch_storage::{HostAllowList, HttpClientConfig};

    fn detail_selectors() -> DetailSelectors {
        SelectorConfig::default().compile().unwrap().detail
    }

    #[test]
    fn dedicated_deal_link_wins() {
        let html = r#"<a class="get-deal" href="https://shop.example/p/1">Buy</a>
            <div class="post-content"><a href="https://other.example/x">x</a> Great   price</div>"#;
        let base = Url::parse("https://forum.test/deals/1").unwrap();
        let info = parse_detail(html, &base, &detail_selectors(), "forum.test");
        assert_eq!(info.merchant_url.as_deref(), Some("https://shop.example/p/1"));
        assert_eq!(info.content.as_deref(), Some("x Great price"));
    }

    #[test]
    fn fallback_skips_forum_and_relative_links() {
        let html = r#"<div class="post-content">
              <a href="/members/alice">alice</a>
              <a href="https://cdn.forum.test/img.png">img</a>
              <a href="mailto:deals@forum.test">mail</a>
              <a href="https://shop.example/p/2">shop</a>
            </div>"#;
        let base = Url::parse("https://forum.test/deals/2").unwrap();
        let info = parse_detail(html, &base, &detail_selectors(), "forum.test");
        assert_eq!(info.merchant_url.as_deref(), Some("https://shop.example/p/2"));
    }

    #[test]
    fn page_without_links_or_body_yields_nothing() {
        let base = Url::parse("https://forum.test/deals/3").unwrap();
        let info = parse_detail("<p>deleted</p>", &base, &detail_selectors(), "forum.test");
        assert_eq!(info, DetailInfo::default());
    }

    #[test]
    fn content_is_bounded() {
        let body = "word ".repeat(2000);
        let html = format!(r#"<div class="post-content">{body}</div>"#);
        let base = Url::parse("https://forum.test/deals/4").unwrap();
        let info = parse_detail(&html, &base, &detail_selectors(), "forum.test");
        assert_eq!(info.content.unwrap().chars().count(), MAX_CONTENT_CHARS);
    }

    #[tokio::test]
    async fn refused_fetches_are_reported_per_record() {
        let http = HttpFetcher::new(HttpClientConfig {
            allow_list: HostAllowList::new(["forum.test"]),
            ..Default::default()
        })
        .unwrap();
        let enricher = DetailEnricher::new(
            Arc::new(http),
            Arc::new(detail_selectors()),
            Arc::new(ReferralRules::default()),
            "forum.test",
            2,
        );
        let mut deals = vec![
            CandidateDeal {
                id: "b".into(),
                url: "https://elsewhere.test/deals/2".into(),
                ..CandidateDeal::default()
            },
            CandidateDeal {
                id: "a".into(),
                url: "ftp://forum.test/deals/1".into(),
                ..CandidateDeal::default()
            },
        ];
        let report = enricher.fetch_details(&mut deals).await;
        assert_eq!(report.resolved, 0);
        assert_eq!(report.failed_ids, vec!["a", "b"]);
        assert!(deals.iter().all(|d| d.merchant_url.is_none()));
    }
}

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::FixedOffset;
use dealwatch_core::CandidateDeal;
use dealwatch_scrape::{
    DetailEnricher, DetailSource, ListScraper, ListingSource, ReferralRules, ScrapeError,
    SelectorConfig,
};
use dealwatch_storage::{BackoffPolicy, FetchError, HostAllowList, HttpClientConfig, HttpFetcher};

fn read(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/forum").join(name);
    std::fs::read_to_string(path).unwrap()
}

struct Forum {
    listing_statuses: Vec<u16>,
    listing_hits: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    detail_delay: Duration,
}

impl Forum {
    fn new(listing_statuses: Vec<u16>) -> Arc<Self> {
        Arc::new(Self {
            listing_statuses,
            listing_hits: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            detail_delay: Duration::from_millis(100),
        })
    }
}

async fn listing(State(forum): State<Arc<Forum>>) -> Response {
    let n = forum.listing_hits.fetch_add(1, Ordering::SeqCst);
    let status = forum.listing_statuses[n.min(forum.listing_statuses.len() - 1)];
    if status == 200 {
        Html(read("listing.html")).into_response()
    } else {
        StatusCode::from_u16(status).unwrap().into_response()
    }
}

async fn detail(State(forum): State<Arc<Forum>>) -> Html<String> {
    let now = forum.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    forum.peak.fetch_max(now, Ordering::SeqCst);
    tokio::time::sleep(forum.detail_delay).await;
    forum.in_flight.fetch_sub(1, Ordering::SeqCst);
    Html(read("detail.html"))
}

async fn serve(forum: Arc<Forum>) -> SocketAddr {
    let app = Router::new()
        .route("/deals", get(listing))
        .route("/deals/{id}", get(detail))
        .with_state(forum);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn fetcher() -> Arc<HttpFetcher> {
    let http = HttpFetcher::new(HttpClientConfig {
        allow_list: HostAllowList::new(["127.0.0.1"]),
        backoff: BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        ..Default::default()
    })
    .unwrap();
    Arc::new(http)
}

fn scraper(addr: SocketAddr) -> ListScraper {
    let selectors = SelectorConfig::default().compile().unwrap();
    ListScraper::new(
        fetcher(),
        Arc::new(selectors.listing),
        format!("http://{addr}/deals"),
        FixedOffset::east_opt(9 * 3600).unwrap(),
    )
}

#[tokio::test]
async fn listing_recovers_after_transient_server_errors() {
    let forum = Forum::new(vec![500, 500, 200]);
    let addr = serve(forum.clone()).await;

    let rows = scraper(addr).scrape_list().await.unwrap();
    assert_eq!(forum.listing_hits.load(Ordering::SeqCst), 3);
    let valid: Vec<&CandidateDeal> = rows.iter().filter(|d| d.validate().is_empty()).collect();
    assert_eq!(valid.len(), 2);
    assert_eq!(valid[0].url, format!("http://{addr}/deals/101"));
}

#[tokio::test]
async fn listing_gives_up_after_three_retries() {
    let forum = Forum::new(vec![503]);
    let addr = serve(forum.clone()).await;

    let err = scraper(addr).scrape_list().await.unwrap_err();
    assert!(
        matches!(err, ScrapeError::Fetch(FetchError::HttpStatus { status: 503, .. })),
        "unexpected error: {err}"
    );
    assert_eq!(forum.listing_hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn listing_client_errors_are_not_retried() {
    let forum = Forum::new(vec![404, 200]);
    let addr = serve(forum.clone()).await;

    assert!(scraper(addr).scrape_list().await.is_err());
    assert_eq!(forum.listing_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn detail_fan_out_respects_concurrency_ceiling() {
    let forum = Forum::new(vec![200]);
    let addr = serve(forum.clone()).await;
    let selectors = SelectorConfig::default().compile().unwrap();
    let enricher = DetailEnricher::new(
        fetcher(),
        Arc::new(selectors.detail),
        Arc::new(ReferralRules::default()),
        "127.0.0.1",
        2,
    );

    let mut deals: Vec<CandidateDeal> = (1..=6)
        .map(|n| CandidateDeal {
            id: format!("deal-{n}"),
            url: format!("http://{addr}/deals/{n}"),
            ..CandidateDeal::default()
        })
        .collect();
    let report = enricher.fetch_details(&mut deals).await;

    assert_eq!(report.resolved, 6);
    assert!(report.failed_ids.is_empty());
    assert_eq!(forum.peak.load(Ordering::SeqCst), 2);
    assert_eq!(forum.in_flight.load(Ordering::SeqCst), 0);
    assert!(deals.iter().all(|d| d.merchant_url.is_some() && d.content.is_some()));
}

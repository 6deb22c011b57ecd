//! Outbound HTTP plumbing shared by the scraper and the webhook client.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};
use url::Url;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
pub const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available and consumes it.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            if self.refill_every.is_zero() {
                return;
            }
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos())
                    .min(u32::MAX as u128) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self
                .refill_every
                .saturating_sub(state.last_refill.elapsed())
                .max(Duration::from_millis(1));
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Exact-match host allow-list for outbound fetches.
#[derive(Debug, Clone, Default)]
pub struct HostAllowList {
    hosts: Arc<BTreeSet<String>>,
}

impl HostAllowList {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|h| normalize_host(h.as_ref()))
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            hosts: Arc::new(hosts),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn allows_host(&self, host: &str) -> bool {
        self.hosts.contains(&normalize_host(host))
    }

    /// Parses `raw` and rejects it unless it is http(s) with a listed host.
    pub fn check(&self, raw: &str) -> Result<Url, FetchError> {
        let url = Url::parse(raw).map_err(|e| FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("scheme {} is not fetchable", url.scheme()),
            });
        }
        let host = url.host_str().ok_or_else(|| FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        })?;
        if !self.allows_host(host) {
            return Err(FetchError::HostNotAllowed {
                host: host.to_string(),
            });
        }
        Ok(url)
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub accept: String,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub allow_list: HostAllowList,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept: DEFAULT_ACCEPT.to_string(),
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
            allow_list: HostAllowList::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("host {host} is not in the fetch allow-list")]
    HostNotAllowed { host: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid client configuration: {0}")]
    Config(String),
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

/// Allow-listed GET client with fixed headers, a global concurrency cap and retry/backoff.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    allow_list: HostAllowList,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        let accept = HeaderValue::from_str(&config.accept)
            .map_err(|e| FetchError::Config(format!("accept header: {e}")))?;
        headers.insert(ACCEPT, accept);

        // Redirects may only land on allow-listed hosts.
        let redirect_allow = config.allow_list.clone();
        let redirect = reqwest::redirect::Policy::custom(move |attempt| {
            let allowed = attempt
                .url()
                .host_str()
                .is_some_and(|host| redirect_allow.allows_host(host));
            if !allowed {
                attempt.stop()
            } else if attempt.previous().len() >= 5 {
                attempt.error("too many redirects")
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .redirect(redirect)
            .build()?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            allow_list: config.allow_list,
            backoff: config.backoff,
        })
    }

    /// GET with retries on transient failures.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch(url, self.backoff.max_retries).await
    }

    /// Single-attempt GET.
    pub async fn fetch_text_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch(url, 0).await
    }

    async fn fetch(&self, url: &str, max_retries: usize) -> Result<FetchedPage, FetchError> {
        let target = self.allow_list.check(url)?;
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", url = %target);
        async move {
            let mut attempt = 0usize;
            loop {
                match self.client.get(target.clone()).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.text().await?;
                            return Ok(FetchedPage {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < max_retries
                        {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            warn!(status = status.as_u16(), attempt, ?delay, "retrying fetch");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < max_retries
                        {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            warn!(error = %err, attempt, ?delay, "retrying fetch");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::header::LOCATION;
    use axum::routing::get;
    use axum::Router;

    #[test]
    fn backoff_doubles_from_one_second() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn allow_list_rejects_unlisted_hosts_and_schemes() {
        let list = HostAllowList::new(["Forum.Test", "cdn.forum.test."]);
        assert!(list.check("https://forum.test/deals?page=1").is_ok());
        assert!(list.check("http://cdn.forum.test/img.png").is_ok());
        assert!(matches!(
            list.check("https://evil.test/"),
            Err(FetchError::HostNotAllowed { host }) if host == "evil.test"
        ));
        assert!(matches!(
            list.check("https://sub.forum.test/"),
            Err(FetchError::HostNotAllowed { .. })
        ));
        assert!(matches!(list.check("file:///etc/passwd"), Err(FetchError::InvalidUrl { .. })));
        assert!(matches!(list.check("not a url"), Err(FetchError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn fetcher_refuses_before_any_network_io() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            allow_list: HostAllowList::new(["forum.test"]),
            ..Default::default()
        })
        .unwrap();
        let err = fetcher.fetch_text("https://127.0.0.1:9/").await.unwrap_err();
        assert!(matches!(err, FetchError::HostNotAllowed { .. }));
    }

    async fn redirecting_server() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let landed = Arc::new(AtomicUsize::new(0));
        let counter = landed.clone();
        let outside = format!("http://localhost:{}/landing", addr.port());
        let inside = format!("http://127.0.0.1:{}/landing", addr.port());
        let app = Router::new()
            .route(
                "/away",
                get(move || {
                    let location = outside.clone();
                    async move { (axum::http::StatusCode::FOUND, [(LOCATION, location)]) }
                }),
            )
            .route(
                "/hop",
                get(move || {
                    let location = inside.clone();
                    async move { (axum::http::StatusCode::FOUND, [(LOCATION, location)]) }
                }),
            )
            .route(
                "/landing",
                get(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { "landed" }
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, landed)
    }

    #[tokio::test]
    async fn redirects_stop_at_unlisted_hosts() {
        let (addr, landed) = redirecting_server().await;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            allow_list: HostAllowList::new(["127.0.0.1"]),
            ..Default::default()
        })
        .unwrap();

        let err = fetcher
            .fetch_text(&format!("http://127.0.0.1:{}/away", addr.port()))
            .await
            .unwrap_err();
        assert!(
            matches!(err, FetchError::HttpStatus { status: 302, .. }),
            "unexpected error: {err}"
        );
        assert_eq!(landed.load(Ordering::SeqCst), 0);

        let page = fetcher
            .fetch_text(&format!("http://127.0.0.1:{}/hop", addr.port()))
            .await
            .unwrap();
        assert_eq!(page.body, "landed");
        assert!(page.final_url.ends_with("/landing"));
        assert_eq!(landed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_spaces_out_takes() {
        let bucket = TokenBucket::new(TokenBucketConfig {
            capacity: 1,
            refill_every: Duration::from_millis(2400),
        });
        let start = tokio::time::Instant::now();
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_millis(10));
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(2400));
    }
}

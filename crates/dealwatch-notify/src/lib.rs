//! Webhook delivery for deal notifications.

use std::time::Duration;

use async_trait::async_trait;
use dealwatch_core::PersistedDeal;
use dealwatch_storage::http::{classify_reqwest_error, classify_status};
use dealwatch_storage::{BackoffPolicy, RetryDisposition, TokenBucket, TokenBucketConfig};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;

pub mod embed;

pub use embed::{heat_score, render_embed, render_payload, Embed, HeatTier, WebhookPayload};

const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid webhook url: {0}")]
    InvalidWebhook(String),
    #[error("webhook rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("webhook gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: String },
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook response missing message id: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Outbound notification channel. Implementations own their pacing and retries.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Publishes a new message and returns its identifier.
    async fn send(&self, deal: &PersistedDeal) -> Result<String, NotifyError>;

    /// Edits a previously published message. Empty ids are ignored.
    async fn update(&self, message_id: &str, deal: &PersistedDeal) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout: Duration,
    pub rate: TokenBucketConfig,
    pub backoff: BackoffPolicy,
    pub user_agent: String,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(15),
            rate: TokenBucketConfig {
                capacity: 1,
                refill_every: Duration::from_millis(2400),
            },
            backoff: BackoffPolicy::default(),
            user_agent: format!("dealwatch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

/// Hints that are negative, NaN or too large for a `Duration` are ignored.
fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

/// Server-provided wait: the `Retry-After` header first, then a JSON `retry_after` field.
pub fn retry_after_hint(headers: &HeaderMap, body: &str) -> Option<Duration> {
    let from_header = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(seconds);
    from_header.or_else(|| {
        serde_json::from_str::<RateLimitBody>(body)
            .ok()
            .and_then(|b| b.retry_after)
            .and_then(seconds)
    })
}

fn clip(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Webhook client: token-bucket pacing per attempt, retry on 5xx/429/transport errors.
#[derive(Debug)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook: Url,
    bucket: TokenBucket,
    backoff: BackoffPolicy,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self, NotifyError> {
        let webhook =
            Url::parse(&config.url).map_err(|e| NotifyError::InvalidWebhook(e.to_string()))?;
        if webhook.cannot_be_a_base() || !matches!(webhook.scheme(), "http" | "https") {
            return Err(NotifyError::InvalidWebhook(format!("unsupported url {}", config.url)));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self {
            client,
            webhook,
            bucket: TokenBucket::new(config.rate),
            backoff: config.backoff,
        })
    }

    fn create_url(&self) -> Url {
        let mut url = self.webhook.clone();
        url.query_pairs_mut().append_pair("wait", "true");
        url
    }

    fn message_url(&self, message_id: &str) -> Result<Url, NotifyError> {
        let mut url = self.webhook.clone();
        url.path_segments_mut()
            .map_err(|_| NotifyError::InvalidWebhook(self.webhook.to_string()))?
            .pop_if_empty()
            .push("messages")
            .push(message_id);
        Ok(url)
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        payload: &WebhookPayload,
    ) -> Result<String, NotifyError> {
        let max_attempts = self.backoff.max_retries + 1;
        let mut last = String::new();

        for attempt in 0..max_attempts {
            self.bucket.take().await;
            let request = self.client.request(method.clone(), url.clone()).json(payload);
            let delay = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let headers = resp.headers().clone();
                    if status.is_success() {
                        // A truncated 2xx body is a transport failure, not a decode failure.
                        return Ok(resp.text().await?);
                    }
                    let body = match resp.text().await {
                        Ok(body) => body,
                        Err(err) => {
                            debug!(error = %err, status = status.as_u16(), "error body unreadable");
                            String::new()
                        }
                    };
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(NotifyError::Rejected {
                            status: status.as_u16(),
                            body: clip(&body),
                        });
                    }
                    last = format!("status {}", status.as_u16());
                    retry_after_hint(&headers, &body)
                        .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt))
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(NotifyError::Request(err));
                    }
                    last = err.to_string();
                    self.backoff.delay_for_attempt(attempt)
                }
            };

            if attempt + 1 < max_attempts {
                warn!(attempt, ?delay, last = last.as_str(), "webhook attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }

        Err(NotifyError::RetriesExhausted {
            attempts: max_attempts,
            last,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, deal: &PersistedDeal) -> Result<String, NotifyError> {
        let payload = render_payload(deal);
        let span = info_span!("webhook_send", deal_id = deal.id.as_str());
        async move {
            let body = self.execute(Method::POST, self.create_url(), &payload).await?;
            let message: MessageRef = serde_json::from_str(&body).map_err(NotifyError::Decode)?;
            debug!(message_id = message.id.as_str(), "notification created");
            Ok(message.id)
        }
        .instrument(span)
        .await
    }

    async fn update(&self, message_id: &str, deal: &PersistedDeal) -> Result<(), NotifyError> {
        if message_id.is_empty() {
            return Ok(());
        }
        let payload = render_payload(deal);
        let url = self.message_url(message_id)?;
        let span = info_span!("webhook_update", deal_id = deal.id.as_str(), message_id);
        async move {
            self.execute(Method::PATCH, url, &payload).await?;
            debug!("notification updated");
            Ok(())
        }
        .instrument(span)
        .await
    }
}

/// True for failures worth retrying on a later cycle.
pub fn is_transient(err: &NotifyError) -> bool {
    match err {
        NotifyError::RetriesExhausted { .. } => true,
        NotifyError::Request(e) => classify_reqwest_error(e) == RetryDisposition::Retryable,
        NotifyError::Rejected { status, .. } => StatusCode::from_u16(*status)
            .map(|s| classify_status(s) == RetryDisposition::Retryable)
            .unwrap_or(false),
        NotifyError::InvalidWebhook(_) | NotifyError::Decode(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{header, HeaderValue, Uri};
    use axum::response::{IntoResponse, Response};
    use axum::routing::any;
    use axum::Router;
    use chrono::{TimeZone, Utc};
    use dealwatch_core::CandidateDeal;

    struct Script {
        responses: Vec<Scripted>,
        hits: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    async fn scripted(
        State(script): State<Arc<Script>>,
        method: axum::http::Method,
        uri: Uri,
    ) -> Response {
        let n = script.hits.fetch_add(1, Ordering::SeqCst);
        script.seen.lock().unwrap().push(format!("{method} {uri}"));
        let (status, retry_after, body) = script.responses[n.min(script.responses.len() - 1)];
        let mut headers = axum::http::HeaderMap::new();
        if let Some(value) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from_static(value));
        }
        (axum::http::StatusCode::from_u16(status).unwrap(), headers, body).into_response()
    }

    type Scripted = (u16, Option<&'static str>, &'static str);

    async fn spawn(responses: Vec<Scripted>) -> (WebhookNotifier, Arc<Script>) {
        let script = Arc::new(Script {
            responses,
            hits: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/hook", any(scripted))
            .route("/hook/messages/{id}", any(scripted))
            .with_state(script.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = WebhookConfig::new(format!("http://{addr}/hook"));
        config.rate = TokenBucketConfig {
            capacity: 1,
            refill_every: Duration::ZERO,
        };
        config.backoff = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        };
        (WebhookNotifier::new(config).unwrap(), script)
    }

    fn deal() -> PersistedDeal {
        let candidate = CandidateDeal {
            title: "Portable SSD".to_string(),
            url: "https://forum.test/deals/101".to_string(),
            published_at: Utc.with_ymd_and_hms(2026, 10, 15, 9, 30, 0).single(),
            ..CandidateDeal::default()
        };
        PersistedDeal::from_candidate(&candidate, Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let (notifier, script) = spawn(vec![
            (500, None, ""),
            (500, None, ""),
            (200, None, r#"{"id":"m-1"}"#),
        ])
        .await;
        let id = notifier.send(&deal()).await.unwrap();
        assert_eq!(id, "m-1");
        assert_eq!(script.hits.load(Ordering::SeqCst), 3);
        assert!(script.seen.lock().unwrap()[0].starts_with("POST /hook?wait=true"));
    }

    #[tokio::test]
    async fn client_errors_fail_after_one_attempt() {
        let (notifier, script) = spawn(vec![(400, None, "bad embed")]).await;
        let err = notifier.send(&deal()).await.unwrap_err();
        assert!(matches!(
            err,
            NotifyError::Rejected { status: 400, ref body } if body == "bad embed"
        ));
        assert_eq!(script.hits.load(Ordering::SeqCst), 1);
        assert!(!is_transient(&err));
    }

    #[tokio::test]
    async fn rate_limits_honor_server_hints() {
        let (notifier, script) = spawn(vec![
            (429, Some("0.01"), ""),
            (429, None, r#"{"retry_after": 0.01}"#),
            (200, None, r#"{"id":"m-2"}"#),
        ])
        .await;
        assert_eq!(notifier.send(&deal()).await.unwrap(), "m-2");
        assert_eq!(script.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_failures_exhaust_retries() {
        let (notifier, script) = spawn(vec![(503, None, "")]).await;
        let err = notifier.send(&deal()).await.unwrap_err();
        assert!(matches!(err, NotifyError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(script.hits.load(Ordering::SeqCst), 4);
        assert!(is_transient(&err));
    }

    #[tokio::test]
    async fn update_patches_message_and_skips_empty_ids() {
        let (notifier, script) = spawn(vec![(200, None, "{}")]).await;
        notifier.update("", &deal()).await.unwrap();
        assert_eq!(script.hits.load(Ordering::SeqCst), 0);

        notifier.update("m-1", &deal()).await.unwrap();
        assert_eq!(script.seen.lock().unwrap().as_slice(), ["PATCH /hook/messages/m-1"]);
    }

    #[test]
    fn retry_hint_prefers_header_then_body() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            retry_after_hint(&headers, r#"{"retry_after": 1.5}"#),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(retry_after_hint(&headers, "not json"), None);
        headers.insert(RETRY_AFTER, reqwest::header::HeaderValue::from_static("2"));
        assert_eq!(
            retry_after_hint(&headers, r#"{"retry_after": 9}"#),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn out_of_range_hints_fall_back_to_backoff() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, reqwest::header::HeaderValue::from_static("1e30"));
        assert_eq!(retry_after_hint(&headers, ""), None);
        assert_eq!(retry_after_hint(&HeaderMap::new(), r#"{"retry_after": 1e300}"#), None);
        assert_eq!(retry_after_hint(&HeaderMap::new(), r#"{"retry_after": -1}"#), None);
    }

    #[tokio::test]
    async fn absurd_rate_limit_hint_does_not_abort_delivery() {
        let (notifier, script) = spawn(vec![
            (429, Some("1e30"), ""),
            (429, None, r#"{"retry_after": 1e300}"#),
            (200, None, r#"{"id":"m-3"}"#),
        ])
        .await;
        assert_eq!(notifier.send(&deal()).await.unwrap(), "m-3");
        assert_eq!(script.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn truncated_success_body_is_a_request_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let server_hits = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                server_hits.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    request.extend_from_slice(&buf[..n]);
                    let text = String::from_utf8_lossy(&request).to_ascii_lowercase();
                    if let Some(end) = text.find("\r\n\r\n") {
                        let length = text[..end]
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        if request.len() >= end + 4 + length || n == 0 {
                            break;
                        }
                    } else if n == 0 {
                        break;
                    }
                }
                let truncated: &[u8] = b"HTTP/1.1 200 OK\r\n\
                    content-type: application/json\r\n\
                    content-length: 64\r\n\r\n\
                    {\"id\":";
                socket.write_all(truncated).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });

        let mut config = WebhookConfig::new(format!("http://{addr}/hook"));
        config.rate.refill_every = Duration::ZERO;
        let notifier = WebhookNotifier::new(config).unwrap();
        let err = notifier.send(&deal()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Request(_)), "unexpected error: {err}");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_webhook_urls_are_rejected() {
        assert!(matches!(
            WebhookNotifier::new(WebhookConfig::new("mailto:ops@example.com")),
            Err(NotifyError::InvalidWebhook(_))
        ));
        assert!(WebhookNotifier::new(WebhookConfig::new("not a url")).is_err());
    }
}

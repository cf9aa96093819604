use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{header, Client, StatusCode};
use std::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

use super::provider::{FeedError, SpinFeed};

/// Outcome filter sent upstream; `CrazyBonus` is the wire name of Crazy Time.
const WHEEL_RESULTS: &str = "Pachinko,CashHunt,CrazyBonus,CoinFlip,1,2,5,10";

/// Attempt ceiling and backoff steps for one page request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait after a 429 is `attempt × rate_limit_step`.
    pub rate_limit_step: Duration,
    /// Wait after a timeout, transport error or other non-2xx is `attempt × failure_step`.
    pub failure_step: Duration,
    /// Upper bound of random jitter added to failure waits.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            rate_limit_step: Duration::from_secs(5),
            failure_step: Duration::from_secs(2),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn rate_limit_backoff(&self, attempt: u32) -> Duration {
        self.rate_limit_step * attempt
    }

    fn failure_backoff(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.failure_step * attempt + Duration::from_millis(jitter)
    }
}

/// HTTP client for the paginated spin history endpoint.
#[derive(Clone)]
pub struct FeedClient {
    http: Client,
    base_url: Url,
    table_id: String,
    policy: RetryPolicy,
}

impl FeedClient {
    pub fn new(base_url: &str, table_id: &str, timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            header::HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(
            header::REFERER,
            header::HeaderValue::from_static("https://casinoscores.com/"),
        );
        headers.insert(
            header::ORIGIN,
            header::HeaderValue::from_static("https://casinoscores.com"),
        );
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (Linux; Android 15; Mobile; rv:121.0) Gecko/121.0 Firefox/121.0")
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("Invalid feed URL {}", base_url))?;
        Ok(FeedClient {
            http,
            base_url,
            table_id: table_id.to_string(),
            policy,
        })
    }

    fn page_url(&self, page: u32, size: u32) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("size", &size.to_string())
            .append_pair("sort", "data.settledAt,desc")
            .append_pair("duration", "6")
            .append_pair("wheelResults", WHEEL_RESULTS)
            .append_pair("isTopSlotMatched", "true,false")
            .append_pair("tableId", &self.table_id);
        url
    }

    async fn request_once(&self, url: &Url) -> Result<Vec<serde_json::Value>, FeedError> {
        let resp = self.http.get(url.clone()).send().await?;
        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(FeedError::RateLimited),
            s if !s.is_success() => return Err(FeedError::Status(s.as_u16())),
            _ => {}
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| FeedError::Decode(e.to_string()))?;
        match body {
            serde_json::Value::Array(items) => Ok(items),
            other => Err(FeedError::Decode(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            ))),
        }
    }
}

#[async_trait]
impl SpinFeed for FeedClient {
    fn name(&self) -> &str {
        "casinoscores"
    }

    async fn fetch_page(&self, page: u32, size: u32) -> Result<Vec<serde_json::Value>, FeedError> {
        let url = self.page_url(page, size);
        let max = self.policy.max_attempts.max(1);

        for attempt in 1..=max {
            if attempt > 1 {
                debug!("Feed request attempt {}/{} (page {})", attempt, max, page);
            }
            match self.request_once(&url).await {
                Ok(records) => return Ok(records),
                Err(FeedError::RateLimited) => {
                    let wait = self.policy.rate_limit_backoff(attempt);
                    warn!("Feed rate limited (429) on page {}, waiting {:?}", page, wait);
                    if attempt < max {
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(e) => {
                    warn!("Feed error on page {} ({}), retrying", page, e);
                    if attempt < max {
                        tokio::time::sleep(self.policy.failure_backoff(attempt)).await;
                    }
                }
            }
        }

        error!("Feed: page {} failed after {} attempts", page, max);
        Err(FeedError::Exhausted {
            page,
            attempts: max,
        })
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            rate_limit_step: Duration::from_millis(5),
            failure_step: Duration::from_millis(5),
            max_jitter: Duration::ZERO,
        }
    }

    /// Serves the canned responses in order, one per connection, then repeats the last.
    async fn serve(responses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let n = counter.fetch_add(1, Ordering::SeqCst);
                let body = responses[n.min(responses.len() - 1)];
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(body.as_bytes()).await;
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{}/api/crazytime", addr), hits)
    }

    const RATE_LIMITED: &str =
        "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const SERVER_ERROR: &str =
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    const OK_TWO: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 21\r\nConnection: close\r\n\r\n[{\"a\":1},{\"data\":{}}]";
    const OK_OBJECT: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}";

    #[test]
    fn page_url_carries_paging_and_filters() {
        let client = FeedClient::new(
            "https://example.test/api/",
            "Table01",
            Duration::from_secs(1),
            RetryPolicy::default(),
        )
        .unwrap();
        let url = client.page_url(3, 24);
        assert!(url.as_str().starts_with("https://example.test/api?page=3&size=24"));
        let param = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        assert_eq!(param("sort").as_deref(), Some("data.settledAt,desc"));
        assert_eq!(param("tableId").as_deref(), Some("Table01"));
    }

    #[test]
    fn table_id_is_percent_encoded() {
        let client = FeedClient::new(
            "https://example.test/api",
            "Crazy Time&size=999",
            Duration::from_secs(1),
            RetryPolicy::default(),
        )
        .unwrap();
        let url = client.page_url(0, 10);
        assert!(url.as_str().ends_with("tableId=Crazy+Time%26size%3D999"));
        let sizes: Vec<_> = url.query_pairs().filter(|(k, _)| k == "size").collect();
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].1, "10");
    }

    #[test]
    fn rate_limit_backoff_grows_with_attempt() {
        let p = RetryPolicy::default();
        assert_eq!(p.rate_limit_backoff(1), Duration::from_secs(5));
        assert_eq!(p.rate_limit_backoff(3), Duration::from_secs(15));
        let f = p.failure_backoff(2);
        assert!(f >= Duration::from_secs(4) && f <= Duration::from_millis(4500));
    }

    #[tokio::test]
    async fn retries_after_rate_limit_then_succeeds() {
        let (url, hits) = serve(vec![RATE_LIMITED, SERVER_ERROR, OK_TWO]).await;
        let client = FeedClient::new(&url, "t", Duration::from_secs(2), fast_policy(5)).unwrap();
        let records = client.fetch_page(0, 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let (url, hits) = serve(vec![SERVER_ERROR]).await;
        let client = FeedClient::new(&url, "t", Duration::from_secs(2), fast_policy(3)).unwrap();
        let err = client.fetch_page(2, 10).await.unwrap_err();
        assert!(matches!(err, FeedError::Exhausted { page: 2, attempts: 3 }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unanswered_requests_time_out_and_exhaust() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(sock);
            }
        });

        let url = format!("http://{}/api/crazytime", addr);
        let client =
            FeedClient::new(&url, "t", Duration::from_millis(100), fast_policy(3)).unwrap();
        let err = client.fetch_page(0, 10).await.unwrap_err();
        assert!(matches!(err, FeedError::Exhausted { page: 0, attempts: 3 }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_array_body_is_a_failure() {
        let (url, _) = serve(vec![OK_OBJECT]).await;
        let client = FeedClient::new(&url, "t", Duration::from_secs(2), fast_policy(1)).unwrap();
        assert!(client.fetch_page(0, 10).await.is_err());
    }
}

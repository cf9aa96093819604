use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("page {page} failed after {attempts} attempts")]
    Exhausted { page: u32, attempts: u32 },
}

/// Source of raw spin records, newest first, addressed by page index.
#[async_trait]
pub trait SpinFeed: Send + Sync {
    /// Fetch one page of raw records. Page 0 holds the most recent spins.
    async fn fetch_page(&self, page: u32, size: u32) -> Result<Vec<serde_json::Value>, FeedError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

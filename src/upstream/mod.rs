//! Upstream market data access.
//!
//! Everything that talks to the settlement data API goes through
//! [`RateLimitedFetcher`], which shares one [`RateLimiter`] across all
//! callers in the process and applies the same [`RetryPolicy`] to every call.

pub mod cancel;
pub mod client;
pub mod fetcher;
pub mod rate_limiter;
pub mod retry;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::PipelineResult;
use crate::models::{Feed, RawRow};

pub use cancel::CancelToken;
pub use client::ElexonClient;
pub use fetcher::{BatchFetch, RateLimitedFetcher};
pub use rate_limiter::RateLimiter;
pub use retry::RetryPolicy;

/// A source of raw settlement stack rows.
///
/// Implementations perform exactly one request per call; rate limiting and
/// retries are layered on top by the fetcher.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn fetch_feed(
        &self,
        feed: Feed,
        date: NaiveDate,
        period: i32,
    ) -> PipelineResult<Vec<RawRow>>;
}

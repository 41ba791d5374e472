//! HTTP client for the Elexon BMRS settlement stack endpoints

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::MarketDataSource;
use crate::config::UpstreamConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Feed, RawRow};

#[derive(Debug, Deserialize)]
struct StackResponse {
    data: Vec<RawRow>,
}

/// Issues one GET per (feed, date, period)
pub struct ElexonClient {
    client: Client,
    base_url: String,
}

impl ElexonClient {
    pub fn new(config: &UpstreamConfig) -> PipelineResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| PipelineError::UpstreamFatal(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url(&self, feed: Feed, date: NaiveDate, period: i32) -> String {
        format!(
            "{}/balancing/settlement/stack/all/{}/{}/{}",
            self.base_url,
            feed.as_str(),
            date.format("%Y-%m-%d"),
            period
        )
    }
}

/// Whether an HTTP status is worth retrying
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn classify(url: &str, err: reqwest::Error) -> PipelineError {
    if err.is_decode() {
        PipelineError::UpstreamFatal(format!("Undecodable response from {}: {}", url, err))
    } else {
        PipelineError::Upstream(format!("Request to {} failed: {}", url, err))
    }
}

#[async_trait]
impl MarketDataSource for ElexonClient {
    async fn fetch_feed(
        &self,
        feed: Feed,
        date: NaiveDate,
        period: i32,
    ) -> PipelineResult<Vec<RawRow>> {
        let url = self.url(feed, date, period);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify(&url, e))?;

        let status = response.status();
        if is_retryable_status(status) {
            return Err(PipelineError::Upstream(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            return Err(PipelineError::UpstreamFatal(format!("{} returned {}", url, status)));
        }

        let body = response.text().await.map_err(|e| classify(&url, e))?;
        let parsed: StackResponse = serde_json::from_str(&body).map_err(|e| {
            PipelineError::UpstreamFatal(format!("Malformed response from {}: {}", url, e))
        })?;

        debug!(feed = feed.as_str(), %date, period, rows = parsed.data.len(), "Feed fetched");
        Ok(parsed.data)
    }
}

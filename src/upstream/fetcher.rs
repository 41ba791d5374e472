//! Rate-limited, retrying fetch of both settlement feeds per period.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::{CancelToken, MarketDataSource, RateLimiter, RetryPolicy};
use crate::config::UpstreamConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Feed, RawRow, PERIODS_PER_DAY};

/// Outcome of fetching several periods of one date
pub struct BatchFetch {
    pub date: NaiveDate,
    pub periods: BTreeMap<i32, PipelineResult<Vec<RawRow>>>,
}

impl BatchFetch {
    /// Union of rows from every period that succeeded
    pub fn rows(&self) -> impl Iterator<Item = &RawRow> {
        self.periods
            .values()
            .filter_map(|r| r.as_ref().ok())
            .flatten()
    }

    pub fn failed_periods(&self) -> Vec<i32> {
        self.periods
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(p, _)| *p)
            .collect()
    }
}

/// Bounded-concurrency fetcher gated by the shared request budget
pub struct RateLimitedFetcher {
    source: Arc<dyn MarketDataSource>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    max_concurrency: usize,
}

impl RateLimitedFetcher {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        max_concurrency: usize,
    ) -> Self {
        Self {
            source,
            limiter,
            retry,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn from_config(source: Arc<dyn MarketDataSource>, config: &UpstreamConfig) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            config.request_budget,
            config.rate_check_interval(),
        ));
        Self::new(
            source,
            limiter,
            RetryPolicy::from_config(config),
            config.max_concurrency,
        )
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Fetch the bid and offer stacks of one period.
    ///
    /// Either both feeds arrive or the period fails as a whole.
    pub async fn fetch(
        &self,
        date: NaiveDate,
        period: i32,
        cancel: &CancelToken,
    ) -> PipelineResult<Vec<RawRow>> {
        if !(1..=PERIODS_PER_DAY).contains(&period) {
            return Err(PipelineError::UpstreamFatal(format!(
                "Settlement period {} out of range",
                period
            )));
        }

        let (mut bids, offers) = tokio::try_join!(
            self.fetch_feed(Feed::Bid, date, period, cancel),
            self.fetch_feed(Feed::Offer, date, period, cancel),
        )?;
        debug!(%date, period, bids = bids.len(), offers = offers.len(), "Period fetched");

        bids.extend(offers);
        Ok(bids)
    }

    async fn fetch_feed(
        &self,
        feed: Feed,
        date: NaiveDate,
        period: i32,
        cancel: &CancelToken,
    ) -> PipelineResult<Vec<RawRow>> {
        let label = format!("{} {} period {}", feed.as_str(), date, period);
        let source = &self.source;
        let limiter = &self.limiter;

        cancel
            .run_until_cancelled(self.retry.run(&label, move |_| async move {
                limiter.acquire().await;
                source.fetch_feed(feed, date, period).await
            }))
            .await
    }

    /// Fetch many periods with at most `max_concurrency` in flight.
    ///
    /// A failed period never aborts its siblings; each keeps its own result.
    pub async fn fetch_batch(
        &self,
        date: NaiveDate,
        periods: &[i32],
        cancel: &CancelToken,
    ) -> BatchFetch {
        let results: Vec<(i32, PipelineResult<Vec<RawRow>>)> = stream::iter(periods.iter().copied())
            .map(move |period| async move { (period, self.fetch(date, period, cancel).await) })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let batch = BatchFetch {
            date,
            periods: results.into_iter().collect(),
        };

        let failed = batch.failed_periods();
        if !failed.is_empty() {
            warn!(%date, failed = ?failed, "Some periods could not be fetched");
        }
        info!(
            %date,
            periods = batch.periods.len(),
            failed = failed.len(),
            rows = batch.rows().count(),
            requests_in_window = self.limiter.in_window().await,
            "Batch fetch complete"
        );
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone)]
    enum Reply {
        Rows(usize),
        Transient,
        Fatal,
        Hang,
    }

    /// Replies from a per-period script; the last reply repeats
    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<HashMap<i32, Vec<Reply>>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedSource {
        fn with(period: i32, replies: Vec<Reply>) -> Self {
            let source = Self::default();
            source.script.lock().unwrap().insert(period, replies);
            source
        }
    }

    #[async_trait]
    impl MarketDataSource for ScriptedSource {
        async fn fetch_feed(
            &self,
            _feed: Feed,
            _date: NaiveDate,
            period: i32,
        ) -> PipelineResult<Vec<RawRow>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let reply = {
                let mut script = self.script.lock().unwrap();
                match script.get_mut(&period) {
                    Some(replies) if replies.len() > 1 => replies.remove(0),
                    Some(replies) => replies[0].clone(),
                    None => Reply::Rows(0),
                }
            };
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match reply {
                Reply::Rows(n) => Ok((0..n)
                    .map(|i| RawRow {
                        unit_id: format!("T_UNIT-{}", i),
                        volume: -1.0,
                        original_price: 10.0,
                        final_price: 10.0,
                        so_flag: true,
                        cadl_flag: false,
                        lead_party_name: None,
                    })
                    .collect()),
                Reply::Transient => Err(PipelineError::Upstream("503".into())),
                Reply::Fatal => Err(PipelineError::UpstreamFatal("bad schema".into())),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(vec![])
                }
            }
        }
    }

    fn fetcher(source: Arc<ScriptedSource>, concurrency: usize) -> RateLimitedFetcher {
        RateLimitedFetcher::new(
            source,
            Arc::new(RateLimiter::new(10_000, Duration::from_millis(1))),
            RetryPolicy::new(4, Duration::from_millis(10), Duration::from_millis(40)),
            concurrency,
        )
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_merges_both_feeds() {
        let source = Arc::new(ScriptedSource::with(18, vec![Reply::Rows(2)]));
        let rows = fetcher(source.clone(), 4)
            .fetch(date(), 18, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let source = Arc::new(ScriptedSource::with(
            3,
            vec![Reply::Transient, Reply::Transient, Reply::Rows(1)],
        ));
        let rows = fetcher(source, 4)
            .fetch(date(), 3, &CancelToken::new())
            .await
            .unwrap();
        assert!(!rows.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_period_is_fatal() {
        let source = Arc::new(ScriptedSource::default());
        let result = fetcher(source.clone(), 4)
            .fetch(date(), 49, &CancelToken::new())
            .await;
        assert!(matches!(result, Err(PipelineError::UpstreamFatal(_))));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_isolates_failed_periods() {
        let source = ScriptedSource::default();
        {
            let mut script = source.script.lock().unwrap();
            script.insert(2, vec![Reply::Fatal]);
            script.insert(3, vec![Reply::Rows(3)]);
        }
        let periods: Vec<i32> = (1..=4).collect();
        let batch = fetcher(Arc::new(source), 2)
            .fetch_batch(date(), &periods, &CancelToken::new())
            .await;

        assert_eq!(batch.failed_periods(), vec![2]);
        assert_eq!(batch.periods[&3].as_ref().unwrap().len(), 6);
        assert_eq!(batch.rows().count(), 6);
        assert_eq!(batch.periods.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_respects_concurrency_bound() {
        let source = Arc::new(ScriptedSource::default());
        let periods: Vec<i32> = (1..=48).collect();
        let batch = fetcher(source.clone(), 3)
            .fetch_batch(date(), &periods, &CancelToken::new())
            .await;

        assert!(batch.failed_periods().is_empty());
        // Each period has two feeds in flight at once
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 6);
        assert_eq!(source.calls.load(Ordering::SeqCst), 96);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_abandons_in_flight_requests() {
        let source = Arc::new(ScriptedSource::with(1, vec![Reply::Hang]));
        let cancel = CancelToken::with_deadline(Duration::from_secs(2));
        let result = fetcher(source, 4).fetch(date(), 1, &cancel).await;
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use curtailment_pipeline::config::{DifficultyFallback, PipelineConfig};
use curtailment_pipeline::database::{connect_in_memory, run_migrations};
use curtailment_pipeline::error::{PipelineError, PipelineResult};
use curtailment_pipeline::models::*;
use curtailment_pipeline::registry::UnitRegistry;
use curtailment_pipeline::repositories::*;
use curtailment_pipeline::upstream::{MarketDataSource, RateLimitedFetcher, RateLimiter, RetryPolicy};
use curtailment_pipeline::PipelineContext;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Difficulty close to the network's in early 2024
pub const DIFFICULTY: f64 = 83_148_355_189_239.0;

/// In-memory test database with every repository
pub struct TestDatabase {
    pub pool: SqlitePool,
    pub settlement_repo: Arc<SettlementRepository>,
    pub aggregate_repo: Arc<AggregateRepository>,
    pub yield_repo: Arc<YieldRepository>,
    pub difficulty_repo: Arc<DifficultyRepository>,
}

impl TestDatabase {
    /// Create a fresh, migrated in-memory database
    pub async fn new() -> Self {
        let pool = connect_in_memory()
            .await
            .expect("Failed to create test database pool");

        run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        Self {
            pool: pool.clone(),
            settlement_repo: Arc::new(SettlementRepository::new(pool.clone())),
            aggregate_repo: Arc::new(AggregateRepository::new(pool.clone())),
            yield_repo: Arc::new(YieldRepository::new(pool.clone())),
            difficulty_repo: Arc::new(DifficultyRepository::new(pool)),
        }
    }
}

/// Upstream stand-in serving scripted rows per (date, period).
///
/// Rows are served on the bid feed; the offer feed is always empty.
#[derive(Default)]
pub struct MockSource {
    rows: Mutex<HashMap<(NaiveDate, i32), Vec<RawRow>>>,
    failing: Mutex<HashSet<(NaiveDate, i32)>>,
    pub calls: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_rows(&self, date: NaiveDate, period: i32, rows: Vec<RawRow>) {
        self.rows.lock().unwrap().insert((date, period), rows);
    }

    /// Make every request for the period fail permanently
    pub fn fail_period(&self, date: NaiveDate, period: i32) {
        self.failing.lock().unwrap().insert((date, period));
    }

    pub fn heal_period(&self, date: NaiveDate, period: i32) {
        self.failing.lock().unwrap().remove(&(date, period));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataSource for MockSource {
    async fn fetch_feed(
        &self,
        feed: Feed,
        date: NaiveDate,
        period: i32,
    ) -> PipelineResult<Vec<RawRow>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&(date, period)) {
            return Err(PipelineError::UpstreamFatal(format!(
                "scripted failure for {} period {}",
                date, period
            )));
        }
        if feed == Feed::Offer {
            return Ok(vec![]);
        }
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(&(date, period))
            .cloned()
            .unwrap_or_default())
    }
}

/// Registry with five wind units and one gas unit
pub fn test_registry() -> UnitRegistry {
    let mut entries: Vec<UnitRegistryEntry> = (1..=5)
        .map(|i| UnitRegistryEntry::new(&format!("T_WIND-{}", i), "WIND", "Windco"))
        .collect();
    entries.push(UnitRegistryEntry::new("T_GAS-1", "CCGT", "Gasco"));
    UnitRegistry::from_entries(entries)
}

/// A flagged curtailment row for `unit`
pub fn curtailment_row(unit: &str, volume: f64, price: f64) -> RawRow {
    RawRow {
        unit_id: unit.to_string(),
        volume,
        original_price: price,
        final_price: price,
        so_flag: true,
        cadl_flag: false,
        lead_party_name: None,
    }
}

/// Five valid rows, one per wind unit
pub fn five_rows() -> Vec<RawRow> {
    (1..=5)
        .map(|i| curtailment_row(&format!("T_WIND-{}", i), -10.0 * i as f64, 40.0 + i as f64))
        .collect()
}

/// Stored records of one period, ordered by unit
pub async fn records_in_period(
    repo: &SettlementRepository,
    day: NaiveDate,
    period: i32,
) -> Vec<SettlementRecord> {
    repo.find_by_date(day)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.settlement_period == period)
        .collect()
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// Fetcher with a roomy budget and millisecond backoff
pub fn fast_fetcher(source: Arc<MockSource>) -> Arc<RateLimitedFetcher> {
    Arc::new(RateLimitedFetcher::new(
        source,
        Arc::new(RateLimiter::new(100_000, Duration::from_millis(1))),
        RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        8,
    ))
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        max_repair_cycles: 2,
        difficulty_fallback: DifficultyFallback::Exact,
        ..PipelineConfig::default()
    }
}

/// Pipeline context over a fresh database and the given source
pub async fn test_context(source: Arc<MockSource>, config: PipelineConfig) -> PipelineContext {
    let db = TestDatabase::new().await;
    PipelineContext::new(db.pool, test_registry(), fast_fetcher(source), &config)
}

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::models::MinerProfile;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub busy_timeout_secs: u64,
}

/// Upstream market data API configuration
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Requests admitted per trailing 60 second window, across all callers
    pub request_budget: usize,
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub rate_check_interval_ms: u64,
    pub timeout_secs: u64,
}

/// What the yield stage does when a date has no difficulty of its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifficultyFallback {
    /// Fail with a missing-parameter error
    Exact,
    /// Explicitly reuse the most recent earlier difficulty
    LastKnown,
}

impl FromStr for DifficultyFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exact" => Ok(DifficultyFallback::Exact),
            "last-known" | "last_known" => Ok(DifficultyFallback::LastKnown),
            _ => Err(format!("Invalid DIFFICULTY_FALLBACK: {}", s)),
        }
    }
}

/// Pipeline behaviour configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub registry_path: PathBuf,
    pub profiles: Vec<MinerProfile>,
    pub block_reward: f64,
    pub max_repair_cycles: u32,
    pub difficulty_fallback: DifficultyFallback,
    /// Re-fetch ingested periods during reconciliation scans
    pub verify_upstream: bool,
    pub audit_log_dir: Option<PathBuf>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    pub pipeline: PipelineConfig,
    pub log_level: String,
    pub log_json: bool,
    pub environment: String,
}

/// Parse `key` when set; a present but unparseable value is an error
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| format!("Invalid {}: {}", key, raw)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(format!("{} is not valid unicode", key)),
    }
}

impl DatabaseConfig {
    /// Create database config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        let url = env::var("DATABASE_URL").unwrap_or(defaults.url);
        let max_connections = env_parse("DATABASE_MAX_CONNECTIONS", defaults.max_connections)?;
        let acquire_timeout_secs =
            env_parse("DATABASE_ACQUIRE_TIMEOUT_SECS", defaults.acquire_timeout_secs)?;
        let busy_timeout_secs = env_parse("DATABASE_BUSY_TIMEOUT_SECS", defaults.busy_timeout_secs)?;

        if max_connections == 0 {
            return Err("DATABASE_MAX_CONNECTIONS must be greater than 0".to_string());
        }

        if acquire_timeout_secs == 0 {
            return Err("DATABASE_ACQUIRE_TIMEOUT_SECS must be greater than 0".to_string());
        }

        Ok(Self {
            url,
            max_connections,
            acquire_timeout_secs,
            busy_timeout_secs,
        })
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://curtailment.db".to_string(),
            max_connections: 5,
            acquire_timeout_secs: 30,
            busy_timeout_secs: 5,
        }
    }
}

impl UpstreamConfig {
    /// Create upstream config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();
        let config = Self {
            base_url: env::var("UPSTREAM_BASE_URL").unwrap_or(defaults.base_url),
            request_budget: env_parse("UPSTREAM_REQUEST_BUDGET", defaults.request_budget)?,
            max_concurrency: env_parse("UPSTREAM_MAX_CONCURRENCY", defaults.max_concurrency)?,
            max_attempts: env_parse("UPSTREAM_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay_ms: env_parse("UPSTREAM_BASE_DELAY_MS", defaults.base_delay_ms)?,
            max_delay_ms: env_parse("UPSTREAM_MAX_DELAY_MS", defaults.max_delay_ms)?,
            rate_check_interval_ms: env_parse(
                "UPSTREAM_RATE_CHECK_INTERVAL_MS",
                defaults.rate_check_interval_ms,
            )?,
            timeout_secs: env_parse("UPSTREAM_TIMEOUT_SECS", defaults.timeout_secs)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.request_budget == 0 {
            return Err("UPSTREAM_REQUEST_BUDGET must be greater than 0".to_string());
        }
        if self.max_concurrency == 0 {
            return Err("UPSTREAM_MAX_CONCURRENCY must be greater than 0".to_string());
        }
        if self.max_attempts == 0 {
            return Err("UPSTREAM_MAX_ATTEMPTS must be greater than 0".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("UPSTREAM_MAX_DELAY_MS must not be below UPSTREAM_BASE_DELAY_MS".to_string());
        }
        if self.rate_check_interval_ms == 0 {
            return Err("UPSTREAM_RATE_CHECK_INTERVAL_MS must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn rate_check_interval(&self) -> Duration {
        Duration::from_millis(self.rate_check_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.elexon.co.uk/bmrs/api/v1".to_string(),
            request_budget: 600,
            max_concurrency: 8,
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            rate_check_interval_ms: 100,
            timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    /// Create pipeline config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let registry_path = env::var("REGISTRY_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.registry_path);

        let profiles = match env::var("MINER_MODELS") {
            Ok(list) => list
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| {
                    MinerProfile::by_name(name)
                        .ok_or_else(|| format!("Unknown miner model in MINER_MODELS: {}", name))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => defaults.profiles,
        };
        if profiles.is_empty() {
            return Err("MINER_MODELS must name at least one model".to_string());
        }

        let block_reward = env_parse("BLOCK_REWARD", defaults.block_reward)?;
        if !(block_reward.is_finite() && block_reward > 0.0) {
            return Err("BLOCK_REWARD must be a positive number".to_string());
        }

        let max_repair_cycles = env_parse("MAX_REPAIR_CYCLES", defaults.max_repair_cycles)?;
        if max_repair_cycles == 0 {
            return Err("MAX_REPAIR_CYCLES must be greater than 0".to_string());
        }

        let difficulty_fallback = match env::var("DIFFICULTY_FALLBACK") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.difficulty_fallback,
        };

        let verify_upstream = env_parse("VERIFY_UPSTREAM", defaults.verify_upstream)?;
        let audit_log_dir = env::var("AUDIT_LOG_DIR").ok().map(PathBuf::from);

        Ok(Self {
            registry_path,
            profiles,
            block_reward,
            max_repair_cycles,
            difficulty_fallback,
            verify_upstream,
            audit_log_dir,
        })
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("data/bmu_mapping.json"),
            profiles: MinerProfile::defaults(),
            block_reward: 3.125,
            max_repair_cycles: 3,
            difficulty_fallback: DifficultyFallback::Exact,
            verify_upstream: false,
            audit_log_dir: None,
        }
    }
}

impl AppConfig {
    /// Create application config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let database = DatabaseConfig::from_env()?;
        let upstream = UpstreamConfig::from_env()?;
        let pipeline = PipelineConfig::from_env()?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        // Validate log level
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid LOG_LEVEL: {}. Must be one of: {:?}",
                log_level, valid_log_levels
            ));
        }

        // Validate environment
        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&environment.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid ENVIRONMENT: {}. Must be one of: {:?}",
                environment, valid_environments
            ));
        }

        Ok(Self {
            database,
            upstream,
            pipeline,
            log_level: log_level.to_lowercase(),
            log_json,
            environment: environment.to_lowercase(),
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            upstream: UpstreamConfig::default(),
            pipeline: PipelineConfig::default(),
            log_level: "info".to_string(),
            log_json: false,
            environment: "development".to_string(),
        }
    }
}

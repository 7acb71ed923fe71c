//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The configuration file path defaults to `config.yaml` but can
//! be specified via `-f` flag or the `METERD_CONFIG` environment variable.
//!
//! ## Loading Priority
//!
//! Sources are merged in order (later sources override earlier ones):
//!
//! 1. **YAML config file** - base configuration (default: `config.yaml`)
//! 2. **Environment variables** - variables prefixed with `METERD_`
//! 3. **DATABASE_URL** - special case: overrides `database.url` if set
//!
//! For nested values, use double underscores: `METERD_CACHE__BALANCE_TTL=30s`
//! sets `cache.balance_ttl`. Durations accept humantime strings (`120s`,
//! `100ms`, `2m`).

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::RetryPolicy;

/// Simple CLI args - just for specifying the config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "METERD_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the worker.
    /// Useful for CI/CD pipelines to catch config errors before deployment.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// PostgreSQL connection settings for the durable store and queue
    pub database: DatabaseConfig,
    /// Snapshot cache TTLs and optimistic retry policy
    pub cache: CacheConfig,
    /// Write-behind queue delivery and worker settings
    pub queue: QueueConfig,
    /// Transaction history query bounds
    pub history: HistoryConfig,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
    /// Set via the DATABASE_URL environment variable; folded into
    /// `database.url` during load.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

/// PostgreSQL connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection string
    pub url: String,
    /// Connection pool settings
    pub pool: PoolSettings,
}

/// Connection pool settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
        }
    }
}

/// Snapshot cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// How long balance snapshots live between writes (default: 120s)
    #[serde(with = "humantime_serde")]
    pub balance_ttl: Duration,
    /// How long token-usage snapshots live between writes (default: 120s)
    #[serde(with = "humantime_serde")]
    pub token_usage_ttl: Duration,
    /// Optimistic commit retry policy
    pub retry: RetryConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            balance_ttl: Duration::from_secs(120),
            token_usage_ttl: Duration::from_secs(120),
            retry: RetryConfig::default(),
        }
    }
}

/// Optimistic commit retry policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts before an update reports contention failure (default: 5)
    pub max_attempts: u32,
    /// Base backoff between attempts, doubled each time (default: 100ms)
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
        }
    }
}

/// Write-behind queue configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Delivery attempts before a job is retained as failed (default: 5)
    pub max_attempts: u32,
    /// Base redelivery backoff, doubled each attempt (default: 5s)
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    /// How long fresh jobs stay invisible, batching near-simultaneous
    /// transactions (default: 60s)
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Claims older than this are assumed orphaned and recovered
    /// (default: 60s)
    #[serde(with = "humantime_serde")]
    pub claim_timeout: Duration,
    /// Worker sleep between claim polls when the queue is empty
    /// (default: 1s)
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Jobs claimed per worker iteration; still processed one at a time
    /// (default: 50)
    pub claim_batch_size: usize,
    /// Failed jobs retained for inspection (default: 1000)
    pub max_retained_failures: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(5),
            initial_delay: Duration::from_secs(60),
            claim_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            claim_batch_size: 50,
            max_retained_failures: 1000,
        }
    }
}

impl QueueConfig {
    /// Convert to sluice delivery options.
    pub fn job_options(&self) -> sluice::JobOptions {
        sluice::JobOptions {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            initial_delay: self.initial_delay,
            max_retained_failures: self.max_retained_failures,
            claim_timeout: self.claim_timeout,
        }
    }

    /// Convert to sluice worker settings.
    pub fn worker_config(&self) -> sluice::WorkerConfig {
        sluice::WorkerConfig {
            poll_interval: self.poll_interval,
            claim_batch_size: self.claim_batch_size,
        }
    }
}

/// Transaction history query bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    /// Cap on rows returned by a history query (default: 100)
    pub max_results: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_results: 100 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/meterd".to_string(),
            pool: PoolSettings::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            history: HistoryConfig::default(),
            enable_otel_export: false,
            database_url: None,
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        // DATABASE_URL takes precedence over database.url if set
        if let Some(url) = config.database_url.take() {
            config.database.url = url;
        }

        config
            .validate()
            .map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("METERD_").split("__"))
            // Common DATABASE_URL pattern
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }

    /// Check cross-field constraints figment cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.retry.max_attempts == 0 {
            anyhow::bail!("cache.retry.max_attempts must be at least 1");
        }
        if self.cache.balance_ttl.is_zero() || self.cache.token_usage_ttl.is_zero() {
            anyhow::bail!("cache TTLs must be non-zero");
        }
        if self.queue.max_attempts == 0 {
            anyhow::bail!("queue.max_attempts must be at least 1");
        }
        if self.queue.claim_batch_size == 0 {
            anyhow::bail!("queue.claim_batch_size must be at least 1");
        }
        if self.history.max_results <= 0 {
            anyhow::bail!("history.max_results must be positive");
        }
        Ok(())
    }
}

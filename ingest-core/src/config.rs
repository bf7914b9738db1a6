//! Worker configuration loaded from environment variables with defaults.

use std::time::Duration;

use crate::{Error, Result};

/// Configuration for the crawl-and-ingest worker core.
///
/// Every field has a production default and a matching environment variable.
/// Builder-style `with_*` methods exist for the knobs tests need to turn.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Database connection URL (libsql://, file:, or :memory:)
    pub database_url: String,
    /// Max simultaneous jobs per tenant across all worker processes
    pub max_concurrent_per_tenant: u32,
    /// TTL on the per-tenant semaphore counter in Redis
    pub semaphore_ttl_seconds: u64,
    /// Per-process fallback slot limit when Redis is unreachable
    pub local_limit: u32,
    /// Cooldown before the limiter circuit breaker probes Redis again
    pub circuit_break_seconds: u64,
    /// Consecutive Redis failures before the limiter circuit opens
    pub circuit_failure_threshold: u32,
    /// Embedding API calls in flight per process
    pub embedding_concurrency: usize,
    /// Timeout per embedding API call
    pub embedding_timeout_seconds: u64,
    /// Phase 1 memory cap on accumulated embedding bytes per batch
    pub max_batch_embedding_bytes: usize,
    /// Wall-clock cap on the Phase 2 outer transaction
    pub max_transaction_wall_time_seconds: u64,
    /// Actual-failure count after which a job is abandoned
    pub max_attempts: u32,
    /// Age since first attempt after which a job is abandoned
    pub max_age_seconds: u64,
    /// Base delay for requeue backoff
    pub base_retry_delay_seconds: f64,
    /// Cap for requeue backoff
    pub max_retry_delay_seconds: f64,
    /// Pages buffered before a persister batch is flushed
    pub page_batch_size: usize,
    /// TTL on the feeder leader lock
    pub feeder_lock_ttl_seconds: u64,
    /// How often the leader refreshes its lock and drains queues
    pub feeder_refresh_seconds: u64,
    /// Subscriptions expiring within this many hours are renewed
    pub renewal_threshold_hours: i64,
    /// Export files older than this many hours are swept
    pub export_max_age_hours: u64,
    /// Public webhook endpoint for change notifications; absent disables subscriptions
    pub webhook_notification_url: Option<String>,
    /// Opaque state echoed back by the notification provider
    pub webhook_client_state: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            database_url: ":memory:".to_string(),
            max_concurrent_per_tenant: 5,
            semaphore_ttl_seconds: 1800,
            local_limit: 2,
            circuit_break_seconds: 30,
            circuit_failure_threshold: 5,
            embedding_concurrency: 3,
            embedding_timeout_seconds: 120,
            max_batch_embedding_bytes: 64 * 1024 * 1024,
            max_transaction_wall_time_seconds: 30,
            max_attempts: 3,
            max_age_seconds: 86_400,
            base_retry_delay_seconds: 60.0,
            max_retry_delay_seconds: 300.0,
            page_batch_size: 50,
            feeder_lock_ttl_seconds: 30,
            feeder_refresh_seconds: 10,
            renewal_threshold_hours: 4,
            export_max_age_hours: 24,
            webhook_notification_url: None,
            webhook_client_state: "ingest-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from the process environment, falling back to
    /// defaults for anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when a variable is set but fails to
    /// parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        config.max_concurrent_per_tenant =
            parse_var("TENANT_WORKER_CONCURRENCY_LIMIT", config.max_concurrent_per_tenant)?;
        config.semaphore_ttl_seconds =
            parse_var("TENANT_WORKER_SEMAPHORE_TTL_SECONDS", config.semaphore_ttl_seconds)?;
        config.local_limit = parse_var("TENANT_WORKER_LOCAL_LIMIT", config.local_limit)?;
        config.circuit_break_seconds =
            parse_var("LIMITER_CIRCUIT_BREAK_SECONDS", config.circuit_break_seconds)?;
        config.circuit_failure_threshold =
            parse_var("LIMITER_FAILURE_THRESHOLD", config.circuit_failure_threshold)?;
        config.embedding_concurrency =
            parse_var("CRAWL_EMBEDDING_CONCURRENCY", config.embedding_concurrency)?;
        config.embedding_timeout_seconds =
            parse_var("CRAWL_EMBEDDING_TIMEOUT_SECONDS", config.embedding_timeout_seconds)?;
        config.max_batch_embedding_bytes =
            parse_var("CRAWL_MAX_BATCH_EMBEDDING_BYTES", config.max_batch_embedding_bytes)?;
        config.max_transaction_wall_time_seconds = parse_var(
            "CRAWL_MAX_TRANSACTION_WALL_TIME_SECONDS",
            config.max_transaction_wall_time_seconds,
        )?;
        config.max_attempts = parse_var("CRAWL_MAX_ATTEMPTS", config.max_attempts)?;
        config.max_age_seconds = parse_var("CRAWL_MAX_AGE_SECONDS", config.max_age_seconds)?;
        config.base_retry_delay_seconds =
            parse_var("CRAWL_BASE_RETRY_DELAY_SECONDS", config.base_retry_delay_seconds)?;
        config.max_retry_delay_seconds =
            parse_var("CRAWL_MAX_RETRY_DELAY_SECONDS", config.max_retry_delay_seconds)?;
        config.page_batch_size = parse_var("CRAWL_PAGE_BATCH_SIZE", config.page_batch_size)?;
        config.feeder_lock_ttl_seconds =
            parse_var("FEEDER_LOCK_TTL_SECONDS", config.feeder_lock_ttl_seconds)?;
        config.feeder_refresh_seconds =
            parse_var("FEEDER_REFRESH_SECONDS", config.feeder_refresh_seconds)?;
        config.renewal_threshold_hours =
            parse_var("SUBSCRIPTION_RENEWAL_THRESHOLD_HOURS", config.renewal_threshold_hours)?;
        config.export_max_age_hours =
            parse_var("EXPORT_MAX_AGE_HOURS", config.export_max_age_hours)?;
        if let Ok(url) = std::env::var("WEBHOOK_NOTIFICATION_URL") {
            if !url.is_empty() {
                config.webhook_notification_url = Some(url);
            }
        }
        if let Ok(state) = std::env::var("WEBHOOK_CLIENT_STATE") {
            config.webhook_client_state = state;
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent_per_tenant = max_concurrent;
        self
    }

    #[must_use]
    pub fn with_local_limit(mut self, local_limit: u32) -> Self {
        self.local_limit = local_limit;
        self
    }

    #[must_use]
    pub fn with_circuit_break_seconds(mut self, seconds: u64) -> Self {
        self.circuit_break_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_page_batch_size(mut self, size: usize) -> Self {
        self.page_batch_size = size;
        self
    }

    /// Timeout applied to a single embedding API call.
    #[must_use]
    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_seconds)
    }

    /// Wall-clock cap for the Phase 2 outer transaction.
    #[must_use]
    pub fn max_transaction_wall_time(&self) -> Duration {
        Duration::from_secs(self.max_transaction_wall_time_seconds)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(default),
    }
}

//! Lazily-connected shared Redis handle.
//!
//! The connection manager is created on first use and shared by clone; every
//! caller acquires it per operation so that an unreachable Redis surfaces as
//! an error on that operation instead of wedging process startup. The
//! limiter's circuit breaker counts those errors.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Shared handle to a single multiplexed Redis connection.
pub struct RedisPool {
    client: redis::Client,
    manager: RwLock<Option<ConnectionManager>>,
    connect_timeout: Duration,
}

impl RedisPool {
    /// Create a pool for the given Redis URL. No connection is made yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when the URL cannot be parsed.
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client,
            manager: RwLock::new(None),
            connect_timeout: Duration::from_secs(5),
        })
    }

    /// Override the initial connection timeout. Tests point this at an
    /// unreachable address and want the failure quickly.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Get a clone of the shared connection manager, connecting on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Redis`] when the initial connection cannot be
    /// established within the connect timeout.
    pub async fn manager(&self) -> Result<ConnectionManager> {
        if let Some(manager) = self.manager.read().await.as_ref() {
            return Ok(manager.clone());
        }

        let mut guard = self.manager.write().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }

        debug!("establishing redis connection");
        let manager = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_connection_manager(),
        )
        .await
        .map_err(|_| Error::Redis("redis connection attempt timed out".to_string()))?
        .map_err(|e| Error::Redis(format!("redis connection failed: {e}")))?;

        *guard = Some(manager.clone());
        Ok(manager)
    }

    /// Drop the cached connection so the next call reconnects.
    pub async fn invalidate(&self) {
        warn!("invalidating cached redis connection");
        *self.manager.write().await = None;
    }
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

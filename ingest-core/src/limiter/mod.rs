//! Per-tenant concurrency control with a Redis-backed semaphore, a local
//! in-memory fallback, and a circuit breaker that transitions between them.
//!
//! The semaphore grants at most `max_concurrent` simultaneous slots per
//! tenant across all worker processes. Acquisition is a single atomic Lua
//! script so two workers can never exceed the limit under race. When Redis
//! is unreachable the breaker opens and acquisition degrades to per-process
//! counters capped at the (smaller) `local_limit`.

mod circuit;
mod fallback;

pub use circuit::{CircuitBreaker, CircuitState, CircuitStats};
pub use fallback::FallbackCounters;

use std::sync::Arc;

use redis::Script;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::redis_pool::RedisPool;
use crate::{Error, Result};

/// Check-and-increment in one round trip. KEYS[1] = semaphore key,
/// ARGV[1] = max_concurrent, ARGV[2] = TTL seconds.
const ACQUIRE_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local limit = tonumber(ARGV[1])
if current < limit then
    redis.call('INCR', KEYS[1])
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
";

/// Guarded decrement: never underflows, removes the key at zero so a missing
/// key always means full capacity.
const RELEASE_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
    local remaining = redis.call('DECR', KEYS[1])
    if remaining <= 0 then
        redis.call('DEL', KEYS[1])
    end
    return remaining
end
return 0
";

/// Which path granted a slot. Release must use the matching path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Slot tracked in the shared Redis counter.
    Redis,
    /// Slot tracked in this process's fallback counters.
    Fallback,
}

/// Proof of one granted slot.
///
/// The permit lives on the acquiring task's stack and records the path used
/// at acquire time; the circuit state may change between acquire and release,
/// and release must use the captured path, not the current state. Consuming
/// the permit on release makes double-release unrepresentable.
#[derive(Debug)]
#[must_use = "a granted slot must be released on every exit path"]
pub struct SlotPermit {
    tenant_id: Uuid,
    mode: AcquireMode,
}

impl SlotPermit {
    #[must_use]
    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    #[must_use]
    pub fn mode(&self) -> AcquireMode {
        self.mode
    }
}

/// Distributed counting semaphore with per-tenant limits.
pub struct TenantConcurrencyLimiter {
    redis: Arc<RedisPool>,
    max_concurrent: u32,
    ttl_seconds: u64,
    local_limit: u32,
    breaker: CircuitBreaker,
    fallback: FallbackCounters,
    acquire_script: Script,
    release_script: Script,
}

impl TenantConcurrencyLimiter {
    pub fn new(redis: Arc<RedisPool>, config: &WorkerConfig) -> Self {
        Self {
            redis,
            max_concurrent: config.max_concurrent_per_tenant,
            ttl_seconds: config.semaphore_ttl_seconds,
            local_limit: config.local_limit,
            breaker: CircuitBreaker::new(
                config.circuit_failure_threshold,
                std::time::Duration::from_secs(config.circuit_break_seconds),
            ),
            fallback: FallbackCounters::new(),
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    fn semaphore_key(tenant_id: Uuid) -> String {
        format!("tenant:{tenant_id}:active_jobs")
    }

    /// Try to acquire one slot for the tenant.
    ///
    /// Returns `None` when the tenant is at capacity — a first-class requeue
    /// signal, not an error. Redis failures count toward the breaker and fall
    /// through to the local fallback path.
    pub async fn acquire(&self, tenant_id: Uuid) -> Option<SlotPermit> {
        if self.breaker.allow_request() {
            match self.try_acquire_redis(tenant_id).await {
                Ok(true) => {
                    self.breaker.record_success();
                    return Some(SlotPermit {
                        tenant_id,
                        mode: AcquireMode::Redis,
                    });
                }
                Ok(false) => {
                    // Capacity denied: a healthy answer from Redis.
                    self.breaker.record_success();
                    return None;
                }
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "redis acquire failed, trying fallback");
                    self.breaker.record_failure();
                }
            }
        }

        if self.fallback.try_acquire(tenant_id, self.local_limit) {
            Some(SlotPermit {
                tenant_id,
                mode: AcquireMode::Fallback,
            })
        } else {
            None
        }
    }

    /// Release a previously acquired slot using the path captured at acquire
    /// time. Redis errors are logged but never propagated; the counter TTL
    /// corrects any stuck value once Redis returns.
    pub async fn release(&self, permit: SlotPermit) {
        match permit.mode {
            // Even while the circuit is open we attempt the Redis release for
            // slots tracked there, to avoid leaking counters when Redis
            // comes back before the TTL fires.
            AcquireMode::Redis => {
                if let Err(e) = self.try_release_redis(permit.tenant_id).await {
                    warn!(
                        tenant_id = %permit.tenant_id,
                        error = %e,
                        "redis release failed; TTL will reclaim the slot"
                    );
                }
            }
            AcquireMode::Fallback => self.fallback.release(permit.tenant_id),
        }
    }

    /// Read-only capacity hint for the feeder.
    ///
    /// Missing key means full capacity (safe, because the actual slot is
    /// taken atomically at acquire time); an unparseable value or a Redis
    /// error conservatively reports zero.
    pub async fn available_capacity(&self, tenant_id: Uuid) -> u32 {
        let key = Self::semaphore_key(tenant_id);
        let mut conn = match self.redis.manager().await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(tenant_id = %tenant_id, error = %e, "capacity hint unavailable");
                return 0;
            }
        };

        let raw: redis::RedisResult<Option<String>> =
            redis::cmd("GET").arg(&key).query_async(&mut conn).await;
        match raw {
            Ok(None) => self.max_concurrent,
            Ok(Some(value)) => match value.parse::<u32>() {
                Ok(active) => self.max_concurrent.saturating_sub(active),
                Err(_) => {
                    warn!(tenant_id = %tenant_id, value, "unparseable active_jobs value");
                    0
                }
            },
            Err(e) => {
                debug!(tenant_id = %tenant_id, error = %e, "capacity hint unavailable");
                0
            }
        }
    }

    /// Current breaker state, exposed for health reporting.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Fallback counter for a tenant, exposed for tests and health reporting.
    #[must_use]
    pub fn fallback_count(&self, tenant_id: Uuid) -> u32 {
        self.fallback.current(tenant_id)
    }

    async fn try_acquire_redis(&self, tenant_id: Uuid) -> Result<bool> {
        let mut conn = self.redis.manager().await?;
        let granted: i64 = self
            .acquire_script
            .key(Self::semaphore_key(tenant_id))
            .arg(self.max_concurrent)
            .arg(self.ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(granted == 1)
    }

    async fn try_release_redis(&self, tenant_id: Uuid) -> Result<()> {
        let mut conn = self.redis.manager().await?;
        let _remaining: i64 = self
            .release_script
            .key(Self::semaphore_key(tenant_id))
            .invoke_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}

//! Circuit breaker guarding the limiter's Redis path.
//!
//! Three states:
//!
//! - **Closed**: normal operation, every call attempts Redis
//! - **Open**: degraded, calls go straight to the local fallback
//! - **Half-open**: a single probe tries Redis; success closes the circuit,
//!   failure reopens it
//!
//! Only Redis-flavored failures are recorded here; capacity denial is a
//! first-class outcome, not a failure.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Too many failures - skip Redis until the cooldown elapses
    Open,
    /// Testing recovery - exactly one probe allowed
    HalfOpen,
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitStats {
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub short_circuited_calls: u64,
    pub consecutive_failures: u32,
    pub circuit_opened_count: u32,
}

struct BreakerInner {
    state: CircuitState,
    stats: CircuitStats,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Failure-counting circuit breaker with a single-probe half-open state.
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        info!(
            failure_threshold,
            cooldown_secs = cooldown.as_secs(),
            "initializing limiter circuit breaker"
        );
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                stats: CircuitStats::default(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Whether the caller should attempt the Redis path right now.
    ///
    /// In the open state this returns `false` until the cooldown elapses,
    /// then admits exactly one probe and transitions to half-open.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    info!("circuit breaker transitioning to half-open");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    true
                } else {
                    inner.stats.short_circuited_calls += 1;
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.stats.short_circuited_calls += 1;
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful Redis round trip.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.stats.successful_calls += 1;
        inner.probe_in_flight = false;
        match inner.state {
            CircuitState::HalfOpen => {
                info!("circuit breaker closing after successful probe");
                inner.state = CircuitState::Closed;
                inner.stats.consecutive_failures = 0;
                inner.opened_at = None;
            }
            CircuitState::Closed => {
                if inner.stats.consecutive_failures > 0 {
                    debug!(
                        from = inner.stats.consecutive_failures,
                        "resetting consecutive failures"
                    );
                    inner.stats.consecutive_failures = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a Redis failure and advance toward (or back to) open.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.stats.failed_calls += 1;
        inner.stats.consecutive_failures += 1;
        inner.probe_in_flight = false;

        match inner.state {
            CircuitState::Closed => {
                if inner.stats.consecutive_failures >= self.failure_threshold {
                    warn!(
                        failures = inner.stats.consecutive_failures,
                        "circuit breaker opening"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.stats.circuit_opened_count += 1;
                }
            }
            CircuitState::HalfOpen => {
                warn!("probe failed, circuit breaker reopening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.stats.circuit_opened_count += 1;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> CircuitStats {
        self.inner.lock().stats
    }
}

//! Exponential backoff with full jitter, plus the Redis-backed per-tenant
//! denial counter that drives requeue delays.

use std::time::Duration;

use redis::aio::ConnectionManager;
use tracing::debug;
use uuid::Uuid;

use crate::Result;

/// TTL on the per-tenant denial counter. A tenant that stops overloading the
/// limiter falls back to base delay after this window even without a
/// successful crawl.
pub const BACKOFF_COUNTER_TTL_SECS: i64 = 300;

/// Compute a full-jitter backoff delay for the given attempt.
///
/// True exponential with cap: `capped = min(max_delay, base * 2^(attempt-1))`,
/// then a single uniform draw in `[0, capped]`. The uniform draw prevents
/// synchronized thundering-herd retries after shared outages.
///
/// `attempt` is 1-indexed; attempt 0 is treated as 1.
#[must_use]
pub fn full_jitter(attempt: u32, base_delay: Duration, max_delay: Duration) -> Duration {
    let exponent = attempt.max(1) - 1;
    // Saturate instead of overflowing for absurd attempt counts.
    let factor = 2u64.checked_pow(exponent.min(32)).unwrap_or(u64::MAX);
    let exp_delay = base_delay.as_secs_f64() * factor as f64;
    let capped = exp_delay.min(max_delay.as_secs_f64());
    Duration::from_secs_f64(rand::random::<f64>() * capped)
}

fn backoff_key(tenant_id: Uuid) -> String {
    format!("tenant:{tenant_id}:limiter_backoff")
}

/// Advance the tenant's consecutive-denial counter and compute the next
/// requeue delay from it.
///
/// The counter carries its own TTL; it is reset only by
/// [`reset_tenant_backoff`] after a fully successful crawl, so a tenant that
/// repeatedly overloads sees its delay keep growing.
///
/// # Errors
///
/// Returns [`crate::Error::Redis`] when the counter cannot be advanced.
pub async fn next_tenant_backoff(
    conn: &mut ConnectionManager,
    tenant_id: Uuid,
    base_delay: Duration,
    max_delay: Duration,
) -> Result<(u32, Duration)> {
    let key = backoff_key(tenant_id);
    let (attempt,): (u32,) = redis::pipe()
        .atomic()
        .incr(&key, 1u32)
        .expire(&key, BACKOFF_COUNTER_TTL_SECS)
        .ignore()
        .query_async(conn)
        .await?;

    let delay = full_jitter(attempt, base_delay, max_delay);
    debug!(
        tenant_id = %tenant_id,
        attempt,
        delay_secs = delay.as_secs_f64(),
        "computed requeue backoff"
    );
    Ok((attempt, delay))
}

/// Delete the tenant's denial counter. Best effort: Redis errors are logged
/// and swallowed so cleanup never disrupts the main flow.
pub async fn reset_tenant_backoff(conn: &mut ConnectionManager, tenant_id: Uuid) {
    let key = backoff_key(tenant_id);
    let result: redis::RedisResult<()> = redis::cmd("DEL").arg(&key).query_async(conn).await;
    if let Err(e) = result {
        debug!(tenant_id = %tenant_id, error = %e, "failed to reset tenant backoff counter");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_exponential_envelope() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(60);

        for _ in 0..200 {
            // attempt=3 -> cap at min(60, 10 * 4) = 40
            let delay = full_jitter(3, base, max);
            assert!(delay <= Duration::from_secs(40));
        }
        for _ in 0..200 {
            // attempt=5 -> 10 * 16 = 160, capped at 60
            let delay = full_jitter(5, base, max);
            assert!(delay <= Duration::from_secs(60));
        }
    }

    #[test]
    fn attempt_zero_is_treated_as_first_attempt() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(60);
        for _ in 0..100 {
            assert!(full_jitter(0, base, max) <= base);
        }
    }

    #[test]
    fn mean_delay_grows_until_saturation() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(60);
        let samples = 10_000;

        let mean = |attempt: u32| -> f64 {
            (0..samples)
                .map(|_| full_jitter(attempt, base, max).as_secs_f64())
                .sum::<f64>()
                / f64::from(samples)
        };

        let m1 = mean(1); // expected 5
        let m2 = mean(2); // expected 10
        let m3 = mean(3); // expected 20
        let m4 = mean(4); // expected 30 (saturated at max/2)
        let m5 = mean(5); // expected 30

        assert!(m1 < m2 && m2 < m3 && m3 < m4, "{m1} {m2} {m3} {m4}");
        // Scenario B tolerance: mean within 5% of the midpoint.
        assert!((m3 - 20.0).abs() < 1.0, "mean for attempt 3 was {m3}");
        assert!((m5 - 30.0).abs() < 1.5, "saturated mean was {m5}");
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let delay = full_jitter(u32::MAX, Duration::from_secs(10), Duration::from_secs(60));
        assert!(delay <= Duration::from_secs(60));
    }
}

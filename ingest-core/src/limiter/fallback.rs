//! Process-local slot accounting used while Redis is unreachable.
//!
//! Counters here are invisible to other worker processes, which is acceptable
//! because fallback mode is a degraded path with its own, smaller limit.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Per-tenant in-memory counters guarded by a mutex.
#[derive(Debug, Default)]
pub struct FallbackCounters {
    counts: Mutex<HashMap<Uuid, u32>>,
}

impl FallbackCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a local slot if the tenant is below `local_limit`.
    pub fn try_acquire(&self, tenant_id: Uuid, local_limit: u32) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(tenant_id).or_insert(0);
        if *count < local_limit {
            *count += 1;
            debug!(tenant_id = %tenant_id, count = *count, "acquired fallback slot");
            true
        } else {
            false
        }
    }

    /// Release a local slot. Idempotent: releasing without a prior acquire is
    /// a no-op, and the entry is removed when it reaches zero.
    pub fn release(&self, tenant_id: Uuid) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&tenant_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&tenant_id);
            }
        }
    }

    /// Current count for a tenant; zero when no entry exists.
    pub fn current(&self, tenant_id: Uuid) -> u32 {
        self.counts.lock().get(&tenant_id).copied().unwrap_or(0)
    }
}

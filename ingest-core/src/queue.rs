//! Redis-backed job queue with idempotent enqueue and delayed requeue.
//!
//! Layout, namespaced under one queue name:
//!
//! ```text
//! {queue}:ids        SET     job ids currently known (dedup)
//! {queue}:ready      LIST    payloads ready for immediate execution
//! {queue}:scheduled  ZSET    payloads scored by their due unix time
//! ```
//!
//! Delivery is at-least-once; consumers must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use tracing::{debug, warn};

use crate::jobs::{JobQueue, QueuedJob};
use crate::redis_pool::RedisPool;
use crate::{Error, Result};

/// SADD the id, and only on first add push the payload. KEYS[1] = ids set,
/// KEYS[2] = ready list, ARGV[1] = job id, ARGV[2] = payload.
const PUSH_SCRIPT: &str = r"
local added = redis.call('SADD', KEYS[1], ARGV[1])
if added == 1 then
    redis.call('RPUSH', KEYS[2], ARGV[2])
end
return added
";

/// Move every due payload from the scheduled set to the ready list.
/// KEYS[1] = scheduled zset, KEYS[2] = ready list, ARGV[1] = now.
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for i, payload in ipairs(due) do
    redis.call('RPUSH', KEYS[2], payload)
    redis.call('ZREM', KEYS[1], payload)
end
return #due
";

/// Redis implementation of the [`JobQueue`] contract.
pub struct RedisJobQueue {
    redis: Arc<RedisPool>,
    namespace: String,
    push_script: Script,
    promote_script: Script,
}

impl RedisJobQueue {
    pub fn new(redis: Arc<RedisPool>) -> Self {
        Self::with_namespace(redis, "ingest_jobs")
    }

    pub fn with_namespace(redis: Arc<RedisPool>, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
            push_script: Script::new(PUSH_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
        }
    }

    fn ids_key(&self) -> String {
        format!("{}:ids", self.namespace)
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.namespace)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    /// Move scheduled jobs whose delay has elapsed onto the ready list.
    /// Called periodically by the worker loop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Redis`] when the promote script fails.
    pub async fn promote_due(&self) -> Result<u64> {
        let mut conn = self.redis.manager().await?;
        let promoted: u64 = self
            .promote_script
            .key(self.scheduled_key())
            .key(self.ready_key())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(Error::from)?;
        if promoted > 0 {
            debug!(promoted, "promoted scheduled jobs");
        }
        Ok(promoted)
    }

    /// Block up to `timeout` waiting for the next ready job.
    ///
    /// A payload that fails to deserialize is logged and dropped rather than
    /// wedging the worker; its id stays reserved until a cleaner removes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Redis`] on connection failures.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<QueuedJob>> {
        let mut conn = self.redis.manager().await?;
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(self.ready_key())
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;

        let Some((_, payload)) = popped else {
            return Ok(None);
        };
        match serde_json::from_str::<QueuedJob>(&payload) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!(error = %e, payload, "dropping malformed job payload");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<bool> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.redis.manager().await?;
        let added: i64 = self
            .push_script
            .key(self.ids_key())
            .key(self.ready_key())
            .arg(&job.job_id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::from)?;

        if added == 0 {
            debug!(job_id = %job.job_id, "duplicate enqueue collapsed");
        }
        Ok(added == 1)
    }

    async fn schedule(&self, job: &QueuedJob, delay: Duration) -> Result<()> {
        let payload = serde_json::to_string(job)?;
        let due_at = Utc::now().timestamp_millis() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let mut conn = self.redis.manager().await?;

        // Keep the id reserved so a concurrent enqueue of the same id is
        // still collapsed while the retry waits.
        let _: () = redis::pipe()
            .atomic()
            .sadd(self.ids_key(), &job.job_id)
            .ignore()
            .zadd(self.scheduled_key(), payload, due_at)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;
        debug!(job_id = %job.job_id, due_at, "scheduled requeue");
        Ok(())
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        let mut conn = self.redis.manager().await?;
        let _removed: i64 = redis::cmd("SREM")
            .arg(self.ids_key())
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .map_err(Error::from)?;
        Ok(())
    }
}

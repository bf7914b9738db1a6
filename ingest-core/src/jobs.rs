//! Job identity and the queue-broker contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::Result;

/// Compute the deterministic job id for one page crawl.
///
/// Format: `crawl:{run_id}:{first 8 hex chars of sha256(url)}`. Two enqueue
/// attempts with identical `(run_id, url)` collapse into one queue entry;
/// a new run gets fresh ids.
#[must_use]
pub fn deterministic_job_id(run_id: Uuid, url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let url_hash = &hex::encode(digest)[..8];
    format!("crawl:{run_id}:{url_hash}")
}

/// Descriptor for one pending crawl, stored as JSON in the per-tenant
/// pending list and carried through the main job queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CrawlJobDescriptor {
    /// Groups retries of one logical crawl.
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub website_id: Uuid,
    pub url: String,
    pub enqueued_at: DateTime<Utc>,
}

impl CrawlJobDescriptor {
    /// The deterministic id this descriptor enqueues under.
    #[must_use]
    pub fn job_id(&self) -> String {
        deterministic_job_id(self.run_id, &self.url)
    }
}

/// Payload carried by a queued job, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum JobPayload {
    Crawl(CrawlJobDescriptor),
}

/// One entry in the main job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: String,
    #[serde(flatten)]
    pub payload: JobPayload,
}

impl QueuedJob {
    /// Wrap a crawl descriptor under its deterministic id.
    #[must_use]
    pub fn crawl(descriptor: CrawlJobDescriptor) -> Self {
        Self {
            job_id: descriptor.job_id(),
            payload: JobPayload::Crawl(descriptor),
        }
    }
}

/// The queue-broker contract the worker consumes from.
///
/// Required semantics: idempotent enqueue by `job_id` (the same id submitted
/// twice results in one execution), at-least-once delivery, and a visibility
/// window long enough for the longest crawl plus one retry delay.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue for immediate execution. Returns `false` when the id was
    /// already known and the submission was collapsed.
    async fn enqueue(&self, job: &QueuedJob) -> Result<bool>;

    /// Enqueue for execution after `delay`. Used for capacity-denied and
    /// retryable-failure requeues; keeps the id reserved.
    async fn schedule(&self, job: &QueuedJob, delay: Duration) -> Result<()>;

    /// Forget a finished or abandoned id so a later run can reuse the slot.
    async fn complete(&self, job_id: &str) -> Result<()>;
}

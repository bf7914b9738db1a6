//! Executes one crawl job end-to-end.
//!
//! ```text
//! received → slot-acquire
//!              | denied → requeue(delay=backoff) → end
//!              | granted ↓
//!            crawl-and-persist
//!              | transient-error → requeue(delay=backoff) → end
//!              | fatal-error     → record-failure       → end
//!              | success         → record-success, reset-backoff → end
//!            slot-release (always)
//! ```
//!
//! Retry accounting distinguishes capacity-denied requeues (not an attempt)
//! from actual execution failures (an attempt); without the distinction a
//! tenant sitting at its quota would age out legitimate jobs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff;
use crate::config::WorkerConfig;
use crate::jobs::{CrawlJobDescriptor, JobQueue};
use crate::limiter::{SlotPermit, TenantConcurrencyLimiter};
use crate::persist::{BatchPersister, PersistReport};
use crate::redis_pool::RedisPool;
use crate::storage::{TenantStore, WebsiteStore};
use crate::types::{CrawlContext, Page, Website};
use crate::{Error, Result};

/// External page source. The implementation fetches and extracts pages and
/// streams them into the channel; the runner owns batching and persistence.
///
/// `start_url` is the job's page URL: one run enqueues many per-page jobs,
/// so a single-page implementation emits exactly one page, while a walking
/// implementation may discover and emit more under the same website.
#[async_trait]
pub trait Crawler: Send + Sync {
    async fn crawl(
        &self,
        website: &Website,
        start_url: &str,
        pages: mpsc::Sender<Page>,
    ) -> Result<()>;
}

/// Tunables for one runner, lifted from [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_attempts: u32,
    pub max_age: Duration,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub page_batch_size: usize,
    pub embedding_timeout: Duration,
    pub max_batch_embedding_bytes: usize,
    pub max_transaction_wall_time: Duration,
}

impl From<&WorkerConfig> for RunnerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            max_age: Duration::from_secs(config.max_age_seconds),
            base_retry_delay: Duration::from_secs_f64(config.base_retry_delay_seconds),
            max_retry_delay: Duration::from_secs_f64(config.max_retry_delay_seconds),
            page_batch_size: config.page_batch_size.max(1),
            embedding_timeout: config.embedding_timeout(),
            max_batch_embedding_bytes: config.max_batch_embedding_bytes,
            max_transaction_wall_time: config.max_transaction_wall_time(),
        }
    }
}

/// Why a job was permanently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    MaxAttempts,
    MaxAge,
    TenantGone,
    TenantSuspended,
}

/// Terminal outcome of one job execution.
#[derive(Debug)]
pub enum CrawlOutcome {
    Completed(PersistReport),
    Requeued { attempt: u32, delay: Duration },
    Abandoned { reason: AbandonReason },
    Failed { error: String },
}

/// Runs crawl jobs: gates on the tenant semaphore, streams pages from the
/// crawler into the batch persister, and handles requeue/abandonment.
pub struct CrawlTaskRunner {
    limiter: Arc<TenantConcurrencyLimiter>,
    queue: Arc<dyn JobQueue>,
    crawler: Arc<dyn Crawler>,
    persister: Arc<BatchPersister>,
    websites: Arc<dyn WebsiteStore>,
    tenants: Arc<dyn TenantStore>,
    redis: Arc<RedisPool>,
    settings: RunnerSettings,
}

impl CrawlTaskRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        limiter: Arc<TenantConcurrencyLimiter>,
        queue: Arc<dyn JobQueue>,
        crawler: Arc<dyn Crawler>,
        persister: Arc<BatchPersister>,
        websites: Arc<dyn WebsiteStore>,
        tenants: Arc<dyn TenantStore>,
        redis: Arc<RedisPool>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            limiter,
            queue,
            crawler,
            persister,
            websites,
            tenants,
            redis,
            settings,
        }
    }

    /// Execute one crawl job. Never raises to the caller: every path maps to
    /// a [`CrawlOutcome`] and resources are released on the way out.
    pub async fn run(&self, descriptor: &CrawlJobDescriptor) -> CrawlOutcome {
        let job_id = descriptor.job_id();

        // Admission check: suspended tenants get no new jobs; in-flight jobs
        // elsewhere are allowed to finish.
        match self.tenants.get_tenant(descriptor.tenant_id).await {
            Ok(Some(tenant)) if tenant.is_active() => {}
            Ok(Some(_)) => {
                info!(job_id = %job_id, tenant_id = %descriptor.tenant_id, "tenant suspended, dropping job");
                self.finish_job(&job_id).await;
                return CrawlOutcome::Abandoned {
                    reason: AbandonReason::TenantSuspended,
                };
            }
            Ok(None) => {
                info!(job_id = %job_id, tenant_id = %descriptor.tenant_id, "tenant gone, dropping job");
                self.finish_job(&job_id).await;
                return CrawlOutcome::Abandoned {
                    reason: AbandonReason::TenantGone,
                };
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "tenant lookup failed");
                return self.handle_actual_failure(descriptor, &job_id, &e).await;
            }
        }

        let Some(permit) = self.limiter.acquire(descriptor.tenant_id).await else {
            return self.handle_capacity_denied(descriptor, &job_id).await;
        };
        let slot = SlotGuard::new(Arc::clone(&self.limiter), permit);

        let result = self.crawl_and_persist(descriptor).await;

        // Release before requeue bookkeeping so the slot is never held
        // across the retry delay. The guard also covers the panic path.
        slot.release().await;

        match result {
            Ok(report) => {
                debug!(job_id = %job_id,
                    success_count = report.success_count,
                    failed_count = report.failed_count,
                    "crawl completed");
                self.reset_backoff(descriptor.tenant_id).await;
                self.finish_job(&job_id).await;
                CrawlOutcome::Completed(report)
            }
            Err(e) if e.is_recoverable() => {
                warn!(job_id = %job_id, error = %e, "crawl failed with transient error");
                self.handle_actual_failure(descriptor, &job_id, &e).await
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "crawl failed permanently");
                self.finish_job(&job_id).await;
                CrawlOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// The crawl itself: stream pages from the crawler, persist in batches,
    /// stamp the website's crawl window.
    async fn crawl_and_persist(&self, descriptor: &CrawlJobDescriptor) -> Result<PersistReport> {
        let website = self
            .websites
            .get_website(descriptor.website_id)
            .await?
            .ok_or(Error::NotFound(descriptor.website_id))?;

        self.websites
            .mark_crawl_started(website.id, Utc::now())
            .await?;

        let model = match website.embedding_model_id {
            Some(model_id) => self.websites.get_embedding_model(model_id).await?,
            None => None,
        };

        let ctx = CrawlContext {
            run_id: descriptor.run_id,
            tenant_id: descriptor.tenant_id,
            website_id: website.id,
            user_id: website.user_id,
            embedding_timeout: self.settings.embedding_timeout,
            max_batch_embedding_bytes: self.settings.max_batch_embedding_bytes,
            max_transaction_wall_time: self.settings.max_transaction_wall_time,
        };

        let batch_size = self.settings.page_batch_size;
        let (tx, mut rx) = mpsc::channel::<Page>(batch_size * 2);
        let crawler = Arc::clone(&self.crawler);
        let crawl_site = website.clone();
        let start_url = descriptor.url.clone();
        let crawl_task =
            tokio::spawn(async move { crawler.crawl(&crawl_site, &start_url, tx).await });

        let mut report = PersistReport::new();
        let mut buffer: Vec<Page> = Vec::with_capacity(batch_size);
        while let Some(page) = rx.recv().await {
            buffer.push(page);
            if buffer.len() >= batch_size {
                let batch = std::mem::take(&mut buffer);
                report
                    .merge(self.persister.persist_batch(batch, &ctx, model.as_ref()).await);
            }
        }
        if !buffer.is_empty() {
            report.merge(self.persister.persist_batch(buffer, &ctx, model.as_ref()).await);
        }

        match crawl_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(join_error) => {
                return Err(Error::Crawl(format!("crawler task died: {join_error}")));
            }
        }

        self.websites
            .mark_crawl_finished(website.id, Utc::now())
            .await?;
        Ok(report)
    }

    /// Capacity denial: a first-class requeue signal, never a failure. Only
    /// the job's age is checked for abandonment here.
    async fn handle_capacity_denied(
        &self,
        descriptor: &CrawlJobDescriptor,
        job_id: &str,
    ) -> CrawlOutcome {
        let stats = self.update_retry_stats(job_id, false).await;
        if stats.age >= self.settings.max_age {
            warn!(job_id = %job_id, age_secs = stats.age.as_secs(), "job exceeded max age while waiting for capacity");
            self.finish_job(job_id).await;
            return CrawlOutcome::Abandoned {
                reason: AbandonReason::MaxAge,
            };
        }
        self.requeue(descriptor, job_id).await
    }

    /// A real execution failure: advances the retry counter, then either
    /// abandons or requeues with growing backoff.
    async fn handle_actual_failure(
        &self,
        descriptor: &CrawlJobDescriptor,
        job_id: &str,
        error: &Error,
    ) -> CrawlOutcome {
        let stats = self.update_retry_stats(job_id, true).await;
        if stats.retry_count >= self.settings.max_attempts {
            warn!(job_id = %job_id, retry_count = stats.retry_count, error = %error, "job exceeded max attempts");
            self.finish_job(job_id).await;
            return CrawlOutcome::Abandoned {
                reason: AbandonReason::MaxAttempts,
            };
        }
        if stats.age >= self.settings.max_age {
            warn!(job_id = %job_id, age_secs = stats.age.as_secs(), error = %error, "job exceeded max age");
            self.finish_job(job_id).await;
            return CrawlOutcome::Abandoned {
                reason: AbandonReason::MaxAge,
            };
        }
        self.requeue(descriptor, job_id).await
    }

    async fn requeue(&self, descriptor: &CrawlJobDescriptor, job_id: &str) -> CrawlOutcome {
        let (attempt, delay) = self.next_backoff(descriptor.tenant_id).await;
        let job = crate::jobs::QueuedJob::crawl(descriptor.clone());
        match self.queue.schedule(&job, delay).await {
            Ok(()) => {
                info!(job_id = %job_id, attempt, delay_secs = delay.as_secs_f64(), "requeued crawl job");
                CrawlOutcome::Requeued { attempt, delay }
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to requeue job");
                CrawlOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Advance the tenant's denial counter and compute a delay. When Redis
    /// is unavailable the counter is skipped and the delay falls back to a
    /// first-attempt jitter.
    async fn next_backoff(&self, tenant_id: Uuid) -> (u32, Duration) {
        match self.redis.manager().await {
            Ok(mut conn) => match backoff::next_tenant_backoff(
                &mut conn,
                tenant_id,
                self.settings.base_retry_delay,
                self.settings.max_retry_delay,
            )
            .await
            {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(tenant_id = %tenant_id, error = %e, "backoff counter unavailable");
                    (1, backoff::full_jitter(1, self.settings.base_retry_delay, self.settings.max_retry_delay))
                }
            },
            Err(e) => {
                debug!(tenant_id = %tenant_id, error = %e, "backoff counter unavailable");
                (1, backoff::full_jitter(1, self.settings.base_retry_delay, self.settings.max_retry_delay))
            }
        }
    }

    /// Delete the tenant's denial counter after a fully successful crawl.
    async fn reset_backoff(&self, tenant_id: Uuid) {
        if let Ok(mut conn) = self.redis.manager().await {
            backoff::reset_tenant_backoff(&mut conn, tenant_id).await;
        }
    }

    async fn finish_job(&self, job_id: &str) {
        if let Err(e) = self.queue.complete(job_id).await {
            debug!(job_id = %job_id, error = %e, "failed to release job id");
        }
    }

    async fn update_retry_stats(&self, job_id: &str, is_actual_failure: bool) -> JobRetryStats {
        match self.redis.manager().await {
            Ok(mut conn) => {
                update_job_retry_stats(&mut conn, job_id, is_actual_failure, self.settings.max_age)
                    .await
            }
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "retry stats unavailable");
                JobRetryStats::default()
            }
        }
    }
}

/// Holds a slot permit and guarantees release on every exit path.
///
/// Prefer the explicit [`SlotGuard::release`]; the `Drop` implementation is
/// the safety net for panics and early returns, spawning the async release
/// onto the runtime.
pub struct SlotGuard {
    limiter: Arc<TenantConcurrencyLimiter>,
    permit: Option<SlotPermit>,
}

impl SlotGuard {
    #[must_use]
    pub fn new(limiter: Arc<TenantConcurrencyLimiter>, permit: SlotPermit) -> Self {
        Self {
            limiter,
            permit: Some(permit),
        }
    }

    /// Release the slot now, using the path captured at acquire time.
    pub async fn release(mut self) {
        if let Some(permit) = self.permit.take() {
            self.limiter.release(permit).await;
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let limiter = Arc::clone(&self.limiter);
                handle.spawn(async move {
                    limiter.release(permit).await;
                });
            } else {
                warn!(tenant_id = %permit.tenant_id(), "slot permit dropped outside a runtime");
            }
        }
    }
}

/// Job retry statistics read back from Redis.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobRetryStats {
    /// Number of actual failures; capacity-denied requeues never count.
    pub retry_count: u32,
    /// Age since the first attempt.
    pub age: Duration,
}

/// Update job retry statistics in one pipeline.
///
/// Stamps `job:{id}:start_time` on the first attempt (`SET NX`), increments
/// `job:{id}:retry_count` only when `is_actual_failure`, and reads back both.
/// Degrades to zeros when Redis is unavailable: no tracking beats blocking
/// the job.
pub async fn update_job_retry_stats(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &str,
    is_actual_failure: bool,
    max_age: Duration,
) -> JobRetryStats {
    let start_key = format!("job:{job_id}:start_time");
    let count_key = format!("job:{job_id}:retry_count");
    let ttl = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX - 3600) + 3600;
    let now = Utc::now().timestamp_millis() as f64 / 1000.0;

    let outcome: redis::RedisResult<(Option<String>, Option<String>)> = if is_actual_failure {
        let raw: redis::RedisResult<(Option<String>, i64)> = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&start_key)
            .arg(now)
            .arg("NX")
            .arg("EX")
            .arg(ttl)
            .ignore()
            .cmd("GET")
            .arg(&start_key)
            .cmd("INCR")
            .arg(&count_key)
            .cmd("EXPIRE")
            .arg(&count_key)
            .arg(ttl)
            .ignore()
            .query_async(conn)
            .await;
        raw.map(|(start, count)| (start, Some(count.to_string())))
    } else {
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(&start_key)
            .arg(now)
            .arg("NX")
            .arg("EX")
            .arg(ttl)
            .ignore()
            .cmd("GET")
            .arg(&start_key)
            .cmd("GET")
            .arg(&count_key)
            .query_async(conn)
            .await
    };

    match outcome {
        Ok((start_raw, count_raw)) => {
            let started = start_raw.and_then(|s| s.parse::<f64>().ok()).unwrap_or(now);
            let retry_count = count_raw.and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);
            let age_secs = (now - started).max(0.0);
            JobRetryStats {
                retry_count,
                age: Duration::from_secs_f64(age_secs),
            }
        }
        Err(e) => {
            warn!(job_id = %job_id, error = %e, is_actual_failure, "failed to update job retry stats");
            JobRetryStats::default()
        }
    }
}

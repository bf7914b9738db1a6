//! Periodic maintenance jobs.
//!
//! Each loop is a pure function of time plus storage state; none interacts
//! with another, and each runs in its own transaction (or per-tenant
//! transactions) so one tenant's failure cannot roll back another's work.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::feeder::push_pending_crawl;
use crate::jobs::CrawlJobDescriptor;
use crate::redis_pool::RedisPool;
use crate::storage::{
    ConversationPurgeStats, ExportManifest, PurgeStats, RetentionStore, TenantStore, WebsiteStore,
};
use crate::subscriptions::{GraphToken, SubscriptionManager};
use crate::Result;

/// When a cron job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Every hour at the given minute.
    Hourly { minute: u32 },
    /// Every day at the given hour and minute (UTC).
    Daily { hour: u32, minute: u32 },
    /// Fixed interval, for sub-hourly loops.
    Every(Duration),
}

impl Cadence {
    /// Next fire time strictly after `now`.
    #[must_use]
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Cadence::Hourly { minute } => {
                let base = now
                    .with_minute(minute.min(59))
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                if base > now {
                    base
                } else {
                    base + ChronoDuration::hours(1)
                }
            }
            Cadence::Daily { hour, minute } => {
                let base = now
                    .with_hour(hour.min(23))
                    .and_then(|t| t.with_minute(minute.min(59)))
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(now);
                if base > now {
                    base
                } else {
                    base + ChronoDuration::days(1)
                }
            }
            Cadence::Every(interval) => {
                now + ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::seconds(60))
            }
        }
    }
}

/// Statistics from one `queue_due_websites` pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueDueStats {
    pub websites_due: usize,
    pub descriptors_queued: usize,
}

/// Build one fresh-run descriptor per due website.
///
/// Each pass mints a new `run_id`; retries within the run share it, so the
/// deterministic job id dedups retries but never blocks the next scheduled
/// run.
#[must_use]
pub fn pending_descriptors(due: &[crate::types::Website], now: DateTime<Utc>) -> Vec<CrawlJobDescriptor> {
    due.iter()
        .map(|website| CrawlJobDescriptor {
            run_id: Uuid::new_v4(),
            tenant_id: website.tenant_id,
            website_id: website.id,
            url: website.url.clone(),
            enqueued_at: now,
        })
        .collect()
}

/// Hourly: enqueue one feeder descriptor per due website.
///
/// Hourly cadence is deliberate: a single daily cron would let DAILY-interval
/// websites drift by up to 39 hours, while hourly checks cap drift at about
/// one hour and the due-website query stays cheap behind its index.
///
/// # Errors
///
/// Propagates storage failures and Redis failures from the pending push.
pub async fn queue_due_websites(
    websites: &dyn WebsiteStore,
    redis: &RedisPool,
    now: DateTime<Utc>,
) -> Result<QueueDueStats> {
    let due = websites.list_due_websites(now).await?;
    let mut stats = QueueDueStats {
        websites_due: due.len(),
        ..QueueDueStats::default()
    };
    if due.is_empty() {
        return Ok(stats);
    }

    let mut conn = redis.manager().await?;
    for descriptor in pending_descriptors(&due, now) {
        match push_pending_crawl(&mut conn, &descriptor).await {
            Ok(()) => stats.descriptors_queued += 1,
            Err(e) => {
                warn!(website_id = %descriptor.website_id, error = %e,
                    "failed to queue pending crawl");
            }
        }
    }

    info!(
        websites_due = stats.websites_due,
        queued = stats.descriptors_queued,
        "queued due websites"
    );
    Ok(stats)
}

/// Supplies API tokens for subscription maintenance. External collaborator:
/// token refresh and credential storage live outside the worker core.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token_for(&self, user_integration_id: Uuid) -> Result<GraphToken>;
}

/// Statistics from one subscription-renewal pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenewalStats {
    pub expiring: usize,
    pub renewed: usize,
    pub failed: usize,
}

/// Sub-hourly: renew subscriptions expiring within the threshold. Renewal
/// failures fall through to recreation inside the manager; each subscription
/// is handled independently.
///
/// # Errors
///
/// Propagates only the initial listing failure.
pub async fn renew_expiring_subscriptions(
    manager: &SubscriptionManager,
    tokens: &dyn TokenSource,
    threshold_hours: i64,
) -> Result<RenewalStats> {
    let expiring = manager.list_expiring(threshold_hours).await?;
    let mut stats = RenewalStats {
        expiring: expiring.len(),
        ..RenewalStats::default()
    };

    for subscription in expiring {
        let token = match tokens.token_for(subscription.user_integration_id).await {
            Ok(token) => token,
            Err(e) => {
                warn!(subscription_id = %subscription.id, error = %e,
                    "no token for subscription renewal");
                stats.failed += 1;
                continue;
            }
        };
        let is_onedrive = subscription.site_id.is_none();
        if manager.renew(&subscription, &token, is_onedrive).await {
            stats.renewed += 1;
        } else {
            stats.failed += 1;
        }
    }

    if stats.expiring > 0 {
        info!(
            expiring = stats.expiring,
            renewed = stats.renewed,
            failed = stats.failed,
            "subscription renewal pass complete"
        );
    }
    Ok(stats)
}

/// Daily: purge audit logs past each tenant's retention window.
///
/// Every tenant runs in its own storage transaction: one tenant's failure is
/// recorded and skipped, the others commit.
///
/// # Errors
///
/// Propagates only the tenant-listing failure.
pub async fn purge_audit_logs(
    tenants: &dyn TenantStore,
    retention: &dyn RetentionStore,
    now: DateTime<Utc>,
) -> Result<PurgeStats> {
    let all_tenants = tenants.list_all_tenants().await?;
    info!(tenants = all_tenants.len(), "starting audit log retention purge");

    let mut stats = PurgeStats::default();
    for tenant in all_tenants {
        match retention
            .purge_audit_logs_for_tenant(tenant.id, tenant.audit_retention_days, now)
            .await
        {
            Ok(purged) => {
                stats.tenants_processed += 1;
                stats.rows_purged += purged;
                if purged > 0 {
                    debug!(tenant_id = %tenant.id, purged,
                        retention_days = tenant.audit_retention_days,
                        "purged audit logs");
                }
            }
            Err(e) => {
                // This tenant's transaction rolled back; the others continue.
                stats.tenants_failed += 1;
                warn!(tenant_id = %tenant.id, error = %e, "audit purge failed for tenant");
            }
        }
    }

    info!(
        processed = stats.tenants_processed,
        failed = stats.tenants_failed,
        purged = stats.rows_purged,
        "audit log retention purge complete"
    );
    Ok(stats)
}

/// Daily: apply hierarchical conversation retention and sweep orphaned
/// sessions.
///
/// # Errors
///
/// Propagates storage failures.
pub async fn purge_conversations(
    retention: &dyn RetentionStore,
    now: DateTime<Utc>,
) -> Result<ConversationPurgeStats> {
    let stats = retention.purge_conversations(now).await?;
    info!(
        questions = stats.questions_deleted,
        app_runs = stats.app_runs_deleted,
        orphaned_sessions = stats.orphaned_sessions_deleted,
        "conversation retention purge complete"
    );
    Ok(stats)
}

/// Statistics from one pending-queue cleanup pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PendingCleanupStats {
    pub queues_scanned: usize,
    pub queues_dropped: usize,
    pub entries_dropped: u64,
}

/// Nightly: drop pending queues whose tenant no longer exists.
///
/// A tenant deleted while its queue was non-empty leaves entries the feeder
/// will never drain (in-flight drains fail with tenant-not-found); this
/// sweep removes them. Suspended tenants keep their queues: their entries
/// become eligible again on reactivation.
///
/// # Errors
///
/// Propagates Redis scan failures and the tenant-listing failure.
pub async fn cleanup_orphaned_pending_queues(
    tenants: &dyn TenantStore,
    redis: &RedisPool,
) -> Result<PendingCleanupStats> {
    let known: std::collections::HashSet<Uuid> = tenants
        .list_all_tenants()
        .await?
        .into_iter()
        .map(|t| t.id)
        .collect();

    let mut stats = PendingCleanupStats::default();
    let mut conn = redis.manager().await?;
    let mut cursor: u64 = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg("tenant:*:crawl_pending")
            .arg("COUNT")
            .arg(100)
            .query_async(&mut conn)
            .await?;

        for key in keys {
            stats.queues_scanned += 1;
            let tenant_id = key
                .strip_prefix("tenant:")
                .and_then(|rest| rest.strip_suffix(":crawl_pending"))
                .and_then(|raw| raw.parse::<Uuid>().ok());
            let Some(tenant_id) = tenant_id else {
                warn!(key, "pending queue key does not parse, leaving it");
                continue;
            };
            if known.contains(&tenant_id) {
                continue;
            }

            let entries: i64 = redis::cmd("LLEN").arg(&key).query_async(&mut conn).await?;
            let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            stats.queues_dropped += 1;
            stats.entries_dropped += u64::try_from(entries).unwrap_or(0);
            info!(tenant_id = %tenant_id, entries, "dropped pending queue of vanished tenant");
        }

        cursor = next;
        if cursor == 0 {
            break;
        }
    }
    Ok(stats)
}

/// Statistics from one export-cleanup pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExportCleanupStats {
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub manifests_cleaned: usize,
    pub errors: usize,
}

const EXPORT_KEY_PATTERN: &str = "audit_export:*";

/// Daily: delete expired export files and their Redis manifests, then sweep
/// orphaned files whose manifest already expired out of Redis.
///
/// # Errors
///
/// Propagates Redis scan failures; per-file problems are counted, not raised.
pub async fn cleanup_export_files(
    redis: &RedisPool,
    export_dir: &Path,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<ExportCleanupStats> {
    let mut stats = ExportCleanupStats::default();
    let mut conn = redis.manager().await?;

    // Pass 1: manifests in Redis.
    let mut cursor: u64 = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(EXPORT_KEY_PATTERN)
            .arg("COUNT")
            .arg(100)
            .query_async(&mut conn)
            .await?;

        for key in keys {
            let raw: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
            let Some(raw) = raw else { continue };
            let manifest: ExportManifest = match serde_json::from_str(&raw) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!(key, error = %e, "dropping unreadable export manifest");
                    let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                    stats.errors += 1;
                    continue;
                }
            };
            if manifest.expires_at > now {
                continue;
            }

            match tokio::fs::metadata(&manifest.file_path).await {
                Ok(meta) => match tokio::fs::remove_file(&manifest.file_path).await {
                    Ok(()) => {
                        stats.files_deleted += 1;
                        stats.bytes_freed += meta.len();
                        debug!(path = %manifest.file_path.display(), "deleted export file");
                    }
                    Err(e) => {
                        warn!(path = %manifest.file_path.display(), error = %e,
                            "failed to delete export file");
                        stats.errors += 1;
                        continue;
                    }
                },
                // File already gone: still clean the manifest.
                Err(_) => {}
            }

            let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            stats.manifests_cleaned += 1;
        }

        cursor = next;
        if cursor == 0 {
            break;
        }
    }

    // Pass 2: orphaned files whose manifest key expired on its own.
    let (orphans_deleted, orphan_bytes, orphan_errors) =
        sweep_orphaned_files(export_dir, max_age, now).await;
    stats.files_deleted += orphans_deleted;
    stats.bytes_freed += orphan_bytes;
    stats.errors += orphan_errors;

    info!(
        files_deleted = stats.files_deleted,
        bytes_freed = stats.bytes_freed,
        manifests_cleaned = stats.manifests_cleaned,
        errors = stats.errors,
        "export cleanup complete"
    );
    Ok(stats)
}

/// Delete files under `export_dir/{tenant}/` older than `max_age`, removing
/// tenant directories left empty. Returns (files, bytes, errors).
pub async fn sweep_orphaned_files(
    export_dir: &Path,
    max_age: Duration,
    now: DateTime<Utc>,
) -> (usize, u64, usize) {
    let mut files_deleted = 0usize;
    let mut bytes_freed = 0u64;
    let mut errors = 0usize;

    let Ok(mut tenant_dirs) = tokio::fs::read_dir(export_dir).await else {
        return (0, 0, 0);
    };

    while let Ok(Some(tenant_dir)) = tenant_dirs.next_entry().await {
        let tenant_path = tenant_dir.path();
        if !tenant_path.is_dir() {
            continue;
        }

        let Ok(mut files) = tokio::fs::read_dir(&tenant_path).await else {
            errors += 1;
            continue;
        };
        while let Ok(Some(file)) = files.next_entry().await {
            let path = file.path();
            let Ok(meta) = file.metadata().await else {
                errors += 1;
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                errors += 1;
                continue;
            };
            let age = now
                .signed_duration_since(DateTime::<Utc>::from(modified))
                .to_std()
                .unwrap_or(Duration::ZERO);
            if age > max_age {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        files_deleted += 1;
                        bytes_freed += meta.len();
                        debug!(path = %path.display(), "deleted orphaned export file");
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to delete orphan");
                        errors += 1;
                    }
                }
            }
        }

        // Drop tenant directories left empty; failures here are harmless.
        let _ = tokio::fs::remove_dir(&tenant_path).await;
    }

    (files_deleted, bytes_freed, errors)
}

/// A scheduled job: a cadence plus the loop body.
pub struct CronJob {
    pub name: &'static str,
    pub cadence: Cadence,
    pub run: Arc<dyn Fn() -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync>,
}

/// Drive a set of cron jobs until shutdown. Each job sleeps to its next fire
/// time independently; a failing run is logged and the job keeps its
/// schedule.
pub async fn run_cron_jobs(jobs: Vec<CronJob>, shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut handles = Vec::new();
    for job in jobs {
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = job.cadence.next_after(now);
                let sleep_for = (next - now).to_std().unwrap_or(Duration::from_secs(1));
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                debug!(job = job.name, "cron job firing");
                if let Err(e) = (job.run)().await {
                    warn!(job = job.name, error = %e, "cron job failed");
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

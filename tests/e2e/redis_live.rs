//! Flows that need a live Redis at `redis://127.0.0.1:6379/15`.
//!
//! Run with `cargo test -- --ignored` when a local server is up. Database 15
//! keeps these keys away from development data; every test namespaces by
//! fresh UUIDs so runs do not interfere with each other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ingest_core::backoff::{next_tenant_backoff, reset_tenant_backoff};
use ingest_core::feeder::{pending_queue_key, push_pending_crawl, CrawlFeeder};
use ingest_core::jobs::{CrawlJobDescriptor, JobQueue, QueuedJob};
use ingest_core::limiter::{AcquireMode, TenantConcurrencyLimiter};
use ingest_core::queue::RedisJobQueue;
use ingest_core::redis_pool::RedisPool;
use ingest_core::storage::TenantStore;
use ingest_core::{Result, Tenant, TenantState, WorkerConfig};
use uuid::Uuid;

const REDIS_URL: &str = "redis://127.0.0.1:6379/15";

fn pool() -> Arc<RedisPool> {
    Arc::new(
        RedisPool::new(REDIS_URL)
            .expect("pool")
            .with_connect_timeout(Duration::from_secs(2)),
    )
}

fn limiter(pool: &Arc<RedisPool>, max_concurrent: u32) -> Arc<TenantConcurrencyLimiter> {
    let config = WorkerConfig::default()
        .with_max_concurrent(max_concurrent)
        .with_local_limit(0);
    Arc::new(TenantConcurrencyLimiter::new(Arc::clone(pool), &config))
}

struct StaticTenants {
    tenants: Vec<Tenant>,
}

#[async_trait]
impl TenantStore for StaticTenants {
    async fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.tenants.clone())
    }

    async fn list_all_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.tenants.clone())
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>> {
        Ok(self.tenants.iter().find(|t| t.id == id).cloned())
    }
}

fn tenant() -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        name: "live-test".to_string(),
        state: TenantState::Active,
        audit_retention_days: 365,
        conversation_retention_days: None,
    }
}

fn descriptor(tenant_id: Uuid, url: &str) -> CrawlJobDescriptor {
    CrawlJobDescriptor {
        run_id: Uuid::new_v4(),
        tenant_id,
        website_id: Uuid::new_v4(),
        url: url.to_string(),
        enqueued_at: chrono::Utc::now(),
    }
}

#[tokio::test]
#[ignore = "requires redis"]
async fn concurrent_acquires_never_exceed_the_limit() {
    let pool = pool();
    let limiter = limiter(&pool, 2);
    let tenant_id = Uuid::new_v4();

    // Five tasks each acquire (retrying on denial), hold 100 ms, release.
    let mut handles = Vec::new();
    for _ in 0..5 {
        let limiter = Arc::clone(&limiter);
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            let permit = loop {
                if let Some(permit) = limiter.acquire(tenant_id).await {
                    break permit;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            assert_eq!(permit.mode(), AcquireMode::Redis);

            // Observe the shared counter while holding the slot.
            let mut conn = pool.manager().await.expect("conn");
            let active: Option<String> = redis::cmd("GET")
                .arg(format!("tenant:{tenant_id}:active_jobs"))
                .query_async(&mut conn)
                .await
                .expect("get");
            let active: u32 = active.unwrap_or_default().parse().unwrap_or(0);
            assert!(active <= 2, "counter exceeded the limit: {active}");

            tokio::time::sleep(Duration::from_millis(100)).await;
            limiter.release(permit).await;
        }));
    }
    for handle in handles {
        handle.await.expect("task");
    }

    // All slots returned.
    let mut conn = pool.manager().await.expect("conn");
    let remaining: Option<String> = redis::cmd("GET")
        .arg(format!("tenant:{tenant_id}:active_jobs"))
        .query_async(&mut conn)
        .await
        .expect("get");
    assert!(remaining.is_none() || remaining.as_deref() == Some("0"));
}

#[tokio::test]
#[ignore = "requires redis"]
async fn release_without_acquire_does_not_underflow() {
    let pool = pool();
    let limiter = limiter(&pool, 2);
    let tenant_id = Uuid::new_v4();

    // Acquire-release, then a crash-replayed release arriving after TTL
    // cleanup: the guarded decrement must not push the counter negative.
    let permit = limiter.acquire(tenant_id).await.expect("grant");
    limiter.release(permit).await;

    let phantom = limiter.acquire(tenant_id).await.expect("grant");
    limiter.release(phantom).await;

    let capacity = limiter.available_capacity(tenant_id).await;
    assert_eq!(capacity, 2, "counter must be back at zero");
}

#[tokio::test]
#[ignore = "requires redis"]
async fn exactly_one_feeder_wins_the_leader_race() {
    let pool = pool();
    let mut conn = pool.manager().await.expect("conn");
    let _: () = redis::cmd("DEL")
        .arg("crawl_feeder:leader")
        .query_async(&mut conn)
        .await
        .expect("del");

    let queue: Arc<dyn JobQueue> = Arc::new(test_utils::InMemoryJobQueue::new());
    let limiter = limiter(&pool, 5);
    let tenants: Arc<dyn TenantStore> = Arc::new(StaticTenants { tenants: vec![] });

    let feeders: Vec<CrawlFeeder> = (0..5)
        .map(|_| {
            CrawlFeeder::new(
                Arc::clone(&pool),
                Arc::clone(&queue),
                Arc::clone(&limiter),
                Arc::clone(&tenants),
                30,
                Duration::from_secs(10),
            )
        })
        .collect();

    let results = futures::future::join_all(
        feeders
            .iter()
            .map(|feeder| async {
                let mut conn = pool.manager().await.expect("conn");
                feeder
                    .try_acquire_leader_lock(&mut conn)
                    .await
                    .expect("lock attempt")
            })
            .collect::<Vec<_>>(),
    )
    .await;

    assert_eq!(
        results.iter().filter(|won| **won).count(),
        1,
        "split-brain: expected exactly one leader"
    );
    assert_eq!(feeders.iter().filter(|f| f.is_leader()).count(), 1);

    let _: () = redis::cmd("DEL")
        .arg("crawl_feeder:leader")
        .query_async(&mut conn)
        .await
        .expect("cleanup");
}

#[tokio::test]
#[ignore = "requires redis"]
async fn feeder_drains_only_up_to_capacity_and_skips_malformed_entries() {
    let pool = pool();
    let mut conn = pool.manager().await.expect("conn");

    let tenant = tenant();
    let queue = Arc::new(test_utils::InMemoryJobQueue::new());
    let limiter = limiter(&pool, 2);
    let feeder = CrawlFeeder::new(
        Arc::clone(&pool),
        Arc::clone(&queue) as Arc<dyn JobQueue>,
        Arc::clone(&limiter),
        Arc::new(StaticTenants {
            tenants: vec![tenant.clone()],
        }),
        30,
        Duration::from_secs(10),
    );

    // Three valid entries plus one malformed entry at the head.
    let _: i64 = redis::cmd("RPUSH")
        .arg(pending_queue_key(tenant.id))
        .arg("not valid json {{{")
        .query_async(&mut conn)
        .await
        .expect("push");
    for i in 0..3 {
        push_pending_crawl(&mut conn, &descriptor(tenant.id, &format!("https://t/{i}")))
            .await
            .expect("push");
    }

    let stats = feeder.feed_once(&mut conn).await.expect("feed");
    assert_eq!(stats.malformed_skipped, 1);
    // Capacity 2: the malformed head entry plus one valid entry consumed.
    assert_eq!(stats.jobs_enqueued, 1);

    let remaining: i64 = redis::cmd("LLEN")
        .arg(pending_queue_key(tenant.id))
        .query_async(&mut conn)
        .await
        .expect("llen");
    assert_eq!(remaining, 2, "unhandled entries stay queued");

    let _: () = redis::cmd("DEL")
        .arg(pending_queue_key(tenant.id))
        .query_async(&mut conn)
        .await
        .expect("cleanup");
}

#[tokio::test]
#[ignore = "requires redis"]
async fn queue_enqueue_is_idempotent_and_promote_moves_scheduled_jobs() {
    let pool = pool();
    let namespace = format!("ingest_jobs_test_{}", Uuid::new_v4().simple());
    let queue = RedisJobQueue::with_namespace(Arc::clone(&pool), &namespace);

    let job = QueuedJob::crawl(descriptor(Uuid::new_v4(), "https://example.com/a"));
    assert!(queue.enqueue(&job).await.expect("first"));
    assert!(!queue.enqueue(&job).await.expect("duplicate"));

    let popped = queue
        .dequeue(Duration::from_secs(1))
        .await
        .expect("dequeue")
        .expect("job");
    assert_eq!(popped.job_id, job.job_id);
    assert!(queue
        .dequeue(Duration::from_secs(1))
        .await
        .expect("dequeue")
        .is_none());

    // A scheduled retry becomes visible after promote_due.
    queue
        .schedule(&job, Duration::from_millis(10))
        .await
        .expect("schedule");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let promoted = queue.promote_due().await.expect("promote");
    assert_eq!(promoted, 1);
    let retried = queue
        .dequeue(Duration::from_secs(1))
        .await
        .expect("dequeue")
        .expect("job");
    assert_eq!(retried.job_id, job.job_id);

    // Completion frees the id for the next run.
    queue.complete(&job.job_id).await.expect("complete");
    assert!(queue.enqueue(&job).await.expect("re-enqueue"));
}

#[tokio::test]
#[ignore = "requires redis"]
async fn vanished_tenants_pending_queue_is_dropped_by_the_cleaner() {
    let pool = pool();
    let mut conn = pool.manager().await.expect("conn");

    let live = tenant();
    let vanished_id = Uuid::new_v4();
    push_pending_crawl(&mut conn, &descriptor(live.id, "https://live/1"))
        .await
        .expect("push");
    push_pending_crawl(&mut conn, &descriptor(vanished_id, "https://gone/1"))
        .await
        .expect("push");

    let tenants = StaticTenants {
        tenants: vec![live.clone()],
    };
    let stats = ingest_core::cron::cleanup_orphaned_pending_queues(&tenants, &pool)
        .await
        .expect("cleanup");
    assert!(stats.queues_dropped >= 1);

    let live_len: i64 = redis::cmd("LLEN")
        .arg(pending_queue_key(live.id))
        .query_async(&mut conn)
        .await
        .expect("llen");
    assert_eq!(live_len, 1, "live tenant keeps its queue");
    let gone_len: i64 = redis::cmd("LLEN")
        .arg(pending_queue_key(vanished_id))
        .query_async(&mut conn)
        .await
        .expect("llen");
    assert_eq!(gone_len, 0);

    let _: () = redis::cmd("DEL")
        .arg(pending_queue_key(live.id))
        .query_async(&mut conn)
        .await
        .expect("cleanup");
}

#[tokio::test]
#[ignore = "requires redis"]
async fn backoff_counter_grows_until_reset() {
    let pool = pool();
    let mut conn = pool.manager().await.expect("conn");
    let tenant_id = Uuid::new_v4();
    let base = Duration::from_secs(10);
    let max = Duration::from_secs(60);

    let mut attempts = Vec::new();
    for _ in 0..5 {
        let (attempt, delay) = next_tenant_backoff(&mut conn, tenant_id, base, max)
            .await
            .expect("backoff");
        assert!(delay <= max);
        attempts.push(attempt);
    }
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);

    // Successful completion deletes the counter; delays return to base.
    reset_tenant_backoff(&mut conn, tenant_id).await;
    let (attempt, delay) = next_tenant_backoff(&mut conn, tenant_id, base, max)
        .await
        .expect("backoff");
    assert_eq!(attempt, 1);
    assert!(delay <= base);
}

#[tokio::test]
#[ignore = "requires redis"]
async fn capacity_hint_reflects_the_live_counter() {
    let pool = pool();
    let limiter = limiter(&pool, 5);
    let tenant_id = Uuid::new_v4();

    assert_eq!(limiter.available_capacity(tenant_id).await, 5);

    let first = limiter.acquire(tenant_id).await.expect("grant");
    let second = limiter.acquire(tenant_id).await.expect("grant");
    assert_eq!(limiter.available_capacity(tenant_id).await, 3);

    limiter.release(first).await;
    limiter.release(second).await;
    assert_eq!(limiter.available_capacity(tenant_id).await, 5);
}

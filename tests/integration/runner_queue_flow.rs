//! Runner against the in-memory queue: requeue, idempotence, and completion
//! flow with a real local database behind the persister.

use std::sync::Arc;
use std::time::Duration;

use ingest_core::embeddings::{
    EmbeddingProvider, EmbeddingProviderFactory, EmbeddingThrottle, MockEmbeddingProvider,
};
use ingest_core::jobs::{JobQueue, QueuedJob};
use ingest_core::limiter::TenantConcurrencyLimiter;
use ingest_core::persist::BatchPersister;
use ingest_core::queue::RedisJobQueue;
use ingest_core::redis_pool::RedisPool;
use ingest_core::runner::{CrawlOutcome, CrawlTaskRunner, RunnerSettings};
use ingest_core::storage::{BlobStore, CredentialStore, TenantStore, WebsiteStore};
use ingest_core::{EmbeddingModelSpec, ProviderCredentials, WorkerConfig};
use ingest_storage_turso::{insert_tenant, insert_website, IngestStore};
use libsql::params;
use test_utils::{create_test_page, create_test_tenant, create_test_website, InMemoryJobQueue, StaticCrawler};
use uuid::Uuid;

struct MockFactory;

impl EmbeddingProviderFactory for MockFactory {
    fn build(
        &self,
        model: &EmbeddingModelSpec,
        _credentials: &ProviderCredentials,
    ) -> Arc<dyn EmbeddingProvider> {
        Arc::new(MockEmbeddingProvider::new(model.dimensions))
    }
}

struct Fixture {
    store: Arc<IngestStore>,
    queue: Arc<InMemoryJobQueue>,
    website: ingest_core::Website,
}

static MEM_DB_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

async fn fixture() -> Fixture {
    let id = MEM_DB_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let db = libsql::Builder::new_local(format!("file:runner_queue_flow_mem_{id}?mode=memory&cache=shared"))
        .build()
        .await
        .expect("in-memory db");
    // Shared-cache in-memory databases are freed once their last
    // connection closes; leak one connection so the schema survives
    // across the fresh connections each store operation opens.
    std::mem::forget(db.connect().expect("keep-alive connection"));
    let store = Arc::new(IngestStore::from_database(db));
    store.initialize_schema().await.expect("schema");

    let tenant = create_test_tenant("acme");
    insert_tenant(&store, &tenant).await.expect("tenant");

    let provider_id = Uuid::new_v4();
    let model_id = Uuid::new_v4();
    let conn = store.get_connection().expect("conn");
    conn.execute(
        "INSERT INTO embedding_providers (id, name, api_base, api_key) VALUES (?, ?, ?, ?)",
        params![
            provider_id.to_string(),
            "hosted".to_string(),
            "https://api.example.com/v1".to_string(),
            "sk-test".to_string()
        ],
    )
    .await
    .expect("provider");
    conn.execute(
        "INSERT INTO embedding_models (id, name, provider_id, dimensions) VALUES (?, ?, ?, ?)",
        params![
            model_id.to_string(),
            "mock-embedding-model".to_string(),
            provider_id.to_string(),
            8i64
        ],
    )
    .await
    .expect("model");

    let mut website = create_test_website(tenant.id, "https://example.com/page");
    website.embedding_model_id = Some(model_id);
    insert_website(&store, &website).await.expect("website");

    Fixture {
        store,
        queue: Arc::new(InMemoryJobQueue::new()),
        website,
    }
}

fn runner_with(
    fixture: &Fixture,
    crawler: StaticCrawler,
    local_limit: u32,
) -> CrawlTaskRunner {
    let redis = Arc::new(
        RedisPool::new("redis://127.0.0.1:1/0")
            .expect("pool")
            .with_connect_timeout(Duration::from_millis(100)),
    );
    let config = WorkerConfig::default().with_local_limit(local_limit);
    let limiter = Arc::new(TenantConcurrencyLimiter::new(Arc::clone(&redis), &config));
    let persister = Arc::new(BatchPersister::new(
        Arc::clone(&fixture.store) as Arc<dyn CredentialStore>,
        Arc::clone(&fixture.store) as Arc<dyn BlobStore>,
        Arc::new(MockFactory),
        EmbeddingThrottle::isolated(3),
    ));
    CrawlTaskRunner::new(
        limiter,
        Arc::clone(&fixture.queue) as Arc<dyn ingest_core::jobs::JobQueue>,
        Arc::new(crawler),
        persister,
        Arc::clone(&fixture.store) as Arc<dyn WebsiteStore>,
        Arc::clone(&fixture.store) as Arc<dyn TenantStore>,
        redis,
        RunnerSettings::from(&config),
    )
}

#[tokio::test]
async fn completed_job_persists_pages_and_stamps_the_website() {
    let fixture = fixture().await;
    let crawler = StaticCrawler::new(vec![
        create_test_page("https://example.com/page", "the page body text"),
    ]);
    let runner = runner_with(&fixture, crawler, 2);

    let descriptor = test_utils::create_test_descriptor(&fixture.website);
    let job = QueuedJob::crawl(descriptor.clone());
    fixture.queue.enqueue(&job).await.expect("enqueue");
    fixture.queue.take_ready();

    let outcome = runner.run(&descriptor).await;
    let CrawlOutcome::Completed(report) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(report.success_count, 1);

    // The job id was released: the same descriptor can be enqueued again.
    assert_eq!(fixture.queue.known_id_count(), 0);
    assert!(fixture.queue.enqueue(&job).await.expect("re-enqueue"));

    let loaded = fixture
        .store
        .get_website(fixture.website.id)
        .await
        .expect("website")
        .expect("website row");
    assert!(loaded.last_crawl_finished_at.is_some());
    assert!(!loaded.has_crawl_in_flight());
}

#[tokio::test]
async fn duplicate_descriptors_collapse_to_one_queue_entry() {
    let fixture = fixture().await;
    let descriptor = test_utils::create_test_descriptor(&fixture.website);

    let first = QueuedJob::crawl(descriptor.clone());
    let second = QueuedJob::crawl(descriptor);

    assert!(fixture.queue.enqueue(&first).await.expect("first"));
    assert!(!fixture.queue.enqueue(&second).await.expect("second"));
    assert_eq!(fixture.queue.take_ready().len(), 1);
}

#[tokio::test]
async fn denied_capacity_schedules_a_retry_instead_of_failing() {
    let fixture = fixture().await;
    let crawler = StaticCrawler::new(vec![]);
    // local_limit 0 plus unreachable Redis: every acquire is denied.
    let runner = runner_with(&fixture, crawler, 0);

    let descriptor = test_utils::create_test_descriptor(&fixture.website);
    let outcome = runner.run(&descriptor).await;
    assert!(matches!(outcome, CrawlOutcome::Requeued { .. }));

    let scheduled = fixture.queue.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].0.job_id, descriptor.job_id());

    // The website was never touched.
    let loaded = fixture
        .store
        .get_website(fixture.website.id)
        .await
        .expect("website")
        .expect("row");
    assert!(loaded.last_crawl_started_at.is_none());
}

#[tokio::test]
async fn transient_failure_keeps_the_job_id_reserved_for_the_retry() {
    let fixture = fixture().await;
    let crawler = StaticCrawler::new(vec![create_test_page(
        "https://example.com/page",
        "partial body",
    )])
    .failing_with("connection reset by peer");
    let runner = runner_with(&fixture, crawler, 2);

    let descriptor = test_utils::create_test_descriptor(&fixture.website);
    let job = QueuedJob::crawl(descriptor.clone());
    fixture.queue.enqueue(&job).await.expect("enqueue");
    fixture.queue.take_ready();

    let outcome = runner.run(&descriptor).await;
    assert!(matches!(outcome, CrawlOutcome::Requeued { .. }));

    // Still known: a duplicate enqueue collapses while the retry waits.
    assert_eq!(fixture.queue.known_id_count(), 1);
    assert!(!fixture.queue.enqueue(&job).await.expect("dup"));
    assert_eq!(fixture.queue.scheduled().len(), 1);
}

/// The in-memory queue mirrors the contract the Redis queue implements; the
/// suite in `e2e/redis_live.rs` runs the same flows against a live server.
#[tokio::test]
async fn redis_queue_surfaces_connection_errors_as_recoverable() {
    let redis = Arc::new(
        RedisPool::new("redis://127.0.0.1:1/0")
            .expect("pool")
            .with_connect_timeout(Duration::from_millis(100)),
    );
    let queue = RedisJobQueue::new(redis);
    let fixture_site = create_test_website(Uuid::new_v4(), "https://example.com");
    let job = QueuedJob::crawl(test_utils::create_test_descriptor(&fixture_site));

    let err = ingest_core::jobs::JobQueue::enqueue(&queue, &job)
        .await
        .expect_err("unreachable redis");
    assert!(err.is_recoverable());
    let _ = format!("{err}");
}

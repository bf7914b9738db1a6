//! Two-phase persister against a real local database.

use std::sync::Arc;
use std::time::Duration;

use ingest_core::embeddings::{
    EmbeddingProvider, EmbeddingProviderFactory, EmbeddingThrottle, MockEmbeddingProvider,
};
use ingest_core::persist::{BatchPersister, FailureReason};
use ingest_core::storage::{BlobStore, CredentialStore};
use ingest_core::{CrawlContext, EmbeddingModelSpec, Page, ProviderCredentials};
use ingest_storage_turso::IngestStore;
use libsql::params;
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

async fn store_with_provider(provider_id: Uuid) -> Arc<IngestStore> {
    let db = libsql::Builder::new_local("file::memory:?cache=shared")
        .build()
        .await
        .expect("in-memory db");
    let store = IngestStore::from_database(db);
    store.initialize_schema().await.expect("schema");

    let conn = store.get_connection().expect("connection");
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
    .expect("seed provider");
    Arc::new(store)
}

fn persister(store: Arc<IngestStore>) -> BatchPersister {
    BatchPersister::new(
        Arc::clone(&store) as Arc<dyn CredentialStore>,
        store as Arc<dyn BlobStore>,
        Arc::new(MockFactory),
        EmbeddingThrottle::isolated(3),
    )
}

fn model(provider_id: Uuid) -> EmbeddingModelSpec {
    EmbeddingModelSpec {
        id: Uuid::new_v4(),
        name: "mock-embedding-model".to_string(),
        provider_id: Some(provider_id),
        dimensions: 8,
    }
}

fn context(website_id: Uuid) -> CrawlContext {
    CrawlContext {
        run_id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        website_id,
        user_id: Uuid::new_v4(),
        embedding_timeout: Duration::from_secs(5),
        max_batch_embedding_bytes: 64 * 1024 * 1024,
        max_transaction_wall_time: Duration::from_secs(30),
    }
}

fn page(url: &str, content: &str) -> Page {
    Page {
        url: url.to_string(),
        content: content.to_string(),
    }
}

async fn count_blobs(store: &IngestStore) -> i64 {
    let conn = store.get_connection().expect("connection");
    let mut rows = conn
        .query("SELECT COUNT(*) FROM info_blobs", ())
        .await
        .expect("count");
    rows.next()
        .await
        .expect("row")
        .expect("row")
        .get(0)
        .expect("value")
}

#[tokio::test]
async fn batch_with_an_empty_page_persists_the_rest() {
    let provider_id = Uuid::new_v4();
    let store = store_with_provider(provider_id).await;
    let persister = persister(Arc::clone(&store));
    let website_id = Uuid::new_v4();

    let report = persister
        .persist_batch(
            vec![
                page("https://example.com/1", "first page body"),
                page("https://example.com/2", "   "),
                page("https://example.com/3", "third page body"),
            ],
            &context(website_id),
            Some(&model(provider_id)),
        )
        .await;

    assert_eq!(report.success_count, 2);
    assert_eq!(report.failed_count, 1);
    assert_eq!(
        report.successful_urls,
        vec![
            "https://example.com/1".to_string(),
            "https://example.com/3".to_string()
        ]
    );
    assert_eq!(
        report.failures_by_reason[&FailureReason::EmptyContent],
        vec!["https://example.com/2".to_string()]
    );
    assert_eq!(count_blobs(&store).await, 2);
}

#[tokio::test]
async fn every_successful_url_has_a_blob_row_and_none_is_also_failed() {
    let provider_id = Uuid::new_v4();
    let store = store_with_provider(provider_id).await;
    let persister = persister(Arc::clone(&store));
    let website_id = Uuid::new_v4();

    let report = persister
        .persist_batch(
            vec![
                page("https://example.com/a", "alpha body"),
                page("https://example.com/b", ""),
                page("https://example.com/c", "gamma body"),
            ],
            &context(website_id),
            Some(&model(provider_id)),
        )
        .await;

    // Every successful URL corresponds to a persisted row.
    let conn = store.get_connection().expect("connection");
    for url in &report.successful_urls {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM info_blobs WHERE url = ?",
                params![url.clone()],
            )
            .await
            .expect("query");
        let count: i64 = rows.next().await.expect("row").expect("row").get(0).expect("value");
        assert_eq!(count, 1, "missing blob row for {url}");
    }

    // No URL appears in both successful_urls and failures_by_reason.
    let failed: Vec<&str> = report
        .failures_by_reason
        .values()
        .flatten()
        .map(String::as_str)
        .collect();
    for url in &report.successful_urls {
        assert!(!failed.contains(&url.as_str()));
    }
}

#[tokio::test]
async fn reingesting_the_same_urls_replaces_instead_of_duplicating() {
    let provider_id = Uuid::new_v4();
    let store = store_with_provider(provider_id).await;
    let persister = persister(Arc::clone(&store));
    let website_id = Uuid::new_v4();
    let spec = model(provider_id);

    for content in ["first version of the page", "second version of the page"] {
        let report = persister
            .persist_batch(
                vec![page("https://example.com/page", content)],
                &context(website_id),
                Some(&spec),
            )
            .await;
        assert_eq!(report.success_count, 1);
    }

    assert_eq!(count_blobs(&store).await, 1);

    let conn = store.get_connection().expect("connection");
    let mut rows = conn
        .query("SELECT text FROM info_blobs", ())
        .await
        .expect("query");
    let text: String = rows
        .next()
        .await
        .expect("row")
        .expect("row")
        .get(0)
        .expect("value");
    assert_eq!(text, "second version of the page");
}

#[tokio::test]
async fn unknown_provider_fails_the_batch_without_touching_the_db() {
    let store = store_with_provider(Uuid::new_v4()).await;
    let persister = persister(Arc::clone(&store));

    // Model references a provider id that has no credentials row.
    let mut spec = model(Uuid::new_v4());
    spec.provider_id = Some(Uuid::new_v4());

    let report = persister
        .persist_batch(
            vec![page("https://example.com/x", "body")],
            &context(Uuid::new_v4()),
            Some(&spec),
        )
        .await;

    assert_eq!(report.success_count, 0);
    assert_eq!(
        report.failures_by_reason[&FailureReason::MissingProvider],
        vec!["https://example.com/x".to_string()]
    );
    assert_eq!(count_blobs(&store).await, 0);
}

//! Two-phase batch persistence for crawled pages.
//!
//! Phase 1 is pure compute plus external I/O: hash, chunk, and embed each
//! page with no database transaction held. Embedding calls take hundreds of
//! milliseconds to seconds; holding a connection across that wait exhausts
//! the pool under load. Phase 2 is one short-lived transaction (target
//! 50-300 ms) with a savepoint per page, delegated to the storage backend.

mod report;

pub use report::{FailureReason, PersistReport};

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::chunk::ChunkSplitter;
use crate::embeddings::{EmbeddingProviderFactory, EmbeddingThrottle};
use crate::storage::{BlobStore, CredentialStore};
use crate::types::{CrawlContext, EmbeddingModelSpec, Page, PreparedPage};
use crate::Error;

/// Batch persister wiring Phase 1 compute to the Phase 2 storage sink.
pub struct BatchPersister {
    credentials: Arc<dyn CredentialStore>,
    blobs: Arc<dyn BlobStore>,
    provider_factory: Arc<dyn EmbeddingProviderFactory>,
    throttle: EmbeddingThrottle,
    splitter: ChunkSplitter,
}

impl BatchPersister {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        blobs: Arc<dyn BlobStore>,
        provider_factory: Arc<dyn EmbeddingProviderFactory>,
        throttle: EmbeddingThrottle,
    ) -> Self {
        Self {
            credentials,
            blobs,
            provider_factory,
            throttle,
            splitter: ChunkSplitter::new(200, 40),
        }
    }

    /// Persist one buffered batch of pages for a single website.
    ///
    /// Never returns an error: every page ends up either in
    /// `successful_urls` or in `failures_by_reason` (or, when the Phase 1
    /// memory budget stops the batch early, in neither — those pages are
    /// simply not marked crawled and retry on the next run).
    pub async fn persist_batch(
        &self,
        page_buffer: Vec<Page>,
        ctx: &CrawlContext,
        embedding_model: Option<&EmbeddingModelSpec>,
    ) -> PersistReport {
        let mut report = PersistReport::new();
        if page_buffer.is_empty() {
            return report;
        }

        let Some(model) = embedding_model else {
            warn!(website_id = %ctx.website_id, batch_size = page_buffer.len(),
                "no embedding model configured for website");
            for page in &page_buffer {
                report.add_failure(FailureReason::NoEmbeddingModel, page.url.as_str());
            }
            return report;
        };

        let Some(provider_id) = model.provider_id else {
            warn!(website_id = %ctx.website_id, model = %model.name,
                "embedding model has no provider, cannot load API credentials");
            for page in &page_buffer {
                report.add_failure(FailureReason::MissingProvider, page.url.as_str());
            }
            return report;
        };

        // The only database touch in Phase 1: a short-lived session inside
        // the credential store, closed before any API call is made.
        let credentials = match self.credentials.load_provider_credentials(provider_id).await {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                warn!(website_id = %ctx.website_id, provider_id = %provider_id,
                    "embedding provider not found");
                for page in &page_buffer {
                    report.add_failure(FailureReason::MissingProvider, page.url.as_str());
                }
                return report;
            }
            Err(e) => {
                warn!(website_id = %ctx.website_id, error = %e,
                    "failed to load embedding provider credentials");
                for page in &page_buffer {
                    report.add_failure(FailureReason::EmbeddingError, page.url.as_str());
                }
                return report;
            }
        };
        let provider = self.provider_factory.build(model, &credentials);

        debug!(website_id = %ctx.website_id, batch_size = page_buffer.len(),
            model = %model.name, "phase 1: computing embeddings for batch");

        let mut prepared_pages: Vec<PreparedPage> = Vec::new();
        let mut buffer_embedding_bytes = 0usize;

        for page in page_buffer {
            if page.content.trim().is_empty() {
                warn!(website_id = %ctx.website_id, url = %page.url, "skipping empty page");
                report.add_failure(FailureReason::EmptyContent, page.url.as_str());
                continue;
            }

            let content_hash = Sha256::digest(page.content.as_bytes()).to_vec();

            let chunks = self.splitter.split(&page.content);
            if chunks.is_empty() {
                warn!(website_id = %ctx.website_id, url = %page.url,
                    content_length = page.content.len(), "no chunks after splitting");
                report.add_failure(FailureReason::NoChunks, page.url.as_str());
                continue;
            }

            // The expensive network I/O, bounded by the process-global
            // semaphore and the per-call timeout.
            let embeddings = match self
                .throttle
                .embed(provider.as_ref(), &chunks, ctx.embedding_timeout)
                .await
            {
                Ok(embeddings) => embeddings,
                Err(Error::EmbeddingTimeout) => {
                    warn!(website_id = %ctx.website_id, tenant_id = %ctx.tenant_id,
                        url = %page.url, num_chunks = chunks.len(),
                        timeout_secs = ctx.embedding_timeout.as_secs(),
                        "embedding call timed out");
                    report.add_failure(FailureReason::EmbeddingTimeout, page.url.as_str());
                    continue;
                }
                Err(e) => {
                    warn!(website_id = %ctx.website_id, tenant_id = %ctx.tenant_id,
                        url = %page.url, error = %e, "failed to prepare page");
                    report.add_failure(FailureReason::EmbeddingError, page.url.as_str());
                    continue;
                }
            };

            buffer_embedding_bytes += embeddings.iter().map(|e| e.len() * 4).sum::<usize>();

            prepared_pages.push(PreparedPage {
                title: page.url.clone(),
                url: page.url,
                content: page.content,
                content_hash,
                chunks,
                embeddings,
                tenant_id: ctx.tenant_id,
                website_id: ctx.website_id,
                user_id: ctx.user_id,
                embedding_model_id: model.id,
            });

            if buffer_embedding_bytes >= ctx.max_batch_embedding_bytes {
                debug!(website_id = %ctx.website_id,
                    embedding_bytes = buffer_embedding_bytes,
                    pages_prepared = prepared_pages.len(),
                    "embedding memory cap reached, stopping phase 1 early");
                break;
            }
        }

        if prepared_pages.is_empty() {
            warn!(website_id = %ctx.website_id, failed_count = report.failed_count,
                "no pages prepared after phase 1");
            return report;
        }

        debug!(website_id = %ctx.website_id,
            pages_to_persist = prepared_pages.len(),
            total_chunks = prepared_pages.iter().map(|p| p.chunks.len()).sum::<usize>(),
            "phase 2: persisting batch");

        match self
            .blobs
            .persist_pages(&prepared_pages, ctx.max_transaction_wall_time)
            .await
        {
            Ok(outcome) => {
                for url in outcome.persisted_urls {
                    report.add_success(url);
                }
                for (url, reason) in outcome.failed {
                    report.add_failure(reason, url);
                }
            }
            Err(e) => {
                // Whole-transaction failure: every prepared page missed the
                // commit and must retry on the next run.
                warn!(website_id = %ctx.website_id, error = %e, "phase 2: session error");
                for page in &prepared_pages {
                    report.add_failure(FailureReason::DbError, page.url.as_str());
                }
            }
        }

        debug!(website_id = %ctx.website_id,
            success_count = report.success_count,
            failed_count = report.failed_count,
            "batch persist complete");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{EmbeddingProvider, MockEmbeddingProvider};
    use crate::storage::PhaseTwoOutcome;
    use crate::types::ProviderCredentials;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    struct StaticCredentials;

    #[async_trait]
    impl CredentialStore for StaticCredentials {
        async fn load_provider_credentials(
            &self,
            _provider_id: Uuid,
        ) -> crate::Result<Option<ProviderCredentials>> {
            Ok(Some(ProviderCredentials {
                api_base: "http://unused".to_string(),
                api_key: "unused".to_string(),
            }))
        }
    }

    struct MockFactory {
        delay: Option<Duration>,
    }

    impl EmbeddingProviderFactory for MockFactory {
        fn build(
            &self,
            model: &EmbeddingModelSpec,
            _credentials: &ProviderCredentials,
        ) -> Arc<dyn EmbeddingProvider> {
            let mut provider = MockEmbeddingProvider::new(model.dimensions);
            if let Some(delay) = self.delay {
                provider = provider.with_delay(delay);
            }
            Arc::new(provider)
        }
    }

    /// Blob store that records pages and can fail a chosen title.
    #[derive(Default)]
    struct RecordingBlobStore {
        persisted: Mutex<Vec<PreparedPage>>,
        fail_url: Option<String>,
    }

    #[async_trait]
    impl BlobStore for RecordingBlobStore {
        async fn persist_pages(
            &self,
            pages: &[PreparedPage],
            _max_wall_time: Duration,
        ) -> crate::Result<PhaseTwoOutcome> {
            let mut outcome = PhaseTwoOutcome::default();
            for page in pages {
                if self.fail_url.as_deref() == Some(page.url.as_str()) {
                    outcome.failed.push((page.url.clone(), FailureReason::DbError));
                } else {
                    self.persisted.lock().push(page.clone());
                    outcome.persisted_urls.push(page.url.clone());
                }
            }
            Ok(outcome)
        }
    }

    fn context() -> CrawlContext {
        CrawlContext {
            run_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            website_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            embedding_timeout: Duration::from_secs(5),
            max_batch_embedding_bytes: 64 * 1024 * 1024,
            max_transaction_wall_time: Duration::from_secs(30),
        }
    }

    fn model() -> EmbeddingModelSpec {
        EmbeddingModelSpec {
            id: Uuid::new_v4(),
            name: "mock-embedding-model".to_string(),
            provider_id: Some(Uuid::new_v4()),
            dimensions: 8,
        }
    }

    fn persister(blobs: Arc<RecordingBlobStore>) -> BatchPersister {
        BatchPersister::new(
            Arc::new(StaticCredentials),
            blobs,
            Arc::new(MockFactory { delay: None }),
            EmbeddingThrottle::isolated(3),
        )
    }

    fn page(url: &str, content: &str) -> Page {
        Page {
            url: url.to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn empty_middle_page_fails_without_failing_the_batch() {
        let blobs = Arc::new(RecordingBlobStore::default());
        let persister = persister(blobs.clone());

        let report = persister
            .persist_batch(
                vec![
                    page("https://example.com/1", "first page content"),
                    page("https://example.com/2", "   \n  "),
                    page("https://example.com/3", "third page content"),
                ],
                &context(),
                Some(&model()),
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
        assert_eq!(blobs.persisted.lock().len(), 2);
    }

    #[tokio::test]
    async fn missing_model_fails_every_page() {
        let persister = persister(Arc::new(RecordingBlobStore::default()));
        let report = persister
            .persist_batch(
                vec![page("https://a", "content"), page("https://b", "content")],
                &context(),
                None,
            )
            .await;

        assert_eq!(report.success_count, 0);
        assert_eq!(report.failed_count, 2);
        assert_eq!(
            report.failures_by_reason[&FailureReason::NoEmbeddingModel].len(),
            2
        );
    }

    #[tokio::test]
    async fn model_without_provider_is_reported_as_missing_provider() {
        let persister = persister(Arc::new(RecordingBlobStore::default()));
        let mut spec = model();
        spec.provider_id = None;

        let report = persister
            .persist_batch(vec![page("https://a", "content")], &context(), Some(&spec))
            .await;

        assert_eq!(
            report.failures_by_reason[&FailureReason::MissingProvider],
            vec!["https://a".to_string()]
        );
    }

    #[tokio::test]
    async fn embedding_timeout_is_recorded_per_page() {
        let blobs = Arc::new(RecordingBlobStore::default());
        let persister = BatchPersister::new(
            Arc::new(StaticCredentials),
            blobs,
            Arc::new(MockFactory {
                delay: Some(Duration::from_secs(10)),
            }),
            EmbeddingThrottle::isolated(3),
        );
        let mut ctx = context();
        ctx.embedding_timeout = Duration::from_millis(50);

        let report = persister
            .persist_batch(vec![page("https://slow", "content here")], &ctx, Some(&model()))
            .await;

        assert_eq!(
            report.failures_by_reason[&FailureReason::EmbeddingTimeout],
            vec!["https://slow".to_string()]
        );
    }

    #[tokio::test]
    async fn db_failure_of_one_page_spares_the_others() {
        let blobs = Arc::new(RecordingBlobStore {
            fail_url: Some("https://example.com/2".to_string()),
            ..RecordingBlobStore::default()
        });
        let persister = persister(blobs.clone());

        let report = persister
            .persist_batch(
                vec![
                    page("https://example.com/1", "one"),
                    page("https://example.com/2", "two"),
                    page("https://example.com/3", "three"),
                ],
                &context(),
                Some(&model()),
            )
            .await;

        assert_eq!(report.success_count, 2);
        assert_eq!(
            report.failures_by_reason[&FailureReason::DbError],
            vec!["https://example.com/2".to_string()]
        );
        // No URL appears on both sides of the report.
        for url in &report.successful_urls {
            assert!(!report.failed_urls().contains(&url.as_str()));
        }
    }

    #[tokio::test]
    async fn memory_cap_stops_phase_one_early() {
        let blobs = Arc::new(RecordingBlobStore::default());
        let persister = persister(blobs.clone());
        let mut ctx = context();
        // One 8-dim embedding is 32 bytes; cap after the first page.
        ctx.max_batch_embedding_bytes = 1;

        let report = persister
            .persist_batch(
                vec![page("https://a", "short"), page("https://b", "short")],
                &ctx,
                Some(&model()),
            )
            .await;

        // First page persisted; second neither succeeded nor failed, so it
        // is retried on the next run.
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failed_count, 0);
        assert_eq!(blobs.persisted.lock().len(), 1);
    }

    #[tokio::test]
    async fn prepared_pages_carry_hash_chunks_and_embeddings() {
        let blobs = Arc::new(RecordingBlobStore::default());
        let persister = persister(blobs.clone());

        persister
            .persist_batch(
                vec![page("https://a", "some meaningful page content")],
                &context(),
                Some(&model()),
            )
            .await;

        let persisted = blobs.persisted.lock();
        let prepared = &persisted[0];
        assert_eq!(prepared.content_hash.len(), 32);
        assert_eq!(prepared.title, prepared.url);
        assert_eq!(prepared.chunks.len(), prepared.embeddings.len());
        assert!(prepared.embeddings.iter().all(|e| e.len() == 8));
    }
}

//! Embedding generation for crawled page chunks.
//!
//! The provider is an external API behind [`EmbeddingProvider`]; this module
//! also owns the process-global throttle that caps simultaneous embedding
//! calls across all crawls in the process.

mod http;
mod mock;

pub use http::HttpEmbeddingProvider;
pub use mock::MockEmbeddingProvider;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::info;

use crate::types::{EmbeddingModelSpec, ProviderCredentials};

/// Trait for embedding providers that convert chunk text to dense vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of chunk texts.
    ///
    /// Returns one vector per input, in input order; dimensionality matches
    /// [`EmbeddingProvider::dimensions`].
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embedding dimension for this provider's model.
    fn dimensions(&self) -> usize;

    /// Model name/identifier.
    fn model_name(&self) -> &str;
}

/// Builds a provider from a model spec and its credentials.
///
/// Phase 1 loads credentials through a short-lived session, closes it, and
/// only then constructs the provider — no database handle survives into the
/// API calls.
pub trait EmbeddingProviderFactory: Send + Sync {
    fn build(
        &self,
        model: &EmbeddingModelSpec,
        credentials: &ProviderCredentials,
    ) -> Arc<dyn EmbeddingProvider>;
}

/// Default factory producing [`HttpEmbeddingProvider`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProviderFactory;

impl EmbeddingProviderFactory for HttpProviderFactory {
    fn build(
        &self,
        model: &EmbeddingModelSpec,
        credentials: &ProviderCredentials,
    ) -> Arc<dyn EmbeddingProvider> {
        Arc::new(HttpEmbeddingProvider::new(model.clone(), credentials.clone()))
    }
}

static GLOBAL_EMBEDDING_SEMAPHORE: OnceLock<Arc<Semaphore>> = OnceLock::new();

/// Bounds concurrent embedding calls and applies the per-call timeout.
#[derive(Clone)]
pub struct EmbeddingThrottle {
    semaphore: Arc<Semaphore>,
}

impl EmbeddingThrottle {
    /// The process-global throttle. The concurrency limit is fixed on first
    /// use; later calls with a different limit share the same semaphore.
    pub fn process_global(concurrency: usize) -> Self {
        let semaphore = GLOBAL_EMBEDDING_SEMAPHORE
            .get_or_init(|| {
                info!(concurrency, "created embedding semaphore");
                Arc::new(Semaphore::new(concurrency.max(1)))
            })
            .clone();
        Self { semaphore }
    }

    /// A private throttle, for tests that must not share global state.
    #[must_use]
    pub fn isolated(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Run one embedding call under the semaphore with a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::EmbeddingTimeout`] when the call exceeds
    /// `timeout`, or [`crate::Error::Embedding`] when the provider fails.
    pub async fn embed(
        &self,
        provider: &dyn EmbeddingProvider,
        texts: &[String],
        timeout: Duration,
    ) -> crate::Result<Vec<Vec<f32>>> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| crate::Error::Embedding(anyhow::anyhow!("embedding semaphore closed")))?;

        match tokio::time::timeout(timeout, provider.embed_batch(texts)).await {
            Ok(Ok(embeddings)) => Ok(embeddings),
            Ok(Err(e)) => Err(crate::Error::Embedding(e)),
            Err(_) => Err(crate::Error::EmbeddingTimeout),
        }
    }

    /// Permits currently available, exposed for tests.
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

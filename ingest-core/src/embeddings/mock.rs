//! Deterministic in-process embedding provider for tests.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use super::EmbeddingProvider;

/// Mock provider producing deterministic vectors derived from the text.
///
/// Identical inputs always produce identical embeddings, so tests can assert
/// on persisted vectors without a network.
pub struct MockEmbeddingProvider {
    dimensions: usize,
    delay: Option<Duration>,
    fail: bool,
}

impl MockEmbeddingProvider {
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            delay: None,
            fail: false,
        }
    }

    /// Sleep this long per batch, for throttle and timeout tests.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every call, for error-path tests.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        // Cheap deterministic pseudo-embedding seeded by the bytes.
        let seed = text
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        (0..self.dimensions)
            .map(|i| {
                let v = seed.wrapping_add(i as u32).wrapping_mul(2_654_435_761);
                (v as f32 / u32::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("mock embedding provider configured to fail");
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "mock-embedding-model"
    }
}

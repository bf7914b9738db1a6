//! Per-URL outcome tracking for batch persistence.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Why a page failed to persist. A finite tagged set so callers and
/// dashboards can depend on exhaustiveness instead of parsing strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    NoEmbeddingModel,
    MissingProvider,
    EmptyContent,
    NoChunks,
    EmbeddingTimeout,
    EmbeddingError,
    DbError,
}

impl FailureReason {
    /// Stable wire code, matching the serialized form.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            FailureReason::NoEmbeddingModel => "NO_EMBEDDING_MODEL",
            FailureReason::MissingProvider => "MISSING_PROVIDER",
            FailureReason::EmptyContent => "EMPTY_CONTENT",
            FailureReason::NoChunks => "NO_CHUNKS",
            FailureReason::EmbeddingTimeout => "EMBEDDING_TIMEOUT",
            FailureReason::EmbeddingError => "EMBEDDING_ERROR",
            FailureReason::DbError => "DB_ERROR",
        }
    }
}

/// Result of persisting one batch of pages.
///
/// Only URLs in `successful_urls` may be marked crawled; failed URLs must be
/// retried on the next run, never treated as stale pages to delete.
#[derive(Debug, Default, Clone)]
pub struct PersistReport {
    pub success_count: usize,
    pub failed_count: usize,
    pub successful_urls: Vec<String>,
    pub failures_by_reason: HashMap<FailureReason, Vec<String>>,
}

impl PersistReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a durably persisted URL.
    pub fn add_success(&mut self, url: impl Into<String>) {
        self.success_count += 1;
        self.successful_urls.push(url.into());
    }

    /// Record a failed URL under its reason code.
    pub fn add_failure(&mut self, reason: FailureReason, url: impl Into<String>) {
        self.failed_count += 1;
        self.failures_by_reason
            .entry(reason)
            .or_default()
            .push(url.into());
    }

    /// Fold another report into this one. Used by the runner to aggregate
    /// per-batch reports across one crawl.
    pub fn merge(&mut self, other: PersistReport) {
        self.success_count += other.success_count;
        self.failed_count += other.failed_count;
        self.successful_urls.extend(other.successful_urls);
        for (reason, urls) in other.failures_by_reason {
            self.failures_by_reason
                .entry(reason)
                .or_default()
                .extend(urls);
        }
    }

    /// All failed URLs regardless of reason.
    #[must_use]
    pub fn failed_urls(&self) -> Vec<&str> {
        self.failures_by_reason
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

//! Storage backend abstractions.
//!
//! The worker core talks to the relational store through these traits so the
//! backend crate can own connection management, savepoints, and SQL while the
//! core owns orchestration. All operations are async and session-per-call:
//! no trait method holds a connection between invocations.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::persist::FailureReason;
use crate::types::{
    EmbeddingModelSpec, PreparedPage, ProviderCredentials, Subscription, Tenant, Website,
};
use crate::Result;

/// Read access to tenants.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Tenants whose jobs may be admitted. Suspended tenants are excluded.
    async fn list_active_tenants(&self) -> Result<Vec<Tenant>>;

    /// Every tenant, including suspended ones. Used by retention crons,
    /// which still purge data for suspended tenants.
    async fn list_all_tenants(&self) -> Result<Vec<Tenant>>;

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>>;
}

/// Websites and their embedding model specs.
#[async_trait]
pub trait WebsiteStore: Send + Sync {
    async fn get_website(&self, id: Uuid) -> Result<Option<Website>>;

    /// Websites due for a re-crawl at `now`: interval not `never`, interval
    /// elapsed since the last finished crawl, and no crawl in flight.
    async fn list_due_websites(&self, now: DateTime<Utc>) -> Result<Vec<Website>>;

    async fn mark_crawl_started(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn mark_crawl_finished(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    async fn get_embedding_model(&self, model_id: Uuid) -> Result<Option<EmbeddingModelSpec>>;
}

/// Outcome of the Phase 2 commit for one batch.
#[derive(Debug, Default)]
pub struct PhaseTwoOutcome {
    /// URLs whose blob and chunks are durably committed.
    pub persisted_urls: Vec<String>,
    /// Pages whose savepoint rolled back, with the recorded reason.
    pub failed: Vec<(String, FailureReason)>,
}

/// The Phase 2 sink: one short-lived transaction, savepoint per page.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist prepared pages inside one outer transaction bounded by
    /// `max_wall_time`. Each page gets its own savepoint: deduplicating
    /// delete by `(title, website_id)`, blob insert, bulk chunk insert.
    /// A page failure rolls back only its savepoint.
    async fn persist_pages(
        &self,
        pages: &[PreparedPage],
        max_wall_time: Duration,
    ) -> Result<PhaseTwoOutcome>;
}

/// Embedding-provider credential lookup, Phase 1's only database touch.
/// Implementations open a short-lived session and close it before returning.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_provider_credentials(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<ProviderCredentials>>;
}

/// Webhook subscription records and their reference counts.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Subscription>>;

    async fn get_by_user_and_site(
        &self,
        user_integration_id: Uuid,
        site_id: &str,
    ) -> Result<Option<Subscription>>;

    async fn add(&self, subscription: &Subscription) -> Result<()>;

    async fn update(&self, subscription: &Subscription) -> Result<()>;

    async fn remove(&self, id: Uuid) -> Result<()>;

    /// Number of ingest sources pointing at this subscription.
    async fn count_references(&self, id: Uuid) -> Result<u64>;

    async fn list_expiring_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Subscription>>;
}

/// Per-tenant purge statistics from one retention run.
#[derive(Debug, Default, Clone)]
pub struct PurgeStats {
    pub tenants_processed: usize,
    pub tenants_failed: usize,
    pub rows_purged: u64,
}

/// Conversation purge statistics.
#[derive(Debug, Default, Clone)]
pub struct ConversationPurgeStats {
    pub questions_deleted: u64,
    pub app_runs_deleted: u64,
    pub orphaned_sessions_deleted: u64,
}

/// Retention enforcement. Implementations must run each tenant's audit purge
/// in its own transaction so one tenant's failure never rolls back another's.
#[async_trait]
pub trait RetentionStore: Send + Sync {
    /// Hard-delete audit logs older than the tenant's retention window.
    /// Returns the number of rows purged for that tenant.
    async fn purge_audit_logs_for_tenant(
        &self,
        tenant_id: Uuid,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Apply hierarchical conversation retention (entity, then space, then
    /// tenant default) and sweep orphaned sessions.
    async fn purge_conversations(&self, now: DateTime<Utc>) -> Result<ConversationPurgeStats>;
}

/// One export-job manifest entry read back from Redis.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExportManifest {
    pub tenant_id: Uuid,
    pub job_id: Uuid,
    pub file_path: PathBuf,
    pub expires_at: DateTime<Utc>,
}

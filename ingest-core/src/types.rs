//! Core domain types shared across the worker components.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;
use uuid::Uuid;

/// Lifecycle state of a tenant.
///
/// A suspended tenant must not have new jobs admitted; in-flight jobs are
/// allowed to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    Active,
    Suspended,
}

/// Tenant record, read-only to the worker core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub state: TenantState,
    /// Audit-log retention in days; applied by the daily purge cron.
    pub audit_retention_days: i64,
    /// Tenant-wide conversation retention in days; `None` keeps forever.
    pub conversation_retention_days: Option<i64>,
}

impl Tenant {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TenantState::Active
    }
}

/// How often a website is re-crawled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateInterval {
    Never,
    Daily,
    EveryOtherDay,
    Weekly,
}

impl UpdateInterval {
    /// Interval as a duration; `None` for websites that are never re-crawled.
    #[must_use]
    pub fn as_duration(self) -> Option<Duration> {
        match self {
            UpdateInterval::Never => None,
            UpdateInterval::Daily => Some(Duration::hours(24)),
            UpdateInterval::EveryOtherDay => Some(Duration::hours(48)),
            UpdateInterval::Weekly => Some(Duration::days(7)),
        }
    }

    /// Stable string form used in storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateInterval::Never => "never",
            UpdateInterval::Daily => "daily",
            UpdateInterval::EveryOtherDay => "every_other_day",
            UpdateInterval::Weekly => "weekly",
        }
    }

    /// Parse the stable storage form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "never" => Some(UpdateInterval::Never),
            "daily" => Some(UpdateInterval::Daily),
            "every_other_day" => Some(UpdateInterval::EveryOtherDay),
            "weekly" => Some(UpdateInterval::Weekly),
            _ => None,
        }
    }
}

/// Strategy used to discover pages on an ingest source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlType {
    Crawl,
    Sitemap,
    SinglePage,
}

impl CrawlType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CrawlType::Crawl => "crawl",
            CrawlType::Sitemap => "sitemap",
            CrawlType::SinglePage => "single_page",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "crawl" => Some(CrawlType::Crawl),
            "sitemap" => Some(CrawlType::Sitemap),
            "single_page" => Some(CrawlType::SinglePage),
            _ => None,
        }
    }
}

/// A website or similar ingest source producing pages to index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Website {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub url: String,
    pub crawl_type: CrawlType,
    pub update_interval: UpdateInterval,
    pub last_crawl_started_at: Option<DateTime<Utc>>,
    pub last_crawl_finished_at: Option<DateTime<Utc>>,
    pub embedding_model_id: Option<Uuid>,
}

impl Website {
    /// A website is due when its interval is not `never` and the interval has
    /// elapsed since the last finished crawl. A website that has never been
    /// crawled is due immediately.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let Some(interval) = self.update_interval.as_duration() else {
            return false;
        };
        match self.last_crawl_finished_at {
            Some(finished) => now - finished >= interval,
            None => true,
        }
    }

    /// A crawl is considered in flight when it started after the last finish.
    #[must_use]
    pub fn has_crawl_in_flight(&self) -> bool {
        match (self.last_crawl_started_at, self.last_crawl_finished_at) {
            (Some(started), Some(finished)) => started > finished,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// One raw crawled page as emitted by the crawler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub url: String,
    pub content: String,
}

/// A page after Phase 1: hashed, chunked, and embedded, ready to persist.
#[derive(Debug, Clone)]
pub struct PreparedPage {
    pub url: String,
    /// URL doubles as the title for crawled pages.
    pub title: String,
    pub content: String,
    /// SHA-256 of the UTF-8 content.
    pub content_hash: Vec<u8>,
    pub chunks: Vec<String>,
    /// One embedding per chunk, same order.
    pub embeddings: Vec<Vec<f32>>,
    pub tenant_id: Uuid,
    pub website_id: Uuid,
    pub user_id: Uuid,
    pub embedding_model_id: Uuid,
}

/// Embedding model description, session-independent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingModelSpec {
    pub id: Uuid,
    pub name: String,
    /// Provider whose credentials are loaded for the API call.
    pub provider_id: Option<Uuid>,
    pub dimensions: usize,
}

/// Credentials for an embedding provider, loaded through a short-lived
/// session before any API call is made.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub api_base: String,
    pub api_key: String,
}

/// Everything a crawl task needs, captured as plain values so the task never
/// drags a database session across its lifetime.
#[derive(Debug, Clone)]
pub struct CrawlContext {
    pub run_id: Uuid,
    pub tenant_id: Uuid,
    pub website_id: Uuid,
    pub user_id: Uuid,
    pub embedding_timeout: StdDuration,
    pub max_batch_embedding_bytes: usize,
    pub max_transaction_wall_time: StdDuration,
}

/// A change-notification registration against the external document provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_integration_id: Uuid,
    /// Absent for OneDrive subscriptions, which are drive-scoped.
    pub site_id: Option<String>,
    pub drive_id: String,
    pub external_subscription_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Subscription {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn website(interval: UpdateInterval, finished_hours_ago: Option<i64>) -> Website {
        let now = Utc::now();
        Website {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            url: "https://example.com".to_string(),
            crawl_type: CrawlType::Crawl,
            update_interval: interval,
            last_crawl_started_at: None,
            last_crawl_finished_at: finished_hours_ago.map(|h| now - Duration::hours(h)),
            embedding_model_id: Some(Uuid::new_v4()),
        }
    }

    #[test]
    fn never_interval_is_never_due() {
        let site = website(UpdateInterval::Never, Some(24 * 365));
        assert!(!site.is_due(Utc::now()));
    }

    #[test]
    fn daily_website_is_due_after_a_day() {
        let now = Utc::now();
        assert!(!website(UpdateInterval::Daily, Some(23)).is_due(now));
        assert!(website(UpdateInterval::Daily, Some(25)).is_due(now));
    }

    #[test]
    fn uncrawled_website_is_due_immediately() {
        assert!(website(UpdateInterval::Weekly, None).is_due(Utc::now()));
    }

    #[test]
    fn in_flight_detection_uses_started_after_finished() {
        let now = Utc::now();
        let mut site = website(UpdateInterval::Daily, Some(48));
        assert!(!site.has_crawl_in_flight());

        site.last_crawl_started_at = Some(now - Duration::hours(1));
        assert!(site.has_crawl_in_flight());

        site.last_crawl_finished_at = Some(now);
        assert!(!site.has_crawl_in_flight());
    }

    #[test]
    fn interval_round_trips_through_storage_form() {
        for interval in [
            UpdateInterval::Never,
            UpdateInterval::Daily,
            UpdateInterval::EveryOtherDay,
            UpdateInterval::Weekly,
        ] {
            assert_eq!(UpdateInterval::parse(interval.as_str()), Some(interval));
        }
        assert_eq!(UpdateInterval::parse("fortnightly"), None);
    }
}

//! # Test Utilities
//!
//! Shared test utilities for the ingest worker workspace.
//!
//! Provides:
//! - Test data generators for tenants, websites, and pages
//! - An in-memory job queue with the same idempotent-enqueue contract as
//!   the Redis implementation
//! - A scripted crawler for driving the task runner

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ingest_core::jobs::{CrawlJobDescriptor, JobQueue, QueuedJob};
use ingest_core::runner::Crawler;
use ingest_core::{CrawlType, Page, Result, Tenant, TenantState, UpdateInterval, Website};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Create an active tenant with default retention.
#[must_use]
pub fn create_test_tenant(name: &str) -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        name: name.to_string(),
        state: TenantState::Active,
        audit_retention_days: 365,
        conversation_retention_days: None,
    }
}

/// Create a daily-interval website for a tenant.
#[must_use]
pub fn create_test_website(tenant_id: Uuid, url: &str) -> Website {
    Website {
        id: Uuid::new_v4(),
        tenant_id,
        user_id: Uuid::new_v4(),
        url: url.to_string(),
        crawl_type: CrawlType::Crawl,
        update_interval: UpdateInterval::Daily,
        last_crawl_started_at: None,
        last_crawl_finished_at: None,
        embedding_model_id: Some(Uuid::new_v4()),
    }
}

/// Create a crawl descriptor for a website with a fresh run id.
#[must_use]
pub fn create_test_descriptor(website: &Website) -> CrawlJobDescriptor {
    CrawlJobDescriptor {
        run_id: Uuid::new_v4(),
        tenant_id: website.tenant_id,
        website_id: website.id,
        url: website.url.clone(),
        enqueued_at: Utc::now(),
    }
}

/// Create a page with the given url and content.
#[must_use]
pub fn create_test_page(url: &str, content: &str) -> Page {
    Page {
        url: url.to_string(),
        content: content.to_string(),
    }
}

/// In-memory job queue honoring the idempotent-enqueue contract.
#[derive(Default)]
pub struct InMemoryJobQueue {
    known_ids: Mutex<HashSet<String>>,
    ready: Mutex<Vec<QueuedJob>>,
    scheduled: Mutex<Vec<(QueuedJob, Duration)>>,
}

impl InMemoryJobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything currently ready.
    pub fn take_ready(&self) -> Vec<QueuedJob> {
        std::mem::take(&mut self.ready.lock())
    }

    /// Jobs scheduled for later, with their delays.
    pub fn scheduled(&self) -> Vec<(QueuedJob, Duration)> {
        self.scheduled.lock().clone()
    }

    /// Number of distinct ids ever enqueued and not completed.
    pub fn known_id_count(&self) -> usize {
        self.known_ids.lock().len()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<bool> {
        let mut ids = self.known_ids.lock();
        if !ids.insert(job.job_id.clone()) {
            return Ok(false);
        }
        self.ready.lock().push(job.clone());
        Ok(true)
    }

    async fn schedule(&self, job: &QueuedJob, delay: Duration) -> Result<()> {
        self.known_ids.lock().insert(job.job_id.clone());
        self.scheduled.lock().push((job.clone(), delay));
        Ok(())
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        self.known_ids.lock().remove(job_id);
        Ok(())
    }
}

/// Crawler that emits a fixed set of pages, optionally failing afterwards.
pub struct StaticCrawler {
    pages: Vec<Page>,
    fail_message: Option<String>,
}

impl StaticCrawler {
    #[must_use]
    pub fn new(pages: Vec<Page>) -> Self {
        Self {
            pages,
            fail_message: None,
        }
    }

    /// Fail with a transient crawl error after emitting the pages.
    #[must_use]
    pub fn failing_with(mut self, message: &str) -> Self {
        self.fail_message = Some(message.to_string());
        self
    }
}

#[async_trait]
impl Crawler for StaticCrawler {
    async fn crawl(
        &self,
        _website: &Website,
        _start_url: &str,
        pages: mpsc::Sender<Page>,
    ) -> Result<()> {
        for page in &self.pages {
            if pages.send(page.clone()).await.is_err() {
                break;
            }
        }
        match &self.fail_message {
            Some(message) => Err(ingest_core::Error::Crawl(message.clone())),
            None => Ok(()),
        }
    }
}

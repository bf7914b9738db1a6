#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]

//! # Ingest Core
//!
//! Multi-tenant crawl-and-ingest worker core for a retrieval-augmented
//! assistant platform. Many tenants share one worker pool; this crate keeps
//! them fair to each other and keeps the pipeline alive through
//! backing-store outages.
//!
//! ## Components
//!
//! - [`limiter`]: per-tenant concurrency control — Redis semaphore, local
//!   fallback, circuit breaker
//! - [`feeder`]: leader-elected feeder moving pending jobs into the main
//!   queue only when tenant capacity exists
//! - [`runner`]: end-to-end execution of one crawl job with
//!   capacity-denied requeue and age-based abandonment
//! - [`persist`]: two-phase batch ingest — compute (hash, chunk, embed)
//!   outside any transaction, then a short savepoint-protected commit
//! - [`recovery`]: session-per-operation wrapper recovering from
//!   transaction corruption
//! - [`subscriptions`]: webhook subscription lifecycle against a
//!   Microsoft-Graph-shaped API
//! - [`cron`]: periodic maintenance loops with per-tenant isolation
//!
//! ## Support modules
//!
//! - [`jobs`]: deterministic job ids and the queue-broker contract
//! - [`queue`]: Redis implementation of that contract
//! - [`backoff`]: full-jitter exponential backoff
//! - [`chunk`]: token-aware recursive text splitting
//! - [`embeddings`]: embedding provider seam and process-global throttle
//! - [`extract`]: text extraction dispatch by MIME type
//! - [`storage`]: traits the storage backend crate implements
//!
//! ## Data flow
//!
//! External webhook or cron → pending queue (Redis) → feeder → job queue →
//! task runner → limiter gate → crawler (external) → batch persister →
//! database, with session recovery wrapping every database operation issued
//! by the long-running paths.

pub mod backoff;
pub mod chunk;
pub mod config;
pub mod cron;
pub mod embeddings;
pub mod error;
pub mod extract;
pub mod feeder;
pub mod jobs;
pub mod limiter;
pub mod persist;
pub mod queue;
pub mod recovery;
pub mod redis_pool;
pub mod runner;
pub mod storage;
pub mod subscriptions;
pub mod types;

pub use config::WorkerConfig;
pub use error::{message_indicates_session_corruption, Error, Result};
pub use types::{
    CrawlContext, CrawlType, EmbeddingModelSpec, Page, PreparedPage, ProviderCredentials,
    Subscription, Tenant, TenantState, UpdateInterval, Website,
};

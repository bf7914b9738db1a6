#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

//! # Ingest Storage - Turso
//!
//! Turso/libSQL storage backend for the ingest worker.
//!
//! This crate provides:
//! - Connection management for Turso databases
//! - SQL schema creation for the ingest tables
//! - Savepoint-protected batch persistence of info blobs and chunks
//! - Website scheduling queries and crawl-window stamps
//! - Tenant, subscription, credential, and retention repositories
//! - The session factory behind the core's recovery wrapper
//!
//! ## Example
//!
//! ```no_run
//! use ingest_storage_turso::IngestStore;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = IngestStore::new("file:ingest.db", "").await?;
//! store.initialize_schema().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ingest_core::{Error, Result};
use libsql::{Builder, Connection, Database};
use tracing::info;

mod blobs;
mod codec;
mod credentials;
mod retention;
mod schema;
mod sessions;
mod subscriptions;
mod tenants;
mod websites;

pub use codec::{embedding_from_blob, embedding_to_blob};
pub use sessions::{TursoSession, TursoSessionFactory};
pub use tenants::insert_tenant;
pub use websites::insert_website;

/// Turso storage backend for the ingest worker.
pub struct IngestStore {
    db: Arc<Database>,
}

impl IngestStore {
    /// Create a new store.
    ///
    /// # Arguments
    ///
    /// * `url` - Database URL (only `libsql://`, `file:`, or `:memory:` protocols allowed)
    /// * `token` - Authentication token (required for `libsql://`, empty for local files)
    ///
    /// # Security
    ///
    /// Remote connections must use `libsql://` with a non-empty token;
    /// HTTP/HTTPS URLs are rejected. Local `file:` and `:memory:` databases
    /// need no token.
    pub async fn new(url: &str, token: &str) -> Result<Self> {
        let db = if url == ":memory:" || url.starts_with("file:") {
            let path = url.strip_prefix("file:").unwrap_or(url);
            Builder::new_local(path)
                .build()
                .await
                .map_err(|e| Error::Storage(format!("Failed to open local database: {e}")))?
        } else if url.starts_with("libsql://") {
            if token.is_empty() {
                return Err(Error::Configuration(
                    "remote databases require an authentication token".to_string(),
                ));
            }
            Builder::new_remote(url.to_string(), token.to_string())
                .build()
                .await
                .map_err(|e| Error::Storage(format!("Failed to open remote database: {e}")))?
        } else {
            return Err(Error::Configuration(format!(
                "unsupported database url scheme: {url}"
            )));
        };

        info!("opened ingest database");
        Ok(Self { db: Arc::new(db) })
    }

    /// Create a store from an existing database handle. Useful for tests
    /// with local file-based databases.
    #[must_use]
    pub fn from_database(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }

    /// Get a fresh connection from the database.
    pub fn get_connection(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| Error::Storage(format!("Failed to get connection: {e}")))
    }

    /// Create all ingest tables and indexes if they do not exist.
    pub async fn initialize_schema(&self) -> Result<()> {
        let conn = self.get_connection()?;
        schema::create_schema(&conn).await
    }

    /// Session factory backed by this store, for the recovery wrapper.
    #[must_use]
    pub fn session_factory(&self) -> TursoSessionFactory {
        TursoSessionFactory::new(Arc::clone(&self.db))
    }
}

pub(crate) fn storage_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Storage(format!("{context}: {e}"))
}

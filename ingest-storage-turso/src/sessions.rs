//! Session type behind the core recovery wrapper.
//!
//! A session is one connection with explicit transaction control. The
//! recovery wrapper creates one per operation, commits, and closes; nothing
//! here is shared between operations, so a corrupted session can be thrown
//! away wholesale.

use std::sync::Arc;

use async_trait::async_trait;
use ingest_core::recovery::{ManagedSession, SessionFactory};
use ingest_core::{Error, Result};
use libsql::{Connection, Database};

use crate::storage_err;

/// One libSQL connection with explicit BEGIN/COMMIT/ROLLBACK.
pub struct TursoSession {
    conn: Option<Connection>,
}

impl TursoSession {
    fn new(conn: Connection) -> Self {
        Self { conn: Some(conn) }
    }

    /// The underlying connection for running statements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionCorrupted`] when the session was closed.
    pub fn connection(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::SessionCorrupted("session already closed".to_string()))
    }
}

#[async_trait]
impl ManagedSession for TursoSession {
    async fn begin(&mut self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| storage_err("Failed to begin transaction", e))?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("COMMIT", ())
            .await
            .map_err(|e| storage_err("Failed to commit transaction", e))?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("ROLLBACK", ())
            .await
            .map_err(|e| storage_err("Failed to roll back transaction", e))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the connection returns it to libSQL; later use of this
        // session is an error.
        self.conn.take();
        Ok(())
    }
}

/// Creates a fresh [`TursoSession`] per operation.
pub struct TursoSessionFactory {
    db: Arc<Database>,
}

impl TursoSessionFactory {
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionFactory for TursoSessionFactory {
    type Session = TursoSession;

    async fn create_session(&self) -> Result<TursoSession> {
        let conn = self
            .db
            .connect()
            .map_err(|e| storage_err("Failed to create session", e))?;
        Ok(TursoSession::new(conn))
    }
}

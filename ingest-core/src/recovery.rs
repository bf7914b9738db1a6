//! Session recovery for long-running ingest tasks.
//!
//! A database session can reach a state in which no statement will execute
//! any more (a rollback is pending, the connection is mid-operation, the
//! transaction was invalidated). This module wraps an operation in the
//! recovery protocol: detect the corruption, shut the old session down under
//! short timeouts so a wedged connection cannot hang the worker, create a
//! fresh session, and re-execute the operation exactly once.
//!
//! Every call runs session-per-operation: a brand-new session is created,
//! used, committed, and closed, so multi-minute crawls never hold a pool
//! connection between operations.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::Result;

/// Bound on each cleanup step of a corrupted session. A wedged connection
/// may ignore rollback and close entirely; the worker must not wait on it.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);

/// One database session with explicit transaction control.
#[async_trait]
pub trait ManagedSession: Send {
    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Creates fresh sessions; the storage backend owns the pool behind this.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: ManagedSession;

    async fn create_session(&self) -> Result<Self::Session>;
}

/// Execute `operation` in its own short-lived session, recovering once from
/// transaction corruption.
///
/// The operation receives a mutable session reference and must route all its
/// database work through it. On success the transaction is committed and the
/// session closed before returning. On a corruption-classified error the old
/// session is rolled back and closed under [`CLEANUP_TIMEOUT`], a fresh
/// session is created, and the operation runs once more; a second failure
/// propagates.
///
/// # Errors
///
/// Propagates session-creation errors, non-corruption operation errors, and
/// the retry's error when recovery fails.
pub async fn execute_with_recovery<F, Op, T>(
    factory: &F,
    operation_name: &str,
    mut operation: Op,
) -> Result<T>
where
    F: SessionFactory,
    Op: for<'a> FnMut(&'a mut F::Session) -> BoxFuture<'a, Result<T>>,
{
    let mut session = factory.create_session().await?;
    if let Err(e) = session.begin().await {
        cleanup_session(&mut session).await;
        return Err(e);
    }

    let outcome: Result<T> = async {
        let value = operation(&mut session).await?;
        session.commit().await?;
        Ok(value)
    }
    .await;

    match outcome {
        Ok(value) => {
            if let Err(e) = session.close().await {
                debug!(operation = operation_name, error = %e, "session close failed after commit");
            }
            debug!(operation = operation_name, "operation completed");
            Ok(value)
        }
        Err(error) if error.is_session_corruption() => {
            warn!(
                operation = operation_name,
                error = %error,
                "transaction error, recovering with a fresh session"
            );
            cleanup_session(&mut session).await;
            retry_with_fresh_session(factory, operation_name, &mut operation).await
        }
        Err(error) => {
            // Non-transaction error: roll back, close, re-raise.
            if let Err(e) = session.rollback().await {
                debug!(operation = operation_name, error = %e, "rollback failed");
            }
            if let Err(e) = session.close().await {
                debug!(operation = operation_name, error = %e, "close failed");
            }
            Err(error)
        }
    }
}

async fn retry_with_fresh_session<F, Op, T>(
    factory: &F,
    operation_name: &str,
    operation: &mut Op,
) -> Result<T>
where
    F: SessionFactory,
    Op: for<'a> FnMut(&'a mut F::Session) -> BoxFuture<'a, Result<T>>,
{
    let mut session = factory.create_session().await?;
    if let Err(e) = session.begin().await {
        cleanup_session(&mut session).await;
        return Err(e);
    }

    let outcome: Result<T> = async {
        let value = operation(&mut session).await?;
        session.commit().await?;
        Ok(value)
    }
    .await;

    match outcome {
        Ok(value) => {
            if let Err(e) = session.close().await {
                debug!(operation = operation_name, error = %e, "retry session close failed");
            }
            info!(operation = operation_name, "operation recovered");
            Ok(value)
        }
        Err(retry_error) => {
            warn!(operation = operation_name, error = %retry_error, "retry failed");
            cleanup_session(&mut session).await;
            Err(retry_error)
        }
    }
}

/// Roll back and close a session, each step bounded by [`CLEANUP_TIMEOUT`].
/// Failures are expected here: the connection may be truly broken.
async fn cleanup_session<S: ManagedSession>(session: &mut S) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, session.rollback()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "rollback during cleanup failed"),
        Err(_) => warn!("rollback during cleanup timed out"),
    }
    match tokio::time::timeout(CLEANUP_TIMEOUT, session.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "close during cleanup failed"),
        Err(_) => warn!("close during cleanup timed out"),
    }
}

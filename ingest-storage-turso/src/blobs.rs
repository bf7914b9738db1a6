//! Savepoint-protected batch persistence of info blobs and their chunks.

use std::time::Duration;

use async_trait::async_trait;
use ingest_core::persist::FailureReason;
use ingest_core::storage::{BlobStore, PhaseTwoOutcome};
use ingest_core::{Error, PreparedPage, Result};
use libsql::{params, Connection};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::embedding_to_blob;
use crate::{storage_err, IngestStore};

#[async_trait]
impl BlobStore for IngestStore {
    async fn persist_pages(
        &self,
        pages: &[PreparedPage],
        max_wall_time: Duration,
    ) -> Result<PhaseTwoOutcome> {
        if pages.is_empty() {
            return Ok(PhaseTwoOutcome::default());
        }

        let conn = self.get_connection()?;
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| storage_err("Failed to begin batch transaction", e))?;

        let result = tokio::time::timeout(max_wall_time, persist_in_transaction(&conn, pages)).await;

        match result {
            Ok(Ok(outcome)) => {
                conn.execute("COMMIT", ())
                    .await
                    .map_err(|e| storage_err("Failed to commit batch", e))?;
                debug!(
                    persisted = outcome.persisted_urls.len(),
                    failed = outcome.failed.len(),
                    "batch committed"
                );
                Ok(outcome)
            }
            Ok(Err(e)) => {
                if let Err(rollback_err) = conn.execute("ROLLBACK", ()).await {
                    warn!(error = %rollback_err, "rollback after batch failure also failed");
                }
                Err(e)
            }
            Err(_) => {
                warn!(
                    wall_time_secs = max_wall_time.as_secs(),
                    "batch transaction exceeded wall-time cap"
                );
                if let Err(rollback_err) = conn.execute("ROLLBACK", ()).await {
                    warn!(error = %rollback_err, "rollback after wall-time cap also failed");
                }
                Err(Error::ExecutionTimeout)
            }
        }
    }
}

/// Persist each page under its own savepoint inside the open transaction.
async fn persist_in_transaction(
    conn: &Connection,
    pages: &[PreparedPage],
) -> Result<PhaseTwoOutcome> {
    let mut outcome = PhaseTwoOutcome::default();

    for (index, page) in pages.iter().enumerate() {
        let savepoint = format!("page_{index}");
        conn.execute(&format!("SAVEPOINT {savepoint}"), ())
            .await
            .map_err(|e| storage_err("Failed to create savepoint", e))?;

        match persist_one_page(conn, page).await {
            Ok(()) => {
                conn.execute(&format!("RELEASE SAVEPOINT {savepoint}"), ())
                    .await
                    .map_err(|e| storage_err("Failed to release savepoint", e))?;
                outcome.persisted_urls.push(page.url.clone());
            }
            Err(e) => {
                warn!(url = %page.url, error = %e, "page failed, rolling back its savepoint");
                conn.execute(&format!("ROLLBACK TO SAVEPOINT {savepoint}"), ())
                    .await
                    .map_err(|rollback_err| {
                        storage_err("Failed to roll back savepoint", rollback_err)
                    })?;
                conn.execute(&format!("RELEASE SAVEPOINT {savepoint}"), ())
                    .await
                    .map_err(|e| storage_err("Failed to release savepoint", e))?;
                outcome.failed.push((page.url.clone(), FailureReason::DbError));
            }
        }
    }

    Ok(outcome)
}

/// Deduplicating delete, blob insert, bulk chunk insert for one page.
async fn persist_one_page(conn: &Connection, page: &PreparedPage) -> Result<()> {
    // Deduplication: at most one blob per (tenant, website, title). The
    // chunk table cascades, but libSQL only enforces that with foreign keys
    // on; delete chunks explicitly so the invariant holds either way.
    conn.execute(
        r"
        DELETE FROM info_blob_chunks WHERE info_blob_id IN (
            SELECT id FROM info_blobs WHERE title = ? AND website_id = ?
        )
        ",
        params![page.title.clone(), page.website_id.to_string()],
    )
    .await
    .map_err(|e| storage_err("Failed to delete existing chunks", e))?;

    conn.execute(
        "DELETE FROM info_blobs WHERE title = ? AND website_id = ?",
        params![page.title.clone(), page.website_id.to_string()],
    )
    .await
    .map_err(|e| storage_err("Failed to delete existing blob", e))?;

    let blob_id = Uuid::new_v4();
    conn.execute(
        r"
        INSERT INTO info_blobs (
            id, tenant_id, website_id, group_id, integration_knowledge_id,
            user_id, embedding_model_id, title, url, text, size, content_hash
        ) VALUES (?, ?, ?, NULL, NULL, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            blob_id.to_string(),
            page.tenant_id.to_string(),
            page.website_id.to_string(),
            page.user_id.to_string(),
            page.embedding_model_id.to_string(),
            page.title.clone(),
            page.url.clone(),
            page.content.clone(),
            page.content.len() as i64,
            page.content_hash.clone(),
        ],
    )
    .await
    .map_err(|e| storage_err("Failed to insert info blob", e))?;

    for (chunk_no, (chunk_text, embedding)) in
        page.chunks.iter().zip(page.embeddings.iter()).enumerate()
    {
        conn.execute(
            r"
            INSERT INTO info_blob_chunks (
                info_blob_id, chunk_no, text, size, embedding, tenant_id
            ) VALUES (?, ?, ?, ?, ?, ?)
            ",
            params![
                blob_id.to_string(),
                chunk_no as i64,
                chunk_text.clone(),
                chunk_text.len() as i64,
                embedding_to_blob(embedding),
                page.tenant_id.to_string(),
            ],
        )
        .await
        .map_err(|e| storage_err("Failed to insert chunk", e))?;
    }

    Ok(())
}

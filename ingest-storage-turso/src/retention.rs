//! Retention enforcement: audit logs and conversation data.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ingest_core::storage::{ConversationPurgeStats, RetentionStore};
use ingest_core::Result;
use tracing::debug;
use uuid::Uuid;

use libsql::params;

use crate::{storage_err, IngestStore};

/// Sessions with no questions older than this are considered abandoned.
const ORPHANED_SESSION_DAYS: i64 = 30;

#[async_trait]
impl RetentionStore for IngestStore {
    async fn purge_audit_logs_for_tenant(
        &self,
        tenant_id: Uuid,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        // A fresh connection and transaction per tenant: this tenant's
        // failure rolls back only this tenant's delete.
        let conn = self.get_connection()?;
        conn.execute("BEGIN", ())
            .await
            .map_err(|e| storage_err("Failed to begin audit purge", e))?;

        let cutoff = now - ChronoDuration::days(retention_days.max(0));
        let purged = match conn
            .execute(
                "DELETE FROM audit_logs WHERE tenant_id = ? AND created_at < ?",
                params![tenant_id.to_string(), cutoff.timestamp()],
            )
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                let _ = conn.execute("ROLLBACK", ()).await;
                return Err(storage_err("Failed to purge audit logs", e));
            }
        };

        conn.execute("COMMIT", ())
            .await
            .map_err(|e| storage_err("Failed to commit audit purge", e))?;

        debug!(tenant_id = %tenant_id, purged, retention_days, "audit purge committed");
        Ok(purged)
    }

    async fn purge_conversations(&self, now: DateTime<Utc>) -> Result<ConversationPurgeStats> {
        let conn = self.get_connection()?;
        let now_ts = now.timestamp();
        let mut stats = ConversationPurgeStats::default();

        // Hierarchical retention: assistant override, then space, then the
        // tenant default. A NULL at every level means keep forever.
        stats.questions_deleted = conn
            .execute(
                r"
                DELETE FROM questions WHERE id IN (
                    SELECT q.id FROM questions q
                    LEFT JOIN assistants a ON a.id = q.assistant_id
                    LEFT JOIN spaces s ON s.id = q.space_id
                    LEFT JOIN tenants t ON t.id = q.tenant_id
                    WHERE COALESCE(
                            a.retention_days,
                            s.retention_days,
                            t.conversation_retention_days
                          ) IS NOT NULL
                      AND q.created_at < ? - COALESCE(
                            a.retention_days,
                            s.retention_days,
                            t.conversation_retention_days
                          ) * 86400
                )
                ",
                params![now_ts],
            )
            .await
            .map_err(|e| storage_err("Failed to purge questions", e))?;

        stats.app_runs_deleted = conn
            .execute(
                r"
                DELETE FROM app_runs WHERE id IN (
                    SELECT r.id FROM app_runs r
                    LEFT JOIN spaces s ON s.id = r.space_id
                    LEFT JOIN tenants t ON t.id = r.tenant_id
                    WHERE COALESCE(
                            r.retention_days,
                            s.retention_days,
                            t.conversation_retention_days
                          ) IS NOT NULL
                      AND r.created_at < ? - COALESCE(
                            r.retention_days,
                            s.retention_days,
                            t.conversation_retention_days
                          ) * 86400
                )
                ",
                params![now_ts],
            )
            .await
            .map_err(|e| storage_err("Failed to purge app runs", e))?;

        let orphan_cutoff = (now - ChronoDuration::days(ORPHANED_SESSION_DAYS)).timestamp();
        stats.orphaned_sessions_deleted = conn
            .execute(
                r"
                DELETE FROM conversation_sessions
                WHERE created_at < ?
                  AND id NOT IN (SELECT DISTINCT session_id FROM questions
                                 WHERE session_id IS NOT NULL)
                ",
                params![orphan_cutoff],
            )
            .await
            .map_err(|e| storage_err("Failed to purge orphaned sessions", e))?;

        Ok(stats)
    }
}

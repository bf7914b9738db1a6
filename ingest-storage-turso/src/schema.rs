//! SQL schema creation for the ingest tables.

use ingest_core::Result;
use libsql::Connection;
use tracing::debug;

use crate::storage_err;

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS tenants (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'active',
        audit_retention_days INTEGER NOT NULL DEFAULT 365,
        conversation_retention_days INTEGER,
        created_at INTEGER NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS websites (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL REFERENCES tenants(id),
        user_id TEXT NOT NULL,
        url TEXT NOT NULL,
        crawl_type TEXT NOT NULL DEFAULT 'crawl',
        update_interval TEXT NOT NULL DEFAULT 'never',
        last_crawl_started_at INTEGER,
        last_crawl_finished_at INTEGER,
        embedding_model_id TEXT
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_websites_last_crawl_finished
        ON websites(last_crawl_finished_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS info_blobs (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        website_id TEXT,
        group_id TEXT,
        integration_knowledge_id TEXT,
        user_id TEXT NOT NULL,
        embedding_model_id TEXT NOT NULL,
        title TEXT NOT NULL,
        url TEXT,
        text TEXT NOT NULL,
        size INTEGER NOT NULL,
        content_hash BLOB NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_info_blobs_dedup
        ON info_blobs(tenant_id, website_id, title)
    ",
    r"
    CREATE TABLE IF NOT EXISTS info_blob_chunks (
        info_blob_id TEXT NOT NULL REFERENCES info_blobs(id) ON DELETE CASCADE,
        chunk_no INTEGER NOT NULL,
        text TEXT NOT NULL,
        size INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        tenant_id TEXT NOT NULL,
        PRIMARY KEY (info_blob_id, chunk_no)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS sharepoint_subscriptions (
        id TEXT PRIMARY KEY,
        user_integration_id TEXT NOT NULL,
        site_id TEXT,
        drive_id TEXT NOT NULL,
        external_subscription_id TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_subscriptions_expires
        ON sharepoint_subscriptions(expires_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS integration_knowledge (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        subscription_id TEXT REFERENCES sharepoint_subscriptions(id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS embedding_providers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        api_base TEXT NOT NULL,
        api_key TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS embedding_models (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        provider_id TEXT REFERENCES embedding_providers(id),
        dimensions INTEGER NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS audit_logs (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        action TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_audit_logs_tenant_created
        ON audit_logs(tenant_id, created_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS spaces (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        retention_days INTEGER
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS assistants (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        space_id TEXT REFERENCES spaces(id),
        retention_days INTEGER
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS conversation_sessions (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS questions (
        id TEXT PRIMARY KEY,
        session_id TEXT REFERENCES conversation_sessions(id),
        tenant_id TEXT NOT NULL,
        assistant_id TEXT REFERENCES assistants(id),
        space_id TEXT REFERENCES spaces(id),
        created_at INTEGER NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS app_runs (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        space_id TEXT REFERENCES spaces(id),
        retention_days INTEGER,
        created_at INTEGER NOT NULL
    )
    ",
];

/// Create every table and index the worker needs. Idempotent.
pub async fn create_schema(conn: &Connection) -> Result<()> {
    for statement in SCHEMA {
        conn.execute(statement, ())
            .await
            .map_err(|e| storage_err("Failed to create schema", e))?;
    }
    debug!("ingest schema ready");
    Ok(())
}

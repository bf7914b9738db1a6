//! Website scheduling queries and crawl-window stamps.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ingest_core::recovery::execute_with_recovery;
use ingest_core::storage::WebsiteStore;
use ingest_core::{CrawlType, EmbeddingModelSpec, Error, Result, UpdateInterval, Website};
use libsql::{params, Row};
use tracing::debug;
use uuid::Uuid;

use crate::{storage_err, IngestStore};

const WEBSITE_COLUMNS: &str = "id, tenant_id, user_id, url, crawl_type, update_interval, \
     last_crawl_started_at, last_crawl_finished_at, embedding_model_id";

/// Shortest configured interval; used to pre-filter the due query before the
/// exact per-interval check in [`Website::is_due`].
const MIN_INTERVAL_SECS: i64 = 24 * 3600;

fn parse_uuid(value: &str, column: &str) -> Result<Uuid> {
    value
        .parse()
        .map_err(|_| Error::Storage(format!("invalid uuid in {column}: {value}")))
}

fn timestamp(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

fn row_to_website(row: &Row) -> Result<Website> {
    let id: String = row.get(0).map_err(|e| storage_err("website id", e))?;
    let tenant_id: String = row.get(1).map_err(|e| storage_err("website tenant", e))?;
    let user_id: String = row.get(2).map_err(|e| storage_err("website user", e))?;
    let url: String = row.get(3).map_err(|e| storage_err("website url", e))?;
    let crawl_type: String = row.get(4).map_err(|e| storage_err("website crawl_type", e))?;
    let update_interval: String = row
        .get(5)
        .map_err(|e| storage_err("website update_interval", e))?;
    let started: Option<i64> = row.get(6).ok();
    let finished: Option<i64> = row.get(7).ok();
    let model_id: Option<String> = row.get(8).ok();

    Ok(Website {
        id: parse_uuid(&id, "websites.id")?,
        tenant_id: parse_uuid(&tenant_id, "websites.tenant_id")?,
        user_id: parse_uuid(&user_id, "websites.user_id")?,
        url,
        crawl_type: CrawlType::parse(&crawl_type)
            .ok_or_else(|| Error::Storage(format!("unknown crawl_type: {crawl_type}")))?,
        update_interval: UpdateInterval::parse(&update_interval)
            .ok_or_else(|| Error::Storage(format!("unknown update_interval: {update_interval}")))?,
        last_crawl_started_at: started.and_then(timestamp),
        last_crawl_finished_at: finished.and_then(timestamp),
        embedding_model_id: model_id.map(|m| parse_uuid(&m, "websites.embedding_model_id")).transpose()?,
    })
}

#[async_trait]
impl WebsiteStore for IngestStore {
    async fn get_website(&self, id: Uuid) -> Result<Option<Website>> {
        let conn = self.get_connection()?;
        let mut rows = conn
            .query(
                &format!("SELECT {WEBSITE_COLUMNS} FROM websites WHERE id = ?"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| storage_err("Failed to query website", e))?;

        match rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch website row", e))?
        {
            Some(row) => Ok(Some(row_to_website(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_due_websites(&self, now: DateTime<Utc>) -> Result<Vec<Website>> {
        let conn = self.get_connection()?;
        // The index on last_crawl_finished_at carries this; the exact
        // per-interval and in-flight checks run on the narrowed candidates.
        let cutoff = now.timestamp() - MIN_INTERVAL_SECS;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {WEBSITE_COLUMNS} FROM websites \
                     WHERE update_interval != 'never' \
                       AND (last_crawl_finished_at IS NULL OR last_crawl_finished_at <= ?)"
                ),
                params![cutoff],
            )
            .await
            .map_err(|e| storage_err("Failed to query due websites", e))?;

        let mut due = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch due website row", e))?
        {
            let website = row_to_website(&row)?;
            if website.is_due(now) && !website.has_crawl_in_flight() {
                due.push(website);
            }
        }
        debug!(count = due.len(), "listed due websites");
        Ok(due)
    }

    async fn mark_crawl_started(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        // Crawl-window stamps are issued by multi-minute tasks whose session
        // may have been corrupted since the last operation; route them
        // through the recovery wrapper.
        let factory = self.session_factory();
        execute_with_recovery(&factory, "website_mark_started", move |session| {
            Box::pin(async move {
                let conn = session.connection()?;
                conn.execute(
                    "UPDATE websites SET last_crawl_started_at = ? WHERE id = ?",
                    params![at.timestamp(), id.to_string()],
                )
                .await
                .map_err(|e| storage_err("Failed to mark crawl started", e))?;
                Ok(())
            })
        })
        .await
    }

    async fn mark_crawl_finished(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let factory = self.session_factory();
        execute_with_recovery(&factory, "website_mark_finished", move |session| {
            Box::pin(async move {
                let conn = session.connection()?;
                conn.execute(
                    "UPDATE websites SET last_crawl_finished_at = ? WHERE id = ?",
                    params![at.timestamp(), id.to_string()],
                )
                .await
                .map_err(|e| storage_err("Failed to mark crawl finished", e))?;
                Ok(())
            })
        })
        .await
    }

    async fn get_embedding_model(&self, model_id: Uuid) -> Result<Option<EmbeddingModelSpec>> {
        let conn = self.get_connection()?;
        let mut rows = conn
            .query(
                "SELECT id, name, provider_id, dimensions FROM embedding_models WHERE id = ?",
                params![model_id.to_string()],
            )
            .await
            .map_err(|e| storage_err("Failed to query embedding model", e))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch embedding model row", e))?
        else {
            return Ok(None);
        };

        let id: String = row.get(0).map_err(|e| storage_err("model id", e))?;
        let name: String = row.get(1).map_err(|e| storage_err("model name", e))?;
        let provider_id: Option<String> = row.get(2).ok();
        let dimensions: i64 = row.get(3).map_err(|e| storage_err("model dimensions", e))?;

        Ok(Some(EmbeddingModelSpec {
            id: parse_uuid(&id, "embedding_models.id")?,
            name,
            provider_id: provider_id
                .map(|p| parse_uuid(&p, "embedding_models.provider_id"))
                .transpose()?,
            dimensions: usize::try_from(dimensions)
                .map_err(|_| Error::Storage(format!("negative dimensions: {dimensions}")))?,
        }))
    }
}

/// Insert a website row. Websites are created by the admin surface, which is
/// outside this worker; the helper exists for the CLI's seed path and tests.
pub async fn insert_website(store: &IngestStore, website: &Website) -> Result<()> {
    let conn = store.get_connection()?;
    conn.execute(
        r"
        INSERT INTO websites (
            id, tenant_id, user_id, url, crawl_type, update_interval,
            last_crawl_started_at, last_crawl_finished_at, embedding_model_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
        params![
            website.id.to_string(),
            website.tenant_id.to_string(),
            website.user_id.to_string(),
            website.url.clone(),
            website.crawl_type.as_str(),
            website.update_interval.as_str(),
            website.last_crawl_started_at.map(|t| t.timestamp()),
            website.last_crawl_finished_at.map(|t| t.timestamp()),
            website.embedding_model_id.map(|m| m.to_string()),
        ],
    )
    .await
    .map_err(|e| storage_err("Failed to insert website", e))?;
    Ok(())
}

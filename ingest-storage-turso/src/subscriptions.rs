//! SharePoint subscription repository with reference counting.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ingest_core::storage::SubscriptionStore;
use ingest_core::{Error, Result, Subscription};
use libsql::{params, Row};
use uuid::Uuid;

use crate::{storage_err, IngestStore};

const SUBSCRIPTION_COLUMNS: &str =
    "id, user_integration_id, site_id, drive_id, external_subscription_id, expires_at";

fn row_to_subscription(row: &Row) -> Result<Subscription> {
    let id: String = row.get(0).map_err(|e| storage_err("subscription id", e))?;
    let user_integration_id: String = row
        .get(1)
        .map_err(|e| storage_err("subscription user_integration_id", e))?;
    let site_id: Option<String> = row.get(2).ok();
    let drive_id: String = row.get(3).map_err(|e| storage_err("subscription drive_id", e))?;
    let external_subscription_id: String = row
        .get(4)
        .map_err(|e| storage_err("subscription external id", e))?;
    let expires_at: i64 = row
        .get(5)
        .map_err(|e| storage_err("subscription expires_at", e))?;

    Ok(Subscription {
        id: id
            .parse()
            .map_err(|_| Error::Storage(format!("invalid subscription id: {id}")))?,
        user_integration_id: user_integration_id.parse().map_err(|_| {
            Error::Storage(format!(
                "invalid user_integration_id: {user_integration_id}"
            ))
        })?,
        site_id,
        drive_id,
        external_subscription_id,
        expires_at: Utc
            .timestamp_opt(expires_at, 0)
            .single()
            .ok_or_else(|| Error::Storage(format!("invalid expires_at: {expires_at}")))?,
    })
}

#[async_trait]
impl SubscriptionStore for IngestStore {
    async fn get(&self, id: Uuid) -> Result<Option<Subscription>> {
        let conn = self.get_connection()?;
        let mut rows = conn
            .query(
                &format!("SELECT {SUBSCRIPTION_COLUMNS} FROM sharepoint_subscriptions WHERE id = ?"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| storage_err("Failed to query subscription", e))?;

        match rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch subscription row", e))?
        {
            Some(row) => Ok(Some(row_to_subscription(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_by_user_and_site(
        &self,
        user_integration_id: Uuid,
        site_id: &str,
    ) -> Result<Option<Subscription>> {
        let conn = self.get_connection()?;
        // OneDrive subscriptions store the drive in drive_id with a NULL
        // site; match either shape.
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM sharepoint_subscriptions \
                     WHERE user_integration_id = ? AND (site_id = ? OR (site_id IS NULL AND drive_id = ?))"
                ),
                params![
                    user_integration_id.to_string(),
                    site_id.to_string(),
                    site_id.to_string()
                ],
            )
            .await
            .map_err(|e| storage_err("Failed to query subscription by user and site", e))?;

        match rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch subscription row", e))?
        {
            Some(row) => Ok(Some(row_to_subscription(&row)?)),
            None => Ok(None),
        }
    }

    async fn add(&self, subscription: &Subscription) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            r"
            INSERT INTO sharepoint_subscriptions (
                id, user_integration_id, site_id, drive_id,
                external_subscription_id, expires_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ",
            params![
                subscription.id.to_string(),
                subscription.user_integration_id.to_string(),
                subscription.site_id.clone(),
                subscription.drive_id.clone(),
                subscription.external_subscription_id.clone(),
                subscription.expires_at.timestamp(),
            ],
        )
        .await
        .map_err(|e| storage_err("Failed to insert subscription", e))?;
        Ok(())
    }

    async fn update(&self, subscription: &Subscription) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            r"
            UPDATE sharepoint_subscriptions
            SET external_subscription_id = ?, expires_at = ?, site_id = ?, drive_id = ?
            WHERE id = ?
            ",
            params![
                subscription.external_subscription_id.clone(),
                subscription.expires_at.timestamp(),
                subscription.site_id.clone(),
                subscription.drive_id.clone(),
                subscription.id.to_string(),
            ],
        )
        .await
        .map_err(|e| storage_err("Failed to update subscription", e))?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            "DELETE FROM sharepoint_subscriptions WHERE id = ?",
            params![id.to_string()],
        )
        .await
        .map_err(|e| storage_err("Failed to delete subscription", e))?;
        Ok(())
    }

    async fn count_references(&self, id: Uuid) -> Result<u64> {
        let conn = self.get_connection()?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM integration_knowledge WHERE subscription_id = ?",
                params![id.to_string()],
            )
            .await
            .map_err(|e| storage_err("Failed to count subscription references", e))?;

        let row = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch reference count", e))?
            .ok_or_else(|| Error::Storage("reference count query returned no rows".to_string()))?;
        let count: i64 = row.get(0).map_err(|e| storage_err("reference count", e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn list_expiring_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let conn = self.get_connection()?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM sharepoint_subscriptions \
                     WHERE expires_at < ? ORDER BY expires_at"
                ),
                params![cutoff.timestamp()],
            )
            .await
            .map_err(|e| storage_err("Failed to list expiring subscriptions", e))?;

        let mut subscriptions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch subscription row", e))?
        {
            subscriptions.push(row_to_subscription(&row)?);
        }
        Ok(subscriptions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    static MEM_DB_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

    async fn store() -> IngestStore {
        let id = MEM_DB_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let db = libsql::Builder::new_local(format!("file:subscriptions_mem_{id}?mode=memory&cache=shared"))
            .build()
            .await
            .expect("in-memory db");
        // Shared-cache in-memory databases are freed once their last
        // connection closes; leak one connection so the schema survives
        // across the fresh connections each store operation opens.
        std::mem::forget(db.connect().expect("keep-alive connection"));
        let store = IngestStore::from_database(db);
        store.initialize_schema().await.expect("schema");
        store
    }

    fn subscription(site_id: Option<&str>) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            user_integration_id: Uuid::new_v4(),
            site_id: site_id.map(ToString::to_string),
            drive_id: "drive-1".to_string(),
            external_subscription_id: "remote-1".to_string(),
            expires_at: Utc::now() + ChronoDuration::days(20),
        }
    }

    #[tokio::test]
    async fn add_get_update_remove_round_trip() {
        let store = store().await;
        let mut sub = subscription(Some("site-1"));
        store.add(&sub).await.unwrap();

        let loaded = store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(loaded.external_subscription_id, "remote-1");

        sub.external_subscription_id = "remote-2".to_string();
        store.update(&sub).await.unwrap();
        let updated = store.get(sub.id).await.unwrap().unwrap();
        assert_eq!(updated.external_subscription_id, "remote-2");

        store.remove(sub.id).await.unwrap();
        assert!(store.get(sub.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_by_user_and_site_matches_onedrive_shape() {
        let store = store().await;
        let mut onedrive = subscription(None);
        onedrive.drive_id = "onedrive-drive-9".to_string();
        store.add(&onedrive).await.unwrap();

        let found = store
            .get_by_user_and_site(onedrive.user_integration_id, "onedrive-drive-9")
            .await
            .unwrap();
        assert_eq!(found.map(|s| s.id), Some(onedrive.id));
    }

    #[tokio::test]
    async fn reference_count_tracks_integration_knowledge() {
        let store = store().await;
        let sub = subscription(Some("site-1"));
        store.add(&sub).await.unwrap();
        assert_eq!(store.count_references(sub.id).await.unwrap(), 0);

        let conn = store.get_connection().unwrap();
        for _ in 0..2 {
            conn.execute(
                "INSERT INTO integration_knowledge (id, tenant_id, subscription_id) VALUES (?, ?, ?)",
                params![
                    Uuid::new_v4().to_string(),
                    Uuid::new_v4().to_string(),
                    sub.id.to_string()
                ],
            )
            .await
            .unwrap();
        }
        assert_eq!(store.count_references(sub.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn expiring_listing_is_cutoff_bounded() {
        let store = store().await;
        let mut soon = subscription(Some("site-1"));
        soon.expires_at = Utc::now() + ChronoDuration::hours(1);
        let mut later = subscription(Some("site-2"));
        later.expires_at = Utc::now() + ChronoDuration::days(25);
        store.add(&soon).await.unwrap();
        store.add(&later).await.unwrap();

        let expiring = store
            .list_expiring_before(Utc::now() + ChronoDuration::hours(4))
            .await
            .unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, soon.id);
    }
}

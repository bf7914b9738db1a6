//! Webhook subscription lifecycle against the external document provider.
//!
//! Each subscription lets the provider notify us when documents change so we
//! re-ingest only deltas. Subscriptions expire; a renewal cron keeps
//! `expires_at` strictly in the future, and the record is deleted only when
//! no ingest source references it any more.

mod graph;

pub use graph::{GraphClient, GraphHttpClient, GraphToken, SubscriptionRequest};

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::storage::SubscriptionStore;
use crate::types::Subscription;
use crate::Result;

/// Configuration for subscription management.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Public webhook endpoint. Absent disables subscription creation
    /// gracefully (returns `None`, logged).
    pub notification_url: Option<String>,
    /// Opaque value echoed back in notifications for validation.
    pub client_state: String,
    /// Lifetime requested for new and renewed subscriptions. The provider
    /// caps drive subscriptions at 30 days; stay under it.
    pub lifetime_days: i64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            notification_url: None,
            client_state: "ingest-worker".to_string(),
            lifetime_days: 29,
        }
    }
}

/// Creates, renews, recreates, and reference-counts webhook subscriptions.
pub struct SubscriptionManager {
    store: Arc<dyn SubscriptionStore>,
    graph: Arc<dyn GraphClient>,
    config: SubscriptionConfig,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        graph: Arc<dyn GraphClient>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            store,
            graph,
            config,
        }
    }

    fn next_expiration(&self) -> chrono::DateTime<Utc> {
        Utc::now() + ChronoDuration::days(self.config.lifetime_days)
    }

    fn request_for(
        &self,
        notification_url: &str,
        site_id: Option<&str>,
        drive_id: &str,
    ) -> SubscriptionRequest {
        SubscriptionRequest {
            site_id: site_id.map(ToString::to_string),
            drive_id: drive_id.to_string(),
            notification_url: notification_url.to_string(),
            client_state: self.config.client_state.clone(),
            expires_at: self.next_expiration(),
        }
    }

    /// Return a live subscription for the user and site, creating one when
    /// none exists and recreating when the existing one has expired.
    ///
    /// For OneDrive (`is_onedrive`) the site id doubles as the drive id and
    /// the resource is drive-scoped. Returns `Ok(None)` when no webhook URL
    /// is configured.
    ///
    /// # Errors
    ///
    /// Propagates storage and remote API failures.
    pub async fn ensure_subscription(
        &self,
        user_integration_id: Uuid,
        site_id: &str,
        token: &GraphToken,
        is_onedrive: bool,
    ) -> Result<Option<Subscription>> {
        let Some(notification_url) = self.config.notification_url.clone() else {
            info!("webhook notification url not configured, skipping subscription");
            return Ok(None);
        };

        if let Some(existing) = self
            .store
            .get_by_user_and_site(user_integration_id, site_id)
            .await?
        {
            if !existing.is_expired(Utc::now()) {
                debug!(subscription_id = %existing.id, "existing subscription still valid");
                return Ok(Some(existing));
            }
            let recreated = self.recreate_expired(&existing, token, is_onedrive).await?;
            return Ok(Some(recreated));
        }

        // OneDrive has no separate site: the drive is addressed directly.
        let (resource_site, drive_id) = if is_onedrive {
            (None, site_id.to_string())
        } else {
            let drive_id = self.graph.resolve_drive_id(token, site_id).await?;
            (Some(site_id), drive_id)
        };

        let request = self.request_for(&notification_url, resource_site, &drive_id);
        let external_id = self.graph.create_subscription(token, &request).await?;

        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_integration_id,
            site_id: resource_site.map(ToString::to_string),
            drive_id,
            external_subscription_id: external_id,
            expires_at: request.expires_at,
        };
        self.store.add(&subscription).await?;
        info!(subscription_id = %subscription.id, "created subscription");
        Ok(Some(subscription))
    }

    /// Replace an expired subscription: delete the remote one (404 is fine,
    /// it may already be gone), create a fresh remote subscription with the
    /// same resource shape, and update the local record in place.
    ///
    /// # Errors
    ///
    /// Propagates remote create and storage failures. A failed remote delete
    /// is logged and skipped: the stale remote subscription expires on its
    /// own.
    pub async fn recreate_expired(
        &self,
        subscription: &Subscription,
        token: &GraphToken,
        is_onedrive: bool,
    ) -> Result<Subscription> {
        let Some(notification_url) = self.config.notification_url.clone() else {
            return Err(crate::Error::Configuration(
                "webhook notification url not configured".to_string(),
            ));
        };

        if let Err(e) = self
            .graph
            .delete_subscription(token, &subscription.external_subscription_id)
            .await
        {
            warn!(subscription_id = %subscription.id, error = %e,
                "failed to delete stale remote subscription, continuing");
        }

        // The OneDrive flag must survive automatic recreations: the two
        // providers use different resource URL shapes.
        let site_id = if is_onedrive {
            None
        } else {
            subscription.site_id.as_deref()
        };
        let request = self.request_for(&notification_url, site_id, &subscription.drive_id);
        let external_id = self.graph.create_subscription(token, &request).await?;

        let mut updated = subscription.clone();
        updated.external_subscription_id = external_id;
        updated.expires_at = request.expires_at;
        self.store.update(&updated).await?;
        info!(subscription_id = %updated.id, "recreated expired subscription");
        Ok(updated)
    }

    /// Extend the remote expiration. A 404 from the provider falls through
    /// to [`SubscriptionManager::recreate_expired`]. Returns `false` when
    /// neither renewal nor recreation succeeded.
    pub async fn renew(
        &self,
        subscription: &Subscription,
        token: &GraphToken,
        is_onedrive: bool,
    ) -> bool {
        let expires_at = self.next_expiration();
        match self
            .graph
            .renew_subscription(token, &subscription.external_subscription_id, expires_at)
            .await
        {
            Ok(true) => {
                let mut updated = subscription.clone();
                updated.expires_at = expires_at;
                if let Err(e) = self.store.update(&updated).await {
                    warn!(subscription_id = %subscription.id, error = %e,
                        "renewed remotely but failed to record locally");
                    return false;
                }
                debug!(subscription_id = %subscription.id, "renewed subscription");
                true
            }
            Ok(false) => {
                info!(subscription_id = %subscription.id,
                    "remote subscription gone, recreating");
                self.recreate_expired(subscription, token, is_onedrive)
                    .await
                    .is_ok()
            }
            Err(e) => {
                warn!(subscription_id = %subscription.id, error = %e, "renewal failed");
                false
            }
        }
    }

    /// Delete the subscription only when nothing references it any more.
    /// The local row is removed (and committed) first; the remote delete
    /// runs as a detached best-effort task, with the daily orphan cleanup
    /// sweeping any stragglers.
    ///
    /// Returns `true` when the subscription was deleted.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn delete_if_unused(&self, subscription_id: Uuid, token: &GraphToken) -> Result<bool> {
        let references = self.store.count_references(subscription_id).await?;
        if references > 0 {
            debug!(subscription_id = %subscription_id, references, "subscription still referenced");
            return Ok(false);
        }

        let Some(subscription) = self.store.get(subscription_id).await? else {
            return Ok(false);
        };

        // Local state first: a failed remote delete must not roll this back.
        self.store.remove(subscription_id).await?;

        let graph = Arc::clone(&self.graph);
        let token = token.clone();
        let external_id = subscription.external_subscription_id;
        tokio::spawn(async move {
            if let Err(e) = graph.delete_subscription(&token, &external_id).await {
                warn!(external_subscription_id = %external_id, error = %e,
                    "best-effort remote delete failed, orphan cleanup will retry");
            }
        });

        info!(subscription_id = %subscription_id, "deleted unused subscription");
        Ok(true)
    }

    /// Subscriptions expiring within `threshold_hours`, for the renewal cron.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn list_expiring(&self, threshold_hours: i64) -> Result<Vec<Subscription>> {
        let cutoff = Utc::now() + ChronoDuration::hours(threshold_hours);
        self.store.list_expiring_before(cutoff).await
    }
}

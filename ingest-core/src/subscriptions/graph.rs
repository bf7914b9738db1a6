//! Microsoft-Graph-shaped change-notification API client.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Delegated or application token for the document provider API.
#[derive(Debug, Clone)]
pub struct GraphToken {
    pub access_token: String,
    /// API origin, e.g. `https://graph.microsoft.com`.
    pub base_url: String,
}

/// Parameters for creating one remote subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    /// Absent for OneDrive, whose resource is drive-scoped.
    pub site_id: Option<String>,
    pub drive_id: String,
    pub notification_url: String,
    pub client_state: String,
    pub expires_at: DateTime<Utc>,
}

impl SubscriptionRequest {
    /// Resource path for the subscription. OneDrive and SharePoint use
    /// different shapes: `/drives/{id}/root` vs
    /// `/sites/{siteId}/drives/{driveId}/root`.
    #[must_use]
    pub fn resource(&self) -> String {
        match &self.site_id {
            Some(site_id) => format!("/sites/{site_id}/drives/{}/root", self.drive_id),
            None => format!("/drives/{}/root", self.drive_id),
        }
    }
}

/// Narrow seam over the remote subscription API.
#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Create a subscription; returns the remote subscription id.
    async fn create_subscription(
        &self,
        token: &GraphToken,
        request: &SubscriptionRequest,
    ) -> Result<String>;

    /// PATCH the remote expiration. Returns `false` when the remote
    /// subscription no longer exists (404), which callers treat as a signal
    /// to recreate.
    async fn renew_subscription(
        &self,
        token: &GraphToken,
        external_subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete the remote subscription, tolerating 404: it may already be
    /// gone, and that is success.
    async fn delete_subscription(
        &self,
        token: &GraphToken,
        external_subscription_id: &str,
    ) -> Result<()>;

    /// Resolve the default drive id for a site.
    async fn resolve_drive_id(&self, token: &GraphToken, site_id: &str) -> Result<String>;
}

/// `reqwest` implementation of [`GraphClient`].
pub struct GraphHttpClient {
    client: reqwest::Client,
}

impl GraphHttpClient {
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for GraphHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionBody<'a> {
    change_type: &'a str,
    notification_url: &'a str,
    resource: String,
    expiration_date_time: String,
    client_state: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenewSubscriptionBody {
    expiration_date_time: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DriveResponse {
    id: String,
}

fn format_expiration(expires_at: DateTime<Utc>) -> String {
    expires_at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl GraphClient for GraphHttpClient {
    async fn create_subscription(
        &self,
        token: &GraphToken,
        request: &SubscriptionRequest,
    ) -> Result<String> {
        let url = format!("{}/v1.0/subscriptions", token.base_url);
        let body = CreateSubscriptionBody {
            change_type: "updated",
            notification_url: &request.notification_url,
            resource: request.resource(),
            expiration_date_time: format_expiration(request.expires_at),
            client_state: &request.client_state,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("subscription create request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "subscription create failed with {status}: {text}"
            )));
        }

        let created: SubscriptionResponse = response
            .json()
            .await
            .map_err(|e| Error::Http(format!("unreadable subscription create response: {e}")))?;
        debug!(subscription_id = %created.id, resource = %body.resource, "created remote subscription");
        Ok(created.id)
    }

    async fn renew_subscription(
        &self,
        token: &GraphToken,
        external_subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let url = format!(
            "{}/v1.0/subscriptions/{external_subscription_id}",
            token.base_url
        );
        let body = RenewSubscriptionBody {
            expiration_date_time: format_expiration(expires_at),
        };

        let response = self
            .client
            .patch(&url)
            .bearer_auth(&token.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("subscription renew request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "subscription renew failed with {status}: {text}"
            )));
        }
        Ok(true)
    }

    async fn delete_subscription(
        &self,
        token: &GraphToken,
        external_subscription_id: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/v1.0/subscriptions/{external_subscription_id}",
            token.base_url
        );

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| Error::Http(format!("subscription delete request failed: {e}")))?;

        let status = response.status();
        // 404 means already gone: success for our purposes.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(Error::Http(format!(
            "subscription delete failed with {status}: {text}"
        )))
    }

    async fn resolve_drive_id(&self, token: &GraphToken, site_id: &str) -> Result<String> {
        let url = format!("{}/v1.0/sites/{site_id}/drive", token.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| Error::Http(format!("drive resolution request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "drive resolution failed with {status}: {text}"
            )));
        }

        let drive: DriveResponse = response
            .json()
            .await
            .map_err(|e| Error::Http(format!("unreadable drive response: {e}")))?;
        Ok(drive.id)
    }
}

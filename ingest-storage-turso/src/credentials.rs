//! Embedding-provider credential lookup.
//!
//! Phase 1's only database touch: the session is opened, read, and dropped
//! before the persister makes its first embedding API call.

use async_trait::async_trait;
use ingest_core::storage::CredentialStore;
use ingest_core::{ProviderCredentials, Result};
use libsql::params;
use uuid::Uuid;

use crate::{storage_err, IngestStore};

#[async_trait]
impl CredentialStore for IngestStore {
    async fn load_provider_credentials(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<ProviderCredentials>> {
        let conn = self.get_connection()?;
        let mut rows = conn
            .query(
                "SELECT api_base, api_key FROM embedding_providers WHERE id = ?",
                params![provider_id.to_string()],
            )
            .await
            .map_err(|e| storage_err("Failed to query provider credentials", e))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch provider row", e))?
        else {
            return Ok(None);
        };

        let api_base: String = row.get(0).map_err(|e| storage_err("provider api_base", e))?;
        let api_key: String = row.get(1).map_err(|e| storage_err("provider api_key", e))?;
        Ok(Some(ProviderCredentials { api_base, api_key }))
    }
}

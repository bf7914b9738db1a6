//! Tenant repository.

use async_trait::async_trait;
use ingest_core::storage::TenantStore;
use ingest_core::{Error, Result, Tenant, TenantState};
use libsql::{params, Row};
use uuid::Uuid;

use crate::{storage_err, IngestStore};

const TENANT_COLUMNS: &str =
    "id, name, state, audit_retention_days, conversation_retention_days";

fn row_to_tenant(row: &Row) -> Result<Tenant> {
    let id: String = row.get(0).map_err(|e| storage_err("tenant id", e))?;
    let name: String = row.get(1).map_err(|e| storage_err("tenant name", e))?;
    let state: String = row.get(2).map_err(|e| storage_err("tenant state", e))?;
    let audit_retention_days: i64 = row
        .get(3)
        .map_err(|e| storage_err("tenant audit retention", e))?;
    let conversation_retention_days: Option<i64> = row.get(4).ok();

    let state = match state.as_str() {
        "active" => TenantState::Active,
        "suspended" => TenantState::Suspended,
        other => return Err(Error::Storage(format!("unknown tenant state: {other}"))),
    };

    Ok(Tenant {
        id: id
            .parse()
            .map_err(|_| Error::Storage(format!("invalid uuid in tenants.id: {id}")))?,
        name,
        state,
        audit_retention_days,
        conversation_retention_days,
    })
}

#[async_trait]
impl TenantStore for IngestStore {
    async fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        self.list_tenants_where("WHERE state = 'active'").await
    }

    async fn list_all_tenants(&self) -> Result<Vec<Tenant>> {
        self.list_tenants_where("").await
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>> {
        let conn = self.get_connection()?;
        let mut rows = conn
            .query(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| storage_err("Failed to query tenant", e))?;

        match rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch tenant row", e))?
        {
            Some(row) => Ok(Some(row_to_tenant(&row)?)),
            None => Ok(None),
        }
    }
}

impl IngestStore {
    async fn list_tenants_where(&self, filter: &str) -> Result<Vec<Tenant>> {
        let conn = self.get_connection()?;
        let mut rows = conn
            .query(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants {filter} ORDER BY name"),
                (),
            )
            .await
            .map_err(|e| storage_err("Failed to list tenants", e))?;

        let mut tenants = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| storage_err("Failed to fetch tenant row", e))?
        {
            tenants.push(row_to_tenant(&row)?);
        }
        Ok(tenants)
    }
}

/// Insert a tenant row. Tenant CRUD lives in the admin surface; this helper
/// backs the CLI seed path and tests.
pub async fn insert_tenant(store: &IngestStore, tenant: &Tenant) -> Result<()> {
    let conn = store.get_connection()?;
    conn.execute(
        r"
        INSERT INTO tenants (
            id, name, state, audit_retention_days, conversation_retention_days, created_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        ",
        params![
            tenant.id.to_string(),
            tenant.name.clone(),
            match tenant.state {
                TenantState::Active => "active",
                TenantState::Suspended => "suspended",
            },
            tenant.audit_retention_days,
            tenant.conversation_retention_days,
            chrono::Utc::now().timestamp(),
        ],
    )
    .await
    .map_err(|e| storage_err("Failed to insert tenant", e))?;
    Ok(())
}

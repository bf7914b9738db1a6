//! Tenant isolation in the retention crons.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ingest_core::cron;
use ingest_core::storage::{ConversationPurgeStats, RetentionStore, TenantStore};
use ingest_core::{Error, Result, Tenant, TenantState};
use parking_lot::Mutex;
use uuid::Uuid;

struct StaticTenants {
    tenants: Vec<Tenant>,
}

#[async_trait]
impl TenantStore for StaticTenants {
    async fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self
            .tenants
            .iter()
            .filter(|t| t.is_active())
            .cloned()
            .collect())
    }

    async fn list_all_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.tenants.clone())
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>> {
        Ok(self.tenants.iter().find(|t| t.id == id).cloned())
    }
}

/// Retention store where one tenant's purge always fails.
struct FlakyRetention {
    failing_tenant: Uuid,
    purged: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl RetentionStore for FlakyRetention {
    async fn purge_audit_logs_for_tenant(
        &self,
        tenant_id: Uuid,
        _retention_days: i64,
        _now: DateTime<Utc>,
    ) -> Result<u64> {
        if tenant_id == self.failing_tenant {
            return Err(Error::Storage("disk full".to_string()));
        }
        self.purged.lock().push(tenant_id);
        Ok(3)
    }

    async fn purge_conversations(&self, _now: DateTime<Utc>) -> Result<ConversationPurgeStats> {
        Ok(ConversationPurgeStats::default())
    }
}

fn tenant(name: &str) -> Tenant {
    Tenant {
        id: Uuid::new_v4(),
        name: name.to_string(),
        state: TenantState::Active,
        audit_retention_days: 365,
        conversation_retention_days: None,
    }
}

#[tokio::test]
async fn one_tenants_purge_failure_does_not_stop_the_others() {
    let tenant_a = tenant("acme");
    let tenant_b = tenant("globex");
    let tenant_c = tenant("initech");
    let tenants = StaticTenants {
        tenants: vec![tenant_a.clone(), tenant_b.clone(), tenant_c.clone()],
    };
    let retention = FlakyRetention {
        failing_tenant: tenant_b.id,
        purged: Mutex::new(vec![]),
    };

    let stats = cron::purge_audit_logs(&tenants, &retention, Utc::now())
        .await
        .unwrap();

    assert_eq!(stats.tenants_processed, 2);
    assert_eq!(stats.tenants_failed, 1);
    assert_eq!(stats.rows_purged, 6);

    let purged = retention.purged.lock();
    assert!(purged.contains(&tenant_a.id));
    assert!(purged.contains(&tenant_c.id));
    assert!(!purged.contains(&tenant_b.id));
}

#[tokio::test]
async fn suspended_tenants_still_get_their_data_purged() {
    // Retention applies to every tenant; suspension only stops new crawls.
    let mut suspended = tenant("dormant");
    suspended.state = TenantState::Suspended;
    let tenants = StaticTenants {
        tenants: vec![suspended.clone()],
    };
    let retention = FlakyRetention {
        failing_tenant: Uuid::new_v4(),
        purged: Mutex::new(vec![]),
    };

    let stats = cron::purge_audit_logs(&tenants, &retention, Utc::now())
        .await
        .unwrap();

    assert_eq!(stats.tenants_processed, 1);
    assert!(retention.purged.lock().contains(&suspended.id));
}

#[tokio::test]
async fn real_store_purges_tenants_in_separate_transactions() {
    use ingest_storage_turso::{insert_tenant, IngestStore};
    use libsql::params;

    let db = libsql::Builder::new_local("file:cron_isolation_mem?mode=memory&cache=shared")
        .build()
        .await
        .expect("in-memory db");
    // Shared-cache in-memory databases are freed once their last
    // connection closes; leak one connection so the schema survives
    // across the fresh connections each store operation opens.
    std::mem::forget(db.connect().expect("keep-alive connection"));
    let store = IngestStore::from_database(db);
    store.initialize_schema().await.expect("schema");

    let tenant_a = tenant("acme");
    let tenant_b = tenant("globex");
    insert_tenant(&store, &tenant_a).await.unwrap();
    insert_tenant(&store, &tenant_b).await.unwrap();

    let conn = store.get_connection().unwrap();
    for tenant_id in [tenant_a.id, tenant_b.id] {
        conn.execute(
            "INSERT INTO audit_logs (id, tenant_id, action, created_at) VALUES (?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                tenant_id.to_string(),
                "login".to_string(),
                (Utc::now() - ChronoDuration::days(400)).timestamp()
            ],
        )
        .await
        .unwrap();
    }

    let stats = cron::purge_audit_logs(&store, &store, Utc::now())
        .await
        .unwrap();
    assert_eq!(stats.tenants_processed, 2);
    assert_eq!(stats.rows_purged, 2);

    let mut rows = conn
        .query("SELECT COUNT(*) FROM audit_logs", ())
        .await
        .unwrap();
    let remaining: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
    assert_eq!(remaining, 0);
}

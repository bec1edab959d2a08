//! Tenant directory: channel sender identifier -> tenant configuration.
//!
//! Tenants are created by an external onboarding flow; the pipeline only reads them.
//! Two sources are supported: tenants declared in the config file and the `tenants`
//! table of the store.

use crate::config::TenantConfig;
use crate::store::{from_millis, to_millis, Database, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

/// One onboarded customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    /// Channel sender identifier (WhatsApp phone_number_id).
    pub sender_id: String,
    pub name: String,
    /// Remote assistant id.
    pub agent_id: String,
    pub active: bool,
    pub welcome_text: Option<String>,
    pub report_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Display label for reports: the name, or the sender id when unnamed.
    pub fn label(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.sender_id
        } else {
            &self.name
        }
    }
}

/// Read access to tenants.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// The active tenant owning this sender id, if any.
    async fn find_active(&self, sender_id: &str) -> Result<Option<Tenant>, StoreError>;
}

/// Tenants declared in the config file.
pub struct StaticTenantDirectory {
    tenants: Vec<Tenant>,
}

impl StaticTenantDirectory {
    pub fn new(tenants: Vec<Tenant>) -> Self {
        Self { tenants }
    }

    pub fn from_config(entries: &[TenantConfig]) -> Self {
        let now = Utc::now();
        let tenants = entries
            .iter()
            .map(|t| Tenant {
                sender_id: t.sender_id.trim().to_string(),
                name: t.name.clone(),
                agent_id: t.agent_id.trim().to_string(),
                active: t.active,
                welcome_text: t.welcome_text.clone(),
                report_email: t.report_email.clone(),
                created_at: now,
                updated_at: now,
            })
            .collect();
        Self { tenants }
    }
}

#[async_trait]
impl TenantDirectory for StaticTenantDirectory {
    async fn find_active(&self, sender_id: &str) -> Result<Option<Tenant>, StoreError> {
        Ok(self
            .tenants
            .iter()
            .find(|t| t.active && t.sender_id == sender_id)
            .cloned())
    }
}

/// Tenants stored in the `tenants` table.
#[derive(Clone)]
pub struct SqliteTenantDirectory {
    db: Database,
}

impl SqliteTenantDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the active tenant for `tenant.sender_id`. For onboarding tooling and tests;
    /// the pipeline itself never writes tenants.
    pub async fn upsert(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let mut conn = self.db.lock().await;
        let tx = conn.transaction()?;
        if tenant.active {
            tx.execute(
                "UPDATE tenants SET active = 0, updated_at = ?2 WHERE sender_id = ?1 AND active = 1",
                params![tenant.sender_id, to_millis(tenant.updated_at)],
            )?;
        }
        tx.execute(
            "INSERT INTO tenants(sender_id, name, agent_id, active, welcome_text, report_email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tenant.sender_id,
                tenant.name,
                tenant.agent_id,
                tenant.active,
                tenant.welcome_text,
                tenant.report_email,
                to_millis(tenant.created_at),
                to_millis(tenant.updated_at)
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

#[async_trait]
impl TenantDirectory for SqliteTenantDirectory {
    async fn find_active(&self, sender_id: &str) -> Result<Option<Tenant>, StoreError> {
        let conn = self.db.lock().await;
        let tenant = conn
            .query_row(
                "SELECT sender_id, name, agent_id, active, welcome_text, report_email, created_at, updated_at
                 FROM tenants WHERE sender_id = ?1 AND active = 1",
                params![sender_id],
                |row| {
                    Ok(Tenant {
                        sender_id: row.get(0)?,
                        name: row.get(1)?,
                        agent_id: row.get(2)?,
                        active: row.get(3)?,
                        welcome_text: row.get(4)?,
                        report_email: row.get(5)?,
                        created_at: from_millis(row.get(6)?),
                        updated_at: from_millis(row.get(7)?),
                    })
                },
            )
            .optional()?;
        Ok(tenant)
    }
}

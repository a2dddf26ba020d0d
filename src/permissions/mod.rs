pub mod gate;

pub use gate::{AllowOnceGate, ApprovalGate, GateDecision, PermissionRequest};

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use std::fmt;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum::EnumIter;

/// Closed enumeration of permission scopes the executor may consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum Scope {
    ProcessRun,
    ClipboardRead,
    FileReadAll,
    FileWriteSandbox,
    VisionReadScreen,
    AccessibilityReadApps,
    AccessibilityControlApps,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::ProcessRun => "tool.process.run",
            Scope::ClipboardRead => "tool.clipboard.read",
            Scope::FileReadAll => "tool.file.read_all",
            Scope::FileWriteSandbox => "tool.file.write_sandbox",
            Scope::VisionReadScreen => "context.vision.read_screen",
            Scope::AccessibilityReadApps => "context.accessibility.read_apps",
            Scope::AccessibilityControlApps => "context.accessibility.control_apps",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = crate::error::PermissionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Scope::iter()
            .find(|scope| scope.as_str() == value)
            .ok_or_else(|| crate::error::PermissionError::UnknownScope(value.to_string()))
    }
}

/// Tri-state grant status. Absence of a record means `Ask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionStatus {
    #[default]
    Ask,
    Allow,
    Deny,
}

impl PermissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionStatus::Ask => "ask",
            PermissionStatus::Allow => "allow",
            PermissionStatus::Deny => "deny",
        }
    }
}

impl FromStr for PermissionStatus {
    type Err = crate::error::PermissionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ask" => Ok(PermissionStatus::Ask),
            "allow" => Ok(PermissionStatus::Allow),
            "deny" => Ok(PermissionStatus::Deny),
            other => Err(crate::error::PermissionError::UnknownStatus(
                other.to_string(),
            )),
        }
    }
}

/// A stored grant row, keyed by (`agent_id`, scope).
#[derive(Debug, Clone)]
pub struct GrantRecord {
    pub agent_id: String,
    pub scope: String,
    pub status: PermissionStatus,
    pub updated_at: String,
}

/// Persistent per-(agent, scope) grant store.
///
/// All operations run through the async pool so the scheduling loop never
/// blocks on durable I/O; sqlite serializes concurrent writers reachable from
/// both the ambient and escalation paths.
pub struct PermissionLedger {
    pool: SqlitePool,
}

impl PermissionLedger {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS permissions (
                 agent_id TEXT NOT NULL,
                 scope TEXT NOT NULL,
                 status TEXT NOT NULL CHECK(status IN ('ask', 'allow', 'deny')),
                 updated_at TEXT NOT NULL,
                 PRIMARY KEY (agent_id, scope)
             )",
        )
        .execute(&pool)
        .await
        .context("create permissions table")?;

        Ok(Self { pool })
    }

    /// Current status for (agent, scope); `Ask` when no record exists.
    pub async fn check(&self, agent_id: &str, scope: Scope) -> Result<PermissionStatus> {
        let row = sqlx::query("SELECT status FROM permissions WHERE agent_id = $1 AND scope = $2")
            .bind(agent_id)
            .bind(scope.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("load permission row")?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("status")?;
                match raw.parse::<PermissionStatus>() {
                    Ok(status) => Ok(status),
                    Err(error) => {
                        tracing::warn!(%error, "invalid permission status in ledger");
                        Ok(PermissionStatus::Ask)
                    }
                }
            }
            None => Ok(PermissionStatus::Ask),
        }
    }

    /// Upsert a grant.
    pub async fn set(&self, agent_id: &str, scope: Scope, status: PermissionStatus) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO permissions (agent_id, scope, status, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT(agent_id, scope) DO UPDATE SET
                 status = $3,
                 updated_at = $4",
        )
        .bind(agent_id)
        .bind(scope.as_str())
        .bind(status.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("upsert permission")?;

        tracing::info!(agent_id, scope = scope.as_str(), status = status.as_str(), "permission updated");
        Ok(())
    }

    /// Delete the record, reverting the pair to `Ask`.
    pub async fn revoke(&self, agent_id: &str, scope: Scope) -> Result<()> {
        sqlx::query("DELETE FROM permissions WHERE agent_id = $1 AND scope = $2")
            .bind(agent_id)
            .bind(scope.as_str())
            .execute(&self.pool)
            .await
            .context("delete permission")?;
        tracing::info!(agent_id, scope = scope.as_str(), "permission revoked");
        Ok(())
    }

    pub async fn list(&self, agent_id: Option<&str>) -> Result<Vec<GrantRecord>> {
        let rows = match agent_id {
            Some(agent_id) => {
                sqlx::query(
                    "SELECT agent_id, scope, status, updated_at FROM permissions
                     WHERE agent_id = $1 ORDER BY scope",
                )
                .bind(agent_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT agent_id, scope, status, updated_at FROM permissions
                     ORDER BY agent_id, scope",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("status")?;
                Ok(GrantRecord {
                    agent_id: row.try_get("agent_id")?,
                    scope: row.try_get("scope")?,
                    status: raw.parse().unwrap_or_default(),
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_state_pool;
    use tempfile::TempDir;

    async fn ledger() -> (TempDir, PermissionLedger) {
        let temp = TempDir::new().unwrap();
        let pool = open_state_pool(temp.path()).await.unwrap();
        (temp, PermissionLedger::new(pool).await.unwrap())
    }

    #[test]
    fn scope_round_trips_through_str() {
        for scope in Scope::iter() {
            assert_eq!(scope.as_str().parse::<Scope>().unwrap(), scope);
        }
        assert!("tool.unknown.thing".parse::<Scope>().is_err());
    }

    #[tokio::test]
    async fn absent_record_defaults_to_ask() {
        let (_temp, ledger) = ledger().await;
        let status = ledger.check("ambient", Scope::ProcessRun).await.unwrap();
        assert_eq!(status, PermissionStatus::Ask);
    }

    #[tokio::test]
    async fn set_then_check_round_trips() {
        let (_temp, ledger) = ledger().await;
        ledger
            .set("ambient", Scope::ClipboardRead, PermissionStatus::Allow)
            .await
            .unwrap();
        assert_eq!(
            ledger.check("ambient", Scope::ClipboardRead).await.unwrap(),
            PermissionStatus::Allow
        );

        // Upsert flips the same key.
        ledger
            .set("ambient", Scope::ClipboardRead, PermissionStatus::Deny)
            .await
            .unwrap();
        assert_eq!(
            ledger.check("ambient", Scope::ClipboardRead).await.unwrap(),
            PermissionStatus::Deny
        );
    }

    #[tokio::test]
    async fn revoke_reverts_to_ask() {
        let (_temp, ledger) = ledger().await;
        ledger
            .set("ambient", Scope::ProcessRun, PermissionStatus::Deny)
            .await
            .unwrap();
        ledger.revoke("ambient", Scope::ProcessRun).await.unwrap();
        assert_eq!(
            ledger.check("ambient", Scope::ProcessRun).await.unwrap(),
            PermissionStatus::Ask
        );
    }

    #[tokio::test]
    async fn grants_persist_across_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let pool = open_state_pool(temp.path()).await.unwrap();
            let ledger = PermissionLedger::new(pool.clone()).await.unwrap();
            ledger
                .set("interactive", Scope::VisionReadScreen, PermissionStatus::Allow)
                .await
                .unwrap();
            pool.close().await;
        }

        let pool = open_state_pool(temp.path()).await.unwrap();
        let ledger = PermissionLedger::new(pool).await.unwrap();
        assert_eq!(
            ledger
                .check("interactive", Scope::VisionReadScreen)
                .await
                .unwrap(),
            PermissionStatus::Allow
        );
    }

    #[tokio::test]
    async fn list_filters_by_agent() {
        let (_temp, ledger) = ledger().await;
        ledger
            .set("a", Scope::ProcessRun, PermissionStatus::Allow)
            .await
            .unwrap();
        ledger
            .set("b", Scope::ProcessRun, PermissionStatus::Deny)
            .await
            .unwrap();

        assert_eq!(ledger.list(None).await.unwrap().len(), 2);
        let only_a = ledger.list(Some("a")).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].status, PermissionStatus::Allow);
    }
}

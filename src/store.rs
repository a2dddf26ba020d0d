use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Open (or create) the shared agent state database.
///
/// One pool backs the permission ledger, the persistent action log, and
/// episodic memory, so concurrent writers from the ambient and escalation
/// paths are serialized by sqlite itself.
pub async fn open_state_pool(state_dir: &Path) -> Result<SqlitePool> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("create state dir {}", state_dir.display()))?;
    let db_path = state_dir.join("famulus.db");

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
        .context("parse sqlite connect options")?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("open {}", db_path.display()))?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(&pool)
        .await?;

    Ok(pool)
}

// ─── Persistent action log ──────────────────────────────────────────────────

/// Append-only record of every executed action.
pub struct ActionLog {
    pool: SqlitePool,
}

impl ActionLog {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS action_log (
                 id TEXT PRIMARY KEY,
                 action TEXT NOT NULL,
                 arguments TEXT NOT NULL,
                 created_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await
        .context("create action_log table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_action_log_created
                 ON action_log(created_at)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn record(&self, action: &str, arguments: &Value) -> Result<()> {
        sqlx::query("INSERT INTO action_log (id, action, arguments, created_at) VALUES ($1, $2, $3, $4)")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(action)
            .bind(arguments.to_string())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .context("insert action_log row")?;
        Ok(())
    }

    pub async fn count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM action_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(row.0).unwrap_or(0))
    }
}

// ─── Episodic memory facts ──────────────────────────────────────────────────

/// Free-form facts the agent chose to remember, recalled as grounding for
/// future decisions.
pub struct EpisodicStore {
    pool: SqlitePool,
}

impl EpisodicStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS facts (
                 id TEXT PRIMARY KEY,
                 fact TEXT NOT NULL,
                 metadata TEXT,
                 created_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await
        .context("create facts table")?;

        Ok(Self { pool })
    }

    pub async fn add(&self, fact: &str, metadata: Option<&Value>) -> Result<()> {
        sqlx::query("INSERT INTO facts (id, fact, metadata, created_at) VALUES ($1, $2, $3, $4)")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(fact)
            .bind(metadata.map(std::string::ToString::to_string))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .context("insert fact")?;
        Ok(())
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT fact, created_at FROM facts ORDER BY created_at DESC LIMIT $1")
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(format_fact_row).collect())
    }

    /// Substring relevance over whitespace-split query terms.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<String>> {
        let terms: Vec<&str> = query.split_whitespace().take(5).collect();
        if terms.is_empty() {
            return self.recent(limit).await;
        }

        let mut builder: sqlx::QueryBuilder<'_, sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT fact, created_at FROM facts WHERE ");
        let mut separated = builder.separated(" OR ");
        for term in terms {
            separated.push("fact LIKE ");
            separated.push_bind_unseparated(format!("%{term}%"));
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(format_fact_row).collect())
    }

    /// Sweep facts older than the retention window.
    pub async fn cleanup_old(&self, days_to_keep: u32) -> Result<u64> {
        let cutoff = (Utc::now() - Duration::days(i64::from(days_to_keep))).to_rfc3339();
        let result = sqlx::query("DELETE FROM facts WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("sweep old facts")?;
        Ok(result.rows_affected())
    }
}

fn format_fact_row(row: &sqlx::sqlite::SqliteRow) -> String {
    let fact: String = row.try_get("fact").unwrap_or_default();
    let created_at: String = row.try_get("created_at").unwrap_or_default();
    format!("{created_at}: {fact}")
}

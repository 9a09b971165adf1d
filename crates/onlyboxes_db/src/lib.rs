//! SQLite persistence for the Onlyboxes console.
//!
//! One pool, four stores (accounts, tokens, workers, tasks), raw SQL.
//! `Database::open` applies the schema and runs startup recovery before
//! returning, so no caller can observe pre-recovery state.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tracing::info;

pub mod accounts;
pub mod models;
pub mod schema;
pub mod tasks;
pub mod tokens;
pub mod workers;

pub use accounts::AccountStore;
pub use models::{
    fmt_ts, AccountRow, CapabilityRow, CredentialRow, LabelRow, OwnerClaimRow, TaskRow,
    TaskStatusColumn, TokenRow, TouchResult, WorkerNodeRow,
};
pub use tasks::{NewTask, TaskStore};
pub use tokens::TokenStore;
pub use workers::{CandidateRow, HelloUpdate, WorkerStore};

/// Counters from startup recovery, logged once at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub cleared_sessions: u64,
    pub failed_tasks: u64,
}

/// Handle to the console database.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open (creating if missing), apply schema, and run startup recovery.
    pub async fn open(url: &str, retention: Duration) -> Result<(Self, RecoveryReport)> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid database URL: {url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {url}"))?;
        let db = Self { pool };
        let report = db.init(retention).await?;
        Ok((db, report))
    }

    /// In-memory database for tests. A single connection: SQLite memory
    /// databases are per-connection.
    pub async fn open_in_memory(retention: Duration) -> Result<(Self, RecoveryReport)> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .context("Failed to open in-memory database")?;
        let db = Self { pool };
        let report = db.init(retention).await?;
        Ok((db, report))
    }

    async fn init(&self, retention: Duration) -> Result<RecoveryReport> {
        schema::ensure_schema_version(&self.pool, schema::SCHEMA_VERSION).await?;
        schema::init_schema(&self.pool).await?;

        // Startup recovery: no session and no non-terminal task survives
        // a restart. Runs before the registry or dispatcher see traffic.
        let now = Utc::now();
        let cleared_sessions = self.workers().clear_all_sessions().await?;
        let failed_tasks = self.tasks().fail_all_running(now, retention).await?;
        if cleared_sessions > 0 || failed_tasks > 0 {
            info!(
                cleared_sessions,
                failed_tasks, "Startup recovery restored registry invariants"
            );
        }
        Ok(RecoveryReport {
            cleared_sessions,
            failed_tasks,
        })
    }

    pub fn accounts(&self) -> AccountStore {
        AccountStore::new(self.pool.clone())
    }

    pub fn tokens(&self) -> TokenStore {
        TokenStore::new(self.pool.clone())
    }

    pub fn workers(&self) -> WorkerStore {
        WorkerStore::new(self.pool.clone())
    }

    pub fn tasks(&self) -> TaskStore {
        TaskStore::new(self.pool.clone())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use onlyboxes_protocol::{AccountId, ErrorCode, NodeId, TaskId, TaskStatus};

    #[tokio::test]
    async fn test_open_in_memory_applies_schema() {
        let (db, report) = Database::open_in_memory(Duration::days(30)).await.unwrap();
        assert_eq!(report.cleared_sessions, 0);
        assert_eq!(report.failed_tasks, 0);
        // Meta row exists with the current version
        let version: i32 =
            sqlx::query_scalar("SELECT schema_version FROM obx_meta WHERE key = 'schema'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_recovery_clears_sessions_and_fails_running_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("console.db").display());
        let retention = Duration::days(30);

        let task_id = TaskId::new();
        let node_id = NodeId::new();
        {
            let (db, _) = Database::open(&url, retention).await.unwrap();
            let now = Utc::now();
            db.workers().insert_provisioned(&node_id, now).await.unwrap();
            sqlx::query("UPDATE obx_worker_nodes SET session_id = 'live' WHERE node_id = ?")
                .bind(node_id.as_str())
                .execute(db.pool())
                .await
                .unwrap();
            db.tasks()
                .insert(&NewTask::running(
                    task_id.clone(),
                    AccountId::new(),
                    "echo".into(),
                    "{}".into(),
                    now,
                    now + Duration::seconds(60),
                ))
                .await
                .unwrap();
        }

        // Reopen: recovery must restore both invariants.
        let (db, report) = Database::open(&url, retention).await.unwrap();
        assert_eq!(report.cleared_sessions, 1);
        assert_eq!(report.failed_tasks, 1);

        let node = db.workers().get(&node_id).await.unwrap().unwrap();
        assert_eq!(node.session_id, "");

        let task = db.tasks().get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.error_code.as_deref(), Some(ErrorCode::ConsoleRestarted.as_str()));
        assert!(task.completed_at.is_some());
        assert!(task.expires_at.is_some());
    }
}

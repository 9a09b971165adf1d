//! Schema management for pre-v1 development.
//!
//! Pre-v1 has no data to preserve, so on version mismatch we simply
//! drop all known tables and let `init_schema` recreate them.

use anyhow::{Context, Result};
use onlyboxes_protocol::TaskStatus;
use sqlx::{Pool, Sqlite};
use tracing::warn;

/// Current schema version. Increment when schema changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Known tables that will be dropped on schema mismatch.
const KNOWN_TABLES: &[&str] = &[
    "obx_tokens",
    "obx_accounts",
    "obx_worker_capabilities",
    "obx_worker_labels",
    "obx_worker_credentials",
    "obx_worker_sys_owners",
    "obx_worker_nodes",
    "obx_tasks",
    // Meta table last, so the version check fails if others exist without it
    "obx_meta",
];

/// Ensure the database schema version matches the expected version.
///
/// Returns `true` if a reset occurred, `false` if the schema was current.
pub async fn ensure_schema_version(pool: &Pool<Sqlite>, expected_version: i32) -> Result<bool> {
    match current_version(pool).await? {
        Some(v) if v == expected_version => Ok(false),
        Some(v) => {
            warn!(
                "Database schema reset (dev mode): version {} -> {}",
                v, expected_version
            );
            reset_schema(pool, expected_version).await?;
            Ok(true)
        }
        None => {
            if has_any_known_tables(pool).await? {
                warn!(
                    "Database schema reset (dev mode): unversioned -> {}",
                    expected_version
                );
                reset_schema(pool, expected_version).await?;
                Ok(true)
            } else {
                create_meta_table(pool, expected_version).await?;
                Ok(false)
            }
        }
    }
}

/// Create every console table. Idempotent.
pub async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
    let status_values = TaskStatus::ALL
        .iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(",");

    let create_sql = format!(
        r#"
        -- Accounts (humans). username_key is the case-insensitive key.
        CREATE TABLE IF NOT EXISTS obx_accounts (
            account_id TEXT PRIMARY KEY,
            username TEXT NOT NULL,
            username_key TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            is_admin INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Bearer tokens: HMAC hash plus masked display suffix, no plaintext.
        CREATE TABLE IF NOT EXISTS obx_tokens (
            token_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES obx_accounts(account_id),
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            token_hash TEXT NOT NULL UNIQUE,
            token_suffix TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (account_id, name_key)
        );

        -- Worker nodes. session_id = '' means no live stream.
        CREATE TABLE IF NOT EXISTS obx_worker_nodes (
            node_id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL DEFAULT '',
            provisioned INTEGER NOT NULL DEFAULT 0,
            node_name TEXT NOT NULL DEFAULT '',
            executor_kind TEXT NOT NULL DEFAULT '',
            version TEXT NOT NULL DEFAULT '',
            registered_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS ix_worker_nodes_last_seen ON obx_worker_nodes(last_seen_at);

        -- Capabilities: replaced wholesale with each hello.
        CREATE TABLE IF NOT EXISTS obx_worker_capabilities (
            node_id TEXT NOT NULL,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            max_inflight INTEGER NOT NULL,
            PRIMARY KEY (node_id, name_key)
        );
        CREATE INDEX IF NOT EXISTS ix_worker_capabilities_name ON obx_worker_capabilities(name_key);

        CREATE TABLE IF NOT EXISTS obx_worker_labels (
            node_id TEXT NOT NULL,
            label_key TEXT NOT NULL,
            label_value TEXT NOT NULL,
            PRIMARY KEY (node_id, label_key)
        );

        CREATE TABLE IF NOT EXISTS obx_worker_credentials (
            node_id TEXT PRIMARY KEY,
            secret_hash TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );

        -- At most one worker-sys per account: owner_id is the primary key.
        CREATE TABLE IF NOT EXISTS obx_worker_sys_owners (
            owner_id TEXT PRIMARY KEY,
            node_id TEXT NOT NULL UNIQUE,
            claimed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS obx_tasks (
            task_id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            request_id TEXT,
            capability TEXT NOT NULL,
            input_json TEXT NOT NULL DEFAULT '{{}}',
            status TEXT NOT NULL DEFAULT 'running' CHECK (status IN ({status_values})),
            command_id TEXT,
            result_json TEXT,
            error_code TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deadline_at TEXT NOT NULL,
            completed_at TEXT,
            expires_at TEXT
        );
        -- Idempotency: at most one in-flight task per (owner, request_id).
        CREATE UNIQUE INDEX IF NOT EXISTS ux_tasks_owner_request_running
            ON obx_tasks(owner_id, request_id)
            WHERE status = 'running' AND request_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS ix_tasks_owner_created ON obx_tasks(owner_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS ix_tasks_expires ON obx_tasks(expires_at);
        "#,
        status_values = status_values,
    );

    sqlx::raw_sql(&create_sql)
        .execute(pool)
        .await
        .context("Failed to initialize console schema")?;
    Ok(())
}

async fn current_version(pool: &Pool<Sqlite>) -> Result<Option<i32>> {
    let table_exists: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'obx_meta'")
            .fetch_optional(pool)
            .await?;
    if table_exists.is_none() {
        return Ok(None);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT schema_version FROM obx_meta WHERE key = 'schema'")
            .fetch_optional(pool)
            .await?;
    Ok(version)
}

async fn has_any_known_tables(pool: &Pool<Sqlite>) -> Result<bool> {
    for table in KNOWN_TABLES.iter().filter(|t| **t != "obx_meta") {
        let exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(pool)
                .await?;
        if exists.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn reset_schema(pool: &Pool<Sqlite>, version: i32) -> Result<()> {
    for table in KNOWN_TABLES {
        let drop_sql = format!("DROP TABLE IF EXISTS {}", table);
        sqlx::raw_sql(&drop_sql)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to drop table {}", table))?;
    }
    create_meta_table(pool, version).await
}

async fn create_meta_table(pool: &Pool<Sqlite>, version: i32) -> Result<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS obx_meta (
            key TEXT PRIMARY KEY,
            schema_version INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create obx_meta table")?;

    sqlx::query(
        r#"
        INSERT INTO obx_meta (key, schema_version)
        VALUES ('schema', ?)
        ON CONFLICT(key) DO UPDATE SET schema_version = excluded.schema_version,
                                       updated_at = datetime('now')
        "#,
    )
    .bind(version)
    .execute(pool)
    .await
    .context("Failed to set schema version")?;
    Ok(())
}

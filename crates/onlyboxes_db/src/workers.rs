//! Worker node storage: nodes, capabilities, labels, credentials and
//! worker-sys owner claims.

use anyhow::Result;
use chrono::{DateTime, Utc};
use onlyboxes_protocol::{
    capability_key, AccountId, CapabilityDecl, NodeId, LABEL_OWNER_ID, LABEL_WORKER_TYPE,
};
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;

use crate::models::{
    fmt_ts, CapabilityRow, CredentialRow, LabelRow, OwnerClaimRow, TouchResult, WorkerNodeRow,
};

/// Everything a validated hello writes, applied in one transaction.
#[derive(Debug, Clone)]
pub struct HelloUpdate {
    pub node_id: NodeId,
    pub session_id: String,
    pub node_name: String,
    pub executor_kind: String,
    pub version: String,
    pub capabilities: Vec<CapabilityDecl>,
    pub labels: BTreeMap<String, String>,
    pub now: DateTime<Utc>,
}

/// Routing candidate: an online node exposing a capability, with its cap.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CandidateRow {
    pub node_id: String,
    pub max_inflight: i64,
}

pub struct WorkerStore {
    pool: Pool<Sqlite>,
}

impl WorkerStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    // ========================================================================
    // Node rows
    // ========================================================================

    pub async fn get(&self, node_id: &NodeId) -> Result<Option<WorkerNodeRow>> {
        let row = sqlx::query_as("SELECT * FROM obx_worker_nodes WHERE node_id = ?")
            .bind(node_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Seed a provisioned node row if absent. `session_id` starts empty.
    pub async fn insert_provisioned(&self, node_id: &NodeId, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO obx_worker_nodes (node_id, session_id, provisioned, registered_at, last_seen_at)
            VALUES (?, '', 1, ?, ?)
            ON CONFLICT(node_id) DO NOTHING
            "#,
        )
        .bind(node_id.as_str())
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply a validated hello: node row takes the new session,
    /// capabilities are replaced with the hello set, labels merge with
    /// the system keys preserved. One transaction, no split states.
    pub async fn apply_hello(&self, update: &HelloUpdate) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = fmt_ts(update.now);

        sqlx::query(
            r#"
            UPDATE obx_worker_nodes
            SET session_id = ?, node_name = ?, executor_kind = ?, version = ?,
                registered_at = ?, last_seen_at = ?
            WHERE node_id = ?
            "#,
        )
        .bind(&update.session_id)
        .bind(&update.node_name)
        .bind(&update.executor_kind)
        .bind(&update.version)
        .bind(&now)
        .bind(&now)
        .bind(update.node_id.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM obx_worker_capabilities WHERE node_id = ?")
            .bind(update.node_id.as_str())
            .execute(&mut *tx)
            .await?;
        for capability in &update.capabilities {
            sqlx::query(
                r#"
                INSERT INTO obx_worker_capabilities (node_id, name, name_key, max_inflight)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(node_id, name_key) DO UPDATE SET
                    name = excluded.name, max_inflight = excluded.max_inflight
                "#,
            )
            .bind(update.node_id.as_str())
            .bind(&capability.name)
            .bind(capability_key(&capability.name))
            .bind(i64::from(capability.max_inflight))
            .execute(&mut *tx)
            .await?;
        }

        for (key, value) in &update.labels {
            if key == LABEL_OWNER_ID || key == LABEL_WORKER_TYPE {
                // System-controlled labels: a worker cannot overwrite them
                sqlx::query(
                    r#"
                    INSERT INTO obx_worker_labels (node_id, label_key, label_value)
                    VALUES (?, ?, ?)
                    ON CONFLICT(node_id, label_key) DO NOTHING
                    "#,
                )
                .bind(update.node_id.as_str())
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    r#"
                    INSERT INTO obx_worker_labels (node_id, label_key, label_value)
                    VALUES (?, ?, ?)
                    ON CONFLICT(node_id, label_key) DO UPDATE SET label_value = excluded.label_value
                    "#,
                )
                .bind(update.node_id.as_str())
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Set a system-controlled label, overwriting any prior value.
    /// Used by provisioning only; hellos go through [`Self::apply_hello`].
    pub async fn set_label(&self, node_id: &NodeId, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO obx_worker_labels (node_id, label_key, label_value)
            VALUES (?, ?, ?)
            ON CONFLICT(node_id, label_key) DO UPDATE SET label_value = excluded.label_value
            "#,
        )
        .bind(node_id.as_str())
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a node and everything hanging off it. Returns false if the
    /// node did not exist.
    pub async fn delete(&self, node_id: &NodeId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "obx_worker_credentials",
            "obx_worker_capabilities",
            "obx_worker_labels",
            "obx_worker_sys_owners",
        ] {
            let sql = format!("DELETE FROM {table} WHERE node_id = ?");
            sqlx::query(&sql)
                .bind(node_id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        let affected = sqlx::query("DELETE FROM obx_worker_nodes WHERE node_id = ?")
            .bind(node_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(affected > 0)
    }

    // ========================================================================
    // Sessions and heartbeats
    // ========================================================================

    /// Update `last_seen_at` only if the (node, session) pair matches.
    pub async fn heartbeat_touch(
        &self,
        node_id: &NodeId,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TouchResult> {
        let affected = sqlx::query(
            "UPDATE obx_worker_nodes SET last_seen_at = ? WHERE node_id = ? AND session_id = ?",
        )
        .bind(fmt_ts(now))
        .bind(node_id.as_str())
        .bind(session_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected > 0 {
            return Ok(TouchResult::Touched);
        }
        match self.get(node_id).await? {
            Some(_) => Ok(TouchResult::SessionMismatch),
            None => Ok(TouchResult::NodeNotFound),
        }
    }

    /// Clear the session only if it still matches; race-free on reconnect.
    pub async fn clear_session_if_match(&self, node_id: &NodeId, session_id: &str) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE obx_worker_nodes SET session_id = '' WHERE node_id = ? AND session_id = ?",
        )
        .bind(node_id.as_str())
        .bind(session_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn clear_session(&self, node_id: &NodeId) -> Result<bool> {
        let affected =
            sqlx::query("UPDATE obx_worker_nodes SET session_id = '' WHERE node_id = ?")
                .bind(node_id.as_str())
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(affected > 0)
    }

    /// Startup recovery: no session survives a restart.
    pub async fn clear_all_sessions(&self) -> Result<u64> {
        let affected =
            sqlx::query("UPDATE obx_worker_nodes SET session_id = '' WHERE session_id != ''")
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(affected)
    }

    // ========================================================================
    // Credentials
    // ========================================================================

    pub async fn insert_credential(
        &self,
        node_id: &NodeId,
        secret_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO obx_worker_credentials (node_id, secret_hash, created_at) VALUES (?, ?, ?)",
        )
        .bind(node_id.as_str())
        .bind(secret_hash)
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_credential(&self, node_id: &NodeId) -> Result<Option<CredentialRow>> {
        let row = sqlx::query_as("SELECT * FROM obx_worker_credentials WHERE node_id = ?")
            .bind(node_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    // ========================================================================
    // Worker-sys owner claims
    // ========================================================================

    /// Insert-if-absent. Returns true only when this call created the claim.
    pub async fn claim_worker_sys_owner(
        &self,
        owner_id: &AccountId,
        node_id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            INSERT INTO obx_worker_sys_owners (owner_id, node_id, claimed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(owner_id) DO NOTHING
            "#,
        )
        .bind(owner_id.as_str())
        .bind(node_id.as_str())
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn get_owner_claim(&self, owner_id: &AccountId) -> Result<Option<OwnerClaimRow>> {
        let row = sqlx::query_as("SELECT * FROM obx_worker_sys_owners WHERE owner_id = ?")
            .bind(owner_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    // ========================================================================
    // Capabilities and labels (read side)
    // ========================================================================

    pub async fn capabilities_for(&self, node_id: &NodeId) -> Result<Vec<CapabilityRow>> {
        let rows = sqlx::query_as(
            "SELECT * FROM obx_worker_capabilities WHERE node_id = ? ORDER BY name_key ASC",
        )
        .bind(node_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn labels_for(&self, node_id: &NodeId) -> Result<BTreeMap<String, String>> {
        let rows: Vec<LabelRow> =
            sqlx::query_as("SELECT * FROM obx_worker_labels WHERE node_id = ?")
                .bind(node_id.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.label_key, row.label_value))
            .collect())
    }

    pub async fn label_value(&self, node_id: &NodeId, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT label_value FROM obx_worker_labels WHERE node_id = ? AND label_key = ?",
        )
        .bind(node_id.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    // ========================================================================
    // Routing queries
    // ========================================================================

    /// Online nodes exposing `capability`, node-id ASC (stable order for
    /// the dispatcher's admission sweep).
    pub async fn online_by_capability(
        &self,
        capability: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CandidateRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT n.node_id AS node_id, c.max_inflight AS max_inflight
            FROM obx_worker_nodes n
            JOIN obx_worker_capabilities c ON c.node_id = n.node_id
            WHERE c.name_key = ? AND n.session_id != '' AND n.last_seen_at >= ?
            ORDER BY n.node_id ASC
            "#,
        )
        .bind(capability_key(capability))
        .bind(fmt_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Account-scoped routing: only the caller's own worker-sys nodes.
    pub async fn online_by_owner_capability(
        &self,
        owner_id: &AccountId,
        capability: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CandidateRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT n.node_id AS node_id, c.max_inflight AS max_inflight
            FROM obx_worker_nodes n
            JOIN obx_worker_capabilities c ON c.node_id = n.node_id
            JOIN obx_worker_labels owner ON owner.node_id = n.node_id
                AND owner.label_key = ? AND owner.label_value = ?
            JOIN obx_worker_labels kind ON kind.node_id = n.node_id
                AND kind.label_key = ? AND kind.label_value = 'worker-sys'
            WHERE c.name_key = ? AND n.session_id != '' AND n.last_seen_at >= ?
            ORDER BY n.node_id ASC
            "#,
        )
        .bind(LABEL_OWNER_ID)
        .bind(owner_id.as_str())
        .bind(LABEL_WORKER_TYPE)
        .bind(capability_key(capability))
        .bind(fmt_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ========================================================================
    // Listing and stats
    // ========================================================================

    pub async fn list_page(
        &self,
        page: u32,
        page_size: u32,
        online_filter: Option<bool>,
        cutoff: DateTime<Utc>,
    ) -> Result<(Vec<WorkerNodeRow>, u64)> {
        let cutoff = fmt_ts(cutoff);
        let condition = match online_filter {
            None => "1 = 1",
            Some(true) => "session_id != '' AND last_seen_at >= ?",
            Some(false) => "(session_id = '' OR last_seen_at < ?)",
        };
        let count_sql = format!("SELECT COUNT(*) FROM obx_worker_nodes WHERE {condition}");
        let mut count_query = sqlx::query_scalar(&count_sql);
        if online_filter.is_some() {
            count_query = count_query.bind(&cutoff);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?;

        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);
        let list_sql = format!(
            "SELECT * FROM obx_worker_nodes WHERE {condition} ORDER BY node_id ASC LIMIT ? OFFSET ?"
        );
        let mut list_query = sqlx::query_as(&list_sql);
        if online_filter.is_some() {
            list_query = list_query.bind(&cutoff);
        }
        let rows = list_query
            .bind(i64::from(page_size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok((rows, total as u64))
    }

    /// (total, online, stale-online) counts for the dashboard.
    pub async fn stats(
        &self,
        offline_cutoff: DateTime<Utc>,
        stale_cutoff: DateTime<Utc>,
    ) -> Result<(u64, u64, u64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM obx_worker_nodes")
            .fetch_one(&self.pool)
            .await?;
        let online: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM obx_worker_nodes WHERE session_id != '' AND last_seen_at >= ?",
        )
        .bind(fmt_ts(offline_cutoff))
        .fetch_one(&self.pool)
        .await?;
        let stale: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM obx_worker_nodes
            WHERE session_id != '' AND last_seen_at >= ? AND last_seen_at < ?
            "#,
        )
        .bind(fmt_ts(offline_cutoff))
        .bind(fmt_ts(stale_cutoff))
        .fetch_one(&self.pool)
        .await?;
        Ok((total as u64, online as u64, stale as u64))
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Delete runtime (non-provisioned) nodes past the offline cutoff.
    /// Provisioned nodes are never deleted here; they only go offline.
    pub async fn prune_offline_runtime(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let cutoff = fmt_ts(cutoff);
        for table in ["obx_worker_capabilities", "obx_worker_labels"] {
            let sql = format!(
                r#"
                DELETE FROM {table} WHERE node_id IN (
                    SELECT node_id FROM obx_worker_nodes
                    WHERE provisioned = 0 AND last_seen_at < ?
                )
                "#
            );
            sqlx::query(&sql).bind(&cutoff).execute(&mut *tx).await?;
        }
        let affected =
            sqlx::query("DELETE FROM obx_worker_nodes WHERE provisioned = 0 AND last_seen_at < ?")
                .bind(&cutoff)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        tx.commit().await?;
        Ok(affected)
    }
}

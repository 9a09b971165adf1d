//! Task storage.
//!
//! Terminal transitions are guarded UPDATEs (`WHERE status = 'running'`)
//! so a terminal status can never be overwritten, whatever the caller
//! ordering.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use onlyboxes_protocol::{AccountId, CommandId, ErrorCode, TaskId, TaskStatus};
use sqlx::{Pool, Sqlite};

use crate::models::{fmt_ts, TaskRow, TaskStatusColumn};

/// A task record at insert time.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: TaskId,
    pub owner_id: AccountId,
    pub request_id: Option<String>,
    pub capability: String,
    pub input_json: String,
    pub status: TaskStatus,
    pub command_id: Option<CommandId>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    /// Set for tasks born terminal (selection failures).
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewTask {
    /// A dispatched task in `running` state.
    pub fn running(
        task_id: TaskId,
        owner_id: AccountId,
        capability: String,
        input_json: String,
        created_at: DateTime<Utc>,
        deadline_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            owner_id,
            request_id: None,
            capability,
            input_json,
            status: TaskStatus::Running,
            command_id: None,
            error_code: None,
            error_message: None,
            created_at,
            deadline_at,
            expires_at: None,
        }
    }
}

pub struct TaskStore {
    pool: Pool<Sqlite>,
}

impl TaskStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, task: &NewTask) -> Result<()> {
        let now = fmt_ts(task.created_at);
        let completed_at = task.status.is_terminal().then(|| now.clone());
        sqlx::query(
            r#"
            INSERT INTO obx_tasks (task_id, owner_id, request_id, capability, input_json,
                                   status, command_id, error_code, error_message,
                                   created_at, updated_at, deadline_at, completed_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.task_id.as_str())
        .bind(task.owner_id.as_str())
        .bind(&task.request_id)
        .bind(&task.capability)
        .bind(&task.input_json)
        .bind(TaskStatusColumn::from(task.status))
        .bind(task.command_id.as_ref().map(|id| id.as_str().to_string()))
        .bind(task.error_code.map(|code| code.as_str()))
        .bind(&task.error_message)
        .bind(&now)
        .bind(&now)
        .bind(fmt_ts(task.deadline_at))
        .bind(completed_at)
        .bind(task.expires_at.map(fmt_ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attach the dispatcher-issued command id to a fresh task row.
    pub async fn set_command_id(
        &self,
        task_id: &TaskId,
        command_id: &CommandId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE obx_tasks SET command_id = ?, updated_at = ?
            WHERE task_id = ? AND status = 'running'
            "#,
        )
        .bind(command_id.as_str())
        .bind(fmt_ts(now))
        .bind(task_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as("SELECT * FROM obx_tasks WHERE task_id = ?")
            .bind(task_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Owner-scoped read: a cross-account id behaves exactly like a
    /// missing one.
    pub async fn get_owned(&self, task_id: &TaskId, owner_id: &AccountId) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as("SELECT * FROM obx_tasks WHERE task_id = ? AND owner_id = ?")
            .bind(task_id.as_str())
            .bind(owner_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_by_owner(&self, owner_id: &AccountId, limit: u32) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM obx_tasks
            WHERE owner_id = ?
            ORDER BY created_at DESC, task_id DESC
            LIMIT ?
            "#,
        )
        .bind(owner_id.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn find_running_by_request_id(
        &self,
        owner_id: &AccountId,
        request_id: &str,
    ) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as(
            r#"
            SELECT * FROM obx_tasks
            WHERE owner_id = ? AND request_id = ? AND status = 'running'
            "#,
        )
        .bind(owner_id.as_str())
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Most recent task for (owner, request_id), any status. Used for
    /// idempotent replay of terminal records.
    pub async fn find_latest_by_request_id(
        &self,
        owner_id: &AccountId,
        request_id: &str,
    ) -> Result<Option<TaskRow>> {
        let row = sqlx::query_as(
            r#"
            SELECT * FROM obx_tasks
            WHERE owner_id = ? AND request_id = ?
            ORDER BY created_at DESC, task_id DESC
            LIMIT 1
            "#,
        )
        .bind(owner_id.as_str())
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// The single terminal transition for a task. Returns false if the
    /// task was already terminal (or missing); terminal rows are immutable.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        result_json: Option<&str>,
        error_code: Option<ErrorCode>,
        error_message: Option<&str>,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let now_s = fmt_ts(now);
        let affected = sqlx::query(
            r#"
            UPDATE obx_tasks
            SET status = ?, result_json = ?, error_code = ?, error_message = ?,
                updated_at = ?, completed_at = ?, expires_at = ?
            WHERE task_id = ? AND status = 'running'
            "#,
        )
        .bind(TaskStatusColumn::from(status))
        .bind(result_json)
        .bind(error_code.map(|code| code.as_str()))
        .bind(error_message)
        .bind(&now_s)
        .bind(&now_s)
        .bind(fmt_ts(now + retention))
        .bind(task_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Startup recovery: every non-terminal task becomes
    /// `failed: console_restarted`.
    pub async fn fail_all_running(&self, now: DateTime<Utc>, retention: Duration) -> Result<u64> {
        let now_s = fmt_ts(now);
        let affected = sqlx::query(
            r#"
            UPDATE obx_tasks
            SET status = 'failed', error_code = ?, error_message = 'console restarted',
                updated_at = ?, completed_at = ?, expires_at = ?
            WHERE status = 'running'
            "#,
        )
        .bind(ErrorCode::ConsoleRestarted.as_str())
        .bind(&now_s)
        .bind(&now_s)
        .bind(fmt_ts(now + retention))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let affected =
            sqlx::query("DELETE FROM obx_tasks WHERE expires_at IS NOT NULL AND expires_at <= ?")
                .bind(fmt_ts(now))
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(affected)
    }
}

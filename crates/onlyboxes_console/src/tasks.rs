//! Task lifecycle: durable, owner-scoped, idempotent submission.
//!
//! The task row is persisted before dispatch, so a result can never
//! outrun its row. Selection failures persist terminal rows too, which
//! keeps `request_id` replays stable whatever happened.

use chrono::{Duration, Utc};
use onlyboxes_db::{Database, NewTask, TaskRow};
use onlyboxes_protocol::http_types::SubmitTaskRequest;
use onlyboxes_protocol::{
    capability_key, defaults, AccountId, CommandId, ErrorCode, SubmitMode, TaskId, TaskStatus,
};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatch::{DispatchRequest, Dispatcher, SelectError};
use crate::events::TaskEvents;
use crate::registry::RouteScope;

/// Extra wait beyond the request deadline so the dispatcher's own
/// deadline transition is observed rather than raced.
const DEADLINE_GRACE_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("request_id is already in progress")]
    RequestIdInProgress,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Submission result: the row plus whether the caller should see 202.
#[derive(Debug)]
pub struct SubmitResponse {
    pub row: TaskRow,
    /// True when the task is still running and the caller gets a
    /// status URL instead of a terminal snapshot.
    pub accepted: bool,
}

#[derive(Debug)]
pub enum CancelOutcome {
    NotFound,
    AlreadyTerminal(TaskRow),
    Canceled(TaskRow),
}

#[derive(Debug)]
enum WaitOutcome {
    Terminal(TaskRow),
    StillRunning(TaskRow),
    Shutdown(TaskRow),
}

pub struct TaskManager {
    db: Database,
    dispatcher: Arc<Dispatcher>,
    events: TaskEvents,
    retention: Duration,
}

impl TaskManager {
    pub fn new(
        db: Database,
        dispatcher: Arc<Dispatcher>,
        events: TaskEvents,
        retention: Duration,
    ) -> Self {
        Self {
            db,
            dispatcher,
            events,
            retention,
        }
    }

    /// Submit a task. Sync and auto modes wait per their windows; the
    /// returned row is the freshest view the mode allows.
    pub async fn submit(
        &self,
        owner_id: &AccountId,
        request: SubmitTaskRequest,
    ) -> Result<SubmitResponse, SubmitError> {
        let capability = request.capability.trim().to_string();
        if capability.is_empty() {
            return Err(SubmitError::InvalidRequest("capability is required".into()));
        }
        let timeout_ms = request.timeout_ms.unwrap_or(defaults::DEFAULT_TIMEOUT_MS);
        if !(1..=defaults::MAX_TIMEOUT_MS).contains(&timeout_ms) {
            return Err(SubmitError::InvalidRequest(format!(
                "timeout_ms must be within [1, {}]",
                defaults::MAX_TIMEOUT_MS
            )));
        }
        let wait_ms = request.wait_ms.unwrap_or(defaults::DEFAULT_WAIT_MS);
        if !(1..=defaults::MAX_WAIT_MS).contains(&wait_ms) {
            return Err(SubmitError::InvalidRequest(format!(
                "wait_ms must be within [1, {}]",
                defaults::MAX_WAIT_MS
            )));
        }

        // Idempotency: an in-flight (owner, request_id) refuses the
        // submission; a terminal one replays its stored snapshot.
        if let Some(request_id) = request.request_id.as_deref() {
            if self
                .db
                .tasks()
                .find_running_by_request_id(owner_id, request_id)
                .await?
                .is_some()
            {
                return Err(SubmitError::RequestIdInProgress);
            }
            if let Some(row) = self
                .db
                .tasks()
                .find_latest_by_request_id(owner_id, request_id)
                .await?
            {
                debug!(task_id = %row.task_id, request_id, "Replaying terminal task for request_id");
                return Ok(SubmitResponse {
                    row,
                    accepted: false,
                });
            }
        }

        let input_json = match &request.input {
            Some(value) => value.to_string(),
            None => "{}".to_string(),
        };
        let now = Utc::now();
        let deadline_at = now + Duration::milliseconds(timeout_ms as i64);
        let task_id = TaskId::new();
        let mut new_task = NewTask::running(
            task_id.clone(),
            owner_id.clone(),
            capability.clone(),
            input_json.clone(),
            now,
            deadline_at,
        );
        new_task.request_id = request.request_id.clone();

        if let Err(e) = self.db.tasks().insert(&new_task).await {
            // A concurrent submit with the same request_id may have won
            // the partial unique index; report that as the conflict it is.
            if request.request_id.is_some() {
                if let Some(_racer) = self
                    .db
                    .tasks()
                    .find_running_by_request_id(owner_id, request.request_id.as_deref().unwrap_or(""))
                    .await?
                {
                    return Err(SubmitError::RequestIdInProgress);
                }
            }
            return Err(SubmitError::Store(e));
        }

        let scope = if capability_key(&capability) == "computeruse" {
            RouteScope::AccountScoped(owner_id.clone())
        } else {
            RouteScope::Global
        };
        match self
            .dispatcher
            .dispatch(DispatchRequest {
                capability,
                scope,
                payload_json: input_json,
                deadline_at,
                task_id: Some(task_id.clone()),
                want_waiter: false,
            })
            .await
        {
            Ok(ticket) => {
                self.db
                    .tasks()
                    .set_command_id(&task_id, &ticket.command_id, Utc::now())
                    .await?;
            }
            Err(SelectError::NoWorker(capability)) => {
                return self
                    .fail_unselected(&task_id, ErrorCode::NoWorker, &capability)
                    .await;
            }
            Err(SelectError::NoCapacity(capability)) => {
                return self
                    .fail_unselected(&task_id, ErrorCode::NoCapacity, &capability)
                    .await;
            }
            Err(SelectError::Store(e)) => {
                warn!(task_id = %task_id, error = %e, "Dispatch failed mid-selection");
                return self
                    .fail_unselected(&task_id, ErrorCode::ExecutionFailed, "internal dispatch error")
                    .await;
            }
        }

        let wait_window = match request.mode {
            SubmitMode::Async => None,
            SubmitMode::Sync => Some(std::time::Duration::from_millis(
                timeout_ms + DEADLINE_GRACE_MS,
            )),
            SubmitMode::Auto => Some(std::time::Duration::from_millis(wait_ms.min(timeout_ms))),
        };
        let row = match wait_window {
            None => self.must_get(&task_id).await?,
            Some(window) => match self.wait_terminal(&task_id, window).await? {
                WaitOutcome::Terminal(row)
                | WaitOutcome::StillRunning(row)
                | WaitOutcome::Shutdown(row) => row,
            },
        };
        let accepted = row.status() == TaskStatus::Running;
        Ok(SubmitResponse { row, accepted })
    }

    async fn fail_unselected(
        &self,
        task_id: &TaskId,
        code: ErrorCode,
        detail: &str,
    ) -> Result<SubmitResponse, SubmitError> {
        self.db
            .tasks()
            .complete(
                task_id,
                TaskStatus::Failed,
                None,
                Some(code),
                Some(detail),
                Utc::now(),
                self.retention,
            )
            .await?;
        self.events.signal_terminal(task_id);
        let row = self.must_get(task_id).await?;
        Ok(SubmitResponse {
            row,
            accepted: false,
        })
    }

    async fn must_get(&self, task_id: &TaskId) -> Result<TaskRow, anyhow::Error> {
        self.db
            .tasks()
            .get(task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {task_id} disappeared mid-submit"))
    }

    /// Block until the task is terminal, the window elapses, or the
    /// console shuts down. Always re-reads the store after waking, so a
    /// signal racing the subscription cannot be missed.
    async fn wait_terminal(
        &self,
        task_id: &TaskId,
        window: std::time::Duration,
    ) -> Result<WaitOutcome, anyhow::Error> {
        let mut signal = self.events.subscribe(task_id);
        let deadline = Instant::now() + window;
        loop {
            let row = self.must_get(task_id).await?;
            if row.status().is_terminal() {
                // Drop the event entry: a subscription made after the
                // terminal write would otherwise linger forever
                self.events.signal_terminal(task_id);
                return Ok(WaitOutcome::Terminal(row));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(WaitOutcome::StillRunning(row));
            }
            match tokio::time::timeout(remaining, signal.wait_for(|done| *done)).await {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => {
                    // Sender dropped without a signal: shutdown
                    return Ok(WaitOutcome::Shutdown(row));
                }
                Err(_) => {}
            };
            let row = self.must_get(task_id).await?;
            return Ok(if row.status().is_terminal() {
                self.events.signal_terminal(task_id);
                WaitOutcome::Terminal(row)
            } else {
                WaitOutcome::StillRunning(row)
            });
        }
    }

    /// Owner-scoped read. Cross-account ids are indistinguishable from
    /// missing ones.
    pub async fn get(
        &self,
        owner_id: &AccountId,
        task_id: &TaskId,
    ) -> Result<Option<TaskRow>, anyhow::Error> {
        self.db.tasks().get_owned(task_id, owner_id).await
    }

    pub async fn list(
        &self,
        owner_id: &AccountId,
        limit: u32,
    ) -> Result<Vec<TaskRow>, anyhow::Error> {
        let limit = limit.clamp(1, defaults::MAX_PAGE_SIZE);
        self.db.tasks().list_by_owner(owner_id, limit).await
    }

    /// Best-effort cancel. The worker is not interrupted; the console
    /// stops waiting and the task becomes `canceled`.
    pub async fn cancel(
        &self,
        owner_id: &AccountId,
        task_id: &TaskId,
    ) -> Result<CancelOutcome, anyhow::Error> {
        let Some(row) = self.db.tasks().get_owned(task_id, owner_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if row.status().is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(row));
        }

        match row.command_id.as_deref().and_then(|id| CommandId::parse(id).ok()) {
            Some(command_id) => {
                self.dispatcher.cancel_command(&command_id).await;
            }
            None => {
                // Running but never dispatched (submit raced a crash):
                // transition the row directly.
                self.db
                    .tasks()
                    .complete(
                        task_id,
                        TaskStatus::Canceled,
                        None,
                        None,
                        None,
                        Utc::now(),
                        self.retention,
                    )
                    .await?;
                self.events.signal_terminal(task_id);
            }
        }

        let row = self.must_get(task_id).await?;
        match row.status() {
            TaskStatus::Canceled => Ok(CancelOutcome::Canceled(row)),
            status if status.is_terminal() => Ok(CancelOutcome::AlreadyTerminal(row)),
            _ => {
                // The dispatcher lost track of the command (should not
                // happen); finish the row here rather than leave it stuck.
                warn!(task_id = %task_id, "Cancel found running task with no pending command");
                self.db
                    .tasks()
                    .complete(
                        task_id,
                        TaskStatus::Canceled,
                        None,
                        None,
                        None,
                        Utc::now(),
                        self.retention,
                    )
                    .await?;
                self.events.signal_terminal(task_id);
                Ok(CancelOutcome::Canceled(self.must_get(task_id).await?))
            }
        }
    }
}

//! Command dispatch, correlation and completion.
//!
//! The pending-command table is the single source of truth for "is this
//! command still live". Every terminal path (result, deadline, cancel,
//! stream loss, shutdown) funnels through [`Dispatcher::finish`], which
//! removes the entry exactly once; whoever loses that race observes a
//! no-op. Inflight release and the task's terminal write are gated by
//! that removal, so both happen exactly once per command.

use chrono::{DateTime, Duration, Utc};
use onlyboxes_api_grpc::worker_v1::{CommandDispatch, CommandResult, ConsoleFrame};
use onlyboxes_db::Database;
use onlyboxes_protocol::{capability_key, CommandId, ErrorCode, NodeId, TaskId, TaskStatus};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::events::TaskEvents;
use crate::inflight::InflightTracker;
use crate::registry::{RouteScope, WorkerRegistry};
use crate::streams::StreamHub;

const PENDING_SHARDS: usize = 16;

/// How a dispatched command ended, as seen by a waiting caller.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Succeeded { payload_json: String },
    Failed { code: ErrorCode, message: String },
    DeadlineExceeded,
    Canceled,
    WorkerLost,
    Shutdown,
}

/// Worker-selection failures, surfaced before anything is dispatched.
#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no online worker exposes capability '{0}'")]
    NoWorker(String),
    #[error("all workers for capability '{0}' are at capacity")]
    NoCapacity(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// One dispatch, as requested by the task manager or the commands API.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Case-preserved capability name; matching is case-insensitive.
    pub capability: String,
    pub scope: RouteScope,
    pub payload_json: String,
    pub deadline_at: DateTime<Utc>,
    /// Present for task-shaped calls; the terminal write goes to this row.
    pub task_id: Option<TaskId>,
    /// Whether the caller wants a one-shot completion signal.
    pub want_waiter: bool,
}

/// Receipt for an accepted dispatch.
#[derive(Debug)]
pub struct DispatchTicket {
    pub command_id: CommandId,
    pub node_id: NodeId,
    pub outcome: Option<oneshot::Receiver<CommandOutcome>>,
}

#[derive(Debug)]
struct PendingCommand {
    task_id: Option<TaskId>,
    node_id: NodeId,
    session_id: String,
    capability_key: String,
    waiter: Option<oneshot::Sender<CommandOutcome>>,
}

/// Terminal events competing for a pending command.
#[derive(Debug)]
enum TerminalEvent {
    Result {
        error_code: String,
        error_message: String,
        payload_json: String,
    },
    Deadline,
    Cancel,
    WorkerLost,
    Shutdown,
}

pub struct Dispatcher {
    db: Database,
    registry: Arc<WorkerRegistry>,
    hub: Arc<StreamHub>,
    inflight: Arc<InflightTracker>,
    events: TaskEvents,
    pending: Vec<Mutex<HashMap<String, PendingCommand>>>,
    retention: Duration,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        registry: Arc<WorkerRegistry>,
        hub: Arc<StreamHub>,
        inflight: Arc<InflightTracker>,
        events: TaskEvents,
        retention: Duration,
    ) -> Self {
        let pending = (0..PENDING_SHARDS)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            db,
            registry,
            hub,
            inflight,
            events,
            pending,
            retention,
        }
    }

    fn shard(&self, command_id: &str) -> &Mutex<HashMap<String, PendingCommand>> {
        let mut hasher = DefaultHasher::new();
        command_id.hash(&mut hasher);
        &self.pending[(hasher.finish() as usize) % PENDING_SHARDS]
    }

    fn insert_pending(&self, command_id: &CommandId, entry: PendingCommand) {
        let mut shard = self
            .shard(command_id.as_str())
            .lock()
            .expect("pending shard lock poisoned");
        shard.insert(command_id.as_str().to_string(), entry);
    }

    fn remove_pending(&self, command_id: &CommandId) -> Option<PendingCommand> {
        let mut shard = self
            .shard(command_id.as_str())
            .lock()
            .expect("pending shard lock poisoned");
        shard.remove(command_id.as_str())
    }

    /// Number of live commands, across all shards.
    pub fn pending_count(&self) -> usize {
        self.pending
            .iter()
            .map(|shard| shard.lock().expect("pending shard lock poisoned").len())
            .sum()
    }

    /// Select a worker and put a command on its stream.
    ///
    /// Candidates come back node-id ASC; the first successful admission
    /// wins. There is no queueing: if nobody has headroom the caller
    /// sees `NoCapacity` immediately.
    pub async fn dispatch(
        self: &Arc<Self>,
        request: DispatchRequest,
    ) -> Result<DispatchTicket, SelectError> {
        let candidates = self
            .registry
            .candidates(&request.capability, &request.scope)
            .await?;
        if candidates.is_empty() {
            return Err(SelectError::NoWorker(request.capability));
        }

        let cap_key = capability_key(&request.capability);
        let mut saw_candidate = false;
        for candidate in candidates {
            let Ok(node_id) = NodeId::parse(&candidate.node_id) else {
                continue;
            };
            saw_candidate = true;
            let mut max_inflight = candidate.max_inflight.max(0) as u32;
            if matches!(request.scope, RouteScope::AccountScoped(_)) {
                // Owner-scoped work runs on the caller's worker-sys, which
                // is single-flight by policy whatever the worker declared
                max_inflight = max_inflight.min(1);
            }
            if !self.inflight.try_acquire(&node_id, &cap_key, max_inflight) {
                continue;
            }
            let Some(handle) = self.hub.get(&node_id) else {
                // Listed online but the stream is already gone; the
                // heartbeat TTL will catch up. Not this command's worker.
                self.inflight.release(&node_id, &cap_key);
                continue;
            };

            let command_id = CommandId::new();
            let (waiter_tx, waiter_rx) = if request.want_waiter {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            self.insert_pending(
                &command_id,
                PendingCommand {
                    task_id: request.task_id.clone(),
                    node_id: node_id.clone(),
                    session_id: handle.session_id().to_string(),
                    capability_key: cap_key.clone(),
                    waiter: waiter_tx,
                },
            );

            let frame = ConsoleFrame::command_dispatch(CommandDispatch {
                command_id: command_id.as_str().to_string(),
                capability: request.capability.clone(),
                payload_json: request.payload_json.clone(),
                deadline_unix_ms: request.deadline_at.timestamp_millis(),
            });
            if !handle.try_send(frame) {
                self.remove_pending(&command_id);
                self.inflight.release(&node_id, &cap_key);
                continue;
            }

            self.spawn_deadline_timer(&command_id, request.deadline_at);
            debug!(
                command_id = %command_id,
                node_id = %node_id,
                capability = %request.capability,
                "Command dispatched"
            );
            return Ok(DispatchTicket {
                command_id,
                node_id,
                outcome: waiter_rx,
            });
        }

        if saw_candidate {
            Err(SelectError::NoCapacity(request.capability))
        } else {
            Err(SelectError::NoWorker(request.capability))
        }
    }

    fn spawn_deadline_timer(self: &Arc<Self>, command_id: &CommandId, deadline_at: DateTime<Utc>) {
        let dispatcher = Arc::clone(self);
        let command_id = command_id.clone();
        tokio::spawn(async move {
            let wait = (deadline_at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            dispatcher.finish(&command_id, TerminalEvent::Deadline).await;
        });
    }

    /// A `CommandResult` frame arrived on some stream.
    pub async fn on_result(&self, result: CommandResult) {
        let Ok(command_id) = CommandId::parse(&result.command_id) else {
            warn!(command_id = %result.command_id, "Dropping result with malformed command id");
            return;
        };
        self.finish(
            &command_id,
            TerminalEvent::Result {
                error_code: result.error_code,
                error_message: result.error_message,
                payload_json: result.payload_json,
            },
        )
        .await;
    }

    /// Best-effort cancel: the worker is not interrupted, the console
    /// stops waiting. Returns false if the command was already terminal.
    pub async fn cancel_command(&self, command_id: &CommandId) -> bool {
        self.finish(command_id, TerminalEvent::Cancel).await
    }

    /// A worker stream went away: every command in flight on that
    /// (node, session) fails with `worker_disconnected`.
    pub async fn fail_session_commands(&self, node_id: &NodeId, session_id: &str) {
        let mut victims = Vec::new();
        for shard in &self.pending {
            let shard = shard.lock().expect("pending shard lock poisoned");
            for (command_id, entry) in shard.iter() {
                if entry.node_id == *node_id && entry.session_id == session_id {
                    victims.push(command_id.clone());
                }
            }
        }
        if !victims.is_empty() {
            info!(
                node_id = %node_id,
                commands = victims.len(),
                "Failing in-flight commands for lost worker stream"
            );
        }
        for command_id in victims {
            if let Ok(command_id) = CommandId::parse(&command_id) {
                self.finish(&command_id, TerminalEvent::WorkerLost).await;
            }
        }
    }

    /// Process shutdown: wake every waiter without touching task rows;
    /// startup recovery turns those rows into `console_restarted`.
    pub async fn shutdown(&self) {
        let mut victims = Vec::new();
        for shard in &self.pending {
            let shard = shard.lock().expect("pending shard lock poisoned");
            victims.extend(shard.keys().cloned());
        }
        for command_id in victims {
            if let Ok(command_id) = CommandId::parse(&command_id) {
                self.finish(&command_id, TerminalEvent::Shutdown).await;
            }
        }
        self.events.shutdown();
    }

    /// The single terminal gate. Removing the pending entry decides the
    /// winner; everything after (release, task write, waiter signal)
    /// runs once per command.
    async fn finish(&self, command_id: &CommandId, event: TerminalEvent) -> bool {
        let Some(entry) = self.remove_pending(command_id) else {
            // Late result / late timer / duplicate cancel: observed, dropped.
            debug!(command_id = %command_id, event = ?event, "Terminal event for unknown command");
            return false;
        };
        self.inflight.release(&entry.node_id, &entry.capability_key);

        let outcome = match event {
            TerminalEvent::Result {
                error_code,
                error_message,
                payload_json,
            } => {
                if error_code.is_empty() {
                    CommandOutcome::Succeeded { payload_json }
                } else {
                    CommandOutcome::Failed {
                        code: ErrorCode::from_worker_code(&error_code),
                        message: if error_message.is_empty() {
                            error_code
                        } else {
                            error_message
                        },
                    }
                }
            }
            TerminalEvent::Deadline => CommandOutcome::DeadlineExceeded,
            TerminalEvent::Cancel => CommandOutcome::Canceled,
            TerminalEvent::WorkerLost => CommandOutcome::WorkerLost,
            TerminalEvent::Shutdown => CommandOutcome::Shutdown,
        };

        if let Some(task_id) = &entry.task_id {
            if !matches!(outcome, CommandOutcome::Shutdown) {
                if let Err(e) = self.write_terminal(task_id, &outcome).await {
                    error!(task_id = %task_id, error = %e, "Failed to persist terminal task state");
                }
            }
            self.events.signal_terminal(task_id);
        }

        if let Some(waiter) = entry.waiter {
            let _ = waiter.send(outcome);
        }
        true
    }

    async fn write_terminal(&self, task_id: &TaskId, outcome: &CommandOutcome) -> anyhow::Result<()> {
        let tasks = self.db.tasks();
        let now = Utc::now();
        let updated = match outcome {
            CommandOutcome::Succeeded { payload_json } => {
                tasks
                    .complete(
                        task_id,
                        TaskStatus::Succeeded,
                        Some(payload_json),
                        None,
                        None,
                        now,
                        self.retention,
                    )
                    .await?
            }
            CommandOutcome::Failed { code, message } => {
                tasks
                    .complete(
                        task_id,
                        TaskStatus::Failed,
                        None,
                        Some(*code),
                        Some(message),
                        now,
                        self.retention,
                    )
                    .await?
            }
            CommandOutcome::DeadlineExceeded => {
                tasks
                    .complete(
                        task_id,
                        TaskStatus::Failed,
                        None,
                        Some(ErrorCode::DeadlineExceeded),
                        Some("deadline exceeded"),
                        now,
                        self.retention,
                    )
                    .await?
            }
            CommandOutcome::Canceled => {
                tasks
                    .complete(task_id, TaskStatus::Canceled, None, None, None, now, self.retention)
                    .await?
            }
            CommandOutcome::WorkerLost => {
                tasks
                    .complete(
                        task_id,
                        TaskStatus::Failed,
                        None,
                        Some(ErrorCode::WorkerDisconnected),
                        Some("worker stream lost"),
                        now,
                        self.retention,
                    )
                    .await?
            }
            CommandOutcome::Shutdown => true,
        };
        if !updated {
            // The row was already terminal; the pending entry was the
            // loser of an earlier race. Harmless, but worth a trace.
            debug!(task_id = %task_id, "Terminal write found task already terminal");
        }
        Ok(())
    }
}

//! Worker-link gRPC service: one bidirectional stream per worker.
//!
//! The worker speaks first (hello). Once the registry accepts it, this
//! module owns the stream: a receive loop handles heartbeats and command
//! results, and the outbound mpsc channel (drained by tonic) is the
//! per-stream send lock. The receive loop is the sole owner of teardown.

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use onlyboxes_api_grpc::worker_v1::worker_link_server::{WorkerLink, WorkerLinkServer};
use onlyboxes_api_grpc::worker_v1::{worker_frame, ConsoleFrame, WorkerFrame};
use onlyboxes_db::TouchResult;
use onlyboxes_protocol::{CapabilityDecl, NodeId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::registry::{HelloError, HelloRequest, WorkerRegistry};
use crate::streams::{StreamHandle, StreamHub};

pub struct WorkerLinkService {
    registry: Arc<WorkerRegistry>,
    hub: Arc<StreamHub>,
    dispatcher: Arc<Dispatcher>,
    heartbeat_interval_sec: u32,
    hello_timeout: std::time::Duration,
}

impl WorkerLinkService {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        hub: Arc<StreamHub>,
        dispatcher: Arc<Dispatcher>,
        heartbeat_interval_sec: u32,
        hello_timeout: std::time::Duration,
    ) -> Self {
        Self {
            registry,
            hub,
            dispatcher,
            heartbeat_interval_sec,
            hello_timeout,
        }
    }

    pub fn into_server(self) -> WorkerLinkServer<Self> {
        WorkerLinkServer::new(self)
    }
}

#[tonic::async_trait]
impl WorkerLink for WorkerLinkService {
    type AttachStream = BoxStream<'static, Result<ConsoleFrame, Status>>;

    async fn attach(
        &self,
        request: Request<Streaming<WorkerFrame>>,
    ) -> Result<Response<Self::AttachStream>, Status> {
        let mut inbound = request.into_inner();

        let hello = match tokio::time::timeout(self.hello_timeout, inbound.message()).await {
            Err(_) => return Err(Status::deadline_exceeded("hello not received in time")),
            Ok(Err(status)) => return Err(status),
            Ok(Ok(None)) => return Err(Status::invalid_argument("stream closed before hello")),
            Ok(Ok(Some(frame))) => match frame.frame {
                Some(worker_frame::Frame::Hello(hello)) => hello,
                _ => return Err(Status::invalid_argument("first frame must be hello")),
            },
        };

        let hello_request = HelloRequest {
            node_id: hello.node_id,
            node_name: hello.node_name,
            executor_kind: hello.executor_kind,
            version: hello.version,
            worker_secret: hello.worker_secret,
            capabilities: hello
                .capabilities
                .into_iter()
                .map(|cap| CapabilityDecl {
                    name: cap.name,
                    max_inflight: cap.max_inflight,
                })
                .collect(),
            labels: hello.labels.into_iter().collect(),
        };
        let (node_id, session_id) =
            self.registry
                .upsert_hello(&hello_request)
                .await
                .map_err(|e| match e {
                    HelloError::UnknownNode | HelloError::InvalidSecret => {
                        Status::unauthenticated("worker credentials rejected")
                    }
                    HelloError::NotProvisioned => {
                        Status::failed_precondition("worker is not provisioned")
                    }
                    HelloError::Store(e) => {
                        error!(error = %e, "Registry unavailable during hello");
                        Status::internal("registry unavailable")
                    }
                })?;

        let (tx, rx) = mpsc::channel::<ConsoleFrame>(64);
        let handle = Arc::new(StreamHandle::new(session_id.clone(), tx.clone()));
        // Re-hello from the same identity: the new stream becomes
        // authoritative, the superseded one is told to exit and tears
        // itself down.
        if let Some(previous) = self.hub.register(&node_id, handle.clone()) {
            previous.signal_close();
        }

        if tx
            .send(ConsoleFrame::connect_ack(
                session_id.clone(),
                self.heartbeat_interval_sec,
            ))
            .await
            .is_err()
        {
            self.hub.remove_if_match(&node_id, &session_id);
            let _ = self.registry.clear_session_if_match(&node_id, &session_id).await;
            return Err(Status::internal("stream closed during handshake"));
        }

        tokio::spawn(receive_loop(
            self.registry.clone(),
            self.hub.clone(),
            self.dispatcher.clone(),
            node_id,
            session_id,
            inbound,
            handle,
        ));

        Ok(Response::new(ReceiverStream::new(rx).map(Ok).boxed()))
    }
}

/// Per-stream receive loop. Exits on stream end, protocol violation,
/// session mismatch or a close signal, then runs the (idempotent)
/// teardown for its own session only.
async fn receive_loop(
    registry: Arc<WorkerRegistry>,
    hub: Arc<StreamHub>,
    dispatcher: Arc<Dispatcher>,
    node_id: NodeId,
    session_id: String,
    mut inbound: Streaming<WorkerFrame>,
    handle: Arc<StreamHandle>,
) {
    let mut close = handle.close_signal();
    loop {
        tokio::select! {
            changed = close.changed() => {
                if changed.is_err() || *close.borrow() {
                    debug!(node_id = %node_id, "Stream close requested");
                    break;
                }
            }
            message = inbound.message() => {
                match message {
                    Ok(Some(WorkerFrame { frame: Some(frame) })) => {
                        if !handle_frame(&registry, &dispatcher, &node_id, &session_id, &handle, frame).await {
                            break;
                        }
                    }
                    Ok(Some(WorkerFrame { frame: None })) => {
                        // Unknown oneof variant from a newer worker: skip
                    }
                    Ok(None) => {
                        debug!(node_id = %node_id, "Worker closed its stream");
                        break;
                    }
                    Err(status) => {
                        debug!(node_id = %node_id, status = %status, "Worker stream error");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = registry.clear_session_if_match(&node_id, &session_id).await {
        warn!(node_id = %node_id, error = %e, "Failed to clear session on teardown");
    }
    hub.remove_if_match(&node_id, &session_id);
    dispatcher.fail_session_commands(&node_id, &session_id).await;
    info!(node_id = %node_id, session_id = %session_id, "Worker stream closed");
}

/// Returns false when the stream must terminate.
async fn handle_frame(
    registry: &WorkerRegistry,
    dispatcher: &Dispatcher,
    node_id: &NodeId,
    session_id: &str,
    handle: &StreamHandle,
    frame: worker_frame::Frame,
) -> bool {
    match frame {
        worker_frame::Frame::Heartbeat(heartbeat) => {
            if heartbeat.node_id != node_id.as_str() || heartbeat.session_id != session_id {
                warn!(
                    node_id = %node_id,
                    claimed_node = %heartbeat.node_id,
                    "Heartbeat identity mismatch; terminating stream"
                );
                return false;
            }
            match registry.touch(node_id, session_id).await {
                Ok(TouchResult::Touched) => {
                    handle.try_send(ConsoleFrame::heartbeat_ack(Utc::now().timestamp_millis()));
                    true
                }
                Ok(TouchResult::SessionMismatch) => {
                    // A newer hello took over; this stream is history
                    warn!(node_id = %node_id, "Heartbeat for superseded session; terminating stream");
                    false
                }
                Ok(TouchResult::NodeNotFound) => {
                    warn!(node_id = %node_id, "Heartbeat for deleted node; terminating stream");
                    false
                }
                Err(e) => {
                    error!(node_id = %node_id, error = %e, "Heartbeat touch failed");
                    true
                }
            }
        }
        worker_frame::Frame::CommandResult(result) => {
            dispatcher.on_result(result).await;
            true
        }
        worker_frame::Frame::Hello(_) => {
            warn!(node_id = %node_id, "Duplicate hello on live stream; terminating");
            false
        }
    }
}

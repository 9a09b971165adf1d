//! Integration tests for the Onlyboxes console.
//!
//! Exercises the full control plane: provisioning over HTTP, worker
//! attach over a real gRPC stream, command dispatch, task lifecycle,
//! idempotency and restart recovery.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Duration;
use onlyboxes_api_grpc::worker_v1::worker_link_client::WorkerLinkClient;
use onlyboxes_api_grpc::worker_v1::{
    console_frame, CapabilityDecl, CommandDispatch, CommandResult, ConsoleFrame, Heartbeat, Hello,
    WorkerFrame,
};
use onlyboxes_console::{api, bootstrap::AppState, ConsoleConfig, Services};
use onlyboxes_db::Database;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tower::ServiceExt;

// ============================================================================
// Harness
// ============================================================================

static TOKEN_SEQ: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

struct TestConsole {
    #[allow(dead_code)]
    state: AppState,
    router: Router,
    grpc_addr: SocketAddr,
    grpc_task: tokio::task::JoinHandle<()>,
    admin_cookie: String,
    bearer: String,
}

impl TestConsole {
    /// Wire a full console around the given database and serve the
    /// worker link on an ephemeral TCP port.
    async fn start(db: Database) -> Self {
        let mut config = ConsoleConfig::new("integration-test-key");
        config.registration_enabled = true;
        let state = Services::with_database(config.clone(), db).await.unwrap();
        state.auth().bootstrap_admin("admin", "admin-pass").await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let grpc_addr = listener.local_addr().unwrap();
        let link = onlyboxes_console::grpcapi::WorkerLinkService::new(
            state.registry().clone(),
            state.hub().clone(),
            state.dispatcher().clone(),
            config.heartbeat_interval_sec,
            config.hello_timeout,
        );
        let grpc_task = tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(link.into_server())
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        let router = api::router(state.clone());
        let mut console = Self {
            state,
            router,
            grpc_addr,
            grpc_task,
            admin_cookie: String::new(),
            bearer: String::new(),
        };
        console.admin_cookie = console.login("admin", "admin-pass").await;
        // Token names are unique per account; restart tests reuse the db
        let token_name = format!(
            "tests-{}",
            TOKEN_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        );
        console.bearer = console
            .create_bearer(&console.admin_cookie.clone(), &token_name)
            .await;
        console
    }

    async fn start_in_memory() -> Self {
        let (db, _) = Database::open_in_memory(Duration::days(30)).await.unwrap();
        Self::start(db).await
    }

    async fn request(
        &self,
        method: &str,
        uri: &str,
        headers: &[(header::HeaderName, String)],
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(name.clone(), value.as_str());
        }
        let request = match body {
            Some(value) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn cookie_header(&self) -> (header::HeaderName, String) {
        (
            header::COOKIE,
            format!("obx_session={}", self.admin_cookie),
        )
    }

    fn bearer_header(&self) -> (header::HeaderName, String) {
        (header::AUTHORIZATION, format!("Bearer {}", self.bearer))
    }

    async fn login(&self, username: &str, password: &str) -> String {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/dashboard/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({"username": username, "password": password}).to_string(),
            ))
            .unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        set_cookie
            .split(';')
            .next()
            .unwrap()
            .trim_start_matches("obx_session=")
            .to_string()
    }

    async fn create_bearer(&self, cookie: &str, name: &str) -> String {
        let (status, body) = self
            .request(
                "POST",
                "/api/v1/dashboard/tokens",
                &[(header::COOKIE, format!("obx_session={cookie}"))],
                Some(json!({"name": name})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        body["token"].as_str().unwrap().to_string()
    }

    /// Provision a worker over the dashboard API and pull the node id
    /// and one-time secret out of the startup command.
    async fn provision_worker(&self, cookie: &str, worker_type: &str) -> (String, String) {
        let (status, body) = self
            .request(
                "POST",
                "/api/v1/workers",
                &[(header::COOKIE, format!("obx_session={cookie}"))],
                Some(json!({"type": worker_type})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "create worker failed: {body}");
        let command = body["command"].as_str().unwrap();
        let node_id = field_after(command, "--node-id");
        let secret = field_after(command, "--worker-secret");
        assert_eq!(body["node_id"].as_str().unwrap(), node_id);
        (node_id, secret)
    }
}

fn field_after(command: &str, flag: &str) -> String {
    let mut parts = command.split_whitespace();
    while let Some(part) = parts.next() {
        if part == flag {
            return parts.next().unwrap().to_string();
        }
    }
    panic!("flag {flag} not found in: {command}");
}

/// A worker connected over the real gRPC stream.
struct TestWorker {
    node_id: String,
    session_id: String,
    outbound: mpsc::Sender<WorkerFrame>,
    inbound: tonic::Streaming<ConsoleFrame>,
    /// Keeps the channel owning the stream's connection alive.
    #[allow(dead_code)]
    client: WorkerLinkClient<tonic::transport::Channel>,
}

impl TestWorker {
    async fn connect(
        grpc_addr: SocketAddr,
        node_id: &str,
        secret: &str,
        capabilities: &[(&str, u32)],
        labels: HashMap<String, String>,
    ) -> Self {
        let mut client = WorkerLinkClient::connect(format!("http://{grpc_addr}"))
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(16);
        tx.send(WorkerFrame::hello(Hello {
            node_id: node_id.to_string(),
            node_name: "it-worker".into(),
            executor_kind: "container".into(),
            capabilities: capabilities
                .iter()
                .map(|(name, max_inflight)| CapabilityDecl {
                    name: name.to_string(),
                    max_inflight: *max_inflight,
                })
                .collect(),
            labels,
            version: "0.1.0".into(),
            worker_secret: secret.to_string(),
        }))
        .await
        .unwrap();

        let response = client.attach(ReceiverStream::new(rx)).await.unwrap();
        let mut inbound = response.into_inner();
        let ack = match inbound.message().await.unwrap().unwrap().frame.unwrap() {
            console_frame::Frame::ConnectAck(ack) => ack,
            other => panic!("expected connect ack, got {other:?}"),
        };
        assert!(!ack.session_id.is_empty());
        assert!(ack.heartbeat_interval_sec > 0);
        Self {
            node_id: node_id.to_string(),
            session_id: ack.session_id,
            outbound: tx,
            inbound,
            client,
        }
    }

    /// Next command dispatch, skipping heartbeat acks.
    async fn next_dispatch(&mut self) -> CommandDispatch {
        loop {
            let frame = self
                .inbound
                .message()
                .await
                .unwrap()
                .expect("stream closed while waiting for dispatch");
            match frame.frame.unwrap() {
                console_frame::Frame::CommandDispatch(dispatch) => return dispatch,
                console_frame::Frame::HeartbeatAck(_) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn reply_ok(&self, command_id: &str, payload: Value) {
        self.outbound
            .send(WorkerFrame::command_result(CommandResult {
                command_id: command_id.to_string(),
                error_code: String::new(),
                error_message: String::new(),
                payload_json: payload.to_string(),
                completed_unix_ms: chrono::Utc::now().timestamp_millis(),
            }))
            .await
            .unwrap();
    }

    async fn heartbeat(&self, session_id: &str) {
        self.outbound
            .send(WorkerFrame::heartbeat(Heartbeat {
                node_id: self.node_id.clone(),
                session_id: session_id.to_string(),
                now_ms: chrono::Utc::now().timestamp_millis(),
            }))
            .await
            .unwrap();
    }

    /// Serve every dispatch by echoing its payload back.
    fn spawn_echo(mut self) {
        tokio::spawn(async move {
            loop {
                let frame = match self.inbound.message().await {
                    Ok(Some(frame)) => frame,
                    _ => break,
                };
                if let Some(console_frame::Frame::CommandDispatch(dispatch)) = frame.frame {
                    let payload: Value =
                        serde_json::from_str(&dispatch.payload_json).unwrap_or(json!({}));
                    self.reply_ok(&dispatch.command_id, payload).await;
                }
            }
        });
    }
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test]
async fn test_happy_path_echo_command() {
    let console = TestConsole::start_in_memory().await;
    let (node_id, secret) = console.provision_worker(&console.admin_cookie, "normal").await;
    let worker = TestWorker::connect(
        console.grpc_addr,
        &node_id,
        &secret,
        &[("echo", 4)],
        HashMap::new(),
    )
    .await;
    worker.spawn_echo();

    let (status, body) = console
        .request(
            "POST",
            "/api/v1/commands/echo",
            &[console.bearer_header()],
            Some(json!({"message": "hi", "timeout_ms": 5000})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "echo failed: {body}");
    assert_eq!(body["message"], "hi");

    // Inflight drained back to zero
    let (status, body) = console
        .request(
            "GET",
            "/api/v1/workers/inflight",
            &[console.cookie_header()],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entries"].as_array().unwrap().len(), 0);

    console.grpc_task.abort();
}

#[tokio::test]
async fn test_sync_task_roundtrip_persists_terminal_row() {
    let console = TestConsole::start_in_memory().await;
    let (node_id, secret) = console.provision_worker(&console.admin_cookie, "normal").await;
    TestWorker::connect(
        console.grpc_addr,
        &node_id,
        &secret,
        &[("pythonExec", 2)],
        HashMap::new(),
    )
    .await
    .spawn_echo();

    let (status, body) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[console.bearer_header()],
            Some(json!({
                "capability": "pythonExec",
                "input": {"code": "1+1"},
                "mode": "sync",
                "timeout_ms": 5000
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "submit failed: {body}");
    assert_eq!(body["status"], "succeeded");
    assert!(body["completed_at"].is_string());

    // GET returns the stored snapshot
    let task_id = body["task_id"].as_str().unwrap();
    let (status, fetched) = console
        .request(
            "GET",
            &format!("/api/v1/tasks/{task_id}"),
            &[console.bearer_header()],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"], "succeeded");
    assert_eq!(fetched["result"]["code"], "1+1");

    console.grpc_task.abort();
}

#[tokio::test]
async fn test_capacity_exhaustion_maps_to_429() {
    let console = TestConsole::start_in_memory().await;
    let (node_id, secret) = console.provision_worker(&console.admin_cookie, "normal").await;
    // Single-slot worker that never answers
    let _worker = TestWorker::connect(
        console.grpc_addr,
        &node_id,
        &secret,
        &[("pythonExec", 1)],
        HashMap::new(),
    )
    .await;

    let (status, first) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[console.bearer_header()],
            Some(json!({"capability": "pythonExec", "mode": "async", "timeout_ms": 60000})),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(first["status_url"].is_string());

    let (status, second) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[console.bearer_header()],
            Some(json!({"capability": "pythonExec", "mode": "auto", "timeout_ms": 60000})),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second["status"], "failed");
    assert_eq!(second["error"]["code"], "no_capacity");

    console.grpc_task.abort();
}

#[tokio::test]
async fn test_no_worker_maps_to_503() {
    let console = TestConsole::start_in_memory().await;
    let (status, body) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[console.bearer_header()],
            Some(json!({"capability": "pythonExec", "mode": "auto"})),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "no_worker");
    console.grpc_task.abort();
}

#[tokio::test]
async fn test_deadline_exceeded_maps_to_504_and_ignores_late_result() {
    let console = TestConsole::start_in_memory().await;
    let (node_id, secret) = console.provision_worker(&console.admin_cookie, "normal").await;
    let mut worker = TestWorker::connect(
        console.grpc_addr,
        &node_id,
        &secret,
        &[("pythonExec", 1)],
        HashMap::new(),
    )
    .await;

    let submit = console.request(
        "POST",
        "/api/v1/tasks",
        &[console.bearer_header()],
        Some(json!({"capability": "pythonExec", "mode": "sync", "timeout_ms": 300})),
    );
    let (status, body) = submit.await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT, "expected timeout: {body}");
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["code"], "deadline_exceeded");

    // Late result: logged and dropped, terminal state is stable
    let dispatch = worker.next_dispatch().await;
    worker.reply_ok(&dispatch.command_id, json!({"late": true})).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let task_id = body["task_id"].as_str().unwrap();
    let (_, fetched) = console
        .request(
            "GET",
            &format!("/api/v1/tasks/{task_id}"),
            &[console.bearer_header()],
            None,
        )
        .await;
    assert_eq!(fetched["status"], "failed");
    assert_eq!(fetched["error"]["code"], "deadline_exceeded");

    console.grpc_task.abort();
}

#[tokio::test]
async fn test_idempotent_replay_with_request_id() {
    let console = TestConsole::start_in_memory().await;
    let (node_id, secret) = console.provision_worker(&console.admin_cookie, "normal").await;
    let mut worker = TestWorker::connect(
        console.grpc_addr,
        &node_id,
        &secret,
        &[("pythonExec", 1)],
        HashMap::new(),
    )
    .await;

    let submit = json!({
        "capability": "pythonExec",
        "mode": "async",
        "timeout_ms": 60000,
        "request_id": "req-42"
    });
    let (status, first) = console
        .request("POST", "/api/v1/tasks", &[console.bearer_header()], Some(submit.clone()))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // In-flight: second submission conflicts
    let (status, conflict) = console
        .request("POST", "/api/v1/tasks", &[console.bearer_header()], Some(submit.clone()))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(conflict["error"], "request_id_in_progress");

    // Complete, then replay returns the original task
    let dispatch = worker.next_dispatch().await;
    worker.reply_ok(&dispatch.command_id, json!({"ok": true})).await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let (status, replay) = console
        .request("POST", "/api/v1/tasks", &[console.bearer_header()], Some(submit))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["task_id"], first["task_id"]);
    assert_eq!(replay["status"], "succeeded");

    console.grpc_task.abort();
}

#[tokio::test]
async fn test_restart_recovery_fails_running_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite:{}", dir.path().join("console.db").display());

    let (db, _) = Database::open(&db_url, Duration::days(30)).await.unwrap();
    let crashed = TestConsole::start(db).await;
    let bearer = crashed.bearer.clone();
    let (node_id, secret) = crashed.provision_worker(&crashed.admin_cookie, "normal").await;
    // Worker accepts the dispatch but never answers; the stream stays up
    // so nothing but recovery can touch the task
    let _worker = TestWorker::connect(
        crashed.grpc_addr,
        &node_id,
        &secret,
        &[("pythonExec", 1)],
        HashMap::new(),
    )
    .await;

    let (status, body) = crashed
        .request(
            "POST",
            "/api/v1/tasks",
            &[crashed.bearer_header()],
            Some(json!({"capability": "pythonExec", "mode": "async", "timeout_ms": 600000})),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    // "Restart": a replacement console opens the same database file and
    // runs startup recovery
    let (db, report) = Database::open(&db_url, Duration::days(30)).await.unwrap();
    assert_eq!(report.failed_tasks, 1);
    assert_eq!(report.cleared_sessions, 1);
    let console = TestConsole::start(db).await;

    let (status, body) = console
        .request(
            "GET",
            &format!("/api/v1/tasks/{task_id}"),
            &[(header::AUTHORIZATION, format!("Bearer {bearer}"))],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"]["code"], "console_restarted");
    assert!(body["completed_at"].is_string());
    assert!(body["expires_at"].is_string());

    crashed.grpc_task.abort();
    console.grpc_task.abort();
}

#[tokio::test]
async fn test_worker_sys_scoping_and_single_flight() {
    let console = TestConsole::start_in_memory().await;

    // Account A with its own worker-sys
    let (_, alice) = console
        .request(
            "POST",
            "/api/v1/dashboard/register",
            &[console.cookie_header()],
            Some(json!({"username": "alice", "password": "alice-pass"})),
        )
        .await;
    assert!(alice["account_id"].is_string());
    let alice_cookie = console.login("alice", "alice-pass").await;
    let alice_bearer = console.create_bearer(&alice_cookie, "alice-token").await;
    let (node_id, secret) = console.provision_worker(&alice_cookie, "worker-sys").await;

    // The worker declares computerUse with the single-flight cap
    let _worker = TestWorker::connect(
        console.grpc_addr,
        &node_id,
        &secret,
        &[("computerUse", 1)],
        HashMap::new(),
    )
    .await;

    // Account A: first use occupies the slot, second sees no_capacity
    let (status, _) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[(header::AUTHORIZATION, format!("Bearer {alice_bearer}"))],
            Some(json!({"capability": "computerUse", "mode": "async", "timeout_ms": 60000})),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, body) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[(header::AUTHORIZATION, format!("Bearer {alice_bearer}"))],
            Some(json!({"capability": "computerUse", "mode": "auto", "timeout_ms": 60000})),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "no_capacity");

    // Admin (no worker-sys of their own) gets no_worker: the scope only
    // ever routes to the caller's own machine
    let (status, body) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[console.bearer_header()],
            Some(json!({"capability": "computerUse", "mode": "auto", "timeout_ms": 60000})),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "no_worker");

    console.grpc_task.abort();
}

#[tokio::test]
async fn test_re_hello_supersedes_previous_stream() {
    let console = TestConsole::start_in_memory().await;
    let (node_id, secret) = console.provision_worker(&console.admin_cookie, "normal").await;

    let mut first = TestWorker::connect(
        console.grpc_addr,
        &node_id,
        &secret,
        &[("echo", 1)],
        HashMap::new(),
    )
    .await;
    let second = TestWorker::connect(
        console.grpc_addr,
        &node_id,
        &secret,
        &[("echo", 1)],
        HashMap::new(),
    )
    .await;
    assert_ne!(first.session_id, second.session_id);
    second.spawn_echo();

    // The first stream is closed by the console
    let closed = tokio::time::timeout(std::time::Duration::from_secs(5), first.inbound.message())
        .await
        .expect("first stream was not closed");
    assert!(matches!(closed, Ok(None) | Err(_)));

    // Commands flow to the authoritative stream
    let (status, body) = console
        .request(
            "POST",
            "/api/v1/commands/echo",
            &[console.bearer_header()],
            Some(json!({"message": "after-rehello"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "echo after re-hello failed: {body}");
    assert_eq!(body["message"], "after-rehello");

    console.grpc_task.abort();
}

#[tokio::test]
async fn test_wrong_session_heartbeat_closes_stream() {
    let console = TestConsole::start_in_memory().await;
    let (node_id, secret) = console.provision_worker(&console.admin_cookie, "normal").await;
    let mut worker = TestWorker::connect(
        console.grpc_addr,
        &node_id,
        &secret,
        &[("echo", 1)],
        HashMap::new(),
    )
    .await;

    // A good heartbeat is acked
    worker.heartbeat(&worker.session_id.clone()).await;
    let frame = worker.inbound.message().await.unwrap().unwrap();
    assert!(matches!(
        frame.frame.unwrap(),
        console_frame::Frame::HeartbeatAck(_)
    ));

    // A heartbeat for a session this stream does not own kills it
    worker.heartbeat("not-my-session").await;
    let closed = tokio::time::timeout(std::time::Duration::from_secs(5), worker.inbound.message())
        .await
        .expect("stream was not closed after bad heartbeat");
    assert!(matches!(closed, Ok(None) | Err(_)));

    // The worker can re-hello and come back online
    let again = TestWorker::connect(
        console.grpc_addr,
        &node_id,
        &secret,
        &[("echo", 1)],
        HashMap::new(),
    )
    .await;
    assert!(!again.session_id.is_empty());

    console.grpc_task.abort();
}

#[tokio::test]
async fn test_timeout_bounds_rejected_before_dispatch() {
    let console = TestConsole::start_in_memory().await;

    let (status, _) = console
        .request(
            "POST",
            "/api/v1/commands/echo",
            &[console.bearer_header()],
            Some(json!({"message": "hi", "timeout_ms": 60001})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[console.bearer_header()],
            Some(json!({"capability": "pythonExec", "timeout_ms": 600001})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    console.grpc_task.abort();
}

// ============================================================================
// Auth and surface behavior
// ============================================================================

#[tokio::test]
async fn test_cross_account_task_reads_as_missing() {
    let console = TestConsole::start_in_memory().await;
    let (status, body) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[console.bearer_header()],
            Some(json!({"capability": "pythonExec", "mode": "auto"})),
        )
        .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    // A different account with its own token
    console
        .request(
            "POST",
            "/api/v1/dashboard/register",
            &[console.cookie_header()],
            Some(json!({"username": "mallory", "password": "mallory-pass"})),
        )
        .await;
    let mallory_cookie = console.login("mallory", "mallory-pass").await;
    let mallory_bearer = console.create_bearer(&mallory_cookie, "m").await;

    let (status, _) = console
        .request(
            "GET",
            &format!("/api/v1/tasks/{task_id}"),
            &[(header::AUTHORIZATION, format!("Bearer {mallory_bearer}"))],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = console
        .request(
            "POST",
            &format!("/api/v1/tasks/{task_id}/cancel"),
            &[(header::AUTHORIZATION, format!("Bearer {mallory_bearer}"))],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    console.grpc_task.abort();
}

#[tokio::test]
async fn test_non_admin_worker_visibility() {
    let console = TestConsole::start_in_memory().await;
    // Admin fleet worker
    console.provision_worker(&console.admin_cookie, "normal").await;

    console
        .request(
            "POST",
            "/api/v1/dashboard/register",
            &[console.cookie_header()],
            Some(json!({"username": "bob", "password": "bob-pass"})),
        )
        .await;
    let bob_cookie = console.login("bob", "bob-pass").await;

    // Bob cannot create normal workers
    let (status, _) = console
        .request(
            "POST",
            "/api/v1/workers",
            &[(header::COOKIE, format!("obx_session={bob_cookie}"))],
            Some(json!({"type": "normal"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Bob sees nothing until he owns a worker-sys
    let (_, body) = console
        .request(
            "GET",
            "/api/v1/workers",
            &[(header::COOKIE, format!("obx_session={bob_cookie}"))],
            None,
        )
        .await;
    assert_eq!(body["total"], 0);

    let (bob_node, _) = console.provision_worker(&bob_cookie, "worker-sys").await;
    let (_, body) = console
        .request(
            "GET",
            "/api/v1/workers",
            &[(header::COOKIE, format!("obx_session={bob_cookie}"))],
            None,
        )
        .await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["workers"][0]["node_id"], bob_node);

    // A second worker-sys for the same account conflicts
    let (status, _) = console
        .request(
            "POST",
            "/api/v1/workers",
            &[(header::COOKIE, format!("obx_session={bob_cookie}"))],
            Some(json!({"type": "worker-sys"})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Admin sees both workers
    let (_, body) = console
        .request("GET", "/api/v1/workers", &[console.cookie_header()], None)
        .await;
    assert_eq!(body["total"], 2);

    console.grpc_task.abort();
}

#[tokio::test]
async fn test_retired_endpoints_are_gone() {
    let console = TestConsole::start_in_memory().await;
    let (status, _) = console
        .request(
            "GET",
            "/api/v1/dashboard/token/value",
            &[console.cookie_header()],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::GONE);

    let (status, _) = console
        .request(
            "GET",
            "/api/v1/workers/some-node/startup-command",
            &[console.cookie_header()],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::GONE);
    console.grpc_task.abort();
}

#[tokio::test]
async fn test_unauthenticated_requests_are_rejected() {
    let console = TestConsole::start_in_memory().await;
    let (status, _) = console.request("GET", "/api/v1/workers", &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[],
            Some(json!({"capability": "echo"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = console
        .request(
            "POST",
            "/api/v1/tasks",
            &[(header::AUTHORIZATION, "Bearer obx_bogus".to_string())],
            Some(json!({"capability": "echo"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    console.grpc_task.abort();
}

// ============================================================================
// MCP surface
// ============================================================================

#[tokio::test]
async fn test_mcp_initialize_and_tools_list() {
    let console = TestConsole::start_in_memory().await;

    let (status, body) = console
        .request(
            "POST",
            "/mcp",
            &[console.bearer_header()],
            Some(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["serverInfo"]["name"], "onlyboxes-console");

    let (status, body) = console
        .request(
            "POST",
            "/mcp",
            &[console.bearer_header()],
            Some(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let tools = body["result"]["tools"].as_array().unwrap();
    assert!(tools.iter().any(|tool| tool["name"] == "submit_task"));
    for tool in tools {
        assert_eq!(tool["inputSchema"]["additionalProperties"], false);
    }
    console.grpc_task.abort();
}

#[tokio::test]
async fn test_mcp_unknown_arguments_are_invalid_params() {
    let console = TestConsole::start_in_memory().await;
    let (status, body) = console
        .request(
            "POST",
            "/mcp",
            &[console.bearer_header()],
            Some(json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "get_task", "arguments": {"task_id": "x", "bogus": true}}
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], -32602);
    console.grpc_task.abort();
}

#[tokio::test]
async fn test_mcp_get_is_method_not_allowed() {
    let console = TestConsole::start_in_memory().await;
    let request = Request::builder()
        .method("GET")
        .uri("/mcp")
        .body(Body::empty())
        .unwrap();
    let response = console.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(
        response.headers().get(header::ALLOW).unwrap().to_str().unwrap(),
        "POST"
    );
    console.grpc_task.abort();
}

#[tokio::test]
async fn test_mcp_requires_bearer() {
    let console = TestConsole::start_in_memory().await;
    let (status, _) = console
        .request(
            "POST",
            "/mcp",
            &[],
            Some(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    console.grpc_task.abort();
}

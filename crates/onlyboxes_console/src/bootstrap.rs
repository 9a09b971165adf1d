//! Service wiring and process lifecycle.

use anyhow::{Context, Result};
use onlyboxes_db::Database;
use onlyboxes_security::SecretHasher;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::auth::AuthService;
use crate::config::ConsoleConfig;
use crate::dispatch::Dispatcher;
use crate::events::TaskEvents;
use crate::grpcapi::WorkerLinkService;
use crate::inflight::InflightTracker;
use crate::provision::Provisioner;
use crate::prune::spawn_pruners;
use crate::registry::WorkerRegistry;
use crate::streams::StreamHub;
use crate::tasks::TaskManager;

/// Every long-lived component, wired once at startup.
pub struct Services {
    config: ConsoleConfig,
    db: Database,
    registry: Arc<WorkerRegistry>,
    hub: Arc<StreamHub>,
    inflight: Arc<InflightTracker>,
    dispatcher: Arc<Dispatcher>,
    tasks: TaskManager,
    auth: AuthService,
    provisioner: Provisioner,
    events: TaskEvents,
    shutdown: watch::Sender<bool>,
}

/// Shared handle passed to every surface.
#[derive(Clone)]
pub struct AppState(Arc<Services>);

impl AppState {
    pub fn config(&self) -> &ConsoleConfig {
        &self.0.config
    }

    pub fn db(&self) -> &Database {
        &self.0.db
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.0.registry
    }

    pub fn hub(&self) -> &Arc<StreamHub> {
        &self.0.hub
    }

    pub fn inflight(&self) -> &InflightTracker {
        &self.0.inflight
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.0.dispatcher
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.0.tasks
    }

    pub fn auth(&self) -> &AuthService {
        &self.0.auth
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.0.provisioner
    }

    pub fn events(&self) -> &TaskEvents {
        &self.0.events
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.0.shutdown.subscribe()
    }

    /// Flip the shutdown signal: pruners, stream loops and servers exit;
    /// pending waiters observe `server_shutdown`.
    pub async fn begin_shutdown(&self) {
        let _ = self.0.shutdown.send(true);
        self.0.hub.close_all();
        self.0.dispatcher.shutdown().await;
    }
}

impl Services {
    /// Open the database (schema + startup recovery) and wire services.
    pub async fn open(config: ConsoleConfig) -> Result<AppState> {
        let (db, report) = Database::open(&config.db_url, config.retention).await?;
        info!(
            cleared_sessions = report.cleared_sessions,
            failed_tasks = report.failed_tasks,
            "Database opened"
        );
        Self::with_database(config, db).await
    }

    /// Wire services onto an already-open database (tests use this with
    /// an in-memory store).
    pub async fn with_database(config: ConsoleConfig, db: Database) -> Result<AppState> {
        let hasher =
            Arc::new(SecretHasher::new(&config.hmac_key).context("Secret hasher key is required")?);
        let registry = Arc::new(WorkerRegistry::new(
            db.clone(),
            hasher.clone(),
            config.offline_ttl,
        ));
        let hub = Arc::new(StreamHub::new());
        let inflight = Arc::new(InflightTracker::new());
        let events = TaskEvents::new();
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            registry.clone(),
            hub.clone(),
            inflight.clone(),
            events.clone(),
            config.retention,
        ));
        let tasks = TaskManager::new(db.clone(), dispatcher.clone(), events.clone(), config.retention);
        let auth = AuthService::new(
            db.clone(),
            hasher.clone(),
            config.session_ttl,
            config.registration_enabled,
        );
        let provisioner = Provisioner::new(
            db.clone(),
            hasher,
            hub.clone(),
            config.advertised_grpc_addr.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        Ok(AppState(Arc::new(Services {
            config,
            db,
            registry,
            hub,
            inflight,
            dispatcher,
            tasks,
            auth,
            provisioner,
            events,
            shutdown,
        })))
    }
}

/// Run the console until ctrl-c: REST + MCP on HTTP, the worker link on
/// gRPC, pruners in the background.
pub async fn run(config: ConsoleConfig) -> Result<()> {
    let state = Services::open(config.clone()).await?;

    if let Some(password) = &config.admin_password {
        state
            .auth()
            .bootstrap_admin(&config.admin_username, password)
            .await?;
    }

    let pruners = spawn_pruners(
        state.db().clone(),
        config.offline_ttl,
        state.shutdown_receiver(),
    );

    let grpc_addr: SocketAddr = config
        .grpc_bind_addr
        .parse()
        .with_context(|| format!("Invalid gRPC bind address: {}", config.grpc_bind_addr))?;
    let link = WorkerLinkService::new(
        state.registry().clone(),
        state.hub().clone(),
        state.dispatcher().clone(),
        config.heartbeat_interval_sec,
        config.hello_timeout,
    );
    let mut grpc_shutdown = state.shutdown_receiver();
    let grpc_server = tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(link.into_server())
            .serve_with_shutdown(grpc_addr, async move {
                let _ = grpc_shutdown.changed().await;
            }),
    );
    info!(addr = %grpc_addr, "Worker link listening");

    let listener = tokio::net::TcpListener::bind(&config.http_bind_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP address: {}", config.http_bind_addr))?;
    info!(addr = %config.http_bind_addr, "HTTP API listening");
    let router = crate::api::router(state.clone());
    let mut http_shutdown = state.shutdown_receiver();
    let http_server = tokio::spawn(
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.changed().await;
            })
            .into_future(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    state.begin_shutdown().await;

    let _ = http_server.await;
    let _ = grpc_server.await;
    for pruner in pruners {
        let _ = pruner.await;
    }
    info!("Console stopped");
    Ok(())
}

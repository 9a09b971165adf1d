//! Onlyboxes console library.
//!
//! The control plane for a self-hosted code-execution sandbox: session
//! registry, capability-routed dispatcher, durable task lifecycle,
//! account/token auth, and the REST / MCP / worker-link surfaces.

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod grpcapi;
pub mod inflight;
pub mod mcp;
pub mod provision;
pub mod prune;
pub mod registry;
pub mod streams;
pub mod tasks;

pub use auth::{AuthService, Identity};
pub use bootstrap::{run, AppState, Services};
pub use config::ConsoleConfig;
pub use dispatch::{CommandOutcome, DispatchRequest, Dispatcher, SelectError};
pub use events::TaskEvents;
pub use inflight::InflightTracker;
pub use registry::{HelloError, HelloRequest, RouteScope, WorkerRegistry};
pub use streams::{StreamHandle, StreamHub};
pub use tasks::{CancelOutcome, SubmitError, TaskManager};

use onlyboxes_protocol::defaults;
use std::path::PathBuf;

#[derive(clap::Parser, Debug)]
#[command(name = "onlyboxes-console", about = "Onlyboxes control plane")]
pub struct ConsoleArgs {
    /// HTTP bind address (REST + MCP)
    #[arg(long, env = "ONLYBOXES_HTTP_ADDR", default_value_t = defaults::DEFAULT_HTTP_BIND_ADDR.to_string())]
    pub http_addr: String,

    /// Worker-link gRPC bind address
    #[arg(long, env = "ONLYBOXES_GRPC_ADDR", default_value_t = defaults::DEFAULT_GRPC_BIND_ADDR.to_string())]
    pub grpc_addr: String,

    /// gRPC address advertised in worker startup commands
    #[arg(long, env = "ONLYBOXES_ADVERTISED_GRPC_ADDR")]
    pub advertised_grpc_addr: Option<String>,

    /// Database URL (sqlite:...)
    #[arg(long, env = "ONLYBOXES_DB_URL", default_value_t = defaults::DEFAULT_DB_URL.to_string())]
    pub db_url: String,

    /// Deploy-wide key for secret/token hashing (required)
    #[arg(long, env = "ONLYBOXES_HMAC_KEY")]
    pub hmac_key: String,

    /// Username for the first-admin bootstrap
    #[arg(long, env = "ONLYBOXES_ADMIN_USERNAME", default_value = "admin")]
    pub admin_username: String,

    /// Password for the first-admin bootstrap; omit to skip bootstrap
    #[arg(long, env = "ONLYBOXES_ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    /// Allow admins to register new accounts
    #[arg(long, env = "ONLYBOXES_REGISTRATION_ENABLED", default_value_t = false)]
    pub registration_enabled: bool,

    /// Verbose stderr logging
    #[arg(long)]
    pub verbose: bool,

    /// Optional log file (append mode)
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl ConsoleArgs {
    pub fn into_config(self) -> ConsoleConfig {
        let mut config = ConsoleConfig::new(self.hmac_key);
        config.advertised_grpc_addr = self
            .advertised_grpc_addr
            .unwrap_or_else(|| self.grpc_addr.clone());
        config.http_bind_addr = self.http_addr;
        config.grpc_bind_addr = self.grpc_addr;
        config.db_url = self.db_url;
        config.admin_username = self.admin_username;
        config.admin_password = self.admin_password;
        config.registration_enabled = self.registration_enabled;
        config
    }
}

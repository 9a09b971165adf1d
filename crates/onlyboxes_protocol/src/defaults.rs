//! Canonical default values shared across the console.
//!
//! Everything here is configurable; these are the deploy defaults.

/// HTTP API bind address (REST + MCP).
pub const DEFAULT_HTTP_BIND_ADDR: &str = "127.0.0.1:8080";
/// Worker-link gRPC bind address.
pub const DEFAULT_GRPC_BIND_ADDR: &str = "127.0.0.1:50051";
/// SQLite database URL.
pub const DEFAULT_DB_URL: &str = "sqlite:onlyboxes.db";

/// A worker is offline once its last heartbeat is older than this.
pub const OFFLINE_TTL_SECS: u64 = 15;
/// Heartbeat interval advertised to workers in the connect ack.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;
/// Dashboard-only staleness signal default.
pub const STALE_AFTER_SECS: u64 = 30;
/// A worker must send its hello this quickly after opening a stream.
pub const HELLO_TIMEOUT_SECS: u64 = 10;

/// Dashboard cookie session lifetime.
pub const DASHBOARD_SESSION_TTL_SECS: u64 = 12 * 60 * 60;

/// Terminal tasks are retained this long before pruning.
pub const TASK_RETENTION_DAYS: i64 = 30;
/// Offline runtime-worker prune period.
pub const WORKER_PRUNE_INTERVAL_SECS: u64 = 1;
/// Expired-task prune period.
pub const TASK_PRUNE_INTERVAL_SECS: u64 = 60;

/// Request timeout window for long-running commands, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const MAX_TIMEOUT_MS: u64 = 600_000;

/// Request timeout window for echo, in milliseconds.
pub const ECHO_DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const ECHO_MAX_TIMEOUT_MS: u64 = 60_000;

/// Auto-mode wait window, in milliseconds.
pub const DEFAULT_WAIT_MS: u64 = 10_000;
pub const MAX_WAIT_MS: u64 = 60_000;

/// Largest page the list APIs will serve.
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Display prefix for worker secrets and access tokens.
pub const SECRET_PREFIX: &str = "obx_";

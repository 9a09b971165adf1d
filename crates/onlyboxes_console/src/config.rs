//! Console configuration (plain data; the binary fills it from clap).

use chrono::Duration;
use onlyboxes_protocol::defaults;

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// REST + MCP bind address.
    pub http_bind_addr: String,
    /// Worker-link gRPC bind address.
    pub grpc_bind_addr: String,
    /// Address embedded in worker startup commands (may differ from the
    /// bind address behind NAT).
    pub advertised_grpc_addr: String,
    pub db_url: String,
    /// Deploy-wide HMAC key; required, startup fails without it.
    pub hmac_key: String,
    pub admin_username: String,
    /// First-admin bootstrap password. None skips bootstrap.
    pub admin_password: Option<String>,
    pub registration_enabled: bool,
    pub offline_ttl: Duration,
    pub stale_after: Duration,
    pub heartbeat_interval_sec: u32,
    pub hello_timeout: std::time::Duration,
    pub session_ttl: Duration,
    pub retention: Duration,
}

impl ConsoleConfig {
    /// Deploy defaults around a required HMAC key.
    pub fn new(hmac_key: impl Into<String>) -> Self {
        Self {
            http_bind_addr: defaults::DEFAULT_HTTP_BIND_ADDR.to_string(),
            grpc_bind_addr: defaults::DEFAULT_GRPC_BIND_ADDR.to_string(),
            advertised_grpc_addr: defaults::DEFAULT_GRPC_BIND_ADDR.to_string(),
            db_url: defaults::DEFAULT_DB_URL.to_string(),
            hmac_key: hmac_key.into(),
            admin_username: "admin".to_string(),
            admin_password: None,
            registration_enabled: false,
            offline_ttl: Duration::seconds(defaults::OFFLINE_TTL_SECS as i64),
            stale_after: Duration::seconds(defaults::STALE_AFTER_SECS as i64),
            heartbeat_interval_sec: defaults::HEARTBEAT_INTERVAL_SECS as u32,
            hello_timeout: std::time::Duration::from_secs(defaults::HELLO_TIMEOUT_SECS),
            session_ttl: Duration::seconds(defaults::DASHBOARD_SESSION_TTL_SECS as i64),
            retention: Duration::days(defaults::TASK_RETENTION_DAYS),
        }
    }
}

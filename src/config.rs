//! Command line and environment configuration.
//!
//! Every option has a default and a `CAPESYNC_*` environment variable, so a
//! node can be started with nothing but its role.

use crate::model::types::NodeId;
use crate::sync::agent::BackendConfig;

use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "cape-sync")]
#[command(about = "Cape assignment synchronization between a proxy and its backend servers")]
#[command(version)]
pub struct SyncConfig {
    #[command(subcommand)]
    pub role: Role,

    /// Heartbeat interval in milliseconds
    #[arg(long, global = true, env = "CAPESYNC_HEARTBEAT_MS", default_value_t = 5_000)]
    pub heartbeat_ms: u64,

    /// Silence after which a peer is suspected, in milliseconds
    #[arg(long, global = true, env = "CAPESYNC_SUSPECT_MS", default_value_t = 15_000)]
    pub suspect_ms: u64,

    /// Silence after which a peer is considered gone, in milliseconds
    #[arg(long, global = true, env = "CAPESYNC_DEAD_MS", default_value_t = 30_000)]
    pub dead_ms: u64,

    /// Time allowed for a full snapshot to arrive, in milliseconds
    #[arg(long, global = true, env = "CAPESYNC_RESYNC_TIMEOUT_MS", default_value_t = 30_000)]
    pub resync_timeout_ms: u64,

    /// First reconnect / retry delay in milliseconds
    #[arg(long, global = true, env = "CAPESYNC_BACKOFF_BASE_MS", default_value_t = 500)]
    pub backoff_base_ms: u64,

    /// Upper bound for reconnect / retry delays in milliseconds
    #[arg(long, global = true, env = "CAPESYNC_BACKOFF_CAP_MS", default_value_t = 60_000)]
    pub backoff_cap_ms: u64,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Role {
    /// Run the authoritative proxy node
    Proxy(ProxyArgs),
    /// Run a backend node that mirrors the proxy's assignments
    Backend(BackendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProxyArgs {
    /// Address backends connect to
    #[arg(long, env = "CAPESYNC_SYNC_BIND", default_value = "127.0.0.1:25590")]
    pub sync_bind: SocketAddr,

    /// Address of the admin HTTP API
    #[arg(long, env = "CAPESYNC_ADMIN_BIND", default_value = "127.0.0.1:8090")]
    pub admin_bind: SocketAddr,

    /// Change events kept for `/changes`
    #[arg(long, env = "CAPESYNC_RETENTION", default_value_t = 10_000)]
    pub retention: usize,

    /// Outbound queue per connected backend
    #[arg(long, env = "CAPESYNC_QUEUE_CAPACITY", default_value_t = 4_096)]
    pub queue_capacity: usize,

    /// Versions kept per player
    #[arg(long, env = "CAPESYNC_HISTORY_LIMIT", default_value_t = 32)]
    pub history_limit: usize,

    /// Assignment history file; state is not persisted when omitted
    #[arg(long, env = "CAPESYNC_DATA_FILE")]
    pub data_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct BackendArgs {
    /// Identifier announced to the proxy (random when omitted)
    #[arg(long, env = "CAPESYNC_NODE_ID")]
    pub node_id: Option<String>,

    /// Proxy sync address
    #[arg(long, env = "CAPESYNC_PROXY", default_value = "127.0.0.1:25590")]
    pub proxy: SocketAddr,

    /// Address of the status HTTP API
    #[arg(long, env = "CAPESYNC_STATUS_BIND", default_value = "127.0.0.1:8091")]
    pub status_bind: SocketAddr,

    /// Seconds until an unconfirmed cache entry counts as stale
    #[arg(long, env = "CAPESYNC_CACHE_TTL_SECS", default_value_t = 300)]
    pub cache_ttl_secs: u64,

    /// Timeout for writes forwarded to the proxy, in milliseconds
    #[arg(long, env = "CAPESYNC_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    pub request_timeout_ms: u64,
}

impl SyncConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms.max(1))
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.suspect_ms)
    }

    pub fn dead_timeout(&self) -> Duration {
        Duration::from_millis(self.dead_ms)
    }

    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms.max(self.backoff_base_ms))
    }
}

impl BackendArgs {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn backend_config(&self, shared: &SyncConfig) -> BackendConfig {
        BackendConfig {
            node_id: self
                .node_id
                .clone()
                .map(NodeId)
                .unwrap_or_default(),
            heartbeat_interval: shared.heartbeat_interval(),
            dead_timeout: shared.dead_timeout(),
            resync_timeout: shared.resync_timeout(),
            backoff_base: shared.backoff_base(),
            backoff_cap: shared.backoff_cap(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }
}

//! Configuration schema definitions.
//!
//! `ServerConfig` is the raw, deserializable form assembled from the config
//! file and command line. `Config` is the validated, resolved form the
//! supervisor owns for the lifetime of the process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bind address when none is configured.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:1073";

/// Default lock file path, relative to the working directory.
pub const DEFAULT_PIDFILE: &str = "xsocksd.pid";

/// Idle timeout applied when the configured value is unset or zero.
pub const DEFAULT_IDLE_SECS: u64 = 60;

/// Maximum number of nameservers handed to the resolver.
pub const MAX_NAMESERVERS: usize = 4;

/// Port used for nameservers given without one.
pub const DNS_PORT: u16 = 53;

/// Root configuration for the daemon.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Shared secret clients authenticate with.
    pub password: Option<String>,

    /// Listener configuration (bind address, workers).
    pub listener: ListenerConfig,

    /// Resolver settings.
    pub resolver: ResolverConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Daemonization and lock file.
    pub daemon: DaemonConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:1073").
    pub bind_address: String,

    /// Worker threads. Zero or one selects single-loop mode.
    pub workers: usize,

    /// Listen backlog per socket.
    pub backlog: u32,

    /// Maximum concurrent connections per worker (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            workers: 0,
            backlog: 128,
            max_connections: 10_000,
        }
    }
}

/// Resolver configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ResolverConfig {
    /// Nameserver addresses ("8.8.8.8" or "8.8.8.8:53").
    pub nameservers: Vec<String>,
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle connection timeout in seconds. Zero means the default.
    pub idle_secs: u64,

    /// Upper bound on the post-shutdown drain. Unset waits indefinitely.
    pub drain_secs: Option<u64>,
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Detach from the terminal and manage the lock file.
    pub enabled: bool,

    /// Lock file recording the running process id.
    pub pidfile: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pidfile: PathBuf::from(DEFAULT_PIDFILE),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Debug-level logging for this crate.
    pub verbose: bool,

    /// Log output format.
    pub log_format: LogFormat,

    /// Append logs to this file instead of stderr.
    pub log_file: Option<PathBuf>,

    /// Prometheus scrape endpoint. Disabled when unset.
    pub metrics_address: Option<String>,
}

/// Validated configuration, constructed once and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub workers: usize,
    pub backlog: u32,
    pub max_connections: usize,
    pub nameservers: Vec<SocketAddr>,
    pub idle_timeout: Duration,
    pub drain_timeout: Option<Duration>,
    pub daemon: bool,
    pub pidfile: PathBuf,
    pub secret: String,
}

impl TimeoutConfig {
    /// Effective idle timeout, falling back to the default for zero.
    pub fn idle(&self) -> Duration {
        match self.idle_secs {
            0 => Duration::from_secs(DEFAULT_IDLE_SECS),
            secs => Duration::from_secs(secs),
        }
    }
}

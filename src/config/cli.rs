//! Command-line interface.
//!
//! Flags mirror the historical xsocksd surface; values given here override
//! the optional TOML file.

use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use crate::config::loader::{load_config, ConfigError};
use crate::config::schema::{LogFormat, ServerConfig, MAX_NAMESERVERS};

/// Control request delivered to a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ControlSignal {
    /// Graceful stop: drain in-flight connections, then exit.
    Quit,
    /// Forced stop: exit immediately.
    Stop,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "xsocksd")]
#[command(about = "Encrypted SOCKS-style tunnel daemon", long_about = None)]
#[command(version, disable_version_flag = true)]
pub struct Args {
    /// Password of the server
    #[arg(short = 'k', long = "password", value_name = "PASSWORD")]
    pub password: Option<String>,

    /// Bind address:port (default: 0.0.0.0:1073)
    #[arg(short = 'l', long = "listen", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Worker threads
    #[arg(short = 'c', long = "concurrency", value_name = "N")]
    pub concurrency: Option<usize>,

    /// Name servers for the internal resolver (up to 4)
    #[arg(short = 'd', long = "dns", value_name = "ADDR")]
    pub nameservers: Vec<String>,

    /// Pid file path (default: ./xsocksd.pid)
    #[arg(short = 'p', long = "pidfile", value_name = "PATH")]
    pub pidfile: Option<PathBuf>,

    /// Idle connection timeout in seconds
    #[arg(short = 't', long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Send a signal to a running xsocksd: quit, stop
    #[arg(long = "signal", value_enum, value_name = "SIGNAL")]
    pub signal: Option<ControlSignal>,

    /// Non daemon mode
    #[arg(short = 'n', long = "no-daemon")]
    pub no_daemon: bool,

    /// Verbose mode
    #[arg(short = 'V', long = "verbose")]
    pub verbose: bool,

    /// TOML configuration file
    #[arg(short = 'f', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Listen backlog per socket
    #[arg(long, value_name = "N")]
    pub backlog: Option<u32>,

    /// Maximum concurrent connections per worker
    #[arg(long, value_name = "N")]
    pub max_connections: Option<usize>,

    /// Bound the shutdown drain, in seconds
    #[arg(long, value_name = "SECS")]
    pub drain_timeout: Option<u64>,

    /// Prometheus metrics endpoint address
    #[arg(long, value_name = "ADDR")]
    pub metrics_addr: Option<String>,

    /// Log format: pretty, json
    #[arg(long, value_enum, value_name = "FORMAT")]
    pub log_format: Option<CliLogFormat>,

    /// Append logs to this file
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Show version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliLogFormat {
    Pretty,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

impl Args {
    /// Nameservers beyond the supported count, which are dropped.
    pub fn ignored_nameservers(&self) -> &[String] {
        self.nameservers.get(MAX_NAMESERVERS..).unwrap_or(&[])
    }

    /// Build the raw server configuration: file first, then flag overrides.
    pub fn into_server_config(self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };

        if let Some(password) = self.password {
            config.password = Some(password);
        }
        if let Some(listen) = self.listen {
            config.listener.bind_address = listen;
        }
        if let Some(workers) = self.concurrency {
            config.listener.workers = workers;
        }
        if !self.nameservers.is_empty() {
            config.resolver.nameservers = self
                .nameservers
                .into_iter()
                .take(MAX_NAMESERVERS)
                .collect();
        }
        if let Some(pidfile) = self.pidfile {
            config.daemon.pidfile = pidfile;
        }
        if let Some(timeout) = self.timeout {
            config.timeouts.idle_secs = timeout;
        }
        if self.no_daemon {
            config.daemon.enabled = false;
        }
        if self.verbose {
            config.observability.verbose = true;
        }
        if let Some(backlog) = self.backlog {
            config.listener.backlog = backlog;
        }
        if let Some(max) = self.max_connections {
            config.listener.max_connections = max;
        }
        if let Some(drain) = self.drain_timeout {
            config.timeouts.drain_secs = Some(drain);
        }
        if let Some(addr) = self.metrics_addr {
            config.observability.metrics_address = Some(addr);
        }
        if let Some(format) = self.log_format {
            config.observability.log_format = format.into();
        }
        if let Some(path) = self.log_file {
            config.observability.log_file = Some(path);
        }

        Ok(config)
    }
}

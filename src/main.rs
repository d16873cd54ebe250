//! xsocksd
//!
//! Encrypted SOCKS-style tunnel daemon.
//!
//! # Architecture Overview
//!
//! ```text
//!                         ┌──────────────────────────────────────────────┐
//!                         │                  SUPERVISOR                  │
//!                         │  config → crypto → lock file → bind sockets  │
//!                         │                                              │
//!   SIGINT / SIGQUIT ────▶│  SignalRouter ──wake──┬──────┬──────┐        │
//!   SIGTERM (forced) ────▶│        ▲              ▼      ▼      ▼        │
//!                         │        │          worker 0  ...  worker N-1  │
//!                         │        │          (own loop, SO_REUSEPORT    │
//!                         │        │           TCP + UDP, resolver,      │
//!                         │        │           UDP relay, acceptor)      │
//!                         │        │              │      │      │        │
//!                         │  ShutdownBarrier ◀────┴──────┴──────┘        │
//!                         │        │                                     │
//!                         │        ▼                                     │
//!                         │  teardown → remove lock file → exit 0        │
//!                         └──────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use xsocksd::config::Args;
use xsocksd::lifecycle::{already_running, daemonize, signal_process, Supervisor};
use xsocksd::observability::{logging, metrics};
use xsocksd::Socks5Acceptor;

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            // Help and version go to stdout and are not failures.
            return if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };

    let signal = args.signal;
    let ignored = args.ignored_nameservers().to_vec();
    let raw = match args.into_server_config() {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("xsocksd: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(&raw.observability) {
        eprintln!("xsocksd: {e}");
        return ExitCode::FAILURE;
    }

    if let Some(signal) = signal {
        return match signal_process(signal, &raw.daemon.pidfile) {
            Ok(pid) => {
                tracing::info!(pid, signal = ?signal, "Signal sent");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to signal running instance");
                ExitCode::FAILURE
            }
        };
    }

    if !ignored.is_empty() {
        tracing::warn!(ignored = ?ignored, "Only the first 4 nameservers are used");
    }

    let supervisor = match Supervisor::bootstrap(&raw, Arc::new(Socks5Acceptor)) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    if supervisor.config().daemon {
        let pidfile = &supervisor.config().pidfile;
        if already_running(pidfile) {
            tracing::error!(pidfile = %pidfile.display(), "xsocksd is already running");
            return ExitCode::FAILURE;
        }
        if let Err(e) = daemonize() {
            tracing::error!(error = %e, "Failed to daemonize");
            return ExitCode::FAILURE;
        }
    }

    if let Some(addr) = &raw.observability.metrics_address {
        match addr.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::warn!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::warn!(metrics_address = %addr, "Failed to parse metrics address"),
        }
    }

    match supervisor.run() {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "xsocksd exited with error");
            ExitCode::FAILURE
        }
    }
}

//! Shared utilities for lifecycle and CLI integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;

use xsocksd::service::{BoxError, ConnectionAcceptor, ConnectionContext};
use xsocksd::{ServerConfig, ShutdownReport, Supervisor, SupervisorError, SupervisorHandle};

/// Acceptor that counts connections and closes them right away.
pub struct CountingAcceptor {
    accepted: Arc<AtomicUsize>,
}

impl ConnectionAcceptor for CountingAcceptor {
    fn accept(
        &self,
        _stream: TcpStream,
        _peer: SocketAddr,
        _ctx: ConnectionContext,
    ) -> BoxFuture<'static, Result<(), BoxError>> {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

pub fn counting_acceptor() -> (Arc<dyn ConnectionAcceptor>, Arc<AtomicUsize>) {
    let accepted = Arc::new(AtomicUsize::new(0));
    let acceptor = CountingAcceptor {
        accepted: Arc::clone(&accepted),
    };
    (Arc::new(acceptor), accepted)
}

/// Non-daemon config on an ephemeral loopback port.
pub fn server_config(workers: usize) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.password = Some("s3cret".into());
    config.listener.bind_address = "127.0.0.1:0".into();
    config.listener.workers = workers;
    config.daemon.enabled = false;
    config
}

/// Run a supervisor on its own thread, as the binary runs it on main.
pub fn spawn_supervisor(
    raw: &ServerConfig,
    acceptor: Arc<dyn ConnectionAcceptor>,
) -> (SupervisorHandle, JoinHandle<Result<ShutdownReport, SupervisorError>>) {
    let supervisor = Supervisor::bootstrap(raw, acceptor)
        .expect("bootstrap")
        .without_os_signals();
    let handle = supervisor.handle();
    let join = std::thread::spawn(move || supervisor.run());
    (handle, join)
}

/// Join a supervisor thread without blocking the test runtime.
pub async fn join_supervisor(
    join: JoinHandle<Result<ShutdownReport, SupervisorError>>,
) -> Result<ShutdownReport, SupervisorError> {
    tokio::time::timeout(
        Duration::from_secs(10),
        tokio::task::spawn_blocking(move || join.join().expect("supervisor thread panicked")),
    )
    .await
    .expect("supervisor did not stop in time")
    .expect("join task failed")
}

/// Reserve a loopback port that is free right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn xsocksd() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_xsocksd"));
    cmd.env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

/// Poll until something accepts TCP connections on `port`.
pub fn wait_listening(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Poll until nothing accepts TCP connections on `port`.
pub fn wait_closed(port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if std::net::TcpStream::connect(("127.0.0.1", port)).is_err() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

pub fn wait_exit(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}

pub fn wait_for_path(path: &Path, present: bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() == present {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

/// Poll until `path` holds a complete pid line.
pub fn wait_for_pid(path: &Path, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if contents.ends_with('\n') {
                if let Ok(pid) = contents.trim().parse() {
                    return Some(pid);
                }
            }
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    None
}

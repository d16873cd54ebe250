//! Binary-level tests: exit codes, OS signals and the `--signal` command.

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

mod common;

const STARTUP: Duration = Duration::from_secs(10);
const EXIT: Duration = Duration::from_secs(10);

fn start_foreground(workers: usize) -> (std::process::Child, u16) {
    let port = common::free_port();
    let child = common::xsocksd()
        .args(["-n", "-k", "s3cret", "-c", &workers.to_string()])
        .args(["-l", &format!("127.0.0.1:{port}")])
        .spawn()
        .unwrap();
    (child, port)
}

#[test]
fn help_and_version_exit_zero() {
    assert!(common::xsocksd().arg("-h").status().unwrap().success());
    assert!(common::xsocksd().arg("-v").status().unwrap().success());
}

#[test]
fn usage_errors_exit_one() {
    let status = common::xsocksd().arg("--bogus").status().unwrap();
    assert_eq!(status.code(), Some(1));

    let status = common::xsocksd().args(["--signal", "reload"]).status().unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn missing_secret_exits_one() {
    let status = common::xsocksd()
        .args(["-n", "-l", "127.0.0.1:0"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn invalid_bind_exits_one() {
    for workers in ["1", "4"] {
        let status = common::xsocksd()
            .args(["-n", "-k", "s3cret", "-c", workers, "-l", "nowhere"])
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(1), "workers={workers}");
    }
}

#[test]
fn sigint_stops_workers_gracefully() {
    for workers in [1, 4] {
        let (mut child, port) = start_foreground(workers);
        assert!(common::wait_listening(port, STARTUP));

        kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
        // A second interrupt during the drain must not change the outcome.
        let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGINT);

        let status = common::wait_exit(&mut child, EXIT).expect("xsocksd did not exit");
        assert!(status.success(), "workers={workers}: {status:?}");
    }
}

#[test]
fn sigint_is_logged_once_per_worker() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("xsocksd.log");
    let port = common::free_port();
    let mut child = common::xsocksd()
        .args(["-n", "-k", "s3cret", "-c", "4", "-l", &format!("127.0.0.1:{port}"), "--log-file"])
        .arg(&log)
        .spawn()
        .unwrap();
    assert!(common::wait_listening(port, STARTUP));

    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    let status = common::wait_exit(&mut child, EXIT).expect("xsocksd did not exit");
    assert!(status.success());

    let contents = std::fs::read_to_string(&log).unwrap();
    let count = |needle: &str| contents.lines().filter(|line| line.contains(needle)).count();
    assert_eq!(count("Worker started"), 4, "{contents}");
    assert_eq!(count("Received stop request"), 1, "{contents}");
    assert_eq!(count("Worker stopped"), 4, "{contents}");
}

#[test]
fn sigterm_skips_the_drain() {
    let (mut child, port) = start_foreground(4);
    assert!(common::wait_listening(port, STARTUP));

    // Never finishes the handshake, so a graceful drain waits on it.
    let _stalled = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    let pid = Pid::from_raw(child.id() as i32);

    kill(pid, Signal::SIGINT).unwrap();
    assert!(
        common::wait_exit(&mut child, Duration::from_millis(500)).is_none(),
        "graceful stop should wait for the open connection"
    );

    kill(pid, Signal::SIGTERM).unwrap();
    let status = common::wait_exit(&mut child, Duration::from_secs(5)).expect("SIGTERM did not stop xsocksd");
    assert!(status.success(), "{status:?}");
}

#[test]
fn signal_quit_reaches_recorded_pid() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("xsocksd.pid");

    let (mut child, port) = start_foreground(2);
    assert!(common::wait_listening(port, STARTUP));
    std::fs::write(&pidfile, format!("{}\n", child.id())).unwrap();

    let status = common::xsocksd()
        .args(["--signal", "quit", "-p"])
        .arg(&pidfile)
        .status()
        .unwrap();
    assert!(status.success());

    let status = common::wait_exit(&mut child, EXIT).expect("xsocksd did not exit");
    assert!(status.success());
}

#[test]
fn signal_stop_terminates_immediately() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("xsocksd.pid");

    let (mut child, port) = start_foreground(4);
    assert!(common::wait_listening(port, STARTUP));
    std::fs::write(&pidfile, format!("{}\n", child.id())).unwrap();

    let status = common::xsocksd()
        .args(["--signal", "stop", "-p"])
        .arg(&pidfile)
        .status()
        .unwrap();
    assert!(status.success());

    let status = common::wait_exit(&mut child, EXIT).expect("xsocksd did not exit");
    assert!(status.success());
}

#[test]
fn signal_without_lock_file_fails() {
    let dir = TempDir::new().unwrap();
    let status = common::xsocksd()
        .args(["--signal", "quit", "-p"])
        .arg(dir.path().join("missing.pid"))
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn daemon_refuses_live_lock_file() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("xsocksd.pid");
    std::fs::write(&pidfile, format!("{}\n", std::process::id())).unwrap();

    let port = common::free_port();
    let status = common::xsocksd()
        .args(["-k", "s3cret", "-c", "4", "-l", &format!("127.0.0.1:{port}"), "-p"])
        .arg(&pidfile)
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
    assert!(!common::wait_listening(port, Duration::from_millis(200)));
}

#[test]
fn daemon_round_trip_removes_lock_file() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("xsocksd.pid");
    let port = common::free_port();

    let status = common::xsocksd()
        .args(["-k", "s3cret", "-c", "4", "-l", &format!("127.0.0.1:{port}"), "-p"])
        .arg(&pidfile)
        .status()
        .unwrap();
    assert!(status.success(), "parent should exit after detaching");

    let pid = common::wait_for_pid(&pidfile, STARTUP).expect("daemon never wrote its pid");
    assert_ne!(pid, std::process::id() as i32);
    assert!(common::wait_listening(port, STARTUP));

    let status = common::xsocksd()
        .args(["--signal", "quit", "-p"])
        .arg(&pidfile)
        .status()
        .unwrap();
    assert!(status.success());

    assert!(common::wait_for_path(&pidfile, false, EXIT), "lock file left behind");
}

#[test]
fn daemon_forced_stop_removes_lock_file() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("xsocksd.pid");
    let port = common::free_port();

    let status = common::xsocksd()
        .args(["-k", "s3cret", "-c", "2", "-l", &format!("127.0.0.1:{port}"), "-p"])
        .arg(&pidfile)
        .status()
        .unwrap();
    assert!(status.success(), "parent should exit after detaching");

    common::wait_for_pid(&pidfile, STARTUP).expect("daemon never wrote its pid");
    assert!(common::wait_listening(port, STARTUP));

    let status = common::xsocksd()
        .args(["--signal", "stop", "-p"])
        .arg(&pidfile)
        .status()
        .unwrap();
    assert!(status.success());

    assert!(common::wait_for_path(&pidfile, false, EXIT), "lock file left behind");
    assert!(common::wait_closed(port, EXIT), "listener outlived the forced stop");
}

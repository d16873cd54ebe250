//! OS signal handling and stop-request routing.
//!
//! # Responsibilities
//! - Register signal handlers (SIGINT, SIGQUIT, SIGTERM) once at startup
//! - Translate signals and injected requests into [`StopRequest`]s
//! - Fan a graceful stop out to every worker exactly once
//! - Terminate immediately on a forced stop
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The routing decision is a plain state machine, tested without signals
//! - A forced stop stays available while a graceful drain is running

use std::io;
use std::path::PathBuf;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

use crate::lifecycle::pidfile;
use crate::lifecycle::shutdown::{Completion, ShutdownBarrier, WakeToken};
use crate::observability::metrics;

/// A request to stop the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    /// Drain in place and exit once every worker has completed.
    Graceful,
    /// Exit now. No drain, no barrier.
    Forced,
}

impl StopRequest {
    fn as_str(&self) -> &'static str {
        match self {
            StopRequest::Graceful => "graceful",
            StopRequest::Forced => "forced",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// Watching for stop requests.
    Armed,
    /// Graceful stop fanned out; waiting for the barrier.
    Triggered,
    /// Every worker completed.
    Disarmed,
}

/// What the router did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterAction {
    /// Woke this many workers.
    FanOut(usize),
    /// Request was a repeat or arrived after completion.
    Ignore,
    /// Caller must terminate the process.
    Terminate,
}

/// Where a graceful stop is delivered.
#[derive(Debug)]
pub enum ShutdownTargets {
    /// The single context sharing the router's loop.
    Local(WakeToken),
    /// One token per worker thread.
    Fanout(Vec<WakeToken>),
}

impl ShutdownTargets {
    fn wake(self) -> usize {
        match self {
            ShutdownTargets::Local(token) => {
                token.wake();
                1
            }
            ShutdownTargets::Fanout(tokens) => {
                let count = tokens.len();
                for token in tokens {
                    token.wake();
                }
                count
            }
        }
    }
}

/// Process signal streams, installed once.
#[derive(Debug)]
pub struct OsSignals {
    interrupt: Signal,
    quit: Signal,
    terminate: Signal,
}

impl OsSignals {
    /// Install the handlers. Must run inside a Tokio runtime context.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal and name it.
    pub async fn recv(&mut self) -> (StopRequest, &'static str) {
        tokio::select! {
            Some(()) = self.interrupt.recv() => (StopRequest::Graceful, "SIGINT"),
            Some(()) = self.quit.recv() => (StopRequest::Graceful, "SIGQUIT"),
            Some(()) = self.terminate.recv() => (StopRequest::Forced, "SIGTERM"),
            else => std::future::pending().await,
        }
    }
}

/// Routes stop requests to the workers.
#[derive(Debug)]
pub struct SignalRouter {
    state: RouterState,
    targets: Option<ShutdownTargets>,
    /// Lock file to remove on a forced stop, set only when daemonized.
    pidfile: Option<PathBuf>,
    signals: Option<OsSignals>,
}

impl SignalRouter {
    pub fn new(targets: ShutdownTargets, pidfile: Option<PathBuf>, signals: Option<OsSignals>) -> Self {
        Self {
            state: RouterState::Armed,
            targets: Some(targets),
            pidfile,
            signals,
        }
    }

    pub fn state(&self) -> RouterState {
        self.state
    }

    /// Apply one stop request.
    ///
    /// The first graceful request consumes the targets, so any later one is
    /// a no-op. Forced requests are never ignored before completion.
    pub fn handle(&mut self, request: StopRequest) -> RouterAction {
        match (request, self.state) {
            (_, RouterState::Disarmed) => RouterAction::Ignore,
            (StopRequest::Forced, _) => RouterAction::Terminate,
            (StopRequest::Graceful, RouterState::Triggered) => RouterAction::Ignore,
            (StopRequest::Graceful, RouterState::Armed) => {
                self.state = RouterState::Triggered;
                match self.targets.take() {
                    Some(targets) => RouterAction::FanOut(targets.wake()),
                    None => RouterAction::Ignore,
                }
            }
        }
    }

    /// Mark every worker complete. Later requests are ignored.
    pub fn disarm(&mut self) {
        self.state = RouterState::Disarmed;
        self.targets = None;
    }

    /// Serve stop requests until every worker has posted its completion.
    ///
    /// `control` carries requests injected through a supervisor handle.
    pub async fn watch(
        mut self,
        mut control: mpsc::UnboundedReceiver<StopRequest>,
        mut barrier: ShutdownBarrier,
    ) -> Vec<Completion> {
        while !barrier.is_complete() {
            let (request, source) = tokio::select! {
                completion = barrier.recv() => {
                    if completion.is_none() {
                        break;
                    }
                    continue;
                }
                (request, name) = next_signal(&mut self.signals) => (request, name),
                Some(request) = control.recv() => (request, "control"),
            };
            self.dispatch(request, source);
        }

        self.disarm();
        barrier.into_completions()
    }

    fn dispatch(&mut self, request: StopRequest, source: &'static str) {
        metrics::record_stop_request(request.as_str());
        match self.handle(request) {
            RouterAction::FanOut(workers) => {
                tracing::info!(source, workers, "Received stop request, shutting down workers");
            }
            RouterAction::Ignore => {
                tracing::debug!(source, request = request.as_str(), "Stop already in progress");
            }
            RouterAction::Terminate => {
                tracing::info!(source, "Received forced stop, exiting");
                if let Some(path) = &self.pidfile {
                    pidfile::delete_pidfile(path);
                }
                std::process::exit(0);
            }
        }
    }
}

async fn next_signal(signals: &mut Option<OsSignals>) -> (StopRequest, &'static str) {
    match signals {
        Some(signals) => signals.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::shutdown::{wake_pair, WorkerOutcome};
    use std::time::Duration;

    fn fanout(n: usize) -> (ShutdownTargets, Vec<crate::lifecycle::shutdown::WakeListener>) {
        let (tokens, listeners): (Vec<_>, Vec<_>) = (0..n).map(wake_pair).unzip();
        (ShutdownTargets::Fanout(tokens), listeners)
    }

    #[test]
    fn graceful_fans_out_once() {
        let (targets, _listeners) = fanout(4);
        let mut router = SignalRouter::new(targets, None, None);

        assert_eq!(router.handle(StopRequest::Graceful), RouterAction::FanOut(4));
        assert_eq!(router.state(), RouterState::Triggered);
        assert_eq!(router.handle(StopRequest::Graceful), RouterAction::Ignore);
        assert_eq!(router.state(), RouterState::Triggered);
    }

    #[test]
    fn forced_terminates_even_while_draining() {
        let (targets, _listeners) = fanout(2);
        let mut router = SignalRouter::new(targets, None, None);

        assert_eq!(router.handle(StopRequest::Forced), RouterAction::Terminate);
        assert_eq!(router.state(), RouterState::Armed);

        router.handle(StopRequest::Graceful);
        assert_eq!(router.handle(StopRequest::Forced), RouterAction::Terminate);
    }

    #[test]
    fn disarmed_ignores_everything() {
        let (token, _listener) = wake_pair(0);
        let mut router = SignalRouter::new(ShutdownTargets::Local(token), None, None);
        router.disarm();

        assert_eq!(router.handle(StopRequest::Graceful), RouterAction::Ignore);
        assert_eq!(router.handle(StopRequest::Forced), RouterAction::Ignore);
    }

    #[tokio::test]
    async fn local_target_wakes_single_context() {
        let (token, listener) = wake_pair(0);
        let mut router = SignalRouter::new(ShutdownTargets::Local(token), None, None);

        assert_eq!(router.handle(StopRequest::Graceful), RouterAction::FanOut(1));
        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn watch_returns_after_every_completion() {
        let (targets, listeners) = fanout(3);
        let (barrier, tokens) = ShutdownBarrier::new(3);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        for (listener, token) in listeners.into_iter().zip(tokens) {
            tokio::spawn(async move {
                listener.wait().await;
                token.complete(WorkerOutcome::Drained { served: 0 });
            });
        }

        let router = SignalRouter::new(targets, None, None);
        let watch = tokio::spawn(router.watch(control_rx, barrier));

        control_tx.send(StopRequest::Graceful).unwrap();
        control_tx.send(StopRequest::Graceful).unwrap();

        let completions = tokio::time::timeout(Duration::from_secs(2), watch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completions.len(), 3);
    }
}

//! Top-level orchestration.
//!
//! `bootstrap` does everything that can fail without touching the network:
//! validation, bind address resolution and crypto setup. `run` then takes
//! the lock file gate, binds sockets, starts the workers, routes stop
//! requests and waits on the shutdown barrier before tearing down.

use std::net::SocketAddr;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;

use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, watch};

use crate::config::{resolve_config, Config, ConfigError, ServerConfig};
use crate::lifecycle::pidfile::{Gate, PidFileError};
use crate::lifecycle::shutdown::{
    wake_pair, Completion, CompletionToken, ShutdownBarrier, WakeListener, WorkerOutcome,
};
use crate::lifecycle::signals::{OsSignals, ShutdownTargets, SignalRouter, StopRequest};
use crate::lifecycle::startup::Mode;
use crate::net::{bind_shared, BoundSockets, ListenerError};
use crate::service::{ConnectionAcceptor, CryptoError, RelayTable, SharedSecret};
use crate::worker::{Shared, WorkerContext, WorkerError};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("crypto initialization failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    PidFile(#[from] PidFileError),

    #[error(transparent)]
    Bind(#[from] ListenerError),

    #[error("failed to build supervisor loop: {0}")]
    Runtime(std::io::Error),

    #[error("failed to install signal handlers: {0}")]
    Signals(std::io::Error),

    #[error("failed to spawn worker {index}: {source}")]
    Spawn { index: usize, source: std::io::Error },

    #[error("worker {index} failed to start: {source}")]
    Worker { index: usize, source: WorkerError },
}

/// What happened between startup and teardown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub mode: Mode,
    pub local_addr: SocketAddr,
    pub completions: Vec<Completion>,
}

impl ShutdownReport {
    pub fn workers(&self) -> usize {
        self.mode.workers()
    }

    /// Completions that drained every connection.
    pub fn drained(&self) -> usize {
        self.completions
            .iter()
            .filter(|c| matches!(c.outcome, WorkerOutcome::Drained { .. }))
            .count()
    }
}

/// Control surface for a running supervisor.
///
/// Stop requests sent here are routed exactly like OS signals.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    control: mpsc::UnboundedSender<StopRequest>,
    ready: watch::Receiver<Option<SocketAddr>>,
}

impl SupervisorHandle {
    /// Request a graceful stop. Returns false once the supervisor is gone.
    pub fn graceful_stop(&self) -> bool {
        self.control.send(StopRequest::Graceful).is_ok()
    }

    /// Wait until every worker is listening. `None` if startup failed.
    pub async fn ready(&self) -> Option<SocketAddr> {
        let mut ready = self.ready.clone();
        let addr = ready.wait_for(Option::is_some).await.ok()?;
        *addr
    }
}

pub struct Supervisor {
    config: Config,
    secret: Arc<SharedSecret>,
    acceptor: Arc<dyn ConnectionAcceptor>,
    os_signals: bool,
    control_tx: mpsc::UnboundedSender<StopRequest>,
    control_rx: mpsc::UnboundedReceiver<StopRequest>,
    ready_tx: watch::Sender<Option<SocketAddr>>,
}

impl Supervisor {
    /// Validate the configuration and initialize crypto.
    ///
    /// No socket, thread or file is touched.
    pub fn bootstrap(raw: &ServerConfig, acceptor: Arc<dyn ConnectionAcceptor>) -> Result<Self, SupervisorError> {
        let config = resolve_config(raw)?;
        Self::from_config(config, acceptor)
    }

    pub fn from_config(config: Config, acceptor: Arc<dyn ConnectionAcceptor>) -> Result<Self, SupervisorError> {
        let secret = Arc::new(SharedSecret::init(&config.secret)?);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (ready_tx, _) = watch::channel(None);

        tracing::debug!(
            bind = %config.bind,
            workers = config.workers,
            daemon = config.daemon,
            "Supervisor bootstrapped"
        );

        Ok(Self {
            config,
            secret,
            acceptor,
            os_signals: true,
            control_tx,
            control_rx,
            ready_tx,
        })
    }

    /// Route only requests sent through [`SupervisorHandle`].
    pub fn without_os_signals(mut self) -> Self {
        self.os_signals = false;
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            control: self.control_tx.clone(),
            ready: self.ready_tx.subscribe(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        Mode::select(self.config.workers)
    }

    /// Run until every worker has completed after a graceful stop.
    pub fn run(self) -> Result<ShutdownReport, SupervisorError> {
        let mode = self.mode();
        let Supervisor {
            config,
            secret,
            acceptor,
            os_signals,
            control_tx,
            control_rx,
            ready_tx,
        } = self;
        // Keep the channel open for the router even if every handle is dropped.
        let _control_tx = control_tx;

        let mut gate = if config.daemon {
            Some(Gate::acquire(&config.pidfile)?)
        } else {
            None
        };

        let rt = Builder::new_current_thread()
            .enable_all()
            .thread_name("xsocksd-supervisor")
            .build()
            .map_err(SupervisorError::Runtime)?;
        let signals = if os_signals {
            let _enter = rt.enter();
            Some(OsSignals::install().map_err(SupervisorError::Signals)?)
        } else {
            None
        };

        tracing::info!(mode = %mode, bind = %config.bind, "Starting xsocksd");

        let relay_table = Arc::new(RelayTable::new());
        let shared = Shared {
            secret,
            relay_table: Arc::clone(&relay_table),
            acceptor,
        };
        let run = Run {
            config: &config,
            shared,
            signals,
            control: control_rx,
            ready: ready_tx,
            gate: gate.as_mut(),
        };

        let report = match mode {
            Mode::Single => run.single(&rt),
            Mode::Multi(n) => run.multi(&rt, n),
        }?;

        drop(rt);
        drop(relay_table);
        drop(gate);
        tracing::info!(workers = report.workers(), drained = report.drained(), "Shutdown complete");
        Ok(report)
    }
}

/// State threaded through one `run` call.
struct Run<'a> {
    config: &'a Config,
    shared: Shared,
    signals: Option<OsSignals>,
    control: mpsc::UnboundedReceiver<StopRequest>,
    ready: watch::Sender<Option<SocketAddr>>,
    gate: Option<&'a mut Gate>,
}

impl Run<'_> {
    fn forced_pidfile(&self) -> Option<std::path::PathBuf> {
        self.gate.as_ref().map(|gate| gate.path().to_path_buf())
    }

    /// Write the lock file and announce readiness.
    fn mark_ready(&mut self, addr: SocketAddr) -> Result<(), SupervisorError> {
        if let Some(gate) = self.gate.as_mut() {
            gate.record()?;
        }
        self.ready.send_replace(Some(addr));
        Ok(())
    }

    fn single(mut self, rt: &Runtime) -> Result<ShutdownReport, SupervisorError> {
        let sockets = BoundSockets::bind(self.config.bind, false, self.config.backlog).inspect_err(|e| {
            tracing::error!(error = %e, "Failed to bind listener");
        })?;

        let (barrier, mut tokens) = ShutdownBarrier::new(1);
        let completion = tokens.pop();
        let (token, stop) = wake_pair(0);
        let context = WorkerContext::new(0, sockets, self.config, self.shared.clone());

        rt.block_on(async move {
            let worker = context
                .start()
                .map_err(|source| SupervisorError::Worker { index: 0, source })?;
            let local_addr = worker.local_addr();
            self.mark_ready(local_addr)?;

            let router = SignalRouter::new(ShutdownTargets::Local(token), self.forced_pidfile(), self.signals.take());
            let serve = async move {
                let outcome = worker.serve(stop).await;
                if let Some(completion) = completion {
                    completion.complete(outcome);
                }
            };
            let ((), completions) = tokio::join!(serve, router.watch(self.control, barrier));

            Ok(ShutdownReport {
                mode: Mode::Single,
                local_addr,
                completions,
            })
        })
    }

    fn multi(mut self, rt: &Runtime, n: usize) -> Result<ShutdownReport, SupervisorError> {
        let pairs = bind_shared(self.config.bind, n, self.config.backlog).inspect_err(|e| {
            tracing::error!(error = %e, workers = n, "Failed to bind listeners");
        })?;

        let (barrier, completions) = ShutdownBarrier::new(n);
        let (tokens, listeners): (Vec<_>, Vec<_>) = (0..n).map(wake_pair).unzip();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let config = self.config;

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(n);
            let mut failure = None;

            let workers = pairs.into_iter().zip(listeners).zip(completions).enumerate();
            for (index, ((sockets, stop), completion)) in workers {
                let context = WorkerContext::new(index, sockets, config, self.shared.clone());
                let ready = ready_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("xsocksd-worker-{index}"))
                    .spawn_scoped(scope, move || run_worker(context, stop, completion, ready));
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(source) => {
                        tracing::error!(worker = index, error = %source, "Failed to spawn worker");
                        failure = Some(SupervisorError::Spawn { index, source });
                        break;
                    }
                }
            }
            drop(ready_tx);

            let mut local_addr = None;
            let mut reported = vec![false; handles.len()];
            // Every sender is dropped once its worker has reported, so a
            // worker that dies early ends this loop instead of hanging it.
            while let Ok((index, started)) = ready_rx.recv() {
                reported[index] = true;
                match started {
                    Ok(addr) => local_addr = local_addr.or(Some(addr)),
                    Err(source) => {
                        tracing::error!(worker = index, error = %source, "Worker failed to start");
                        if failure.is_none() {
                            failure = Some(SupervisorError::Worker { index, source });
                        }
                    }
                }
            }
            if failure.is_none() {
                if let Some(index) = reported.iter().position(|done| !done) {
                    failure = Some(SupervisorError::Worker {
                        index,
                        source: WorkerError::Exited,
                    });
                }
            }

            let started = match (failure, local_addr) {
                (Some(e), _) => Err(e),
                (None, Some(addr)) => self.mark_ready(addr).map(|()| addr),
                (None, None) => Err(SupervisorError::Worker {
                    index: 0,
                    source: WorkerError::Exited,
                }),
            };

            let result = match started {
                Ok(local_addr) => {
                    let router = SignalRouter::new(
                        ShutdownTargets::Fanout(tokens),
                        self.forced_pidfile(),
                        self.signals.take(),
                    );
                    let completions = rt.block_on(router.watch(self.control, barrier));
                    Ok(ShutdownReport {
                        mode: Mode::Multi(n),
                        local_addr,
                        completions,
                    })
                }
                Err(e) => {
                    for token in tokens {
                        token.wake();
                    }
                    let completions = rt.block_on(barrier.wait());
                    tracing::debug!(completed = completions.len(), "Workers stopped after failed startup");
                    Err(e)
                }
            };

            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("Worker thread panicked");
                }
            }
            result
        })
    }
}

/// Body of one worker thread: build a loop, start, serve, post completion.
fn run_worker(
    context: WorkerContext<'_>,
    stop: WakeListener,
    completion: CompletionToken,
    ready: std_mpsc::Sender<(usize, Result<SocketAddr, WorkerError>)>,
) {
    let index = context.index();
    let rt = match Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send((index, Err(WorkerError::Runtime(e))));
            completion.complete(WorkerOutcome::Aborted);
            return;
        }
    };

    let outcome = rt.block_on(async move {
        let worker = match context.start() {
            Ok(worker) => {
                let _ = ready.send((index, Ok(worker.local_addr())));
                worker
            }
            Err(e) => {
                let _ = ready.send((index, Err(e)));
                return WorkerOutcome::Aborted;
            }
        };
        drop(ready);
        worker.serve(stop).await
    });

    // Dropping the loop closes whatever the drain left behind.
    drop(rt);
    completion.complete(outcome);
}

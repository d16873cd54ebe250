//! Shutdown coordination between the supervisor and its workers.
//!
//! Two primitives cross threads:
//! - a one-shot [`WakeToken`] per worker meaning "begin local shutdown now"
//! - a [`ShutdownBarrier`] that counts one [`Completion`] per worker
//!
//! Both are built so misuse is hard to express: a token can only fire once
//! because waking consumes it, and a [`CompletionToken`] posts exactly once,
//! either explicitly or as [`WorkerOutcome::Aborted`] when dropped.

use std::collections::HashSet;

use tokio::sync::{mpsc, oneshot};

/// Sending half of a worker's wake channel. Held by the signal router.
#[derive(Debug)]
pub struct WakeToken {
    worker: usize,
    tx: oneshot::Sender<()>,
}

/// Receiving half of a worker's wake channel. Held by the worker.
#[derive(Debug)]
pub struct WakeListener {
    rx: oneshot::Receiver<()>,
}

/// Create the wake channel for one worker.
pub fn wake_pair(worker: usize) -> (WakeToken, WakeListener) {
    let (tx, rx) = oneshot::channel();
    (WakeToken { worker, tx }, WakeListener { rx })
}

impl WakeToken {
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Tell the worker to begin local shutdown.
    pub fn wake(self) {
        // The worker may already be gone after a failed start.
        let _ = self.tx.send(());
    }
}

impl WakeListener {
    /// Resolves once the token fires or is dropped.
    pub async fn wait(self) {
        let _ = self.rx.await;
    }
}

/// How a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Every in-flight connection finished.
    Drained { served: u64 },
    /// The drain timeout expired with connections still open.
    TimedOut { served: u64, abandoned: u64 },
    /// The worker never reached its loop, or its thread unwound.
    Aborted,
}

/// One worker's completion as seen by the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub worker: usize,
    pub outcome: WorkerOutcome,
}

/// Posts a worker's completion to the barrier exactly once.
#[derive(Debug)]
pub struct CompletionToken {
    worker: usize,
    tx: Option<mpsc::UnboundedSender<Completion>>,
}

impl CompletionToken {
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn complete(mut self, outcome: WorkerOutcome) {
        self.post(outcome);
    }

    fn post(&mut self, outcome: WorkerOutcome) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Completion {
                worker: self.worker,
                outcome,
            });
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        self.post(WorkerOutcome::Aborted);
    }
}

/// Counting completion signal for exactly `expected` workers.
#[derive(Debug)]
pub struct ShutdownBarrier {
    expected: usize,
    rx: mpsc::UnboundedReceiver<Completion>,
    seen: HashSet<usize>,
    completions: Vec<Completion>,
}

impl ShutdownBarrier {
    /// Create a barrier and the tokens its workers post through.
    ///
    /// Token `i` belongs to worker `i`.
    pub fn new(expected: usize) -> (Self, Vec<CompletionToken>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tokens = (0..expected)
            .map(|worker| CompletionToken {
                worker,
                tx: Some(tx.clone()),
            })
            .collect();
        let barrier = Self {
            expected,
            rx,
            seen: HashSet::with_capacity(expected),
            completions: Vec::with_capacity(expected),
        };
        (barrier, tokens)
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn completed(&self) -> usize {
        self.completions.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completions.len() == self.expected
    }

    /// Wait for the next completion. Returns `None` once the barrier is full.
    pub async fn recv(&mut self) -> Option<Completion> {
        while !self.is_complete() {
            let completion = self.rx.recv().await?;
            if !self.seen.insert(completion.worker) {
                tracing::warn!(worker = completion.worker, "Duplicate worker completion ignored");
                continue;
            }
            tracing::debug!(
                worker = completion.worker,
                outcome = ?completion.outcome,
                completed = self.completions.len() + 1,
                expected = self.expected,
                "Worker completion"
            );
            self.completions.push(completion);
            return Some(completion);
        }
        None
    }

    /// Wait for every outstanding completion.
    pub async fn wait(mut self) -> Vec<Completion> {
        while self.recv().await.is_some() {}
        self.into_completions()
    }

    /// Completions observed so far, in arrival order.
    pub fn into_completions(self) -> Vec<Completion> {
        self.completions
    }
}

//! Shutdown coordinator
//!
//! Owns the worker threads, the shared cancellation token and the completion
//! channel. Shutdown is two steps:
//! 1. [`ShutdownCoordinator::request_shutdown`] sets the token (once)
//! 2. [`ShutdownCoordinator::await_all_stopped`] blocks until every started
//!    worker has sent its exit report, then joins the threads

use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::cancellation::CancellationToken;
use crate::config::{ShutdownConfig, COMPLETION_POLL_INTERVAL};
use crate::error::{Result, ShutdownError};
use crate::signal::SignalListener;
use crate::worker::{
    CompletionGuard, LogCounter, Pacing, UnitOfWork, Worker, WorkerExit, WorkerState,
    WorkerStatus,
};

/// Outcome of a completed wait
#[derive(Debug, Clone)]
pub struct ShutdownSummary {
    /// One report per worker, in the order they exited
    pub exits: Vec<WorkerExit>,
    /// Time from the shutdown request (or the start of the wait) to the last report
    pub elapsed: Duration,
}

impl ShutdownSummary {
    pub fn total_iterations(&self) -> u64 {
        self.exits.iter().map(|exit| exit.iterations).sum()
    }

    pub fn panicked(&self) -> impl Iterator<Item = &WorkerExit> {
        self.exits.iter().filter(|exit| exit.panicked)
    }
}

/// Coordinator side of a worker
struct WorkerHandle {
    name: String,
    status: Arc<WorkerStatus>,
    thread: Option<thread::JoinHandle<u64>>,
}

/// Starts workers, broadcasts cancellation and waits for them to exit
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    token: CancellationToken,
    completion_tx: Sender<WorkerExit>,
    completion_rx: Receiver<WorkerExit>,
    workers: Vec<WorkerHandle>,
    exits: Vec<WorkerExit>,
    /// Workers started but not yet reported
    outstanding: usize,
    requested_at: OnceLock<Instant>,
    /// When the outstanding count last reached zero
    last_exit_at: Option<Instant>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("workers", &self.workers.len())
            .field("outstanding", &self.outstanding)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        let (completion_tx, completion_rx) = unbounded();
        Self {
            config,
            token: CancellationToken::new(),
            completion_tx,
            completion_rx,
            workers: Vec::new(),
            exits: Vec::new(),
            outstanding: 0,
            requested_at: OnceLock::new(),
            last_exit_at: None,
        }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    /// Clone of the token shared by all workers
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of started workers that have not reported yet
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn worker_states(&self) -> Vec<(String, WorkerState)> {
        self.workers
            .iter()
            .map(|worker| (worker.name.clone(), worker.status.state()))
            .collect()
    }

    /// Start one worker thread running `work`
    pub fn spawn_worker(&mut self, name: impl Into<String>, work: impl UnitOfWork) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(ShutdownError::ShutdownRequested);
        }

        let name = name.into();
        let status = Arc::new(WorkerStatus::new());
        let guard = CompletionGuard::new(name.clone(), status.clone(), self.completion_tx.clone());
        let worker = Worker::new(
            name.clone(),
            self.token.clone(),
            Pacing::new(self.config.max_sleep),
            work,
            status.clone(),
        );

        // Counted before the thread exists. If the spawn fails the closure,
        // and with it the unstarted guard, is dropped and its report only
        // rebalances the count.
        self.outstanding += 1;

        let thread = thread::Builder::new()
            .name(format!("coop-worker-{}", name))
            .spawn(move || {
                let mut guard = guard;
                guard.mark_started();
                worker.run()
            })
            .map_err(|source| ShutdownError::Spawn {
                name: name.clone(),
                source,
            })?;

        tracing::debug!("Spawned worker {}", name);
        self.workers.push(WorkerHandle {
            name,
            status,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Start `count` workers named "1", "2", ... running [`LogCounter`]
    pub fn spawn_workers(&mut self, count: usize) -> Result<()> {
        let first = self.workers.len() + 1;
        for id in first..first + count {
            self.spawn_worker(id.to_string(), LogCounter)?;
        }
        tracing::info!("Started {} workers", count);
        Ok(())
    }

    /// Broadcast cancellation to every worker. Repeated calls are no-ops.
    pub fn request_shutdown(&self) {
        if self.token.cancel() {
            let _ = self.requested_at.set(Instant::now());
            tracing::info!(
                "Shutdown requested, waiting on {} workers",
                self.outstanding
            );
        } else {
            tracing::debug!("Shutdown already requested");
        }
    }

    /// Block until every started worker has reported, with no timeout
    pub fn await_all_stopped(&mut self) -> ShutdownSummary {
        let started = Instant::now();

        while self.outstanding > 0 {
            match self.completion_rx.recv() {
                Ok(exit) => self.record_exit(exit),
                // We hold a sender ourselves, so this cannot happen
                Err(_) => break,
            }
        }

        self.join_workers();
        self.summary(started)
    }

    /// Like [`Self::await_all_stopped`], but give up after `timeout`.
    ///
    /// Reports that arrive before the deadline are kept, so calling either
    /// wait again afterwards only waits for the remaining workers.
    pub fn await_all_stopped_timeout(&mut self, timeout: Duration) -> Result<ShutdownSummary> {
        let started = Instant::now();
        let Some(deadline) = started.checked_add(timeout) else {
            // Too far out to represent, which is as good as no bound at all
            return Ok(self.await_all_stopped());
        };

        while self.outstanding > 0 {
            let now = Instant::now();
            if now >= deadline {
                let remaining = self.running_workers();
                tracing::warn!(
                    "Gave up waiting after {:?}, still running: {:?}",
                    timeout,
                    remaining
                );
                return Err(ShutdownError::Timeout {
                    waited: timeout,
                    remaining,
                });
            }

            let slice = (deadline - now).min(COMPLETION_POLL_INTERVAL);
            match self.completion_rx.recv_timeout(slice) {
                Ok(exit) => self.record_exit(exit),
                Err(RecvTimeoutError::Timeout) => {
                    tracing::debug!(
                        outstanding = self.outstanding,
                        "Still waiting on {:?}",
                        self.running_workers()
                    );
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.join_workers();
        Ok(self.summary(started))
    }

    /// Block on `listener` until a termination signal, then shut down
    pub fn run_until_signal(&mut self, listener: &SignalListener) -> Result<ShutdownSummary> {
        let signal = listener.wait()?;
        tracing::info!("Received signal {}, stopping workers", signal);

        self.request_shutdown();
        let summary = match self.config.shutdown_timeout {
            Some(timeout) => self.await_all_stopped_timeout(timeout)?,
            None => self.await_all_stopped(),
        };

        tracing::info!(
            workers = summary.exits.len(),
            elapsed = ?summary.elapsed,
            "All workers have finished exiting."
        );
        Ok(summary)
    }

    fn record_exit(&mut self, exit: WorkerExit) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 {
            self.last_exit_at = Some(Instant::now());
        }

        if !exit.started {
            tracing::debug!("Worker {} never started, not counted as an exit", exit.name);
            return;
        }
        if exit.panicked {
            tracing::error!(
                "Worker {} panicked after {} iterations",
                exit.name,
                exit.iterations
            );
        } else {
            tracing::debug!(
                "Worker {} stopped after {} iterations ({} outstanding)",
                exit.name,
                exit.iterations,
                self.outstanding
            );
        }
        self.exits.push(exit);
    }

    fn running_workers(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|worker| worker.status.state() == WorkerState::Running)
            .map(|worker| worker.name.clone())
            .collect()
    }

    /// Join threads whose workers have all reported
    fn join_workers(&mut self) {
        for worker in &mut self.workers {
            let Some(handle) = worker.thread.take() else {
                continue;
            };
            match handle.join() {
                Ok(iterations) => {
                    tracing::trace!("Joined worker {} ({} iterations)", worker.name, iterations);
                }
                Err(_) => {
                    tracing::trace!("Joined worker {} after panic", worker.name);
                }
            }
        }
    }

    fn summary(&self, wait_started: Instant) -> ShutdownSummary {
        let since = self.requested_at.get().copied().unwrap_or(wait_started);
        let last = self.last_exit_at.unwrap_or_else(Instant::now);
        ShutdownSummary {
            exits: self.exits.clone(),
            elapsed: last.saturating_duration_since(since),
        }
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        if self.outstanding > 0 && !self.token.is_cancelled() {
            tracing::warn!("Coordinator dropped without explicit shutdown");
            self.request_shutdown();
        }
    }
}

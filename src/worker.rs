//! Background workers
//!
//! A worker runs on its own thread and loops over a unit of work until the
//! shared [`CancellationToken`] is set. The token is checked once per
//! iteration, before the work, so a worker sleeping between iterations
//! finishes its sleep before it notices the request.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use rand::Rng;

use crate::cancellation::CancellationToken;

/// Worker lifecycle. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Running = 0,
    Stopped = 1,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Running,
            _ => WorkerState::Stopped,
        }
    }
}

/// Live view of a worker, shared between its thread and the coordinator
#[derive(Debug)]
pub struct WorkerStatus {
    state: AtomicU8,
    iterations: AtomicU64,
}

impl WorkerStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(WorkerState::Running as u8),
            iterations: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of completed work iterations
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    fn mark_stopped(&self) {
        self.state
            .store(WorkerState::Stopped as u8, Ordering::Release);
    }
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of per-iteration business logic
pub trait UnitOfWork: Send + 'static {
    fn perform(&mut self, worker: &str, iteration: u64);
}

impl<F> UnitOfWork for F
where
    F: FnMut(&str, u64) + Send + 'static,
{
    fn perform(&mut self, worker: &str, iteration: u64) {
        self(worker, iteration)
    }
}

/// Default work: log the iteration counter
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCounter;

impl UnitOfWork for LogCounter {
    fn perform(&mut self, worker: &str, iteration: u64) {
        tracing::info!(worker, iteration, "worker {}: {}", worker, iteration);
    }
}

/// Bounded random pause between iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    max_sleep: Duration,
}

impl Pacing {
    pub fn new(max_sleep: Duration) -> Self {
        Self { max_sleep }
    }

    pub fn max_sleep(&self) -> Duration {
        self.max_sleep
    }

    /// Pick a delay uniformly from `[0, max_sleep)` at millisecond resolution
    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let max_ms = u64::try_from(self.max_sleep.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..max_ms))
    }

    fn pause<R: Rng + ?Sized>(&self, rng: &mut R) {
        let delay = self.next_delay(rng);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

/// Report sent once by every worker when it exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub name: String,
    pub iterations: u64,
    /// The worker thread was unwinding from a panic when it reported
    pub panicked: bool,
    /// The guard reached a running worker thread. `false` when the thread
    /// could not be spawned.
    pub started: bool,
}

/// Completion handle owned by a worker thread.
///
/// Dropping it marks the worker stopped and sends its [`WorkerExit`]. Since
/// the guard is dropped exactly once, on normal return or during unwinding,
/// each worker reports exactly once.
#[derive(Debug)]
pub struct CompletionGuard {
    name: String,
    status: Arc<WorkerStatus>,
    sender: Sender<WorkerExit>,
    started: bool,
}

impl CompletionGuard {
    pub(crate) fn new(name: String, status: Arc<WorkerStatus>, sender: Sender<WorkerExit>) -> Self {
        Self {
            name,
            status,
            sender,
            started: false,
        }
    }

    /// Called first thing on the worker thread
    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.status.mark_stopped();

        let exit = WorkerExit {
            name: std::mem::take(&mut self.name),
            iterations: self.status.iterations(),
            panicked: thread::panicking(),
            started: self.started,
        };
        if let Err(e) = self.sender.send(exit) {
            // Receiver gone means nobody is waiting any more
            tracing::trace!("Dropping completion report for {}", e.0.name);
        }
    }
}

/// A single background worker
pub struct Worker {
    name: String,
    token: CancellationToken,
    pacing: Pacing,
    work: Box<dyn UnitOfWork>,
    status: Arc<WorkerStatus>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("pacing", &self.pacing)
            .field("work", &"<UnitOfWork>")
            .field("status", &self.status)
            .finish()
    }
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        token: CancellationToken,
        pacing: Pacing,
        work: impl UnitOfWork,
        status: Arc<WorkerStatus>,
    ) -> Self {
        Self {
            name: name.into(),
            token,
            pacing,
            work: Box::new(work),
            status,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loop until cancellation is observed. Returns the iteration count.
    pub fn run(mut self) -> u64 {
        tracing::debug!(worker = %self.name, "worker {} started", self.name);

        let mut rng = rand::thread_rng();
        let mut iteration = 0u64;
        loop {
            if self.token.is_cancelled() {
                tracing::info!(
                    worker = %self.name,
                    iterations = iteration,
                    "worker {}: received cancel, exiting",
                    self.name
                );
                return iteration;
            }

            self.work.perform(&self.name, iteration);
            iteration += 1;
            self.status.iterations.store(iteration, Ordering::Relaxed);
            tracing::trace!(worker = %self.name, iteration, "work unit done");

            self.pacing.pause(&mut rng);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::AtomicUsize;

    fn status() -> Arc<WorkerStatus> {
        Arc::new(WorkerStatus::new())
    }

    #[test]
    fn test_new_status_is_running() {
        let status = WorkerStatus::new();
        assert_eq!(status.state(), WorkerState::Running);
        assert_eq!(status.iterations(), 0);
    }

    #[test]
    fn test_pacing_stays_below_bound() {
        let pacing = Pacing::new(Duration::from_millis(50));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            assert!(pacing.next_delay(&mut rng) < Duration::from_millis(50));
        }
    }

    #[test]
    fn test_zero_pacing_never_sleeps() {
        let pacing = Pacing::new(Duration::ZERO);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(pacing.next_delay(&mut rng), Duration::ZERO);
    }

    #[test]
    fn test_cancelled_before_start_does_no_work() {
        let token = CancellationToken::new();
        token.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let worker = Worker::new(
            "w",
            token,
            Pacing::new(Duration::ZERO),
            move |_: &str, _: u64| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
            status(),
        );

        assert_eq!(worker.run(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_worker_observes_cancel_between_iterations() {
        let token = CancellationToken::new();
        let cancel_from_work = token.clone();
        let status = status();

        // Cancel from inside the third unit of work; the loop must still
        // finish that iteration before it sees the flag.
        let worker = Worker::new(
            "w",
            token,
            Pacing::new(Duration::ZERO),
            move |_: &str, iteration: u64| {
                if iteration == 2 {
                    cancel_from_work.cancel();
                }
            },
            status.clone(),
        );

        assert_eq!(worker.run(), 3);
        assert_eq!(status.iterations(), 3);
    }

    #[test]
    fn test_guard_reports_once_on_drop() {
        let (tx, rx) = unbounded();
        let status = status();
        status.iterations.store(4, Ordering::Relaxed);

        let guard = CompletionGuard::new("w".to_string(), status.clone(), tx);
        assert_eq!(status.state(), WorkerState::Running);
        drop(guard);

        assert_eq!(status.state(), WorkerState::Stopped);
        let exit = rx.try_recv().unwrap();
        assert_eq!(
            exit,
            WorkerExit {
                name: "w".to_string(),
                iterations: 4,
                panicked: false,
                started: false,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_started_guard_reports_started() {
        let (tx, rx) = unbounded();
        let mut guard = CompletionGuard::new("w".to_string(), status(), tx);

        thread::spawn(move || {
            guard.mark_started();
        })
        .join()
        .unwrap();

        let exit = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(exit.started);
        assert!(!exit.panicked);
    }

    #[test]
    fn test_guard_reports_panic() {
        let (tx, rx) = unbounded();
        let status = status();
        let guard = CompletionGuard::new("p".to_string(), status, tx);

        let result = thread::spawn(move || {
            let _guard = guard;
            panic!("work failed");
        })
        .join();

        assert!(result.is_err());
        let exit = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(exit.panicked);
    }

    #[test]
    fn test_guard_without_receiver_does_not_panic() {
        let (tx, rx) = unbounded();
        drop(rx);
        drop(CompletionGuard::new("w".to_string(), status(), tx));
    }
}

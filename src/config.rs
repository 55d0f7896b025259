//! Configuration for shutdown coordination
//!
//! This module contains the tunable parameters that affect worker pacing and
//! how long the coordinator is willing to wait for workers to exit.

use std::time::Duration;

use crate::error::{Result, ShutdownError};

/// Number of workers started when nothing else is configured
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Upper bound (exclusive) of the random sleep between worker iterations
///
/// This is also the worst-case reaction time of a worker to a shutdown
/// request, since cancellation is only observed between iterations.
pub const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(5);

/// How often a bounded wait wakes up to log workers that are still running
///
/// Only used by [`crate::ShutdownCoordinator::await_all_stopped_timeout`].
/// A smaller value gives more progress logging during a slow shutdown.
pub const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Worker and shutdown settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownConfig {
    /// Number of workers to start
    pub workers: usize,
    /// Exclusive upper bound of each worker's sleep between iterations
    pub max_sleep: Duration,
    /// Bound on the wait after a shutdown request; `None` waits forever
    pub shutdown_timeout: Option<Duration>,
}

impl ShutdownConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = max_sleep;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Reject settings the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ShutdownError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }
        if self.shutdown_timeout == Some(Duration::ZERO) {
            return Err(ShutdownError::InvalidConfig(
                "shutdown timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKER_COUNT,
            max_sleep: DEFAULT_MAX_SLEEP,
            shutdown_timeout: None,
        }
    }
}

/// Settings for the process signal listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalOptions {
    /// Signals that request shutdown
    pub signals: Vec<i32>,
    /// Exit the process with status 1 when a second signal arrives
    pub force_exit_on_repeat: bool,
}

impl Default for SignalOptions {
    fn default() -> Self {
        use signal_hook::consts::signal::{SIGINT, SIGTERM};

        Self {
            signals: vec![SIGINT, SIGTERM],
            force_exit_on_repeat: false,
        }
    }
}

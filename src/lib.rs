//! coop-shutdown: cooperative shutdown of background worker threads
//!
//! This crate provides a small supervision layer for long-running threads:
//! - One OS thread per worker, each looping over a unit of work
//! - A shared cancellation token, set once by the coordinator
//! - Completion tracking so the coordinator can block until every worker exits
//! - A dedicated signal thread that turns SIGINT/SIGTERM into a shutdown request
//!
//! Cancellation is cooperative. A worker checks the token between iterations
//! only, so it may take up to one full sleep interval to notice a request.
//!
//! ## Example
//!
//! ```rust,no_run
//! use coop_shutdown::{ShutdownConfig, ShutdownCoordinator};
//!
//! let mut coordinator = ShutdownCoordinator::new(ShutdownConfig::default());
//! coordinator.spawn_workers(3).unwrap();
//!
//! // ... later, from any thread holding the coordinator:
//! coordinator.request_shutdown();
//! let summary = coordinator.await_all_stopped();
//! assert_eq!(summary.exits.len(), 3);
//! ```
//!
//! # Shutdown via Signals
//!
//! [`signal::SignalListener`] installs handlers for SIGINT and SIGTERM and
//! forwards them to a channel. [`ShutdownCoordinator::run_until_signal`] ties
//! the two together: block until a signal arrives, cancel, then wait.
//!
//! ```rust,no_run
//! use coop_shutdown::signal::SignalListener;
//! use coop_shutdown::{ShutdownConfig, SignalOptions, ShutdownCoordinator};
//!
//! let listener = SignalListener::install(&SignalOptions::default()).unwrap();
//! let mut coordinator = ShutdownCoordinator::new(ShutdownConfig::default());
//! coordinator.spawn_workers(3).unwrap();
//! coordinator.run_until_signal(&listener).unwrap();
//! ```

pub mod cancellation;
pub mod config;
pub mod coordinator;
pub mod signal;
pub mod worker;

// Re-export core types
pub use cancellation::CancellationToken;
pub use config::{ShutdownConfig, SignalOptions};
pub use coordinator::{ShutdownCoordinator, ShutdownSummary};
pub use worker::{LogCounter, Pacing, UnitOfWork, WorkerExit, WorkerState};

/// Error types for shutdown coordination
pub mod error {
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum ShutdownError {
        #[error("Failed to install signal handler: {0}")]
        SignalInstall(#[source] std::io::Error),

        #[error("Failed to spawn worker {name}: {source}")]
        Spawn {
            name: String,
            #[source]
            source: std::io::Error,
        },

        #[error("Shutdown already requested, refusing to start new workers")]
        ShutdownRequested,

        #[error("Invalid configuration: {0}")]
        InvalidConfig(String),

        #[error("Workers still running after {waited:?}: {remaining:?}")]
        Timeout {
            waited: Duration,
            remaining: Vec<String>,
        },

        #[error("Signal listener closed before a signal was received")]
        SignalListenerClosed,
    }

    pub type Result<T> = std::result::Result<T, ShutdownError>;
}

//! Signal handling module
//!
//! This module turns process termination signals into shutdown requests using
//! the signal-hook crate. It spawns a dedicated thread that listens for the
//! configured signals (SIGINT and SIGTERM by default) and forwards each one to
//! a channel the supervising thread can block on.
//!
//! On the first signal the listener only forwards it. On a repeated signal it
//! either forwards it again or, with `force_exit_on_repeat`, exits the
//! process with status 1.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use signal_hook::iterator::{Handle, Signals};

use crate::config::SignalOptions;
use crate::error::{Result, ShutdownError};

/// Listens for termination signals on a dedicated thread
pub struct SignalListener {
    receiver: Receiver<i32>,
    handle: Handle,
    thread: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for SignalListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalListener")
            .field("pending", &self.receiver.len())
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl SignalListener {
    /// Register handlers for `options.signals` and start the listener thread
    pub fn install(options: &SignalOptions) -> Result<Self> {
        let mut signals = Signals::new(&options.signals).map_err(ShutdownError::SignalInstall)?;
        let handle = signals.handle();
        let (sender, receiver) = unbounded();
        let force_exit_on_repeat = options.force_exit_on_repeat;

        let thread = thread::Builder::new()
            .name("coop-signal".to_string())
            .spawn(move || {
                let mut received = 0usize;
                for signal in signals.forever() {
                    received += 1;
                    if received == 1 {
                        tracing::info!("Received signal {} for graceful shutdown", signal);
                    } else if force_exit_on_repeat {
                        tracing::warn!("Received second signal {}, forcing exit", signal);
                        std::process::exit(1);
                    } else {
                        tracing::warn!("Received signal {} while already shutting down", signal);
                    }

                    if sender.send(signal).is_err() {
                        break;
                    }
                }
                tracing::debug!("Signal listener stopped");
            })
            .map_err(ShutdownError::SignalInstall)?;

        tracing::debug!("Listening for signals {:?}", options.signals);
        Ok(Self {
            receiver,
            handle,
            thread: Some(thread),
        })
    }

    /// Block until a signal arrives and return its number
    pub fn wait(&self) -> Result<i32> {
        self.receiver
            .recv()
            .map_err(|_| ShutdownError::SignalListenerClosed)
    }

    /// Block until a signal arrives or `timeout` passes.
    ///
    /// `Ok(None)` means the timeout passed; a listener thread that has
    /// stopped is reported as [`ShutdownError::SignalListenerClosed`].
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<i32>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(signal) => Ok(Some(signal)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ShutdownError::SignalListenerClosed),
        }
    }

    /// Stop listening and join the listener thread
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Signal listener thread panicked");
            }
        }
    }
}

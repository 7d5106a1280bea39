//! Graceful shutdown handling
//!
//! On shutdown the dispatcher stops taking deliveries and asks every running
//! job to suspend at its next commit boundary. The first request wins; its
//! cause is kept for the final log lines.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// What asked the worker to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// SIGINT, SIGTERM or Ctrl+C
    Signal(&'static str),
    /// Called from code, e.g. a test or an embedding application
    Requested,
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownCause::Signal(name) => write!(f, "{}", name),
            ShutdownCause::Requested => f.write_str("request"),
        }
    }
}

/// Shutdown latch shared by the dispatcher, reconciler and signal handler
#[derive(Clone)]
pub struct ShutdownCoordinator {
    cause: Arc<watch::Sender<Option<ShutdownCause>>>,
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("cause", &self.cause())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { cause: Arc::new(tx) }
    }

    pub fn request_shutdown(&self) {
        self.trigger(ShutdownCause::Requested);
    }

    /// Latch shutdown with `cause`. Returns `false` if it was already latched.
    pub fn trigger(&self, cause: ShutdownCause) -> bool {
        let latched = self.cause.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        });
        if latched {
            info!(cause = %cause, "Shutdown requested");
        }
        latched
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.cause.borrow().is_some()
    }

    pub fn cause(&self) -> Option<ShutdownCause> {
        *self.cause.borrow()
    }

    /// Wait for shutdown; returns at once if it was already requested.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.cause.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(Option::is_some).await;
    }

    /// Latch shutdown on the first SIGINT or SIGTERM (Ctrl+C off unix).
    pub fn install_signal_handlers(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();

        tokio::spawn(async move {
            match next_signal().await {
                Ok(name) => {
                    warn!(signal = name, "Stopping after running jobs suspend");
                    coordinator.trigger(ShutdownCause::Signal(name));
                }
                Err(e) => error!(error = %e, "Failed to install signal handlers"),
            }
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn next_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn next_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl+C")
}

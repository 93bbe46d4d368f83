use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::StreamExt;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use tokio::sync::broadcast;

use crate::core::scheduler::RenewalTrigger;

/// Represents different shutdown reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Graceful shutdown requested (SIGTERM, SIGINT)
    Graceful,
    /// Force shutdown (shutdown channel lost)
    Force,
}

/// Manages graceful shutdown of the supervisor and its background tasks
pub struct GracefulShutdown {
    /// Broadcast sender for shutdown signals
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    /// Flag indicating if shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Maximum time to wait for background work after shutdown starts
    shutdown_timeout: Duration,
}

impl GracefulShutdown {
    /// Create a new GracefulShutdown manager with default 30-second timeout
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a new GracefulShutdown manager with custom timeout
    pub fn with_timeout(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            shutdown_timeout,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Get a receiver for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Manually trigger shutdown
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> Result<()> {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!(?reason, "Shutdown triggered");
            let _ = self.shutdown_tx.send(reason);
        }
        Ok(())
    }

    /// Listen for OS signals. SIGTERM and SIGINT start a graceful shutdown; SIGHUP requests an
    /// immediate renewal check through `renewal`.
    pub async fn run_signal_handler(&self, renewal: Option<RenewalTrigger>) -> Result<()> {
        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
        let handle = signals.handle();

        tracing::info!(
            "Signal handler started. Listening for SIGTERM, SIGINT (graceful shutdown) and SIGHUP (renewal check)"
        );

        while let Some(signal) = signals.next().await {
            match signal {
                SIGTERM | SIGINT => {
                    tracing::info!(
                        signal = if signal == SIGTERM { "SIGTERM" } else { "SIGINT" },
                        "Received shutdown signal, initiating graceful shutdown"
                    );
                    if self.is_shutdown_initiated() {
                        tracing::warn!("Shutdown already in progress, ignoring additional signal");
                        continue;
                    }
                    self.trigger_shutdown(ShutdownReason::Graceful)?;
                    break;
                }
                SIGHUP => match &renewal {
                    Some(trigger) => {
                        if trigger.request() {
                            tracing::info!("Received SIGHUP, renewal check requested");
                        } else {
                            tracing::info!("Received SIGHUP while a renewal check is running, ignored");
                        }
                    }
                    None => tracing::warn!("Received SIGHUP but no renewal scheduler is attached"),
                },
                _ => continue,
            }
        }

        handle.close();
        tracing::info!("Signal handler shutting down");
        Ok(())
    }

    /// Wait indefinitely for shutdown signal (used in main application loop)
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut token = self.shutdown_token();
        let reason = token.cancelled().await;
        tracing::info!(?reason, "Shutdown signal received");
        reason
    }

    /// Create a shutdown token that can be used to cancel operations
    pub fn shutdown_token(&self) -> ShutdownToken {
        ShutdownToken {
            receiver: self.subscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A token that can be used to check for shutdown signals
pub struct ShutdownToken {
    receiver: broadcast::Receiver<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl Clone for ShutdownToken {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
            shutdown_initiated: self.shutdown_initiated.clone(),
        }
    }
}

impl ShutdownToken {
    /// Check if shutdown has been initiated (non-blocking)
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested. Returns immediately when shutdown started
    /// before this token was created.
    pub async fn cancelled(&mut self) -> ShutdownReason {
        if let Some(reason) = self.try_recv() {
            return reason;
        }
        if self.is_shutdown_requested() {
            return ShutdownReason::Graceful;
        }
        match self.receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => ShutdownReason::Force,
        }
    }

    /// Try to receive shutdown signal without blocking
    pub fn try_recv(&mut self) -> Option<ShutdownReason> {
        match self.receiver.try_recv() {
            Ok(reason) => Some(reason),
            Err(broadcast::error::TryRecvError::Empty) => None,
            Err(_) => Some(ShutdownReason::Force),
        }
    }
}

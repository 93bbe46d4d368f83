use std::future::Future;
use std::io;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised while supervising the reverse proxy process
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// A listening port is held by another process or needs privileges we lack
    #[error("Port {port} is unavailable: {source}")]
    BindError {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// A proxy process is already live
    #[error("Proxy is already running with pid {pid}")]
    AlreadyRunning { pid: u32 },

    /// No live proxy process to signal
    #[error("Proxy is not running")]
    NotRunning,

    /// The proxy binary could not be executed
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    /// The proxy exited while it should have been serving
    #[error("Proxy exited during startup: {status}")]
    Exited { status: String },

    /// The proxy rejected a configuration or could not be told to reload
    #[error("Proxy reload failed: {0}")]
    ReloadError(String),

    #[error("Proxy I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Type alias for async proxy lifecycle operations
pub type ProxyFuture<'a> = Pin<Box<dyn Future<Output = ProxyResult<()>> + Send + 'a>>;

/// ProxyController defines the port for supervising the reverse proxy that fronts the backend
pub trait ProxyController: Send + Sync + 'static {
    /// Spawn the proxy with the currently installed configuration.
    ///
    /// Fails with `BindError` when a listening port is taken and `AlreadyRunning` when a
    /// live process exists.
    fn start<'a>(&'a self) -> ProxyFuture<'a>;

    /// Validate `config_text` and install it as the live configuration without signalling the
    /// proxy. A rejected configuration leaves the previous one in place.
    fn apply<'a>(&'a self, config_text: &'a str) -> ProxyFuture<'a>;

    /// Gracefully reload the running proxy. In-flight requests complete on the old workers.
    fn reload<'a>(&'a self) -> ProxyFuture<'a>;

    /// Stop the proxy, draining connections up to the configured grace period.
    fn stop<'a>(&'a self) -> ProxyFuture<'a>;

    /// Install `config_text` and reload. Applying identical text twice reloads twice and never
    /// spawns a second process.
    fn apply_and_reload<'a>(&'a self, config_text: &'a str) -> ProxyFuture<'a> {
        Box::pin(async move {
            self.apply(config_text).await?;
            self.reload().await
        })
    }
}

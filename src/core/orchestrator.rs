use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::validation::{is_valid_email, validate_backend_target};
use crate::core::certificate::{CertificateRecord, CertificateStore};
use crate::core::clock::Clock;
use crate::core::hostname::Hostname;
use crate::core::renderer::{
    CHALLENGE_LOCATION, ConfigRenderer, ProxyMode, RenderError, challenge_token_dir,
};
use crate::core::retry::RetryPolicy;
use crate::core::scheduler::{RenewalScheduler, RenewalStatus, RenewalTrigger, SchedulerSettings};
use crate::metrics;
use crate::ports::acquirer::{AcquireError, CertificateAcquirer};
use crate::ports::http_client::HttpClient;
use crate::ports::proxy::{ProxyController, ProxyError};
use crate::utils::atomic_file::write_atomic;
use crate::utils::graceful_shutdown::{GracefulShutdown, ShutdownToken};

const MAX_PROBE_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Init,
    ProxyStarted(ProxyMode),
    CertificateAcquired,
    ProxyReloaded(ProxyMode),
    RenewalSchedulerRunning,
}

impl BootstrapState {
    fn stage(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::ProxyStarted(_) => 1,
            Self::CertificateAcquired => 2,
            Self::ProxyReloaded(_) => 3,
            Self::RenewalSchedulerRunning => 4,
        }
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => f.write_str("init"),
            Self::ProxyStarted(mode) => write!(f, "proxy-started({mode})"),
            Self::CertificateAcquired => f.write_str("certificate-acquired"),
            Self::ProxyReloaded(mode) => write!(f, "proxy-reloaded({mode})"),
            Self::RenewalSchedulerRunning => f.write_str("renewal-scheduler-running"),
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BootstrapError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Certificate acquisition failed: {0}")]
    Acquisition(#[from] AcquireError),

    #[error("Failed to render proxy configuration: {0}")]
    Render(#[from] RenderError),

    #[error("Bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("Invalid bootstrap transition from {from} to {to}")]
    InvalidTransition {
        from: BootstrapState,
        to: BootstrapState,
    },

    #[error("Bootstrap cancelled by shutdown")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    pub hostname: String,
    pub email: String,
    pub backend: String,
    /// Webroot the proxy serves challenges from
    pub challenge_dir: PathBuf,
    pub http_port: u16,
    pub probe_attempts: u32,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub retry: RetryPolicy,
    pub scheduler: SchedulerSettings,
}

/// Everything the orchestrator drives
pub struct Collaborators {
    pub renderer: Arc<ConfigRenderer>,
    pub proxy: Arc<dyn ProxyController>,
    pub acquirer: Arc<dyn CertificateAcquirer>,
    pub store: Arc<CertificateStore>,
    pub http_client: Arc<dyn HttpClient>,
    pub clock: Arc<dyn Clock>,
}

/// Result of a successful bootstrap
pub struct Bootstrapped {
    pub hostname: Hostname,
    pub record: CertificateRecord,
    pub scheduler: Arc<RenewalScheduler>,
    pub scheduler_task: JoinHandle<()>,
}

/// Sequences first start: plaintext proxy, certificate acquisition, switch to HTTPS, then
/// hands over to the renewal scheduler. A restart with a servable certificate on disk goes
/// straight to HTTPS.
pub struct BootstrapOrchestrator {
    settings: BootstrapSettings,
    parts: Collaborators,
    status: Arc<RenewalStatus>,
    trigger: RenewalTrigger,
    state: BootstrapState,
    reachable: bool,
}

impl BootstrapOrchestrator {
    pub fn new(
        settings: BootstrapSettings,
        parts: Collaborators,
        status: Arc<RenewalStatus>,
        trigger: RenewalTrigger,
    ) -> Self {
        Self {
            settings,
            parts,
            status,
            trigger,
            state: BootstrapState::Init,
            reachable: false,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    pub fn mode(&self) -> Option<ProxyMode> {
        match self.state {
            BootstrapState::Init => None,
            BootstrapState::ProxyStarted(mode) | BootstrapState::ProxyReloaded(mode) => Some(mode),
            BootstrapState::CertificateAcquired => Some(ProxyMode::HttpOnly),
            BootstrapState::RenewalSchedulerRunning => Some(ProxyMode::HttpsActive),
        }
    }

    /// Drive bootstrap to `RenewalSchedulerRunning`. On failure the proxy is left in its last
    /// good configuration.
    pub async fn run(&mut self, shutdown: &GracefulShutdown) -> Result<Bootstrapped, BootstrapError> {
        let hostname = self.initialize()?;
        info!(hostname = %hostname, backend = %self.settings.backend, "Starting bootstrap");

        let now = self.parts.clock.now();
        let existing = match self.parts.store.load(&hostname, now) {
            Ok(record) => record,
            Err(error) => {
                warn!(error = %error, "Stored certificate is unusable, requesting a new one");
                None
            }
        };

        let record = match existing {
            Some(record) if record.status.is_servable() => {
                info!(
                    status = %record.status,
                    not_after = %record.not_after,
                    "Reusing stored certificate"
                );
                match self.resume(&hostname, record).await {
                    Ok(record) => record,
                    Err(BootstrapError::Proxy(ProxyError::ReloadError(reason))) => {
                        warn!(
                            error = %reason,
                            "Proxy rejected the stored certificate, starting without TLS"
                        );
                        self.bootstrap(&hostname, shutdown).await?
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(record) => {
                info!(status = %record.status, "Stored certificate is not servable");
                self.bootstrap(&hostname, shutdown).await?
            }
            None => self.bootstrap(&hostname, shutdown).await?,
        };

        self.start_scheduler(hostname, record, shutdown)
    }

    fn initialize(&self) -> Result<Hostname, BootstrapError> {
        let hostname = Hostname::parse(&self.settings.hostname)
            .map_err(|e| BootstrapError::ConfigurationError(e.to_string()))?;
        if !is_valid_email(&self.settings.email) {
            return Err(BootstrapError::ConfigurationError(format!(
                "invalid contact email '{}'",
                self.settings.email
            )));
        }
        validate_backend_target(&self.settings.backend).map_err(BootstrapError::ConfigurationError)?;
        Ok(hostname)
    }

    async fn resume(
        &mut self,
        hostname: &Hostname,
        record: CertificateRecord,
    ) -> Result<CertificateRecord, BootstrapError> {
        let config = self
            .parts
            .renderer
            .render(ProxyMode::HttpsActive, hostname.as_str(), Some(&record))?;
        self.parts.proxy.apply(&config).await?;
        self.parts.proxy.start().await?;
        self.transition(BootstrapState::ProxyReloaded(ProxyMode::HttpsActive))?;
        self.status.set_record(record.clone());
        Ok(record)
    }

    async fn bootstrap(
        &mut self,
        hostname: &Hostname,
        shutdown: &GracefulShutdown,
    ) -> Result<CertificateRecord, BootstrapError> {
        let config = self
            .parts
            .renderer
            .render(ProxyMode::HttpOnly, hostname.as_str(), None)?;
        self.parts.proxy.apply(&config).await?;
        self.parts.proxy.start().await?;
        self.transition(BootstrapState::ProxyStarted(ProxyMode::HttpOnly))?;

        let mut token = shutdown.shutdown_token();
        self.confirm_reachable(&mut token).await?;
        self.reachable = true;

        let acquirer = self.parts.acquirer.clone();
        let challenge_dir = self.settings.challenge_dir.clone();
        let record = self
            .settings
            .retry
            .run(&mut token, || acquirer.acquire(hostname, &challenge_dir))
            .await?;
        self.transition(BootstrapState::CertificateAcquired)?;
        self.status.set_record(record.clone());

        let config = self
            .parts
            .renderer
            .render(ProxyMode::HttpsActive, hostname.as_str(), Some(&record))?;
        let reloaded = self.parts.proxy.apply_and_reload(&config).await;
        metrics::increment_proxy_reload(if reloaded.is_ok() { "success" } else { "failure" });
        reloaded?;
        self.transition(BootstrapState::ProxyReloaded(ProxyMode::HttpsActive))?;

        Ok(record)
    }

    /// Serve a probe token through the challenge location and fetch it over port 80.
    async fn confirm_reachable(&self, shutdown: &mut ShutdownToken) -> Result<(), BootstrapError> {
        let token = format!("certgate-probe-{:016x}", rand::rng().random::<u64>());
        let path = challenge_token_dir(&self.settings.challenge_dir).join(&token);
        write_atomic(&path, token.as_bytes(), 0o644).map_err(|e| {
            BootstrapError::BootstrapFailed(format!(
                "cannot write probe token {}: {e}",
                path.display()
            ))
        })?;

        let url = format!(
            "http://127.0.0.1:{}{}{}",
            self.settings.http_port, CHALLENGE_LOCATION, token
        );
        let result = self.poll_probe(&url, &token, shutdown).await;

        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove probe token");
        }
        result
    }

    async fn poll_probe(
        &self,
        url: &str,
        token: &str,
        shutdown: &mut ShutdownToken,
    ) -> Result<(), BootstrapError> {
        let attempts = self.settings.probe_attempts.max(1);
        let mut delay = self.settings.probe_interval;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self
                .parts
                .http_client
                .fetch(url, self.settings.probe_timeout)
                .await
            {
                Ok(response) if response.status == 200 && response.body.trim() == token => {
                    info!(attempt, "Proxy is serving challenge files on port {}", self.settings.http_port);
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!("unexpected response status {}", response.status);
                }
                Err(e) => last_error = e.to_string(),
            }
            debug!(attempt, attempts, error = %last_error, "Reachability probe failed");

            if attempt < attempts {
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(BootstrapError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = delay.saturating_mul(2).min(MAX_PROBE_BACKOFF);
            }
        }

        Err(BootstrapError::BootstrapFailed(format!(
            "proxy did not serve the challenge probe on port {} after {} attempts: {}",
            self.settings.http_port, attempts, last_error
        )))
    }

    fn start_scheduler(
        &mut self,
        hostname: Hostname,
        record: CertificateRecord,
        shutdown: &GracefulShutdown,
    ) -> Result<Bootstrapped, BootstrapError> {
        let scheduler = Arc::new(RenewalScheduler::new(
            self.parts.acquirer.clone(),
            self.parts.proxy.clone(),
            self.parts.renderer.clone(),
            self.parts.clock.clone(),
            self.parts.store.window(),
            self.settings.scheduler.clone(),
            self.status.clone(),
            self.trigger.clone(),
        ));
        self.transition(BootstrapState::RenewalSchedulerRunning)?;

        let task_scheduler = scheduler.clone();
        let token = shutdown.shutdown_token();
        let scheduler_task = tokio::spawn(async move { task_scheduler.run(token).await });

        info!(
            hostname = %hostname,
            not_after = %record.not_after,
            "Bootstrap complete, renewal scheduler running"
        );
        Ok(Bootstrapped {
            hostname,
            record,
            scheduler,
            scheduler_task,
        })
    }

    fn transition(&mut self, next: BootstrapState) -> Result<(), BootstrapError> {
        use BootstrapState::*;

        let allowed = match (self.state, next) {
            (Init, ProxyStarted(ProxyMode::HttpOnly)) => true,
            (Init, ProxyReloaded(ProxyMode::HttpsActive)) => true,
            (ProxyStarted(ProxyMode::HttpOnly), CertificateAcquired) => self.reachable,
            (CertificateAcquired, ProxyReloaded(ProxyMode::HttpsActive)) => true,
            (ProxyReloaded(ProxyMode::HttpsActive), RenewalSchedulerRunning) => true,
            _ => false,
        };
        if !allowed {
            return Err(BootstrapError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        info!(from = %self.state, to = %next, "Bootstrap transition");
        self.state = next;
        metrics::set_bootstrap_state(next.stage());
        if let Some(mode) = self.mode() {
            self.status.set_mode(mode);
        }
        Ok(())
    }
}

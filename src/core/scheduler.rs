use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::core::certificate::{CertificateRecord, CertificateStatus, RenewalWindow};
use crate::core::clock::Clock;
use crate::core::renderer::{ConfigRenderer, ProxyMode, RenderError};
use crate::metrics;
use crate::ports::acquirer::CertificateAcquirer;
use crate::ports::proxy::{ProxyController, ProxyError};
use crate::utils::graceful_shutdown::ShutdownToken;

pub const DEFAULT_LOG_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Wake-up period while healthy
    pub period: Duration,
    /// First delay after consecutive failures; doubles per failure up to `period`
    pub failure_backoff: Duration,
    /// Relative jitter applied to every delay, e.g. 0.1 for ±10%
    pub jitter: f64,
    /// Delay before the first check after the scheduler starts
    pub initial_delay: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(12 * 60 * 60),
            failure_backoff: Duration::from_secs(30 * 60),
            jitter: 0.1,
            initial_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Checking = 1,
    Renewing = 2,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Checking,
            2 => Self::Renewing,
            _ => Self::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenewalAttempt {
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub reason: String,
    pub retry_after: Option<DateTime<Utc>>,
}

/// Bounded, append-only history of renewal attempts. Oldest entries are dropped first.
#[derive(Debug)]
pub struct RenewalLog {
    entries: Mutex<VecDeque<RenewalAttempt>>,
    capacity: usize,
}

impl RenewalLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, attempt: RenewalAttempt) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(attempt);
    }

    /// Newest last.
    pub fn entries(&self) -> Vec<RenewalAttempt> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<RenewalAttempt> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.back().cloned()
    }

    pub fn consecutive_failures(&self) -> u32 {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let count = entries
            .iter()
            .rev()
            .take_while(|attempt| attempt.outcome == AttemptOutcome::Failure)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

/// State shared between the orchestrator, the scheduler and the status endpoint
#[derive(Debug)]
pub struct RenewalStatus {
    record: RwLock<Option<CertificateRecord>>,
    mode: RwLock<Option<ProxyMode>>,
    state: AtomicU8,
    log: RenewalLog,
}

impl RenewalStatus {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            record: RwLock::new(None),
            mode: RwLock::new(None),
            state: AtomicU8::new(SchedulerState::Idle as u8),
            log: RenewalLog::new(log_capacity),
        }
    }

    pub fn record(&self) -> Option<CertificateRecord> {
        self.record
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_record(&self, record: CertificateRecord) {
        metrics::set_certificate_expiry(record.not_after.timestamp());
        *self.record.write().unwrap_or_else(|e| e.into_inner()) = Some(record);
    }

    pub fn mode(&self) -> Option<ProxyMode> {
        *self.mode.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_mode(&self, mode: ProxyMode) {
        *self.mode.write().unwrap_or_else(|e| e.into_inner()) = Some(mode);
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn log(&self) -> &RenewalLog {
        &self.log
    }
}

impl Default for RenewalStatus {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

/// Requests an immediate renewal check (SIGHUP, `POST /renew`).
#[derive(Debug, Clone)]
pub struct RenewalTrigger {
    notify: Arc<Notify>,
    status: Arc<RenewalStatus>,
}

impl RenewalTrigger {
    pub fn new(status: Arc<RenewalStatus>) -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            status,
        }
    }

    /// Returns `false` when the request was dropped because a check is already running or no
    /// certificate is being managed yet.
    pub fn request(&self) -> bool {
        if self.status.state() != SchedulerState::Idle || self.status.record().is_none() {
            return false;
        }
        self.notify.notify_one();
        true
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Outside the renewal window
    NotDue,
    /// Certificate renewed and proxy reloaded
    Renewed,
    /// The authority call failed; the old certificate keeps being served
    RenewalFailed,
    /// A new certificate is on disk but the proxy did not reload; retried next tick
    ReloadFailed,
    /// A previously failed reload succeeded
    Reloaded,
    /// Another tick was in progress
    Skipped,
    /// No certificate is managed yet
    NoCertificate,
    /// Shutdown interrupted the renewal
    Cancelled,
}

#[derive(Error, Debug)]
enum ReloadFailure {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
}

/// Background task that renews the certificate inside its renewal window and reloads the proxy.
pub struct RenewalScheduler {
    acquirer: Arc<dyn CertificateAcquirer>,
    proxy: Arc<dyn ProxyController>,
    renderer: Arc<ConfigRenderer>,
    clock: Arc<dyn Clock>,
    window: RenewalWindow,
    settings: SchedulerSettings,
    status: Arc<RenewalStatus>,
    trigger: RenewalTrigger,
    reload_pending: AtomicBool,
    tick_lock: tokio::sync::Mutex<()>,
}

impl RenewalScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        acquirer: Arc<dyn CertificateAcquirer>,
        proxy: Arc<dyn ProxyController>,
        renderer: Arc<ConfigRenderer>,
        clock: Arc<dyn Clock>,
        window: RenewalWindow,
        settings: SchedulerSettings,
        status: Arc<RenewalStatus>,
        trigger: RenewalTrigger,
    ) -> Self {
        Self {
            acquirer,
            proxy,
            renderer,
            clock,
            window,
            settings,
            status,
            trigger,
            reload_pending: AtomicBool::new(false),
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.status.state()
    }

    pub fn status(&self) -> &Arc<RenewalStatus> {
        &self.status
    }

    pub fn reload_pending(&self) -> bool {
        self.reload_pending.load(Ordering::SeqCst)
    }

    /// Loop until shutdown: sleep, or wake early on a trigger, then check once.
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        info!(
            period = ?self.settings.period,
            jitter = self.settings.jitter,
            "Renewal scheduler started"
        );

        let mut delay = self.settings.initial_delay;
        loop {
            debug!(delay = ?delay, "Next renewal check scheduled");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.trigger.notified() => info!("Renewal check requested"),
            }

            if self.tick(&mut shutdown).await == TickOutcome::Cancelled {
                break;
            }
            delay = self.next_delay();
        }

        info!("Renewal scheduler stopped");
    }

    /// One wake-up. Never runs concurrently with itself.
    pub async fn tick(&self, shutdown: &mut ShutdownToken) -> TickOutcome {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            debug!("Renewal check already in progress, skipping");
            return TickOutcome::Skipped;
        };

        self.status.set_state(SchedulerState::Checking);
        let outcome = self.check(shutdown).await;
        self.status.set_state(SchedulerState::Idle);
        outcome
    }

    async fn check(&self, shutdown: &mut ShutdownToken) -> TickOutcome {
        let now = self.clock.now();
        let Some(mut current) = self.status.record() else {
            warn!("Renewal check without a managed certificate");
            return TickOutcome::NoCertificate;
        };

        if self.reload_pending() {
            return match self.reload(&current).await {
                Ok(()) => {
                    self.reload_pending.store(false, Ordering::SeqCst);
                    info!(hostname = %current.hostname, "Deferred proxy reload applied");
                    self.record_attempt(now, AttemptOutcome::Success, "deferred reload applied", None);
                    TickOutcome::Reloaded
                }
                Err(error) => {
                    warn!(error = %error, "Deferred proxy reload failed again");
                    self.record_attempt(now, AttemptOutcome::Failure, &error.to_string(), None);
                    TickOutcome::ReloadFailed
                }
            };
        }

        if !current.in_renewal_window(now, self.window) {
            current.refresh_status(now, self.window);
            debug!(
                hostname = %current.hostname,
                due_at = %current.renewal_due_at(self.window),
                "Certificate not due for renewal"
            );
            self.status.set_record(current);
            return TickOutcome::NotDue;
        }

        if current.status == CertificateStatus::Present {
            current.status = CertificateStatus::Expiring;
            self.status.set_record(current.clone());
        }

        self.status.set_state(SchedulerState::Renewing);
        info!(
            hostname = %current.hostname,
            not_after = %current.not_after,
            "Certificate inside renewal window, renewing"
        );

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, abandoning in-flight renewal");
                return TickOutcome::Cancelled;
            }
            result = self.acquirer.renew(&current) => result,
        };

        let renewed = match result {
            Ok(renewed) => renewed,
            Err(error) => {
                current.status = match current.status_at(now, self.window) {
                    CertificateStatus::Expired => CertificateStatus::Expired,
                    _ => CertificateStatus::Stale,
                };
                warn!(
                    hostname = %current.hostname,
                    error = %error,
                    kind = error.kind(),
                    status = %current.status,
                    "Certificate renewal failed, keeping current certificate"
                );
                self.status.set_record(current);
                metrics::increment_renewal_attempt("failure");
                self.record_attempt(
                    now,
                    AttemptOutcome::Failure,
                    &error.to_string(),
                    error.retry_after(),
                );
                return TickOutcome::RenewalFailed;
            }
        };

        self.status.set_record(renewed.clone());
        metrics::increment_renewal_attempt("success");

        match self.reload(&renewed).await {
            Ok(()) => {
                info!(
                    hostname = %renewed.hostname,
                    not_after = %renewed.not_after,
                    "Certificate renewed and proxy reloaded"
                );
                self.record_attempt(now, AttemptOutcome::Success, "renewed", None);
                TickOutcome::Renewed
            }
            Err(error) => {
                self.reload_pending.store(true, Ordering::SeqCst);
                warn!(
                    hostname = %renewed.hostname,
                    error = %error,
                    "Certificate renewed but proxy reload failed, will retry"
                );
                self.record_attempt(now, AttemptOutcome::Failure, &error.to_string(), None);
                TickOutcome::ReloadFailed
            }
        }
    }

    async fn reload(&self, record: &CertificateRecord) -> Result<(), ReloadFailure> {
        let config = self.renderer.render(
            ProxyMode::HttpsActive,
            record.hostname.as_str(),
            Some(record),
        )?;
        let result = self.proxy.apply_and_reload(&config).await;
        metrics::increment_proxy_reload(if result.is_ok() { "success" } else { "failure" });
        result?;
        Ok(())
    }

    fn record_attempt(
        &self,
        timestamp: DateTime<Utc>,
        outcome: AttemptOutcome,
        reason: &str,
        retry_after: Option<DateTime<Utc>>,
    ) {
        self.status.log().record(RenewalAttempt {
            timestamp,
            outcome,
            reason: reason.to_string(),
            retry_after,
        });
    }

    /// Delay until the next wake-up, with jitter applied.
    pub fn next_delay(&self) -> Duration {
        let now = self.clock.now();
        let delay = apply_jitter(self.backoff_delay(), self.settings.jitter);
        match self.retry_after_wait(now) {
            Some(wait) => delay.max(wait),
            None => delay,
        }
    }

    /// The period while healthy; `failure_backoff * 2^(n-1)` after `n` consecutive failures,
    /// capped at the period.
    pub fn backoff_delay(&self) -> Duration {
        let failures = self.status.log().consecutive_failures();
        if failures == 0 {
            return self.settings.period;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.settings
            .failure_backoff
            .saturating_mul(factor)
            .min(self.settings.period)
    }

    fn retry_after_wait(&self, now: DateTime<Utc>) -> Option<Duration> {
        let last = self.status.log().last()?;
        if last.outcome != AttemptOutcome::Failure {
            return None;
        }
        (last.retry_after? - now).to_std().ok()
    }
}

fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let ratio = ratio.min(1.0);
    let factor = rand::rng().random_range((1.0 - ratio)..=(1.0 + ratio));
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::renderer::RenderSettings;
    use crate::core::testing::{FakeAcquirer, FakeProxy, ManualClock, record_for, utc};
    use crate::ports::acquirer::AcquireError;
    use crate::utils::graceful_shutdown::{GracefulShutdown, ShutdownReason};
    use chrono::Duration as ChronoDuration;

    struct Harness {
        scheduler: Arc<RenewalScheduler>,
        acquirer: Arc<FakeAcquirer>,
        proxy: Arc<FakeProxy>,
        clock: Arc<ManualClock>,
        status: Arc<RenewalStatus>,
        trigger: RenewalTrigger,
        shutdown: Arc<GracefulShutdown>,
    }

    fn harness(settings: SchedulerSettings) -> Harness {
        let clock = Arc::new(ManualClock::new(utc(2025, 1, 1)));
        let acquirer = Arc::new(FakeAcquirer::new(clock.clone()));
        let proxy = Arc::new(FakeProxy::running());
        let status = Arc::new(RenewalStatus::default());
        status.set_record(record_for("api.example.com", utc(2025, 1, 1), 90));
        let trigger = RenewalTrigger::new(status.clone());

        let scheduler = Arc::new(RenewalScheduler::new(
            acquirer.clone(),
            proxy.clone(),
            Arc::new(ConfigRenderer::new(RenderSettings::default())),
            clock.clone(),
            RenewalWindow::FinalThird,
            settings,
            status.clone(),
            trigger.clone(),
        ));

        Harness {
            scheduler,
            acquirer,
            proxy,
            clock,
            status,
            trigger,
            shutdown: Arc::new(GracefulShutdown::new()),
        }
    }

    fn no_jitter() -> SchedulerSettings {
        SchedulerSettings {
            jitter: 0.0,
            ..SchedulerSettings::default()
        }
    }

    #[tokio::test]
    async fn test_never_renews_outside_window() {
        let h = harness(no_jitter());
        let mut token = h.shutdown.shutdown_token();

        // Every 12 hours from issuance until 31 days before expiry.
        for _ in 0..118 {
            assert_eq!(h.scheduler.tick(&mut token).await, TickOutcome::NotDue);
            h.clock.advance(ChronoDuration::hours(12));
        }

        assert_eq!(h.clock.now(), utc(2025, 3, 1));
        assert_eq!(h.scheduler.tick(&mut token).await, TickOutcome::NotDue);
        assert_eq!(h.acquirer.renew_calls(), 0);
        assert_eq!(h.proxy.reload_count(), 0);
        assert_eq!(h.status.record().unwrap().status, CertificateStatus::Present);
    }

    #[tokio::test]
    async fn test_renews_once_inside_window_and_reloads_once() {
        let h = harness(no_jitter());
        let mut token = h.shutdown.shutdown_token();

        // 29 days before expiry.
        h.clock.set(utc(2025, 3, 3));
        assert_eq!(h.scheduler.tick(&mut token).await, TickOutcome::Renewed);
        assert_eq!(h.acquirer.renew_calls(), 1);
        assert_eq!(h.proxy.reload_count(), 1);

        let record = h.status.record().unwrap();
        assert_eq!(record.issued_at, utc(2025, 3, 3));
        assert_eq!(record.status, CertificateStatus::Present);
        let applied = h.proxy.last_applied().unwrap();
        assert!(applied.contains("ssl_certificate"));

        // The fresh certificate is far from its window.
        assert_eq!(h.scheduler.tick(&mut token).await, TickOutcome::NotDue);
        assert_eq!(h.acquirer.renew_calls(), 1);
        assert_eq!(h.proxy.reload_count(), 1);

        let log = h.status.log().entries();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].outcome, AttemptOutcome::Success);
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_certificate_without_reload() {
        let h = harness(no_jitter());
        let mut token = h.shutdown.shutdown_token();
        let before = h.status.record().unwrap();

        h.acquirer
            .push_result(Err(AcquireError::AuthorityUnavailable("503".to_string())));
        h.clock.set(utc(2025, 3, 10));

        assert_eq!(h.scheduler.tick(&mut token).await, TickOutcome::RenewalFailed);
        assert_eq!(h.proxy.reload_count(), 0);

        let after = h.status.record().unwrap();
        assert_eq!(after.certificate_path, before.certificate_path);
        assert_eq!(after.private_key_path, before.private_key_path);
        assert_eq!(after.not_after, before.not_after);
        assert_eq!(after.status, CertificateStatus::Stale);

        let last = h.status.log().last().unwrap();
        assert_eq!(last.outcome, AttemptOutcome::Failure);
        assert!(last.reason.contains("503"));
    }

    #[tokio::test]
    async fn test_reload_failure_is_retried_without_renewing() {
        let h = harness(no_jitter());
        let mut token = h.shutdown.shutdown_token();
        h.proxy.fail_next_reload();
        h.clock.set(utc(2025, 3, 10));

        assert_eq!(h.scheduler.tick(&mut token).await, TickOutcome::ReloadFailed);
        assert!(h.scheduler.reload_pending());
        assert_eq!(h.acquirer.renew_calls(), 1);
        // The new certificate is tracked even though the proxy has not picked it up yet.
        assert_eq!(h.status.record().unwrap().issued_at, utc(2025, 3, 10));

        assert_eq!(h.scheduler.tick(&mut token).await, TickOutcome::Reloaded);
        assert!(!h.scheduler.reload_pending());
        assert_eq!(h.acquirer.renew_calls(), 1);
        assert_eq!(h.proxy.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_backoff_grows_with_consecutive_failures() {
        let h = harness(no_jitter());
        let mut token = h.shutdown.shutdown_token();
        h.clock.set(utc(2025, 3, 10));
        assert_eq!(h.scheduler.backoff_delay(), Duration::from_secs(12 * 3600));

        for _ in 0..3 {
            h.acquirer
                .push_result(Err(AcquireError::AuthorityUnavailable("timeout".to_string())));
            h.scheduler.tick(&mut token).await;
        }
        assert_eq!(h.status.log().consecutive_failures(), 3);
        assert_eq!(h.scheduler.backoff_delay(), Duration::from_secs(2 * 3600));

        for _ in 0..5 {
            h.acquirer
                .push_result(Err(AcquireError::AuthorityUnavailable("timeout".to_string())));
            h.scheduler.tick(&mut token).await;
        }
        assert_eq!(h.scheduler.backoff_delay(), Duration::from_secs(12 * 3600));

        assert_eq!(h.scheduler.tick(&mut token).await, TickOutcome::Renewed);
        assert_eq!(h.status.log().consecutive_failures(), 0);
        assert_eq!(h.scheduler.next_delay(), Duration::from_secs(12 * 3600));
    }

    #[tokio::test]
    async fn test_next_delay_respects_retry_after() {
        let h = harness(no_jitter());
        let mut token = h.shutdown.shutdown_token();
        h.clock.set(utc(2025, 3, 10));
        h.acquirer.push_result(Err(AcquireError::RateLimited {
            detail: "too many certificates".to_string(),
            retry_after: Some(utc(2025, 3, 12)),
        }));

        assert_eq!(h.scheduler.tick(&mut token).await, TickOutcome::RenewalFailed);
        assert_eq!(h.scheduler.next_delay(), Duration::from_secs(48 * 3600));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let base = Duration::from_secs(1000);
        for _ in 0..100 {
            let delay = apply_jitter(base, 0.1);
            assert!(delay >= Duration::from_secs(900));
            assert!(delay <= Duration::from_secs(1100));
        }
        assert_eq!(apply_jitter(base, 0.0), base);
    }

    #[test]
    fn test_log_is_bounded() {
        let log = RenewalLog::new(3);
        for i in 0..5 {
            log.record(RenewalAttempt {
                timestamp: utc(2025, 1, 1 + i),
                outcome: AttemptOutcome::Failure,
                reason: format!("attempt {i}"),
                retry_after: None,
            });
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].reason, "attempt 2");
        assert_eq!(log.consecutive_failures(), 3);
    }

    #[test]
    fn test_trigger_is_dropped_while_busy() {
        let status = Arc::new(RenewalStatus::default());
        let trigger = RenewalTrigger::new(status.clone());
        assert!(!trigger.request());

        status.set_record(record_for("api.example.com", utc(2025, 1, 1), 90));
        assert!(trigger.request());

        status.set_state(SchedulerState::Renewing);
        assert!(!trigger.request());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_checks_then_stops_on_shutdown() {
        let h = harness(SchedulerSettings {
            initial_delay: Duration::from_secs(1),
            ..no_jitter()
        });
        h.clock.set(utc(2025, 3, 10));

        let scheduler = h.scheduler.clone();
        let token = h.shutdown.shutdown_token();
        let task = tokio::spawn(async move { scheduler.run(token).await });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.acquirer.renew_calls(), 1);
        assert_eq!(h.proxy.reload_count(), 1);

        h.shutdown.trigger_shutdown(ShutdownReason::Graceful).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("scheduler should stop promptly")
            .unwrap();
        assert_eq!(h.scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_wakes_scheduler_early() {
        let h = harness(SchedulerSettings {
            initial_delay: Duration::from_secs(3600),
            ..no_jitter()
        });
        h.clock.set(utc(2025, 3, 10));
        let trigger = h.trigger.clone();

        let scheduler = h.scheduler.clone();
        let token = h.shutdown.shutdown_token();
        let task = tokio::spawn(async move { scheduler.run(token).await });

        tokio::task::yield_now().await;
        assert!(trigger.request());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.acquirer.renew_calls(), 1);

        h.shutdown.trigger_shutdown(ShutdownReason::Graceful).unwrap();
        task.await.unwrap();
    }
}

//! Fakes and fixtures shared by unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

use crate::core::certificate::{CertificateRecord, CertificateStatus};
use crate::core::clock::Clock;
use crate::core::hostname::Hostname;
use crate::ports::acquirer::{AcquireFuture, AcquireResult, CertificateAcquirer};
use crate::ports::http_client::{FetchFuture, FetchedResponse, HttpClient, HttpClientError};
use crate::ports::proxy::{ProxyController, ProxyError, ProxyFuture};

pub fn utc(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

pub fn record_for(hostname: &str, issued_at: DateTime<Utc>, days: i64) -> CertificateRecord {
    let hostname = Hostname::parse(hostname).unwrap();
    let dir = PathBuf::from("/var/lib/certgate/live").join(hostname.as_str());
    CertificateRecord {
        hostname,
        certificate_path: dir.join("fullchain.pem"),
        private_key_path: dir.join("privkey.pem"),
        not_after: issued_at + ChronoDuration::days(days),
        issued_at,
        status: CertificateStatus::Present,
    }
}

/// Self-signed certificate and PKCS#8 key for `hostname` with the given validity dates.
pub fn mint_certificate(
    hostname: &str,
    not_before: (i32, u8, u8),
    not_after: (i32, u8, u8),
) -> (String, String) {
    let mut params = rcgen::CertificateParams::new(vec![hostname.to_string()]).unwrap();
    params.not_before = rcgen::date_time_ymd(not_before.0, not_before.1, not_before.2);
    params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: ChronoDuration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Debug, Default)]
struct FakeProxyState {
    running: bool,
    starts: u32,
    reloads: u32,
    stops: u32,
    applied: Vec<String>,
    live_config: Option<String>,
    reject_marker: Option<String>,
    fail_next_reload: bool,
    bind_conflict: Option<u16>,
}

/// In-memory proxy that records every lifecycle call.
#[derive(Debug, Default)]
pub struct FakeProxy {
    state: Mutex<FakeProxyState>,
}

impl FakeProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running() -> Self {
        let proxy = Self::default();
        proxy.state.lock().unwrap().running = true;
        proxy
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    pub fn start_count(&self) -> u32 {
        self.state.lock().unwrap().starts
    }

    pub fn reload_count(&self) -> u32 {
        self.state.lock().unwrap().reloads
    }

    pub fn stop_count(&self) -> u32 {
        self.state.lock().unwrap().stops
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn last_applied(&self) -> Option<String> {
        self.state.lock().unwrap().applied.last().cloned()
    }

    /// Configuration the proxy would currently serve.
    pub fn live_config(&self) -> Option<String> {
        self.state.lock().unwrap().live_config.clone()
    }

    /// Reject any configuration containing `marker`, the way `nginx -t` would.
    pub fn reject_configs_containing(&self, marker: &str) {
        self.state.lock().unwrap().reject_marker = Some(marker.to_string());
    }

    pub fn fail_next_reload(&self) {
        self.state.lock().unwrap().fail_next_reload = true;
    }

    pub fn simulate_bind_conflict(&self, port: u16) {
        self.state.lock().unwrap().bind_conflict = Some(port);
    }
}

impl ProxyController for FakeProxy {
    fn start<'a>(&'a self) -> ProxyFuture<'a> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Err(ProxyError::AlreadyRunning { pid: 4242 });
            }
            if let Some(port) = state.bind_conflict {
                return Err(ProxyError::BindError {
                    port,
                    source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
                });
            }
            state.running = true;
            state.starts += 1;
            Ok(())
        })
    }

    fn apply<'a>(&'a self, config_text: &'a str) -> ProxyFuture<'a> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if let Some(marker) = &state.reject_marker {
                if config_text.contains(marker.as_str()) {
                    return Err(ProxyError::ReloadError(format!(
                        "configuration contains {marker}"
                    )));
                }
            }
            state.applied.push(config_text.to_string());
            state.live_config = Some(config_text.to_string());
            Ok(())
        })
    }

    fn reload<'a>(&'a self) -> ProxyFuture<'a> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return Err(ProxyError::NotRunning);
            }
            if state.fail_next_reload {
                state.fail_next_reload = false;
                return Err(ProxyError::ReloadError("reload signal failed".to_string()));
            }
            state.reloads += 1;
            Ok(())
        })
    }

    fn stop<'a>(&'a self) -> ProxyFuture<'a> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.running = false;
            state.stops += 1;
            Ok(())
        })
    }
}

/// Acquirer that issues 90-day records dated at the clock's current time, unless a scripted
/// result is queued.
pub struct FakeAcquirer {
    clock: Arc<ManualClock>,
    results: Mutex<VecDeque<AcquireResult<CertificateRecord>>>,
    acquire_calls: AtomicU32,
    renew_calls: AtomicU32,
    challenge_dirs: Mutex<Vec<PathBuf>>,
}

impl FakeAcquirer {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            results: Mutex::new(VecDeque::new()),
            acquire_calls: AtomicU32::new(0),
            renew_calls: AtomicU32::new(0),
            challenge_dirs: Mutex::new(Vec::new()),
        }
    }

    pub fn push_result(&self, result: AcquireResult<CertificateRecord>) {
        self.results.lock().unwrap().push_back(result);
    }

    pub fn acquire_calls(&self) -> u32 {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    pub fn renew_calls(&self) -> u32 {
        self.renew_calls.load(Ordering::SeqCst)
    }

    pub fn challenge_dirs(&self) -> Vec<PathBuf> {
        self.challenge_dirs.lock().unwrap().clone()
    }

    fn next(&self, hostname: &Hostname) -> AcquireResult<CertificateRecord> {
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(record_for(hostname.as_str(), self.clock.now(), 90)))
    }
}

impl CertificateAcquirer for FakeAcquirer {
    fn acquire<'a>(&'a self, hostname: &'a Hostname, challenge_dir: &'a Path) -> AcquireFuture<'a> {
        Box::pin(async move {
            self.acquire_calls.fetch_add(1, Ordering::SeqCst);
            self.challenge_dirs
                .lock()
                .unwrap()
                .push(challenge_dir.to_path_buf());
            self.next(hostname)
        })
    }

    fn renew<'a>(&'a self, existing: &'a CertificateRecord) -> AcquireFuture<'a> {
        Box::pin(async move {
            self.renew_calls.fetch_add(1, Ordering::SeqCst);
            self.next(&existing.hostname)
        })
    }
}

/// HTTP client that answers challenge URLs from a directory, standing in for the proxy's
/// port-80 challenge location.
pub struct ChallengeFileClient {
    webroot: PathBuf,
    failures_remaining: AtomicU32,
    calls: AtomicU32,
}

impl ChallengeFileClient {
    pub fn new(webroot: impl Into<PathBuf>) -> Self {
        Self {
            webroot: webroot.into(),
            failures_remaining: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Refuse the first `count` connections.
    pub fn failing_first(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HttpClient for ChallengeFileClient {
    fn fetch<'a>(&'a self, url: &'a str, _timeout: Duration) -> FetchFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(HttpClientError::ConnectionError(
                    "connection refused".to_string(),
                ));
            }

            let Some(index) = url.find("/.well-known/") else {
                return Ok(FetchedResponse {
                    status: 404,
                    body: String::new(),
                });
            };
            let relative = &url[index + 1..];
            match std::fs::read_to_string(self.webroot.join(relative)) {
                Ok(body) => Ok(FetchedResponse { status: 200, body }),
                Err(_) => Ok(FetchedResponse {
                    status: 404,
                    body: String::new(),
                }),
            }
        })
    }
}

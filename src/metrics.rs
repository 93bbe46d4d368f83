use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use std::time::Instant;

pub const CERTGATE_RENEWAL_ATTEMPTS_TOTAL: &str = "certgate_renewal_attempts_total";
pub const CERTGATE_PROXY_RELOADS_TOTAL: &str = "certgate_proxy_reloads_total";
pub const CERTGATE_CERTIFICATE_EXPIRY_TIMESTAMP: &str = "certgate_certificate_expiry_timestamp_seconds";
pub const CERTGATE_BOOTSTRAP_STATE: &str = "certgate_bootstrap_state";
pub const CERTGATE_ACQUISITION_DURATION_SECONDS: &str = "certgate_acquisition_duration_seconds";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        CERTGATE_RENEWAL_ATTEMPTS_TOTAL,
        Unit::Count,
        "Certificate renewal attempts by outcome."
    );
    describe_counter!(
        CERTGATE_PROXY_RELOADS_TOTAL,
        Unit::Count,
        "Proxy configuration reloads by result."
    );
    describe_gauge!(
        CERTGATE_CERTIFICATE_EXPIRY_TIMESTAMP,
        Unit::Seconds,
        "Unix timestamp at which the served certificate expires."
    );
    describe_gauge!(
        CERTGATE_BOOTSTRAP_STATE,
        "Bootstrap progress: 0 init, 1 proxy started, 2 certificate acquired, 3 proxy reloaded, 4 scheduler running."
    );
    describe_histogram!(
        CERTGATE_ACQUISITION_DURATION_SECONDS,
        Unit::Seconds,
        "Time spent obtaining a certificate from the authority."
    );
});

/// Install the global Prometheus recorder and return a handle for rendering `/metrics`.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Lazy::force(&DESCRIPTIONS);
    Ok(handle)
}

pub fn increment_renewal_attempt(outcome: &str) {
    counter!(CERTGATE_RENEWAL_ATTEMPTS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn increment_proxy_reload(result: &str) {
    counter!(CERTGATE_PROXY_RELOADS_TOTAL, "result" => result.to_string()).increment(1);
}

pub fn set_certificate_expiry(unix_timestamp: i64) {
    gauge!(CERTGATE_CERTIFICATE_EXPIRY_TIMESTAMP).set(unix_timestamp as f64);
}

pub fn set_bootstrap_state(stage: u8) {
    gauge!(CERTGATE_BOOTSTRAP_STATE).set(f64::from(stage));
}

// Records the duration of one ACME order when dropped
pub struct AcquisitionTimer {
    start: Instant,
    operation: &'static str,
}

impl AcquisitionTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for AcquisitionTimer {
    fn drop(&mut self) {
        histogram!(CERTGATE_ACQUISITION_DURATION_SECONDS, "operation" => self.operation)
            .record(self.start.elapsed().as_secs_f64());
    }
}

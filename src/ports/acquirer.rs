use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::certificate::{CertificateRecord, StoreError};
use crate::core::hostname::Hostname;

/// Errors raised while obtaining a certificate from the authority
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AcquireError {
    /// The authority could not validate control of the hostname
    #[error("Domain validation failed for {hostname}: {detail}")]
    ValidationFailed { hostname: String, detail: String },

    /// The authority refused the request because of a rate limit
    #[error("Rate limited by certificate authority: {detail}{}", retry_hint(.retry_after))]
    RateLimited {
        detail: String,
        retry_after: Option<DateTime<Utc>>,
    },

    /// The authority could not be reached or failed internally
    #[error("Certificate authority unavailable: {0}")]
    AuthorityUnavailable(String),

    #[error("Certificate storage error: {0}")]
    Storage(#[from] StoreError),

    /// Any other protocol-level failure
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// Acquisition abandoned because the process is shutting down
    #[error("Certificate acquisition cancelled")]
    Cancelled,
}

fn retry_hint(retry_after: &Option<DateTime<Utc>>) -> String {
    match retry_after {
        Some(at) => format!(" (retry after {})", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => String::new(),
    }
}

impl AcquireError {
    /// Short machine-friendly label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "validation_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthorityUnavailable(_) => "authority_unavailable",
            Self::Storage(_) => "storage",
            Self::Protocol(_) => "protocol",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for certificate acquisition
pub type AcquireResult<T> = Result<T, AcquireError>;

/// Type alias for async acquisition futures
pub type AcquireFuture<'a> = Pin<Box<dyn Future<Output = AcquireResult<CertificateRecord>> + Send + 'a>>;

/// CertificateAcquirer defines the port for obtaining domain-validated certificates
pub trait CertificateAcquirer: Send + Sync + 'static {
    /// Obtain a new certificate for `hostname`, answering HTTP-01 challenges by writing token
    /// files below `challenge_dir`.
    fn acquire<'a>(&'a self, hostname: &'a Hostname, challenge_dir: &'a Path) -> AcquireFuture<'a>;

    /// Replace `existing` with a freshly issued certificate for the same hostname.
    fn renew<'a>(&'a self, existing: &'a CertificateRecord) -> AcquireFuture<'a>;
}

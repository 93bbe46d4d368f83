use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rcgen::KeyPair;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::core::hostname::Hostname;
use crate::utils::atomic_file::{create_private_dir, staging_path, write_atomic, write_staged};

pub const CERTIFICATE_FILE: &str = "fullchain.pem";
pub const PRIVATE_KEY_FILE: &str = "privkey.pem";

/// Lifecycle of the certificate the proxy serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    /// Acquisition in flight; only the target paths are known
    Pending,
    /// Valid and outside the renewal window
    Present,
    /// Inside the renewal window
    Expiring,
    /// A renewal failed; the previous certificate is still valid and still served
    Stale,
    /// Past `not_after`
    Expired,
}

impl CertificateStatus {
    /// Whether a proxy may be configured to serve this certificate.
    pub fn is_servable(self) -> bool {
        matches!(self, Self::Present | Self::Expiring | Self::Stale)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Present => "present",
            Self::Expiring => "expiring",
            Self::Stale => "stale",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When renewal becomes due relative to a certificate's validity period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenewalWindow {
    /// The final third of the validity period (30 days of a 90-day certificate)
    #[default]
    FinalThird,
    /// A fixed interval before `not_after`
    BeforeExpiry(ChronoDuration),
}

impl RenewalWindow {
    pub fn from_days(days: Option<u32>) -> Self {
        match days {
            Some(days) => Self::BeforeExpiry(ChronoDuration::days(i64::from(days))),
            None => Self::FinalThird,
        }
    }

    pub fn opens_at(&self, issued_at: DateTime<Utc>, not_after: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::FinalThird => not_after - (not_after - issued_at) / 3,
            Self::BeforeExpiry(before) => not_after - *before,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateRecord {
    pub hostname: Hostname,
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    pub not_after: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub status: CertificateStatus,
}

impl CertificateRecord {
    pub fn renewal_due_at(&self, window: RenewalWindow) -> DateTime<Utc> {
        window.opens_at(self.issued_at, self.not_after)
    }

    pub fn in_renewal_window(&self, now: DateTime<Utc>, window: RenewalWindow) -> bool {
        now >= self.renewal_due_at(window)
    }

    /// Status implied by the validity dates alone.
    pub fn status_at(&self, now: DateTime<Utc>, window: RenewalWindow) -> CertificateStatus {
        if now >= self.not_after {
            CertificateStatus::Expired
        } else if self.in_renewal_window(now, window) {
            CertificateStatus::Expiring
        } else {
            CertificateStatus::Present
        }
    }

    /// Recompute the status from the dates. A stale certificate stays stale until it is
    /// replaced or expires.
    pub fn refresh_status(&mut self, now: DateTime<Utc>, window: RenewalWindow) {
        let computed = self.status_at(now, window);
        if self.status == CertificateStatus::Stale && computed == CertificateStatus::Expiring {
            return;
        }
        self.status = computed;
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> ChronoDuration {
        self.not_after - now
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse certificate {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("no usable private key in {path:?}")]
    MissingKey { path: PathBuf },

    #[error("private key {path:?} does not match the certificate's public key")]
    KeyMismatch { path: PathBuf },

    #[error("certificate {path:?} does not cover {hostname}")]
    HostnameNotCovered { hostname: String, path: PathBuf },
}

/// Fields read from an X.509 certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
    pub common_name: Option<String>,
    /// Subject public key bits
    pub public_key: Vec<u8>,
}

impl ParsedCertificate {
    pub fn covers(&self, hostname: &Hostname) -> bool {
        if !self.dns_names.is_empty() {
            return self.dns_names.iter().any(|name| hostname.matches(name));
        }
        self.common_name
            .as_deref()
            .is_some_and(|name| hostname.matches(name))
    }
}

/// Parse the leaf (first) certificate of a PEM chain.
pub fn parse_certificate_pem(pem_text: &str) -> Result<ParsedCertificate, String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_text.as_bytes())
        .map_err(|e| format!("failed to parse PEM: {}", e))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| format!("failed to parse certificate: {}", e))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| "invalid notBefore timestamp".to_string())?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| "invalid notAfter timestamp".to_string())?;

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push(dns.to_string());
            }
        }
    }

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    Ok(ParsedCertificate {
        not_before,
        not_after,
        dns_names,
        common_name,
        public_key: cert.public_key().subject_public_key.data.to_vec(),
    })
}

/// On-disk certificate storage.
///
/// ```text
/// <root>/
///   account.json
///   live/<hostname>/fullchain.pem
///   live/<hostname>/privkey.pem
/// ```
#[derive(Debug, Clone)]
pub struct CertificateStore {
    root: PathBuf,
    window: RenewalWindow,
}

impl CertificateStore {
    pub fn new(root: impl Into<PathBuf>, window: RenewalWindow) -> Self {
        Self {
            root: root.into(),
            window,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn window(&self) -> RenewalWindow {
        self.window
    }

    pub fn account_path(&self) -> PathBuf {
        self.root.join("account.json")
    }

    pub fn live_dir(&self, hostname: &Hostname) -> PathBuf {
        self.root.join("live").join(hostname.as_str())
    }

    /// Returns `(certificate_path, private_key_path)`.
    pub fn paths_for(&self, hostname: &Hostname) -> (PathBuf, PathBuf) {
        let dir = self.live_dir(hostname);
        (dir.join(CERTIFICATE_FILE), dir.join(PRIVATE_KEY_FILE))
    }

    /// Load the stored certificate for `hostname`. `Ok(None)` means nothing is stored yet.
    pub fn load(
        &self,
        hostname: &Hostname,
        now: DateTime<Utc>,
    ) -> Result<Option<CertificateRecord>, StoreError> {
        let (certificate_path, private_key_path) = self.paths_for(hostname);
        if !certificate_path.exists() || !private_key_path.exists() {
            debug!(hostname = %hostname, "No stored certificate");
            return Ok(None);
        }

        let cert_pem = read(&certificate_path)?;
        let key_pem = read(&private_key_path)?;
        self.record_from_pem(hostname, &cert_pem, &key_pem, now)
            .map(Some)
    }

    /// Install a new certificate chain and key, returning the resulting record.
    ///
    /// Both files are staged before either is published. If the chain cannot be published the
    /// previous key is put back, so the live pair always belongs together.
    pub fn install(
        &self,
        hostname: &Hostname,
        cert_pem: &str,
        key_pem: &str,
        now: DateTime<Utc>,
    ) -> Result<CertificateRecord, StoreError> {
        let (certificate_path, private_key_path) = self.paths_for(hostname);
        let record = self.record_from_pem(hostname, cert_pem, key_pem, now)?;

        let live_dir = self.live_dir(hostname);
        create_private_dir(&live_dir).map_err(|source| StoreError::Io {
            path: live_dir.clone(),
            source,
        })?;

        let key_staging = staging_path(&private_key_path);
        let cert_staging = staging_path(&certificate_path);
        let discard = || {
            let _ = fs::remove_file(&key_staging);
            let _ = fs::remove_file(&cert_staging);
        };

        if let Err(source) = write_staged(&key_staging, key_pem.as_bytes(), 0o600) {
            discard();
            return Err(StoreError::Io {
                path: private_key_path,
                source,
            });
        }
        if let Err(source) = write_staged(&cert_staging, cert_pem.as_bytes(), 0o600) {
            discard();
            return Err(StoreError::Io {
                path: certificate_path,
                source,
            });
        }

        let previous_key = match fs::read(&private_key_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(source) => {
                discard();
                return Err(StoreError::Io {
                    path: private_key_path,
                    source,
                });
            }
        };

        if let Err(source) = fs::rename(&key_staging, &private_key_path) {
            discard();
            return Err(StoreError::Io {
                path: private_key_path,
                source,
            });
        }
        if let Err(source) = fs::rename(&cert_staging, &certificate_path) {
            discard();
            restore_key(&private_key_path, previous_key.as_deref());
            return Err(StoreError::Io {
                path: certificate_path,
                source,
            });
        }

        info!(
            hostname = %hostname,
            not_after = %record.not_after,
            path = ?certificate_path,
            "Installed certificate"
        );
        Ok(record)
    }

    fn record_from_pem(
        &self,
        hostname: &Hostname,
        cert_pem: &str,
        key_pem: &str,
        now: DateTime<Utc>,
    ) -> Result<CertificateRecord, StoreError> {
        let (certificate_path, private_key_path) = self.paths_for(hostname);

        let parsed = parse_certificate_pem(cert_pem).map_err(|reason| StoreError::Parse {
            path: certificate_path.clone(),
            reason,
        })?;

        match rustls_pemfile::private_key(&mut key_pem.as_bytes()) {
            Ok(Some(_)) => {}
            _ => {
                return Err(StoreError::MissingKey {
                    path: private_key_path,
                });
            }
        }
        let key_pair = KeyPair::from_pem(key_pem).map_err(|_| StoreError::MissingKey {
            path: private_key_path.clone(),
        })?;
        if key_pair.public_key_raw() != parsed.public_key.as_slice() {
            return Err(StoreError::KeyMismatch {
                path: private_key_path,
            });
        }

        if !parsed.covers(hostname) {
            return Err(StoreError::HostnameNotCovered {
                hostname: hostname.to_string(),
                path: certificate_path,
            });
        }

        let mut record = CertificateRecord {
            hostname: hostname.clone(),
            certificate_path,
            private_key_path,
            not_after: parsed.not_after,
            issued_at: parsed.not_before,
            status: CertificateStatus::Present,
        };
        record.status = record.status_at(now, self.window);
        Ok(record)
    }
}

fn restore_key(path: &Path, previous: Option<&[u8]>) {
    let restored = match previous {
        Some(bytes) => write_atomic(path, bytes, 0o600),
        None => fs::remove_file(path),
    };
    if let Err(e) = restored {
        warn!(path = %path.display(), error = %e, "Failed to restore previous private key");
    }
}

fn read(path: &Path) -> Result<String, StoreError> {
    fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

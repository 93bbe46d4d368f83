use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus, Problem,
};
use once_cell::sync::Lazy;
use rcgen::{CertificateParams, KeyPair};
use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::core::certificate::{CertificateRecord, CertificateStore};
use crate::core::clock::Clock;
use crate::core::hostname::Hostname;
use crate::core::renderer::challenge_token_dir;
use crate::metrics::AcquisitionTimer;
use crate::ports::acquirer::{AcquireError, AcquireFuture, AcquireResult, CertificateAcquirer};
use crate::utils::atomic_file::{create_private_dir, write_atomic};

static RETRY_AFTER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"retry after (\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2})").expect("retry-after pattern compiles")
});

#[derive(Debug, Clone)]
pub struct AcmeSettings {
    pub email: String,
    pub directory_url: String,
    /// Webroot served under `/.well-known/acme-challenge/` by the proxy
    pub challenge_dir: PathBuf,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
}

impl AcmeSettings {
    /// Let's Encrypt staging or production, unless a custom directory is configured.
    pub fn directory_url(staging: bool, custom: Option<&str>) -> String {
        match custom {
            Some(url) => url.to_string(),
            None if staging => LetsEncrypt::Staging.url().to_string(),
            None => LetsEncrypt::Production.url().to_string(),
        }
    }
}

/// Obtains certificates over ACME with HTTP-01 challenges served from the proxy's webroot.
pub struct AcmeAcquirer {
    settings: AcmeSettings,
    store: Arc<CertificateStore>,
    clock: Arc<dyn Clock>,
    account: Mutex<Option<Account>>,
}

impl AcmeAcquirer {
    pub fn new(settings: AcmeSettings, store: Arc<CertificateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            store,
            clock,
            account: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &AcmeSettings {
        &self.settings
    }

    /// Load the registered account from storage, registering a new one on first use.
    async fn account(&self) -> AcquireResult<Account> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        let path = self.store.account_path();
        let account = match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let credentials: AccountCredentials = serde_json::from_str(&text).map_err(|e| {
                    AcquireError::Protocol(format!(
                        "unreadable account credentials {}: {e}",
                        path.display()
                    ))
                })?;
                debug!(path = %path.display(), "Loaded ACME account credentials");
                Account::from_credentials(credentials)
                    .await
                    .map_err(|e| AcquireError::Protocol(format!("invalid account credentials: {e}")))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => self.register(&path).await?,
            Err(e) => {
                return Err(AcquireError::Protocol(format!(
                    "cannot read account credentials {}: {e}",
                    path.display()
                )));
            }
        };

        *cached = Some(account.clone());
        Ok(account)
    }

    async fn register(&self, path: &Path) -> AcquireResult<Account> {
        let contact = format!("mailto:{}", self.settings.email);
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&contact],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.settings.directory_url,
            None,
        )
        .await
        .map_err(|e| map_acme_error("", e))?;

        let encoded = serde_json::to_vec_pretty(&credentials)
            .map_err(|e| AcquireError::Protocol(format!("cannot encode account credentials: {e}")))?;
        let persisted = create_private_dir(self.store.root())
            .and_then(|()| write_atomic(path, &encoded, 0o600));
        if let Err(e) = persisted {
            // The account stays usable for this run; the next start registers again.
            warn!(path = %path.display(), error = %e, "Failed to persist ACME account credentials");
        }

        info!(
            directory = %self.settings.directory_url,
            contact = %contact,
            "Registered ACME account"
        );
        Ok(account)
    }

    async fn order_certificate(
        &self,
        hostname: &Hostname,
        challenge_dir: &Path,
    ) -> AcquireResult<CertificateRecord> {
        let _timer = AcquisitionTimer::new("acme");
        let account = self.account().await?;
        let host = hostname.as_str();

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[Identifier::Dns(host.to_string())],
            })
            .await
            .map_err(|e| map_acme_error(host, e))?;
        info!(hostname = %hostname, "Created ACME order");

        let mut tokens = Vec::new();
        let validated = self
            .complete_challenges(&mut order, host, challenge_dir, &mut tokens)
            .await;
        for path in tokens {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove challenge token");
            }
        }
        validated?;

        let key_pair = KeyPair::generate()
            .map_err(|e| AcquireError::Protocol(format!("key generation failed: {e}")))?;
        let params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| AcquireError::Protocol(format!("invalid certificate request: {e}")))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AcquireError::Protocol(format!("cannot build CSR: {e}")))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|e| map_acme_error(host, e))?;
        let chain = self.wait_for_certificate(&mut order, host).await?;

        let record = self
            .store
            .install(hostname, &chain, &key_pair.serialize_pem(), self.clock.now())?;
        info!(
            hostname = %hostname,
            not_after = %record.not_after,
            "Certificate issued"
        );
        Ok(record)
    }

    /// Publish a key authorization for each pending authorization and wait until the authority
    /// has validated all of them. Written token paths are pushed to `tokens`.
    async fn complete_challenges(
        &self,
        order: &mut Order,
        host: &str,
        challenge_dir: &Path,
        tokens: &mut Vec<PathBuf>,
    ) -> AcquireResult<()> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| map_acme_error(host, e))?;
        let token_dir = challenge_token_dir(challenge_dir);

        let mut ready = Vec::new();
        for authorization in &authorizations {
            match &authorization.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(AcquireError::ValidationFailed {
                        hostname: host.to_string(),
                        detail: format!("authorization is {status:?}"),
                    });
                }
            }

            let challenge = authorization
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    AcquireError::Protocol("authority offered no http-01 challenge".to_string())
                })?;

            let path = token_dir.join(&challenge.token);
            let key_authorization = order.key_authorization(challenge);
            write_atomic(&path, key_authorization.as_str().as_bytes(), 0o644).map_err(|e| {
                AcquireError::Protocol(format!(
                    "cannot write challenge token {}: {e}",
                    path.display()
                ))
            })?;
            debug!(path = %path.display(), "Published challenge token");
            tokens.push(path);
            ready.push(challenge.url.clone());
        }

        for url in &ready {
            order
                .set_challenge_ready(url)
                .await
                .map_err(|e| map_acme_error(host, e))?;
        }
        if ready.is_empty() {
            return Ok(());
        }

        for attempt in 1..=self.settings.poll_attempts {
            sleep(self.settings.poll_interval).await;
            let authorizations = order
                .authorizations()
                .await
                .map_err(|e| map_acme_error(host, e))?;

            let mut pending = false;
            for authorization in &authorizations {
                match authorization.status {
                    AuthorizationStatus::Valid => {}
                    AuthorizationStatus::Pending => pending = true,
                    _ => {
                        let problem = authorization
                            .challenges
                            .iter()
                            .find(|c| c.r#type == ChallengeType::Http01)
                            .and_then(|c| c.error.as_ref());
                        return Err(match problem {
                            Some(problem) => classify(host, problem),
                            None => AcquireError::ValidationFailed {
                                hostname: host.to_string(),
                                detail: format!("authorization is {:?}", authorization.status),
                            },
                        });
                    }
                }
            }
            if !pending {
                info!(hostname = %host, attempt, "Challenges validated");
                return Ok(());
            }
            debug!(hostname = %host, attempt, "Waiting for challenge validation");
        }

        Err(AcquireError::ValidationFailed {
            hostname: host.to_string(),
            detail: format!(
                "validation still pending after {} polls",
                self.settings.poll_attempts
            ),
        })
    }

    async fn wait_for_certificate(&self, order: &mut Order, host: &str) -> AcquireResult<String> {
        for _ in 0..self.settings.poll_attempts {
            let status = order
                .refresh()
                .await
                .map_err(|e| map_acme_error(host, e))?
                .status;
            match status {
                OrderStatus::Valid => {
                    return order
                        .certificate()
                        .await
                        .map_err(|e| map_acme_error(host, e))?
                        .ok_or_else(|| {
                            AcquireError::Protocol(
                                "order is valid but has no certificate".to_string(),
                            )
                        });
                }
                OrderStatus::Invalid => {
                    return Err(AcquireError::Protocol("order became invalid".to_string()));
                }
                OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing => {
                    sleep(self.settings.poll_interval).await;
                }
            }
        }

        Err(AcquireError::AuthorityUnavailable(format!(
            "certificate not issued after {} polls",
            self.settings.poll_attempts
        )))
    }
}

impl CertificateAcquirer for AcmeAcquirer {
    fn acquire<'a>(&'a self, hostname: &'a Hostname, challenge_dir: &'a Path) -> AcquireFuture<'a> {
        Box::pin(self.order_certificate(hostname, challenge_dir))
    }

    fn renew<'a>(&'a self, existing: &'a CertificateRecord) -> AcquireFuture<'a> {
        Box::pin(async move {
            info!(
                hostname = %existing.hostname,
                not_after = %existing.not_after,
                "Renewing certificate"
            );
            self.order_certificate(&existing.hostname, &self.settings.challenge_dir)
                .await
        })
    }
}

fn map_acme_error(host: &str, error: instant_acme::Error) -> AcquireError {
    match error {
        instant_acme::Error::Api(problem) => classify(host, &problem),
        other => AcquireError::AuthorityUnavailable(other.to_string()),
    }
}

fn classify(host: &str, problem: &Problem) -> AcquireError {
    classify_problem(
        host,
        problem.r#type.as_deref().unwrap_or_default(),
        problem.detail.as_deref().unwrap_or_default(),
        problem.status,
    )
}

/// Map an RFC 8555 problem document onto the acquisition error taxonomy.
pub fn classify_problem(host: &str, kind: &str, detail: &str, status: Option<u16>) -> AcquireError {
    let name = kind.rsplit(':').next().unwrap_or(kind);
    let detail = if detail.is_empty() {
        kind.to_string()
    } else {
        detail.to_string()
    };

    match name {
        "connection" | "dns" | "incorrectResponse" | "unauthorized" | "tls" | "caa" => {
            AcquireError::ValidationFailed {
                hostname: host.to_string(),
                detail,
            }
        }
        "rateLimited" => AcquireError::RateLimited {
            retry_after: parse_retry_after(&detail),
            detail,
        },
        "serverInternal" => AcquireError::AuthorityUnavailable(detail),
        _ if status.is_some_and(|s| s >= 500) => AcquireError::AuthorityUnavailable(detail),
        _ => AcquireError::Protocol(detail),
    }
}

/// Extract the `retry after <timestamp>` hint Let's Encrypt puts in rate-limit details.
pub fn parse_retry_after(detail: &str) -> Option<DateTime<Utc>> {
    let captures = RETRY_AFTER_REGEX.captures(detail)?;
    let text = captures.get(1)?.as_str().replacen('T', " ", 1);
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

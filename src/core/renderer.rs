use std::fmt::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::core::certificate::CertificateRecord;
use crate::core::hostname::{Hostname, HostnameError};

pub const CHALLENGE_LOCATION: &str = "/.well-known/acme-challenge/";
pub const AWAITING_CERTIFICATE_BODY: &str = "awaiting certificate";

const RATE_LIMIT_ZONE: &str = "certgate_limit";
const UPSTREAM_NAME: &str = "certgate_backend";

/// How the proxy is serving traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyMode {
    /// Port 80 only: ACME challenges plus a placeholder response
    HttpOnly,
    /// TLS on 443, port 80 redirects and keeps serving challenges
    HttpsActive,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpOnly => f.write_str("http-only"),
            Self::HttpsActive => f.write_str("https-active"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub requests_per_second: u32,
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_second: 1,
            burst: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Backend `host:port`
    pub backend: String,
    /// Webroot; challenge files live under `<challenge_dir>/.well-known/acme-challenge/`
    pub challenge_dir: PathBuf,
    pub http_port: u16,
    pub https_port: u16,
    pub pid_path: PathBuf,
    pub rate_limit: RateLimitSettings,
    pub upstream_timeout: Duration,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            backend: "127.0.0.1:8080".to_string(),
            challenge_dir: PathBuf::from("/var/www/certgate"),
            http_port: 80,
            https_port: 443,
            pid_path: PathBuf::from("/run/nginx.pid"),
            rate_limit: RateLimitSettings::default(),
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RenderError {
    #[error("invalid hostname: {0}")]
    InvalidHostname(#[from] HostnameError),

    #[error("cannot render HTTPS configuration for {hostname}: no servable certificate")]
    MissingCertificate { hostname: String },

    #[error("certificate was issued for {found}, not {expected}")]
    HostnameMismatch { expected: String, found: String },

    #[error("failed to format configuration: {0}")]
    Format(#[from] fmt::Error),
}

/// Produces complete nginx configuration files. Rendering has no side effects.
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    settings: RenderSettings,
}

impl ConfigRenderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn render(
        &self,
        mode: ProxyMode,
        hostname: &str,
        record: Option<&CertificateRecord>,
    ) -> Result<String, RenderError> {
        let hostname = Hostname::parse(hostname)?;

        match mode {
            ProxyMode::HttpOnly => self.render_http_only(&hostname),
            ProxyMode::HttpsActive => {
                let record = match record {
                    Some(record) if record.status.is_servable() => record,
                    _ => {
                        return Err(RenderError::MissingCertificate {
                            hostname: hostname.to_string(),
                        });
                    }
                };
                if record.hostname != hostname {
                    return Err(RenderError::HostnameMismatch {
                        expected: hostname.to_string(),
                        found: record.hostname.to_string(),
                    });
                }
                self.render_https(&hostname, record)
            }
        }
    }

    fn render_http_only(&self, hostname: &Hostname) -> Result<String, RenderError> {
        let mut out = String::new();
        self.write_preamble(&mut out, ProxyMode::HttpOnly, hostname)?;
        writeln!(out, "http {{")?;
        self.write_http_common(&mut out)?;

        writeln!(out, "    server {{")?;
        writeln!(out, "        listen {};", self.settings.http_port)?;
        writeln!(out, "        server_name {};", hostname)?;
        writeln!(out)?;
        self.write_challenge_location(&mut out)?;
        writeln!(out)?;
        writeln!(out, "        location / {{")?;
        writeln!(out, "            default_type text/plain;")?;
        writeln!(
            out,
            "            return 200 \"{}\\n\";",
            AWAITING_CERTIFICATE_BODY
        )?;
        writeln!(out, "        }}")?;
        writeln!(out, "    }}")?;
        if self.settings.https_port != self.settings.http_port {
            // Holds the TLS port until a certificate exists; closes every connection.
            writeln!(out)?;
            writeln!(out, "    server {{")?;
            writeln!(out, "        listen {};", self.settings.https_port)?;
            writeln!(out, "        server_name {};", hostname)?;
            writeln!(out, "        return 444;")?;
            writeln!(out, "    }}")?;
        }
        writeln!(out, "}}")?;
        Ok(out)
    }

    fn render_https(
        &self,
        hostname: &Hostname,
        record: &CertificateRecord,
    ) -> Result<String, RenderError> {
        let settings = &self.settings;
        let timeout = settings.upstream_timeout.as_secs().max(1);

        let mut out = String::new();
        self.write_preamble(&mut out, ProxyMode::HttpsActive, hostname)?;
        writeln!(out, "http {{")?;
        self.write_http_common(&mut out)?;

        writeln!(
            out,
            "    limit_req_zone $binary_remote_addr zone={}:10m rate={}r/s;",
            RATE_LIMIT_ZONE, settings.rate_limit.requests_per_second
        )?;
        writeln!(out, "    limit_req_status 429;")?;
        writeln!(out)?;
        writeln!(out, "    upstream {} {{", UPSTREAM_NAME)?;
        writeln!(out, "        server {};", settings.backend)?;
        writeln!(out, "        keepalive 16;")?;
        writeln!(out, "    }}")?;
        writeln!(out)?;

        writeln!(out, "    server {{")?;
        writeln!(out, "        listen {};", settings.http_port)?;
        writeln!(out, "        server_name {};", hostname)?;
        writeln!(out)?;
        self.write_challenge_location(&mut out)?;
        writeln!(out)?;
        writeln!(out, "        location / {{")?;
        if settings.https_port == 443 {
            writeln!(out, "            return 301 https://{}$request_uri;", hostname)?;
        } else {
            writeln!(
                out,
                "            return 301 https://{}:{}$request_uri;",
                hostname, settings.https_port
            )?;
        }
        writeln!(out, "        }}")?;
        writeln!(out, "    }}")?;
        writeln!(out)?;

        writeln!(out, "    server {{")?;
        writeln!(out, "        listen {} ssl;", settings.https_port)?;
        writeln!(out, "        server_name {};", hostname)?;
        writeln!(out)?;
        writeln!(
            out,
            "        ssl_certificate {};",
            quoted(&record.certificate_path)
        )?;
        writeln!(
            out,
            "        ssl_certificate_key {};",
            quoted(&record.private_key_path)
        )?;
        writeln!(out, "        ssl_protocols TLSv1.2 TLSv1.3;")?;
        writeln!(out, "        ssl_prefer_server_ciphers off;")?;
        writeln!(out, "        ssl_session_cache shared:certgate_tls:10m;")?;
        writeln!(out, "        ssl_session_timeout 1d;")?;
        writeln!(out)?;
        writeln!(out, "        proxy_http_version 1.1;")?;
        writeln!(out, "        proxy_set_header Connection \"\";")?;
        writeln!(out, "        proxy_set_header Host $host;")?;
        writeln!(out, "        proxy_set_header X-Real-IP $remote_addr;")?;
        writeln!(
            out,
            "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
        )?;
        writeln!(out, "        proxy_set_header X-Forwarded-Proto $scheme;")?;
        writeln!(out, "        proxy_set_header X-Forwarded-Host $host;")?;
        writeln!(out, "        proxy_connect_timeout {}s;", timeout)?;
        writeln!(out, "        proxy_send_timeout {}s;", timeout)?;
        writeln!(out, "        proxy_read_timeout {}s;", timeout)?;
        writeln!(out)?;
        writeln!(out, "        location = /health {{")?;
        writeln!(out, "            proxy_pass http://{};", UPSTREAM_NAME)?;
        writeln!(out, "        }}")?;
        writeln!(out)?;
        writeln!(out, "        location / {{")?;
        writeln!(
            out,
            "            limit_req zone={} burst={} nodelay;",
            RATE_LIMIT_ZONE, settings.rate_limit.burst
        )?;
        writeln!(out, "            proxy_pass http://{};", UPSTREAM_NAME)?;
        writeln!(out, "        }}")?;
        writeln!(out, "    }}")?;
        writeln!(out, "}}")?;
        Ok(out)
    }

    fn write_preamble(
        &self,
        out: &mut String,
        mode: ProxyMode,
        hostname: &Hostname,
    ) -> fmt::Result {
        writeln!(out, "# Generated by certgate; manual edits are overwritten.")?;
        writeln!(out, "# mode: {}, hostname: {}", mode, hostname)?;
        writeln!(out, "worker_processes auto;")?;
        writeln!(out, "pid {};", quoted(&self.settings.pid_path))?;
        writeln!(out, "error_log stderr warn;")?;
        writeln!(out)?;
        writeln!(out, "events {{")?;
        writeln!(out, "    worker_connections 1024;")?;
        writeln!(out, "}}")?;
        writeln!(out)
    }

    fn write_http_common(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "    server_tokens off;")?;
        writeln!(out, "    default_type application/octet-stream;")?;
        writeln!(out, "    access_log off;")?;
        writeln!(out, "    sendfile on;")?;
        writeln!(out)
    }

    fn write_challenge_location(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "        location ^~ {} {{", CHALLENGE_LOCATION)?;
        writeln!(
            out,
            "            root {};",
            quoted(&self.settings.challenge_dir)
        )?;
        writeln!(out, "            default_type text/plain;")?;
        writeln!(out, "            try_files $uri =404;")?;
        writeln!(out, "        }}")
    }
}

/// Directory the proxy serves challenge tokens from.
pub fn challenge_token_dir(challenge_dir: &Path) -> PathBuf {
    challenge_dir.join(".well-known").join("acme-challenge")
}

fn quoted(path: &Path) -> String {
    let text = path.display().to_string();
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

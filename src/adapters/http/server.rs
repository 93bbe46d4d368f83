use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::core::certificate::{CertificateStatus, RenewalWindow};
use crate::core::clock::Clock;
use crate::core::hostname::Hostname;
use crate::core::renderer::ProxyMode;
use crate::core::scheduler::{RenewalAttempt, RenewalStatus, RenewalTrigger, SchedulerState};
use crate::utils::graceful_shutdown::ShutdownToken;

// Shared state for the admin handlers
#[derive(Clone)]
struct AppState {
    hostname: Hostname,
    status: Arc<RenewalStatus>,
    trigger: RenewalTrigger,
    clock: Arc<dyn Clock>,
    window: RenewalWindow,
    metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    hostname: String,
    mode: Option<ProxyMode>,
    scheduler: SchedulerState,
    certificate: Option<CertificateSummary>,
    consecutive_failures: u32,
    recent_attempts: Vec<RenewalAttempt>,
}

#[derive(Debug, Serialize)]
struct CertificateSummary {
    status: CertificateStatus,
    issued_at: DateTime<Utc>,
    not_after: DateTime<Utc>,
    renewal_due_at: DateTime<Utc>,
    remaining_days: i64,
    certificate_path: String,
}

#[derive(Debug, Serialize)]
struct RenewAccepted {
    accepted: bool,
}

/// Admin listener exposing renewal status, Prometheus metrics and a manual renewal trigger.
pub struct StatusServer {
    listen_addr: SocketAddr,
    app_state: AppState,
}

impl StatusServer {
    pub fn new(
        listen_addr: SocketAddr,
        hostname: Hostname,
        status: Arc<RenewalStatus>,
        trigger: RenewalTrigger,
        clock: Arc<dyn Clock>,
        window: RenewalWindow,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            listen_addr,
            app_state: AppState {
                hostname,
                status,
                trigger,
                clock,
                window,
                metrics,
            },
        }
    }

    fn build_app(&self) -> Router {
        Router::new()
            .route("/status", get(status_handler))
            .route("/metrics", get(metrics_handler))
            .route("/renew", post(renew_handler))
            .with_state(self.app_state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` fires.
    pub async fn run(self, mut shutdown: ShutdownToken) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("Failed to bind admin listener on {}", self.listen_addr))?;
        tracing::info!(addr = %self.listen_addr, "Admin server listening");

        axum::serve(listener, self.build_app())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await
            .context("Admin server failed")?;

        tracing::info!("Admin server stopped");
        Ok(())
    }
}

async fn status_handler(State(app_state): State<AppState>) -> Json<StatusReport> {
    let now = app_state.clock.now();
    let certificate = app_state.status.record().map(|mut record| {
        record.refresh_status(now, app_state.window);
        CertificateSummary {
            status: record.status,
            issued_at: record.issued_at,
            not_after: record.not_after,
            renewal_due_at: record.renewal_due_at(app_state.window),
            remaining_days: record.remaining(now).num_days(),
            certificate_path: record.certificate_path.display().to_string(),
        }
    });
    let log = app_state.status.log();

    Json(StatusReport {
        hostname: app_state.hostname.to_string(),
        mode: app_state.status.mode(),
        scheduler: app_state.status.state(),
        certificate,
        consecutive_failures: log.consecutive_failures(),
        recent_attempts: log.entries(),
    })
}

async fn metrics_handler(State(app_state): State<AppState>) -> Response {
    match &app_state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn renew_handler(State(app_state): State<AppState>) -> (StatusCode, Json<RenewAccepted>) {
    let accepted = app_state.trigger.request();
    tracing::info!(accepted, "Manual renewal requested over admin API");
    (StatusCode::ACCEPTED, Json(RenewAccepted { accepted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::AttemptOutcome;
    use crate::core::testing::{ManualClock, record_for, utc};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn server(status: Arc<RenewalStatus>) -> StatusServer {
        StatusServer::new(
            "127.0.0.1:0".parse().unwrap(),
            Hostname::parse("api.example.com").unwrap(),
            status.clone(),
            RenewalTrigger::new(status),
            Arc::new(ManualClock::new(utc(2025, 3, 10))),
            RenewalWindow::FinalThird,
            None,
        )
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_status_reports_certificate_and_attempts() {
        let status = Arc::new(RenewalStatus::default());
        status.set_record(record_for("api.example.com", utc(2025, 1, 1), 90));
        status.set_mode(ProxyMode::HttpsActive);
        status.log().record(RenewalAttempt {
            timestamp: utc(2025, 2, 1),
            outcome: AttemptOutcome::Failure,
            reason: "authority unavailable".to_string(),
            retry_after: None,
        });

        let (code, body) = call(server(status).build_app(), "GET", "/status").await;

        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["hostname"], "api.example.com");
        assert_eq!(body["mode"], "https-active");
        assert_eq!(body["scheduler"], "idle");
        assert_eq!(body["certificate"]["status"], "expiring");
        assert_eq!(body["certificate"]["remaining_days"], 22);
        assert_eq!(body["consecutive_failures"], 1);
        assert_eq!(body["recent_attempts"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_before_bootstrap() {
        let (code, body) = call(
            server(Arc::new(RenewalStatus::default())).build_app(),
            "GET",
            "/status",
        )
        .await;

        assert_eq!(code, StatusCode::OK);
        assert!(body["certificate"].is_null());
        assert!(body["mode"].is_null());
    }

    #[tokio::test]
    async fn test_renew_is_accepted_only_with_certificate() {
        let status = Arc::new(RenewalStatus::default());
        let (code, body) = call(server(status.clone()).build_app(), "POST", "/renew").await;
        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], false);

        status.set_record(record_for("api.example.com", utc(2025, 1, 1), 90));
        let (code, body) = call(server(status).build_app(), "POST", "/renew").await;
        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(body["accepted"], true);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let (code, _) = call(
            server(Arc::new(RenewalStatus::default())).build_app(),
            "GET",
            "/metrics",
        )
        .await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}

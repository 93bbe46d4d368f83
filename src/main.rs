use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use clap::Parser;

use certgate::adapters::{
    AcmeAcquirer, AcmeSettings, HyperHttpClient, NginxController, NginxSettings, StatusServer,
};
use certgate::config::{AppConfig, ConfigValidator, load_config_or_default};
use certgate::core::orchestrator::{
    BootstrapError, BootstrapOrchestrator, BootstrapSettings, Collaborators,
};
use certgate::core::renderer::{ConfigRenderer, RateLimitSettings, RenderSettings};
use certgate::core::retry::RetryPolicy;
use certgate::core::scheduler::{RenewalStatus, RenewalTrigger, SchedulerSettings};
use certgate::core::{CertificateStore, Clock, RenewalWindow, SystemClock};
use certgate::metrics;
use certgate::ports::ProxyController;
use certgate::tracing_setup::{LogFormat, init_tracing, shutdown_tracing};
use certgate::utils::graceful_shutdown::GracefulShutdown;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// YAML configuration file; optional when everything is given on the command line
    #[arg(short, long, env = "CERTGATE_CONFIG", default_value = "certgate.yaml")]
    config: PathBuf,

    /// Public hostname to obtain a certificate for
    #[arg(long, env = "CERTGATE_HOSTNAME")]
    hostname: Option<String>,

    /// ACME account contact email
    #[arg(long, env = "CERTGATE_EMAIL")]
    email: Option<String>,

    /// Backend `host:port` to proxy to
    #[arg(long, env = "CERTGATE_BACKEND")]
    backend: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[arg(long, env = "CERTGATE_STAGING")]
    staging: bool,

    #[arg(long, value_enum, env = "CERTGATE_LOG_FORMAT", default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format).map_err(|e| anyhow!("Failed to initialize tracing: {e}"))?;

    let config = load_config_or_default(&args.config)
        .await
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    let config = apply_overrides(config, &args);
    ConfigValidator::validate(&config)?;

    let prometheus = match metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics recorder unavailable");
            None
        }
    };

    let shutdown = Arc::new(GracefulShutdown::with_timeout(
        config.proxy.shutdown_grace_period,
    ));
    let status = Arc::new(RenewalStatus::default());
    let trigger = RenewalTrigger::new(status.clone());

    let signal_shutdown = shutdown.clone();
    let signal_trigger = trigger.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_shutdown
            .run_signal_handler(Some(signal_trigger))
            .await
        {
            tracing::error!(error = %e, "Signal handler failed");
        }
    });

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let window = RenewalWindow::from_days(config.acme.renew_before_days);
    let store = Arc::new(CertificateStore::new(&config.acme.storage_path, window));
    let renderer = Arc::new(ConfigRenderer::new(render_settings(&config)));
    let proxy = Arc::new(NginxController::new(NginxSettings {
        binary: config.proxy.binary.clone(),
        config_path: config.proxy.config_path.clone(),
        http_port: config.proxy.http_port,
        https_port: config.proxy.https_port,
        bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        startup_grace: config.proxy.startup_grace,
        stop_timeout: config.proxy.shutdown_grace_period,
    }));
    let acquirer = Arc::new(AcmeAcquirer::new(
        AcmeSettings {
            email: config.email.clone(),
            directory_url: AcmeSettings::directory_url(
                config.acme.staging,
                config.acme.directory_url.as_deref(),
            ),
            challenge_dir: config.acme.challenge_dir.clone(),
            poll_interval: config.acme.poll_interval,
            poll_attempts: config.acme.poll_attempts,
        },
        store.clone(),
        clock.clone(),
    ));

    let mut orchestrator = BootstrapOrchestrator::new(
        bootstrap_settings(&config),
        Collaborators {
            renderer,
            proxy: proxy.clone(),
            acquirer,
            store,
            http_client: Arc::new(HyperHttpClient::new()),
            clock: clock.clone(),
        },
        status.clone(),
        trigger.clone(),
    );

    let bootstrapped = match orchestrator.run(&shutdown).await {
        Ok(bootstrapped) => bootstrapped,
        Err(BootstrapError::Cancelled) => {
            tracing::info!("Shutdown requested during bootstrap");
            proxy.stop().await?;
            shutdown_tracing();
            return Ok(());
        }
        Err(e) => {
            // nginx keeps serving whatever configuration was last applied.
            tracing::error!(
                error = %e,
                state = %orchestrator.state(),
                "Bootstrap failed"
            );
            return Err(e.into());
        }
    };

    if let Some(listen_addr) = &config.admin.listen_addr {
        let addr: SocketAddr = listen_addr
            .parse()
            .with_context(|| format!("Invalid admin listen address {listen_addr}"))?;
        let server = StatusServer::new(
            addr,
            bootstrapped.hostname.clone(),
            status.clone(),
            trigger.clone(),
            clock,
            window,
            prometheus,
        );
        let token = shutdown.shutdown_token();
        tokio::spawn(async move {
            if let Err(e) = server.run(token).await {
                tracing::error!(error = %e, "Admin server failed");
            }
        });
    }

    tracing::info!(
        hostname = %bootstrapped.hostname,
        not_after = %bootstrapped.record.not_after,
        "certgate is serving HTTPS"
    );

    shutdown.wait_for_shutdown_signal().await;

    match tokio::time::timeout(shutdown.shutdown_timeout(), bootstrapped.scheduler_task).await {
        Ok(Ok(())) => tracing::info!("Renewal scheduler stopped"),
        Ok(Err(e)) => tracing::error!(error = %e, "Renewal scheduler task failed"),
        Err(_) => tracing::warn!("Renewal scheduler did not stop within the grace period"),
    }

    if let Err(e) = proxy.stop().await {
        tracing::error!(error = %e, "Failed to stop nginx");
    }

    shutdown_tracing();
    Ok(())
}

fn apply_overrides(config: AppConfig, args: &Args) -> AppConfig {
    let mut builder = AppConfig::builder().base(config);
    if let Some(hostname) = &args.hostname {
        builder = builder.hostname(hostname);
    }
    if let Some(email) = &args.email {
        builder = builder.email(email);
    }
    if let Some(backend) = &args.backend {
        builder = builder.backend(backend);
    }
    if args.staging {
        builder = builder.staging(true);
    }
    builder.build()
}

fn render_settings(config: &AppConfig) -> RenderSettings {
    RenderSettings {
        backend: config.backend.clone(),
        challenge_dir: config.acme.challenge_dir.clone(),
        http_port: config.proxy.http_port,
        https_port: config.proxy.https_port,
        pid_path: config.proxy.pid_path.clone(),
        rate_limit: RateLimitSettings {
            requests_per_second: config.rate_limit.requests_per_second,
            burst: config.rate_limit.burst,
        },
        upstream_timeout: config.upstream_timeout,
    }
}

fn bootstrap_settings(config: &AppConfig) -> BootstrapSettings {
    BootstrapSettings {
        hostname: config.hostname.clone(),
        email: config.email.clone(),
        backend: config.backend.clone(),
        challenge_dir: config.acme.challenge_dir.clone(),
        http_port: config.proxy.http_port,
        probe_attempts: config.proxy.startup_probe_attempts,
        probe_interval: config.proxy.startup_probe_interval,
        probe_timeout: config.proxy.startup_probe_interval.max(std::time::Duration::from_secs(2)),
        retry: RetryPolicy {
            validation_retries: config.acme.validation_retries,
            validation_delay: config.acme.validation_retry_delay,
            unavailable_max_retries: config.acme.unavailable_max_retries,
            unavailable_backoff_base: config.acme.unavailable_backoff_base,
            unavailable_backoff_ceiling: config.acme.unavailable_backoff_ceiling,
        },
        scheduler: SchedulerSettings {
            period: config.renewal.period,
            failure_backoff: config.renewal.failure_backoff,
            jitter: config.renewal.jitter,
            initial_delay: config.renewal.initial_delay,
        },
    }
}

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ports::proxy::{ProxyController, ProxyError, ProxyFuture, ProxyResult};
use crate::utils::atomic_file::staging_path;

#[derive(Debug, Clone)]
pub struct NginxSettings {
    pub binary: PathBuf,
    /// Live configuration file; nginx is started with `-c` pointing here
    pub config_path: PathBuf,
    pub http_port: u16,
    pub https_port: u16,
    pub bind_address: IpAddr,
    /// nginx must survive this long after spawn to count as started
    pub startup_grace: Duration,
    pub stop_timeout: Duration,
}

impl Default for NginxSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("nginx"),
            config_path: PathBuf::from("/etc/nginx/nginx.conf"),
            http_port: 80,
            https_port: 443,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            startup_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// Supervises a single foreground nginx master process.
pub struct NginxController {
    settings: NginxSettings,
    child: Mutex<Option<Child>>,
}

impl NginxController {
    pub fn new(settings: NginxSettings) -> Self {
        Self {
            settings,
            child: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &NginxSettings {
        &self.settings
    }

    fn binary_name(&self) -> String {
        self.settings.binary.display().to_string()
    }

    fn check_port(&self, port: u16) -> ProxyResult<()> {
        if port == 0 {
            return Ok(());
        }
        let addr = SocketAddr::new(self.settings.bind_address, port);
        TcpListener::bind(addr)
            .map(drop)
            .map_err(|source| ProxyError::BindError { port, source })
    }

    async fn spawn(&self) -> ProxyResult<()> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            match child.try_wait()? {
                None => {
                    return Err(ProxyError::AlreadyRunning {
                        pid: child.id().unwrap_or_default(),
                    });
                }
                Some(status) => {
                    warn!(%status, "Previous nginx process has exited");
                    *slot = None;
                }
            }
        }

        self.check_port(self.settings.http_port)?;
        if self.settings.https_port != self.settings.http_port {
            self.check_port(self.settings.https_port)?;
        }

        let mut child = Command::new(&self.settings.binary)
            .arg("-c")
            .arg(&self.settings.config_path)
            .arg("-g")
            .arg("daemon off;")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProxyError::Spawn {
                binary: self.binary_name(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "nginx", "{}", line);
                }
            });
        }

        tokio::time::sleep(self.settings.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            return Err(ProxyError::Exited {
                status: status.to_string(),
            });
        }

        info!(
            pid = child.id(),
            config = %self.settings.config_path.display(),
            "nginx started"
        );
        *slot = Some(child);
        Ok(())
    }

    async fn validate_and_install(&self, config_text: &str) -> ProxyResult<()> {
        let live = &self.settings.config_path;
        let staged = staging_path(live);
        if let Some(parent) = live.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&staged, config_text).await?;

        let output = Command::new(&self.settings.binary)
            .arg("-t")
            .arg("-q")
            .arg("-c")
            .arg(&staged)
            .stdin(Stdio::null())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(source) => {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(ProxyError::Spawn {
                    binary: self.binary_name(),
                    source,
                });
            }
        };
        if !output.status.success() {
            let _ = tokio::fs::remove_file(&staged).await;
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(error = %stderr, "nginx rejected configuration");
            return Err(ProxyError::ReloadError(stderr));
        }

        tokio::fs::rename(&staged, live).await?;
        debug!(path = %live.display(), "Installed nginx configuration");
        Ok(())
    }

    async fn signal_master(&self) -> ProxyResult<()> {
        let mut slot = self.child.lock().await;
        let Some(child) = slot.as_mut() else {
            return Err(ProxyError::NotRunning);
        };
        if let Some(status) = child.try_wait()? {
            warn!(%status, "nginx exited unexpectedly");
            *slot = None;
            return Err(ProxyError::NotRunning);
        }
        let pid = child.id().ok_or(ProxyError::NotRunning)?;

        kill(Pid::from_raw(pid as i32), Signal::SIGHUP)
            .map_err(|e| ProxyError::ReloadError(format!("failed to signal nginx: {e}")))?;
        info!(pid, "Sent reload signal to nginx");
        Ok(())
    }

    #[cfg(test)]
    async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }

    async fn terminate(&self) -> ProxyResult<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            debug!("nginx is not running, nothing to stop");
            return Ok(());
        };

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGQUIT) {
                warn!(pid, error = %e, "Failed to send graceful stop signal");
            }
        }

        match tokio::time::timeout(self.settings.stop_timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(%status, "nginx stopped");
            }
            Err(_) => {
                warn!(
                    timeout = ?self.settings.stop_timeout,
                    "nginx did not drain in time, killing"
                );
                child.kill().await?;
            }
        }
        Ok(())
    }
}

impl ProxyController for NginxController {
    fn start<'a>(&'a self) -> ProxyFuture<'a> {
        Box::pin(self.spawn())
    }

    fn apply<'a>(&'a self, config_text: &'a str) -> ProxyFuture<'a> {
        Box::pin(self.validate_and_install(config_text))
    }

    fn reload<'a>(&'a self) -> ProxyFuture<'a> {
        Box::pin(self.signal_master())
    }

    fn stop<'a>(&'a self) -> ProxyFuture<'a> {
        Box::pin(self.terminate())
    }
}

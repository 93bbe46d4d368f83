use std::path::Path;
use thiserror::Error;
use tokio::fs;

use crate::config::models::AppConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

pub async fn load_config<P: AsRef<Path>>(path: P) -> ConfigResult<AppConfig> {
    let config_content = fs::read_to_string(path).await?;
    let config: AppConfig = serde_yaml::from_str(&config_content)?;
    Ok(config)
}

/// Load `path` when it exists, otherwise start from defaults. Everything required can be
/// supplied on the command line, so the file is optional.
pub async fn load_config_or_default<P: AsRef<Path>>(path: P) -> ConfigResult<AppConfig> {
    let path = path.as_ref();
    if fs::try_exists(path).await? {
        tracing::info!(path = %path.display(), "Loading configuration file");
        load_config(path).await
    } else {
        tracing::info!(path = %path.display(), "No configuration file, using defaults");
        Ok(AppConfig::default())
    }
}

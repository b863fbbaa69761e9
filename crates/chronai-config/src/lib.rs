//! chronai-config: configuration loading and encryption-key bootstrap.
//!
//! Configuration lives in `~/.chronai/config.json5` with environment
//! overrides (a `.env` file is honored via dotenvy). The credential
//! encryption key is sourced from `CHRONAI_ENCRYPTION_KEY`, falling back
//! to `~/.chronai/encryption.key`, which is generated on first start.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Gateway server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token for API authentication (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_port() -> u16 {
    8300
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path. Defaults to `~/.chronai/chronai.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    /// Resolve the database path, creating the config dir if needed.
    pub fn resolve_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(ensure_config_dir()?.join("chronai.db")),
        }
    }
}

/// Top-level chronai configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChronaiConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Resolve the chronai config directory (~/.chronai/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".chronai"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.chronai/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Load configuration from the default path, falling back to defaults.
pub fn load_config() -> Result<ChronaiConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    let mut config = load_config_from(&path)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<ChronaiConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(ChronaiConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: ChronaiConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Environment variables win over the config file.
fn apply_env_overrides(config: &mut ChronaiConfig) {
    if let Ok(host) = std::env::var("CHRONAI_HOST") {
        config.gateway.host = host;
    }
    if let Ok(port) = std::env::var("CHRONAI_PORT")
        && let Ok(port) = port.parse()
    {
        config.gateway.port = port;
    }
    if let Ok(token) = std::env::var("CHRONAI_AUTH_TOKEN") {
        config.gateway.auth_token = Some(token);
    }
    if let Ok(path) = std::env::var("CHRONAI_DB_PATH") {
        config.database.path = Some(PathBuf::from(path));
    }
}

/// Source the base64 credential-encryption key, generating and persisting
/// one on first start.
///
/// Order: `CHRONAI_ENCRYPTION_KEY` env var, then `~/.chronai/encryption.key`,
/// else a fresh key is generated and written (0600 on unix).
pub fn ensure_encryption_key() -> Result<String, ConfigError> {
    if let Ok(key) = std::env::var("CHRONAI_ENCRYPTION_KEY")
        && !key.trim().is_empty()
    {
        return Ok(key);
    }

    let key_path = config_dir()?.join("encryption.key");
    ensure_encryption_key_at(&key_path)
}

/// Key bootstrap against an explicit path.
pub fn ensure_encryption_key_at(key_path: &Path) -> Result<String, ConfigError> {
    if key_path.exists() {
        return Ok(std::fs::read_to_string(key_path)?.trim().to_string());
    }

    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let key = chronai_security::generate_key();
    write_restricted(key_path, &key)?;
    tracing::info!("Generated new encryption key at {}", key_path.display());
    Ok(key)
}

#[cfg(unix)]
fn write_restricted(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())
}

#[cfg(not(unix))]
fn write_restricted(path: &Path, content: &str) -> std::io::Result<()> {
    std::fs::write(path, content)
}

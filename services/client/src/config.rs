//! Client configuration and connection-status files.
//!
//! Two JSON files under a user-scoped config directory
//! (`<config_dir>/outpost`):
//! - `config.json` — `{domain, createdAt, updatedAt}`; `createdAt` is
//!   preserved across re-inits.
//! - `status.json` — `{connected, connectedAt, port, domain}`; written on
//!   connect, unlinked on disconnect.
//!
//! Timestamps are RFC 3339 UTC with millisecond precision.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Edge base URL, scheme included, no trailing slash.
    pub domain: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub connected_at: String,
    pub port: u16,
    pub domain: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid tunnel URL '{0}': must begin with http:// or https://")]
    InvalidScheme(String),
    #[error("invalid tunnel URL '{0}': {1}")]
    Unparseable(String, String),
    #[error("no tunnel configured; run `outpost init <url>` first")]
    NotConfigured,
}

/// Handle to the config directory; all file paths derive from it.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The user-scoped default location.
    pub fn open_default() -> Self {
        let dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("outpost");
        Self::new(dir)
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join("status.json")
    }

    /// Validate and normalize an edge URL: http(s) scheme required, one
    /// trailing slash trimmed, must parse as a URL.
    pub fn normalize_domain(raw: &str) -> Result<String, ConfigError> {
        if !raw.starts_with("http://") && !raw.starts_with("https://") {
            return Err(ConfigError::InvalidScheme(raw.to_owned()));
        }
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        Url::parse(trimmed)
            .map_err(|e| ConfigError::Unparseable(raw.to_owned(), e.to_string()))?;
        Ok(trimmed.to_owned())
    }

    /// Persist `url` as the configured domain, keeping the original
    /// `createdAt` when a config already exists.
    pub fn init(&self, url: &str) -> Result<ClientConfig, ConfigError> {
        let domain = Self::normalize_domain(url)?;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let created_at = match self.load() {
            Ok(existing) => existing.created_at,
            Err(_) => now.clone(),
        };
        let config = ClientConfig {
            domain,
            created_at,
            updated_at: now,
        };
        std::fs::create_dir_all(&self.dir)?;
        write_json(&self.config_path(), &config)?;
        Ok(config)
    }

    pub fn load(&self) -> Result<ClientConfig, ConfigError> {
        let text = match std::fs::read_to_string(self.config_path()) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotConfigured);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    /// Record a live connection; the file exists exactly while connected.
    pub fn write_status(&self, status: &ConnectionStatus) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.dir)?;
        write_json(&self.status_path(), status)
    }

    pub fn clear_status(&self) -> Result<(), ConfigError> {
        match std::fs::remove_file(self.status_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_status(&self) -> Result<Option<ConnectionStatus>, ConfigError> {
        let text = match std::fs::read_to_string(self.status_path()) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ConfigError> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text)?;
    Ok(())
}

/// Current time in the format both files use.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! where the device lives, which endpoints it exposes, how long a session
//! token is trusted, and where the session is persisted.
//!
//! Configuration is stored at `~/.config/devgate/config.json`. Every field has
//! a default, so a missing file or a partial file both load.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::policy::{SessionPolicy, DEFAULT_MAX_TOKEN_AGE_HOURS};
use crate::auth::storage::{FileStorage, KeyringStorage, MemoryStorage, StorageBackend};
use crate::auth::TokenStore;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "devgate";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Where the session record is persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

impl FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!("Unknown storage kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub login_path: String,
    pub logout_path: String,
    pub validate_path: String,
    pub mode_path: String,
    pub status_path: String,
    /// Paths reachable without a session, in addition to the login path.
    pub public_paths: Vec<String>,
    pub max_token_age_secs: u64,
    pub request_timeout_secs: u64,
    pub logout_timeout_secs: u64,
    pub storage: StorageKind,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.4.1".to_string(),
            login_path: "/api/login".to_string(),
            logout_path: "/api/logout".to_string(),
            validate_path: "/api/validate".to_string(),
            mode_path: "/api/mode".to_string(),
            status_path: "/api/status".to_string(),
            public_paths: vec!["/api/status".to_string(), "/api/health".to_string()],
            max_token_age_secs: DEFAULT_MAX_TOKEN_AGE_HOURS as u64 * 3600,
            request_timeout_secs: 30,
            logout_timeout_secs: 5,
            storage: StorageKind::File,
            last_username: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Apply `DEVGATE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("DEVGATE_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(username) = std::env::var("DEVGATE_USERNAME") {
            self.last_username = Some(username);
        }
        if let Ok(kind) = std::env::var("DEVGATE_STORAGE") {
            self.storage = kind.parse()?;
        }
        Ok(())
    }

    /// Absolute URL for an endpoint path.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn logout_timeout(&self) -> Duration {
        Duration::from_secs(self.logout_timeout_secs)
    }

    pub fn policy(&self) -> SessionPolicy {
        let secs = i64::try_from(self.max_token_age_secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1000);
        let max_age = chrono::Duration::seconds(secs);
        SessionPolicy::new(&self.login_path, &self.public_paths, max_age)
    }

    /// Token store backed by the configured storage kind.
    pub fn token_store(&self) -> Result<TokenStore> {
        let backend: Arc<dyn StorageBackend> = match self.storage {
            StorageKind::File => Arc::new(FileStorage::new(self.cache_dir()?)),
            StorageKind::Keyring => Arc::new(KeyringStorage),
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
        };
        Ok(TokenStore::new(backend))
    }
}

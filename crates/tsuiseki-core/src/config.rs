use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::TsuisekiError;

const DEFAULT_CONFIG: &str = include_str!("../../../config/default.toml");

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub sync: SyncConfig,
    pub trakt: TraktConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub log_filter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub pull_after_push: bool,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraktConfig {
    pub client_id: Option<String>,
    pub base_url: String,
}

impl AppConfig {
    /// Load config: user file (if exists) merged over built-in defaults.
    pub fn load() -> Result<Self, TsuisekiError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from an explicit path, falling back to defaults if it is missing.
    pub fn load_from(path: &Path) -> Result<Self, TsuisekiError> {
        if !path.exists() {
            return Self::from_toml_str(DEFAULT_CONFIG);
        }
        let user_str = std::fs::read_to_string(path)?;
        Self::merged(&user_str)
    }

    /// Parse a user config, filling any missing keys from the defaults.
    pub fn merged(user_str: &str) -> Result<Self, TsuisekiError> {
        let mut base: toml::Table =
            toml::from_str(DEFAULT_CONFIG).map_err(|e| TsuisekiError::Config(e.to_string()))?;
        let user: toml::Table =
            toml::from_str(user_str).map_err(|e| TsuisekiError::Config(e.to_string()))?;
        merge_tables(&mut base, user);
        toml::Value::Table(base)
            .try_into()
            .map_err(|e: toml::de::Error| TsuisekiError::Config(e.to_string()))
    }

    fn from_toml_str(s: &str) -> Result<Self, TsuisekiError> {
        toml::from_str(s).map_err(|e| TsuisekiError::Config(e.to_string()))
    }

    /// Save to `path` (normally [`AppConfig::config_path`]), creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), TsuisekiError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| TsuisekiError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Path to user config file (XDG on Linux, AppData on Windows).
    pub fn config_path() -> PathBuf {
        Self::project_dirs()
            .map(|d| d.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Path to the ledger database file.
    pub fn db_path() -> PathBuf {
        Self::project_dirs()
            .map(|d| d.data_dir().join("tsuiseki.db"))
            .unwrap_or_else(|| PathBuf::from("tsuiseki.db"))
    }

    /// Ensure the data directory exists and return the DB path.
    pub fn ensure_db_path() -> Result<PathBuf, TsuisekiError> {
        let path = Self::db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "tsuiseki")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG).expect("built-in default config is valid TOML")
    }
}

/// Recursively overlay `overlay` onto `base`. Nested tables merge; scalars replace.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

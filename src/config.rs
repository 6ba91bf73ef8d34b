use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{LauncherError, Result};
use crate::utils::paths::{resolve_data_dir, resolve_install_dir, resolve_log_dir};

pub const CONFIG_FILE: &str = "launcher.config.json";
/// Hard ceiling on simultaneously downloading titles.
pub const MAX_ACTIVE_DOWNLOADS: usize = 3;

const DEFAULT_BASE_URL: &str = "http://biggod.pythonanywhere.com";
const DEFAULT_CATALOG_PATH: &str = "games.json";
const DEFAULT_UPDATE_URL: &str = "http://biggod.pythonanywhere.com/launcher/update.json";
const DEFAULT_UPDATE_CHECK_INTERVAL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 600;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 20;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub base_url: String,
    pub catalog_path: String,
    pub update_url: String,
    pub install_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub verify_tls: bool,
    pub update_verify_tls: bool,
    pub max_active_downloads: usize,
    pub update_check_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub launcher_version: String,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            catalog_path: DEFAULT_CATALOG_PATH.to_string(),
            update_url: DEFAULT_UPDATE_URL.to_string(),
            install_dir: None,
            data_dir: None,
            log_dir: None,
            verify_tls: true,
            update_verify_tls: true,
            max_active_downloads: MAX_ACTIVE_DOWNLOADS,
            update_check_interval_secs: DEFAULT_UPDATE_CHECK_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            launcher_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl LauncherConfig {
    /// Reads `<root>/launcher.config.json` when present, then applies
    /// `PINTUXX_*` environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_json::from_str::<LauncherConfig>(&data).map_err(|err| {
                LauncherError::Config(format!("invalid {}: {}", path.display(), err))
            })?
        } else {
            LauncherConfig::default()
        };
        config.apply_env();
        config.normalize();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(value) = env_string("PINTUXX_CATALOG_URL") {
            self.base_url = value;
        }
        if let Some(value) = env_string("PINTUXX_UPDATE_URL") {
            self.update_url = value;
        }
        if let Some(value) = env_string("PINTUXX_INSTALL_DIR") {
            self.install_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = env_string("PINTUXX_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = env_bool("PINTUXX_VERIFY_TLS") {
            self.verify_tls = value;
        }
        if let Some(value) = env_bool("PINTUXX_UPDATE_VERIFY_TLS") {
            self.update_verify_tls = value;
        }
        if let Some(value) = env_u64("PINTUXX_MAX_ACTIVE_DOWNLOADS") {
            self.max_active_downloads = value as usize;
        }
        if let Some(value) = env_u64("PINTUXX_UPDATE_CHECK_INTERVAL_SECS") {
            self.update_check_interval_secs = value;
        }
        if let Some(value) = env_u64("PINTUXX_HTTP_TIMEOUT_SECONDS") {
            self.request_timeout_secs = value;
        }
    }

    fn normalize(&mut self) {
        self.max_active_downloads = self.max_active_downloads.clamp(1, MAX_ACTIVE_DOWNLOADS);
        self.request_timeout_secs = self.request_timeout_secs.clamp(5, 7200);
        self.connect_timeout_secs = self.connect_timeout_secs.clamp(2, 120);
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
    }

    pub fn install_dir(&self, root: &Path) -> PathBuf {
        self.install_dir
            .clone()
            .unwrap_or_else(|| resolve_install_dir(root))
    }

    pub fn data_dir(&self, root: &Path) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| resolve_data_dir(root))
    }

    pub fn log_dir(&self, root: &Path) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| resolve_log_dir(root))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    let normalized = env_string(key)?.to_ascii_lowercase();
    if matches!(normalized.as_str(), "1" | "true" | "yes" | "on") {
        return Some(true);
    }
    if matches!(normalized.as_str(), "0" | "false" | "no" | "off") {
        return Some(false);
    }
    None
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|value| value.parse::<u64>().ok())
}

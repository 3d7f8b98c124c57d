use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::health::HealthMarkers;

pub const DEFAULT_REGISTRY_URL: &str = "https://api.github.com";
pub const DEFAULT_DOWNLOAD_URL_TEMPLATE: &str =
    "https://github.com/{repo}/releases/download/{tag}/{asset}";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UpdaterConfig {
    pub repo: String,
    pub service_name: String,
    pub install_path: PathBuf,
    pub asset_name: Option<String>,
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    #[serde(default = "default_download_url_template")]
    pub download_url_template: String,
    pub checksum_url_template: Option<String>,
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub keep_previous: bool,
    #[serde(default)]
    pub use_sudo: bool,
    #[serde(default = "default_true")]
    pub daemon_reload: bool,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub health: HealthMarkers,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// All values are whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub http: u64,
    pub download: u64,
    pub stop: u64,
    pub command: u64,
    pub health_window: u64,
    pub health_poll: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            http: 10,
            download: 300,
            stop: 60,
            command: 30,
            health_window: 600,
            health_poll: 10,
        }
    }
}

impl TimeoutConfig {
    pub fn http(&self) -> Duration {
        Duration::from_secs(self.http)
    }

    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download)
    }

    pub fn stop(&self) -> Duration {
        Duration::from_secs(self.stop)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command)
    }

    pub fn health_window(&self) -> Duration {
        Duration::from_secs(self.health_window)
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_secs(self.health_poll)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

impl UpdaterConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse relaunch config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config: {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_repo(&self.repo)?;
        if self.service_name.trim().is_empty()
            || self.service_name.chars().any(char::is_whitespace)
        {
            return Err(anyhow!(
                "service_name must be a non-empty unit name without whitespace"
            ));
        }
        if !self.install_path.is_absolute() {
            return Err(anyhow!(
                "install_path must be absolute: {}",
                self.install_path.display()
            ));
        }
        if self.install_path.file_name().is_none() {
            return Err(anyhow!(
                "install_path must name a file: {}",
                self.install_path.display()
            ));
        }
        if let Some(asset) = &self.asset_name {
            if asset.trim().is_empty() || asset.contains('/') {
                return Err(anyhow!("asset_name must be a bare file name: '{asset}'"));
            }
        }
        if !self.download_url_template.contains("{tag}") {
            return Err(anyhow!("download_url_template must contain a {{tag}} placeholder"));
        }
        if let Some(template) = &self.checksum_url_template {
            if !template.contains("{tag}") {
                return Err(anyhow!("checksum_url_template must contain a {{tag}} placeholder"));
            }
        }
        if self.timeouts.health_window == 0 {
            return Err(anyhow!("timeouts.health_window must be greater than zero"));
        }
        if self.timeouts.health_poll == 0 {
            return Err(anyhow!("timeouts.health_poll must be greater than zero"));
        }
        self.health.validate()?;
        Ok(())
    }

    pub fn asset_name(&self) -> &str {
        if let Some(asset) = &self.asset_name {
            return asset;
        }
        self.install_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("binary")
    }

    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        self.install_path
            .parent()
            .unwrap_or_else(|| Path::new("/"))
            .join(".relaunch")
    }
}

fn validate_repo(repo: &str) -> anyhow::Result<()> {
    let Some((owner, name)) = repo.split_once('/') else {
        return Err(anyhow!("repo must use '<owner>/<name>' form: '{repo}'"));
    };
    let valid_part = |part: &str| {
        !part.is_empty()
            && part
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"._-".contains(&b))
    };
    if !valid_part(owner) || !valid_part(name) {
        return Err(anyhow!("repo must use '<owner>/<name>' form: '{repo}'"));
    }
    Ok(())
}

fn default_registry_url() -> String {
    DEFAULT_REGISTRY_URL.to_string()
}

fn default_download_url_template() -> String {
    DEFAULT_DOWNLOAD_URL_TEMPLATE.to_string()
}

fn default_true() -> bool {
    true
}

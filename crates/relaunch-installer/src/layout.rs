use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use relaunch_core::{UpdateError, UpdaterConfig};

/// On-disk locations owned by relaunch for one managed binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    state_dir: PathBuf,
    install_path: PathBuf,
}

impl StateLayout {
    pub fn new(state_dir: impl Into<PathBuf>, install_path: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            install_path: install_path.into(),
        }
    }

    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self::new(config.state_dir(), &config.install_path)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn install_path(&self) -> &Path {
        &self.install_path
    }

    pub fn record_path(&self) -> PathBuf {
        self.state_dir.join("installed.record")
    }

    /// Record of the release kept beside the previous binary.
    pub fn previous_record_path(&self) -> PathBuf {
        self.state_dir.join("previous.record")
    }

    pub fn last_check_path(&self) -> PathBuf {
        self.state_dir.join("last-check")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("run.lock")
    }

    /// Kept beside the install path so the swap is a same-filesystem rename.
    pub fn staged_binary_path(&self) -> PathBuf {
        self.sibling_path(".", ".relaunch-part")
    }

    pub fn previous_binary_path(&self) -> PathBuf {
        self.sibling_path("", ".previous")
    }

    pub fn ensure_base_dirs(&self) -> Result<(), UpdateError> {
        fs::create_dir_all(&self.state_dir).map_err(|err| {
            UpdateError::io(
                format!("failed to create {}", self.state_dir.display()),
                err,
            )
        })
    }

    fn sibling_path(&self, prefix: &str, suffix: &str) -> PathBuf {
        let mut name = OsString::from(prefix);
        name.push(
            self.install_path
                .file_name()
                .unwrap_or_else(|| OsStr::new("binary")),
        );
        name.push(suffix);
        self.install_path.with_file_name(name)
    }
}

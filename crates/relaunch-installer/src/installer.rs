use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use relaunch_core::{UpdateError, UpdaterConfig, Version};
use relaunch_registry::expand_asset_template;
use relaunch_security::{parse_checksum_file, sha256_reader_hex, verify_sha256_file};
use tracing::{debug, info, warn};

use crate::fetch::ArtifactFetcher;
use crate::fs_utils::{remove_file_if_exists, sync_parent_dir, write_file_durably};
use crate::StateLayout;

/// Replaces the live binary with a given release.
pub trait BinaryInstaller {
    /// Leaves the live binary untouched on any error.
    fn install(&self, version: &Version) -> Result<InstalledBinary, UpdateError>;

    /// Restores the binary kept by the last install. `false` when none is kept.
    fn rollback(&self) -> Result<bool, UpdateError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledBinary {
    pub version: Version,
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub previous: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub repo: String,
    pub asset: String,
    pub download_url_template: String,
    pub checksum_url_template: Option<String>,
    pub keep_previous: bool,
}

impl InstallPlan {
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self {
            repo: config.repo.clone(),
            asset: config.asset_name().to_string(),
            download_url_template: config.download_url_template.clone(),
            checksum_url_template: config.checksum_url_template.clone(),
            keep_previous: config.keep_previous,
        }
    }

    pub fn download_url(&self, version: &Version) -> String {
        expand_asset_template(&self.download_url_template, &self.repo, version, &self.asset)
    }

    pub fn checksum_url(&self, version: &Version) -> Option<String> {
        self.checksum_url_template
            .as_deref()
            .map(|template| expand_asset_template(template, &self.repo, version, &self.asset))
    }
}

pub struct ArtifactInstaller<F> {
    layout: StateLayout,
    plan: InstallPlan,
    fetcher: F,
}

impl<F: ArtifactFetcher> ArtifactInstaller<F> {
    pub fn new(layout: StateLayout, plan: InstallPlan, fetcher: F) -> Self {
        Self {
            layout,
            plan,
            fetcher,
        }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    fn stage(&self, version: &Version, staged: &Path) -> Result<(u64, String), UpdateError> {
        let url = self.plan.download_url(version);
        info!(%url, staged = %staged.display(), "downloading release artifact");
        self.fetcher.fetch_to_path(&url, staged)?;

        let size = fs::metadata(staged)
            .map_err(|err| UpdateError::io(format!("failed to stat {}", staged.display()), err))?
            .len();
        if size == 0 {
            return Err(UpdateError::Download(format!(
                "downloaded artifact is empty: {url}"
            )));
        }

        let sha256 = match self.plan.checksum_url(version) {
            Some(checksum_url) => self.verify_checksum(&checksum_url, staged)?,
            None => {
                let mut file = fs::File::open(staged).map_err(|err| {
                    UpdateError::io(format!("failed to open {}", staged.display()), err)
                })?;
                sha256_reader_hex(&mut file).map_err(|err| {
                    UpdateError::io(format!("failed to hash {}", staged.display()), err)
                })?
            }
        };

        mark_executable(staged)?;
        Ok((size, sha256))
    }

    fn verify_checksum(&self, checksum_url: &str, staged: &Path) -> Result<String, UpdateError> {
        let raw = self.fetcher.fetch_text(checksum_url)?;
        let expected = parse_checksum_file(&raw, &self.plan.asset).map_err(|err| {
            UpdateError::Parse(format!("invalid checksum file {checksum_url}: {err:#}"))
        })?;
        let (matched, actual) = verify_sha256_file(staged, &expected).map_err(|err| {
            UpdateError::io(
                format!("failed to verify {}", staged.display()),
                io::Error::other(format!("{err:#}")),
            )
        })?;
        if !matched {
            return Err(UpdateError::Integrity { expected, actual });
        }
        debug!(sha256 = %actual, "artifact checksum verified");
        Ok(actual)
    }

    fn swap(&self, staged: &Path) -> Result<Option<PathBuf>, UpdateError> {
        let live = self.layout.install_path();
        let previous = if self.plan.keep_previous && live.exists() {
            let previous = self.layout.previous_binary_path();
            keep_previous_copy(live, &previous)?;
            keep_previous_record(&self.layout)?;
            Some(previous)
        } else {
            None
        };

        fs::rename(staged, live).map_err(|err| {
            UpdateError::io(
                format!(
                    "failed to move {} into place at {}",
                    staged.display(),
                    live.display()
                ),
                err,
            )
        })?;
        sync_parent_dir(live);
        Ok(previous)
    }
}

impl<F: ArtifactFetcher> BinaryInstaller for ArtifactInstaller<F> {
    fn install(&self, version: &Version) -> Result<InstalledBinary, UpdateError> {
        let staged = self.layout.staged_binary_path();
        remove_file_if_exists(&staged).map_err(|err| {
            UpdateError::io(
                format!("failed to clear stale staging file: {}", staged.display()),
                err,
            )
        })?;

        let result = self
            .stage(version, &staged)
            .and_then(|(size, sha256)| Ok((size, sha256, self.swap(&staged)?)));
        let (size, sha256, previous) = match result {
            Ok(staged_result) => staged_result,
            Err(err) => {
                let _ = remove_file_if_exists(&staged);
                return Err(err);
            }
        };

        info!(
            version = %version,
            path = %self.layout.install_path().display(),
            size,
            sha256 = %sha256,
            "installed release binary"
        );
        Ok(InstalledBinary {
            version: version.clone(),
            path: self.layout.install_path().to_path_buf(),
            size,
            sha256,
            previous,
        })
    }

    fn rollback(&self) -> Result<bool, UpdateError> {
        let previous = self.layout.previous_binary_path();
        if !previous.exists() {
            warn!(path = %previous.display(), "no previous binary kept; cannot roll back");
            return Ok(false);
        }

        let live = self.layout.install_path();
        fs::rename(&previous, live).map_err(|err| {
            UpdateError::io(
                format!(
                    "failed to restore {} to {}",
                    previous.display(),
                    live.display()
                ),
                err,
            )
        })?;
        sync_parent_dir(live);
        info!(path = %live.display(), "restored previous binary");
        Ok(true)
    }
}

fn keep_previous_copy(live: &Path, previous: &Path) -> Result<(), UpdateError> {
    remove_file_if_exists(previous).map_err(|err| {
        UpdateError::io(format!("failed to remove {}", previous.display()), err)
    })?;
    if fs::hard_link(live, previous).is_ok() {
        return Ok(());
    }
    fs::copy(live, previous).map_err(|err| {
        UpdateError::io(
            format!(
                "failed to keep previous binary {} at {}",
                live.display(),
                previous.display()
            ),
            err,
        )
    })?;
    Ok(())
}

/// Copies the current version record so a later rollback can restore it.
fn keep_previous_record(layout: &StateLayout) -> Result<(), UpdateError> {
    let kept = layout.previous_record_path();
    let snapshot = match fs::read(layout.record_path()) {
        Ok(raw) => write_file_durably(&kept, &raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => remove_file_if_exists(&kept),
        Err(err) => Err(err),
    };
    snapshot.map_err(|err| {
        UpdateError::io(
            format!("failed to keep version record at {}", kept.display()),
            err,
        )
    })
}

fn mark_executable(path: &Path) -> Result<(), UpdateError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mut permissions = fs::metadata(path)
            .map_err(|err| UpdateError::io(format!("failed to stat {}", path.display()), err))?
            .permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(path, permissions).map_err(|err| {
            UpdateError::io(
                format!("failed to set executable mode on {}", path.display()),
                err,
            )
        })?;

        let mode = fs::metadata(path)
            .map_err(|err| UpdateError::io(format!("failed to stat {}", path.display()), err))?
            .permissions()
            .mode();
        if mode & 0o111 == 0 {
            return Err(UpdateError::io(
                format!("executable bit did not stick on {}", path.display()),
                io::Error::new(io::ErrorKind::PermissionDenied, "mode lacks execute bits"),
            ));
        }
    }

    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

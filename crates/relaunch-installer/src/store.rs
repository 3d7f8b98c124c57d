use std::fs;
use std::io;

use anyhow::{Context, Result};
use relaunch_core::{UpdateError, Version};

use crate::fs_utils::{remove_file_if_exists, write_file_durably};
use crate::StateLayout;

/// Last version applied and verified on this host.
pub trait VersionStore {
    /// `None` on first run.
    fn read(&self) -> Result<Option<Version>, UpdateError>;
    /// Durable before returning. Only called after a healthy restart.
    fn write(&self, version: &Version) -> Result<(), UpdateError>;

    /// Points the record back at the release kept by the last install.
    /// `None` when that release was never recorded; the record is then cleared.
    fn restore_previous(&self) -> Result<Option<Version>, UpdateError>;

    /// Notes that the registry was consulted. Leaves the version record alone.
    fn note_check(&self, _checked_at_unix: u64) -> Result<(), UpdateError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    pub version: Version,
    pub installed_at_unix: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FileVersionStore {
    layout: StateLayout,
}

impl FileVersionStore {
    pub fn new(layout: StateLayout) -> Self {
        Self { layout }
    }

    pub fn read_record(&self) -> Result<Option<InstallRecord>, UpdateError> {
        let path = self.layout.record_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(UpdateError::io(
                    format!("failed to read version record: {}", path.display()),
                    err,
                ));
            }
        };

        parse_record(&raw).map_err(|err| {
            UpdateError::Parse(format!(
                "failed to parse version record {}: {err:#}",
                path.display()
            ))
        })
    }

    pub fn write_record(&self, record: &InstallRecord) -> Result<(), UpdateError> {
        let mut payload = String::new();
        payload.push_str(&format!("version={}\n", record.version));
        if let Some(installed_at_unix) = record.installed_at_unix {
            payload.push_str(&format!("installed_at_unix={installed_at_unix}\n"));
        }

        let path = self.layout.record_path();
        write_file_durably(&path, payload.as_bytes()).map_err(|err| {
            UpdateError::io(
                format!("failed to write version record: {}", path.display()),
                err,
            )
        })
    }

    pub fn restore_previous_record(&self) -> Result<Option<InstallRecord>, UpdateError> {
        let kept = self.layout.previous_record_path();
        let previous = match fs::read_to_string(&kept) {
            Ok(raw) => parse_record(&raw).map_err(|err| {
                UpdateError::Parse(format!(
                    "failed to parse version record {}: {err:#}",
                    kept.display()
                ))
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(UpdateError::io(
                    format!("failed to read version record: {}", kept.display()),
                    err,
                ));
            }
        };

        match &previous {
            Some(record) => self.write_record(record)?,
            None => {
                let path = self.layout.record_path();
                remove_file_if_exists(&path).map_err(|err| {
                    UpdateError::io(
                        format!("failed to clear version record: {}", path.display()),
                        err,
                    )
                })?;
            }
        }
        remove_file_if_exists(&kept).map_err(|err| {
            UpdateError::io(format!("failed to remove {}", kept.display()), err)
        })?;
        Ok(previous)
    }

    pub fn record_check(&self, checked_at_unix: u64) -> Result<(), UpdateError> {
        let path = self.layout.last_check_path();
        write_file_durably(&path, format!("{checked_at_unix}\n").as_bytes()).map_err(|err| {
            UpdateError::io(
                format!("failed to write last-check file: {}", path.display()),
                err,
            )
        })
    }

    pub fn last_check(&self) -> Result<Option<u64>, UpdateError> {
        let path = self.layout.last_check_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(UpdateError::io(
                    format!("failed to read last-check file: {}", path.display()),
                    err,
                ));
            }
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse().map(Some).map_err(|_| {
            UpdateError::Parse(format!(
                "last-check file holds a non-numeric timestamp: {}",
                path.display()
            ))
        })
    }
}

impl VersionStore for FileVersionStore {
    fn read(&self) -> Result<Option<Version>, UpdateError> {
        Ok(self.read_record()?.map(|record| record.version))
    }

    fn write(&self, version: &Version) -> Result<(), UpdateError> {
        let installed_at_unix = crate::current_unix_timestamp().ok();
        self.write_record(&InstallRecord {
            version: version.clone(),
            installed_at_unix,
        })
    }

    fn restore_previous(&self) -> Result<Option<Version>, UpdateError> {
        Ok(self.restore_previous_record()?.map(|record| record.version))
    }

    fn note_check(&self, checked_at_unix: u64) -> Result<(), UpdateError> {
        self.record_check(checked_at_unix)
    }
}

pub(crate) fn parse_record(raw: &str) -> Result<Option<InstallRecord>> {
    let lines = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    if lines.is_empty() {
        return Ok(None);
    }

    // bare tag written by earlier single-line state files
    if lines.len() == 1 && !lines[0].contains('=') {
        let version = Version::parse_tag(lines[0]).context("invalid legacy version tag")?;
        return Ok(Some(InstallRecord {
            version,
            installed_at_unix: None,
        }));
    }

    let mut version = None;
    let mut installed_at_unix = None;
    for line in lines {
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        match k {
            "version" => version = Some(Version::parse_tag(v).context("invalid version tag")?),
            "installed_at_unix" => {
                installed_at_unix = Some(v.parse().context("installed_at_unix must be u64")?)
            }
            _ => {}
        }
    }

    Ok(Some(InstallRecord {
        version: version.context("missing version")?,
        installed_at_unix,
    }))
}

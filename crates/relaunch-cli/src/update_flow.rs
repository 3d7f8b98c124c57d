use std::time::Duration;

use relaunch_core::{FailureStage, UpdateError, Version};
use relaunch_installer::{current_unix_timestamp, BinaryInstaller, VersionStore};
use relaunch_registry::VersionSource;
use relaunch_service::{HealthProbe, ServiceController};
use tracing::{debug, error, info, warn};

use crate::notify::{Notifier, UpdateEvent};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RunMode {
    Apply,
    /// Fetch and compare only.
    CheckOnly,
}

#[derive(Debug)]
pub(crate) enum RunOutcome {
    NoUpdate {
        current: Version,
    },
    Available {
        current: Option<Version>,
        latest: Version,
    },
    Updated {
        old: Option<Version>,
        new: Version,
    },
    Failed {
        stage: FailureStage,
        error: UpdateError,
        rolled_back: bool,
    },
}

impl RunOutcome {
    pub(crate) fn exit_code(&self) -> u8 {
        match self {
            Self::Failed { stage, .. } => stage.exit_code(),
            _ => 0,
        }
    }
}

/// One check-and-update pass over borrowed collaborators.
pub(crate) struct Updater<'a> {
    pub(crate) source: &'a dyn VersionSource,
    pub(crate) store: &'a dyn VersionStore,
    pub(crate) service: &'a dyn ServiceController,
    pub(crate) installer: &'a dyn BinaryInstaller,
    pub(crate) probe: &'a mut dyn HealthProbe,
    pub(crate) notifier: &'a dyn Notifier,
    pub(crate) health_window: Duration,
}

impl Updater<'_> {
    pub(crate) fn run(&mut self, mode: RunMode) -> RunOutcome {
        let latest = match self.source.fetch_latest() {
            Ok(latest) => latest,
            Err(err) => return self.fail(FailureStage::Fetch, err, None),
        };
        let current = match self.store.read() {
            Ok(current) => current,
            Err(err) => return self.fail(FailureStage::Record, err, None),
        };
        self.note_check();

        if let Some(current) = &current {
            if !latest.is_newer_than(current) {
                debug!(current = %current, latest = %latest, "no newer release");
                self.notifier.report(&UpdateEvent::NoUpdateNeeded {
                    current: current.clone(),
                });
                return RunOutcome::NoUpdate {
                    current: current.clone(),
                };
            }
        }

        if mode == RunMode::CheckOnly {
            info!(latest = %latest, "update available");
            return RunOutcome::Available { current, latest };
        }

        self.notifier.report(&UpdateEvent::UpdateStarted {
            from: current.clone(),
            to: latest.clone(),
        });

        if let Err(err) = self.service.stop() {
            return self.fail(FailureStage::Stop, err, None);
        }

        let installed = match self.installer.install(&latest) {
            Ok(installed) => installed,
            Err(err) => {
                // old binary is untouched; bring it back up
                if let Err(start_err) = self.service.start() {
                    error!(error = %start_err, "failed to restart service on the old binary");
                }
                return self.fail(FailureStage::Install, err, None);
            }
        };

        if let Err(err) = self.probe.arm() {
            warn!(error = %err, "could not open service log before start");
        }

        if let Err(err) = self.service.start() {
            let rollback = self.roll_back(installed.previous.is_some());
            return self.fail(FailureStage::Start, err, rollback);
        }

        let result = self.probe.verify(self.health_window);
        if let Some(err) = result.into_error(self.health_window) {
            let rollback = self.roll_back(installed.previous.is_some());
            return self.fail(FailureStage::Health, err, rollback);
        }

        if let Err(err) = self.store.write(&latest) {
            return self.fail(FailureStage::Record, err, None);
        }

        self.notifier.report(&UpdateEvent::UpdateSucceeded {
            old: current.clone(),
            new: latest.clone(),
        });
        RunOutcome::Updated {
            old: current,
            new: latest,
        }
    }

    fn note_check(&self) {
        let checked_at = match current_unix_timestamp() {
            Ok(checked_at) => checked_at,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "skipping last-check timestamp");
                return;
            }
        };
        if let Err(err) = self.store.note_check(checked_at) {
            warn!(error = %err, "failed to record last check");
        }
    }

    /// Best effort: stop, restore the kept binary, start. `None` when no
    /// previous binary was kept.
    fn roll_back(&self, has_previous: bool) -> Option<Result<(), String>> {
        if !has_previous {
            return None;
        }
        warn!("rolling back to the previous binary");
        if let Err(err) = self.service.stop() {
            warn!(error = %err, "stop before rollback failed; restoring anyway");
        }
        let outcome = match self.installer.rollback() {
            Ok(true) => self
                .service
                .start()
                .map_err(|err| format!("restored previous binary but restart failed: {err}")),
            Ok(false) => Err("no previous binary to restore".to_string()),
            Err(err) => Err(format!("rollback failed: {err}")),
        };
        Some(outcome)
    }

    fn fail(
        &self,
        stage: FailureStage,
        error: UpdateError,
        rollback: Option<Result<(), String>>,
    ) -> RunOutcome {
        let mut reason = error.to_string();
        let rolled_back = matches!(rollback, Some(Ok(())));
        match rollback {
            Some(Ok(())) => reason.push_str("; rolled back to previous binary"),
            Some(Err(note)) => reason.push_str(&format!("; {note}")),
            None => {}
        }
        debug!(stage = %stage, kind = error.kind(), "update run failed");
        self.notifier
            .report(&UpdateEvent::UpdateFailed { stage, reason });
        RunOutcome::Failed {
            stage,
            error,
            rolled_back,
        }
    }
}

#[derive(Debug)]
pub(crate) enum RollbackOutcome {
    Restored { version: Option<Version> },
    Failed { stage: FailureStage, error: UpdateError },
}

impl RollbackOutcome {
    pub(crate) fn exit_code(&self) -> u8 {
        match self {
            Self::Restored { .. } => 0,
            Self::Failed { stage, .. } => stage.exit_code(),
        }
    }
}

/// Operator-requested return to the binary kept by the last install.
pub(crate) struct Rollback<'a> {
    pub(crate) store: &'a dyn VersionStore,
    pub(crate) service: &'a dyn ServiceController,
    pub(crate) installer: &'a dyn BinaryInstaller,
    pub(crate) notifier: &'a dyn Notifier,
}

impl Rollback<'_> {
    pub(crate) fn run(&self) -> RollbackOutcome {
        if let Err(err) = self.service.stop() {
            return self.fail(FailureStage::Stop, err);
        }

        let restore_error = match self.installer.rollback() {
            Ok(true) => None,
            Ok(false) => Some(UpdateError::io(
                "no previous binary kept",
                std::io::Error::from(std::io::ErrorKind::NotFound),
            )),
            Err(err) => Some(err),
        };
        if let Some(err) = restore_error {
            // live binary is unchanged; bring it back up
            if let Err(start_err) = self.service.start() {
                error!(error = %start_err, "failed to restart service after rollback failure");
            }
            return self.fail(FailureStage::Install, err);
        }

        let restored = self.store.restore_previous();
        if let Err(err) = self.service.start() {
            return self.fail(FailureStage::Start, err);
        }
        match restored {
            Ok(version) => {
                match &version {
                    Some(version) => info!(version = %version, "rolled back to previous release"),
                    None => warn!("previous binary had no recorded version; record cleared"),
                }
                RollbackOutcome::Restored { version }
            }
            Err(err) => self.fail(FailureStage::Record, err),
        }
    }

    fn fail(&self, stage: FailureStage, error: UpdateError) -> RollbackOutcome {
        debug!(stage = %stage, kind = error.kind(), "rollback failed");
        self.notifier.report(&UpdateEvent::UpdateFailed {
            stage,
            reason: format!("rollback: {error}"),
        });
        RollbackOutcome::Failed { stage, error }
    }
}

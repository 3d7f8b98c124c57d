use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
#[cfg(all(unix, not(target_os = "linux")))]
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use relaunch_core::UpdateError;
use tracing::{debug, warn};

use crate::fs_utils::remove_file_if_exists;
use crate::StateLayout;

/// Lock files without a readable pid are treated as held until this old.
const UNREADABLE_GRACE: Duration = Duration::from_secs(30);
const CLAIM_ATTEMPTS: usize = 5;
const EVICT_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Free,
    Held(u32),
    Unreadable { age: Duration },
}

impl LockState {
    fn holder(self) -> Option<u32> {
        match self {
            Self::Held(pid) => Some(pid),
            Self::Free | Self::Unreadable { .. } => None,
        }
    }

    fn same_marker(self, other: Self) -> bool {
        match (self, other) {
            (Self::Held(left), Self::Held(right)) => left == right,
            (Self::Unreadable { .. }, Self::Unreadable { .. }) => true,
            _ => false,
        }
    }
}

/// Process-level mutual exclusion for update runs. Released on drop.
///
/// The lock file is linked into place fully written, so a reader never sees
/// a claim without its pid. Stale locks are only evicted under a separate
/// eviction marker, after re-checking that the file still names the same
/// dead owner.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    pid: u32,
}

impl RunLock {
    pub fn acquire(layout: &StateLayout) -> Result<Self, UpdateError> {
        Self::acquire_with_probe(layout, process_alive)
    }

    pub(crate) fn acquire_with_probe<Probe>(
        layout: &StateLayout,
        mut owner_alive: Probe,
    ) -> Result<Self, UpdateError>
    where
        Probe: FnMut(u32) -> bool,
    {
        layout.ensure_base_dirs()?;
        let path = layout.lock_path();
        let pid = std::process::id();
        let mut attempts = 0;

        loop {
            match claim(&path, pid) {
                Ok(()) => return Ok(Self { path, pid }),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(UpdateError::io(
                        format!("failed to claim run lock: {}", path.display()),
                        err,
                    ));
                }
            }

            attempts += 1;
            let seen = inspect_lock(&path)?;
            if attempts > CLAIM_ATTEMPTS {
                return Err(UpdateError::LockHeld { pid: seen.holder() });
            }

            match seen {
                LockState::Free => {}
                LockState::Held(holder) if owner_alive(holder) => {
                    return Err(UpdateError::LockHeld { pid: Some(holder) });
                }
                LockState::Unreadable { age } if age < UNREADABLE_GRACE => {
                    return Err(UpdateError::LockHeld { pid: None });
                }
                stale => evict_stale(&path, stale, pid)?,
            }
        }
    }

    /// Pid recorded in the lock file, if any.
    pub fn holder(layout: &StateLayout) -> Result<Option<u32>, UpdateError> {
        read_lock_holder(&layout.lock_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match read_lock_holder(&self.path) {
            Ok(Some(holder)) if holder == self.pid => {
                if let Err(err) = remove_file_if_exists(&self.path) {
                    warn!(path = %self.path.display(), error = %err, "failed to release run lock");
                } else {
                    debug!(path = %self.path.display(), "released run lock");
                }
            }
            _ => {}
        }
    }
}

/// Writes the pid to a private file and hard-links it into place.
fn claim(path: &Path, pid: u32) -> io::Result<()> {
    let scratch = scratch_path(path, "claim");
    let claimed = write_pid(&scratch, pid).and_then(|()| fs::hard_link(&scratch, path));
    let _ = remove_file_if_exists(&scratch);
    claimed
}

fn write_pid(path: &Path, pid: u32) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(format!("{pid}\n").as_bytes())?;
    file.sync_all()
}

fn evict_stale(path: &Path, stale: LockState, pid: u32) -> Result<(), UpdateError> {
    let guard = evict_guard_path(path);
    match claim(&guard, pid) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            if marker_age(&guard).is_some_and(|age| age >= UNREADABLE_GRACE) {
                warn!(path = %guard.display(), "removing abandoned run lock eviction marker");
                let _ = remove_file_if_exists(&guard);
            } else {
                std::thread::sleep(EVICT_BACKOFF);
            }
            return Ok(());
        }
        Err(err) => {
            return Err(UpdateError::io(
                format!("failed to claim run lock eviction: {}", guard.display()),
                err,
            ));
        }
    }

    let evicted = inspect_lock(path).and_then(|current| {
        if !current.same_marker(stale) {
            return Ok(());
        }
        warn!(path = %path.display(), holder = ?stale.holder(), "removing stale run lock");
        remove_file_if_exists(path).map_err(|err| {
            UpdateError::io(
                format!("failed to remove stale run lock: {}", path.display()),
                err,
            )
        })
    });
    let _ = remove_file_if_exists(&guard);
    evicted
}

fn inspect_lock(path: &Path) -> Result<LockState, UpdateError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LockState::Free),
        Err(err) => {
            return Err(UpdateError::io(
                format!("failed to read run lock: {}", path.display()),
                err,
            ));
        }
    };
    if let Ok(pid) = raw.trim().parse() {
        return Ok(LockState::Held(pid));
    }
    Ok(match marker_age(path) {
        Some(age) => LockState::Unreadable { age },
        None => LockState::Free,
    })
}

fn read_lock_holder(path: &Path) -> Result<Option<u32>, UpdateError> {
    inspect_lock(path).map(LockState::holder)
}

/// Age from the file's mtime. A timestamp in the future counts as brand new.
fn marker_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default(),
    )
}

fn evict_guard_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".evict");
    PathBuf::from(name)
}

fn scratch_path(path: &Path, tag: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(
        ".{}-{nanos}-{}.{tag}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    PathBuf::from(name)
}

fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new("/proc").join(pid.to_string()).exists()
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(true)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use relaunch_core::UpdateError;
use tracing::{debug, trace};

use crate::runner::{own_process_group, stop_process_tree};

const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPoll {
    Line(String),
    /// Nothing arrived within the wait.
    Idle,
    /// The stream ended.
    Closed,
}

/// Bounded reads of a service's output.
pub trait LogSource {
    fn next_line(&mut self, wait: Duration) -> Result<LogPoll, UpdateError>;
}

/// `journalctl -f` for one unit, starting at the current end of the journal.
pub struct JournalTail {
    child: Child,
    lines: Receiver<String>,
}

impl JournalTail {
    pub fn spawn(service_name: &str, use_sudo: bool) -> Result<Self, UpdateError> {
        Self::from_argv(&journal_argv(service_name, use_sudo))
    }

    /// Follows the stdout of an arbitrary command, one line per poll.
    pub(crate) fn from_argv(argv: &[String]) -> Result<Self, UpdateError> {
        let (program, args) = argv.split_first().ok_or_else(|| {
            UpdateError::io(
                "empty log source command",
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            )
        })?;
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        let mut child = own_process_group(&mut command)
            .spawn()
            .map_err(|err| UpdateError::io(format!("failed to launch '{}'", argv.join(" ")), err))?;
        debug!(command = %argv.join(" "), pid = child.id(), "tailing service journal");

        let stdout = child.stdout.take().ok_or_else(|| {
            UpdateError::io(
                "journalctl stdout was not captured",
                std::io::Error::other("missing pipe"),
            )
        })?;
        let (sender, lines) = mpsc::channel();
        // Detached: it ends once the pipe closes or the receiver is gone.
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else {
                    break;
                };
                if sender.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self { child, lines })
    }
}

impl LogSource for JournalTail {
    fn next_line(&mut self, wait: Duration) -> Result<LogPoll, UpdateError> {
        match self.lines.recv_timeout(wait) {
            Ok(line) => {
                trace!(%line, "journal line");
                Ok(LogPoll::Line(line))
            }
            Err(RecvTimeoutError::Timeout) => Ok(LogPoll::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(LogPoll::Closed),
        }
    }
}

impl Drop for JournalTail {
    fn drop(&mut self) {
        let (_, closed) = mpsc::channel();
        drop(std::mem::replace(&mut self.lines, closed));
        stop_process_tree(&mut self.child, STOP_GRACE);
    }
}

pub(crate) fn journal_argv(service_name: &str, use_sudo: bool) -> Vec<String> {
    let mut argv = Vec::new();
    if use_sudo {
        argv.extend(["sudo".to_string(), "-n".to_string()]);
    }
    argv.extend(
        ["journalctl", "-f", "-u"]
            .into_iter()
            .map(str::to_string)
            .chain([unit_name(service_name)])
            .chain(["-n", "0", "--no-pager", "-o", "cat"].map(str::to_string)),
    );
    argv
}

fn unit_name(service_name: &str) -> String {
    if service_name.contains('.') {
        service_name.to_string()
    } else {
        format!("{service_name}.service")
    }
}

use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs `argv` and kills it once `timeout` elapses (`ErrorKind::TimedOut`).
pub fn run_with_timeout(argv: &[String], timeout: Duration) -> io::Result<CommandOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = own_process_group(&mut command).spawn()?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            stop_process_tree(&mut child, Duration::ZERO);
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("'{}' timed out after {}s", argv.join(" "), timeout.as_secs()),
            ));
        }
        thread::sleep(Duration::from_millis(50));
    };

    Ok(CommandOutput {
        code: status.code(),
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            let mut raw = Vec::new();
            let _ = pipe.read_to_end(&mut raw);
            text = String::from_utf8_lossy(&raw).into_owned();
        }
        text
    })
}

/// Puts the child in a fresh process group led by itself.
pub(crate) fn own_process_group(command: &mut Command) -> &mut Command {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0)
    }

    #[cfg(not(unix))]
    {
        command
    }
}

/// Stops a child spawned with [`own_process_group`] and everything it forked.
/// With a non-zero grace the group gets SIGTERM first.
pub(crate) fn stop_process_tree(child: &mut Child, grace: Duration) {
    if !grace.is_zero() && signal_group(child, "TERM") && exited_within(child, grace) {
        return;
    }
    signal_group(child, "KILL");
    let _ = child.kill();
    let _ = child.wait();
}

fn exited_within(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return true,
            Ok(None) if Instant::now() >= deadline => return false,
            Ok(None) => thread::sleep(Duration::from_millis(20)),
        }
    }
}

fn signal_group(child: &Child, signal: &str) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .arg(format!("-{signal}"))
            .arg("--")
            .arg(format!("-{}", child.id()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        let _ = (child, signal);
        false
    }
}

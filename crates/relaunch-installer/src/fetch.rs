use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use relaunch_core::UpdateError;
use reqwest::blocking::Client;
use tracing::debug;

/// Transport for release artifacts.
pub trait ArtifactFetcher {
    /// Streams `url` into `dest`, returning the byte count. Fails with
    /// `Download` when the transfer is cut short.
    fn fetch_to_path(&self, url: &str, dest: &Path) -> Result<u64, UpdateError>;

    fn fetch_text(&self, url: &str) -> Result<String, UpdateError>;
}

/// Progress hooks for long downloads.
pub trait TransferObserver {
    fn started(&self, _url: &str, _total: Option<u64>) {}
    fn advanced(&self, _downloaded: u64) {}
    fn finished(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl TransferObserver for NoProgress {}

pub struct HttpFetcher {
    client: Client,
    observer: Box<dyn TransferObserver>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, UpdateError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relaunch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| UpdateError::Download(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            observer: Box::new(NoProgress),
        })
    }

    pub fn with_observer(mut self, observer: Box<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, UpdateError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| UpdateError::Download(format!("GET {url} failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Download(format!("GET {url} returned {status}")));
        }
        Ok(response)
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch_to_path(&self, url: &str, dest: &Path) -> Result<u64, UpdateError> {
        let mut response = self.get(url)?;
        let expected = response.content_length();
        debug!(%url, dest = %dest.display(), expected = ?expected, "downloading artifact");

        let mut file = File::create(dest).map_err(|err| {
            UpdateError::io(format!("failed to create {}", dest.display()), err)
        })?;

        self.observer.started(url, expected);
        let mut buffer = [0_u8; 64 * 1024];
        let mut written = 0_u64;
        loop {
            let read = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) => {
                    self.observer.finished();
                    return Err(UpdateError::Download(format!(
                        "transfer of {url} interrupted after {written} bytes: {err}"
                    )));
                }
            };
            if let Err(err) = file.write_all(&buffer[..read]) {
                self.observer.finished();
                return Err(UpdateError::io(
                    format!("failed to write {}", dest.display()),
                    err,
                ));
            }
            written += read as u64;
            self.observer.advanced(written);
        }
        self.observer.finished();

        file.sync_all()
            .map_err(|err| UpdateError::io(format!("failed to sync {}", dest.display()), err))?;

        if let Some(expected) = expected {
            if written != expected {
                return Err(UpdateError::Download(format!(
                    "incomplete transfer of {url}: received {written} of {expected} bytes"
                )));
            }
        }
        Ok(written)
    }

    fn fetch_text(&self, url: &str) -> Result<String, UpdateError> {
        self.get(url)?
            .text()
            .map_err(|err| UpdateError::Download(format!("failed reading {url}: {err}")))
    }
}

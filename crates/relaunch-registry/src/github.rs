use std::time::Duration;

use relaunch_core::{UpdateError, Version};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use tracing::debug;

use crate::VersionSource;

#[derive(Debug, Deserialize)]
struct ReleasePayload {
    tag_name: Option<String>,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    prerelease: bool,
}

/// GitHub-compatible `releases/latest` endpoint.
#[derive(Debug, Clone)]
pub struct GithubReleases {
    client: Client,
    base_url: String,
    repo: String,
    token: Option<String>,
}

impl GithubReleases {
    pub fn new(base_url: &str, repo: &str, timeout: Duration) -> Result<Self, UpdateError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("relaunch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| UpdateError::Network(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn latest_release_url(&self) -> String {
        format!("{}/repos/{}/releases/latest", self.base_url, self.repo)
    }
}

impl VersionSource for GithubReleases {
    fn fetch_latest(&self) -> Result<Version, UpdateError> {
        let url = self.latest_release_url();
        debug!(%url, "querying release registry");

        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .map_err(|err| UpdateError::Network(format!("GET {url} failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Network(format!("GET {url} returned {status}")));
        }

        let body = response
            .text()
            .map_err(|err| UpdateError::Network(format!("failed reading {url} body: {err}")))?;
        parse_latest_release(&body)
    }
}

pub fn parse_latest_release(body: &str) -> Result<Version, UpdateError> {
    let payload: ReleasePayload = serde_json::from_str(body)
        .map_err(|err| UpdateError::Parse(format!("malformed release payload: {err}")))?;
    if payload.draft || payload.prerelease {
        return Err(UpdateError::Parse(
            "registry returned a draft or pre-release as latest".to_string(),
        ));
    }

    let tag = payload
        .tag_name
        .ok_or_else(|| UpdateError::Parse("release payload is missing tag_name".to_string()))?;
    Version::parse_tag(&tag)
}

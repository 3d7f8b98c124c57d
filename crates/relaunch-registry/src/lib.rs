mod github;
mod urls;

use relaunch_core::{UpdateError, Version};

pub use github::{parse_latest_release, GithubReleases};
pub use urls::expand_asset_template;

/// Read-only view of the release registry.
pub trait VersionSource {
    /// Newest published version. Never retries; the caller decides.
    fn fetch_latest(&self) -> Result<Version, UpdateError>;
}

#[cfg(test)]
mod tests;

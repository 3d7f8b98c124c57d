mod fetch;
mod fs_utils;
mod installer;
mod layout;
mod lock;
mod store;

pub use fetch::{ArtifactFetcher, HttpFetcher, NoProgress, TransferObserver};
pub use fs_utils::current_unix_timestamp;
pub use installer::{ArtifactInstaller, BinaryInstaller, InstallPlan, InstalledBinary};
pub use layout::StateLayout;
pub use lock::RunLock;
pub use store::{FileVersionStore, InstallRecord, VersionStore};

#[cfg(test)]
mod tests;

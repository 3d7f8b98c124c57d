mod config;
mod error;
mod health;
mod version;

pub use config::{NotifyConfig, TimeoutConfig, UpdaterConfig};
pub use error::{FailureStage, HealthFailure, UpdateError};
pub use health::{CounterMarker, HealthMarkers};
pub use version::Version;

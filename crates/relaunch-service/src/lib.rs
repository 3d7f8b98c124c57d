mod controller;
mod health;
mod journal;
mod runner;

pub use controller::{ServiceController, ServiceSettings, ServiceStatus, SystemdController};
pub use health::{
    HealthClassifier, HealthProbe, HealthResult, HealthState, HealthVerifier, LogHealthProbe,
};
pub use journal::{JournalTail, LogPoll, LogSource};
pub use runner::{run_with_timeout, CommandOutput};

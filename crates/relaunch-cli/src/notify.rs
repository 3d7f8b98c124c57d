use std::time::Duration;

use relaunch_core::{FailureStage, UpdateError, Version};
use reqwest::blocking::Client;
use serde_json::json;
use tracing::{error, info, warn};

use crate::render::{OutputStyle, TerminalRenderer};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);
const WEBHOOK_CONTENT_LIMIT: usize = 1975;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UpdateEvent {
    UpdateStarted {
        from: Option<Version>,
        to: Version,
    },
    UpdateSucceeded {
        old: Option<Version>,
        new: Version,
    },
    UpdateFailed {
        stage: FailureStage,
        reason: String,
    },
    NoUpdateNeeded {
        current: Version,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum EventLevel {
    Info,
    Error,
}

impl EventLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Error => "ERROR",
        }
    }
}

impl UpdateEvent {
    pub(crate) fn level(&self) -> EventLevel {
        match self {
            Self::UpdateFailed { .. } => EventLevel::Error,
            _ => EventLevel::Info,
        }
    }

    pub(crate) fn message(&self) -> String {
        match self {
            Self::UpdateStarted { from, to } => {
                format!("new release detected: {to} (previous: {})", display_or_none(from))
            }
            Self::UpdateSucceeded { old, new } => {
                format!("updated {} -> {new}; service healthy", display_or_none(old))
            }
            Self::UpdateFailed { stage, reason } => format!("{stage}: {reason}"),
            Self::NoUpdateNeeded { current } => format!("no new release; still at {current}"),
        }
    }

    fn status(&self) -> &'static str {
        match self {
            Self::UpdateStarted { .. } => "step",
            Self::UpdateSucceeded { .. } => "ok",
            Self::UpdateFailed { .. } => "err",
            Self::NoUpdateNeeded { .. } => "ok",
        }
    }
}

fn display_or_none(version: &Option<Version>) -> String {
    version
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

/// Status sink. Must never fail the update run.
pub(crate) trait Notifier {
    fn report(&self, event: &UpdateEvent);
}

pub(crate) struct ConsoleNotifier {
    renderer: TerminalRenderer,
}

impl ConsoleNotifier {
    pub(crate) fn new(style: OutputStyle) -> Self {
        Self {
            renderer: TerminalRenderer::from_style(style),
        }
    }
}

impl Notifier for ConsoleNotifier {
    fn report(&self, event: &UpdateEvent) {
        let message = event.message();
        match event {
            UpdateEvent::UpdateFailed { stage, .. } => {
                error!(stage = %stage, exit_code = stage.exit_code(), "{message}")
            }
            _ => info!("{message}"),
        }
        self.renderer.print_status(event.status(), &message);
    }
}

/// Discord-compatible webhook (`{"content": ...}`).
pub(crate) struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub(crate) fn new(url: &str) -> Result<Self, UpdateError> {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .user_agent(concat!("relaunch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| UpdateError::Network(format!("failed to build webhook client: {err}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    fn post(&self, event: &UpdateEvent) -> Result<(), UpdateError> {
        let response = self
            .client
            .post(&self.url)
            .json(&webhook_payload(event))
            .send()
            .map_err(|err| UpdateError::Network(format!("webhook post failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Network(format!("webhook returned {status}")));
        }
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn report(&self, event: &UpdateEvent) {
        if let Err(err) = self.post(event) {
            warn!(error = %err, "failed to deliver webhook notification");
        }
    }
}

pub(crate) fn webhook_payload(event: &UpdateEvent) -> serde_json::Value {
    let content = format!("**{}**```{}```", event.level().as_str(), event.message());
    json!({ "content": content.chars().take(WEBHOOK_CONTENT_LIMIT).collect::<String>() })
}

/// Fans one event out to every sink.
#[derive(Default)]
pub(crate) struct Notifiers {
    sinks: Vec<Box<dyn Notifier>>,
}

impl Notifiers {
    pub(crate) fn with(mut self, sink: Box<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub(crate) fn len(&self) -> usize {
        self.sinks.len()
    }
}

impl Notifier for Notifiers {
    fn report(&self, event: &UpdateEvent) {
        for sink in &self.sinks {
            sink.report(event);
        }
    }
}

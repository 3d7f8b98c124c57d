use std::time::{Duration, Instant};

use regex::Regex;
use relaunch_core::{HealthFailure, HealthMarkers, UpdateError, UpdaterConfig};
use tracing::{debug, info, warn};

use crate::journal::{JournalTail, LogPoll, LogSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthState {
    /// Start was issued; no output seen yet.
    Starting,
    Observing,
    Healthy,
    Failed(String),
    Timeout,
}

impl HealthState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Healthy | Self::Failed(_) | Self::Timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthResult {
    Healthy,
    Failed(String),
    Timeout,
}

impl HealthResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn into_error(self, window: Duration) -> Option<UpdateError> {
        match self {
            Self::Healthy => None,
            Self::Failed(reason) => Some(UpdateError::HealthCheck(HealthFailure::Failed { reason })),
            Self::Timeout => Some(UpdateError::HealthCheck(HealthFailure::Timeout { window })),
        }
    }
}

#[derive(Debug, Clone)]
struct CounterRule {
    regex: Regex,
    min: f64,
}

impl CounterRule {
    fn value(&self, line: &str) -> Option<f64> {
        let captures = self.regex.captures(line)?;
        let number: f64 = captures.get(1)?.as_str().replace(',', "").parse().ok()?;
        let scale = match captures.get(2).map(|suffix| suffix.as_str()) {
            Some("K" | "k") => 1_000.0,
            Some("M" | "m") => 1_000_000.0,
            _ => 1.0,
        };
        Some(number * scale)
    }
}

/// Classifies a startup from log lines. Same markers and same lines always
/// give the same state.
#[derive(Debug, Clone)]
pub struct HealthClassifier {
    ready: Vec<Regex>,
    failure: Vec<Regex>,
    counters: Vec<CounterRule>,
    state: HealthState,
}

impl HealthClassifier {
    pub fn new(markers: &HealthMarkers) -> Result<Self, UpdateError> {
        markers
            .validate()
            .map_err(|err| UpdateError::Config(format!("{err:#}")))?;

        let ready = compile_all(&markers.ready)?;
        let failure = compile_all(&markers.failure)?;
        let counters = markers
            .counter
            .iter()
            .map(|counter| {
                Ok(CounterRule {
                    regex: compile(&counter.pattern)?,
                    min: counter.min,
                })
            })
            .collect::<Result<Vec<_>, UpdateError>>()?;

        Ok(Self {
            ready,
            failure,
            counters,
            state: HealthState::Starting,
        })
    }

    pub fn state(&self) -> &HealthState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state = HealthState::Starting;
    }

    pub fn observe(&mut self, line: &str) -> &HealthState {
        if self.state.is_terminal() {
            return &self.state;
        }
        self.state = HealthState::Observing;

        if let Some(marker) = self.failure.iter().find(|marker| marker.is_match(line)) {
            self.state = HealthState::Failed(format!(
                "failure marker '{}' matched: {}",
                marker.as_str(),
                line.trim()
            ));
            return &self.state;
        }

        if self.ready.iter().any(|marker| marker.is_match(line)) {
            self.state = HealthState::Healthy;
            return &self.state;
        }

        for counter in &self.counters {
            if let Some(value) = counter.value(line) {
                debug!(value, min = counter.min, "health counter observed");
                if value > counter.min {
                    self.state = HealthState::Healthy;
                    break;
                }
            }
        }
        &self.state
    }

    /// The window elapsed without a verdict.
    pub fn expire(&mut self) -> &HealthState {
        if !self.state.is_terminal() {
            self.state = HealthState::Timeout;
        }
        &self.state
    }
}

fn compile(pattern: &str) -> Result<Regex, UpdateError> {
    Regex::new(pattern).map_err(|err| {
        UpdateError::Config(format!("invalid health marker pattern '{pattern}': {err}"))
    })
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, UpdateError> {
    patterns.iter().map(|pattern| compile(pattern)).collect()
}

pub struct HealthVerifier {
    classifier: HealthClassifier,
    poll: Duration,
}

impl HealthVerifier {
    pub fn new(markers: &HealthMarkers, poll: Duration) -> Result<Self, UpdateError> {
        Ok(Self {
            classifier: HealthClassifier::new(markers)?,
            poll: poll.max(Duration::from_millis(1)),
        })
    }

    pub fn from_config(config: &UpdaterConfig) -> Result<Self, UpdateError> {
        Self::new(&config.health, config.timeouts.health_poll())
    }

    pub fn verify(&self, source: &mut dyn LogSource, window: Duration) -> HealthResult {
        let mut classifier = self.classifier.clone();
        classifier.reset();
        let deadline = Instant::now() + window;

        while !classifier.state().is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                classifier.expire();
                break;
            }
            let wait = (deadline - now).min(self.poll);
            match source.next_line(wait) {
                Ok(LogPoll::Line(line)) => {
                    classifier.observe(&line);
                }
                Ok(LogPoll::Idle) => {}
                Ok(LogPoll::Closed) => {
                    return HealthResult::Failed(
                        "log stream closed before a ready marker".to_string(),
                    );
                }
                Err(err) => return HealthResult::Failed(format!("log source failed: {err}")),
            }
        }

        let result = match classifier.state() {
            HealthState::Healthy => HealthResult::Healthy,
            HealthState::Failed(reason) => HealthResult::Failed(reason.clone()),
            _ => HealthResult::Timeout,
        };
        match &result {
            HealthResult::Healthy => info!("service reported ready"),
            HealthResult::Failed(reason) => warn!(%reason, "service startup failed"),
            HealthResult::Timeout => warn!(
                window_secs = window.as_secs(),
                "no ready marker within health window"
            ),
        }
        result
    }
}

/// Post-start check. `arm` runs before the service is started so early
/// output is not missed.
pub trait HealthProbe {
    fn arm(&mut self) -> Result<(), UpdateError>;
    fn verify(&mut self, window: Duration) -> HealthResult;
}

type SourceOpener<S> = Box<dyn FnMut() -> Result<S, UpdateError>>;

pub struct LogHealthProbe<S> {
    verifier: HealthVerifier,
    open: SourceOpener<S>,
    source: Option<S>,
}

impl LogHealthProbe<JournalTail> {
    pub fn journal(config: &UpdaterConfig) -> Result<Self, UpdateError> {
        let service = config.service_name.clone();
        let use_sudo = config.use_sudo;
        Ok(Self::new(
            HealthVerifier::from_config(config)?,
            move || JournalTail::spawn(&service, use_sudo),
        ))
    }
}

impl<S: LogSource> LogHealthProbe<S> {
    pub fn new<O>(verifier: HealthVerifier, open: O) -> Self
    where
        O: FnMut() -> Result<S, UpdateError> + 'static,
    {
        Self {
            verifier,
            open: Box::new(open),
            source: None,
        }
    }
}

impl<S: LogSource> HealthProbe for LogHealthProbe<S> {
    fn arm(&mut self) -> Result<(), UpdateError> {
        if self.source.is_none() {
            self.source = Some((self.open)()?);
        }
        Ok(())
    }

    fn verify(&mut self, window: Duration) -> HealthResult {
        if let Err(err) = self.arm() {
            return HealthResult::Failed(format!("could not open service log: {err}"));
        }
        match self.source.take() {
            Some(mut source) => self.verifier.verify(&mut source, window),
            None => HealthResult::Failed("service log is not available".to_string()),
        }
    }
}

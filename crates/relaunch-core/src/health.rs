use anyhow::{anyhow, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Log vocabulary used to classify a restart. Patterns are regular
/// expressions matched against single log lines.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthMarkers {
    #[serde(default)]
    pub ready: Vec<String>,
    #[serde(default)]
    pub failure: Vec<String>,
    #[serde(default)]
    pub counter: Vec<CounterMarker>,
}

/// Ready once the number captured by `pattern` exceeds `min`. The first
/// capture group holds the number, an optional second one a `K`/`M` suffix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CounterMarker {
    pub pattern: String,
    #[serde(default)]
    pub min: f64,
}

impl HealthMarkers {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ready.is_empty() && self.counter.is_empty() {
            return Err(anyhow!(
                "health markers must declare at least one ready or counter pattern"
            ));
        }

        for pattern in self.ready.iter().chain(&self.failure) {
            compile_marker(pattern)?;
        }
        for counter in &self.counter {
            let regex = compile_marker(&counter.pattern)?;
            if regex.captures_len() < 2 {
                return Err(anyhow!(
                    "counter pattern '{}' must capture the number in a group",
                    counter.pattern
                ));
            }
            if !counter.min.is_finite() {
                return Err(anyhow!(
                    "counter pattern '{}' has a non-finite minimum",
                    counter.pattern
                ));
            }
        }
        Ok(())
    }
}

pub(crate) fn compile_marker(pattern: &str) -> anyhow::Result<Regex> {
    if pattern.trim().is_empty() {
        return Err(anyhow!("health marker pattern must not be empty"));
    }
    Regex::new(pattern).with_context(|| format!("invalid health marker pattern '{pattern}'"))
}

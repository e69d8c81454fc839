//! Pipeline configuration resolver
//!
//! Turns the raw YAML stored on a pipeline into an ordered list of
//! [`StepDefinition`]s. Two shapes are accepted:
//!
//! ```yaml
//! - name: build
//!   command: cargo build
//! - name: test
//!   command: cargo test
//!   timeout_seconds: 600
//! ```
//!
//! or the same list under a top-level `steps:` key. Ordinals follow list
//! position. Resolution is pure: the same input always yields the same steps.

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;

use crate::domain::pipeline::StepDefinition;

/// Why a pipeline configuration was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed pipeline configuration: {0}")]
    Syntax(String),

    #[error("pipeline configuration must be a list of steps or a mapping with a 'steps' list")]
    Shape,

    #[error("pipeline configuration has no steps")]
    Empty,

    #[error("step {ordinal} ('{name}') has an empty command")]
    EmptyCommand { ordinal: u32, name: String },

    #[error("step {ordinal} ('{name}') has a timeout of zero seconds")]
    ZeroTimeout { ordinal: u32, name: String },
}

#[derive(Debug, Deserialize)]
struct RawStep {
    name: Option<String>,
    #[serde(alias = "run")]
    command: Option<String>,
    timeout_seconds: Option<u64>,
}

/// Resolve a pipeline configuration into step definitions
///
/// # Errors
/// Returns a [`ConfigError`] if the YAML is malformed, has the wrong shape,
/// lists no steps, or contains a step without a command.
///
/// # Example
/// ```
/// use vortexia_core::resolver::resolve;
///
/// let steps = resolve("- name: lint\n  command: cargo clippy\n- command: cargo test\n")?;
/// assert_eq!(steps.len(), 2);
/// assert_eq!(steps[1].name, "step-2");
/// assert_eq!(steps[1].ordinal, 1);
/// # Ok::<(), vortexia_core::resolver::ConfigError>(())
/// ```
pub fn resolve(config: &str) -> Result<Vec<StepDefinition>, ConfigError> {
    if config.trim().is_empty() {
        return Err(ConfigError::Empty);
    }

    let document: Value =
        serde_yaml::from_str(config).map_err(|e| ConfigError::Syntax(e.to_string()))?;

    let list = match document {
        Value::Null => return Err(ConfigError::Empty),
        Value::Sequence(_) => document,
        Value::Mapping(mut mapping) => match mapping.remove("steps") {
            Some(Value::Null) | None => return Err(ConfigError::Empty),
            Some(steps @ Value::Sequence(_)) => steps,
            Some(_) => return Err(ConfigError::Shape),
        },
        _ => return Err(ConfigError::Shape),
    };

    let raw: Vec<RawStep> =
        serde_yaml::from_value(list).map_err(|e| ConfigError::Syntax(e.to_string()))?;

    if raw.is_empty() {
        return Err(ConfigError::Empty);
    }

    raw.into_iter()
        .enumerate()
        .map(|(position, step)| to_definition(position as u32, step))
        .collect()
}

fn to_definition(ordinal: u32, step: RawStep) -> Result<StepDefinition, ConfigError> {
    let name = step
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("step-{}", ordinal + 1));

    let command = step.command.unwrap_or_default();
    if command.trim().is_empty() {
        return Err(ConfigError::EmptyCommand { ordinal, name });
    }

    if step.timeout_seconds == Some(0) {
        return Err(ConfigError::ZeroTimeout { ordinal, name });
    }

    Ok(StepDefinition {
        name,
        command,
        ordinal,
        timeout_seconds: step.timeout_seconds,
    })
}

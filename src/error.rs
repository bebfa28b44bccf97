use crate::safety::SafetyEvent;
use crate::scheduler::StepState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("capability violation on device {device}: {param} {detail}")]
    CapabilityViolation {
        device: String,
        param: String,
        detail: String,
    },

    #[error("device {device} offline: {detail}")]
    DeviceOffline { device: String, detail: String },

    #[error("no valid reading for '{signal}' within {timeout_ms} ms")]
    SensorTimeout { signal: String, timeout_ms: u64 },

    #[error("step {step} waits on signal '{signal}' with no bound sensor or estimator")]
    MissingSignal { step: String, signal: String },

    #[error("critical condition {event:?} on {origin}: {value:?} exceeds {limit:?}")]
    CriticalCondition {
        event: SafetyEvent,
        origin: String,
        value: Option<f64>,
        limit: Option<f64>,
    },

    #[error("step {step} cannot complete: {detail}")]
    Impossible { step: String, detail: String },

    #[error("unknown device profile '{0}'")]
    UnknownDevice(String),

    #[error("step {step} depends on {dependency}, which did not complete")]
    DependencyFailed { step: String, dependency: String },

    #[error("ingredient {ingredient} unavailable for step {step}")]
    IngredientUnavailable { step: String, ingredient: String },

    #[error("session aborted: {0}")]
    Aborted(String),

    #[error("invalid step transition {from:?} -> {to:?}")]
    InvalidTransition { from: StepState, to: StepState },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("recipe error: {0}")]
    Recipe(String),
}

impl EngineError {
    /// Transient unavailability only. Nothing touching a safety predicate
    /// is ever retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::DeviceOffline { .. } | EngineError::SensorTimeout { .. }
        )
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, EngineError::CriticalCondition { .. })
    }

    pub fn offline(device: &str, detail: impl Into<String>) -> Self {
        EngineError::DeviceOffline {
            device: device.to_string(),
            detail: detail.into(),
        }
    }
}

/// A secondary guidance threshold left its band. Surfaced, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceExceeded {
    pub step: String,
    pub signal: String,
    pub value: f64,
}

impl core::fmt::Display for ToleranceExceeded {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "step {}: guidance for '{}' exceeded (reading {:.2})",
            self.step, self.signal, self.value
        )
    }
}

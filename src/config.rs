//! Engine configuration.
//!
//! Every timing and calibration value the engine uses lives here. All fields
//! default, so an empty JSON object is a valid configuration.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Accepted sampling rates, one tick per 1000 s up to 1 kHz.
pub const MIN_TICK_HZ: f64 = 0.001;
pub const MAX_TICK_HZ: f64 = 1_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub monitoring: MonitoringConfig,
    pub fusion: FusionConfig,
    pub control: ControlConfig,
    pub safety: SafetyConfig,
    pub devices: DeviceConfig,
    pub sensors: SensorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Consecutive satisfied ticks before a step completes.
    pub debounce_ticks: u32,
    pub default_tick_hz: f64,
    /// Sampling rate per recipe phase.
    pub phases: BTreeMap<String, f64>,
    pub continue_after_failure: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        let mut phases = BTreeMap::new();
        phases.insert("preheat".to_string(), 1.0);
        phases.insert("critical".to_string(), 10.0);
        Self {
            debounce_ticks: 3,
            default_tick_hz: 1.0,
            phases,
            continue_after_failure: false,
        }
    }
}

impl MonitoringConfig {
    pub fn tick_period(&self, phase: Option<&str>) -> Duration {
        let hz = phase
            .and_then(|p| self.phases.get(p).copied())
            .unwrap_or(self.default_tick_hz)
            .clamp(MIN_TICK_HZ, MAX_TICK_HZ);
        Duration::from_secs_f64(1.0 / hz)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub staleness_timeout_ms: u64,
    pub outlier_sigma: f64,
    /// Floor applied to the history standard deviation.
    pub min_stddev: f64,
    pub virtual_confidence_cap: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            staleness_timeout_ms: 5_000,
            outlier_sigma: 3.0,
            min_stddev: 0.05,
            virtual_confidence_cap: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral_limit: f64,
    pub output_limit: f64,
    pub lookahead_s: f64,
    pub overshoot_margin: f64,
    pub dampening_factor: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            kp: 2.0,
            ki: 0.05,
            kd: 0.5,
            integral_limit: 200.0,
            output_limit: 50.0,
            lookahead_s: 30.0,
            overshoot_margin: 2.0,
            dampening_factor: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub max_temperature_c: f64,
    pub max_pressure_bar: f64,
    pub max_runtime_s: f64,
    /// Fraction of a ceiling at which a warning is recorded.
    pub warning_fraction: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_temperature_c: 320.0,
            max_pressure_bar: 2.5,
            max_runtime_s: 4.0 * 3600.0,
            warning_fraction: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub retry_limit: u32,
    pub retry_backoff_ms: u64,
    pub ack_timeout_ms: u64,
    pub stop_grace_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            retry_limit: 2,
            retry_backoff_ms: 500,
            ack_timeout_ms: 5_000,
            stop_grace_ms: 3_000,
        }
    }
}

impl DeviceConfig {
    /// Exponential backoff before retry `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub sensor_timeout_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sensor_timeout_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let m = &self.monitoring;
        if m.debounce_ticks == 0 {
            return Err(EngineError::Config("debounce_ticks must be at least 1".into()));
        }
        let rates = core::iter::once(("default", m.default_tick_hz))
            .chain(m.phases.iter().map(|(k, v)| (k.as_str(), *v)));
        for (name, hz) in rates {
            if !(MIN_TICK_HZ..=MAX_TICK_HZ).contains(&hz) {
                return Err(EngineError::Config(format!(
                    "tick rate for phase '{name}' must lie in [{MIN_TICK_HZ}, {MAX_TICK_HZ}] Hz, got {hz}"
                )));
            }
        }

        let f = &self.fusion;
        if !(0.0..=1.0).contains(&f.virtual_confidence_cap) {
            return Err(EngineError::Config(
                "virtual_confidence_cap must lie in [0, 1]".into(),
            ));
        }
        if f.outlier_sigma <= 0.0 || f.min_stddev < 0.0 {
            return Err(EngineError::Config(
                "outlier_sigma must be positive and min_stddev non-negative".into(),
            ));
        }

        let c = &self.control;
        if !(0.0..=1.0).contains(&c.dampening_factor) {
            return Err(EngineError::Config(
                "dampening_factor must lie in [0, 1]".into(),
            ));
        }
        if c.output_limit < 0.0 || c.integral_limit < 0.0 || c.lookahead_s < 0.0 {
            return Err(EngineError::Config(
                "control limits and lookahead must be non-negative".into(),
            ));
        }

        let s = &self.safety;
        if s.max_temperature_c <= 0.0 || s.max_pressure_bar <= 0.0 || s.max_runtime_s <= 0.0 {
            return Err(EngineError::Config("safety ceilings must be positive".into()));
        }
        if !(0.0..=1.0).contains(&s.warning_fraction) {
            return Err(EngineError::Config(
                "warning_fraction must lie in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.monitoring.debounce_ticks, 3);
        assert_eq!(config.fusion.staleness_timeout_ms, 5_000);
        assert_eq!(config.sensors.sensor_timeout_ms, 30_000);
        assert_eq!(config.devices.retry_limit, 2);
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_json_str(
            r#"{"monitoring": {"debounce_ticks": 5}, "safety": {"max_pressure_bar": 1.8}}"#,
        )
        .unwrap();
        assert_eq!(config.monitoring.debounce_ticks, 5);
        assert!((config.monitoring.default_tick_hz - 1.0).abs() < f64::EPSILON);
        assert!((config.safety.max_pressure_bar - 1.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_phase_tick_periods() {
        let config = MonitoringConfig::default();
        assert_eq!(config.tick_period(None), Duration::from_secs(1));
        assert_eq!(config.tick_period(Some("critical")), Duration::from_millis(100));
        assert_eq!(config.tick_period(Some("unknown")), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(EngineConfig::from_json_str(r#"{"monitoring": {"debounce_ticks": 0}}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"monitoring": {"phases": {"sear": 0}}}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"fusion": {"virtual_confidence_cap": 1.5}}"#).is_err());
        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_extreme_tick_rates_rejected() {
        for json in [
            r#"{"monitoring": {"default_tick_hz": 1e20}}"#,
            r#"{"monitoring": {"default_tick_hz": 1e-300}}"#,
            r#"{"monitoring": {"phases": {"critical": 5000}}}"#,
        ] {
            assert!(matches!(
                EngineConfig::from_json_str(json),
                Err(EngineError::Config(_))
            ));
        }
        assert!(EngineConfig::from_json_str(r#"{"monitoring": {"default_tick_hz": 1000}}"#).is_ok());
    }

    #[test]
    fn test_tick_period_never_zero() {
        let mut config = MonitoringConfig::default();
        config.default_tick_hz = 1e20;
        let fastest = config.tick_period(None);
        assert!(fastest >= Duration::from_micros(999) && fastest <= Duration::from_micros(1_001));
        config.default_tick_hz = 1e-300;
        let slowest = config.tick_period(None);
        assert!(slowest >= Duration::from_secs(999) && slowest <= Duration::from_secs(1_001));
    }

    #[test]
    fn test_backoff_doubles() {
        let devices = DeviceConfig::default();
        assert_eq!(devices.backoff(1), Duration::from_millis(500));
        assert_eq!(devices.backoff(2), Duration::from_millis(1000));
    }
}

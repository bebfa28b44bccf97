use crate::config::SafetyConfig;
use crate::driver::DeviceStatus;
use crate::error::EngineError;
use crate::recipe::DeviceProfile;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{error, warn};

const MAX_SAFETY_EVENTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SafetyLevel {
    Normal,
    Caution,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyEvent {
    TemperatureHigh,
    PressureHigh,
    RuntimeExceeded,
    DeviceFault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyEventRecord {
    pub event: SafetyEvent,
    pub timestamp_ms: u64,
    pub level: SafetyLevel,
    /// Device or signal the predicate was evaluated on.
    pub origin: String,
    pub value: Option<f64>,
    pub limit: Option<f64>,
    pub resolved: bool,
}

/// Ceilings for one device: the tighter of configuration and capability.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    pub max_temperature_c: f64,
    pub max_pressure_bar: f64,
    pub max_runtime_s: f64,
    pub warning_fraction: f64,
}

impl SafetyLimits {
    pub fn from_config(config: &SafetyConfig) -> Self {
        Self {
            max_temperature_c: config.max_temperature_c,
            max_pressure_bar: config.max_pressure_bar,
            max_runtime_s: config.max_runtime_s,
            warning_fraction: config.warning_fraction,
        }
    }

    pub fn for_device(config: &SafetyConfig, profile: Option<&DeviceProfile>) -> Self {
        let mut limits = Self::from_config(config);
        let Some(profile) = profile else {
            return limits;
        };
        let temperature = profile
            .limit("max_temperature_c")
            .into_iter()
            .chain(profile.range_for("temperature_c").map(|(_, max)| max));
        for ceiling in temperature {
            limits.max_temperature_c = limits.max_temperature_c.min(ceiling);
        }
        if let Some(ceiling) = profile.limit("max_pressure_bar") {
            limits.max_pressure_bar = limits.max_pressure_bar.min(ceiling);
        }
        if let Some(ceiling) = profile.limit("max_runtime_s") {
            limits.max_runtime_s = limits.max_runtime_s.min(ceiling);
        }
        limits
    }

    /// Ceiling guarding a sensor kind such as `"temperature"` or `"pressure"`.
    pub fn ceiling(&self, kind: &str) -> Option<(SafetyEvent, f64)> {
        let kind = kind.to_ascii_lowercase();
        if kind.contains("temp") {
            Some((SafetyEvent::TemperatureHigh, self.max_temperature_c))
        } else if kind.contains("pressure") {
            Some((SafetyEvent::PressureHigh, self.max_pressure_bar))
        } else {
            None
        }
    }
}

/// One fused scalar handed to the monitor.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub signal: &'a str,
    pub kind: &'a str,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyAssessment {
    pub level: SafetyLevel,
    /// First critical predicate found this tick.
    pub violation: Option<EngineError>,
}

impl SafetyAssessment {
    pub fn is_critical(&self) -> bool {
        self.violation.is_some()
    }
}

#[derive(Debug)]
pub struct SafetyMonitor {
    event_history: heapless::Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
    level: SafetyLevel,
}

impl SafetyMonitor {
    pub fn new() -> Self {
        Self {
            event_history: heapless::Vec::new(),
            level: SafetyLevel::Normal,
        }
    }

    /// Checks every critical predicate for one device against this tick's
    /// observations, its status and its continuous runtime.
    pub fn assess(
        &mut self,
        now_ms: u64,
        device: &str,
        limits: &SafetyLimits,
        observations: &[Observation<'_>],
        status: Option<&DeviceStatus>,
        runtime_ms: u64,
    ) -> SafetyAssessment {
        let mut violation = None;

        for obs in observations {
            let Some((event, ceiling)) = limits.ceiling(obs.kind) else {
                continue;
            };
            let found = self.check_ceiling(now_ms, event, obs.signal, obs.value, ceiling, limits);
            violation = violation.or(found);
        }

        let runtime_s = runtime_ms as f64 / 1000.0;
        let found = self.check_ceiling(
            now_ms,
            SafetyEvent::RuntimeExceeded,
            device,
            runtime_s,
            limits.max_runtime_s,
            limits,
        );
        violation = violation.or(found);

        if let Some(fault) = status.and_then(|s| s.error.as_deref()) {
            error!(device, fault, "device reported an error");
            self.record_event(SafetyEventRecord {
                event: SafetyEvent::DeviceFault,
                timestamp_ms: now_ms,
                level: SafetyLevel::Critical,
                origin: device.to_string(),
                value: None,
                limit: None,
                resolved: false,
            });
            violation = violation.or(Some(EngineError::CriticalCondition {
                event: SafetyEvent::DeviceFault,
                origin: device.to_string(),
                value: None,
                limit: None,
            }));
        }

        self.update_safety_level();
        SafetyAssessment {
            level: self.level,
            violation,
        }
    }

    fn check_ceiling(
        &mut self,
        now_ms: u64,
        event: SafetyEvent,
        origin: &str,
        value: f64,
        ceiling: f64,
        limits: &SafetyLimits,
    ) -> Option<EngineError> {
        let level = if value > ceiling {
            SafetyLevel::Critical
        } else if value > ceiling * limits.warning_fraction {
            SafetyLevel::Warning
        } else {
            self.resolve(event, origin);
            return None;
        };

        if level == SafetyLevel::Critical {
            error!(origin, ?event, value, ceiling, "critical safety predicate");
        } else {
            warn!(origin, ?event, value, ceiling, "approaching safety ceiling");
        }
        self.record_event(SafetyEventRecord {
            event,
            timestamp_ms: now_ms,
            level,
            origin: origin.to_string(),
            value: Some(value),
            limit: Some(ceiling),
            resolved: false,
        });

        (level == SafetyLevel::Critical).then(|| EngineError::CriticalCondition {
            event,
            origin: origin.to_string(),
            value: Some(value),
            limit: Some(ceiling),
        })
    }

    /// Warnings clear once the value falls back; critical events stay.
    fn resolve(&mut self, event: SafetyEvent, origin: &str) {
        for record in self.event_history.iter_mut() {
            if record.event == event
                && record.origin == origin
                && !record.resolved
                && record.level < SafetyLevel::Critical
            {
                record.resolved = true;
            }
        }
    }

    fn update_safety_level(&mut self) {
        self.level = self
            .event_history
            .iter()
            .filter(|event| !event.resolved)
            .map(|event| event.level)
            .max()
            .unwrap_or(SafetyLevel::Normal);
    }

    fn record_event(&mut self, record: SafetyEventRecord) {
        if let Some(existing) = self
            .event_history
            .iter_mut()
            .find(|e| e.event == record.event && e.origin == record.origin && !e.resolved)
        {
            existing.timestamp_ms = record.timestamp_ms;
            existing.level = existing.level.max(record.level);
            existing.value = record.value;
            return;
        }

        if self.event_history.is_full() {
            self.event_history.remove(0);
        }
        let _ = self.event_history.push(record);
    }

    pub fn level(&self) -> SafetyLevel {
        self.level
    }

    pub fn get_event_history(&self) -> &[SafetyEventRecord] {
        &self.event_history
    }

    pub fn clear_resolved_events(&mut self) {
        self.event_history.retain(|event| !event.resolved);
    }
}

impl Default for SafetyMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Session-wide stop flag shared by external abort and the safety monitor.
///
/// Tripping is one-way: a tripped session never runs another command.
#[derive(Debug)]
pub struct SafetyInterlock {
    tripped: AtomicBool,
    reason: Mutex<Option<EngineError>>,
    tx: watch::Sender<bool>,
}

impl SafetyInterlock {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tripped: AtomicBool::new(false),
            reason: Mutex::new(None),
            tx,
        }
    }

    /// Returns `true` only for the caller that actually tripped it.
    pub fn trip(&self, reason: EngineError) -> bool {
        if self.tripped.swap(true, Ordering::SeqCst) {
            return false;
        }
        *self.reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
        self.tx.send_replace(true);
        true
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<EngineError> {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for SafetyInterlock {
    fn default() -> Self {
        Self::new()
    }
}

//! Device Command Translator.
//!
//! Turns a step plus a device profile into a concrete [`DeviceCommand`] and
//! owns the per-device command slot: at most one outstanding command per
//! device, later requests queue behind the current lease.

use crate::controller::{CONTROL_PARAM, SETPOINT_PARAM, SETPOINT_SIGNAL_PARAM};
use crate::driver::{CommandAck, DeviceCommand, DeviceDriver};
use crate::error::EngineError;
use crate::recipe::{DeviceProfile, ParamValue, Step};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// `(device type, step param, device param)`
const PARAM_ALIASES: &[(&str, &str, &str)] = &[
    ("oven", "temperature_c", "target_temperature_c"),
    ("oven", "time_min", "timer_min"),
    ("sous_vide", "temperature_c", "water_temperature_c"),
    ("pressure_cooker", "pressure_bar", "target_pressure_bar"),
    ("pressure_cooker", "temperature_c", "target_temperature_c"),
    ("mixer", "speed", "speed_level"),
    ("induction_hob", "power_pct", "power_level_pct"),
];

/// Step params consumed by the engine itself.
const ENGINE_PARAMS: &[&str] = &[
    SETPOINT_SIGNAL_PARAM,
    SETPOINT_PARAM,
    CONTROL_PARAM,
    "kp",
    "ki",
    "kd",
];

pub fn device_param_name<'a>(device_type: &str, param: &'a str) -> &'a str {
    PARAM_ALIASES
        .iter()
        .find(|(t, from, _)| *t == device_type && *from == param)
        .map_or(param, |(_, _, to)| to)
}

#[derive(Debug, Default)]
pub struct DeviceSlot {
    pub outstanding: Option<DeviceCommand>,
    pub dispatched_at_ms: Option<u64>,
    pub commands_sent: u32,
}

/// Exclusive hold on one device's command slot.
#[derive(Debug)]
pub struct DeviceLease {
    device_id: String,
    guard: OwnedMutexGuard<DeviceSlot>,
}

impl DeviceLease {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn outstanding(&self) -> Option<&DeviceCommand> {
        self.guard.outstanding.as_ref()
    }

    /// Continuous runtime since the first command under this lease.
    pub fn runtime_ms(&self, now_ms: u64) -> u64 {
        self.guard
            .dispatched_at_ms
            .map_or(0, |t| now_ms.saturating_sub(t))
    }

    pub fn commands_sent(&self) -> u32 {
        self.guard.commands_sent
    }

    pub async fn send(
        &mut self,
        driver: &dyn DeviceDriver,
        command: DeviceCommand,
        now_ms: u64,
        ack_timeout: Duration,
    ) -> Result<CommandAck, EngineError> {
        let ack = match tokio::time::timeout(ack_timeout, driver.send(&self.device_id, &command)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::offline(
                    &self.device_id,
                    format!("no acknowledgment within {} ms", ack_timeout.as_millis()),
                ))
            }
        };
        self.guard.commands_sent = self.guard.commands_sent.saturating_add(1);
        self.guard.dispatched_at_ms.get_or_insert(now_ms);
        self.guard.outstanding = Some(command);
        Ok(ack)
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.guard.outstanding = None;
        self.guard.dispatched_at_ms = None;
    }
}

#[derive(Debug, Default)]
pub struct CommandTranslator {
    slots: Mutex<BTreeMap<String, Arc<AsyncMutex<DeviceSlot>>>>,
    next_sequence: AtomicU64,
}

impl CommandTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the command for `step` on `profile`.
    ///
    /// Profile defaults are overridden field by field by step params, then
    /// controller `adjustments` are added. Step-supplied values outside the
    /// device range are rejected; defaults and adjusted values are clamped.
    pub fn translate(
        &self,
        step: &Step,
        profile: &DeviceProfile,
        adjustments: &BTreeMap<String, f64>,
    ) -> Result<DeviceCommand, EngineError> {
        if let Some(actions) = profile.supported_actions() {
            if !actions.iter().any(|a| a == &step.action) {
                return Err(EngineError::CapabilityViolation {
                    device: profile.id.clone(),
                    param: "action".into(),
                    detail: format!("'{}' is not a supported action", step.action),
                });
            }
        }

        // name -> (value, required)
        let mut merged: BTreeMap<String, (ParamValue, bool)> = profile
            .params
            .iter()
            .map(|(k, v)| (k.clone(), (v.clone(), false)))
            .collect();
        for (name, value) in &step.params {
            if ENGINE_PARAMS.contains(&name.as_str()) {
                continue;
            }
            merged.insert(name.clone(), (value.clone(), true));
        }
        for (name, delta) in adjustments {
            let base = merged
                .get(name)
                .and_then(|(v, _)| v.as_f64())
                .unwrap_or(0.0);
            merged.insert(name.clone(), (ParamValue::Number(base + delta), false));
        }

        let mut params = BTreeMap::new();
        for (name, (value, required)) in merged {
            let value = match (value, profile.range_for(&name)) {
                (ParamValue::Number(v), Some((min, max))) if !(min..=max).contains(&v) => {
                    if required {
                        return Err(EngineError::CapabilityViolation {
                            device: profile.id.clone(),
                            param: name,
                            detail: format!("{v} outside [{min}, {max}]"),
                        });
                    }
                    let clamped = v.clamp(min, max);
                    debug!(device = %profile.id, param = %name, requested = v, clamped, "clamped optional param");
                    ParamValue::Number(clamped)
                }
                (value, _) => value,
            };
            params.insert(
                device_param_name(&profile.device_type, &name).to_string(),
                value,
            );
        }

        Ok(DeviceCommand {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed) + 1,
            step_id: step.id.clone(),
            device_id: profile.id.clone(),
            device_type: profile.device_type.clone(),
            action: step.action.clone(),
            params,
        })
    }

    fn slot(&self, device_id: &str) -> Arc<AsyncMutex<DeviceSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(device_id.to_string()).or_default())
    }

    /// Waits for the device's command slot.
    pub async fn acquire(&self, device_id: &str) -> DeviceLease {
        let guard = self.slot(device_id).lock_owned().await;
        DeviceLease {
            device_id: device_id.to_string(),
            guard,
        }
    }

    pub fn is_busy(&self, device_id: &str) -> bool {
        self.slot(device_id).try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oven() -> DeviceProfile {
        DeviceProfile::new("oven-1", "oven")
            .with_range("temperature_range_c", 30.0, 300.0)
            .with_range("fan_pct", 0.0, 100.0)
            .with_default("temperature_c", 160.0)
            .with_default("fan_pct", 120.0)
            .with_default("mode", "conventional")
    }

    #[test]
    fn test_required_param_out_of_range_rejected() {
        let translator = CommandTranslator::new();
        let step = Step::new("s-bake", "bake")
            .with_device("oven-1")
            .with_param("temperature_c", 350.0);
        let err = translator
            .translate(&step, &oven(), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CapabilityViolation { ref param, .. } if param == "temperature_c"
        ));
    }

    #[test]
    fn test_step_params_override_defaults_and_alias() {
        let translator = CommandTranslator::new();
        let step = Step::new("s-bake", "bake")
            .with_param("temperature_c", 180.0)
            .with_param("mode", "convection");
        let command = translator.translate(&step, &oven(), &BTreeMap::new()).unwrap();

        assert_eq!(command.number("target_temperature_c"), Some(180.0));
        assert!(command.params.get("temperature_c").is_none());
        assert_eq!(
            command.params.get("mode"),
            Some(&ParamValue::Text("convection".into()))
        );
        // out-of-range default is clamped, not rejected
        assert_eq!(command.number("fan_pct"), Some(100.0));
        assert_eq!(command.action, "bake");
    }

    #[test]
    fn test_adjustments_are_clamped() {
        let translator = CommandTranslator::new();
        let profile = DeviceProfile::new("circ-1", "sous_vide").with_range("power_pct", 0.0, 100.0);
        let step = Step::new("s-cook", "heat")
            .with_param("power_pct", 90.0)
            .with_param(SETPOINT_SIGNAL_PARAM, "water_temp_c")
            .with_param(SETPOINT_PARAM, 60.0)
            .with_param("kp", 2.0);

        let adjustments: BTreeMap<String, f64> = [("power_pct".to_string(), 25.0)].into();
        let command = translator.translate(&step, &profile, &adjustments).unwrap();
        assert_eq!(command.number("power_pct"), Some(100.0));
        assert!(command.params.get(SETPOINT_SIGNAL_PARAM).is_none());
        assert!(command.params.get(SETPOINT_PARAM).is_none());
        assert!(command.params.get("kp").is_none());

        let adjustments: BTreeMap<String, f64> = [("power_pct".to_string(), -40.0)].into();
        let command = translator.translate(&step, &profile, &adjustments).unwrap();
        assert_eq!(command.number("power_pct"), Some(50.0));
    }

    #[test]
    fn test_unsupported_action_rejected() {
        let translator = CommandTranslator::new();
        let mut profile = DeviceProfile::new("mixer-1", "mixer");
        profile.capabilities.insert(
            "actions".into(),
            crate::recipe::Capability::Names(vec!["mix".into(), "knead".into()]),
        );
        assert!(translator
            .translate(&Step::new("s-1", "knead"), &profile, &BTreeMap::new())
            .is_ok());
        assert!(translator
            .translate(&Step::new("s-2", "bake"), &profile, &BTreeMap::new())
            .is_err());
    }

    #[test]
    fn test_sequences_increase() {
        let translator = CommandTranslator::new();
        let step = Step::new("s-1", "bake");
        let a = translator.translate(&step, &oven(), &BTreeMap::new()).unwrap();
        let b = translator.translate(&step, &oven(), &BTreeMap::new()).unwrap();
        assert!(b.sequence > a.sequence);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_lease_per_device() {
        let translator = Arc::new(CommandTranslator::new());
        let first = translator.acquire("oven-1").await;
        assert!(translator.is_busy("oven-1"));
        assert!(!translator.is_busy("mixer-1"));

        let waiter = {
            let translator = Arc::clone(&translator);
            tokio::spawn(async move { translator.acquire("oven-1").await.device_id().to_string() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        assert_eq!(waiter.await.unwrap(), "oven-1");
    }
}

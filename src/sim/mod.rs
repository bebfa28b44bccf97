//! Simulated kitchen hardware.
//!
//! [`SimKitchen`] implements both driver traits over an in-memory model:
//! thermal appliances advanced on the session clock, probes bound to
//! appliance channels, scripted sensors, and injectable faults.

pub mod thermal;

pub use thermal::{ThermalAppliance, ThermalState};

use crate::driver::{Clock, CommandAck, DeviceCommand, DeviceDriver, DeviceStatus, SensorDriver, SensorReading, SignalValue};
use crate::error::EngineError;
use crate::recipe::{Recipe, SensorSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

const ROOM_TEMP_C: f64 = 21.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimFault {
    /// Fails the next `failures` sends and reports offline meanwhile.
    DeviceOffline { device: String, failures: u32 },
    /// `stop` never acknowledges.
    UnresponsiveStop { device: String },
    /// Status carries an error flag.
    DeviceError { device: String, message: String },
    /// Keeps returning the last reading with its old timestamp.
    FrozenSensor { sensor: String },
    FailingSensor { sensor: String },
    /// Answers each read only after `delay_ms`.
    SlowSensor { sensor: String, delay_ms: u64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultInjectionStats {
    pub rejected_sends: u32,
    pub ignored_stops: u32,
    pub failed_reads: u32,
    pub frozen_reads: u32,
}

#[derive(Debug)]
enum Device {
    Thermal(ThermalAppliance),
    Plain { running: bool },
}

#[derive(Debug)]
enum SensorBinding {
    Channel { device: String, channel: String },
    Script { values: VecDeque<SignalValue>, last: Option<SignalValue> },
    Constant(SignalValue),
}

#[derive(Debug, Default)]
struct Faults {
    offline: BTreeMap<String, u32>,
    unresponsive: BTreeSet<String>,
    errors: BTreeMap<String, String>,
    frozen: BTreeMap<String, Option<SensorReading>>,
    failing: BTreeSet<String>,
    slow: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct KitchenState {
    devices: BTreeMap<String, Device>,
    sensors: BTreeMap<String, SensorBinding>,
    faults: Faults,
    stats: FaultInjectionStats,
    commands: Vec<DeviceCommand>,
    stops: Vec<String>,
    advanced_to_ms: u64,
}

#[derive(Debug)]
pub struct SimKitchen {
    clock: Clock,
    time_scale: f64,
    state: Mutex<KitchenState>,
}

impl SimKitchen {
    pub fn new() -> Self {
        Self {
            clock: Clock::new(),
            time_scale: 1.0,
            state: Mutex::new(KitchenState::default()),
        }
    }

    /// Physics runs `scale` times faster than the clock.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    /// Devices from the recipe's profiles, with driver sensors bound by
    /// convention: a temperature sensor on a heated appliance reads the core
    /// channel when its signal names the food (`internal`, `core`) and the
    /// cavity otherwise; pressure sensors read vessel pressure; untargeted
    /// sensors read room temperature.
    pub fn from_recipe(recipe: &Recipe) -> Self {
        let kitchen = Self::new();
        for profile in &recipe.device_profiles {
            match ThermalAppliance::for_device_type(&profile.device_type) {
                Some(appliance) => kitchen.add_appliance(&profile.id, appliance),
                None => kitchen.add_device(&profile.id),
            }
        }
        for sensor in &recipe.sensors {
            if sensor.is_virtual() || sensor.source != SensorSource::Driver {
                continue;
            }
            let kind = sensor.kind.to_ascii_lowercase();
            match sensor.target.as_deref() {
                Some(device) if kitchen.is_thermal(device) => {
                    let channel = if kind.contains("pressure") {
                        thermal::PRESSURE_CHANNEL
                    } else if sensor.signal.contains("internal") || sensor.signal.contains("core") {
                        thermal::CORE_CHANNEL
                    } else {
                        thermal::CAVITY_CHANNEL
                    };
                    kitchen.bind_probe(&sensor.id, device, channel);
                }
                None if kind.contains("temp") => kitchen.constant(&sensor.id, ROOM_TEMP_C),
                _ => debug!(sensor = %sensor.id, "sensor left unbound"),
            }
        }
        kitchen
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KitchenState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_thermal(&self, device: &str) -> bool {
        matches!(self.lock().devices.get(device), Some(Device::Thermal(_)))
    }

    pub fn add_appliance(&self, device: &str, appliance: ThermalAppliance) {
        self.lock()
            .devices
            .insert(device.to_string(), Device::Thermal(appliance));
    }

    pub fn add_device(&self, device: &str) {
        self.lock()
            .devices
            .insert(device.to_string(), Device::Plain { running: false });
    }

    pub fn bind_probe(&self, sensor: &str, device: &str, channel: &str) {
        self.lock().sensors.insert(
            sensor.to_string(),
            SensorBinding::Channel {
                device: device.to_string(),
                channel: channel.to_string(),
            },
        );
    }

    /// One value per read; the last value repeats once the script runs out.
    pub fn script<V: Into<SignalValue>>(&self, sensor: &str, values: impl IntoIterator<Item = V>) {
        self.lock().sensors.insert(
            sensor.to_string(),
            SensorBinding::Script {
                values: values.into_iter().map(Into::into).collect(),
                last: None,
            },
        );
    }

    pub fn constant(&self, sensor: &str, value: impl Into<SignalValue>) {
        self.lock()
            .sensors
            .insert(sensor.to_string(), SensorBinding::Constant(value.into()));
    }

    pub fn inject(&self, fault: SimFault) {
        info!(?fault, "injecting fault");
        let mut state = self.lock();
        let faults = &mut state.faults;
        match fault {
            SimFault::DeviceOffline { device, failures } => {
                faults.offline.insert(device, failures);
            }
            SimFault::UnresponsiveStop { device } => {
                faults.unresponsive.insert(device);
            }
            SimFault::DeviceError { device, message } => {
                faults.errors.insert(device, message);
            }
            SimFault::FrozenSensor { sensor } => {
                faults.frozen.insert(sensor, None);
            }
            SimFault::FailingSensor { sensor } => {
                faults.failing.insert(sensor);
            }
            SimFault::SlowSensor { sensor, delay_ms } => {
                faults.slow.insert(sensor, delay_ms);
            }
        }
    }

    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.lock().commands.clone()
    }

    pub fn commands_for(&self, device: &str) -> Vec<DeviceCommand> {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.device_id == device)
            .cloned()
            .collect()
    }

    pub fn stops(&self) -> Vec<String> {
        self.lock().stops.clone()
    }

    pub fn thermal_state(&self, device: &str) -> Option<ThermalState> {
        let mut state = self.lock();
        self.advance(&mut state);
        match state.devices.get(device)? {
            Device::Thermal(appliance) => Some(appliance.state().clone()),
            Device::Plain { .. } => None,
        }
    }

    pub fn is_running(&self, device: &str) -> bool {
        match self.lock().devices.get(device) {
            Some(Device::Thermal(appliance)) => appliance.state().running,
            Some(Device::Plain { running }) => *running,
            None => false,
        }
    }

    pub fn get_fault_injection_stats(&self) -> FaultInjectionStats {
        self.lock().stats.clone()
    }

    fn advance(&self, state: &mut KitchenState) {
        let now = self.clock.now_ms();
        let dt_s = now.saturating_sub(state.advanced_to_ms) as f64 / 1000.0 * self.time_scale;
        state.advanced_to_ms = now;
        if dt_s <= 0.0 {
            return;
        }
        for device in state.devices.values_mut() {
            if let Device::Thermal(appliance) = device {
                appliance.advance(dt_s);
            }
        }
    }
}

impl Default for SimKitchen {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceDriver for SimKitchen {
    async fn send(&self, device_id: &str, command: &DeviceCommand) -> Result<CommandAck, EngineError> {
        let mut state = self.lock();
        self.advance(&mut state);
        if let Some(failures) = state.faults.offline.get_mut(device_id) {
            if *failures > 0 {
                *failures -= 1;
                state.stats.rejected_sends += 1;
                return Err(EngineError::offline(device_id, "simulated link down"));
            }
        }
        let Some(device) = state.devices.get_mut(device_id) else {
            return Err(EngineError::offline(device_id, "no such device"));
        };
        match device {
            Device::Thermal(appliance) => appliance.apply(command),
            Device::Plain { running } => *running = true,
        }
        state.commands.push(command.clone());
        debug!(device = device_id, action = %command.action, sequence = command.sequence, "sim command");
        Ok(CommandAck {
            device_id: device_id.to_string(),
            sequence: command.sequence,
            timestamp_ms: self.clock.now_ms(),
        })
    }

    async fn status(&self, device_id: &str) -> Result<DeviceStatus, EngineError> {
        let mut state = self.lock();
        self.advance(&mut state);
        let offline = state.faults.offline.get(device_id).is_some_and(|n| *n > 0);
        let error = state.faults.errors.get(device_id).cloned();
        let telemetry = match state.devices.get(device_id) {
            Some(Device::Thermal(appliance)) => appliance.telemetry(),
            Some(Device::Plain { .. }) => BTreeMap::new(),
            None => return Err(EngineError::offline(device_id, "no such device")),
        };
        Ok(DeviceStatus {
            online: !offline,
            telemetry,
            error,
        })
    }

    async fn stop(&self, device_id: &str) -> Result<CommandAck, EngineError> {
        let unresponsive = {
            let mut state = self.lock();
            self.advance(&mut state);
            state.stops.push(device_id.to_string());
            if state.faults.unresponsive.contains(device_id) {
                state.stats.ignored_stops += 1;
                true
            } else {
                match state.devices.get_mut(device_id) {
                    Some(Device::Thermal(appliance)) => appliance.stop(),
                    Some(Device::Plain { running }) => *running = false,
                    None => return Err(EngineError::offline(device_id, "no such device")),
                }
                false
            }
        };
        if unresponsive {
            std::future::pending::<()>().await;
        }
        Ok(CommandAck {
            device_id: device_id.to_string(),
            sequence: 0,
            timestamp_ms: self.clock.now_ms(),
        })
    }
}

#[async_trait]
impl SensorDriver for SimKitchen {
    async fn read(&self, sensor_id: &str) -> Result<SensorReading, EngineError> {
        let delay_ms = self.lock().faults.slow.get(sensor_id).copied();
        if let Some(delay_ms) = delay_ms {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let mut state = self.lock();
        self.advance(&mut state);
        let now = self.clock.now_ms();
        let timeout = || EngineError::SensorTimeout {
            signal: sensor_id.to_string(),
            timeout_ms: 0,
        };

        if state.faults.failing.contains(sensor_id) {
            state.stats.failed_reads += 1;
            return Err(timeout());
        }
        if let Some(Some(frozen)) = state.faults.frozen.get(sensor_id) {
            let frozen = frozen.clone();
            state.stats.frozen_reads += 1;
            return Ok(frozen);
        }

        let KitchenState {
            devices, sensors, ..
        } = &mut *state;
        let value = match sensors.get_mut(sensor_id).ok_or_else(timeout)? {
            SensorBinding::Channel { device, channel } => match devices.get(device.as_str()) {
                Some(Device::Thermal(appliance)) => {
                    SignalValue::Scalar(appliance.channel(channel).ok_or_else(timeout)?)
                }
                _ => return Err(timeout()),
            },
            SensorBinding::Script { values, last } => {
                if let Some(next) = values.pop_front() {
                    *last = Some(next);
                }
                last.clone().ok_or_else(timeout)?
            }
            SensorBinding::Constant(value) => value.clone(),
        };

        let reading = SensorReading::new(sensor_id, value, now);
        if let Some(slot @ None) = state.faults.frozen.get_mut(sensor_id) {
            *slot = Some(reading.clone());
        }
        Ok(reading)
    }
}

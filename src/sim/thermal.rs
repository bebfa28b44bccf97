use crate::driver::DeviceCommand;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const ROOM_TEMP_C: f64 = 21.0;
const ATMOSPHERIC_BAR: f64 = 1.0;
/// Sealed-vessel pressure gain above boiling.
const BAR_PER_K_ABOVE_BOILING: f64 = 0.05;
const BOILING_C: f64 = 100.0;
/// Integration step cap for stability.
const MAX_STEP_S: f64 = 1.0;

pub const CAVITY_CHANNEL: &str = "cavity_temp_c";
pub const CORE_CHANNEL: &str = "core_temp_c";
pub const PRESSURE_CHANNEL: &str = "pressure_bar";
pub const POWER_CHANNEL: &str = "power_pct";

const TARGET_PARAMS: [&str; 3] = ["target_temperature_c", "water_temperature_c", "temperature_c"];
const POWER_PARAMS: [&str; 2] = ["power_pct", "power_level_pct"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalState {
    pub cavity_c: f64,
    pub core_c: f64,
    pub pressure_bar: f64,
    pub power_pct: f64,
    pub running: bool,
    pub target_c: Option<f64>,
}

/// Heated appliance with a thermostat: a cavity (oven air, water bath,
/// vessel contents) losing heat to the room, and food whose core lags it.
#[derive(Debug, Clone)]
pub struct ThermalAppliance {
    state: ThermalState,
    ambient_c: f64,
    max_power_w: f64,
    heat_capacity_j_per_k: f64,
    loss_w_per_k: f64,
    core_time_constant_s: f64,
    sealed: bool,
}

impl ThermalAppliance {
    pub fn new(max_power_w: f64, heat_capacity_j_per_k: f64, loss_w_per_k: f64) -> Self {
        Self {
            state: ThermalState {
                cavity_c: ROOM_TEMP_C,
                core_c: ROOM_TEMP_C,
                pressure_bar: ATMOSPHERIC_BAR,
                power_pct: 0.0,
                running: false,
                target_c: None,
            },
            ambient_c: ROOM_TEMP_C,
            max_power_w,
            heat_capacity_j_per_k,
            loss_w_per_k,
            core_time_constant_s: 900.0,
            sealed: false,
        }
    }

    pub fn oven() -> Self {
        Self::new(3_500.0, 15_000.0, 8.0)
    }

    pub fn sous_vide() -> Self {
        Self::new(1_200.0, 40_000.0, 6.0).with_core_time_constant(1_200.0)
    }

    pub fn pressure_cooker() -> Self {
        Self::new(1_000.0, 12_000.0, 3.0).sealed()
    }

    pub fn hob() -> Self {
        Self::new(2_000.0, 8_000.0, 10.0).with_core_time_constant(300.0)
    }

    /// Preset for a device type, `None` for appliances without heating.
    pub fn for_device_type(device_type: &str) -> Option<Self> {
        match device_type {
            "oven" => Some(Self::oven()),
            "sous_vide" => Some(Self::sous_vide()),
            "pressure_cooker" => Some(Self::pressure_cooker()),
            "induction_hob" | "hob" => Some(Self::hob()),
            _ => None,
        }
    }

    pub fn sealed(mut self) -> Self {
        self.sealed = true;
        self
    }

    pub fn with_core_time_constant(mut self, seconds: f64) -> Self {
        self.core_time_constant_s = seconds.max(f64::MIN_POSITIVE);
        self
    }

    pub fn with_temperatures(mut self, cavity_c: f64, core_c: f64) -> Self {
        self.state.cavity_c = cavity_c;
        self.state.core_c = core_c;
        self.state.pressure_bar = self.pressure_at(cavity_c);
        self
    }

    pub fn state(&self) -> &ThermalState {
        &self.state
    }

    pub fn apply(&mut self, command: &DeviceCommand) {
        self.state.running = true;
        if let Some(target) = TARGET_PARAMS.iter().find_map(|p| command.number(p)) {
            self.state.target_c = Some(target);
        }
        self.state.power_pct = POWER_PARAMS
            .iter()
            .find_map(|p| command.number(p))
            .unwrap_or(100.0)
            .clamp(0.0, 100.0);
    }

    pub fn stop(&mut self) {
        self.state.running = false;
        self.state.power_pct = 0.0;
    }

    pub fn advance(&mut self, dt_s: f64) {
        let mut remaining = dt_s.max(0.0);
        while remaining > 0.0 {
            let dt = remaining.min(MAX_STEP_S);
            self.integrate(dt);
            remaining -= dt;
        }
    }

    fn integrate(&mut self, dt_s: f64) {
        let s = &mut self.state;
        let thermostat_open = s.target_c.map_or(true, |target| s.cavity_c < target);
        let heater_w = if s.running && thermostat_open {
            self.max_power_w * s.power_pct / 100.0
        } else {
            0.0
        };
        let loss_w = self.loss_w_per_k * (s.cavity_c - self.ambient_c);
        s.cavity_c += (heater_w - loss_w) * dt_s / self.heat_capacity_j_per_k;

        let approach = 1.0 - (-dt_s / self.core_time_constant_s).exp();
        s.core_c += (s.cavity_c - s.core_c) * approach;
        self.state.pressure_bar = self.pressure_at(self.state.cavity_c);
    }

    fn pressure_at(&self, cavity_c: f64) -> f64 {
        if self.sealed {
            ATMOSPHERIC_BAR + (cavity_c - BOILING_C).max(0.0) * BAR_PER_K_ABOVE_BOILING
        } else {
            ATMOSPHERIC_BAR
        }
    }

    pub fn channel(&self, name: &str) -> Option<f64> {
        match name {
            CAVITY_CHANNEL => Some(self.state.cavity_c),
            CORE_CHANNEL => Some(self.state.core_c),
            PRESSURE_CHANNEL => Some(self.state.pressure_bar),
            POWER_CHANNEL => Some(self.state.power_pct),
            _ => None,
        }
    }

    pub fn telemetry(&self) -> BTreeMap<String, f64> {
        let mut telemetry = BTreeMap::new();
        for name in [CAVITY_CHANNEL, CORE_CHANNEL, POWER_CHANNEL] {
            if let Some(v) = self.channel(name) {
                telemetry.insert(name.to_string(), v);
            }
        }
        if self.sealed {
            telemetry.insert(PRESSURE_CHANNEL.to_string(), self.state.pressure_bar);
        }
        telemetry
    }
}

//! Adaptive Controller.
//!
//! PID correction against one fused signal, with predictive dampening: when
//! the current rate of change would carry the signal past its setpoint within
//! the look-ahead horizon, the correction is scaled down before the overshoot
//! shows up in the readings.
//!
//! A controller belongs to exactly one step run and is dropped with it.

use crate::config::ControlConfig;
use crate::recipe::Step;

/// Param naming the controlled signal.
pub const SETPOINT_SIGNAL_PARAM: &str = "setpoint_signal";
pub const SETPOINT_PARAM: &str = "setpoint";
/// Param naming the device param the correction is added to.
pub const CONTROL_PARAM: &str = "control_param";
pub const DEFAULT_CONTROL_PARAM: &str = "power_pct";

#[derive(Debug, Clone, PartialEq)]
pub struct ControlLoop {
    pub signal: String,
    pub setpoint: f64,
    pub output_param: String,
}

impl ControlLoop {
    /// A step opts into closed-loop control by naming a setpoint.
    pub fn from_step(step: &Step) -> Option<Self> {
        let signal = step.text_param(SETPOINT_SIGNAL_PARAM)?;
        let setpoint = step.number_param(SETPOINT_PARAM)?;
        let output_param = step
            .text_param(CONTROL_PARAM)
            .unwrap_or(DEFAULT_CONTROL_PARAM);
        Some(Self {
            signal: signal.to_string(),
            setpoint,
            output_param: output_param.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlOutput {
    pub delta: f64,
    pub error: f64,
    pub dampened: bool,
}

#[derive(Debug, Clone)]
pub struct PidController {
    control: ControlLoop,
    kp: f64,
    ki: f64,
    kd: f64,
    config: ControlConfig,
    integral: f64,
    prev_error: Option<f64>,
    prev_sample: Option<(u64, f64)>,
}

impl PidController {
    /// Gains come from config unless the step overrides `kp`/`ki`/`kd`.
    pub fn new(control: ControlLoop, config: &ControlConfig, step: &Step) -> Self {
        Self {
            control,
            kp: step.number_param("kp").unwrap_or(config.kp),
            ki: step.number_param("ki").unwrap_or(config.ki),
            kd: step.number_param("kd").unwrap_or(config.kd),
            config: config.clone(),
            integral: 0.0,
            prev_error: None,
            prev_sample: None,
        }
    }

    pub fn control(&self) -> &ControlLoop {
        &self.control
    }

    pub fn update(&mut self, now_ms: u64, measured: f64) -> ControlOutput {
        let setpoint = self.control.setpoint;
        let error = setpoint - measured;

        let dt_s = self
            .prev_sample
            .map(|(t, _)| now_ms.saturating_sub(t) as f64 / 1000.0)
            .unwrap_or(0.0);

        let mut derivative = 0.0;
        if dt_s > 0.0 {
            let limit = self.config.integral_limit;
            self.integral = (self.integral + error * dt_s).clamp(-limit, limit);
            if let Some(prev) = self.prev_error {
                derivative = (error - prev) / dt_s;
            }
        }

        let mut delta = self.kp * error + self.ki * self.integral + self.kd * derivative;

        let mut dampened = false;
        if let Some(rate) = self.rate(now_ms, measured) {
            let projected = measured + rate * self.config.lookahead_s;
            let overshoot = if error >= 0.0 {
                projected - setpoint
            } else {
                setpoint - projected
            };
            if overshoot > self.config.overshoot_margin {
                delta *= self.config.dampening_factor;
                dampened = true;
            }
        }

        let limit = self.config.output_limit;
        delta = delta.clamp(-limit, limit);

        self.prev_error = Some(error);
        self.prev_sample = Some((now_ms, measured));

        ControlOutput {
            delta,
            error,
            dampened,
        }
    }

    /// Units per second from the last two samples.
    fn rate(&self, now_ms: u64, measured: f64) -> Option<f64> {
        let (t, v) = self.prev_sample?;
        let dt_s = now_ms.checked_sub(t)? as f64 / 1000.0;
        (dt_s > 0.0).then(|| (measured - v) / dt_s)
    }
}

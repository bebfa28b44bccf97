//! Boundary to device and sensor drivers.
//!
//! Devices of every kind (oven, mixer, sous-vide circulator, pressure cooker)
//! share one capability-set interface; what differs between them is data in
//! their [`DeviceProfile`](crate::recipe::DeviceProfile), not code.

use crate::error::EngineError;
use crate::recipe::ParamValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const STREAM_BUFFER: usize = 16;

/// Monotonic session clock in milliseconds.
///
/// Backed by tokio's clock so paused-time tests drive it deterministically.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn instant_at(&self, ms: u64) -> Instant {
        self.origin + Duration::from_millis(ms)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Scalar(f64),
    Rgb([f64; 3]),
}

impl SignalValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            SignalValue::Scalar(v) => Some(*v),
            SignalValue::Rgb(_) => None,
        }
    }

    pub fn channels(&self) -> &[f64] {
        match self {
            SignalValue::Scalar(v) => core::slice::from_ref(v),
            SignalValue::Rgb(rgb) => rgb,
        }
    }

    pub fn same_shape(&self, other: &SignalValue) -> bool {
        self.channels().len() == other.channels().len()
    }
}

impl From<f64> for SignalValue {
    fn from(value: f64) -> Self {
        SignalValue::Scalar(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub value: SignalValue,
    pub unit: String,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl SensorReading {
    pub fn new(sensor_id: &str, value: impl Into<SignalValue>, timestamp_ms: u64) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            value: value.into(),
            unit: String::new(),
            timestamp_ms,
            confidence: None,
        }
    }
}

/// Concrete command for one device, produced by the translator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub sequence: u64,
    pub step_id: String,
    pub device_id: String,
    pub device_type: String,
    pub action: String,
    pub params: BTreeMap<String, ParamValue>,
}

impl DeviceCommand {
    pub fn number(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(ParamValue::as_f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub device_id: String,
    pub sequence: u64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeviceStatus {
    pub online: bool,
    #[serde(default)]
    pub telemetry: BTreeMap<String, f64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Ack means accepted, not finished.
    async fn send(&self, device_id: &str, command: &DeviceCommand) -> Result<CommandAck, EngineError>;

    async fn status(&self, device_id: &str) -> Result<DeviceStatus, EngineError>;

    async fn stop(&self, device_id: &str) -> Result<CommandAck, EngineError>;
}

#[async_trait]
pub trait SensorDriver: Send + Sync {
    async fn read(&self, sensor_id: &str) -> Result<SensorReading, EngineError>;
}

/// Lazy, infinite reading sequence. Dropping it cancels the poller.
#[derive(Debug)]
pub struct SensorStream {
    rx: mpsc::Receiver<SensorReading>,
    task: JoinHandle<()>,
}

impl SensorStream {
    pub async fn next(&mut self) -> Option<SensorReading> {
        self.rx.recv().await
    }

    pub fn cancel(self) {}
}

impl Drop for SensorStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Polls `sensor_id` at `rate_hz`, skipping failed reads.
pub fn stream(driver: Arc<dyn SensorDriver>, sensor_id: &str, rate_hz: f64) -> SensorStream {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let sensor_id = sensor_id.to_string();
    let period = Duration::from_secs_f64(1.0 / rate_hz.max(f64::MIN_POSITIVE));

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match driver.read(&sensor_id).await {
                Ok(reading) => {
                    if tx.send(reading).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(sensor = %sensor_id, error = %e, "stream read failed"),
            }
        }
    });

    SensorStream { rx, task }
}

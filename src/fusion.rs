//! Sensor Fusion Unit.
//!
//! Reduces the raw readings of every sensor bound to a logical signal to one
//! confidence-weighted [`FusedSignal`] per tick. Sensors are consulted in
//! tiers: primaries, then backups, then virtual estimators derived from
//! other fused signals. A signal whose combined weight is zero is absent,
//! which is distinct from a measured zero.

use crate::config::FusionConfig;
use crate::driver::{SensorReading, SignalValue};
use crate::recipe::{SensorPriority, SensorRole, SensorSource, SensorSpec, VirtualModel};
use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::collections::BTreeMap;

/// Readings kept per sensor for outlier statistics.
pub const HISTORY_LEN: usize = 10;
/// Previous readings needed before outlier detection engages.
pub const MIN_OUTLIER_SAMPLES: usize = 3;
const_assert!(MIN_OUTLIER_SAMPLES < HISTORY_LEN);

/// Seconds since the step entered monitoring.
pub const ELAPSED_SIGNAL: &str = "elapsed_s";
/// 1.0 once an operator confirmed the step.
pub const CONFIRMED_SIGNAL: &str = "human_confirmed";

pub fn is_builtin(signal: &str) -> bool {
    signal == ELAPSED_SIGNAL || signal == CONFIRMED_SIGNAL
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSignal {
    pub signal: String,
    pub value: SignalValue,
    /// Always within [0, 1].
    pub confidence: f64,
    pub sources: Vec<String>,
    pub timestamp_ms: u64,
    pub estimated: bool,
}

impl FusedSignal {
    pub fn exact(signal: &str, value: f64, source: &str, timestamp_ms: u64) -> Self {
        Self {
            signal: signal.to_string(),
            value: SignalValue::Scalar(value),
            confidence: 1.0,
            sources: vec![source.to_string()],
            timestamp_ms,
            estimated: false,
        }
    }
}

/// Best estimate of every signal at one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FusedSnapshot {
    pub timestamp_ms: u64,
    pub signals: BTreeMap<String, FusedSignal>,
}

impl FusedSnapshot {
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            signals: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, signal: FusedSignal) {
        self.signals.insert(signal.signal.clone(), signal);
    }

    /// Present signals only; zero confidence counts as absent.
    pub fn get(&self, signal: &str) -> Option<&FusedSignal> {
        self.signals.get(signal).filter(|s| s.confidence > 0.0)
    }

    pub fn scalar(&self, signal: &str) -> Option<f64> {
        self.get(signal).and_then(|s| s.value.as_scalar())
    }
}

struct SensorTrack {
    spec: SensorSpec,
    history: HistoryBuffer<SensorReading, HISTORY_LEN>,
}

pub struct SensorFusion {
    config: FusionConfig,
    tracks: BTreeMap<String, SensorTrack>,
    /// signal -> physical sensor ids, in declaration order
    signals: BTreeMap<String, Vec<String>>,
    virtuals: Vec<SensorSpec>,
}

impl core::fmt::Debug for SensorFusion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SensorFusion")
            .field("sensors", &self.tracks.keys().collect::<Vec<_>>())
            .field("virtuals", &self.virtuals.len())
            .finish()
    }
}

impl SensorFusion {
    pub fn new(config: FusionConfig, specs: impl IntoIterator<Item = SensorSpec>) -> Self {
        let mut tracks = BTreeMap::new();
        let mut signals: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut virtuals = Vec::new();

        for spec in specs {
            if spec.is_virtual() {
                virtuals.push(spec);
                continue;
            }
            signals
                .entry(spec.signal.clone())
                .or_default()
                .push(spec.id.clone());
            tracks.insert(
                spec.id.clone(),
                SensorTrack {
                    spec,
                    history: HistoryBuffer::new(),
                },
            );
        }

        Self {
            config,
            tracks,
            signals,
            virtuals,
        }
    }

    /// Physical sensors read through the sensor driver each tick.
    pub fn driver_sensors(&self) -> impl Iterator<Item = &str> {
        self.tracks
            .values()
            .filter(|t| t.spec.source == SensorSource::Driver)
            .map(|t| t.spec.id.as_str())
    }

    /// `(sensor id, device id, telemetry key)` for telemetry-backed sensors.
    pub fn telemetry_sensors(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.tracks.values().filter_map(|t| match &t.spec.source {
            SensorSource::DeviceTelemetry { device, key } => {
                Some((t.spec.id.as_str(), device.as_str(), key.as_str()))
            }
            SensorSource::Driver => None,
        })
    }

    pub fn can_provide(&self, signal: &str) -> bool {
        self.signals.contains_key(signal) || self.virtuals.iter().any(|v| v.signal == signal)
    }

    fn specs_for<'a>(&'a self, signal: &'a str) -> impl Iterator<Item = &'a SensorSpec> + 'a {
        self.tracks
            .values()
            .map(|t| &t.spec)
            .chain(self.virtuals.iter())
            .filter(move |s| s.signal == signal)
    }

    pub fn priority(&self, signal: &str) -> Option<SensorPriority> {
        self.specs_for(signal).map(|s| s.priority).max()
    }

    pub fn kind(&self, signal: &str) -> Option<&str> {
        self.tracks
            .values()
            .map(|t| &t.spec)
            .chain(self.virtuals.iter())
            .find(|s| s.signal == signal)
            .map(|s| s.kind.as_str())
    }

    /// Records a reading. Duplicates and out-of-order readings are ignored,
    /// so replaying the same reading set leaves the history unchanged.
    pub fn ingest(&mut self, reading: SensorReading) -> bool {
        let Some(track) = self.tracks.get_mut(&reading.sensor_id) else {
            return false;
        };
        if let Some(latest) = track.history.recent() {
            if reading.timestamp_ms <= latest.timestamp_ms {
                return false;
            }
        }
        track.history.write(reading);
        true
    }

    /// Fuses physical sensors only.
    pub fn fuse_signal(&self, signal: &str, now_ms: u64) -> Option<FusedSignal> {
        let ids = self.signals.get(signal)?;
        [SensorRole::Primary, SensorRole::Backup]
            .into_iter()
            .find_map(|role| self.fuse_tier(signal, ids, role, now_ms))
    }

    /// Fuses every bound signal, then fills absent ones from estimators.
    pub fn fuse_all(&self, now_ms: u64, elapsed_s: f64) -> FusedSnapshot {
        let mut snapshot = FusedSnapshot::new(now_ms);
        for signal in self.signals.keys() {
            if let Some(fused) = self.fuse_signal(signal, now_ms) {
                snapshot.insert(fused);
            }
        }
        for spec in &self.virtuals {
            if snapshot.get(&spec.signal).is_some() {
                continue;
            }
            if let Some(estimate) = self.estimate(spec, &snapshot, elapsed_s, now_ms) {
                snapshot.insert(estimate);
            }
        }
        snapshot
    }

    fn fuse_tier(
        &self,
        signal: &str,
        ids: &[String],
        role: SensorRole,
        now_ms: u64,
    ) -> Option<FusedSignal> {
        let mut total_weight = 0.0;
        let mut weighted_confidence = 0.0;
        let mut sums: Vec<f64> = Vec::new();
        let mut shape: Option<&SignalValue> = None;
        let mut sources = Vec::new();
        let mut timestamp_ms = 0;

        for track in ids.iter().filter_map(|id| self.tracks.get(id)) {
            if track.spec.role != role {
                continue;
            }
            let Some(reading) = track.history.recent() else {
                continue;
            };
            let weight = self.weight(track, reading, now_ms);
            if weight <= 0.0 {
                continue;
            }
            match shape {
                Some(s) if !s.same_shape(&reading.value) => continue,
                Some(_) => {}
                None => {
                    shape = Some(&reading.value);
                    sums = vec![0.0; reading.value.channels().len()];
                }
            }
            for (sum, x) in sums.iter_mut().zip(reading.value.channels()) {
                *sum += weight * x;
            }
            total_weight += weight;
            weighted_confidence += weight * weight;
            sources.push(track.spec.id.clone());
            timestamp_ms = timestamp_ms.max(reading.timestamp_ms);
        }

        if total_weight <= 0.0 {
            return None;
        }

        let mean: Vec<f64> = sums.iter().map(|s| s / total_weight).collect();
        let value = match mean.as_slice() {
            [r, g, b] => SignalValue::Rgb([*r, *g, *b]),
            [v] => SignalValue::Scalar(*v),
            _ => return None,
        };

        Some(FusedSignal {
            signal: signal.to_string(),
            value,
            confidence: (weighted_confidence / total_weight).clamp(0.0, 1.0),
            sources,
            timestamp_ms,
            estimated: false,
        })
    }

    /// Instantaneous weight of the latest reading of one sensor.
    fn weight(&self, track: &SensorTrack, reading: &SensorReading, now_ms: u64) -> f64 {
        let stale_after = track
            .spec
            .spec
            .stale_after_ms
            .unwrap_or(self.config.staleness_timeout_ms);
        if now_ms.saturating_sub(reading.timestamp_ms) > stale_after {
            return 0.0;
        }
        if !reading
            .value
            .channels()
            .iter()
            .all(|v| v.is_finite() && track.spec.spec.contains(*v))
        {
            return 0.0;
        }

        let base = track.spec.weight.clamp(0.0, 1.0);
        let reported = reading.confidence.unwrap_or(1.0).clamp(0.0, 1.0);
        base * reported * self.outlier_scale(track)
    }

    fn outlier_scale(&self, track: &SensorTrack) -> f64 {
        let Some(latest) = track.history.recent() else {
            return 1.0;
        };
        let previous: Vec<&SensorReading> = track
            .history
            .oldest_ordered()
            .take(track.history.len().saturating_sub(1))
            .filter(|r| r.value.same_shape(&latest.value))
            .collect();
        if previous.len() < MIN_OUTLIER_SAMPLES {
            return 1.0;
        }

        let floor = track
            .spec
            .spec
            .precision
            .unwrap_or(0.0)
            .max(self.config.min_stddev);
        let n = previous.len() as f64;
        let mut z_max: f64 = 0.0;
        for (channel, x) in latest.value.channels().iter().enumerate() {
            let values = previous.iter().map(|r| r.value.channels()[channel]);
            let mean = values.clone().sum::<f64>() / n;
            let variance = values.map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
            let stddev = variance.sqrt().max(floor);
            if stddev > 0.0 {
                z_max = z_max.max((x - mean).abs() / stddev);
            }
        }

        let sigma = self.config.outlier_sigma;
        if z_max <= sigma {
            1.0
        } else {
            (1.0 - z_max / sigma).max(0.0)
        }
    }

    fn estimate(
        &self,
        spec: &SensorSpec,
        snapshot: &FusedSnapshot,
        elapsed_s: f64,
        now_ms: u64,
    ) -> Option<FusedSignal> {
        let model = spec.model.as_ref()?;
        let input = snapshot.get(model.inputs())?;
        let x = input.value.as_scalar()?;

        let value = match model {
            VirtualModel::ThermalLag {
                initial,
                time_constant_s,
                ..
            } => {
                if *time_constant_s <= 0.0 {
                    x
                } else {
                    x - (x - initial) * (-elapsed_s.max(0.0) / time_constant_s).exp()
                }
            }
            VirtualModel::Linear { scale, offset, .. } => scale * x + offset,
        };

        let confidence = (input.confidence * spec.weight.clamp(0.0, 1.0))
            .min(self.config.virtual_confidence_cap)
            .clamp(0.0, 1.0);
        if confidence <= 0.0 {
            return None;
        }

        Some(FusedSignal {
            signal: spec.signal.clone(),
            value: SignalValue::Scalar(value),
            confidence,
            sources: vec![spec.id.clone()],
            timestamp_ms: now_ms,
            estimated: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::MeasurementSpec;

    fn reading(id: &str, value: f64, ts: u64) -> SensorReading {
        SensorReading::new(id, value, ts)
    }

    fn oven_fusion() -> SensorFusion {
        SensorFusion::new(
            FusionConfig::default(),
            vec![
                SensorSpec::new("probe-a", "temperature", "internal_temp_c"),
                SensorSpec::new("probe-b", "temperature", "internal_temp_c").backup(),
            ],
        )
    }

    #[test]
    fn test_stale_primary_falls_back_to_backup() {
        let mut fusion = oven_fusion();
        fusion.ingest(reading("probe-a", 80.0, 1_000));
        fusion.ingest(reading("probe-b", 72.0, 6_900));

        // primary is 6 s old against a 5 s timeout
        let fused = fusion.fuse_signal("internal_temp_c", 7_000).unwrap();
        assert_eq!(fused.value, SignalValue::Scalar(72.0));
        assert_eq!(fused.sources, vec!["probe-b".to_string()]);
        assert!((fused.confidence - 1.0).abs() < 1e-12);
        assert!(!fused.estimated);
    }

    #[test]
    fn test_fresh_primary_wins_over_backup() {
        let mut fusion = oven_fusion();
        fusion.ingest(reading("probe-a", 80.0, 6_500));
        fusion.ingest(reading("probe-b", 72.0, 6_900));
        let fused = fusion.fuse_signal("internal_temp_c", 7_000).unwrap();
        assert_eq!(fused.value, SignalValue::Scalar(80.0));
    }

    #[test]
    fn test_absent_when_no_weight() {
        let mut fusion = oven_fusion();
        assert!(fusion.fuse_signal("internal_temp_c", 0).is_none());

        fusion.ingest(reading("probe-a", 0.0, 100));
        // measured zero is present
        let fused = fusion.fuse_signal("internal_temp_c", 200).unwrap();
        assert_eq!(fused.value, SignalValue::Scalar(0.0));

        // everything stale
        assert!(fusion.fuse_signal("internal_temp_c", 60_000).is_none());
        assert!(fusion.fuse_all(60_000, 0.0).get("internal_temp_c").is_none());
    }

    #[test]
    fn test_weighted_average_and_confidence() {
        let mut a = SensorSpec::new("a", "temperature", "water_temp_c");
        a.weight = 1.0;
        let mut b = SensorSpec::new("b", "temperature", "water_temp_c");
        b.weight = 0.5;
        let mut fusion = SensorFusion::new(FusionConfig::default(), vec![a, b]);
        fusion.ingest(reading("a", 60.0, 1_000));
        fusion.ingest(reading("b", 63.0, 1_000));

        let fused = fusion.fuse_signal("water_temp_c", 1_000).unwrap();
        // (1.0 * 60 + 0.5 * 63) / 1.5
        assert!((fused.value.as_scalar().unwrap() - 61.0).abs() < 1e-9);
        // (1.0^2 + 0.5^2) / 1.5
        assert!((fused.confidence - 1.25 / 1.5).abs() < 1e-9);
        assert_eq!(fused.sources.len(), 2);
    }

    #[test]
    fn test_outlier_is_suppressed() {
        let mut a = SensorSpec::new("a", "temperature", "oil_temp_c");
        a.spec = MeasurementSpec {
            precision: Some(0.5),
            ..MeasurementSpec::default()
        };
        let b = SensorSpec::new("b", "temperature", "oil_temp_c");
        let mut fusion = SensorFusion::new(FusionConfig::default(), vec![a, b]);

        for (i, v) in [170.0, 171.0, 170.0, 171.0, 170.0].iter().enumerate() {
            let ts = (i as u64 + 1) * 1_000;
            fusion.ingest(reading("a", *v, ts));
            fusion.ingest(reading("b", *v, ts));
        }
        // spike on sensor a: far beyond 6 sigma of its history
        fusion.ingest(reading("a", 400.0, 6_000));
        fusion.ingest(reading("b", 171.0, 6_000));

        let fused = fusion.fuse_signal("oil_temp_c", 6_000).unwrap();
        assert_eq!(fused.value, SignalValue::Scalar(171.0));
        assert_eq!(fused.sources, vec!["b".to_string()]);
    }

    #[test]
    fn test_deviation_beyond_sigma_carries_no_weight() {
        let spec = SensorSpec::new("a", "temperature", "oil_temp_c");
        let mut fusion = SensorFusion::new(FusionConfig::default(), vec![spec]);
        for (i, v) in [170.0, 172.0, 170.0, 172.0].iter().enumerate() {
            fusion.ingest(reading("a", *v, (i as u64 + 1) * 1_000));
        }
        // mean 171, stddev 1 -> z = 4.5, scale = max(0, 1 - 4.5 / 3) = 0
        fusion.ingest(reading("a", 175.5, 5_000));
        assert!(fusion.fuse_signal("oil_temp_c", 5_000).is_none());

        // the next reading sits well inside the widened band
        fusion.ingest(reading("a", 173.5, 6_000));
        let fused = fusion.fuse_signal("oil_temp_c", 6_000).unwrap();
        assert!((fused.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_reading_outside_declared_range_ignored() {
        let mut spec = SensorSpec::new("a", "pressure", "pressure_bar");
        spec.spec = MeasurementSpec {
            min: Some(0.0),
            max: Some(4.0),
            ..MeasurementSpec::default()
        };
        let mut fusion = SensorFusion::new(FusionConfig::default(), vec![spec]);
        fusion.ingest(reading("a", 9.9, 1_000));
        assert!(fusion.fuse_signal("pressure_bar", 1_000).is_none());
    }

    #[test]
    fn test_fusion_is_idempotent() {
        let mut fusion = oven_fusion();
        let readings = vec![
            reading("probe-a", 61.0, 1_000),
            reading("probe-a", 62.0, 2_000),
            reading("probe-b", 60.0, 2_000),
        ];
        for r in readings.clone() {
            fusion.ingest(r);
        }
        let first = fusion.fuse_all(2_500, 2.5);
        for r in readings {
            assert!(!fusion.ingest(r));
        }
        let second = fusion.fuse_all(2_500, 2.5);
        assert_eq!(first, second);
    }

    #[test]
    fn test_virtual_estimate_is_capped_and_flagged() {
        let specs = vec![
            SensorSpec::new("probe", "temperature", "internal_temp_c"),
            SensorSpec::new("cavity", "temperature", "oven_temp_c"),
            SensorSpec::new("est", "temperature", "internal_temp_c").virtual_model(
                VirtualModel::ThermalLag {
                    ambient: "oven_temp_c".into(),
                    initial: 20.0,
                    time_constant_s: 600.0,
                },
            ),
        ];
        let mut fusion = SensorFusion::new(FusionConfig::default(), specs);
        assert!(fusion.can_provide("internal_temp_c"));

        fusion.ingest(reading("cavity", 180.0, 1_000));
        let snapshot = fusion.fuse_all(1_000, 600.0);
        let estimate = snapshot.get("internal_temp_c").unwrap();
        assert!(estimate.estimated);
        assert!((estimate.confidence - 0.7).abs() < 1e-12);
        // 180 - 160 * e^-1
        let expected = 180.0 - 160.0 * (-1.0f64).exp();
        assert!((estimate.value.as_scalar().unwrap() - expected).abs() < 1e-9);

        // a live probe takes precedence over the estimate
        fusion.ingest(reading("probe", 75.0, 1_000));
        let snapshot = fusion.fuse_all(1_000, 600.0);
        assert!(!snapshot.get("internal_temp_c").unwrap().estimated);
    }

    #[test]
    fn test_rgb_channels_fuse_independently() {
        let specs = vec![
            SensorSpec::new("cam-1", "color", "crust_color"),
            SensorSpec::new("cam-2", "color", "crust_color"),
        ];
        let mut fusion = SensorFusion::new(FusionConfig::default(), specs);
        fusion.ingest(SensorReading::new("cam-1", SignalValue::Rgb([180.0, 120.0, 40.0]), 500));
        fusion.ingest(SensorReading::new("cam-2", SignalValue::Rgb([170.0, 110.0, 50.0]), 500));
        let fused = fusion.fuse_signal("crust_color", 500).unwrap();
        assert_eq!(fused.value, SignalValue::Rgb([175.0, 115.0, 45.0]));
    }

    #[test]
    fn test_priority_is_highest_declared() {
        let specs = vec![
            SensorSpec::new("a", "temperature", "internal_temp_c").optional(),
            SensorSpec::new("b", "temperature", "internal_temp_c").required(),
        ];
        let fusion = SensorFusion::new(FusionConfig::default(), specs);
        assert_eq!(fusion.priority("internal_temp_c"), Some(SensorPriority::Required));
        assert_eq!(fusion.kind("internal_temp_c"), Some("temperature"));
        assert_eq!(fusion.priority("missing"), None);
    }
}

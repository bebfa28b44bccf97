//! Recipe document model consumed by the engine.
//!
//! The document arrives already schema-validated; these types only carry the
//! fields the engine acts on. Unknown fields are ignored so the full RCIP
//! document can be deserialized directly.

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hazards the recipe format defines. Anything else is accepted but logged.
pub const STANDARD_HAZARDS: [&str; 6] = [
    "hot-surface",
    "sharp-tool",
    "electrical",
    "chemical",
    "pressure",
    "allergen-cross-contact",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipe {
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub device_profiles: Vec<DeviceProfile>,
    #[serde(default)]
    pub sensors: Vec<SensorSpec>,
}

impl Recipe {
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Recipe(e.to_string()))
    }

    pub fn profile(&self, id: &str) -> Option<&DeviceProfile> {
        self.device_profiles.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(f64),
    Flag(bool),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

/// One recipe instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(alias = "step_id")]
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub done_when: BTreeMap<String, Target>,
    #[serde(default)]
    pub tolerance: BTreeMap<String, f64>,
    /// Secondary thresholds; leaving them only raises a warning.
    #[serde(default)]
    pub guidance: BTreeMap<String, Target>,
    #[serde(default)]
    pub hazards: Vec<String>,
    #[serde(default, alias = "device")]
    pub device_profile_ref: Option<String>,
    /// Dependency references (`ing-…`, `s-…:result`, utensils).
    #[serde(default)]
    pub target: Vec<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub independent: bool,
}

impl Step {
    pub fn new(id: &str, action: &str) -> Self {
        Self {
            id: id.to_string(),
            action: action.to_string(),
            params: BTreeMap::new(),
            done_when: BTreeMap::new(),
            tolerance: BTreeMap::new(),
            guidance: BTreeMap::new(),
            hazards: Vec::new(),
            device_profile_ref: None,
            target: Vec::new(),
            phase: None,
            independent: false,
        }
    }

    pub fn with_device(mut self, device_id: &str) -> Self {
        self.device_profile_ref = Some(device_id.to_string());
        self
    }

    pub fn with_param(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn complete_when(mut self, signal: &str, target: Target) -> Self {
        self.done_when.insert(signal.to_string(), target);
        self
    }

    pub fn with_tolerance(mut self, signal: &str, tolerance: f64) -> Self {
        self.tolerance.insert(signal.to_string(), tolerance);
        self
    }

    pub fn number_param(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(ParamValue::as_f64)
    }

    pub fn text_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(ParamValue::as_str)
    }

    pub fn dependencies(&self) -> impl Iterator<Item = Dependency> + '_ {
        self.target.iter().filter_map(|t| Dependency::parse(t))
    }

    pub fn non_standard_hazards(&self) -> impl Iterator<Item = &str> {
        self.hazards
            .iter()
            .map(String::as_str)
            .filter(|h| !STANDARD_HAZARDS.contains(h))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    Ingredient(String),
    StepResult(String),
}

impl Dependency {
    pub fn parse(reference: &str) -> Option<Self> {
        if let Some(step) = reference.strip_suffix(":result") {
            return Some(Dependency::StepResult(step.to_string()));
        }
        if reference.starts_with("ing-") {
            return Some(Dependency::Ingredient(reference.to_string()));
        }
        None
    }
}

/// Completion target for one signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    /// Reading must be at least this value.
    AtLeast(f64),
    /// Inclusive `[min, max]`.
    Interval([f64; 2]),
    Color(ColorTarget),
    Bounds(Bounds),
}

impl Target {
    pub fn range(min: f64, max: f64) -> Self {
        Target::Interval([min, max])
    }

    /// Lowest reading this target can accept, before tolerance.
    pub fn lower_bound(&self) -> Option<f64> {
        match self {
            Target::AtLeast(t) => Some(*t),
            Target::Interval([min, _]) => Some(*min),
            Target::Bounds(b) => b.min,
            Target::Color(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bounds {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColorTarget {
    #[serde(default)]
    pub rgb: Option<RgbBox>,
    #[serde(default)]
    pub hsv: Option<HsvBox>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RgbBox {
    pub r: [f64; 2],
    pub g: [f64; 2],
    pub b: [f64; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HsvBox {
    /// Degrees; `lo > hi` wraps through 360.
    pub h: [f64; 2],
    pub s: [f64; 2],
    pub v: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, Capability>,
    #[serde(default)]
    pub api_endpoint: Option<String>,
}

impl DeviceProfile {
    pub fn new(id: &str, device_type: &str) -> Self {
        Self {
            id: id.to_string(),
            device_type: device_type.to_string(),
            params: BTreeMap::new(),
            capabilities: BTreeMap::new(),
            api_endpoint: None,
        }
    }

    pub fn with_range(mut self, name: &str, min: f64, max: f64) -> Self {
        self.capabilities
            .insert(name.to_string(), Capability::Range { min, max });
        self
    }

    pub fn with_limit(mut self, name: &str, limit: f64) -> Self {
        self.capabilities
            .insert(name.to_string(), Capability::Limit(limit));
        self
    }

    pub fn with_default(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    /// Range capability for a param named `<stem>_<unit>`.
    ///
    /// Accepts `<stem>_<unit>`, `<stem>_range_<unit>` and `<stem>_<unit>_range`.
    pub fn range_for(&self, param: &str) -> Option<(f64, f64)> {
        let mut candidates = vec![param.to_string(), format!("{param}_range")];
        if let Some((stem, unit)) = param.rsplit_once('_') {
            candidates.push(format!("{stem}_range_{unit}"));
        }
        candidates
            .iter()
            .find_map(|name| match self.capabilities.get(name) {
                Some(Capability::Range { min, max }) => Some((*min, *max)),
                _ => None,
            })
    }

    pub fn limit(&self, name: &str) -> Option<f64> {
        match self.capabilities.get(name)? {
            Capability::Limit(v) => Some(*v),
            Capability::Range { max, .. } => Some(*max),
            _ => None,
        }
    }

    pub fn supported_actions(&self) -> Option<&[String]> {
        match self.capabilities.get("actions")? {
            Capability::Names(names) => Some(names),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Capability {
    Range { min: f64, max: f64 },
    Limit(f64),
    Flag(bool),
    Names(Vec<String>),
    Other(serde_json::Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SensorPriority {
    Optional,
    #[default]
    Recommended,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    #[default]
    Primary,
    Backup,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorSource {
    #[default]
    Driver,
    DeviceTelemetry { device: String, key: String },
}

/// Declared measurement envelope of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MeasurementSpec {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub precision: Option<f64>,
    #[serde(default)]
    pub stale_after_ms: Option<u64>,
}

impl MeasurementSpec {
    pub fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum VirtualModel {
    /// Newtonian approach from `initial` toward the `ambient` signal.
    ThermalLag {
        ambient: String,
        initial: f64,
        time_constant_s: f64,
    },
    Linear {
        source: String,
        scale: f64,
        offset: f64,
    },
}

impl VirtualModel {
    pub fn inputs(&self) -> &str {
        match self {
            VirtualModel::ThermalLag { ambient, .. } => ambient,
            VirtualModel::Linear { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(alias = "measures")]
    pub signal: String,
    /// Device or step this sensor observes; `None` means session-wide.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub spec: MeasurementSpec,
    #[serde(default)]
    pub priority: SensorPriority,
    #[serde(default)]
    pub role: SensorRole,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub source: SensorSource,
    #[serde(default)]
    pub model: Option<VirtualModel>,
}

fn default_weight() -> f64 {
    1.0
}

impl SensorSpec {
    pub fn new(id: &str, kind: &str, signal: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            signal: signal.to_string(),
            target: None,
            spec: MeasurementSpec::default(),
            priority: SensorPriority::default(),
            role: SensorRole::Primary,
            weight: default_weight(),
            source: SensorSource::Driver,
            model: None,
        }
    }

    pub fn backup(mut self) -> Self {
        self.role = SensorRole::Backup;
        self
    }

    pub fn required(mut self) -> Self {
        self.priority = SensorPriority::Required;
        self
    }

    pub fn optional(mut self) -> Self {
        self.priority = SensorPriority::Optional;
        self
    }

    pub fn observing(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn virtual_model(mut self, model: VirtualModel) -> Self {
        self.role = SensorRole::Virtual;
        self.model = Some(model);
        self
    }

    pub fn is_virtual(&self) -> bool {
        self.role == SensorRole::Virtual
    }
}

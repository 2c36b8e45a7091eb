//! Core data types shared by the curve engine, safety supervisor,
//! configuration store, and hardware adapter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use fantuner_error::{FanTunerError, Result};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Classifies a piece of hardware for threshold and telemetry purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HardwareKind {
    Cpu,
    GpuNvidia,
    GpuAmd,
    GpuIntel,
    Motherboard,
    Memory,
    Storage,
    Network,
    Cooler,
    EmbeddedController,
    Psu,
    Battery,
    Unknown,
}

impl HardwareKind {
    /// True for any of the GPU vendor variants.
    pub fn is_gpu(self) -> bool {
        matches!(self, HardwareKind::GpuNvidia | HardwareKind::GpuAmd | HardwareKind::GpuIntel)
    }
}

/// Classifies the physical quantity a sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorKind {
    Temperature,
    Fan,
    Load,
    Voltage,
    Clock,
    Power,
    Control,
    Other,
}

/// Stable identity for a sensor: (hardware id, sensor name, kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorId {
    pub hardware_id: String,
    pub sensor_name: String,
    pub kind: SensorKind,
}

impl SensorId {
    pub fn new(hardware_id: impl Into<String>, sensor_name: impl Into<String>, kind: SensorKind) -> Self {
        Self { hardware_id: hardware_id.into(), sensor_name: sensor_name.into(), kind }
    }

    /// Derived stable string key, used as a map key and on the wire.
    pub fn key(&self) -> String {
        format!("{}:{}:{:?}", self.hardware_id, self.sensor_name, self.kind)
    }
}

/// A single, immutable sensor observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: SensorId,
    pub display_name: String,
    pub hardware_name: String,
    pub hardware_kind: HardwareKind,
    pub value: f32,
    pub min_seen: Option<f32>,
    pub max_seen: Option<f32>,
    pub unit: String,
    pub timestamp_ms: u64,
    pub is_stale: bool,
}

impl SensorReading {
    pub fn new(
        id: SensorId,
        display_name: impl Into<String>,
        hardware_name: impl Into<String>,
        hardware_kind: HardwareKind,
        value: f32,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            hardware_name: hardware_name.into(),
            hardware_kind,
            value,
            min_seen: None,
            max_seen: None,
            unit: unit.into(),
            timestamp_ms: now_ms(),
            is_stale: false,
        }
    }
}

/// Stable identity for a fan: (hardware id, fan name, index).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FanId {
    pub hardware_id: String,
    pub fan_name: String,
    pub index: u32,
}

impl FanId {
    pub fn new(hardware_id: impl Into<String>, fan_name: impl Into<String>, index: u32) -> Self {
        Self { hardware_id: hardware_id.into(), fan_name: fan_name.into(), index }
    }

    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.hardware_id, self.fan_name, self.index)
    }
}

/// Whether software may write a duty cycle to a fan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FanControlCapability {
    FullControl,
    MonitorOnly,
    Unknown,
    Unavailable,
}

/// Current state of a single controllable or monitor-only fan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanDevice {
    pub id: FanId,
    pub display_name: String,
    pub hardware_name: String,
    pub capability: FanControlCapability,
    pub current_rpm: u32,
    pub current_duty_percent: Option<f32>,
    pub min_duty_percent: Option<f32>,
    pub max_duty_percent: Option<f32>,
    pub last_update_ms: u64,
}

/// A single (temperature, fan percent) point on a curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub temperature: f32,
    pub fan_percent: f32,
}

impl CurvePoint {
    pub fn new(temperature: f32, fan_percent: f32) -> Self {
        Self { temperature, fan_percent }
    }
}

/// Interpolation method used by `fantuner_core::curve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InterpolationKind {
    Cosine,
    Linear,
}

impl Default for InterpolationKind {
    fn default() -> Self {
        InterpolationKind::Cosine
    }
}

fn default_dead_band() -> f32 {
    0.5
}

/// A temperature-to-speed curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanCurve {
    pub id: String,
    pub name: String,
    /// Stable key (`SensorId::key()`) of the sensor this curve reads its
    /// temperature from, if other than the first CPU-kind reading.
    pub source_sensor_key: Option<String>,
    pub points: Vec<CurvePoint>,
    pub min_percent: f32,
    pub max_percent: f32,
    pub hysteresis: f32,
    pub response_time_seconds: f32,
    #[serde(default)]
    pub interpolation: InterpolationKind,
    #[serde(default = "default_dead_band")]
    pub dead_band_percent: f32,
}

impl FanCurve {
    pub fn new(id: impl Into<String>, name: impl Into<String>, points: Vec<CurvePoint>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source_sensor_key: None,
            points,
            min_percent: 0.0,
            max_percent: 100.0,
            hysteresis: 0.0,
            response_time_seconds: 0.0,
            interpolation: InterpolationKind::Cosine,
            dead_band_percent: default_dead_band(),
        }
    }
}

/// How a fan assignment resolves its target duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FanControlMode {
    Auto,
    Manual,
    Curve,
}

/// Maps one fan to a control mode within a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanAssignment {
    pub fan_key: String,
    pub mode: FanControlMode,
    pub manual_percent: Option<f32>,
    pub curve_id: Option<String>,
    pub last_applied_percent: Option<f32>,
}

impl FanAssignment {
    pub fn auto(fan_key: impl Into<String>) -> Self {
        Self {
            fan_key: fan_key.into(),
            mode: FanControlMode::Auto,
            manual_percent: None,
            curve_id: None,
            last_applied_percent: None,
        }
    }
}

/// A named mapping from fans to control assignments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanProfile {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub assignments: HashMap<String, FanAssignment>,
    pub created_at_ms: u64,
    pub modified_at_ms: u64,
}

impl FanProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, is_default: bool) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            name: name.into(),
            is_default,
            assignments: HashMap::new(),
            created_at_ms: now,
            modified_at_ms: now,
        }
    }
}

/// The full durable application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfiguration {
    pub poll_interval_ms: u64,
    pub emergency_cpu_celsius: f32,
    pub emergency_gpu_celsius: f32,
    pub emergency_hysteresis_celsius: f32,
    pub default_min_fan_percent: f32,
    pub max_consecutive_failures: u32,
    pub active_profile_id: String,
    pub curves: HashMap<String, FanCurve>,
    pub profiles: HashMap<String, FanProfile>,
    pub telemetry_enabled: bool,
}

impl AppConfiguration {
    /// A minimal, internally consistent configuration: one default profile,
    /// one curve, sane thresholds. Used as the fallback when no
    /// configuration file exists yet or the on-disk one is corrupt.
    pub fn defaults() -> Self {
        let default_curve = FanCurve::new(
            "default",
            "Default",
            vec![CurvePoint::new(30.0, 20.0), CurvePoint::new(80.0, 100.0)],
        );
        let default_profile = FanProfile::new("default", "Default", true);

        let mut curves = HashMap::new();
        curves.insert(default_curve.id.clone(), default_curve);
        let mut profiles = HashMap::new();
        profiles.insert(default_profile.id.clone(), default_profile);

        Self {
            poll_interval_ms: 1000,
            emergency_cpu_celsius: 95.0,
            emergency_gpu_celsius: 95.0,
            emergency_hysteresis_celsius: 5.0,
            default_min_fan_percent: 20.0,
            max_consecutive_failures: 5,
            active_profile_id: "default".to_string(),
            curves,
            profiles,
            telemetry_enabled: true,
        }
    }

    /// Enforces every invariant named in the data model. Returns the first
    /// violation found as a human-readable message.
    pub fn validate(&self) -> Result<()> {
        if !(100..=10_000).contains(&self.poll_interval_ms) {
            return Err(FanTunerError::config_invalid(format!(
                "poll_interval_ms {} out of range [100, 10000]",
                self.poll_interval_ms
            )));
        }
        if !(50.0..=120.0).contains(&self.emergency_cpu_celsius) {
            return Err(FanTunerError::config_invalid("emergency_cpu_celsius out of range [50, 120]"));
        }
        if !(50.0..=120.0).contains(&self.emergency_gpu_celsius) {
            return Err(FanTunerError::config_invalid("emergency_gpu_celsius out of range [50, 120]"));
        }
        if !(0.0..=50.0).contains(&self.default_min_fan_percent) {
            return Err(FanTunerError::config_invalid("default_min_fan_percent out of range [0, 50]"));
        }
        if self.curves.is_empty() {
            return Err(FanTunerError::config_invalid("configuration must have at least one curve"));
        }
        if self.profiles.is_empty() {
            return Err(FanTunerError::config_invalid("configuration must have at least one profile"));
        }
        if !self.profiles.contains_key(&self.active_profile_id) {
            return Err(FanTunerError::config_invalid(format!(
                "active_profile_id {} does not resolve to a profile",
                self.active_profile_id
            )));
        }
        let default_count = self.profiles.values().filter(|p| p.is_default).count();
        if default_count != 1 {
            return Err(FanTunerError::config_invalid(format!(
                "exactly one profile must be default, found {}",
                default_count
            )));
        }
        for profile in self.profiles.values() {
            for assignment in profile.assignments.values() {
                if let Some(curve_id) = &assignment.curve_id {
                    if !self.curves.contains_key(curve_id) {
                        return Err(FanTunerError::config_invalid(format!(
                            "profile {} references unknown curve {}",
                            profile.id, curve_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn default_profile_id(&self) -> Option<String> {
        self.profiles.values().find(|p| p.is_default).map(|p| p.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AppConfiguration::defaults();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_poll_interval_out_of_range() {
        let mut config = AppConfiguration::defaults();
        config.poll_interval_ms = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_multiple_default_profiles() {
        let mut config = AppConfiguration::defaults();
        let mut second = FanProfile::new("second", "Second", true);
        second.is_default = true;
        config.profiles.insert(second.id.clone(), second);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_dangling_curve_reference() {
        let mut config = AppConfiguration::defaults();
        let profile = config.profiles.get_mut("default").unwrap();
        profile.assignments.insert(
            "fan0".to_string(),
            FanAssignment {
                fan_key: "fan0".to_string(),
                mode: FanControlMode::Curve,
                manual_percent: None,
                curve_id: Some("missing".to_string()),
                last_applied_percent: None,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn sensor_id_key_is_stable() {
        let a = SensorId::new("hwmon0", "temp1", SensorKind::Temperature);
        let b = SensorId::new("hwmon0", "temp1", SensorKind::Temperature);
        assert_eq!(a.key(), b.key());
    }
}

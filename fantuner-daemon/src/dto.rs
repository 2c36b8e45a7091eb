//! Conversions between `fantuner-core`'s internal model and the wire DTOs
//! defined in `fantuner-protocol`. Kept separate from both crates: the
//! protocol crate stays core-agnostic, and the core crate stays
//! wire-agnostic.

use std::collections::HashMap;

use fantuner_core::{
    AppConfiguration, CurvePoint, FanAssignment, FanControlCapability, FanControlMode, FanCurve, FanDevice,
    FanProfile, InterpolationKind, SensorReading,
};
use fantuner_protocol::{
    ConfigDto, CurvePointDto, FanAssignmentDto, FanCurveDto, FanDeviceDto, FanProfileDto, SensorReadingDto,
};

pub fn sensor_to_dto(reading: &SensorReading) -> SensorReadingDto {
    SensorReadingDto {
        key: reading.id.key(),
        display_name: reading.display_name.clone(),
        hardware_name: reading.hardware_name.clone(),
        hardware_kind: hardware_kind_str(reading.hardware_kind).to_string(),
        value: reading.value,
        unit: reading.unit.clone(),
        timestamp_ms: reading.timestamp_ms,
        is_stale: reading.is_stale,
    }
}

pub fn fan_to_dto(fan: &FanDevice) -> FanDeviceDto {
    FanDeviceDto {
        key: fan.id.key(),
        display_name: fan.display_name.clone(),
        hardware_name: fan.hardware_name.clone(),
        capability: capability_str(fan.capability).to_string(),
        current_rpm: fan.current_rpm,
        current_duty_percent: fan.current_duty_percent,
    }
}

fn hardware_kind_str(kind: fantuner_core::HardwareKind) -> &'static str {
    use fantuner_core::HardwareKind::*;
    match kind {
        Cpu => "cpu",
        GpuNvidia => "gpuNvidia",
        GpuAmd => "gpuAmd",
        GpuIntel => "gpuIntel",
        Motherboard => "motherboard",
        Memory => "memory",
        Storage => "storage",
        Network => "network",
        Cooler => "cooler",
        EmbeddedController => "embeddedController",
        Psu => "psu",
        Battery => "battery",
        Unknown => "unknown",
    }
}

fn capability_str(cap: FanControlCapability) -> &'static str {
    match cap {
        FanControlCapability::FullControl => "fullControl",
        FanControlCapability::MonitorOnly => "monitorOnly",
        FanControlCapability::Unknown => "unknown",
        FanControlCapability::Unavailable => "unavailable",
    }
}

fn mode_str(mode: FanControlMode) -> &'static str {
    match mode {
        FanControlMode::Auto => "auto",
        FanControlMode::Manual => "manual",
        FanControlMode::Curve => "curve",
    }
}

fn mode_from_str(s: &str) -> Result<FanControlMode, String> {
    match s {
        "auto" => Ok(FanControlMode::Auto),
        "manual" => Ok(FanControlMode::Manual),
        "curve" => Ok(FanControlMode::Curve),
        other => Err(format!("unknown fan control mode: {other}")),
    }
}

fn interpolation_str(kind: InterpolationKind) -> &'static str {
    match kind {
        InterpolationKind::Cosine => "cosine",
        InterpolationKind::Linear => "linear",
    }
}

fn interpolation_from_str(s: &str) -> InterpolationKind {
    match s {
        "linear" => InterpolationKind::Linear,
        _ => InterpolationKind::Cosine,
    }
}

fn curve_to_dto(curve: &FanCurve) -> FanCurveDto {
    FanCurveDto {
        id: curve.id.clone(),
        name: curve.name.clone(),
        source_sensor_key: curve.source_sensor_key.clone(),
        points: curve.points.iter().map(|p| CurvePointDto { temperature: p.temperature, fan_percent: p.fan_percent }).collect(),
        min_percent: curve.min_percent,
        max_percent: curve.max_percent,
        hysteresis: curve.hysteresis,
        response_time_seconds: curve.response_time_seconds,
        interpolation: interpolation_str(curve.interpolation).to_string(),
        dead_band_percent: curve.dead_band_percent,
    }
}

fn curve_from_dto(id: &str, dto: &FanCurveDto) -> FanCurve {
    FanCurve {
        id: id.to_string(),
        name: dto.name.clone(),
        source_sensor_key: dto.source_sensor_key.clone(),
        points: dto.points.iter().map(|p| CurvePoint::new(p.temperature, p.fan_percent)).collect(),
        min_percent: dto.min_percent,
        max_percent: dto.max_percent,
        hysteresis: dto.hysteresis,
        response_time_seconds: dto.response_time_seconds,
        interpolation: interpolation_from_str(&dto.interpolation),
        dead_band_percent: dto.dead_band_percent,
    }
}

fn assignment_to_dto(assignment: &FanAssignment) -> FanAssignmentDto {
    FanAssignmentDto {
        fan_key: assignment.fan_key.clone(),
        mode: mode_str(assignment.mode).to_string(),
        manual_percent: assignment.manual_percent,
        curve_id: assignment.curve_id.clone(),
    }
}

fn assignment_from_dto(dto: &FanAssignmentDto) -> Result<FanAssignment, String> {
    Ok(FanAssignment {
        fan_key: dto.fan_key.clone(),
        mode: mode_from_str(&dto.mode)?,
        manual_percent: dto.manual_percent,
        curve_id: dto.curve_id.clone(),
        last_applied_percent: None,
    })
}

fn profile_to_dto(profile: &FanProfile) -> FanProfileDto {
    FanProfileDto {
        id: profile.id.clone(),
        name: profile.name.clone(),
        is_default: profile.is_default,
        assignments: profile.assignments.iter().map(|(k, v)| (k.clone(), assignment_to_dto(v))).collect(),
    }
}

fn profile_from_dto(id: &str, dto: &FanProfileDto) -> Result<FanProfile, String> {
    let mut assignments = HashMap::new();
    for (key, a) in &dto.assignments {
        assignments.insert(key.clone(), assignment_from_dto(a)?);
    }
    let now = fantuner_core::FanProfile::new(id, &dto.name, dto.is_default);
    Ok(FanProfile { assignments, ..now })
}

pub fn config_to_dto(config: &AppConfiguration) -> ConfigDto {
    ConfigDto {
        poll_interval_ms: config.poll_interval_ms,
        emergency_cpu_celsius: config.emergency_cpu_celsius,
        emergency_gpu_celsius: config.emergency_gpu_celsius,
        emergency_hysteresis_celsius: config.emergency_hysteresis_celsius,
        default_min_fan_percent: config.default_min_fan_percent,
        max_consecutive_failures: config.max_consecutive_failures,
        active_profile_id: config.active_profile_id.clone(),
        curves: config.curves.iter().map(|(k, v)| (k.clone(), curve_to_dto(v))).collect(),
        profiles: config.profiles.iter().map(|(k, v)| (k.clone(), profile_to_dto(v))).collect(),
        telemetry_enabled: config.telemetry_enabled,
    }
}

pub fn config_from_dto(dto: &ConfigDto) -> Result<AppConfiguration, String> {
    let mut curves = HashMap::new();
    for (id, c) in &dto.curves {
        curves.insert(id.clone(), curve_from_dto(id, c));
    }
    let mut profiles = HashMap::new();
    for (id, p) in &dto.profiles {
        profiles.insert(id.clone(), profile_from_dto(id, p)?);
    }
    Ok(AppConfiguration {
        poll_interval_ms: dto.poll_interval_ms,
        emergency_cpu_celsius: dto.emergency_cpu_celsius,
        emergency_gpu_celsius: dto.emergency_gpu_celsius,
        emergency_hysteresis_celsius: dto.emergency_hysteresis_celsius,
        default_min_fan_percent: dto.default_min_fan_percent,
        max_consecutive_failures: dto.max_consecutive_failures,
        active_profile_id: dto.active_profile_id.clone(),
        curves,
        profiles,
        telemetry_enabled: dto.telemetry_enabled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_dto() {
        let config = AppConfiguration::defaults();
        let dto = config_to_dto(&config);
        let back = config_from_dto(&dto).unwrap();
        assert_eq!(back.poll_interval_ms, config.poll_interval_ms);
        assert_eq!(back.curves.len(), config.curves.len());
        assert_eq!(back.profiles.len(), config.profiles.len());
        assert!(back.validate().is_ok());
    }
}

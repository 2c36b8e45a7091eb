//! Safety Supervisor: the Normal/Emergency state machine that overrides the
//! control loop whenever thermal limits or sensor reliability are
//! threatened.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::model::{AppConfiguration, FanDevice, HardwareKind, SensorKind, SensorReading};

/// Emergency/Normal state, snapshot for IPC consumption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyStatus {
    pub active: bool,
    pub reason: Option<String>,
    pub triggered_at_ms: Option<u64>,
    pub triggering_temperature: Option<f32>,
}

/// A point-in-time view of supervisor state, returned by `status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub emergency: EmergencyStatus,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub active_warnings: Vec<String>,
}

struct Thresholds {
    emergency_cpu: f32,
    emergency_gpu: f32,
    emergency_hysteresis: f32,
    default_min_fan_percent: f32,
    max_consecutive_failures: u32,
}

impl Thresholds {
    fn from_config(config: &AppConfiguration) -> Self {
        Self {
            emergency_cpu: config.emergency_cpu_celsius,
            emergency_gpu: config.emergency_gpu_celsius,
            emergency_hysteresis: config.emergency_hysteresis_celsius,
            default_min_fan_percent: config.default_min_fan_percent,
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }
}

struct State {
    thresholds: Thresholds,
    emergency: EmergencyStatus,
    consecutive_failures: u32,
    active_warnings: Vec<String>,
}

/// Owns the Normal/Emergency state machine behind a single mutex. Per the
/// lock-order rule, this lock is never held while calling into the
/// Configuration Store or the IPC Endpoint.
pub struct SafetySupervisor {
    state: Mutex<State>,
}

impl SafetySupervisor {
    pub fn new(config: &AppConfiguration) -> Self {
        Self {
            state: Mutex::new(State {
                thresholds: Thresholds::from_config(config),
                emergency: EmergencyStatus::default(),
                consecutive_failures: 0,
                active_warnings: Vec::new(),
            }),
        }
    }

    /// Atomically replaces the thresholds this supervisor enforces, e.g.
    /// after a `SetConfig` IPC request.
    pub fn update_thresholds(&self, config: &AppConfiguration) {
        let mut state = self.state.lock();
        state.thresholds = Thresholds::from_config(config);
    }

    /// A sensor batch was read successfully: resets the failure counter and
    /// evaluates the emergency transitions against the readings.
    ///
    /// Returns `true` if this call caused entry into Emergency.
    pub fn record_readings(&self, readings: &[SensorReading], now_ms: u64) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;

        let max_cpu = max_temperature(readings, |k| k == HardwareKind::Cpu);
        let max_gpu = max_temperature(readings, HardwareKind::is_gpu);

        let mut entered_emergency = false;

        if !state.emergency.active {
            let cpu_trip = max_cpu.map(|t| t >= state.thresholds.emergency_cpu).unwrap_or(false);
            let gpu_trip = max_gpu.map(|t| t >= state.thresholds.emergency_gpu).unwrap_or(false);
            if cpu_trip || gpu_trip {
                let (reason, triggering) = if cpu_trip {
                    ("CPU temperature at or above emergency threshold".to_string(), max_cpu)
                } else {
                    ("GPU temperature at or above emergency threshold".to_string(), max_gpu)
                };
                state.emergency = EmergencyStatus {
                    active: true,
                    reason: Some(reason),
                    triggered_at_ms: Some(now_ms),
                    triggering_temperature: triggering,
                };
                entered_emergency = true;
            }
        } else {
            let cpu_clear = max_cpu
                .map(|t| t <= state.thresholds.emergency_cpu - state.thresholds.emergency_hysteresis)
                .unwrap_or(false);
            let gpu_clear = max_gpu
                .map(|t| t <= state.thresholds.emergency_gpu - state.thresholds.emergency_hysteresis)
                .unwrap_or(false);
            if cpu_clear && gpu_clear {
                state.emergency = EmergencyStatus::default();
            }
        }

        state.active_warnings = compute_warnings(readings, &state.thresholds, max_cpu, max_gpu);

        entered_emergency
    }

    /// A sensor refresh failed: increments the failure counter and may
    /// itself trigger Emergency if `max_consecutive_failures` is reached.
    ///
    /// Returns `true` if this call caused entry into Emergency.
    pub fn record_failure(&self, now_ms: u64) -> bool {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;

        if !state.emergency.active && state.consecutive_failures >= state.thresholds.max_consecutive_failures {
            state.emergency = EmergencyStatus {
                active: true,
                reason: Some(format!(
                    "{} consecutive sensor failures",
                    state.consecutive_failures
                )),
                triggered_at_ms: Some(now_ms),
                triggering_temperature: None,
            };
            return true;
        }
        false
    }

    pub fn is_emergency(&self) -> bool {
        self.state.lock().emergency.active
    }

    pub fn enforce_minimum(&self, percent: f32) -> f32 {
        let state = self.state.lock();
        percent.max(state.thresholds.default_min_fan_percent)
    }

    /// Validates a requested fan speed before it is written to hardware.
    pub fn validate_fan_speed(&self, percent: f32, fan: &FanDevice) -> (bool, Option<String>) {
        if !(0.0..=100.0).contains(&percent) {
            return (false, Some("out of range".to_string()));
        }
        if percent == 0.0 && fan.current_rpm > 0 {
            return (true, Some("setting fan to 0% may stop it".to_string()));
        }
        let min = self.state.lock().thresholds.default_min_fan_percent;
        if percent < min {
            return (false, Some("below minimum".to_string()));
        }
        (true, None)
    }

    pub fn status(&self) -> SafetyStatus {
        let state = self.state.lock();
        SafetyStatus {
            emergency: state.emergency.clone(),
            consecutive_failures: state.consecutive_failures,
            degraded: state.consecutive_failures > 0,
            active_warnings: state.active_warnings.clone(),
        }
    }
}

fn max_temperature(readings: &[SensorReading], matches: impl Fn(HardwareKind) -> bool) -> Option<f32> {
    readings
        .iter()
        .filter(|r| r.id.kind == SensorKind::Temperature && matches(r.hardware_kind))
        .map(|r| r.value)
        .fold(None, |acc, v| Some(acc.map_or(v, |a: f32| a.max(v))))
}

fn compute_warnings(
    readings: &[SensorReading],
    thresholds: &Thresholds,
    max_cpu: Option<f32>,
    max_gpu: Option<f32>,
) -> Vec<String> {
    let mut warnings = Vec::new();

    if let Some(cpu) = max_cpu {
        if cpu >= thresholds.emergency_cpu - 10.0 && cpu < thresholds.emergency_cpu {
            warnings.push("CPU temperature high".to_string());
        }
    }
    if let Some(gpu) = max_gpu {
        if gpu >= thresholds.emergency_gpu - 10.0 && gpu < thresholds.emergency_gpu {
            warnings.push("GPU temperature high".to_string());
        }
    }
    for reading in readings {
        if reading.is_stale {
            warnings.push(format!("{} is stale", reading.display_name));
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SensorId, SensorKind};

    fn reading(hardware_kind: HardwareKind, value: f32) -> SensorReading {
        SensorReading::new(
            SensorId::new("hw0", "temp", SensorKind::Temperature),
            "temp",
            "hw0",
            hardware_kind,
            value,
            "C",
        )
    }

    #[test]
    fn enters_and_exits_emergency_on_cpu_threshold() {
        let mut config = AppConfiguration::defaults();
        config.emergency_cpu_celsius = 90.0;
        config.emergency_gpu_celsius = 90.0;
        config.emergency_hysteresis_celsius = 5.0;
        let supervisor = SafetySupervisor::new(&config);

        assert!(supervisor.record_readings(&[reading(HardwareKind::Cpu, 95.0)], 1));
        assert!(supervisor.is_emergency());

        // Still in emergency: 87 > 90 - 5 = 85.
        supervisor.record_readings(&[reading(HardwareKind::Cpu, 87.0), reading(HardwareKind::GpuNvidia, 50.0)], 2);
        assert!(supervisor.is_emergency());

        // Clears once both are under threshold - hysteresis.
        supervisor.record_readings(&[reading(HardwareKind::Cpu, 80.0), reading(HardwareKind::GpuNvidia, 50.0)], 3);
        assert!(!supervisor.is_emergency());
    }

    #[test]
    fn five_consecutive_failures_trigger_emergency() {
        let config = AppConfiguration::defaults();
        let supervisor = SafetySupervisor::new(&config);

        for i in 0..4 {
            assert!(!supervisor.record_failure(i));
        }
        assert!(supervisor.record_failure(5));
        assert!(supervisor.is_emergency());
        assert!(supervisor.status().emergency.reason.unwrap().contains("consecutive"));
    }

    #[test]
    fn successful_read_resets_failure_counter() {
        let config = AppConfiguration::defaults();
        let supervisor = SafetySupervisor::new(&config);

        supervisor.record_failure(1);
        supervisor.record_failure(2);
        assert_eq!(supervisor.status().consecutive_failures, 2);

        supervisor.record_readings(&[reading(HardwareKind::Cpu, 40.0)], 3);
        assert_eq!(supervisor.status().consecutive_failures, 0);
    }

    #[test]
    fn enforce_minimum_clamps_up() {
        let mut config = AppConfiguration::defaults();
        config.default_min_fan_percent = 20.0;
        let supervisor = SafetySupervisor::new(&config);
        assert_eq!(supervisor.enforce_minimum(5.0), 20.0);
        assert_eq!(supervisor.enforce_minimum(50.0), 50.0);
    }

    #[test]
    fn validate_fan_speed_flags_out_of_range() {
        let config = AppConfiguration::defaults();
        let supervisor = SafetySupervisor::new(&config);
        let fan = test_fan(0);
        let (ok, warning) = supervisor.validate_fan_speed(150.0, &fan);
        assert!(!ok);
        assert!(warning.is_some());
    }

    #[test]
    fn validate_fan_speed_warns_on_zero_while_spinning() {
        let config = AppConfiguration::defaults();
        let supervisor = SafetySupervisor::new(&config);
        let mut fan = test_fan(0);
        fan.current_rpm = 1200;
        let (ok, warning) = supervisor.validate_fan_speed(0.0, &fan);
        assert!(ok);
        assert!(warning.unwrap().contains("stop"));
    }

    fn test_fan(rpm: u32) -> FanDevice {
        use crate::model::{FanControlCapability, FanId};
        FanDevice {
            id: FanId::new("hw0", "fan1", 0),
            display_name: "Fan 1".to_string(),
            hardware_name: "hw0".to_string(),
            capability: FanControlCapability::FullControl,
            current_rpm: rpm,
            current_duty_percent: None,
            min_duty_percent: None,
            max_duty_percent: None,
            last_update_ms: 0,
        }
    }
}

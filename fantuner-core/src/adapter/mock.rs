//! In-memory deterministic Hardware Adapter, used for `--mock` runs and in
//! every test that exercises the control loop without real sysfs access.

use std::collections::HashMap;

use parking_lot::RwLock;

use fantuner_error::Result;

use crate::model::{FanControlCapability, FanDevice, FanId, HardwareKind, SensorId, SensorKind, SensorReading};

struct MockFan {
    device: FanDevice,
    auto: bool,
}

struct Inner {
    sensors: HashMap<String, SensorReading>,
    fans: HashMap<String, MockFan>,
    warnings: Vec<String>,
}

/// Seeded with one CPU temperature sensor and one fully-controllable fan,
/// enough for the control loop and IPC endpoint to exercise their full
/// request surface without real hardware.
pub struct MockAdapter {
    inner: RwLock<Inner>,
}

impl MockAdapter {
    pub fn new() -> Self {
        let cpu_id = SensorId::new("mock0", "cpu_temp", SensorKind::Temperature);
        let cpu_reading = SensorReading::new(cpu_id.clone(), "CPU Package", "mock0", HardwareKind::Cpu, 45.0, "C");

        let fan_id = FanId::new("mock0", "fan1", 0);
        let fan = FanDevice {
            id: fan_id.clone(),
            display_name: "Mock Fan 1".to_string(),
            hardware_name: "mock0".to_string(),
            capability: FanControlCapability::FullControl,
            current_rpm: 900,
            current_duty_percent: Some(30.0),
            min_duty_percent: Some(0.0),
            max_duty_percent: Some(100.0),
            last_update_ms: 0,
        };

        let mut sensors = HashMap::new();
        sensors.insert(cpu_id.key(), cpu_reading);
        let mut fans = HashMap::new();
        fans.insert(fan_id.key(), MockFan { device: fan, auto: false });

        Self { inner: RwLock::new(Inner { sensors, fans, warnings: Vec::new() }) }
    }

    /// Test/`--mock`-mode hook: overwrite a sensor's value directly, used to
    /// drive the safety supervisor through emergency entry/exit scenarios.
    pub fn set_sensor_value(&self, key: &str, value: f32) {
        if let Some(reading) = self.inner.write().sensors.get_mut(key) {
            reading.value = value;
        }
    }

    pub fn set_fan_rpm(&self, key: &str, rpm: u32) {
        if let Some(fan) = self.inner.write().fans.get_mut(key) {
            fan.device.current_rpm = rpm;
        }
    }

    /// Test hook: force a fan's capability classification, used to drive
    /// the control loop through a MonitorOnly/Unavailable fan without
    /// faking an I/O failure.
    pub fn set_fan_capability(&self, key: &str, capability: FanControlCapability) {
        if let Some(fan) = self.inner.write().fans.get_mut(key) {
            fan.device.capability = capability;
        }
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl super::HardwareAdapter for MockAdapter {
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn warnings(&self) -> Vec<String> {
        self.inner.read().warnings.clone()
    }

    fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn get_sensors(&self) -> Vec<SensorReading> {
        self.inner.read().sensors.values().cloned().collect()
    }

    fn get_fans(&self) -> Vec<FanDevice> {
        self.inner.read().fans.values().map(|f| f.device.clone()).collect()
    }

    fn set_speed(&self, fan: &FanId, percent: f32) -> bool {
        let percent = percent.clamp(0.0, 100.0);
        let mut guard = self.inner.write();
        match guard.fans.get_mut(&fan.key()) {
            Some(entry) if entry.device.capability == FanControlCapability::FullControl => {
                entry.auto = false;
                entry.device.current_duty_percent = Some(percent);
                entry.device.current_rpm = (percent / 100.0 * 2000.0) as u32;
                true
            }
            _ => false,
        }
    }

    fn set_auto(&self, fan: &FanId) -> bool {
        match self.inner.write().fans.get_mut(&fan.key()) {
            Some(entry) => {
                entry.auto = true;
                true
            }
            None => false,
        }
    }

    fn set_all_auto(&self) {
        for entry in self.inner.write().fans.values_mut() {
            entry.auto = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::HardwareAdapter;

    #[test]
    fn seeds_one_sensor_and_one_fan() {
        let adapter = MockAdapter::new();
        assert_eq!(adapter.get_sensors().len(), 1);
        assert_eq!(adapter.get_fans().len(), 1);
    }

    #[test]
    fn set_speed_updates_duty_and_rpm() {
        let adapter = MockAdapter::new();
        let fan = adapter.get_fans().remove(0).id;
        assert!(adapter.set_speed(&fan, 75.0));
        let updated = adapter.get_fans().remove(0);
        assert_eq!(updated.current_duty_percent, Some(75.0));
        assert!(updated.current_rpm > 0);
    }

    #[test]
    fn set_speed_clamps_out_of_range() {
        let adapter = MockAdapter::new();
        let fan = adapter.get_fans().remove(0).id;
        adapter.set_speed(&fan, 150.0);
        assert_eq!(adapter.get_fans().remove(0).current_duty_percent, Some(100.0));
    }

    #[test]
    fn set_speed_on_unknown_fan_returns_false() {
        let adapter = MockAdapter::new();
        let unknown = FanId::new("nope", "nope", 9);
        assert!(!adapter.set_speed(&unknown, 50.0));
    }

    #[test]
    fn set_auto_then_set_all_auto() {
        let adapter = MockAdapter::new();
        let fan = adapter.get_fans().remove(0).id;
        assert!(adapter.set_auto(&fan));
        adapter.set_all_auto();
    }

    #[test]
    fn sensor_value_override_is_visible_immediately() {
        let adapter = MockAdapter::new();
        let key = adapter.get_sensors().remove(0).id.key();
        adapter.set_sensor_value(&key, 95.0);
        assert_eq!(adapter.get_sensors().remove(0).value, 95.0);
    }
}

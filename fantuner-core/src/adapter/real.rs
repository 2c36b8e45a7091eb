//! Real Hardware Adapter backed by Linux hwmon sysfs.
//!
//! Enumerates `/sys/class/hwmon/hwmon*` chips once at `initialize`, then
//! re-reads the same set of files on every `refresh`. PWM writes go
//! through `pwmN_enable` (manual mode) and `pwmN` (0-255 duty), the
//! standard Linux hwmon fan-control interface.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, warn};

use fantuner_error::{FanTunerError, Result};

use crate::model::{
    FanControlCapability, FanDevice, FanId, HardwareKind, SensorId, SensorKind, SensorReading,
};

const HWMON_BASE: &str = "/sys/class/hwmon";
const PWM_MAX: f32 = 255.0;

struct PwmEntry {
    fan: FanDevice,
    pwm_path: PathBuf,
    enable_path: PathBuf,
}

struct TempEntry {
    reading: SensorReading,
    path: PathBuf,
}

struct Inner {
    temps: Vec<TempEntry>,
    pwms: HashMap<String, PwmEntry>,
    warnings: Vec<String>,
}

pub struct RealAdapter {
    inner: RwLock<Inner>,
}

impl RealAdapter {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner { temps: Vec::new(), pwms: HashMap::new(), warnings: Vec::new() }) }
    }

    fn chip_dirs() -> Result<Vec<PathBuf>> {
        let base = Path::new(HWMON_BASE);
        if !base.is_dir() {
            return Err(FanTunerError::adapter_init(format!("{HWMON_BASE} does not exist")));
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(base).map_err(|e| FanTunerError::adapter_init(e.to_string()))? {
            let entry = entry.map_err(|e| FanTunerError::adapter_init(e.to_string()))?;
            dirs.push(entry.path());
        }
        Ok(dirs)
    }

    fn chip_name(chip_dir: &Path) -> String {
        fs::read_to_string(chip_dir.join("name"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| chip_dir.file_name().and_then(|n| n.to_str()).unwrap_or("unknown").to_string())
    }

    fn hardware_kind_for(chip_name: &str) -> HardwareKind {
        let lower = chip_name.to_lowercase();
        if lower.contains("cpu") || lower.contains("k10temp") || lower.contains("coretemp") {
            HardwareKind::Cpu
        } else if lower.contains("amdgpu") {
            HardwareKind::GpuAmd
        } else if lower.contains("nvidia") {
            HardwareKind::GpuNvidia
        } else if lower.contains("nct") || lower.contains("it87") || lower.contains("w83627") {
            HardwareKind::EmbeddedController
        } else {
            HardwareKind::Unknown
        }
    }

    fn scan(&self) -> Result<()> {
        let dirs = Self::chip_dirs()?;
        let mut temps = Vec::new();
        let mut pwms = HashMap::new();

        for chip_dir in dirs {
            let chip_name = Self::chip_name(&chip_dir);
            let hardware_kind = Self::hardware_kind_for(&chip_name);
            let Ok(entries) = fs::read_dir(&chip_dir) else { continue };
            let file_names: Vec<String> =
                entries.filter_map(|e| e.ok()).map(|e| e.file_name().to_string_lossy().to_string()).collect();

            for file_name in &file_names {
                if let Some(index) = file_name.strip_prefix("temp").and_then(|s| s.strip_suffix("_input")) {
                    let path = chip_dir.join(file_name);
                    if let Ok(value) = read_millidegrees(&path) {
                        let sensor_name = format!("temp{index}");
                        let id = SensorId::new(chip_name.clone(), sensor_name.clone(), SensorKind::Temperature);
                        temps.push(TempEntry {
                            reading: SensorReading::new(id, sensor_name, chip_name.clone(), hardware_kind, value, "C"),
                            path,
                        });
                    }
                }

                if let Some(index) = file_name.strip_prefix("pwm").filter(|s| s.chars().all(|c| c.is_ascii_digit())) {
                    let pwm_path = chip_dir.join(file_name);
                    let enable_path = chip_dir.join(format!("pwm{index}_enable"));
                    let current_rpm = file_names
                        .iter()
                        .find(|f| f.as_str() == format!("fan{index}_input"))
                        .map(|f| chip_dir.join(f))
                        .and_then(|p| read_u32(&p).ok())
                        .unwrap_or(0);
                    let current_value = read_u8(&pwm_path).ok();

                    let fan_id = FanId::new(chip_name.clone(), format!("pwm{index}"), index.parse().unwrap_or(0));
                    let fan = FanDevice {
                        id: fan_id.clone(),
                        display_name: format!("{chip_name} fan{index}"),
                        hardware_name: chip_name.clone(),
                        capability: FanControlCapability::FullControl,
                        current_rpm,
                        current_duty_percent: current_value.map(|v| v as f32 / PWM_MAX * 100.0),
                        min_duty_percent: Some(0.0),
                        max_duty_percent: Some(100.0),
                        last_update_ms: 0,
                    };
                    pwms.insert(fan_id.key(), PwmEntry { fan, pwm_path, enable_path });
                }
            }
        }

        let mut guard = self.inner.write();
        // Preserve capability downgrades across rescans: a fan already
        // known as MonitorOnly stays that way rather than reverting to
        // FullControl just because the file still exists.
        for (key, entry) in pwms.iter_mut() {
            if let Some(existing) = guard.pwms.get(key) {
                if existing.fan.capability != FanControlCapability::FullControl {
                    entry.fan.capability = existing.fan.capability;
                }
            }
        }
        guard.temps = temps;
        guard.pwms = pwms;
        Ok(())
    }

    fn downgrade(&self, fan: &FanId, reason: &str) {
        let mut guard = self.inner.write();
        if let Some(entry) = guard.pwms.get_mut(&fan.key()) {
            entry.fan.capability = FanControlCapability::MonitorOnly;
        }
        guard.warnings.push(format!("{} downgraded to MonitorOnly: {reason}", fan.key()));
    }
}

impl Default for RealAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl super::HardwareAdapter for RealAdapter {
    fn initialize(&self) -> Result<()> {
        self.scan().map_err(|e| FanTunerError::adapter_init(e.to_string()))
    }

    fn warnings(&self) -> Vec<String> {
        self.inner.read().warnings.clone()
    }

    fn refresh(&self) -> Result<()> {
        self.scan().map_err(|e| FanTunerError::adapter_io(e.to_string()))
    }

    fn get_sensors(&self) -> Vec<SensorReading> {
        self.inner.read().temps.iter().map(|t| t.reading.clone()).collect()
    }

    fn get_fans(&self) -> Vec<FanDevice> {
        self.inner.read().pwms.values().map(|p| p.fan.clone()).collect()
    }

    fn set_speed(&self, fan: &FanId, percent: f32) -> bool {
        let percent = percent.clamp(0.0, 100.0);
        let (pwm_path, enable_path, capability) = {
            let guard = self.inner.read();
            match guard.pwms.get(&fan.key()) {
                Some(entry) => (entry.pwm_path.clone(), entry.enable_path.clone(), entry.fan.capability),
                None => return false,
            }
        };
        if capability != FanControlCapability::FullControl {
            return false;
        }

        if enable_path.exists() {
            if let Err(e) = fs::write(&enable_path, "1") {
                warn!("failed to enable manual pwm for {}: {}", fan.key(), e);
                self.downgrade(fan, &e.to_string());
                return false;
            }
        }

        let raw = ((percent / 100.0) * PWM_MAX).round() as u8;
        match fs::write(&pwm_path, raw.to_string()) {
            Ok(()) => {
                if let Some(entry) = self.inner.write().pwms.get_mut(&fan.key()) {
                    entry.fan.current_duty_percent = Some(percent);
                }
                true
            }
            Err(e) => {
                warn!("failed to write pwm for {}: {}", fan.key(), e);
                self.downgrade(fan, &e.to_string());
                false
            }
        }
    }

    fn set_auto(&self, fan: &FanId) -> bool {
        let enable_path = match self.inner.read().pwms.get(&fan.key()) {
            Some(entry) => entry.enable_path.clone(),
            None => return false,
        };
        if !enable_path.exists() {
            return true;
        }
        match fs::write(&enable_path, "2") {
            Ok(()) => true,
            Err(e) => {
                debug!("failed to restore auto pwm for {}: {}", fan.key(), e);
                false
            }
        }
    }

    fn set_all_auto(&self) {
        let keys: Vec<FanId> = self.inner.read().pwms.values().map(|p| p.fan.id.clone()).collect();
        for fan in keys {
            self.set_auto(&fan);
        }
    }
}

fn read_millidegrees(path: &Path) -> std::io::Result<f32> {
    let content = fs::read_to_string(path)?;
    let millidegrees: i32 = content.trim().parse().map_err(|_| std::io::ErrorKind::InvalidData)?;
    Ok(millidegrees as f32 / 1000.0)
}

fn read_u32(path: &Path) -> std::io::Result<u32> {
    fs::read_to_string(path)?.trim().parse().map_err(|_| std::io::ErrorKind::InvalidData.into())
}

fn read_u8(path: &Path) -> std::io::Result<u8> {
    fs::read_to_string(path)?.trim().parse().map_err(|_| std::io::ErrorKind::InvalidData.into())
}

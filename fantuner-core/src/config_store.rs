//! Configuration Store: durable holder of curves, profiles, and
//! thresholds, with atomic (write-temp-then-rename) updates, timestamped
//! backup retention, and corrupt-file quarantine on load.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use fantuner_error::{FanTunerError, Result};

use crate::model::{AppConfiguration, FanControlMode};

/// Maximum number of timestamped backups retained under `backups/`.
const MAX_BACKUPS: usize = 10;

fn now_ts() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Durable JSON-backed configuration store.
///
/// Holds the current snapshot behind a single mutex; mutation methods load,
/// mutate, validate, and atomically persist in one critical section, then
/// return the new snapshot.
pub struct ConfigStore {
    path: PathBuf,
    current: Mutex<AppConfiguration>,
}

impl ConfigStore {
    fn backups_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"))
    }

    /// Loads the configuration at `path`, quarantining and substituting
    /// defaults if the file is corrupt, or using defaults if it doesn't
    /// exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let config = if !path.exists() {
            debug!("no configuration file at {:?}, using defaults", path);
            AppConfiguration::defaults()
        } else {
            let bytes = fs::read(&path).map_err(|e| FanTunerError::FileRead { path: path.clone(), source: e })?;
            match serde_json::from_slice::<AppConfiguration>(&bytes).ok().filter(|c| c.validate().is_ok()) {
                Some(config) => config,
                None => {
                    warn!("configuration at {:?} is corrupt or invalid, quarantining", path);
                    Self::quarantine(&path, &bytes)?;
                    AppConfiguration::defaults()
                }
            }
        };

        let store = Self { path, current: Mutex::new(config) };
        Ok(store)
    }

    fn quarantine(path: &Path, bytes: &[u8]) -> Result<()> {
        let backups_dir = path.parent().map(|p| p.join("backups")).unwrap_or_else(|| PathBuf::from("backups"));
        fs::create_dir_all(&backups_dir)?;
        let quarantine_path = backups_dir.join(format!("config_corrupt_{}.json", now_ts()));
        fs::write(&quarantine_path, bytes).map_err(|e| FanTunerError::FileWrite { path: quarantine_path, source: e })?;
        Ok(())
    }

    /// A point-in-time copy of the current configuration.
    pub fn current(&self) -> AppConfiguration {
        self.current.lock().clone()
    }

    /// Validates, persists, and adopts `config` as current.
    pub fn save(&self, config: AppConfiguration) -> Result<()> {
        config.validate()?;
        self.persist(&config)?;
        *self.current.lock() = config;
        Ok(())
    }

    /// Applies `mutator` to a clone of the current configuration, then
    /// validates and saves the result. The lock is held for the whole
    /// operation so concurrent updates serialize.
    pub fn update(&self, mutator: impl FnOnce(&mut AppConfiguration)) -> Result<AppConfiguration> {
        let mut guard = self.current.lock();
        let mut next = guard.clone();
        mutator(&mut next);
        next.validate()?;
        self.persist(&next)?;
        *guard = next.clone();
        Ok(next)
    }

    pub fn save_curve(&self, curve: crate::model::FanCurve) -> Result<()> {
        crate::curve::validate_curve(&curve).map_err(FanTunerError::config_invalid)?;
        let normalized = crate::curve::normalize_curve(&curve);
        self.update(|config| {
            config.curves.insert(normalized.id.clone(), normalized.clone());
        })?;
        Ok(())
    }

    /// Deletes a curve, downgrading any assignment that referenced it to
    /// Auto across every profile.
    pub fn delete_curve(&self, curve_id: &str) -> Result<()> {
        if !self.current.lock().curves.contains_key(curve_id) {
            return Err(FanTunerError::not_found(format!("curve {curve_id}")));
        }
        self.update(|config| {
            config.curves.remove(curve_id);
            for profile in config.profiles.values_mut() {
                for assignment in profile.assignments.values_mut() {
                    if assignment.curve_id.as_deref() == Some(curve_id) {
                        assignment.curve_id = None;
                        assignment.mode = FanControlMode::Auto;
                    }
                }
            }
        })?;
        Ok(())
    }

    pub fn save_profile(&self, profile: crate::model::FanProfile) -> Result<()> {
        self.update(|config| {
            config.profiles.insert(profile.id.clone(), profile.clone());
        })?;
        Ok(())
    }

    /// Deletes a profile. Fails with `DefaultProtected` if it is the
    /// default; re-points the active profile to the default if the
    /// deleted profile was active.
    pub fn delete_profile(&self, profile_id: &str) -> Result<()> {
        let is_default = self
            .current
            .lock()
            .profiles
            .get(profile_id)
            .ok_or_else(|| FanTunerError::not_found(format!("profile {profile_id}")))?
            .is_default;
        if is_default {
            return Err(FanTunerError::DefaultProtected);
        }
        self.update(|config| {
            config.profiles.remove(profile_id);
            if config.active_profile_id == profile_id {
                if let Some(default_id) = config.default_profile_id() {
                    config.active_profile_id = default_id;
                }
            }
        })?;
        Ok(())
    }

    pub fn set_active_profile(&self, profile_id: &str) -> Result<()> {
        if !self.current.lock().profiles.contains_key(profile_id) {
            return Err(FanTunerError::not_found(format!("profile {profile_id}")));
        }
        self.update(|config| {
            config.active_profile_id = profile_id.to_string();
        })?;
        Ok(())
    }

    fn persist(&self, config: &AppConfiguration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(config)?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file =
            fs::File::create(&temp_path).map_err(|e| FanTunerError::FileWrite { path: temp_path.clone(), source: e })?;
        file.write_all(json.as_bytes())
            .map_err(|e| FanTunerError::FileWrite { path: temp_path.clone(), source: e })?;
        file.sync_all().map_err(|e| FanTunerError::FileWrite { path: temp_path.clone(), source: e })?;
        drop(file);

        self.rotate_backup()?;

        fs::rename(&temp_path, &self.path)
            .map_err(|e| FanTunerError::FileWrite { path: self.path.clone(), source: e })?;

        debug!("saved configuration to {:?}", self.path);
        Ok(())
    }

    /// Copies the existing on-disk config into `backups/` under a
    /// timestamped name before it is overwritten, then prunes to the
    /// newest `MAX_BACKUPS` entries.
    fn rotate_backup(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let backups_dir = self.backups_dir();
        fs::create_dir_all(&backups_dir)?;
        let backup_path = backups_dir.join(format!("config_{}.json", now_ts()));
        fs::copy(&self.path, &backup_path).map_err(|e| FanTunerError::FileWrite { path: backup_path, source: e })?;

        let mut backups: Vec<PathBuf> = fs::read_dir(&backups_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("config_") && !n.starts_with("config_corrupt_"))
                    .unwrap_or(false)
            })
            .collect();
        backups.sort();
        while backups.len() > MAX_BACKUPS {
            let oldest = backups.remove(0);
            let _ = fs::remove_file(&oldest);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CurvePoint, FanCurve, FanProfile};

    fn temp_store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load(&path).unwrap();
        (dir, store)
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let (_dir, store) = temp_store();
        assert_eq!(store.current().curves.len(), 1);
    }

    #[test]
    fn save_then_load_round_trips() {
        let (dir, store) = temp_store();
        let mut config = store.current();
        config.poll_interval_ms = 2000;
        store.save(config.clone()).unwrap();

        let reloaded = ConfigStore::load(dir.path().join("config.json")).unwrap();
        assert_eq!(reloaded.current().poll_interval_ms, 2000);
    }

    #[test]
    fn round_trip_preserves_full_configuration() {
        let (_dir, store) = temp_store();
        let mut config = store.current();
        config.poll_interval_ms = 3000;
        config.emergency_cpu_celsius = 88.0;
        store.save(config.clone()).unwrap();
        assert_eq!(store.current().poll_interval_ms, config.poll_interval_ms);
        assert_eq!(store.current().emergency_cpu_celsius, config.emergency_cpu_celsius);
    }

    #[test]
    fn save_rejects_invalid_configuration() {
        let (_dir, store) = temp_store();
        let mut config = store.current();
        config.poll_interval_ms = 1;
        assert!(store.save(config).is_err());
    }

    #[test]
    fn delete_curve_downgrades_referencing_assignment_to_auto() {
        let (_dir, store) = temp_store();
        store
            .update(|config| {
                let profile = config.profiles.get_mut("default").unwrap();
                profile.assignments.insert(
                    "fan0".to_string(),
                    crate::model::FanAssignment {
                        fan_key: "fan0".to_string(),
                        mode: FanControlMode::Curve,
                        manual_percent: None,
                        curve_id: Some("default".to_string()),
                        last_applied_percent: None,
                    },
                );
            })
            .unwrap();

        store.delete_curve("default").unwrap();

        let config = store.current();
        let assignment = &config.profiles["default"].assignments["fan0"];
        assert_eq!(assignment.mode, FanControlMode::Auto);
        assert!(assignment.curve_id.is_none());
    }

    #[test]
    fn delete_default_profile_is_protected() {
        let (_dir, store) = temp_store();
        assert!(matches!(store.delete_profile("default"), Err(FanTunerError::DefaultProtected)));
    }

    #[test]
    fn delete_active_non_default_profile_repoints_to_default() {
        let (_dir, store) = temp_store();
        let second = FanProfile::new("second", "Second", false);
        store.save_profile(second).unwrap();
        store.set_active_profile("second").unwrap();

        store.delete_profile("second").unwrap();
        assert_eq!(store.current().active_profile_id, "default");
    }

    #[test]
    fn set_active_profile_unknown_id_not_found() {
        let (_dir, store) = temp_store();
        assert!(matches!(store.set_active_profile("nope"), Err(FanTunerError::NotFound(_))));
    }

    #[test]
    fn corrupt_file_is_quarantined_and_defaults_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, b"not json").unwrap();

        let store = ConfigStore::load(&path).unwrap();
        assert_eq!(store.current().curves.len(), 1);

        let backups_dir = dir.path().join("backups");
        let entries: Vec<_> = fs::read_dir(&backups_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn backups_are_pruned_to_max() {
        let (dir, store) = temp_store();
        for i in 0..(MAX_BACKUPS + 5) {
            let mut config = store.current();
            config.poll_interval_ms = 1000 + i as u64;
            store.save(config).unwrap();
        }
        let backups_dir = dir.path().join("backups");
        let count = fs::read_dir(&backups_dir).unwrap().count();
        assert!(count <= MAX_BACKUPS, "expected at most {MAX_BACKUPS} backups, found {count}");
    }

    #[test]
    fn save_curve_validates_before_persisting() {
        let (_dir, store) = temp_store();
        let bad = FanCurve::new("bad", "Bad", vec![CurvePoint::new(30.0, 10.0)]);
        assert!(store.save_curve(bad).is_err());
    }
}

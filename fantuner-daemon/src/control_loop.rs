//! Control Loop: the periodic sensor → curve → actuation pipeline.
//!
//! Runs as one long-lived `tokio::spawn`ed task that owns the latest
//! sensor/fan snapshots and the last-applied duty cycle per fan, shared
//! with the IPC endpoint through `SharedState`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, warn};

use fantuner_core::{
    ConfigStore, FanControlCapability, FanControlMode, FanDevice, HardwareAdapter, HardwareKind, SafetySupervisor,
    SensorKind, SensorReading,
};
use fantuner_protocol::{Notification, NotificationPayload};

use crate::cancellation::CancellationToken;
use crate::dto::{fan_to_dto, sensor_to_dto};

/// Suppresses `set_speed` churn for changes smaller than this.
const DEAD_BAND_PERCENT: f32 = 0.5;

/// Back-off after a failed `refresh`.
const REFRESH_FAILURE_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// State shared between the control loop and the IPC endpoint. Each field
/// is guarded by its own lock; no method here calls into `config` or
/// `safety` while holding `sensors`/`fans`/`last_applied`, per the
/// documented lock order (Safety, Config, Endpoint).
pub struct SharedState {
    pub config: Arc<ConfigStore>,
    pub safety: Arc<SafetySupervisor>,
    pub adapter: Arc<dyn HardwareAdapter>,
    pub sensors: RwLock<Vec<SensorReading>>,
    pub fans: RwLock<Vec<FanDevice>>,
    last_applied: Mutex<HashMap<String, f32>>,
    pub started_at: Instant,
    pub telemetry_tx: broadcast::Sender<Notification>,
    pub subscriber_count: AtomicUsize,
    pub connected_clients: AtomicUsize,
    /// How many entries of the adapter's accumulated warning snapshot have
    /// already been logged by the control loop. `warnings()` is a
    /// non-destructive read shared with `GetStatus`, so the loop tracks its
    /// own read offset instead of draining the list out from under it.
    adapter_warnings_logged: AtomicUsize,
}

impl SharedState {
    pub fn new(config: Arc<ConfigStore>, safety: Arc<SafetySupervisor>, adapter: Arc<dyn HardwareAdapter>) -> Self {
        let (telemetry_tx, _rx) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            config,
            safety,
            adapter,
            sensors: RwLock::new(Vec::new()),
            fans: RwLock::new(Vec::new()),
            last_applied: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
            telemetry_tx,
            subscriber_count: AtomicUsize::new(0),
            connected_clients: AtomicUsize::new(0),
            adapter_warnings_logged: AtomicUsize::new(0),
        }
    }
}

/// Drives the tick pipeline until `cancel` fires.
pub async fn run(state: Arc<SharedState>, cancel: Arc<CancellationToken>) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let tick_start = Instant::now();
        let poll_interval = std::time::Duration::from_millis(state.config.current().poll_interval_ms);

        if let Err(e) = run_tick(&state).await {
            error!("control loop tick failed: {e}");
            state.safety.record_failure(now_ms());
            tokio::select! {
                _ = tokio::time::sleep(REFRESH_FAILURE_BACKOFF) => {}
                _ = cancel.cancelled() => break,
            }
            continue;
        }

        let elapsed = tick_start.elapsed();
        let remaining = poll_interval.saturating_sub(elapsed);
        if remaining.is_zero() {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = cancel.cancelled() => break,
        }
    }
    debug!("control loop stopped");
}

async fn run_tick(state: &Arc<SharedState>) -> fantuner_error::Result<()> {
    // Step 2: refresh hardware.
    if let Err(e) = state.adapter.refresh() {
        warn!("adapter refresh failed: {e}");
        return Err(e);
    }

    // Step 3: read sensors/fans, replace cached snapshots.
    let sensors = state.adapter.get_sensors();
    let fans = state.adapter.get_fans();
    *state.sensors.write().await = sensors.clone();
    *state.fans.write().await = fans.clone();

    // Step 4: safety evaluation.
    state.safety.record_readings(&sensors, now_ms());
    let emergency = state.safety.is_emergency();

    if emergency {
        for fan in &fans {
            if fan.capability == FanControlCapability::FullControl {
                state.adapter.set_speed(&fan.id, 100.0);
            }
        }
    } else {
        apply_profile(state, &sensors, &fans).await;
    }

    // Step 6: telemetry broadcast, gated on having any subscriber.
    if state.subscriber_count.load(Ordering::SeqCst) > 0 {
        let payload = NotificationPayload::SensorUpdate {
            sensors: sensors.iter().map(sensor_to_dto).collect(),
            fans: fans.iter().map(fan_to_dto).collect(),
            emergency,
        };
        let _ = state.telemetry_tx.send(Notification::new(payload));
    }

    let warnings = state.adapter.warnings();
    let already_logged = state.adapter_warnings_logged.swap(warnings.len(), Ordering::SeqCst);
    for warning in warnings.iter().skip(already_logged) {
        warn!("adapter warning: {warning}");
    }

    Ok(())
}

/// Step 5: for each fully-controllable fan with an assignment in the
/// active profile, resolve its target duty cycle and apply the dead-band.
async fn apply_profile(state: &Arc<SharedState>, sensors: &[SensorReading], fans: &[FanDevice]) {
    let config = state.config.current();
    let Some(profile) = config.profiles.get(&config.active_profile_id) else {
        warn!("active profile {} not found in configuration", config.active_profile_id);
        return;
    };

    let first_cpu_temp = sensors
        .iter()
        .find(|r| r.id.kind == SensorKind::Temperature && r.hardware_kind == HardwareKind::Cpu)
        .map(|r| r.value);

    let mut last_applied = state.last_applied.lock().await;

    for fan in fans {
        if fan.capability != FanControlCapability::FullControl {
            continue;
        }
        let fan_key = fan.id.key();
        let Some(assignment) = profile.assignments.get(&fan_key) else {
            continue;
        };

        match assignment.mode {
            FanControlMode::Auto => {
                state.adapter.set_auto(&fan.id);
                last_applied.remove(&fan_key);
            }
            FanControlMode::Manual => {
                let target = assignment.manual_percent.unwrap_or(0.0);
                apply_target(state, &fan_key, &fan.id, target, &mut last_applied).await;
            }
            FanControlMode::Curve => {
                let Some(curve_id) = &assignment.curve_id else { continue };
                let Some(curve) = config.curves.get(curve_id) else { continue };

                let temp = curve
                    .source_sensor_key
                    .as_ref()
                    .and_then(|key| sensors.iter().find(|r| &r.id.key() == key))
                    .map(|r| r.value)
                    .or(first_cpu_temp);
                let Some(temp) = temp else { continue };

                let previous = last_applied.get(&fan_key).copied();
                let target = fantuner_core::interpolate(curve, temp, previous);
                apply_target(state, &fan_key, &fan.id, target, &mut last_applied).await;
            }
        }
    }
}

async fn apply_target(
    state: &Arc<SharedState>,
    fan_key: &str,
    fan_id: &fantuner_core::FanId,
    target: f32,
    last_applied: &mut HashMap<String, f32>,
) {
    let target = state.safety.enforce_minimum(target);
    let previous = last_applied.get(fan_key).copied();
    let changed_enough = previous.map(|p| (target - p).abs() > DEAD_BAND_PERCENT).unwrap_or(true);
    if !changed_enough {
        return;
    }
    if state.adapter.set_speed(fan_id, target) {
        last_applied.insert(fan_key.to_string(), target);
        debug!("set {fan_key} to {target:.1}%");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fantuner_core::{AppConfiguration, FanAssignment, MockAdapter};

    fn test_state() -> Arc<SharedState> {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(ConfigStore::load(dir.path().join("config.json")).unwrap());
        let safety = Arc::new(SafetySupervisor::new(&config.current()));
        let adapter: Arc<dyn HardwareAdapter> = Arc::new(MockAdapter::new());
        Arc::new(SharedState::new(config, safety, adapter))
    }

    #[tokio::test]
    async fn non_full_control_fan_never_receives_set_speed() {
        let state = test_state();
        let mock = MockAdapter::new();
        let fan_key = mock.get_fans()[0].id.key();
        mock.set_fan_capability(&fan_key, fantuner_core::FanControlCapability::MonitorOnly);
        let adapter: Arc<dyn HardwareAdapter> = Arc::new(mock);
        let state = Arc::new(SharedState::new(state.config.clone(), state.safety.clone(), adapter));

        state
            .config
            .update(|cfg| {
                let profile = cfg.profiles.get_mut(&cfg.active_profile_id.clone()).unwrap();
                profile.assignments.insert(
                    fan_key.clone(),
                    FanAssignment { fan_key: fan_key.clone(), mode: FanControlMode::Manual, manual_percent: Some(80.0), curve_id: None, last_applied_percent: None },
                );
            })
            .unwrap();

        run_tick(&state).await.unwrap();
        let updated = state.adapter.get_fans();
        assert_eq!(updated[0].current_duty_percent, Some(30.0), "MonitorOnly fan must never be written to");
    }

    #[tokio::test]
    async fn constant_temperature_issues_one_set_speed_then_holds_dead_band() {
        let state = test_state();
        let fans = state.adapter.get_fans();
        let fan_key = fans[0].id.key();

        let curve_id = "default".to_string();
        state
            .config
            .update(|cfg| {
                let profile = cfg.profiles.get_mut(&cfg.active_profile_id.clone()).unwrap();
                profile.assignments.insert(
                    fan_key.clone(),
                    FanAssignment { fan_key: fan_key.clone(), mode: FanControlMode::Curve, manual_percent: None, curve_id: Some(curve_id), last_applied_percent: None },
                );
            })
            .unwrap();

        run_tick(&state).await.unwrap();
        let after_first = state.adapter.get_fans()[0].current_duty_percent;

        run_tick(&state).await.unwrap();
        let after_second = state.adapter.get_fans()[0].current_duty_percent;

        assert_eq!(after_first, after_second);
    }

    #[test]
    fn default_config_has_sane_poll_interval() {
        let config = AppConfiguration::defaults();
        assert!(config.poll_interval_ms >= 100);
    }
}

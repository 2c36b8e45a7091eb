//! Hardware Adapter: the capability boundary between the control loop and
//! physical sensors/fans. Two implementations satisfy the same trait — a
//! real one backed by Linux hwmon sysfs, and a mock one for development
//! and tests — selected at daemon startup by the `--mock` flag.

mod mock;
mod real;

pub use mock::MockAdapter;
pub use real::RealAdapter;

use fantuner_error::Result;

use crate::model::{FanDevice, FanId, SensorReading};

/// Capability set combining sensor monitoring and fan control.
///
/// Implementations must be safe to call concurrently with the control
/// loop's own calls; each implementation serializes internally rather than
/// pushing that burden onto callers.
pub trait HardwareAdapter: Send + Sync {
    /// Idempotent first-time setup. Fails with `AdapterInit` if hardware
    /// cannot be brought up at all.
    fn initialize(&self) -> Result<()>;

    /// A non-destructive snapshot of warnings accumulated so far (e.g. a fan
    /// that downgraded to MonitorOnly after an I/O failure). Read-only:
    /// repeated callers — the control loop every tick, `GetStatus` on
    /// whatever cadence a client polls it — all see the same accumulated
    /// list rather than racing to drain it first. Does not fail.
    fn warnings(&self) -> Vec<String>;

    /// Re-reads all hardware. Non-fatal on failure: the caller records a
    /// failure against the Safety Supervisor and continues.
    fn refresh(&self) -> Result<()>;

    fn get_sensors(&self) -> Vec<SensorReading>;

    fn get_fans(&self) -> Vec<FanDevice>;

    /// Clamps `percent` to [0,100] and attempts to set the fan's duty
    /// cycle. Returns `false` (never an error) if the fan is not
    /// FullControl, or if the write itself failed — in the latter case the
    /// fan's capability is downgraded to MonitorOnly.
    fn set_speed(&self, fan: &FanId, percent: f32) -> bool;

    /// Reverts a single fan to hardware/BIOS automatic control.
    fn set_auto(&self, fan: &FanId) -> bool;

    /// Bulk revert of every fan to automatic control, used at shutdown.
    fn set_all_auto(&self);
}

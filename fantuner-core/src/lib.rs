//! FanTuner Core Library
//!
//! The control logic shared by the daemon's tokio tasks: the data model,
//! the curve interpolation engine, the safety supervisor, the
//! configuration store, and the hardware adapter boundary.
//!
//! # Module Structure
//!
//! - `model` — data types shared by every other module
//! - `curve` — pure curve interpolation and slew-rate limiting
//! - `safety` — the Normal/Emergency state machine
//! - `config_store` — atomic on-disk configuration persistence
//! - `adapter` — the `HardwareAdapter` trait plus real/mock implementations

pub mod adapter;
pub mod config_store;
pub mod curve;
pub mod model;
pub mod safety;

pub use adapter::{HardwareAdapter, MockAdapter, RealAdapter};
pub use config_store::ConfigStore;
pub use curve::{apply_response_time, interpolate, normalize_curve, validate_curve};
pub use model::{
    AppConfiguration, CurvePoint, FanAssignment, FanControlCapability, FanControlMode, FanCurve,
    FanDevice, FanId, FanProfile, HardwareKind, InterpolationKind, SensorId, SensorKind,
    SensorReading,
};
pub use safety::{EmergencyStatus, SafetyStatus, SafetySupervisor};

pub use fantuner_error::{FanTunerError, Result};

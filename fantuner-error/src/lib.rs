//! Unified error handling for FanTuner
//!
//! A single error type used across the workspace, covering the error kinds
//! named by the control/safety/config/IPC design plus the ambient I/O and
//! serialization failures that surround them.

use std::io;
use std::path::PathBuf;

/// Result type alias using `FanTunerError`.
pub type Result<T> = std::result::Result<T, FanTunerError>;

/// Unified error type for all FanTuner operations.
#[derive(thiserror::Error, Debug)]
pub enum FanTunerError {
    // ========================================================================
    // Hardware Adapter errors
    // ========================================================================
    #[error("adapter initialization failed: {0}")]
    AdapterInit(String),

    #[error("adapter I/O error: {0}")]
    AdapterIo(String),

    #[error("capability denied: fan {fan} is not FullControl")]
    CapabilityDenied { fan: String },

    // ========================================================================
    // Configuration Store errors
    // ========================================================================
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("configuration store corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("cannot delete the default profile")]
    DefaultProtected,

    #[error("not found: {0}")]
    NotFound(String),

    // ========================================================================
    // IPC framing errors
    // ========================================================================
    #[error("invalid frame: {0}")]
    FrameInvalid(String),

    // ========================================================================
    // Ambient I/O and serialization errors
    // ========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read {path}: {source}")]
    FileRead { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    FileWrite { path: PathBuf, source: io::Error },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Generic(String),
}

impl FanTunerError {
    pub fn adapter_init(msg: impl Into<String>) -> Self {
        Self::AdapterInit(msg.into())
    }

    pub fn adapter_io(msg: impl Into<String>) -> Self {
        Self::AdapterIo(msg.into())
    }

    pub fn capability_denied(fan: impl Into<String>) -> Self {
        Self::CapabilityDenied { fan: fan.into() }
    }

    pub fn config_invalid(msg: impl Into<String>) -> Self {
        Self::ConfigInvalid(msg.into())
    }

    pub fn config_corrupt(msg: impl Into<String>) -> Self {
        Self::ConfigCorrupt(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn frame_invalid(msg: impl Into<String>) -> Self {
        Self::FrameInvalid(msg.into())
    }

    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }
}

impl From<String> for FanTunerError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for FanTunerError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

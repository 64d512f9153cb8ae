//! Unified error handling for Zonefan
//!
//! This crate provides a single error type used across all Zonefan
//! components. It uses thiserror for ergonomic error definitions with
//! proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using ZonefanError
pub type Result<T> = std::result::Result<T, ZonefanError>;

/// Unified error type for all Zonefan operations
#[derive(thiserror::Error, Debug)]
pub enum ZonefanError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to lock file {0}")]
    FileLock(PathBuf),

    // ============================================================================
    // Hardware Transport Errors
    // ============================================================================
    #[error("Control channel is not open")]
    TransportNotOpen,

    #[error("Failed to open control device {device}: {reason}")]
    TransportOpen {
        device: PathBuf,
        reason: String,
    },

    #[error("Failed to configure serial line on {device}: {reason}")]
    SerialSetup {
        device: PathBuf,
        reason: String,
    },

    #[error("Failed to send command {cmd:?}: {reason}")]
    CommandWrite {
        cmd: String,
        reason: String,
    },

    #[error("Failed to read response for command {cmd:?}: {reason}")]
    CommandRead {
        cmd: String,
        reason: String,
    },

    #[error("ioctl request {request:#x} failed: {reason}")]
    Ioctl {
        request: u64,
        reason: String,
    },

    #[error("Operation not supported by this transport: {0}")]
    NotSupported(String),

    // ============================================================================
    // Sensor and Inventory Errors
    // ============================================================================
    #[error("Failed to read temperature for {zone}: {reason}")]
    TemperatureRead {
        zone: String,
        reason: String,
    },

    #[error("Power reading unavailable (raw value {raw:#x})")]
    PowerUnavailable {
        raw: i32,
    },

    #[error("Device inventory error: {0}")]
    Inventory(String),

    #[error("Unknown accelerator card: {0}")]
    UnknownCard(i32),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Validation Errors
    // ============================================================================
    #[error("Invalid duty cycle: {value} (must be 0-100)")]
    InvalidDuty {
        value: i64,
    },

    #[error("Invalid fan channel: {0}")]
    InvalidChannel(String),

    #[error("Unparsable response {response:?} for command {cmd:?}")]
    ResponseParse {
        cmd: String,
        response: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl ZonefanError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an inventory error from a string
    pub fn inventory(msg: impl Into<String>) -> Self {
        Self::Inventory(msg.into())
    }
}

// Allow converting from String to ZonefanError
impl From<String> for ZonefanError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to ZonefanError
impl From<&str> for ZonefanError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

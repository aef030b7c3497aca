//! Unified error handling for legionctl
//!
//! This crate provides a single error type used across all legionctl components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using LegionError
pub type Result<T> = std::result::Result<T, LegionError>;

/// Unified error type for all legionctl operations
#[derive(thiserror::Error, Debug)]
pub enum LegionError {
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

    #[error("Failed to parse {path}: {reason}")]
    Parse {
        path: PathBuf,
        reason: String,
    },

    // ============================================================================
    // Embedded Controller Errors
    // ============================================================================
    #[error("EC busy: port 0x{port:02X} did not report {condition} within the poll budget")]
    EcBusy {
        port: u16,
        condition: &'static str,
    },

    #[error("EC register address out of range: 0x{0:04X} (max 0xFF)")]
    EcAddress(u16),

    // ============================================================================
    // WMI Errors
    // ============================================================================
    #[error("WMI call failed: {0}")]
    WmiCall(String),

    #[error("WMI result type mismatch: expected {expected}, got {found}")]
    WmiTypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("No ACPI method registered for WMI GUID {0}")]
    WmiUnknownGuid(String),

    // ============================================================================
    // RAPL Errors
    // ============================================================================
    #[error("RAPL MMIO engine not found")]
    RaplNotFound,

    #[error("Invalid power limit: {value_mw} mW (max 999000 mW)")]
    RaplInvalid {
        value_mw: u32,
    },

    #[error("RAPL register 0x{register:04X} already locked at {current_mw:?} mW, refusing {requested_mw:?} mW")]
    RaplLocked {
        register: u32,
        current_mw: Vec<u32>,
        requested_mw: Vec<u32>,
    },

    // ============================================================================
    // Driver Errors
    // ============================================================================
    #[error("Driver not found: {0}")]
    DriverNotFound(String),

    #[error("Driver not available: {0}")]
    DriverNotAvailable(String),

    #[error("Driver already registered: {0}")]
    DuplicateDriver(String),

    #[error("Capability {capability} missing from driver {driver}")]
    MissingCapability {
        driver: String,
        capability: String,
    },

    // ============================================================================
    // Protocol Errors
    // ============================================================================
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Unknown data type: {0}")]
    UnknownDataType(u8),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Data not ready: received {received} of {expected} bytes before timeout")]
    DataNotReady {
        expected: usize,
        received: usize,
    },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("{0}")]
    Generic(String),
}

impl LegionError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a protocol error from a string
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid value error from a string
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    /// Create a parse error for a file
    pub fn parse(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// The hardware behind a feature is missing on this machine (or was just
    /// hot-unplugged). Reported to clients as "not available", never as a crash.
    pub fn is_not_available(&self) -> bool {
        matches!(
            self,
            Self::DriverNotAvailable(_)
                | Self::RaplNotFound
                | Self::MissingCapability { .. }
                | Self::NotSupported(_)
        )
    }

    /// Errors after which the connection that produced them must be torn down.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::UnknownMessageType(_)
                | Self::UnknownDataType(_)
                | Self::Protocol(_)
                | Self::DataNotReady { .. }
                | Self::ConnectionClosed
        )
    }
}

// Allow converting from String to LegionError
impl From<String> for LegionError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to LegionError
impl From<&str> for LegionError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

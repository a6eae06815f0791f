//! Error types for the bench.
//!
//! `DaqError` is the single error enum shared by every crate in the workspace.
//! It keeps the two decision points the bench depends on apart:
//!
//! - **`TransportOpen`**: the serial adapter or USB device could not be opened.
//!   Callers treat this as fatal; the binary logs it and exits non-zero.
//! - Everything else is returned to the caller of the failing operation.
//!
//! A Prologix read that runs out of time is *not* an error. It is reported
//! through the bus read outcome alongside whatever bytes arrived.

use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Classification of a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Opening or first-contact validation failed.
    Initialization,
    /// A setting was rejected or could not be applied.
    Configuration,
    /// Bytes on the wire did not make sense.
    Communication,
    /// The instrument did not answer in time.
    Timeout,
    /// A caller argument was outside what the instrument accepts.
    InvalidParameter,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
        };
        write!(f, "{}", label)
    }
}

/// A failure reported by a specific instrument driver.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Short model identifier, e.g. `sr830`.
    pub driver_type: String,
    /// What went wrong, broadly.
    pub kind: DriverErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DriverError {
    /// Build a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

// =============================================================================
// DaqError
// =============================================================================

/// The workspace-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The transport (serial adapter or USB device file) could not be opened.
    #[error("Failed to open transport '{resource}': {source}")]
    TransportOpen {
        /// Port path or device file.
        resource: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// I/O on an already-open transport failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation needed an open connection and there was none.
    #[error("Instrument '{0}' is not open")]
    NotOpen(String),

    /// Generic instrument failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Driver-specific failure.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// A reply could not be interpreted.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The lock-in scan buffer returned a different number of bytes than requested.
    #[error("Scan buffer length mismatch: expected {expected} bytes, received {actual}")]
    ScanLength {
        /// `4 × bins` requested.
        expected: usize,
        /// Bytes actually read.
        actual: usize,
    },

    /// A caller argument was rejected before anything was sent.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Semantic configuration error (values that parse but make no sense).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration could not be loaded or parsed.
    #[error("Configuration load error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A sweep stopped part-way through. Rows collected so far are discarded.
    #[error("Sweep aborted at step {step} (value {value}): {source}")]
    SweepAborted {
        /// Zero-based index of the failing step.
        step: usize,
        /// Swept value being applied or sampled.
        value: f64,
        /// What failed.
        #[source]
        source: Box<DaqError>,
    },

    /// Writing or reading a saved sweep failed.
    #[error("Persistence error: {0}")]
    Persist(String),

    /// One or more instruments failed to close.
    #[error("Shutdown failed with {} error(s)", .0.len())]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

/// Result alias used across the workspace.
pub type AppResult<T> = std::result::Result<T, DaqError>;

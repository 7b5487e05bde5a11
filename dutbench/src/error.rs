//! Error types for dutbench.

use std::io;
use thiserror::Error;

/// Result type for dutbench operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for dutbench operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (process pipes, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Transport was lost or refused (reader failure, broken pipe).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A device could not be connected or never reported ready.
    #[error("Device connection failed: {0}")]
    DeviceConnection(String),

    /// A command did not complete in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A device answered with an unexpected return code.
    #[error("Command '{command}' failed on device {device}: {reason}")]
    CommandFailed {
        /// 1-based device index.
        device: usize,
        /// Command text as sent.
        command: String,
        /// Human readable failure reason.
        reason: String,
        /// Trace lines leading up to the failure.
        trailing: Vec<String>,
    },

    /// The device died (transport loss or reboot marker) while a command was outstanding.
    #[error("Device {0} died")]
    DeviceDied(String),

    /// Framework level step error.
    #[error("Step error: {0}")]
    StepError(String),

    /// Test step failure raised by a test body.
    #[error("Step failed: {0}")]
    StepFailed(String),

    /// No resource matched a requirement, or device construction failed.
    #[error("Allocation error: {0}")]
    Allocation(String),

    /// Resource initialization (flashing, construction) failed.
    #[error("Resource initialization failed: {0}")]
    ResourceInit(String),

    /// Result could not be decided because of the environment.
    #[error("Inconclusive: {0}")]
    Inconclusive(String),

    /// Test case was skipped.
    #[error("Skipped: {0}")]
    Skipped(String),

    /// Interrupted by the user.
    #[error("Aborted by user")]
    Interrupted,

    /// Host environment problem (missing binary, bad path).
    #[error("Environment error: {0}")]
    Environment(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A lookup (device index, nickname, expected line) failed.
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// Invalid matcher pattern.
    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    /// Unsupported operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Coarse classification of an [`Error`], used to pick a run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Host environment problem.
    Environment,
    /// Resource allocation failure.
    Allocation,
    /// Resource initialization failure.
    ResourceInit,
    /// Framework error or dead device.
    StepError,
    /// Command timeout.
    StepTimeout,
    /// Wrong result from the device, or a failure raised by the test.
    StepFail,
    /// Environment made the result undecidable.
    Inconclusive,
    /// Test skipped.
    Skipped,
    /// User interrupt.
    Interrupted,
    /// Lookup failure.
    Lookup,
    /// Invalid value or configuration.
    Value,
    /// Anything else.
    Other,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Environment(_) => FailureKind::Environment,
            Self::Allocation(_) => FailureKind::Allocation,
            Self::ResourceInit(_) => FailureKind::ResourceInit,
            Self::StepError(_) | Self::DeviceDied(_) | Self::DeviceConnection(_) => {
                FailureKind::StepError
            },
            Self::Timeout(_) => FailureKind::StepTimeout,
            Self::CommandFailed { .. } | Self::StepFailed(_) => FailureKind::StepFail,
            Self::Inconclusive(_) => FailureKind::Inconclusive,
            Self::Skipped(_) => FailureKind::Skipped,
            Self::Interrupted => FailureKind::Interrupted,
            Self::Lookup(_) => FailureKind::Lookup,
            Self::Config(_) | Self::Regex(_) => FailureKind::Value,
            Self::Io(_) | Self::Transport(_) | Self::Unsupported(_) => FailureKind::Other,
            #[cfg(feature = "native")]
            Self::Serial(_) => FailureKind::Other,
        }
    }

    /// Whether this error is one of the typed test-step failures
    /// (timeout, wrong result, framework error).
    pub fn is_step_failure(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::StepError | FailureKind::StepTimeout | FailureKind::StepFail
        )
    }
}

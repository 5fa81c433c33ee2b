//! Error types for the Cinder CSI node driver
//!
//! Every failure inside the driver is an [`Error`] variant. Callers above the
//! core only ever need the closed [`ErrorKind`] set to decide retry versus
//! give-up; the variant carries the detail for logs.

use std::time::Duration;
use thiserror::Error;

/// Closed set of error kinds surfaced to the orchestrator-facing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Resource absent at the queried layer
    NotFound,
    /// Attached elsewhere, or in an opposing terminal state
    Conflict,
    /// Operation not legal from the current status
    InvalidState,
    /// Backoff budget exhausted, or the caller's deadline fired
    Timeout,
    /// Resolver converged without error but produced nothing
    EmptyResult,
    /// Explicitly unsupported capability
    Unimplemented,
    /// Malformed request
    InvalidArgument,
    /// Opaque failure from the cloud or OS layer
    BackendError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::InvalidState => write!(f, "invalid_state"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::EmptyResult => write!(f, "empty_result"),
            ErrorKind::Unimplemented => write!(f, "unimplemented"),
            ErrorKind::InvalidArgument => write!(f, "invalid_argument"),
            ErrorKind::BackendError => write!(f, "backend_error"),
        }
    }
}

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Volume Errors
    // =========================================================================
    #[error("Volume not found: {volume_id}")]
    VolumeNotFound { volume_id: String },

    #[error("Volume {volume_id} is attached to a different instance ({attached_to})")]
    AttachedElsewhere {
        volume_id: String,
        attached_to: String,
    },

    #[error("Volume {volume_id} has no attachment to instance {instance_id}")]
    NotAttachedHere {
        volume_id: String,
        instance_id: String,
    },

    #[error("Cannot delete volume {volume_id}, it is still attached to {attached_to}")]
    VolumeInUse {
        volume_id: String,
        attached_to: String,
    },

    #[error("Cannot {operation} volume {volume_id}, its status is {status}")]
    InvalidVolumeState {
        volume_id: String,
        status: String,
        operation: String,
    },

    // =========================================================================
    // Polling Errors
    // =========================================================================
    #[error("Volume {volume_id}: {operation} did not complete within {attempts} attempts")]
    Timeout {
        volume_id: String,
        operation: String,
        attempts: u32,
    },

    #[error("Device {device} did not appear within {timeout:?}")]
    DeviceScanTimeout { device: String, timeout: Duration },

    #[error("{operation} cancelled by caller")]
    Cancelled { operation: String },

    #[error("Device path was empty for volume {volume_id}")]
    EmptyDevicePath { volume_id: String },

    // =========================================================================
    // Mount Errors
    // =========================================================================
    #[error("Path is not mounted: {path}")]
    NotMounted { path: String },

    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    #[error("Device {device} carries a partition table and will not be formatted")]
    PartitionedDevice { device: String },

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Command failed: {command} - {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Mount operation on {target} failed: {reason}")]
    MountFailed { target: String, reason: String },

    // =========================================================================
    // Cloud Errors
    // =========================================================================
    #[error("OpenStack API error: {service} - {reason}")]
    OpenStackApi { service: String, reason: String },

    #[error("OpenStack {service} conflict: {reason}")]
    OpenStackConflict { service: String, reason: String },

    #[error("Metadata service error: {0}")]
    Metadata(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error into the closed kind set
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::VolumeNotFound { .. } | Error::NotMounted { .. } | Error::PathNotFound { .. } => {
                ErrorKind::NotFound
            }

            Error::AttachedElsewhere { .. }
            | Error::NotAttachedHere { .. }
            | Error::OpenStackConflict { .. } => ErrorKind::Conflict,

            Error::VolumeInUse { .. }
            | Error::InvalidVolumeState { .. }
            | Error::PartitionedDevice { .. } => ErrorKind::InvalidState,

            Error::Timeout { .. } | Error::DeviceScanTimeout { .. } | Error::Cancelled { .. } => {
                ErrorKind::Timeout
            }

            Error::EmptyDevicePath { .. } => ErrorKind::EmptyResult,

            Error::Unimplemented(_) => ErrorKind::Unimplemented,

            Error::InvalidArgument(_) | Error::Configuration(_) => ErrorKind::InvalidArgument,

            Error::Internal(_)
            | Error::CommandFailed { .. }
            | Error::MountFailed { .. }
            | Error::OpenStackApi { .. }
            | Error::Metadata(_)
            | Error::Http(_)
            | Error::JsonParse(_)
            | Error::Io(_) => ErrorKind::BackendError,
        }
    }

    /// Check if this error is worth retrying by the caller
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::BackendError)
    }

    /// Check if this error means the queried resource is absent
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

//! Error types for usbd
//!
//! Every fallible operation in the crate returns [`UsbError`]. Callers that
//! report outcomes to a subscriber collapse errors into the coarser
//! [`Status`] taxonomy with [`UsbError::status`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::Status;

/// USB Type-C coordination errors
#[derive(Error, Debug)]
pub enum UsbError {
    /// Reading a hardware node failed.
    #[error("Failed to read node {}: {source}", path.display())]
    NodeRead {
        /// Node that could not be read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Writing a hardware node failed.
    #[error("Failed to write node {}: {source}", path.display())]
    NodeWrite {
        /// Node that could not be written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The node rejected the write because another transition is in flight.
    #[error("Node {} busy", path.display())]
    Busy {
        /// Node that reported contention.
        path: PathBuf,
    },

    /// A role node reported a value outside the known vocabulary.
    #[error("Unrecognized role '{value}' at {}", path.display())]
    UnrecognizedRole {
        /// Role node that was read.
        path: PathBuf,
        /// The raw (extracted) role string.
        value: String,
    },

    /// A role write was accepted but the node reports a different role.
    #[error("Role not applied at {}: requested '{requested}', found '{actual}'", path.display())]
    RoleNotApplied {
        /// Role node that was written.
        path: PathBuf,
        /// Value that was written.
        requested: String,
        /// Value read back.
        actual: String,
    },

    /// A bounded wait expired without confirmation.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A node held a value that could not be interpreted.
    #[error("Invalid value '{value}' at {}", path.display())]
    InvalidValue {
        /// Node that was read.
        path: PathBuf,
        /// The trimmed content.
        value: String,
    },

    /// A control surface or lookup target does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Kernel uevent socket error
    #[error("Uevent error: {0}")]
    Uevent(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl UsbError {
    /// Creates a read error for `path`.
    pub fn node_read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::NodeRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a write error for `path`.
    pub fn node_write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::NodeWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a busy error for `path`.
    pub fn busy(path: impl Into<PathBuf>) -> Self {
        Self::Busy { path: path.into() }
    }

    /// Creates an invalid value error for `path`.
    pub fn invalid_value(path: impl Into<PathBuf>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UsbError::Busy { .. })
    }

    /// Maps the error to the outcome reported to subscribers.
    pub fn status(&self) -> Status {
        match self {
            UsbError::UnrecognizedRole { .. } => Status::UnrecognizedRole,
            _ => Status::Error,
        }
    }
}

/// Result type for usbd operations
pub type Result<T> = std::result::Result<T, UsbError>;

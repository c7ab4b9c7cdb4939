//! Error types for the acquisition core

use super::transport::LinkError;
use thiserror::Error;

/// Errors raised while locating, identifying or driving devices
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// No serial port matched the configured descriptor patterns
    #[error("No compatible device found")]
    NoDeviceFound,

    /// The operating system refused to list serial ports
    #[error("Port enumeration failed: {0}")]
    PortEnumeration(#[from] serialport::Error),

    /// Two distinct hardware IDs resolved to the same logical ID
    #[error("Logical ID {logical_id} claimed by both {first} and {second}")]
    IdentityCollision {
        /// Logical ID that is claimed twice
        logical_id: i32,
        /// Hardware ID that claimed it first
        first: String,
        /// Hardware ID that claimed it second
        second: String,
    },

    /// Hardware ID is missing from the identity table
    #[error("Unknown hardware ID {hardware_id} on {port}")]
    UnknownIdentity {
        /// Port the device was found on
        port: String,
        /// Hardware ID reported during handshake
        hardware_id: String,
    },

    /// Opening the link or completing the handshake failed
    #[error("Connection to {port} failed: {source}")]
    ConnectionFailure {
        /// Port name
        port: String,
        /// Underlying link error
        #[source]
        source: LinkError,
    },

    /// The link failed while a command was streaming
    #[error("Stream I/O failure on device {logical_id}: {source}")]
    StreamIoFailure {
        /// Logical device ID
        logical_id: i32,
        /// Underlying link error
        #[source]
        source: LinkError,
    },

    /// Parameters do not satisfy the mode's schema
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// No session exists for the logical ID
    #[error("No session for device {0}")]
    UnknownDevice(i32),

    /// The session is failed and needs an explicit reconnect
    #[error("Device {0} is in a failed state, reconnect it first")]
    SessionFailed(i32),

    /// Writing the output file failed
    #[error("Failed to persist data: {0}")]
    Persist(#[from] std::io::Error),
}

/// Result alias for the acquisition core
pub type AcquisitionResult<T> = Result<T, AcquisitionError>;

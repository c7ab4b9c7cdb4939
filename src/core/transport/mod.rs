//! Line-level transport to measurement devices
//!
//! A [`DeviceLink`] is the only thing a session needs from a serial port:
//! newline-framed reads bounded by a timeout, raw writes, control of the
//! reset line and a way to drop stale input. [`LinkConnector`] opens links by
//! port name so the coordinator never touches a concrete port type.

mod serial;

pub use serial::{SerialConnector, SerialLink};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Transport error types
#[derive(Error, Debug)]
pub enum LinkError {
    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No complete exchange within the allowed time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Link closed or device unplugged
    #[error("Disconnected")]
    Disconnected,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A newline-framed, bidirectional link to one device
#[async_trait]
pub trait DeviceLink: Send {
    /// Read one line with the terminator stripped.
    ///
    /// Returns `Ok(None)` when no complete line arrived within `timeout`.
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError>;

    /// Write raw bytes and flush them
    async fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError>;

    /// Set the DTR control line
    async fn set_dtr(&mut self, level: bool) -> Result<(), LinkError>;

    /// Discard anything buffered on the input side
    async fn clear_input(&mut self) -> Result<(), LinkError>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Opens [`DeviceLink`]s by port name
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Open the named port at the given baud rate
    async fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn DeviceLink>, LinkError>;
}

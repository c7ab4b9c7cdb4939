//! Core module containing the acquisition machinery
//!
//! This module provides:
//! - Line-level serial transport and the link traits sessions run on
//! - Device discovery and identity resolution
//! - The command protocol shared by every device
//! - Per-device sessions with buffered, append-only persistence
//! - The coordinator that drives all devices and reports completion
//! - A virtual device for tests and dry runs

pub mod coordinator;
pub mod error;
pub mod identity;
pub mod locator;
pub mod logger;
pub mod notify;
pub mod protocol;
pub mod recorder;
pub mod session;
pub mod simulator;
pub mod transport;

pub use coordinator::{Coordinator, CoordinatorOptions};
pub use error::{AcquisitionError, AcquisitionResult};
pub use session::{RunOutcome, Session, SessionState};

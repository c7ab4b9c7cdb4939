//! # pvstab Core Library
//!
//! Acquisition controller for photovoltaic stability test benches:
//! - Discovery of measurement boards on USB serial bridges
//! - Boot handshake and hardware-ID → logical-ID resolution
//! - SCAN, PNO and constant-voltage runs on many boards in parallel
//! - Buffered, append-only CSV output with a metadata and header block
//! - Cooperative cancellation and a single completion notice per run
//!
//! ## Example
//!
//! ```rust,no_run
//! use pvstab_core::core::locator::SerialPorts;
//! use pvstab_core::core::notify::LogNotifier;
//! use pvstab_core::core::protocol::RunRequest;
//! use pvstab_core::core::transport::SerialConnector;
//! use pvstab_core::{AppConfig, Coordinator, EventLog};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load_default()?;
//!     let log = EventLog::default();
//!     let coordinator = Coordinator::new(
//!         config.coordinator_options(),
//!         Arc::new(SerialConnector),
//!         Arc::new(LogNotifier::new(log.clone())),
//!         log,
//!     );
//!
//!     if coordinator.initialize(&SerialPorts).await {
//!         coordinator.run_request(&RunRequest::scan(1.2, 0.03, 3, 50, true)).await?;
//!         coordinator.wait_idle().await;
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::{AppConfig, ConfigError};
pub use crate::core::coordinator::{Coordinator, CoordinatorOptions};
pub use crate::core::error::{AcquisitionError, AcquisitionResult};
pub use crate::core::identity::{Identity, IdentityResolver, IdentityTable};
pub use crate::core::locator::{DeviceDescriptor, DeviceLocator, PortSource, SerialPorts, StaticPorts};
pub use crate::core::logger::{EventLog, LogEntry, LogFormat};
pub use crate::core::notify::{LogNotifier, Notifier};
pub use crate::core::protocol::{Header, MeasurementRow, Mode, RunRequest};
pub use crate::core::session::{RunOutcome, Session, SessionOptions, SessionState};
pub use crate::core::transport::{DeviceLink, LinkConnector, LinkError, SerialConnector};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

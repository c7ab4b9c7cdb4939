//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::error::AcquisitionError;
use crate::core::transport::LinkError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Connection timeout
    pub const TIMEOUT: u8 = 4;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Device stream broke mid-run
    pub const STREAM_FAILED: u8 = 9;

    /// Writing measurement data failed
    pub const PERSIST_FAILED: u8 = 10;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Unknown or colliding device identity
    pub const IDENTITY_ERROR: u8 = 13;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for the operator
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::PERSIST_FAILED,
        };

        Self::Error(code, err.to_string())
    }
}

fn link_code(err: &LinkError) -> u8 {
    match err {
        LinkError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
        LinkError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
        LinkError::Timeout(_) => ExitCodes::TIMEOUT,
        _ => ExitCodes::CONNECTION_FAILED,
    }
}

impl From<AcquisitionError> for CliResult {
    fn from(err: AcquisitionError) -> Self {
        let code = match &err {
            AcquisitionError::NoDeviceFound | AcquisitionError::UnknownDevice(_) => ExitCodes::DEVICE_NOT_FOUND,
            AcquisitionError::PortEnumeration(_) => ExitCodes::ERROR,
            AcquisitionError::IdentityCollision { .. } | AcquisitionError::UnknownIdentity { .. } => {
                ExitCodes::IDENTITY_ERROR
            }
            AcquisitionError::ConnectionFailure { source, .. } => link_code(source),
            AcquisitionError::StreamIoFailure { .. } | AcquisitionError::SessionFailed(_) => ExitCodes::STREAM_FAILED,
            AcquisitionError::InvalidParameters(_) => ExitCodes::INVALID_ARGS,
            AcquisitionError::Persist(_) => ExitCodes::PERSIST_FAILED,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Connection timeout",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Device stream failed",
        10 => "Could not save measurement data",
        11 => "Operation cancelled",
        12 => "Device not found",
        13 => "Unknown or duplicate device identity",
        14 => "Port not found",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 7, 8, 9, 10, 11, 12, 13, 14, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

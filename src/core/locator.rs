//! Device Locator
//!
//! Enumerates serial ports and keeps the ones whose vendor descriptor looks
//! like a measurement board.

use super::error::{AcquisitionError, AcquisitionResult};
use super::identity::UNKNOWN_LOGICAL_ID;
use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};

/// Descriptor substrings of the USB bridges the boards ship with
pub const DEFAULT_PORT_PATTERNS: &[&str] = &["USB Serial Device", "USB-SERIAL CH340", "Arduino Mega 2560", "Arduino"];

/// Default patterns as owned strings
pub fn default_port_patterns() -> Vec<String> {
    DEFAULT_PORT_PATTERNS.iter().map(|p| (*p).to_string()).collect()
}

/// A port that may host a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// OS port name (COM3, /dev/ttyACM0)
    pub port: String,
    /// Vendor descriptor string
    pub descriptor: String,
    /// Serial reported during handshake
    pub hardware_id: Option<String>,
    /// Assigned logical ID, -1 until resolved
    pub logical_id: i32,
}

impl DeviceDescriptor {
    /// Unresolved descriptor
    pub fn new(port: &str, descriptor: &str) -> Self {
        Self {
            port: port.to_string(),
            descriptor: descriptor.to_string(),
            hardware_id: None,
            logical_id: UNKNOWN_LOGICAL_ID,
        }
    }

    /// True if the descriptor contains any of `patterns`
    pub fn matches<S: AsRef<str>>(&self, patterns: &[S]) -> bool {
        patterns.iter().any(|p| self.descriptor.contains(p.as_ref()))
    }
}

impl From<SerialPortInfo> for DeviceDescriptor {
    fn from(info: SerialPortInfo) -> Self {
        let descriptor = match &info.port_type {
            SerialPortType::UsbPort(usb) => {
                let parts: Vec<&str> = [usb.product.as_deref(), usb.manufacturer.as_deref()]
                    .into_iter()
                    .flatten()
                    .filter(|s| !s.is_empty())
                    .collect();
                if parts.is_empty() {
                    format!("USB {:04x}:{:04x}", usb.vid, usb.pid)
                } else {
                    parts.join(" ")
                }
            }
            SerialPortType::PciPort => "PCI".to_string(),
            SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            SerialPortType::Unknown => "Unknown".to_string(),
        };
        Self::new(&info.port_name, &descriptor)
    }
}

/// Where port lists come from
pub trait PortSource: Send + Sync {
    /// All ports currently present
    fn ports(&self) -> AcquisitionResult<Vec<DeviceDescriptor>>;
}

/// Ports reported by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPorts;

impl PortSource for SerialPorts {
    fn ports(&self) -> AcquisitionResult<Vec<DeviceDescriptor>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(DeviceDescriptor::from).collect())
    }
}

/// A fixed port list
#[derive(Debug, Clone, Default)]
pub struct StaticPorts(pub Vec<DeviceDescriptor>);

impl PortSource for StaticPorts {
    fn ports(&self) -> AcquisitionResult<Vec<DeviceDescriptor>> {
        Ok(self.0.clone())
    }
}

/// Finds candidate devices through a [`PortSource`]
pub struct DeviceLocator<'a> {
    source: &'a dyn PortSource,
}

impl<'a> DeviceLocator<'a> {
    /// Locator over `source`
    pub fn new(source: &'a dyn PortSource) -> Self {
        Self { source }
    }

    /// Every present port, `NoDeviceFound` if there are none
    pub fn enumerate(&self) -> AcquisitionResult<Vec<DeviceDescriptor>> {
        let ports = self.source.ports()?;
        if ports.is_empty() {
            return Err(AcquisitionError::NoDeviceFound);
        }
        tracing::debug!(count = ports.len(), "enumerated serial ports");
        Ok(ports)
    }

    /// Present ports whose descriptor matches `patterns`
    pub fn matching<S: AsRef<str>>(&self, patterns: &[S]) -> AcquisitionResult<Vec<DeviceDescriptor>> {
        Ok(self.enumerate()?.into_iter().filter(|d| d.matches(patterns)).collect())
    }

    /// Matching ports, `NoDeviceFound` if nothing matched
    pub fn candidates<S: AsRef<str>>(&self, patterns: &[S]) -> AcquisitionResult<Vec<DeviceDescriptor>> {
        let found = self.matching(patterns)?;
        if found.is_empty() {
            return Err(AcquisitionError::NoDeviceFound);
        }
        Ok(found)
    }
}

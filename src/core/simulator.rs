//! Virtual Device Simulator
//!
//! Scriptable stand-ins for measurement firmware. A [`VirtualDevice`] boots
//! like the real board (hardware ID line, ready marker), answers commands with
//! a start marker, data rows and the terminal sentinel, reboots on a DTR
//! pulse, and can be unplugged or made to fault mid-stream.

use super::locator::{DeviceDescriptor, PortSource};
use super::protocol::{DONE_SENTINEL, HARDWARE_ID_MARKER, READY_MARKER, REQUEST_END, REQUEST_START, START_MARKER};
use super::transport::{DeviceLink, LinkConnector, LinkError};
use crate::core::error::AcquisitionError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One scripted output event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    /// Emit a line after `delay`
    Line {
        /// Time before the line becomes readable
        delay: Duration,
        /// Line text without terminator
        text: String,
    },
    /// Fail the link after `delay`, as if unplugged
    Fault {
        /// Time before the fault
        delay: Duration,
    },
}

impl ScriptStep {
    /// Line available immediately
    pub fn line(text: impl Into<String>) -> Self {
        Self::Line {
            delay: Duration::ZERO,
            text: text.into(),
        }
    }

    /// Line available after `delay`
    pub fn line_after(delay: Duration, text: impl Into<String>) -> Self {
        Self::Line {
            delay,
            text: text.into(),
        }
    }

    fn delay(&self) -> Duration {
        match self {
            Self::Line { delay, .. } | Self::Fault { delay } => *delay,
        }
    }

    fn delay_mut(&mut self) -> &mut Duration {
        match self {
            Self::Line { delay, .. } | Self::Fault { delay } => delay,
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    hardware_id: String,
    descriptor: String,
    boot_lines: Vec<String>,
    channels: usize,
    rows: usize,
    row_interval: Duration,
    send_sentinel: bool,
    fault_after: Option<usize>,
    response: Option<Vec<ScriptStep>>,
    outbox: VecDeque<ScriptStep>,
    /// Request bytes after a start marker, `None` outside a request
    rx: Option<String>,
    received: Vec<String>,
    dtr: bool,
    resets: usize,
    opens: usize,
    unplugged: bool,
}

impl DeviceState {
    fn boot(&mut self) {
        self.outbox = self.boot_lines.iter().map(ScriptStep::line).collect();
        self.rx = None;
    }

    /// Feed request bytes the way the firmware reads them: everything
    /// outside a `<` ... `>` pair is dropped
    fn receive(&mut self, text: &str) {
        for c in text.chars() {
            match self.rx.take() {
                None if c == REQUEST_START => self.rx = Some(String::new()),
                None => {}
                Some(command) if c == REQUEST_END => {
                    self.received.push(command.clone());
                    self.respond(&command);
                }
                Some(mut pending) => {
                    pending.push(c);
                    self.rx = Some(pending);
                }
            }
        }
    }

    fn respond(&mut self, command: &str) {
        let keyword = command.split(',').next().unwrap_or_default().trim();
        let pno = match keyword {
            "scan" | "constantVoltage" => false,
            "PnO" => true,
            _ => {
                self.outbox.push_back(ScriptStep::line(format!("Unknown mode: {}", keyword)));
                return;
            }
        };

        if let Some(script) = &self.response {
            self.outbox.extend(script.iter().cloned());
            return;
        }

        self.outbox.push_back(ScriptStep::line(START_MARKER));
        self.outbox.push_back(ScriptStep::line("Val1: 1.20, Val2: 0.03"));
        for i in 0..self.rows {
            if self.fault_after == Some(i) {
                self.outbox.push_back(ScriptStep::Fault { delay: self.row_interval });
                return;
            }
            let row = if pno {
                VirtualDevice::pno_row(i, self.channels)
            } else {
                VirtualDevice::sweep_row(i, self.channels)
            };
            self.outbox.push_back(ScriptStep::line_after(self.row_interval, row));
        }
        if self.send_sentinel {
            self.outbox.push_back(ScriptStep::line_after(self.row_interval, DONE_SENTINEL));
        }
    }
}

/// A simulated measurement board
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    inner: Arc<Mutex<DeviceState>>,
}

impl VirtualDevice {
    /// Device reporting `hardware_id`, eight channels, ten rows per command
    pub fn new(hardware_id: &str) -> Self {
        let boot_lines = vec![
            "Initializing sensors".to_string(),
            format!("{}: {}", HARDWARE_ID_MARKER, hardware_id),
            READY_MARKER.to_string(),
        ];
        Self {
            inner: Arc::new(Mutex::new(DeviceState {
                hardware_id: hardware_id.to_string(),
                descriptor: "USB-SERIAL CH340".to_string(),
                boot_lines,
                channels: 8,
                rows: 10,
                row_interval: Duration::from_millis(10),
                send_sentinel: true,
                fault_after: None,
                response: None,
                outbox: VecDeque::new(),
                rx: None,
                received: Vec::new(),
                dtr: true,
                resets: 0,
                opens: 0,
                unplugged: false,
            })),
        }
    }

    /// Replace the boot output
    #[must_use]
    pub fn with_boot_lines(self, lines: Vec<String>) -> Self {
        self.inner.lock().boot_lines = lines;
        self
    }

    /// Vendor descriptor reported to port enumeration
    #[must_use]
    pub fn with_descriptor(self, descriptor: &str) -> Self {
        self.inner.lock().descriptor = descriptor.to_string();
        self
    }

    /// Number of measurement channels per data row
    #[must_use]
    pub fn with_channels(self, channels: usize) -> Self {
        self.inner.lock().channels = channels;
        self
    }

    /// Number of data rows per command
    #[must_use]
    pub fn with_rows(self, rows: usize) -> Self {
        self.inner.lock().rows = rows;
        self
    }

    /// Delay between data rows
    #[must_use]
    pub fn with_row_interval(self, interval: Duration) -> Self {
        self.inner.lock().row_interval = interval;
        self
    }

    /// Whether the sentinel follows the last row
    #[must_use]
    pub fn with_sentinel(self, send: bool) -> Self {
        self.inner.lock().send_sentinel = send;
        self
    }

    /// Fault the link in place of row `index`
    #[must_use]
    pub fn with_fault_after(self, index: usize) -> Self {
        self.inner.lock().fault_after = Some(index);
        self
    }

    /// Answer every command with a fixed script instead of generated rows
    #[must_use]
    pub fn with_response(self, script: Vec<ScriptStep>) -> Self {
        self.inner.lock().response = Some(script);
        self
    }

    /// Open a link, which reboots the board like a real USB serial open
    pub fn link(&self) -> SimLink {
        let mut state = self.inner.lock();
        state.opens += 1;
        state.boot();
        SimLink { device: self.clone() }
    }

    /// Hardware ID printed at boot
    pub fn hardware_id(&self) -> String {
        self.inner.lock().hardware_id.clone()
    }

    /// Vendor descriptor
    pub fn descriptor(&self) -> String {
        self.inner.lock().descriptor.clone()
    }

    /// Command lines written to the device
    pub fn received(&self) -> Vec<String> {
        self.inner.lock().received.clone()
    }

    /// Number of DTR reset pulses seen
    pub fn resets(&self) -> usize {
        self.inner.lock().resets
    }

    /// Number of times a link was opened
    pub fn opens(&self) -> usize {
        self.inner.lock().opens
    }

    /// Simulate pulling the USB cable
    pub fn unplug(&self) {
        self.inner.lock().unplugged = true;
    }

    /// Simulate plugging the cable back in
    pub fn replug(&self) {
        self.inner.lock().unplugged = false;
    }

    /// Scan-shaped data row: time, applied voltage, V/mA per channel, device id
    pub fn sweep_row(index: usize, channels: usize) -> String {
        let mut fields = vec![format!("{:.4}", index as f64 * 0.1), format!("{:.2}", index as f64 * 0.03)];
        for ch in 0..channels {
            fields.push(format!("{:.2}", 0.5 + ch as f64 * 0.01));
            fields.push(format!("{:.2}", index as f64 + ch as f64));
        }
        fields.push("0".to_string());
        fields.join(", ")
    }

    /// PNO-shaped data row: time, V/mA per channel, PCE per channel, device id
    pub fn pno_row(index: usize, channels: usize) -> String {
        let mut fields = vec![format!("{:.4}", index as f64 * 0.5)];
        for ch in 0..channels {
            fields.push(format!("{:.2}", 0.6 + ch as f64 * 0.01));
            fields.push(format!("{:.2}", 2.0 + index as f64));
        }
        for ch in 0..channels {
            fields.push(format!("{:.4}", 10.0 + ch as f64));
        }
        fields.push("0".to_string());
        fields.join(", ")
    }
}

enum ReadStep {
    Wait(Duration),
    Deliver(Duration, ScriptStep),
}

/// Link to a [`VirtualDevice`]
#[derive(Debug)]
pub struct SimLink {
    device: VirtualDevice,
}

#[async_trait]
impl DeviceLink for SimLink {
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let step = {
            let mut state = self.device.inner.lock();
            if state.unplugged {
                return Err(LinkError::Disconnected);
            }
            match state.outbox.front_mut() {
                Some(front) if front.delay() > timeout => {
                    *front.delay_mut() -= timeout;
                    ReadStep::Wait(timeout)
                }
                _ => match state.outbox.pop_front() {
                    Some(step) => ReadStep::Deliver(step.delay(), step),
                    None => ReadStep::Wait(timeout),
                },
            }
        };

        match step {
            ReadStep::Wait(d) => {
                tokio::time::sleep(d).await;
                Ok(None)
            }
            ReadStep::Deliver(d, ScriptStep::Line { text, .. }) => {
                tokio::time::sleep(d).await;
                Ok(Some(text))
            }
            ReadStep::Deliver(d, ScriptStep::Fault { .. }) => {
                tokio::time::sleep(d).await;
                self.device.inner.lock().unplugged = true;
                Err(LinkError::Disconnected)
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let mut state = self.device.inner.lock();
        if state.unplugged {
            return Err(LinkError::Disconnected);
        }
        state.receive(&String::from_utf8_lossy(data));
        Ok(())
    }

    async fn set_dtr(&mut self, level: bool) -> Result<(), LinkError> {
        let mut state = self.device.inner.lock();
        if state.unplugged {
            return Err(LinkError::Disconnected);
        }
        if level && !state.dtr {
            state.resets += 1;
            state.boot();
        }
        state.dtr = level;
        Ok(())
    }

    async fn clear_input(&mut self) -> Result<(), LinkError> {
        let mut state = self.device.inner.lock();
        while state.outbox.front().is_some_and(|s| s.delay().is_zero()) {
            state.outbox.pop_front();
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("virtual device {}", self.device.hardware_id())
    }
}

/// A bench of virtual devices addressed by port name
#[derive(Debug, Clone, Default)]
pub struct SimBench {
    devices: BTreeMap<String, VirtualDevice>,
}

impl SimBench {
    /// Empty bench
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device on `port`
    #[must_use]
    pub fn with_device(mut self, port: &str, device: VirtualDevice) -> Self {
        self.devices.insert(port.to_string(), device);
        self
    }

    /// Device attached on `port`
    pub fn device(&self, port: &str) -> Option<&VirtualDevice> {
        self.devices.get(port)
    }
}

#[async_trait]
impl LinkConnector for SimBench {
    async fn open(&self, port: &str, _baud_rate: u32) -> Result<Box<dyn DeviceLink>, LinkError> {
        let device = self
            .devices
            .get(port)
            .ok_or_else(|| LinkError::PortNotFound(port.to_string()))?;
        if device.inner.lock().unplugged {
            return Err(LinkError::PortNotFound(port.to_string()));
        }
        Ok(Box::new(device.link()))
    }
}

impl PortSource for SimBench {
    fn ports(&self) -> Result<Vec<DeviceDescriptor>, AcquisitionError> {
        Ok(self
            .devices
            .iter()
            .filter(|(_, d)| !d.inner.lock().unplugged)
            .map(|(port, d)| DeviceDescriptor::new(port, &d.descriptor()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_widths() {
        assert_eq!(VirtualDevice::sweep_row(0, 8).split(',').count(), 19);
        assert_eq!(VirtualDevice::pno_row(0, 8).split(',').count(), 26);
        assert_eq!(VirtualDevice::sweep_row(0, 4).split(',').count(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_and_command() {
        let device = VirtualDevice::new("AAA").with_rows(2);
        let mut link = device.link();
        let timeout = Duration::from_millis(50);

        assert_eq!(link.read_line(timeout).await.unwrap().unwrap(), "Initializing sensors");
        assert_eq!(link.read_line(timeout).await.unwrap().unwrap(), "HW_ID: AAA");
        assert_eq!(link.read_line(timeout).await.unwrap().unwrap(), "Arduino Ready");
        assert_eq!(link.read_line(timeout).await.unwrap(), None);

        link.write_all(b"\nscan,0,0,0,0,0\n<scan,1.2,0.03,").await.unwrap();
        assert!(device.received().is_empty());
        link.write_all(b"3,50,1>").await.unwrap();
        assert_eq!(device.received(), vec!["scan,1.2,0.03,3,50,1".to_string()]);

        let mut lines = Vec::new();
        while let Some(line) = link.read_line(timeout).await.unwrap() {
            lines.push(line);
        }
        assert_eq!(lines.first().map(String::as_str), Some(START_MARKER));
        assert_eq!(lines.last().map(String::as_str), Some(DONE_SENTINEL));
        assert_eq!(lines.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dtr_pulse_reboots() {
        let device = VirtualDevice::new("AAA");
        let mut link = device.link();
        link.clear_input().await.unwrap();
        assert_eq!(link.read_line(Duration::from_millis(10)).await.unwrap(), None);

        link.set_dtr(false).await.unwrap();
        link.set_dtr(true).await.unwrap();
        assert_eq!(device.resets(), 1);
        assert_eq!(link.read_line(Duration::from_millis(10)).await.unwrap().unwrap(), "Initializing sensors");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_disconnects() {
        let device = VirtualDevice::new("AAA").with_fault_after(1);
        let mut link = device.link();
        link.clear_input().await.unwrap();
        link.write_all(b"<PnO,0.5,0.01,5,300,60>").await.unwrap();

        let timeout = Duration::from_millis(50);
        let mut result = Ok(None);
        for _ in 0..10 {
            result = link.read_line(timeout).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(LinkError::Disconnected)));
    }

    #[tokio::test]
    async fn test_bench_ports_and_open() {
        let bench = SimBench::new()
            .with_device("COM3", VirtualDevice::new("AAA"))
            .with_device("COM4", VirtualDevice::new("BBB").with_descriptor("Bluetooth Link"));
        let ports = bench.ports().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].descriptor, "Bluetooth Link");

        assert!(bench.open("COM9", 115_200).await.is_err());
        bench.device("COM3").unwrap().unplug();
        assert!(bench.open("COM3", 115_200).await.is_err());
        assert_eq!(bench.ports().unwrap().len(), 1);
    }
}

//! Serial port transport implementation

use super::{DeviceLink, LinkConnector, LinkError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};

/// Serial link to one device, 8N1 without flow control
pub struct SerialLink {
    port_name: String,
    baud_rate: u32,
    reader: BufReader<SerialStream>,
    /// Bytes of a line that has not been terminated yet
    pending: Vec<u8>,
}

impl SerialLink {
    /// Open a serial port
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let stream = tokio_serial::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| match e.kind() {
                tokio_serial::ErrorKind::NoDevice => LinkError::PortNotFound(port_name.to_string()),
                tokio_serial::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    LinkError::PermissionDenied(port_name.to_string())
                }
                _ => LinkError::ConnectionFailed(e.to_string()),
            })?;

        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            reader: BufReader::new(stream),
            pending: Vec::with_capacity(256),
        })
    }

    fn take_line(&mut self) -> String {
        let raw = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&raw)
            .trim_end_matches(&['\r', '\n'][..])
            .to_string()
    }
}

#[async_trait]
impl DeviceLink for SerialLink {
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        // read_until keeps partial bytes in `pending` if the timeout fires
        match tokio::time::timeout(timeout, self.reader.read_until(b'\n', &mut self.pending)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(LinkError::Disconnected),
            Ok(Ok(_)) => Ok(Some(self.take_line())),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Ok(Err(e)) => Err(LinkError::Io(e)),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), LinkError> {
        let stream = self.reader.get_mut();
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn set_dtr(&mut self, level: bool) -> Result<(), LinkError> {
        self.reader
            .get_mut()
            .write_data_terminal_ready(level)
            .map_err(|e| LinkError::Io(e.into()))
    }

    async fn clear_input(&mut self) -> Result<(), LinkError> {
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);
        self.pending.clear();
        self.reader
            .get_mut()
            .clear(ClearBuffer::Input)
            .map_err(|e| LinkError::Io(e.into()))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port_name, self.baud_rate)
    }
}

/// Opens [`SerialLink`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

#[async_trait]
impl LinkConnector for SerialConnector {
    async fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn DeviceLink>, LinkError> {
        let link = SerialLink::open(port, baud_rate)?;
        Ok(Box::new(link))
    }
}

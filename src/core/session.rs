//! Device sessions
//!
//! A [`Session`] owns the link to one measurement board. It runs the boot
//! handshake, sends one command at a time, negotiates the column header from
//! the first data row and streams rows into a bounded buffer that is
//! periodically flushed to the run's output file.
//!
//! ```text
//! Idle -> Sending -> AwaitingStart -> Streaming <-> Flushing -> Done
//!            \             \              \
//!             +-------------+--------------+--> Cancelled | Failed
//! ```

use super::error::{AcquisitionError, AcquisitionResult};
use super::identity::{Identity, IdentityResolver};
use super::locator::DeviceDescriptor;
use super::logger::EventLog;
use super::protocol::{classify, DeviceLine, Header, MeasurementRow, Mode, RunRequest, DEFAULT_MIN_DATA_FIELDS};
use super::recorder::{available_path, output_file_name, Recorder};
use super::transport::{DeviceLink, LinkConnector, LinkError};
use chrono::Local;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, no command running
    Idle,
    /// Writing a command
    Sending,
    /// Waiting for the start marker or the first data row
    AwaitingStart,
    /// Receiving data rows
    Streaming,
    /// Writing buffered rows to disk
    Flushing,
    /// Last command ended with the sentinel
    Done,
    /// Last command was cancelled
    Cancelled,
    /// Link fault, needs a reconnect
    Failed,
    /// No link
    Disconnected,
}

impl SessionState {
    /// True while a command is in flight
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SessionState::Sending | SessionState::AwaitingStart | SessionState::Streaming | SessionState::Flushing
        )
    }
}

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Serial baud rate
    pub baud_rate: u32,
    /// Upper bound on a single read
    pub read_timeout: Duration,
    /// DTR low time of a reset pulse
    pub reset_settle: Duration,
    /// Flush period while streaming
    pub save_period: Duration,
    /// Flush as soon as this many rows are buffered
    pub max_buffered_rows: usize,
    /// Narrower lines are chatter
    pub min_data_fields: usize,
    /// Pulse the reset line when a run is cancelled
    pub reset_on_cancel: bool,
    /// Directory output files are created in
    pub data_dir: PathBuf,
    /// Optional trial label for file names
    pub trial_name: Option<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(1000),
            reset_settle: Duration::from_millis(100),
            save_period: Duration::from_secs(180),
            max_buffered_rows: 500,
            min_data_fields: DEFAULT_MIN_DATA_FIELDS,
            reset_on_cancel: true,
            data_dir: PathBuf::from("."),
            trial_name: None,
        }
    }
}

/// State shared between a session and whoever controls it.
///
/// Readable without the session lock, which a running worker holds.
#[derive(Debug)]
pub struct SessionControl {
    cancel: AtomicBool,
    state: RwLock<SessionState>,
}

impl Default for SessionControl {
    fn default() -> Self {
        Self {
            cancel: AtomicBool::new(false),
            state: RwLock::new(SessionState::Disconnected),
        }
    }
}

impl SessionControl {
    /// Ask the running command to stop
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Clear a previous cancel request before starting a command
    pub fn arm(&self) {
        self.cancel.store(false, Ordering::SeqCst);
    }

    /// True once [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }
}

/// How a run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Terminal sentinel received
    Sentinel,
    /// Cancel flag observed
    Cancelled,
}

/// Result of one command on one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Ended with the sentinel
    Completed {
        /// Rows persisted
        rows: usize,
        /// Output file
        path: PathBuf,
    },
    /// Cancelled; rows received before the cancel were persisted
    Cancelled {
        /// Rows persisted
        rows: usize,
        /// Output file, if anything was written
        path: Option<PathBuf>,
    },
    /// Link or disk failure
    Failed {
        /// Human readable cause
        reason: String,
    },
}

impl RunOutcome {
    /// Rows persisted by the run
    pub fn rows(&self) -> usize {
        match self {
            RunOutcome::Completed { rows, .. } | RunOutcome::Cancelled { rows, .. } => *rows,
            RunOutcome::Failed { .. } => 0,
        }
    }

    /// One-line description for summaries
    pub fn summary(&self) -> String {
        match self {
            RunOutcome::Completed { rows, path } => format!("completed, {} rows in {}", rows, path.display()),
            RunOutcome::Cancelled { rows, path: Some(path) } => {
                format!("cancelled, {} rows in {}", rows, path.display())
            }
            RunOutcome::Cancelled { path: None, .. } => "cancelled before any data".to_string(),
            RunOutcome::Failed { reason } => format!("failed: {}", reason),
        }
    }
}

/// One open connection to one device
pub struct Session {
    descriptor: DeviceDescriptor,
    connector: Arc<dyn LinkConnector>,
    resolver: IdentityResolver,
    options: SessionOptions,
    control: Arc<SessionControl>,
    link: Option<Box<dyn DeviceLink>>,
    mode: Option<Mode>,
    header: Option<Header>,
    buffer: Vec<MeasurementRow>,
    recorder: Option<Recorder>,
    last_flush: Instant,
    needs_handshake: bool,
    width_warned: bool,
    log: EventLog,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("descriptor", &self.descriptor)
            .field("state", &self.control.state())
            .field("mode", &self.mode)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Session {
    /// Create a disconnected session for `descriptor`
    pub fn new(
        descriptor: DeviceDescriptor,
        connector: Arc<dyn LinkConnector>,
        resolver: IdentityResolver,
        options: SessionOptions,
        log: EventLog,
    ) -> Self {
        let log = log.scoped(format!("session {}", descriptor.port));
        Self {
            descriptor,
            connector,
            resolver,
            options,
            control: Arc::new(SessionControl::default()),
            link: None,
            mode: None,
            header: None,
            buffer: Vec::new(),
            recorder: None,
            last_flush: Instant::now(),
            needs_handshake: false,
            width_warned: false,
            log,
        }
    }

    /// Port and identity
    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Logical ID, -1 until resolved
    pub fn logical_id(&self) -> i32 {
        self.descriptor.logical_id
    }

    /// Shared cancel flag and state
    pub fn control(&self) -> Arc<SessionControl> {
        Arc::clone(&self.control)
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.control.state()
    }

    /// Mode of the current or last command
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// Header negotiated for the current or last command
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    /// Rows waiting for the next flush
    pub fn buffered_rows(&self) -> usize {
        self.buffer.len()
    }

    /// Recorder of the current or last command
    pub fn recorder(&self) -> Option<&Recorder> {
        self.recorder.as_ref()
    }

    /// Output file of the current or last command
    pub fn output_path(&self) -> Option<&Path> {
        self.recorder.as_ref().map(Recorder::path)
    }

    /// True if a link is open
    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Open the link, reboot the board and resolve its identity
    pub async fn connect(&mut self) -> AcquisitionResult<Identity> {
        self.link = None;
        let port = self.descriptor.port.clone();
        self.log.info(format!("opening {} at {} baud", port, self.options.baud_rate));

        let mut link = self
            .connector
            .open(&port, self.options.baud_rate)
            .await
            .map_err(|source| AcquisitionError::ConnectionFailure {
                port: port.clone(),
                source,
            })?;

        let settle = self.options.reset_settle;
        let resolver = &self.resolver;
        let identity = async {
            pulse_reset(link.as_mut(), settle).await?;
            resolver.resolve(link.as_mut()).await
        }
        .await
        .map_err(|source| {
            self.control.set_state(SessionState::Disconnected);
            AcquisitionError::ConnectionFailure { port: port.clone(), source }
        })?;

        self.descriptor.hardware_id = Some(identity.hardware_id.clone());
        self.descriptor.logical_id = identity.logical_id;
        self.log = self.log.scoped(format!("device {}", identity.logical_id));
        self.log.info(format!("{} is {} (ID {})", port, identity.hardware_id, identity.logical_id));

        self.link = Some(link);
        self.needs_handshake = false;
        self.control.arm();
        self.control.set_state(SessionState::Idle);
        Ok(identity)
    }

    /// Close the link
    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            self.log.info("disconnected");
        }
        self.control.set_state(SessionState::Disconnected);
    }

    /// Close and reopen the link, clearing a failed state
    pub async fn reconnect(&mut self) -> AcquisitionResult<Identity> {
        let previous = self.descriptor.hardware_id.clone();
        self.disconnect();
        let identity = self.connect().await?;
        if previous.as_deref().is_some_and(|hw| hw != identity.hardware_id) {
            self.log.warn(format!(
                "hardware ID on {} changed from {} to {}",
                self.descriptor.port,
                previous.unwrap_or_default(),
                identity.hardware_id
            ));
        }
        Ok(identity)
    }

    /// Pulse the reset line to reboot the board
    pub async fn reset(&mut self) -> AcquisitionResult<()> {
        let settle = self.options.reset_settle;
        let link = self.link_mut()?;
        let result = pulse_reset(link, settle).await;
        result.map_err(|source| self.stream_error(source))?;
        self.needs_handshake = true;
        Ok(())
    }

    /// Request cancellation of the running command
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Write `request` and wait for the device to start streaming.
    ///
    /// Opens a new output file and negotiates the header from the first data
    /// row. Returns `Some` if the run ended before that row arrived.
    pub async fn send_command(&mut self, request: &RunRequest) -> AcquisitionResult<Option<StreamEnd>> {
        if self.state() == SessionState::Failed {
            return Err(AcquisitionError::SessionFailed(self.logical_id()));
        }
        let command = request
            .encode()
            .ok_or_else(|| AcquisitionError::InvalidParameters("STOP is not sent to devices".to_string()))?;
        self.link_mut()?;
        self.recorder = None;
        self.header = None;
        self.buffer.clear();

        if self.needs_handshake {
            self.log.debug("waiting for device to come back from reset");
            let control = Arc::clone(&self.control);
            let cancelled = move || control.is_cancelled();
            let handshake = match self.link.as_deref_mut() {
                Some(link) => self.resolver.handshake_unless(link, &cancelled).await,
                None => Err(LinkError::Disconnected),
            };
            let handshake = handshake.map_err(|source| AcquisitionError::ConnectionFailure {
                port: self.descriptor.port.clone(),
                source,
            })?;
            let Some(hardware_id) = handshake else {
                self.log.info("cancelled while the device was rebooting");
                self.control.set_state(SessionState::Cancelled);
                return Ok(Some(StreamEnd::Cancelled));
            };
            if self.descriptor.hardware_id.as_deref() != Some(hardware_id.as_str()) {
                self.log.warn(format!("device now reports hardware ID {}", hardware_id));
            }
            self.needs_handshake = false;
        }

        let started = Local::now();
        let name = output_file_name(&started, self.options.trial_name.as_deref(), self.logical_id(), request);
        let path = available_path(&self.options.data_dir, &name);
        self.recorder = Some(Recorder::new(path, request, &started));
        self.mode = Some(request.mode());
        self.width_warned = false;
        self.last_flush = Instant::now();

        self.control.set_state(SessionState::Sending);
        self.log.info(format!("sending {}", command.trim_end()));
        let link = self.link_mut()?;
        let written = async {
            link.clear_input().await?;
            link.write_all(command.as_bytes()).await
        }
        .await;
        written.map_err(|source| self.stream_error(source))?;

        self.control.set_state(SessionState::AwaitingStart);
        let mut started_marker = false;
        loop {
            if self.control.is_cancelled() {
                return self.abort().await.map(Some);
            }
            let Some(line) = self.next_line().await? else {
                continue;
            };
            match line {
                DeviceLine::Started if !started_marker => {
                    self.log.debug("measurement started");
                    started_marker = true;
                }
                DeviceLine::Data(row) if started_marker => {
                    let header = Header::negotiate(request.mode(), row.width());
                    self.log.debug(format!(
                        "negotiated {} columns ({} channels)",
                        header.width(),
                        header
                            .channels()
                            .map_or_else(|| "unknown".to_string(), |c| c.to_string())
                    ));
                    self.header = Some(header);
                    self.buffer.push(row);
                    self.control.set_state(SessionState::Streaming);
                    return Ok(None);
                }
                DeviceLine::Done => {
                    self.log.warn("device finished before sending any data");
                    self.finish()?;
                    return Ok(Some(StreamEnd::Sentinel));
                }
                DeviceLine::Chatter(text) if !text.is_empty() => self.log.debug(format!("device: {}", text)),
                _ => {}
            }
        }
    }

    /// Receive rows until the sentinel or a cancel request
    pub async fn stream(&mut self) -> AcquisitionResult<StreamEnd> {
        loop {
            if self.control.is_cancelled() {
                return self.abort().await;
            }
            if self.last_flush.elapsed() >= self.options.save_period {
                self.flush()?;
            }

            let Some(line) = self.next_line().await? else {
                continue;
            };
            match line {
                DeviceLine::Data(row) => {
                    let expected = self.header.as_ref().map_or(row.width(), Header::width);
                    if row.width() != expected && !self.width_warned {
                        self.log.warn(format!("row has {} fields, header has {}", row.width(), expected));
                        self.width_warned = true;
                    }
                    self.buffer.push(row);
                    if self.buffer.len() >= self.options.max_buffered_rows {
                        self.flush()?;
                    }
                }
                DeviceLine::Done => {
                    self.finish()?;
                    return Ok(StreamEnd::Sentinel);
                }
                DeviceLine::Chatter(text) if !text.is_empty() => self.log.debug(format!("device: {}", text)),
                _ => {}
            }
        }
    }

    /// Run one command to completion.
    ///
    /// The cancel flag is not cleared here; callers arm it before starting.
    pub async fn execute(&mut self, request: &RunRequest) -> RunOutcome {
        let result = match self.send_command(request).await {
            Ok(Some(end)) => Ok(end),
            Ok(None) => self.stream().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(end) => {
                let rows = self.recorder.as_ref().map_or(0, Recorder::rows_written);
                let path = self
                    .recorder
                    .as_ref()
                    .filter(|r| r.path().exists())
                    .map(|r| r.path().to_path_buf());
                match (end, path) {
                    (StreamEnd::Sentinel, Some(path)) => {
                        self.log.info(format!("run complete, {} rows", rows));
                        RunOutcome::Completed { rows, path }
                    }
                    (StreamEnd::Sentinel, None) => RunOutcome::Failed {
                        reason: "no output file was written".to_string(),
                    },
                    (StreamEnd::Cancelled, path) => {
                        self.log.info(format!("run cancelled after {} rows", rows));
                        RunOutcome::Cancelled { rows, path }
                    }
                }
            }
            Err(e) => {
                self.log.error(e.to_string());
                if matches!(e, AcquisitionError::StreamIoFailure { .. }) {
                    if let Err(flush_err) = self.flush() {
                        self.log.error(format!("could not save buffered rows: {}", flush_err));
                    }
                    self.link = None;
                }
                if !matches!(e, AcquisitionError::InvalidParameters(_) | AcquisitionError::SessionFailed(_)) {
                    self.control.set_state(SessionState::Failed);
                }
                RunOutcome::Failed { reason: e.to_string() }
            }
        }
    }

    /// Write buffered rows, creating the file on first use.
    ///
    /// Nothing is written before the header is known unless the run has ended.
    fn flush(&mut self) -> AcquisitionResult<usize> {
        self.last_flush = Instant::now();
        let Some(header) = self.header.clone() else {
            return Ok(0);
        };
        self.write_buffer(&header)
    }

    fn write_buffer(&mut self, header: &Header) -> AcquisitionResult<usize> {
        let Some(recorder) = self.recorder.as_mut() else {
            return Ok(0);
        };
        let previous = self.control.state();
        self.control.set_state(SessionState::Flushing);
        let written = recorder.flush(header, &mut self.buffer);
        self.control.set_state(previous);
        let written = written?;
        if written > 0 {
            self.log.debug(format!("saved {} rows to {}", written, recorder.path().display()));
        }
        Ok(written)
    }

    /// Sentinel received: final flush, falling back to the default header
    fn finish(&mut self) -> AcquisitionResult<()> {
        let header = match (&self.header, self.mode) {
            (Some(header), _) => header.clone(),
            (None, Some(mode)) => Header::fallback(mode),
            (None, None) => return Ok(()),
        };
        self.write_buffer(&header)?;
        self.control.set_state(SessionState::Done);
        Ok(())
    }

    /// Cancel observed: save what arrived, then stop the firmware
    async fn abort(&mut self) -> AcquisitionResult<StreamEnd> {
        self.flush()?;
        if self.options.reset_on_cancel {
            if let Some(link) = self.link.as_deref_mut() {
                pulse_reset(link, self.options.reset_settle)
                    .await
                    .map_err(|source| AcquisitionError::StreamIoFailure {
                        logical_id: self.descriptor.logical_id,
                        source,
                    })?;
                self.needs_handshake = true;
            }
        }
        self.control.set_state(SessionState::Cancelled);
        Ok(StreamEnd::Cancelled)
    }

    /// One classified line, `None` if the read timed out
    async fn next_line(&mut self) -> AcquisitionResult<Option<DeviceLine>> {
        let timeout = self.options.read_timeout;
        let min_fields = self.options.min_data_fields;
        let link = self.link_mut()?;
        match link.read_line(timeout).await {
            Ok(line) => Ok(line.map(|l| classify(&l, min_fields))),
            Err(source) => Err(self.stream_error(source)),
        }
    }

    fn link_mut(&mut self) -> AcquisitionResult<&mut (dyn DeviceLink + 'static)> {
        match self.link.as_deref_mut() {
            Some(link) => Ok(link),
            None => Err(AcquisitionError::ConnectionFailure {
                port: self.descriptor.port.clone(),
                source: LinkError::Disconnected,
            }),
        }
    }

    fn stream_error(&self, source: LinkError) -> AcquisitionError {
        AcquisitionError::StreamIoFailure {
            logical_id: self.descriptor.logical_id,
            source,
        }
    }
}

/// DTR low, settle, DTR high; the board reboots on the rising edge
async fn pulse_reset(link: &mut dyn DeviceLink, settle: Duration) -> Result<(), LinkError> {
    link.set_dtr(false).await?;
    tokio::time::sleep(settle).await;
    link.set_dtr(true).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::IdentityTable;
    use crate::core::protocol::{DONE_SENTINEL, START_MARKER};
    use crate::core::simulator::{ScriptStep, SimBench, VirtualDevice};

    fn options(dir: &Path) -> SessionOptions {
        SessionOptions {
            read_timeout: Duration::from_millis(50),
            data_dir: dir.to_path_buf(),
            ..SessionOptions::default()
        }
    }

    async fn connected(device: &VirtualDevice, options: SessionOptions) -> Session {
        let bench = SimBench::new().with_device("COM3", device.clone());
        let resolver = IdentityResolver::new(
            IdentityTable::from_pairs([("AAA", 0)]),
            Duration::from_secs(2),
            options.read_timeout,
            EventLog::default(),
        );
        let mut session = Session::new(
            DeviceDescriptor::new("COM3", "USB-SERIAL CH340"),
            Arc::new(bench),
            resolver,
            options,
            EventLog::default(),
        );
        session.connect().await.unwrap();
        session
    }

    fn data_rows(path: &Path, request: &RunRequest) -> (String, Vec<String>) {
        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines().skip(request.metadata().len() + 1);
        let header = lines.next().unwrap().to_string();
        (header, lines.map(str::to_string).collect())
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_resets_and_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA");
        let session = connected(&device, options(dir.path())).await;

        assert_eq!(device.resets(), 1);
        assert_eq!(session.logical_id(), 0);
        assert_eq!(session.descriptor().hardware_id.as_deref(), Some("AAA"));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_to_missing_port() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = IdentityResolver::new(
            IdentityTable::new(),
            Duration::from_secs(1),
            Duration::from_millis(50),
            EventLog::default(),
        );
        let mut session = Session::new(
            DeviceDescriptor::new("COM9", "Arduino"),
            Arc::new(SimBench::new()),
            resolver,
            options(dir.path()),
            EventLog::default(),
        );
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, AcquisitionError::ConnectionFailure { .. }));
        assert!(!session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA").with_rows(5);
        let mut session = connected(&device, options(dir.path())).await;

        let request = RunRequest::scan(1.2, 0.03, 3, 50, true);
        let outcome = session.execute(&request).await;
        let RunOutcome::Completed { rows, path } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };

        assert_eq!(rows, 5);
        assert_eq!(device.received(), vec!["scan,1.2,0.03,3,50,1".to_string()]);
        let (header, data) = data_rows(&path, &request);
        assert_eq!(header.split(',').count(), 19);
        assert!(header.starts_with("Time,Voltage_Applied,Pixel_1 V,Pixel_1 mA"));
        assert_eq!(data.len(), 5);
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.buffered_rows(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_runs_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA").with_rows(2);
        let mut session = connected(&device, options(dir.path())).await;

        let request = RunRequest::pno(0.5, 0.01, 5, 300, 60);
        let first = session.execute(&request).await;
        let second = session.execute(&request).await;
        let (RunOutcome::Completed { path: a, .. }, RunOutcome::Completed { path: b, .. }) = (first, second) else {
            panic!("both runs should complete");
        };

        assert_ne!(a, b);
        for path in [&a, &b] {
            let (header, data) = data_rows(path, &request);
            assert!(header.starts_with("Time,"));
            assert_eq!(data.len(), 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_row_cap_flushes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA").with_rows(10);
        let mut session = connected(
            &device,
            SessionOptions {
                max_buffered_rows: 3,
                ..options(dir.path())
            },
        )
        .await;

        let request = RunRequest::pno(0.5, 0.01, 5, 300, 60);
        let outcome = session.execute(&request).await;
        assert_eq!(outcome.rows(), 10);
        assert!(session.recorder().unwrap().flushes() >= 4);

        let (_, data) = data_rows(session.output_path().unwrap(), &request);
        let times: Vec<f64> = data
            .iter()
            .map(|r| r.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(times.len(), 10);
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_period_flushes_mid_stream() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA")
            .with_rows(12)
            .with_row_interval(Duration::from_millis(100));
        let mut session = connected(
            &device,
            SessionOptions {
                save_period: Duration::from_millis(250),
                ..options(dir.path())
            },
        )
        .await;

        let request = RunRequest::scan(1.0, 0.1, 1, 10, false);
        let worker = {
            let request = request.clone();
            tokio::spawn(async move {
                let outcome = session.execute(&request).await;
                (session, outcome)
            })
        };

        // rows arrive every 100 ms and are saved every 250 ms; look between saves
        tokio::time::sleep(Duration::from_millis(650)).await;
        let files: Vec<PathBuf> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);
        let (_, saved) = data_rows(&files[0], &request);
        assert!((3..=5).contains(&saved.len()), "saved {} rows", saved.len());

        let (session, outcome) = worker.await.unwrap();
        assert_eq!(outcome.rows(), 12);
        assert_eq!(session.buffered_rows(), 0);
        assert!(session.recorder().unwrap().flushes() >= 4);

        let (_, all) = data_rows(&files[0], &request);
        assert_eq!(all.len(), 12);
        assert_eq!(&all[..saved.len()], &saved[..]);
        let times: Vec<f64> = all
            .iter()
            .map(|r| r.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_slow_read() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA").with_response(vec![
            ScriptStep::line(START_MARKER),
            ScriptStep::line(VirtualDevice::sweep_row(0, 8)),
            ScriptStep::line(VirtualDevice::sweep_row(1, 8)),
            ScriptStep::line_after(Duration::from_secs(10), VirtualDevice::sweep_row(2, 8)),
            ScriptStep::line(DONE_SENTINEL),
        ]);
        let mut session = connected(&device, options(dir.path())).await;

        let control = session.control();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            control.cancel();
        });

        let request = RunRequest::scan(1.2, 0.03, 3, 50, true);
        let begin = Instant::now();
        let outcome = session.execute(&request).await;
        let elapsed = begin.elapsed();

        let RunOutcome::Cancelled { rows, path: Some(path) } = outcome else {
            panic!("unexpected outcome {:?}", outcome);
        };
        assert_eq!(rows, 2);
        assert!(elapsed < Duration::from_secs(1) + Duration::from_millis(50) + Duration::from_millis(150));
        assert_eq!(data_rows(&path, &request).1.len(), 2);
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(device.resets(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_after_cancel_waits_for_ready() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA")
            .with_rows(20)
            .with_row_interval(Duration::from_millis(100));
        let mut session = connected(&device, options(dir.path())).await;

        let control = session.control();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(450)).await;
            control.cancel();
        });
        let first = session.execute(&RunRequest::constant_voltage(0.8)).await;
        assert!(matches!(first, RunOutcome::Cancelled { .. }));

        session.control().arm();
        let second = session.execute(&RunRequest::constant_voltage(0.8)).await;
        assert!(matches!(second, RunOutcome::Completed { rows: 20, .. }));
        assert_eq!(device.received().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_device_reboots() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA")
            .with_rows(20)
            .with_row_interval(Duration::from_millis(100));
        let mut session = connected(&device, options(dir.path())).await;
        // from now on the board never reports ready after a reset
        let _ = device.clone().with_boot_lines(vec!["Initializing sensors".to_string()]);

        let control = session.control();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(450)).await;
            control.cancel();
        });
        let first = session.execute(&RunRequest::scan(1.2, 0.03, 3, 50, true)).await;
        assert!(matches!(first, RunOutcome::Cancelled { .. }));

        let control = session.control();
        control.arm();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            control.cancel();
        });
        let begin = Instant::now();
        let second = session.execute(&RunRequest::scan(1.2, 0.03, 3, 50, true)).await;

        assert!(begin.elapsed() < Duration::from_millis(300));
        assert!(matches!(second, RunOutcome::Cancelled { rows: 0, path: None }));
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(device.received().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fault_keeps_received_rows() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA").with_rows(10).with_fault_after(3);
        let mut session = connected(&device, options(dir.path())).await;

        let request = RunRequest::scan(1.2, 0.03, 3, 50, false);
        let outcome = session.execute(&request).await;
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.is_connected());
        assert_eq!(data_rows(session.output_path().unwrap(), &request).1.len(), 3);

        let err = session.send_command(&request).await.unwrap_err();
        assert!(matches!(err, AcquisitionError::SessionFailed(0)));

        device.replug();
        session.reconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_before_data_uses_fallback_header() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA")
            .with_response(vec![ScriptStep::line(START_MARKER), ScriptStep::line(DONE_SENTINEL)]);
        let mut session = connected(&device, options(dir.path())).await;

        let request = RunRequest::pno(0.5, 0.01, 5, 300, 60);
        let RunOutcome::Completed { rows, path } = session.execute(&request).await else {
            panic!("expected completion");
        };
        assert_eq!(rows, 0);
        let (header, data) = data_rows(&path, &request);
        assert_eq!(header, Header::fallback(Mode::Pno).columns().join(","));
        assert!(data.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_not_sent() {
        let dir = tempfile::tempdir().unwrap();
        let device = VirtualDevice::new("AAA");
        let mut session = connected(&device, options(dir.path())).await;
        let outcome = session.execute(&RunRequest::stop()).await;
        assert!(matches!(outcome, RunOutcome::Failed { .. }));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(device.received().is_empty());
    }
}

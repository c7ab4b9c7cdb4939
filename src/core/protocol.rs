//! Command protocol shared by every session
//!
//! Requests are a mode keyword followed by the mode's parameters, joined with
//! commas and wrapped in start and end markers:
//!
//! ```text
//! <scan,1.2,0.03,3,50,1>
//! <PnO,0.5,0.01,5,300,60>
//! <constantVoltage,0.8,0.1,1,0,0>
//! ```
//!
//! The firmware ignores every byte outside a `<` ... `>` pair. Bare
//! newline-terminated requests are not produced here.
//!
//! Responses are newline-terminated. Control lines carry human-readable
//! markers; data lines are comma-separated and their width depends on how
//! many measurement channels the device reports.

use super::error::{AcquisitionError, AcquisitionResult};
use std::fmt;
use std::str::FromStr;

/// Version of the request/response framing written into output metadata
pub const PROTOCOL_VERSION: &str = "2";
/// Marker on the handshake line carrying the hardware ID
pub const HARDWARE_ID_MARKER: &str = "HW_ID";
/// Marker printed once the firmware finished booting
pub const READY_MARKER: &str = "Arduino Ready";
/// Marker printed once a command was accepted
pub const START_MARKER: &str = "Measurement Started";
/// Terminal sentinel ending a command
pub const DONE_SENTINEL: &str = "Done!";
/// Field delimiter on requests and data lines
pub const FIELD_DELIMITER: char = ',';
/// Opens a request
pub const REQUEST_START: char = '<';
/// Closes a request
pub const REQUEST_END: char = '>';
/// Lines narrower than this are chatter, not data
pub const DEFAULT_MIN_DATA_FIELDS: usize = 14;
/// Channel count assumed when a run ends before any data line
pub const DEFAULT_CHANNELS: usize = 8;

/// Device-side measurement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Voltage sweep
    Scan,
    /// Perturb-and-observe maximum power point tracking
    Pno,
    /// Hold a fixed voltage
    ConstantVoltage,
    /// Cancel whatever is running, start nothing
    Stop,
}

impl Mode {
    /// Keyword sent as the first request field
    pub fn keyword(&self) -> Option<&'static str> {
        match self {
            Self::Scan => Some("scan"),
            Self::Pno => Some("PnO"),
            Self::ConstantVoltage => Some("constantVoltage"),
            Self::Stop => None,
        }
    }

    /// Parameter and header schema, `None` for STOP
    pub fn schema(&self) -> Option<&'static ModeSchema> {
        match self {
            Self::Scan => Some(&SCAN_SCHEMA),
            Self::Pno => Some(&PNO_SCHEMA),
            Self::ConstantVoltage => Some(&CONSTANT_VOLTAGE_SCHEMA),
            Self::Stop => None,
        }
    }

    /// Name used in logs and summaries
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan => "SCAN",
            Self::Pno => "PNO",
            Self::ConstantVoltage => "CONSTANT_VOLTAGE",
            Self::Stop => "STOP",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = AcquisitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").replace(' ', "_").as_str() {
            "scan" => Ok(Self::Scan),
            "pno" | "mppt" => Ok(Self::Pno),
            "constant_voltage" | "constantvoltage" | "constant" => Ok(Self::ConstantVoltage),
            "stop" => Ok(Self::Stop),
            other => Err(AcquisitionError::InvalidParameters(format!("unknown mode '{}'", other))),
        }
    }
}

/// How a parameter is parsed and validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Decimal number
    Float,
    /// Whole number
    Int,
    /// `0` or `1`
    Flag,
}

/// One request parameter
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    /// Label used in the output file's metadata block
    pub label: &'static str,
    /// Value type
    pub kind: ParamKind,
}

const fn param(label: &'static str, kind: ParamKind) -> ParamSpec {
    ParamSpec { label, kind }
}

/// Column layout of a mode's data lines
///
/// A line is `leading` columns, then each group in `channel_groups` repeated
/// once per channel, then `trailing` columns.
#[derive(Debug, Clone, Copy)]
pub struct HeaderLayout {
    /// Columns before the per-channel blocks
    pub leading: &'static [&'static str],
    /// Per-channel column suffixes, one block per group
    pub channel_groups: &'static [&'static [&'static str]],
    /// Columns after the per-channel blocks
    pub trailing: &'static [&'static str],
}

impl HeaderLayout {
    fn columns_per_channel(&self) -> usize {
        self.channel_groups.iter().map(|g| g.len()).sum()
    }

    /// Channel count implied by a data line width, if it fits this layout
    pub fn channels_for_width(&self, width: usize) -> Option<usize> {
        let fixed = self.leading.len() + self.trailing.len();
        let per_channel = self.columns_per_channel();
        if per_channel == 0 || width <= fixed || (width - fixed) % per_channel != 0 {
            return None;
        }
        Some((width - fixed) / per_channel)
    }

    /// Column names for a channel count
    pub fn columns(&self, channels: usize) -> Vec<String> {
        let mut columns: Vec<String> = self.leading.iter().map(|s| (*s).to_string()).collect();
        for group in self.channel_groups {
            for channel in 1..=channels {
                for suffix in *group {
                    columns.push(format!("Pixel_{} {}", channel, suffix));
                }
            }
        }
        columns.extend(self.trailing.iter().map(|s| (*s).to_string()));
        columns
    }
}

/// Everything mode-specific, held as data
#[derive(Debug)]
pub struct ModeSchema {
    /// Parameters in wire order
    pub params: &'static [ParamSpec],
    /// Response column layout
    pub header: HeaderLayout,
    /// Output file name suffix
    pub file_suffix: &'static str,
    /// Whether the file name carries a light/dark tag
    pub tags_light: bool,
}

const SWEEP_HEADER: HeaderLayout = HeaderLayout {
    leading: &["Time", "Voltage_Applied"],
    channel_groups: &[&["V", "mA"]],
    trailing: &["DeviceID"],
};

const SWEEP_PARAMS: &[ParamSpec] = &[
    param("Scan Range (V)", ParamKind::Float),
    param("Scan Step Size (V)", ParamKind::Float),
    param("Scan Read Count", ParamKind::Int),
    param("Scan Rate (mV/s)", ParamKind::Int),
    param("Scan Mode", ParamKind::Flag),
];

/// SCAN schema
pub static SCAN_SCHEMA: ModeSchema = ModeSchema {
    params: SWEEP_PARAMS,
    header: SWEEP_HEADER,
    file_suffix: "scan.csv",
    tags_light: true,
};

/// PNO schema
pub static PNO_SCHEMA: ModeSchema = ModeSchema {
    params: &[
        param("Starting Voltage (V)", ParamKind::Float),
        param("Step Size (V)", ParamKind::Float),
        param("Measurements Per Step", ParamKind::Int),
        param("Measurement Delay (ms)", ParamKind::Int),
        param("Measurement Time", ParamKind::Int),
    ],
    header: HeaderLayout {
        leading: &["Time"],
        channel_groups: &[&["V", "mA"], &["PCE"]],
        trailing: &["DeviceID"],
    },
    file_suffix: "PnO.csv",
    tags_light: false,
};

/// CONSTANT_VOLTAGE schema, as seen on the wire after expansion
pub static CONSTANT_VOLTAGE_SCHEMA: ModeSchema = ModeSchema {
    params: SWEEP_PARAMS,
    header: SWEEP_HEADER,
    file_suffix: "constant_voltage.csv",
    tags_light: true,
};

/// Operator-facing parameters of CONSTANT_VOLTAGE before expansion
pub const CONSTANT_VOLTAGE_INPUT: &[ParamSpec] = &[param("Constant Voltage (V)", ParamKind::Float)];

/// Scan-shaped defaults appended to a constant-voltage request
const CONSTANT_VOLTAGE_DEFAULTS: [&str; 4] = ["0.1", "1", "0", "0"];

fn validate(kind: ParamKind, label: &str, value: &str) -> AcquisitionResult<()> {
    let ok = match kind {
        ParamKind::Float => value.parse::<f64>().map(f64::is_finite).unwrap_or(false),
        ParamKind::Int => value.parse::<i64>().is_ok(),
        ParamKind::Flag => matches!(value, "0" | "1"),
    };
    if ok {
        Ok(())
    } else {
        Err(AcquisitionError::InvalidParameters(format!(
            "{} expects {:?}, got '{}'",
            label, kind, value
        )))
    }
}

/// A validated command for one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    mode: Mode,
    params: Vec<String>,
}

impl RunRequest {
    /// Validate `params` against the mode's schema.
    ///
    /// CONSTANT_VOLTAGE takes a single voltage and is expanded to Scan-shaped
    /// parameters here.
    pub fn new<S: AsRef<str>>(mode: Mode, params: &[S]) -> AcquisitionResult<Self> {
        let params: Vec<String> = params.iter().map(|p| p.as_ref().trim().to_string()).collect();

        let expected: &[ParamSpec] = match mode {
            Mode::Stop => &[],
            Mode::ConstantVoltage => CONSTANT_VOLTAGE_INPUT,
            Mode::Scan | Mode::Pno => mode.schema().map(|s| s.params).unwrap_or(&[]),
        };

        if params.len() != expected.len() {
            return Err(AcquisitionError::InvalidParameters(format!(
                "{} takes {} parameters, got {}",
                mode,
                expected.len(),
                params.len()
            )));
        }
        for (spec, value) in expected.iter().zip(&params) {
            validate(spec.kind, spec.label, value)?;
        }

        let params = if mode == Mode::ConstantVoltage {
            let mut expanded = params;
            expanded.extend(CONSTANT_VOLTAGE_DEFAULTS.iter().map(|s| (*s).to_string()));
            expanded
        } else {
            params
        };

        Ok(Self { mode, params })
    }

    /// SCAN request
    pub fn scan(range_v: f32, step_v: f32, reads_per_step: u32, rate_mv_s: u32, light: bool) -> Self {
        Self {
            mode: Mode::Scan,
            params: vec![
                range_v.to_string(),
                step_v.to_string(),
                reads_per_step.to_string(),
                rate_mv_s.to_string(),
                u8::from(light).to_string(),
            ],
        }
    }

    /// PNO request
    pub fn pno(start_v: f32, step_v: f32, measurements_per_step: u32, delay_ms: u32, total_time: u32) -> Self {
        Self {
            mode: Mode::Pno,
            params: vec![
                start_v.to_string(),
                step_v.to_string(),
                measurements_per_step.to_string(),
                delay_ms.to_string(),
                total_time.to_string(),
            ],
        }
    }

    /// CONSTANT_VOLTAGE request, expanded to Scan-shaped parameters
    pub fn constant_voltage(voltage_v: f32) -> Self {
        let mut params = vec![voltage_v.to_string()];
        params.extend(CONSTANT_VOLTAGE_DEFAULTS.iter().map(|s| (*s).to_string()));
        Self {
            mode: Mode::ConstantVoltage,
            params,
        }
    }

    /// STOP request
    pub fn stop() -> Self {
        Self {
            mode: Mode::Stop,
            params: Vec::new(),
        }
    }

    /// Mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Parameters as sent on the wire
    pub fn params(&self) -> &[String] {
        &self.params
    }

    /// Light flag of Scan-shaped requests
    pub fn light(&self) -> Option<bool> {
        match self.mode {
            Mode::Scan | Mode::ConstantVoltage => self.params.get(4).map(|v| v == "1"),
            Mode::Pno | Mode::Stop => None,
        }
    }

    /// Encoded request line, `None` for STOP
    pub fn encode(&self) -> Option<String> {
        let keyword = self.mode.keyword()?;
        let mut line = String::new();
        line.push(REQUEST_START);
        line.push_str(keyword);
        for p in &self.params {
            line.push(FIELD_DELIMITER);
            line.push_str(p);
        }
        line.push(REQUEST_END);
        Some(line)
    }

    /// `label, value` pairs for the output file's metadata block
    pub fn metadata(&self) -> Vec<(String, String)> {
        let Some(schema) = self.mode.schema() else {
            return Vec::new();
        };
        let mut rows: Vec<(String, String)> = schema
            .params
            .iter()
            .zip(&self.params)
            .map(|(spec, value)| (spec.label.to_string(), value.clone()))
            .collect();
        rows.push(("Mode".to_string(), self.mode.name().to_string()));
        rows.push(("Protocol Version".to_string(), PROTOCOL_VERSION.to_string()));
        rows
    }
}

/// One accepted data line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementRow(Vec<String>);

impl MeasurementRow {
    /// Fields in line order
    pub fn fields(&self) -> &[String] {
        &self.0
    }

    /// Number of fields
    pub fn width(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<String>> for MeasurementRow {
    fn from(fields: Vec<String>) -> Self {
        Self(fields)
    }
}

/// A classified response line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceLine {
    /// Handshake line with the hardware ID
    HardwareId(String),
    /// Firmware finished booting
    Ready,
    /// Command accepted
    Started,
    /// Terminal sentinel
    Done,
    /// Data row at least `min_fields` wide
    Data(MeasurementRow),
    /// Anything else
    Chatter(String),
}

/// Classify one response line
pub fn classify(line: &str, min_fields: usize) -> DeviceLine {
    let line = line.trim();

    if line == DONE_SENTINEL {
        return DeviceLine::Done;
    }
    if line.contains(HARDWARE_ID_MARKER) {
        if let Some(id) = line.rsplit(':').next().map(str::trim) {
            if !id.is_empty() && id != line {
                return DeviceLine::HardwareId(id.to_string());
            }
        }
        return DeviceLine::Chatter(line.to_string());
    }
    if line.contains(READY_MARKER) {
        return DeviceLine::Ready;
    }
    if line.contains(START_MARKER) {
        return DeviceLine::Started;
    }

    let fields: Vec<String> = line.split(FIELD_DELIMITER).map(|f| f.trim().to_string()).collect();
    if fields.len() >= min_fields {
        DeviceLine::Data(MeasurementRow(fields))
    } else {
        DeviceLine::Chatter(line.to_string())
    }
}

/// Column names negotiated for one run
///
/// Produced once, from the first data line after the start marker, and never
/// changed for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    columns: Vec<String>,
    channels: Option<usize>,
}

impl Header {
    /// Derive the header from the width of the first data line
    pub fn negotiate(mode: Mode, width: usize) -> Self {
        let layout = mode.schema().map(|s| s.header);
        match layout.and_then(|l| l.channels_for_width(width).map(|n| (l, n))) {
            Some((layout, channels)) => Self {
                columns: layout.columns(channels),
                channels: Some(channels),
            },
            None => Self {
                columns: (1..=width).map(|k| format!("Field_{}", k)).collect(),
                channels: None,
            },
        }
    }

    /// Header used when a run ends before any data line arrived
    pub fn fallback(mode: Mode) -> Self {
        match mode.schema() {
            Some(schema) => Self {
                columns: schema.header.columns(DEFAULT_CHANNELS),
                channels: Some(DEFAULT_CHANNELS),
            },
            None => Self {
                columns: Vec::new(),
                channels: None,
            },
        }
    }

    /// Column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of columns
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Measurement channels, if the width matched the mode's layout
    pub fn channels(&self) -> Option<usize> {
        self.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scan() {
        let request = RunRequest::new(Mode::Scan, &["1.2", "0.03", "3", "50", "1"]).unwrap();
        assert_eq!(request.encode().unwrap(), "<scan,1.2,0.03,3,50,1>");
        assert_eq!(request.light(), Some(true));
    }

    #[test]
    fn test_constant_voltage_expands_to_scan_shape() {
        let request = RunRequest::new(Mode::ConstantVoltage, &["0.8"]).unwrap();
        assert_eq!(request.params(), &["0.8", "0.1", "1", "0", "0"]);
        assert_eq!(request.encode().unwrap(), "<constantVoltage,0.8,0.1,1,0,0>");
        assert_eq!(request.light(), Some(false));
        assert_eq!(RunRequest::constant_voltage(0.8), request);
    }

    #[test]
    fn test_stop_encodes_nothing() {
        let request = RunRequest::new::<&str>(Mode::Stop, &[]).unwrap();
        assert!(request.encode().is_none());
        assert!(request.metadata().is_empty());
    }

    #[test]
    fn test_rejects_bad_parameters() {
        assert!(RunRequest::new(Mode::Scan, &["1.2", "0.03", "3", "50"]).is_err());
        assert!(RunRequest::new(Mode::Scan, &["1.2", "0.03", "3", "50", "2"]).is_err());
        assert!(RunRequest::new(Mode::Pno, &["x", "0.01", "5", "300", "60"]).is_err());
        assert!(RunRequest::new(Mode::Pno, &["0.5", "0.01", "5.5", "300", "60"]).is_err());
    }

    #[test]
    fn test_metadata_labels_follow_schema() {
        let request = RunRequest::pno(0.5, 0.01, 5, 300, 60);
        let metadata = request.metadata();
        assert_eq!(metadata[0], ("Starting Voltage (V)".to_string(), "0.5".to_string()));
        assert_eq!(metadata[4].0, "Measurement Time");
        assert!(metadata.iter().any(|(k, v)| k == "Mode" && v == "PNO"));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("scan".parse::<Mode>().unwrap(), Mode::Scan);
        assert_eq!("constant-voltage".parse::<Mode>().unwrap(), Mode::ConstantVoltage);
        assert_eq!("PNO".parse::<Mode>().unwrap(), Mode::Pno);
        assert!("sweep".parse::<Mode>().is_err());
    }

    #[test]
    fn test_classify_control_lines() {
        assert_eq!(classify("HW_ID: 7513131393235191E0E1\r", 14), DeviceLine::HardwareId("7513131393235191E0E1".into()));
        assert_eq!(classify("Arduino Ready", 14), DeviceLine::Ready);
        assert_eq!(classify("Measurement Started", 14), DeviceLine::Started);
        assert_eq!(classify("Done!", 14), DeviceLine::Done);
        assert!(matches!(classify("HW_ID", 14), DeviceLine::Chatter(_)));
        assert!(matches!(classify("Val1: 1.20, Val2: 0.03", 14), DeviceLine::Chatter(_)));
    }

    #[test]
    fn test_classify_data_width() {
        let narrow = vec!["1"; 13].join(",");
        assert!(matches!(classify(&narrow, 14), DeviceLine::Chatter(_)));

        let wide = vec!["1"; 19].join(", ");
        match classify(&wide, 14) {
            DeviceLine::Data(row) => {
                assert_eq!(row.width(), 19);
                assert_eq!(row.fields()[0], "1");
            }
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_negotiate_scan_header() {
        let header = Header::negotiate(Mode::Scan, 19);
        assert_eq!(header.channels(), Some(8));
        assert_eq!(header.width(), 19);
        assert_eq!(header.columns()[2], "Pixel_1 V");
        assert_eq!(header.columns()[3], "Pixel_1 mA");
        assert_eq!(header.columns()[18], "DeviceID");
    }

    #[test]
    fn test_negotiate_pno_header() {
        let header = Header::negotiate(Mode::Pno, 26);
        assert_eq!(header.channels(), Some(8));
        assert_eq!(header.columns()[17], "Pixel_1 PCE");

        let four_channels = Header::negotiate(Mode::Pno, 14);
        assert_eq!(four_channels.channels(), Some(4));
    }

    #[test]
    fn test_negotiate_unfit_width_is_generic() {
        let header = Header::negotiate(Mode::Scan, 16);
        assert_eq!(header.channels(), None);
        assert_eq!(header.width(), 16);
        assert_eq!(header.columns()[15], "Field_16");
    }
}

//! Output files for measurement runs
//!
//! One file per device per command. The first flush writes the metadata
//! block and the column header; every later flush only appends data rows.

use super::protocol::{Header, MeasurementRow, RunRequest};
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Timestamp format used in file names and the `Start Date` metadata row
pub const TIMESTAMP_FORMAT: &str = "%b-%d-%Y %H_%M_%S";

/// Build the output file name for one device's run
///
/// `{timestamp}[__{trial}]__ID{id}[__{light|dark}]__{suffix}`
pub fn output_file_name(
    started: &DateTime<Local>,
    trial_name: Option<&str>,
    logical_id: i32,
    request: &RunRequest,
) -> String {
    let mut name = started.format(TIMESTAMP_FORMAT).to_string();

    if let Some(trial) = trial_name.map(str::trim).filter(|t| !t.is_empty()) {
        name.push_str("__");
        name.push_str(trial);
    }

    name.push_str(&format!("__ID{}", logical_id));

    if let Some(schema) = request.mode().schema() {
        if schema.tags_light {
            let tag = if request.light().unwrap_or(false) { "light" } else { "dark" };
            name.push_str("__");
            name.push_str(tag);
        }
        name.push_str("__");
        name.push_str(schema.file_suffix);
    }

    name
}

/// `dir/name`, or `dir/{stem}__{n}.{ext}` with the first free `n` when a run
/// that started in the same second already took the name
pub fn available_path(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    if !path.exists() {
        return path;
    }
    let (stem, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    (2..)
        .map(|n| {
            if ext.is_empty() {
                dir.join(format!("{}__{}", stem, n))
            } else {
                dir.join(format!("{}__{}.{}", stem, n, ext))
            }
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or(path)
}

/// Append-only writer for one run's output file
#[derive(Debug)]
pub struct Recorder {
    path: PathBuf,
    metadata: Vec<(String, String)>,
    rows_written: usize,
    flushes: usize,
}

impl Recorder {
    /// Recorder for `path`, with the request's metadata plus a start date
    pub fn new(path: PathBuf, request: &RunRequest, started: &DateTime<Local>) -> Self {
        let mut metadata = request.metadata();
        metadata.push(("Start Date".to_string(), started.format(TIMESTAMP_FORMAT).to_string()));
        Self {
            path,
            metadata,
            rows_written: 0,
            flushes: 0,
        }
    }

    /// Output path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data rows persisted so far
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Number of completed flushes
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Persist and drain `rows`.
    ///
    /// Creates the file with its metadata and header block if it does not
    /// exist yet, otherwise appends. Returns how many rows were written.
    pub fn flush(&mut self, header: &Header, rows: &mut Vec<MeasurementRow>) -> io::Result<usize> {
        let fresh = !self.path.exists();
        if !fresh && rows.is_empty() {
            return Ok(0);
        }

        let file = if fresh {
            File::create(&self.path)?
        } else {
            OpenOptions::new().append(true).open(&self.path)?
        };

        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_writer(file);

        if fresh {
            for (label, value) in &self.metadata {
                writer.write_record([label.as_str(), value.as_str()])?;
            }
            writer.write_record(header.columns())?;
        }

        let count = rows.len();
        for row in rows.drain(..) {
            writer.write_record(row.fields())?;
        }
        writer.flush()?;

        self.rows_written += count;
        self.flushes += 1;
        Ok(count)
    }
}

//! Append-only CSV store for the sample series.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, Trim, WriterBuilder};
use thiserror::Error;

use super::models::*;

/// Store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("corrupt header: {0}")]
    Header(String),
}

/// A row that could not be turned into a [`SampleRecord`].
#[derive(Error, Debug, Clone, PartialEq)]
#[error("line {line}: {reason}")]
pub struct RowError {
    pub line: u64,
    pub reason: String,
}

/// Result of replaying the log: the good records plus every skipped row.
#[derive(Debug, Default)]
pub struct SeriesRead {
    pub records: Vec<SampleRecord>,
    pub skipped: Vec<RowError>,
}

/// Single-writer, append-only series log.
#[derive(Debug, Clone)]
pub struct SeriesStore {
    path: PathBuf,
}

impl SeriesStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to disk before returning.
    ///
    /// The header is written together with the first row. Each call issues a
    /// single write so a concurrent reader never sees half a row.
    pub fn append(&self, record: &SampleRecord) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;

        let mut buf = Vec::with_capacity(160);
        let len = file.metadata()?.len();
        if len > 0 && !ends_with_newline(&mut file, len)? {
            // Finish a torn line left by an earlier crash
            buf.push(b'\n');
        }

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(buf);
        if len == 0 {
            writer.write_record(COLUMNS)?;
        }
        writer.serialize(CsvRow::from(record))?;
        let buf = writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;

        file.write_all(&buf)?;
        file.sync_data()?;
        Ok(())
    }

    /// Replay the whole log in tick order.
    ///
    /// A missing file is an empty series. Malformed rows are skipped and
    /// reported in [`SeriesRead::skipped`].
    pub fn read_all(&self) -> Result<SeriesRead, StoreError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(SeriesRead::default()),
            Err(e) => return Err(e.into()),
        };

        let complete = match data.iter().rposition(|&b| b == b'\n') {
            Some(end) => &data[..=end],
            None => &data[..0],
        };
        if complete.len() < data.len() {
            tracing::warn!(
                "Ignoring incomplete trailing row in {} ({} bytes)",
                self.path.display(),
                data.len() - complete.len()
            );
        }

        parse_series(complete)
    }
}

fn ends_with_newline(file: &mut File, len: u64) -> io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Parse complete CSV lines into records.
pub(crate) fn parse_series(data: &[u8]) -> Result<SeriesRead, StoreError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(data);

    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        return Ok(SeriesRead::default());
    }
    for required in ["timestamp", "connected"] {
        if !headers.iter().any(|h| h == required) {
            return Err(StoreError::Header(format!("missing column {:?}", required)));
        }
    }

    let mut read = SeriesRead::default();
    for result in reader.records() {
        let (line, parsed) = match result {
            Ok(row) => {
                let line = row.position().map(|p| p.line()).unwrap_or_default();
                let parsed = row
                    .deserialize::<CsvRow>(Some(&headers))
                    .map_err(|e| e.to_string())
                    .and_then(SampleRecord::try_from);
                (line, parsed)
            }
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or_default();
                (line, Err(e.to_string()))
            }
        };

        match parsed {
            Ok(record) => read.records.push(record),
            Err(reason) => {
                let err = RowError { line, reason };
                tracing::warn!("Skipping malformed row: {}", err);
                read.skipped.push(err);
            }
        }
    }

    Ok(read)
}

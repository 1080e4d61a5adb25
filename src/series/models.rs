//! Series model types.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Column order of the log file.
pub const COLUMNS: [&str; 9] = [
    "timestamp",
    "datetime",
    "connected",
    "ping_time",
    "jitter",
    "packet_loss",
    "udp_time",
    "socket_time",
    "http_time",
];

/// One tick of the monitor. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub connected: bool,
    pub ping_avg_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub packet_loss_pct: Option<f64>,
    pub udp_latency_ms: Option<f64>,
    pub socket_latency_ms: Option<f64>,
    pub http_latency_ms: Option<f64>,
}

impl SampleRecord {
    /// A record with no metrics.
    #[cfg(test)]
    pub fn bare(timestamp: f64, connected: bool) -> Self {
        Self {
            timestamp,
            connected,
            ping_avg_ms: None,
            jitter_ms: None,
            packet_loss_pct: None,
            udp_latency_ms: None,
            socket_latency_ms: None,
            http_latency_ms: None,
        }
    }
}

/// Convert epoch seconds into local wall-clock time.
pub fn local_time(timestamp: f64) -> Option<DateTime<Local>> {
    if !timestamp.is_finite() {
        return None;
    }
    let secs = timestamp.floor();
    let nanos = ((timestamp - secs) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(secs as i64, nanos.min(999_999_999)).map(|dt| dt.with_timezone(&Local))
}

/// `YYYY-MM-DD HH:MM:SS` in local time, empty if out of range.
pub fn format_local(timestamp: f64) -> String {
    local_time(timestamp)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// On-disk row layout. Field names match [`COLUMNS`].
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CsvRow {
    pub timestamp: f64,
    pub datetime: String,
    #[serde(deserialize_with = "connected_cell")]
    pub connected: u8,
    #[serde(deserialize_with = "metric_cell")]
    pub ping_time: Option<f64>,
    #[serde(deserialize_with = "metric_cell")]
    pub jitter: Option<f64>,
    #[serde(deserialize_with = "metric_cell")]
    pub packet_loss: Option<f64>,
    #[serde(deserialize_with = "metric_cell")]
    pub udp_time: Option<f64>,
    #[serde(deserialize_with = "metric_cell")]
    pub socket_time: Option<f64>,
    #[serde(deserialize_with = "metric_cell")]
    pub http_time: Option<f64>,
}

impl From<&SampleRecord> for CsvRow {
    fn from(r: &SampleRecord) -> Self {
        Self {
            timestamp: r.timestamp,
            datetime: format_local(r.timestamp),
            connected: u8::from(r.connected),
            ping_time: r.ping_avg_ms,
            jitter: r.jitter_ms,
            packet_loss: r.packet_loss_pct,
            udp_time: r.udp_latency_ms,
            socket_time: r.socket_latency_ms,
            http_time: r.http_latency_ms,
        }
    }
}

impl TryFrom<CsvRow> for SampleRecord {
    type Error = String;

    fn try_from(row: CsvRow) -> Result<Self, Self::Error> {
        if !row.timestamp.is_finite() {
            return Err(format!("invalid timestamp {}", row.timestamp));
        }
        Ok(Self {
            timestamp: row.timestamp,
            connected: row.connected == 1,
            ping_avg_ms: row.ping_time,
            jitter_ms: row.jitter,
            packet_loss_pct: row.packet_loss,
            udp_latency_ms: row.udp_time,
            socket_latency_ms: row.socket_time,
            http_latency_ms: row.http_time,
        })
    }
}

/// Parse a metric cell; empty, `None`, `null` and `nan` mean missing.
pub(crate) fn parse_metric(raw: &str) -> Result<Option<f64>, String> {
    let cell = raw.trim();
    if cell.is_empty() {
        return Ok(None);
    }
    match cell.to_ascii_lowercase().as_str() {
        "none" | "null" | "nan" => Ok(None),
        _ => cell
            .parse::<f64>()
            .map(Some)
            .map_err(|_| format!("invalid number {:?}", cell)),
    }
}

fn metric_cell<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_metric(&raw).map_err(serde::de::Error::custom)
}

fn connected_cell<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let raw = String::deserialize(deserializer)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" => Ok(1),
        "0" | "false" => Ok(0),
        other => Err(serde::de::Error::custom(format!("invalid connected flag {:?}", other))),
    }
}

//! Report module: replays the persisted series into summary statistics.
//!
//! The report is a read model. It is rebuilt from the log every time and
//! rendering never changes the computed values.

mod render;
mod stats;

pub use render::*;
pub use stats::*;

use std::io;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::config::ReportFormat;
use crate::monitor::{Episode, EpisodeTracker};
use crate::series::{format_local, SampleRecord, SeriesStore, StoreError};

/// Report error types.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("cannot read series: {0}")]
    Store(#[from] StoreError),
    #[error("cannot write report: {0}")]
    Io(#[from] io::Error),
    #[error("cannot encode report: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-column summaries over present values.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSummaries {
    pub ping: MetricSummary,
    pub jitter: MetricSummary,
    pub packet_loss: MetricSummary,
    pub udp: MetricSummary,
    pub socket: MetricSummary,
    pub http: MetricSummary,
}

impl MetricSummaries {
    fn from_records(records: &[SampleRecord]) -> Self {
        let column = |f: fn(&SampleRecord) -> Option<f64>| MetricSummary::from_values(records.iter().map(f));
        Self {
            ping: column(|r| r.ping_avg_ms),
            jitter: column(|r| r.jitter_ms),
            packet_loss: column(|r| r.packet_loss_pct),
            udp: column(|r| r.udp_latency_ms),
            socket: column(|r| r.socket_latency_ms),
            http: column(|r| r.http_latency_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub first_timestamp: f64,
    pub last_timestamp: f64,
    pub started_at: String,
    pub ended_at: String,
    pub total_checks: usize,
    pub connected_checks: usize,
    pub disconnected_checks: usize,
    pub connected_pct: f64,
    pub disconnected_pct: f64,
    pub elapsed_secs: f64,
    pub disconnect_secs: f64,
    /// Uptime clamped to [0, 100].
    pub uptime_pct: f64,
    /// Unclamped uptime; differs from `uptime_pct` only on irregular series.
    pub uptime_raw_pct: f64,
    pub uptime_anomaly: bool,
    pub episodes: Vec<Episode>,
    pub episode_durations: Option<DurationStats>,
    pub metrics: MetricSummaries,
    /// Log rows that could not be parsed.
    pub skipped_rows: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    NoData,
    Ready(Report),
}

/// Compute the report for a series in tick order.
pub fn build_report(records: &[SampleRecord]) -> ReportOutcome {
    let (first, last) = match (records.first(), records.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return ReportOutcome::NoData,
    };

    let total_checks = records.len();
    let connected_checks = records.iter().filter(|r| r.connected).count();
    let disconnected_checks = total_checks - connected_checks;
    let connected_pct = connected_checks as f64 / total_checks as f64 * 100.0;

    let episodes = EpisodeTracker::track(records);
    let disconnect_secs: f64 = episodes.iter().map(|e| e.duration_secs).sum();
    let elapsed_secs = last.timestamp - first.timestamp;

    // A single instant has no elapsed time to measure against
    let uptime_raw_pct = if elapsed_secs > 0.0 {
        (1.0 - disconnect_secs / elapsed_secs) * 100.0
    } else {
        connected_pct
    };
    let uptime_anomaly = !(0.0..=100.0).contains(&uptime_raw_pct);
    if uptime_anomaly {
        tracing::warn!(
            "Uptime {:.2}% is outside [0, 100]; the series has irregular timestamps",
            uptime_raw_pct
        );
    }

    ReportOutcome::Ready(Report {
        first_timestamp: first.timestamp,
        last_timestamp: last.timestamp,
        started_at: format_local(first.timestamp),
        ended_at: format_local(last.timestamp),
        total_checks,
        connected_checks,
        disconnected_checks,
        connected_pct,
        disconnected_pct: 100.0 - connected_pct,
        elapsed_secs,
        disconnect_secs,
        uptime_pct: uptime_raw_pct.clamp(0.0, 100.0),
        uptime_raw_pct,
        uptime_anomaly,
        episode_durations: DurationStats::from_episodes(&episodes),
        episodes,
        metrics: MetricSummaries::from_records(records),
        skipped_rows: 0,
    })
}

/// Replay the store into a report.
pub fn generate(store: &SeriesStore) -> Result<ReportOutcome, ReportError> {
    let read = store.read_all()?;
    let outcome = match build_report(&read.records) {
        ReportOutcome::Ready(mut report) => {
            report.skipped_rows = read.skipped.len();
            ReportOutcome::Ready(report)
        }
        ReportOutcome::NoData => ReportOutcome::NoData,
    };
    Ok(outcome)
}

/// Generate the report and write it to `path`. Nothing is written when
/// the series is empty.
pub fn publish(store: &SeriesStore, path: &Path, format: ReportFormat) -> Result<ReportOutcome, ReportError> {
    let outcome = generate(store)?;
    if let ReportOutcome::Ready(report) = &outcome {
        let document = render(report, format)?;
        std::fs::write(path, document)?;
        tracing::info!(
            "Report for {} checks written to {}",
            report.total_checks,
            path.display()
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn series(states: &[bool]) -> Vec<SampleRecord> {
        states
            .iter()
            .enumerate()
            .map(|(i, &up)| SampleRecord::bare(1_700_000_000.0 + i as f64, up))
            .collect()
    }

    fn ready(outcome: ReportOutcome) -> Report {
        match outcome {
            ReportOutcome::Ready(report) => report,
            ReportOutcome::NoData => panic!("expected a report"),
        }
    }

    #[test]
    fn test_empty_series_has_no_data() {
        assert_eq!(build_report(&[]), ReportOutcome::NoData);
    }

    #[test]
    fn test_all_connected() {
        let report = ready(build_report(&series(&[true; 5])));
        assert_eq!(report.total_checks, 5);
        assert_eq!(report.connected_pct, 100.0);
        assert_eq!(report.uptime_pct, 100.0);
        assert_eq!(report.elapsed_secs, 4.0);
        assert!(report.episodes.is_empty());
        assert!(report.episode_durations.is_none());
        assert!(!report.uptime_anomaly);
    }

    #[test]
    fn test_single_outage() {
        let report = ready(build_report(&series(&[true, true, false, false, true])));
        assert_eq!(report.connected_checks, 3);
        assert_eq!(report.disconnected_checks, 2);
        assert!((report.connected_pct - 60.0).abs() < 1e-9);
        assert_eq!(report.episodes.len(), 1);
        assert_eq!(report.disconnect_secs, 2.0);
        assert!((report.uptime_pct - 50.0).abs() < 1e-9);

        let durations = report.episode_durations.unwrap();
        assert_eq!(durations.min, 2.0);
        assert_eq!(durations.max, 2.0);
    }

    #[test]
    fn test_single_record_uses_check_ratio() {
        let report = ready(build_report(&series(&[false])));
        assert_eq!(report.elapsed_secs, 0.0);
        assert_eq!(report.uptime_pct, 0.0);
        assert!(report.episodes.is_empty());
    }

    #[test]
    fn test_missing_metrics_are_zero() {
        let report = ready(build_report(&series(&[true, false])));
        assert_eq!(report.metrics.ping, MetricSummary::default());
        assert_eq!(report.metrics.http.count, 0);
    }

    #[test]
    fn test_metrics_over_present_values() {
        let mut records = series(&[true, true, true]);
        records[0].ping_avg_ms = Some(10.0);
        records[2].ping_avg_ms = Some(30.0);
        records[1].udp_latency_ms = Some(4.0);
        let report = ready(build_report(&records));
        assert_eq!(report.metrics.ping.count, 2);
        assert_eq!(report.metrics.ping.avg, 20.0);
        assert_eq!(report.metrics.udp.max, 4.0);
    }

    #[test]
    fn test_irregular_series_flags_anomaly() {
        // Clock went backwards during an outage
        let records = vec![
            SampleRecord::bare(100.0, true),
            SampleRecord::bare(110.0, false),
            SampleRecord::bare(150.0, true),
            SampleRecord::bare(120.0, true),
        ];
        let report = ready(build_report(&records));
        assert!(report.uptime_anomaly);
        assert!(report.uptime_raw_pct < 0.0);
        assert_eq!(report.uptime_pct, 0.0);
    }

    #[test]
    fn test_publish_writes_document() {
        let dir = tempdir().unwrap();
        let store = SeriesStore::new(dir.path().join("log.csv"));
        let path = dir.path().join("report.json");

        assert_eq!(publish(&store, &path, ReportFormat::Json).unwrap(), ReportOutcome::NoData);
        assert!(!path.exists());

        for record in series(&[true, false, true]) {
            store.append(&record).unwrap();
        }
        let report = ready(publish(&store, &path, ReportFormat::Json).unwrap());
        assert_eq!(report.total_checks, 3);

        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["total_checks"], 3);
        assert_eq!(written["episodes"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_log_is_an_error() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("log.csv");
        std::fs::write(&log, "time,status\n1,1\n").unwrap();
        let store = SeriesStore::new(&log);
        assert!(matches!(generate(&store), Err(ReportError::Store(_))));
    }
}

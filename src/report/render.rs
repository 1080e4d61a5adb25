//! Report renderers.

use std::fmt::Write;

use crate::config::ReportFormat;
use crate::series::format_local;

use super::{MetricSummary, Report, ReportError};

pub fn render(report: &Report, format: ReportFormat) -> Result<String, ReportError> {
    match format {
        ReportFormat::Text => Ok(render_text(report)),
        ReportFormat::Json => Ok(render_json(report)?),
    }
}

pub fn render_json(report: &Report) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

/// Plain-text document with one section per statistic group.
pub fn render_text(report: &Report) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = write_text(&mut out, report);
    out
}

fn write_text(out: &mut String, r: &Report) -> std::fmt::Result {
    writeln!(out, "=== CONNECTION STABILITY REPORT ===")?;
    writeln!(out)?;
    writeln!(out, "Monitoring period: {} - {}", r.started_at, r.ended_at)?;
    writeln!(
        out,
        "Total duration: {:.1} s ({:.1} h)",
        r.elapsed_secs,
        r.elapsed_secs / 3600.0
    )?;
    writeln!(out)?;

    writeln!(out, "--- CONNECTION ---")?;
    writeln!(out, "Total checks: {}", r.total_checks)?;
    writeln!(out, "Successful checks: {} ({:.1}%)", r.connected_checks, r.connected_pct)?;
    writeln!(out, "Failed checks: {} ({:.1}%)", r.disconnected_checks, r.disconnected_pct)?;
    write!(out, "Uptime: {:.2}%", r.uptime_pct)?;
    if r.uptime_anomaly {
        write!(out, " (raw {:.2}%, timestamps are irregular)", r.uptime_raw_pct)?;
    }
    writeln!(out)?;
    writeln!(out, "Downtime: {:.1} s", r.disconnect_secs)?;
    writeln!(out, "Disconnects: {}", r.episodes.len())?;
    if r.skipped_rows > 0 {
        writeln!(out, "Unreadable log rows: {}", r.skipped_rows)?;
    }
    writeln!(out)?;

    if !r.episodes.is_empty() {
        writeln!(out, "--- DISCONNECTS ---")?;
        for (i, episode) in r.episodes.iter().enumerate() {
            write!(
                out,
                "Disconnect #{}: start {}, end {}, duration {:.1} s",
                i + 1,
                format_local(episode.start),
                format_local(episode.end),
                episode.duration_secs
            )?;
            if episode.ongoing {
                write!(out, " (ongoing)")?;
            }
            writeln!(out)?;
        }
        if let Some(d) = &r.episode_durations {
            writeln!(out)?;
            writeln!(out, "Average disconnect: {:.1} s", d.avg)?;
            writeln!(out, "Longest disconnect: {:.1} s", d.max)?;
            writeln!(out, "Shortest disconnect: {:.1} s", d.min)?;
        }
        writeln!(out)?;
    }

    let m = &r.metrics;
    writeln!(out, "--- PING ---")?;
    write_metric(out, "Latency", &m.ping, "ms")?;
    write_metric(out, "Jitter", &m.jitter, "ms")?;
    write_metric(out, "Packet loss", &m.packet_loss, "%")?;
    writeln!(out)?;

    for (title, summary) in [("UDP", &m.udp), ("HTTP", &m.http), ("SOCKET", &m.socket)] {
        writeln!(out, "--- {} ---", title)?;
        write_metric(out, "Response time", summary, "ms")?;
        writeln!(out)?;
    }

    write!(out, "=== END OF REPORT ===")
}

fn write_metric(out: &mut String, label: &str, s: &MetricSummary, unit: &str) -> std::fmt::Result {
    if s.count == 0 {
        return writeln!(out, "{}: no samples", label);
    }
    writeln!(
        out,
        "{}: avg {:.1}{unit}, min {:.1}{unit}, max {:.1}{unit}, p50 {:.1}{unit}, p95 {:.1}{unit} ({} samples)",
        label,
        s.avg,
        s.min,
        s.max,
        s.p50,
        s.p95,
        s.count,
        unit = unit
    )
}

//! Per-tick aggregation of probe results into a [`SampleRecord`].

use std::future::Future;

use chrono::Utc;

use crate::config::MonitorConfig;
use crate::probe::{
    run_ping_probe, run_socket_probe, run_udp_probe, HttpProbe, PingRunner,
    PingStats, ProbeError, ProbeKind, ProbeResult,
};
use crate::series::SampleRecord;

/// Results of the probes that ran in one tick; `None` means not selected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcomes {
    pub ping: Option<ProbeResult>,
    pub socket: Option<ProbeResult>,
    pub http: Option<ProbeResult>,
    pub udp: Option<ProbeResult>,
}

impl TickOutcomes {
    /// Connected iff any probe that ran succeeded.
    pub fn connected(&self) -> bool {
        [&self.ping, &self.socket, &self.http, &self.udp]
            .into_iter()
            .flatten()
            .any(|r| r.success)
    }
}

/// Pack one tick's outcomes into a record.
pub fn aggregate(timestamp: f64, ping_count: u32, outcomes: &TickOutcomes) -> SampleRecord {
    let ping = outcomes
        .ping
        .as_ref()
        .map(|r| PingStats::from_samples(&r.latencies, ping_count))
        .unwrap_or_default();

    SampleRecord {
        timestamp,
        connected: outcomes.connected(),
        ping_avg_ms: ping.avg_ms,
        jitter_ms: ping.jitter_ms,
        packet_loss_pct: ping.packet_loss_pct,
        udp_latency_ms: outcomes.udp.as_ref().and_then(ProbeResult::latency_ms),
        socket_latency_ms: outcomes.socket.as_ref().and_then(ProbeResult::latency_ms),
        http_latency_ms: outcomes.http.as_ref().and_then(ProbeResult::latency_ms),
    }
}

/// Runs the probes selected by the check method.
pub struct Sampler<R> {
    config: MonitorConfig,
    ping: R,
    http: HttpProbe,
}

impl<R: PingRunner> Sampler<R> {
    pub fn new(config: MonitorConfig, ping: R) -> Result<Self, ProbeError> {
        let http = HttpProbe::new(&config.http_url, config.timeout)?;
        Ok(Self { config, ping, http })
    }

    /// Run one tick. Selected probes run concurrently and all of them finish
    /// (or hit their own budget) before the record is built.
    pub async fn sample(&self) -> SampleRecord {
        let timestamp = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let outcomes = self.run_probes().await;
        aggregate(timestamp, self.config.ping_count, &outcomes)
    }

    pub async fn run_probes(&self) -> TickOutcomes {
        let method = self.config.check_method;
        let cfg = &self.config;

        let (ping, socket, http, udp) = tokio::join!(
            when(
                method.includes(ProbeKind::Ping),
                run_ping_probe(&self.ping, &cfg.host, cfg.ping_count, cfg.timeout)
            ),
            when(
                method.includes(ProbeKind::Socket),
                run_socket_probe(&cfg.host, cfg.socket_port, cfg.timeout)
            ),
            when(method.includes(ProbeKind::Http), self.http.run()),
            when(
                method.includes(ProbeKind::Udp),
                run_udp_probe(&cfg.host, cfg.timeout)
            ),
        );

        TickOutcomes {
            ping,
            socket,
            http,
            udp,
        }
    }
}

async fn when<F: Future<Output = ProbeResult>>(enabled: bool, probe: F) -> Option<ProbeResult> {
    if enabled {
        Some(probe.await)
    } else {
        None
    }
}

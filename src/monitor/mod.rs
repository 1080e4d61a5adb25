//! Monitor module: the periodic driver loop.
//!
//! Each tick runs the selected probes, persists one record and feeds the
//! live episode tracker for outage/recovery notifications.

mod episodes;
mod sampler;

pub use episodes::*;
pub use sampler::*;

use std::io;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::MonitorConfig;
use crate::probe::{PingRunner, ProbeError};
use crate::series::{format_local, SampleRecord, SeriesStore, StoreError};

/// Counters for one monitoring run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    pub connected_ticks: u64,
    pub failed_appends: u64,
    pub outages: usize,
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    Requested,
}

pub struct Monitor<R> {
    config: MonitorConfig,
    sampler: Sampler<R>,
    store: SeriesStore,
}

impl<R: PingRunner> Monitor<R> {
    pub fn new(config: MonitorConfig, ping: R) -> Result<Self, ProbeError> {
        let store = SeriesStore::new(&config.log_file);
        let sampler = Sampler::new(config.clone(), ping)?;
        Ok(Self {
            config,
            sampler,
            store,
        })
    }

    pub fn store(&self) -> &SeriesStore {
        &self.store
    }

    /// Tick until the configured duration elapses or `stop` turns true.
    ///
    /// Stop requests are honoured between ticks; a tick in progress always
    /// completes and is persisted.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> (RunSummary, StopReason) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let deadline = self.config.duration.map(|d| Instant::now() + d);
        let mut tracker = EpisodeTracker::live();
        let mut summary = RunSummary::default();

        let mut stop_open = true;

        let reason = loop {
            if *stop.borrow_and_update() {
                break StopReason::Requested;
            }

            tokio::select! {
                biased;
                changed = stop.changed(), if stop_open => {
                    // A dropped sender can never ask us to stop
                    if changed.is_err() {
                        stop_open = false;
                    }
                    continue;
                }
                _ = sleep_until(deadline) => break StopReason::DurationElapsed,
                _ = interval.tick() => {}
            }

            let record = self.sampler.sample().await;
            let persisted = persist(&self.store, &record).await;
            self.record_tick(&record, persisted, &mut tracker, &mut summary);

            if deadline.is_some_and(|d| Instant::now() >= d) {
                break StopReason::DurationElapsed;
            }
        };

        summary.outages = tracker.outages();
        tracing::info!(
            "Monitoring finished after {} ticks ({:?}), {} outages, {} unsaved",
            summary.ticks,
            reason,
            summary.outages,
            summary.failed_appends
        );
        (summary, reason)
    }

    fn record_tick(
        &self,
        record: &SampleRecord,
        persisted: Result<(), StoreError>,
        tracker: &mut EpisodeTracker,
        summary: &mut RunSummary,
    ) {
        summary.ticks += 1;
        if record.connected {
            summary.connected_ticks += 1;
        }

        let persisted = match persisted {
            Ok(()) => true,
            Err(e) => {
                summary.failed_appends += 1;
                tracing::error!(
                    "Failed to append sample to {}: {}",
                    self.store.path().display(),
                    e
                );
                false
            }
        };

        println!("{}", status_line(record, persisted));

        match tracker.observe_record(record) {
            Some(Transition::Disconnected { at, ordinal }) => {
                println!("!!! Connection lost at {} (outage #{}) !!!", format_local(at), ordinal);
            }
            Some(Transition::Recovered { episode }) => {
                println!(
                    "!!! Connection recovered after {:.1} s of downtime !!!",
                    episode.duration_secs
                );
            }
            None => {}
        }
    }
}

/// Append on the blocking pool; the store opens, writes and syncs a file.
async fn persist(store: &SeriesStore, record: &SampleRecord) -> Result<(), StoreError> {
    let store = store.clone();
    let record = record.clone();
    tokio::task::spawn_blocking(move || store.append(&record))
        .await
        .unwrap_or_else(|e| Err(StoreError::Io(io::Error::other(e))))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// One human-readable line per tick.
pub fn status_line(record: &SampleRecord, persisted: bool) -> String {
    let mut line = format!(
        "[{}] {}",
        format_local(record.timestamp),
        if record.connected { "CONNECTED" } else { "DISCONNECTED" }
    );

    let metrics = [
        ("ping", record.ping_avg_ms),
        ("jitter", record.jitter_ms),
        ("udp", record.udp_latency_ms),
        ("socket", record.socket_latency_ms),
        ("http", record.http_latency_ms),
    ];
    for (name, value) in metrics {
        if let Some(ms) = value {
            line.push_str(&format!(", {}: {:.1} ms", name, ms));
        }
    }
    if let Some(loss) = record.packet_loss_pct {
        line.push_str(&format!(", loss: {:.0}%", loss));
    }
    if !persisted {
        line.push_str(" (not saved)");
    }
    line
}

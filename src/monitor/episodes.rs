//! Disconnect episode tracking.
//!
//! A single left-to-right pass over samples. The live loop feeds it one
//! record at a time; the report replays the whole log through the same
//! code, so both see identical episode boundaries.

use serde::Serialize;

use crate::series::SampleRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

impl LinkState {
    fn of(connected: bool) -> Self {
        if connected {
            LinkState::Up
        } else {
            LinkState::Down
        }
    }
}

/// A maximal run of disconnected ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Episode {
    pub start: f64,
    pub end: f64,
    pub duration_secs: f64,
    /// Still down when the series ended; closed at the last timestamp.
    pub ongoing: bool,
}

impl Episode {
    fn new(start: f64, end: f64, ongoing: bool) -> Self {
        Self {
            start,
            end,
            duration_secs: end - start,
            ongoing,
        }
    }
}

/// State change reported while observing records.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// Up -> Down; `ordinal` counts outages from 1.
    Disconnected { at: f64, ordinal: usize },
    /// Down -> Up, closing an episode.
    Recovered { episode: Episode },
}

#[derive(Debug, Clone)]
pub struct EpisodeTracker {
    state: Option<LinkState>,
    open_since: Option<f64>,
    last_timestamp: Option<f64>,
    closed: Vec<Episode>,
    /// Live trackers only report transitions and keep `closed` empty.
    retain_closed: bool,
    outages: usize,
}

impl Default for EpisodeTracker {
    fn default() -> Self {
        Self {
            state: None,
            open_since: None,
            last_timestamp: None,
            closed: Vec::new(),
            retain_closed: true,
            outages: 0,
        }
    }
}

impl EpisodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker for an unbounded stream: closed episodes are handed out as
    /// [`Transition::Recovered`] and not kept.
    pub fn live() -> Self {
        Self {
            retain_closed: false,
            ..Self::default()
        }
    }

    /// Batch mode: run the whole sequence and close any open episode.
    pub fn track<'a, I>(records: I) -> Vec<Episode>
    where
        I: IntoIterator<Item = &'a SampleRecord>,
    {
        let mut tracker = Self::new();
        for record in records {
            tracker.observe_record(record);
        }
        tracker.finish()
    }

    pub fn observe_record(&mut self, record: &SampleRecord) -> Option<Transition> {
        self.observe(record.timestamp, record.connected)
    }

    /// Feed one sample. The first sample only sets the initial state.
    pub fn observe(&mut self, timestamp: f64, connected: bool) -> Option<Transition> {
        let next = LinkState::of(connected);
        let previous = self.state.replace(next);
        self.last_timestamp = Some(timestamp);

        match (previous, next) {
            (Some(LinkState::Up), LinkState::Down) => {
                self.open_since = Some(timestamp);
                self.outages += 1;
                Some(Transition::Disconnected {
                    at: timestamp,
                    ordinal: self.outages,
                })
            }
            (Some(LinkState::Down), LinkState::Up) => {
                // A series that starts down has nothing open to close
                let start = self.open_since.take()?;
                let episode = Episode::new(start, timestamp, false);
                if self.retain_closed {
                    self.closed.push(episode);
                }
                Some(Transition::Recovered { episode })
            }
            _ => None,
        }
    }

    pub fn outages(&self) -> usize {
        self.outages
    }

    /// The open episode, provisionally closed at the latest timestamp.
    pub fn open_episode(&self) -> Option<Episode> {
        let start = self.open_since?;
        let end = self.last_timestamp.unwrap_or(start);
        Some(Episode::new(start, end, true))
    }

    /// All retained episodes, including the provisional open one.
    pub fn episodes(&self) -> Vec<Episode> {
        let mut all = self.closed.clone();
        all.extend(self.open_episode());
        all
    }

    /// End of stream: close any open episode at the last timestamp.
    pub fn finish(self) -> Vec<Episode> {
        self.episodes()
    }
}

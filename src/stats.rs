//! Communication statistics collected while verbosity is enabled.

use std::{fmt, time::Duration};

use serde::Serialize;
use tracing::info;

/// Default width of a payload element in bytes, used to approximate communication volume.
pub const BYTES_PER_ELEMENT: u64 = 8;

/// A snapshot of the communication statistics of a communicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommStats {
    /// The number of communication rounds.
    pub rounds: u64,
    /// The approximate number of bytes communicated.
    pub bytes: u64,
    /// The cumulative wall-clock time spent communicating.
    pub time: Duration,
}

impl CommStats {
    /// The cumulative communication time in seconds.
    pub fn time_secs(&self) -> f64 {
        self.time.as_secs_f64()
    }
}

impl fmt::Display for CommStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "====Communication Stats====")?;
        writeln!(f, "Rounds: {}", self.rounds)?;
        writeln!(f, "Bytes : {}", self.bytes)?;
        write!(f, "Comm time: {}", self.time_secs())
    }
}

/// Counters for rounds, bytes and time of one communicator.
///
/// The counters only grow between two calls to [`StatsTracker::reset`].
#[derive(Debug, Clone)]
pub struct StatsTracker {
    stats: CommStats,
    bytes_per_element: u64,
}

impl StatsTracker {
    /// Creates a tracker that accounts `bytes_per_element` bytes per communicated element.
    pub fn new(bytes_per_element: u64) -> Self {
        Self {
            stats: CommStats::default(),
            bytes_per_element,
        }
    }

    /// Zeroes rounds, bytes and time.
    pub fn reset(&mut self) {
        self.stats = CommStats::default();
    }

    /// Records one round moving `elements` elements.
    pub fn record_round(&mut self, elements: u64) {
        self.stats.rounds += 1;
        self.stats.bytes += elements * self.bytes_per_element;
    }

    /// Adds `elapsed` to the cumulative communication time.
    pub fn record_time(&mut self, elapsed: Duration) {
        self.stats.time += elapsed;
    }

    /// The current counters.
    pub fn snapshot(&self) -> CommStats {
        self.stats
    }

    /// The width of an element in bytes.
    pub fn bytes_per_element(&self) -> u64 {
        self.bytes_per_element
    }

    /// Logs the current counters and returns them as text.
    pub fn report(&self) -> String {
        let report = self.stats.to_string();
        for line in report.lines() {
            info!("{line}");
        }
        report
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new(BYTES_PER_ELEMENT)
    }
}

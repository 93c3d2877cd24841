//! Stats Module - Stop-the-world pause accounting
//!
//! Each cycle produces a [`CycleReport`]; [`PauseStats`] folds reports into
//! running totals that any thread can read without locking.
//!
//! Phases of one pause:
//! ```text
//! |-- quiescence --|------- collection -------|
//! ^ traps requested ^ all stopped              ^ thawed
//! |------------------- pause -------------------|
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Numbers for one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Cycle number, starting at 1
    pub cycle: u64,

    /// Mutators the cycle waited for
    pub targets: usize,

    /// Mutators that parked themselves at a safepoint poll
    pub stopped_from_managed: usize,

    /// Mutators the collector froze while they ran native code
    pub stopped_from_native: usize,

    /// Time from trap request until every target stopped
    pub quiescence: Duration,

    /// Time spent inside the collection procedure
    pub collection: Duration,

    /// Time from trap request until every target was thawed
    pub pause: Duration,
}

/// PauseStats - running totals over all cycles
#[derive(Debug, Default)]
pub struct PauseStats {
    cycles: AtomicU64,
    total_pause_us: AtomicU64,
    max_pause_us: AtomicU64,
    last_pause_us: AtomicU64,
    total_quiescence_us: AtomicU64,
    total_collection_us: AtomicU64,
    managed_stops: AtomicU64,
    native_stops: AtomicU64,
}

impl PauseStats {
    /// Create empty stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one cycle into the totals
    pub fn record(&self, report: &CycleReport) {
        let pause = report.pause.as_micros() as u64;

        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.total_pause_us.fetch_add(pause, Ordering::Relaxed);
        self.max_pause_us.fetch_max(pause, Ordering::Relaxed);
        self.last_pause_us.store(pause, Ordering::Relaxed);
        self.total_quiescence_us
            .fetch_add(report.quiescence.as_micros() as u64, Ordering::Relaxed);
        self.total_collection_us
            .fetch_add(report.collection.as_micros() as u64, Ordering::Relaxed);
        self.managed_stops
            .fetch_add(report.stopped_from_managed as u64, Ordering::Relaxed);
        self.native_stops
            .fetch_add(report.stopped_from_native as u64, Ordering::Relaxed);
    }

    /// Completed cycles
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Longest pause so far
    pub fn max_pause(&self) -> Duration {
        Duration::from_micros(self.max_pause_us.load(Ordering::Relaxed))
    }

    /// Pause of the most recent cycle
    pub fn last_pause(&self) -> Duration {
        Duration::from_micros(self.last_pause_us.load(Ordering::Relaxed))
    }

    /// Mean pause, zero before the first cycle
    pub fn average_pause(&self) -> Duration {
        let cycles = self.cycles();
        if cycles == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.total_pause_us.load(Ordering::Relaxed) / cycles)
    }

    /// Point-in-time copy of every counter
    pub fn summary(&self) -> PauseSummary {
        PauseSummary {
            cycles: self.cycles(),
            total_pause_us: self.total_pause_us.load(Ordering::Relaxed),
            max_pause_us: self.max_pause_us.load(Ordering::Relaxed),
            avg_pause_us: self.average_pause().as_micros() as u64,
            total_quiescence_us: self.total_quiescence_us.load(Ordering::Relaxed),
            total_collection_us: self.total_collection_us.load(Ordering::Relaxed),
            managed_stops: self.managed_stops.load(Ordering::Relaxed),
            native_stops: self.native_stops.load(Ordering::Relaxed),
        }
    }

    /// Reset every counter
    pub fn reset(&self) {
        for counter in [
            &self.cycles,
            &self.total_pause_us,
            &self.max_pause_us,
            &self.last_pause_us,
            &self.total_quiescence_us,
            &self.total_collection_us,
            &self.managed_stops,
            &self.native_stops,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PauseSummary {
    pub cycles: u64,
    pub total_pause_us: u64,
    pub max_pause_us: u64,
    pub avg_pause_us: u64,
    pub total_quiescence_us: u64,
    pub total_collection_us: u64,
    pub managed_stops: u64,
    pub native_stops: u64,
}

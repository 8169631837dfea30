use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters shared between the importer loop and the status endpoint.
#[derive(Debug, Default)]
pub struct ImporterStats {
    records_received: AtomicU64,
    points_written: AtomicU64,
    points_invalid: AtomicU64,
    points_dropped: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    database_ready: AtomicBool,
    running: AtomicBool,
    exited: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub records_received: u64,
    pub points_written: u64,
    pub points_invalid: u64,
    pub points_dropped: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
    pub database_ready: bool,
    pub running: bool,
}

impl ImporterStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_received(&self) {
        self.records_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn point_invalid(&self) {
        self.points_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn flush_succeeded(&self, points: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.points_written
            .fetch_add(points as u64, Ordering::Relaxed);
    }

    pub(crate) fn flush_failed(&self, points: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
        self.points_dropped
            .fetch_add(points as u64, Ordering::Relaxed);
    }

    pub(crate) fn set_database_ready(&self) {
        self.database_ready.store(true, Ordering::Relaxed);
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
        if !running {
            self.exited.store(true, Ordering::Relaxed);
        }
    }

    /// Ready once the database exists and the flush loop is consuming.
    pub fn is_ready(&self) -> bool {
        self.database_ready.load(Ordering::Relaxed) && self.running.load(Ordering::Relaxed)
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            records_received: self.records_received.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            points_invalid: self.points_invalid.load(Ordering::Relaxed),
            points_dropped: self.points_dropped.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            database_ready: self.database_ready.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

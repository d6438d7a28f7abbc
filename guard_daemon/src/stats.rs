//! Orchestrator-owned counters, published via a snapshot method.
//!
//! Replaces a shared mutable dictionary mutated from multiple threads with
//! plain atomics — no lock is needed since each counter is independently
//! meaningful and reads don't need to be consistent with one another.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Stats {
    files_checked: AtomicU64,
    violations_detected: AtomicU64,
    files_restored: AtomicU64,
    ransomware_detected: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub files_checked: u64,
    pub violations_detected: u64,
    pub files_restored: u64,
    pub ransomware_detected: u64,
}

impl Stats {
    pub fn record_file_checked(&self) {
        self.files_checked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_violation(&self) {
        self.violations_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_restored(&self) {
        self.files_restored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ransomware_detected(&self) {
        self.ransomware_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            files_checked: self.files_checked.load(Ordering::Relaxed),
            violations_detected: self.violations_detected.load(Ordering::Relaxed),
            files_restored: self.files_restored.load(Ordering::Relaxed),
            ransomware_detected: self.ransomware_detected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counts() {
        let stats = Stats::default();
        stats.record_file_checked();
        stats.record_file_checked();
        stats.record_violation();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.files_checked, 2);
        assert_eq!(snapshot.violations_detected, 1);
    }
}

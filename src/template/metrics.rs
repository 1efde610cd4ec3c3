//! Dictionary metrics for monitoring template traffic.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters over dictionary activity.
///
/// All counters use atomic operations so they can be read from any thread
/// while the preprocessor keeps writing.
#[derive(Debug, Default)]
pub struct DictionaryMetrics {
    /// Number of successful template lookups
    pub hits: AtomicU64,
    /// Number of failed template lookups
    pub misses: AtomicU64,
    /// Number of templates learned
    pub adds: AtomicU64,
    /// Number of re-announcements with an unchanged layout
    pub refreshes: AtomicU64,
    /// Number of re-announcements that changed the layout
    pub supersedes: AtomicU64,
    /// Number of explicit withdrawals honoured
    pub withdrawals: AtomicU64,
    /// Number of templates that aged out of a UDP source
    pub expirations: AtomicU64,
    /// Number of templates pushed out by the capacity backstop
    pub evictions: AtomicU64,
}

impl DictionaryMetrics {
    /// Create a new metrics instance with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_add(&self) {
        self.adds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_refresh(&self) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_supersede(&self) {
        self.supersedes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_withdrawal(&self) {
        self.withdrawals.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_expiration(&self) {
        self.expirations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            adds: self.adds.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            supersedes: self.supersedes.load(Ordering::Relaxed),
            withdrawals: self.withdrawals.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.adds.store(0, Ordering::Relaxed);
        self.refreshes.store(0, Ordering::Relaxed);
        self.supersedes.store(0, Ordering::Relaxed);
        self.withdrawals.store(0, Ordering::Relaxed);
        self.expirations.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

/// A consistent view of the counters, free of atomic loads per field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Number of successful template lookups
    pub hits: u64,
    /// Number of failed template lookups
    pub misses: u64,
    /// Number of templates learned
    pub adds: u64,
    /// Number of re-announcements with an unchanged layout
    pub refreshes: u64,
    /// Number of re-announcements that changed the layout
    pub supersedes: u64,
    /// Number of explicit withdrawals honoured
    pub withdrawals: u64,
    /// Number of templates that aged out of a UDP source
    pub expirations: u64,
    /// Number of templates pushed out by the capacity backstop
    pub evictions: u64,
}

impl MetricsSnapshot {
    /// Lookup hit rate from 0.0 to 1.0, or `None` before the first lookup.
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits + self.misses;
        if total == 0 {
            None
        } else {
            Some(self.hits as f64 / total as f64)
        }
    }

    /// Total number of template lookups.
    pub fn total_lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_snapshots() {
        let metrics = DictionaryMetrics::new();

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_add();
        metrics.record_withdrawal();
        metrics.record_expiration();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.adds, 1);
        assert_eq!(snapshot.withdrawals, 1);
        assert_eq!(snapshot.expirations, 1);
        assert_eq!(snapshot.evictions, 0);
    }

    #[test]
    fn hit_rate() {
        let metrics = DictionaryMetrics::new();
        assert_eq!(metrics.snapshot().hit_rate(), None);

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hit_rate(), Some(0.75));
        assert_eq!(snapshot.total_lookups(), 4);
    }

    #[test]
    fn reset() {
        let metrics = DictionaryMetrics::new();
        metrics.record_hit();
        metrics.record_add();
        metrics.reset();

        assert_eq!(metrics.snapshot(), MetricsSnapshot {
            hits: 0,
            misses: 0,
            adds: 0,
            refreshes: 0,
            supersedes: 0,
            withdrawals: 0,
            expirations: 0,
            evictions: 0,
        });
    }
}

//! Global atomic counters for Nomina observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters; no allocation, no locking.
pub struct Metrics {
    evaluations_computed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    stale_entries: AtomicU64,
    generations_ranked: AtomicU64,
    runs_completed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            evaluations_computed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            stale_entries: AtomicU64::new(0),
            generations_ranked: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
        }
    }

    pub fn inc_evaluations(&self) {
        self.evaluations_computed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "evaluations_computed", "counter incremented");
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A stale entry is also counted as a miss by the caller.
    pub fn inc_stale_entries(&self) {
        self.stale_entries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "stale_entries", "counter incremented");
    }

    pub fn inc_generations(&self) {
        self.generations_ranked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_runs_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a run, daemon tick)
    /// rather than on every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            evaluations_computed = self.evaluations_computed(),
            cache_hits = self.cache_hits(),
            cache_misses = self.cache_misses(),
            stale_entries = self.stale_entries(),
            generations_ranked = self.generations_ranked(),
            runs_completed = self.runs_completed(),
        );
    }

    pub fn evaluations_computed(&self) -> u64 {
        self.evaluations_computed.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn stale_entries(&self) -> u64 {
        self.stale_entries.load(Ordering::Relaxed)
    }

    pub fn generations_ranked(&self) -> u64 {
        self.generations_ranked.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.evaluations_computed.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.stale_entries.store(0, Ordering::Relaxed);
        self.generations_ranked.store(0, Ordering::Relaxed);
        self.runs_completed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.evaluations_computed(), 0);
        m.inc_evaluations();
        m.inc_evaluations();
        assert_eq!(m.evaluations_computed(), 2);

        m.inc_cache_hits();
        m.inc_cache_misses();
        m.inc_stale_entries();
        assert_eq!(m.cache_hits(), 1);
        assert_eq!(m.cache_misses(), 1);
        assert_eq!(m.stale_entries(), 1);

        m.inc_generations();
        m.inc_runs_completed();
        assert_eq!(m.generations_ranked(), 1);
        assert_eq!(m.runs_completed(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_evaluations();
        m.inc_cache_hits();
        m.inc_generations();
        m.reset();
        assert_eq!(m.evaluations_computed(), 0);
        assert_eq!(m.cache_hits(), 0);
        assert_eq!(m.generations_ranked(), 0);
    }
}

//! Structured observability hooks for Nomina run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via the `RunSpan` RAII guard
//! - Emission functions for run, generation, domain, cell and cache events
//!
//! Events are emitted at `info!` (or `warn!` for exclusions and failures)
//! and filtered through `NOMINA_LOG`.

use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("3f2a...");
/// // every event below carries run_id = "3f2a..."
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with the run_id.
    pub fn enter(run_id: &str) -> Self {
        let span = tracing::info_span!("nomina.run", run_id = %run_id);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: run started with its trigger mode.
pub fn emit_run_started(run_id: &str, trigger: &str, domains: usize) {
    info!(event = "run.started", run_id = %run_id, trigger = %trigger, domains = domains);
}

/// Emit event: run finished.
pub fn emit_run_finished(
    run_id: &str,
    duration_ms: u64,
    cells: u64,
    best_fitness: f64,
    completed: bool,
) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        cells = cells,
        best_fitness = best_fitness,
        completed = completed,
    );
}

/// Emit event: a generation was ranked.
pub fn emit_generation_ranked(run_id: &str, generation: u32, best_fitness: f64, population: usize) {
    info!(
        event = "generation.ranked",
        run_id = %run_id,
        generation = generation,
        best_fitness = best_fitness,
        population = population,
    );
}

/// Emit event: a domain was left out of a run (inactive, degraded, or
/// below the minimum sample).
pub fn emit_domain_excluded(run_id: &str, domain: &str, reason: &str) {
    warn!(event = "domain.excluded", run_id = %run_id, domain = %domain, reason = %reason);
}

/// Emit event: a (domain, formula) cell could not be evaluated.
pub fn emit_cell_invalid(run_id: &str, domain: &str, formula: &str, reason: &str) {
    warn!(
        event = "cell.invalid",
        run_id = %run_id,
        domain = %domain,
        formula = %formula,
        reason = %reason,
    );
}

/// Emit event: a cache entry was recorded at stale versions and will be recomputed.
pub fn emit_cache_stale(run_id: &str, key: &str, detail: &dyn std::fmt::Display) {
    info!(event = "cache.stale", run_id = %run_id, key = %key, detail = %detail);
}

/// Emit event: run cancelled between batches.
pub fn emit_run_cancelled(run_id: &str, reason: &str) {
    warn!(event = "run.cancelled", run_id = %run_id, reason = %reason);
}

//! Bounded worker pool for (domain, formula) evaluation cells.
//!
//! Workers read the cache and the immutable domain snapshot they were
//! handed at dispatch; only the coordinator (the caller of
//! [`evaluate_cells`]) writes computed results back into the cache.
//! Cancellation is observed before each cell starts, so a cancelled batch
//! still returns every cell that finished.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::cache::{CacheLookup, EvaluationCache};
use crate::domain::error::{CacheError, CellResult, EngineError, Result};
use crate::domain::evaluation::{CacheKey, EvaluationResult};
use crate::domain::formula::Formula;
use crate::evaluator::CorrelationEvaluator;
use crate::metrics::METRICS;
use crate::obs;
use crate::snapshot::DomainSnapshot;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Operator-side cancellation switch, shared between the scheduler and
/// whoever may stop a run (CLI signal handler, daemon shutdown).
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Clear a previous cancellation before starting a new run.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Per-run view combining the operator switch with an optional timeout.
    pub fn control(&self, timeout: Option<Duration>) -> RunControl {
        RunControl {
            rx: self.tx.subscribe(),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }
}

/// Cancellation state observed by one run.
#[derive(Debug, Clone)]
pub struct RunControl {
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl RunControl {
    /// A control that never cancels.
    pub fn unbounded() -> Self {
        CancelHandle::new().control(None)
    }

    /// Why the run must stop, if it must.
    pub fn reason(&self) -> Option<&'static str> {
        if *self.rx.borrow() {
            return Some("operator");
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some("timeout"),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// `Err(Cancelled)` once the run must stop.
    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(_) => Err(EngineError::Cancelled),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

/// One unit of work: a formula against a domain snapshot.
#[derive(Debug, Clone)]
pub struct CellTask {
    pub snapshot: Arc<DomainSnapshot>,
    pub formula: Formula,
}

impl CellTask {
    pub fn new(snapshot: Arc<DomainSnapshot>, formula: Formula) -> Self {
        Self { snapshot, formula }
    }

    pub fn key(&self) -> CacheKey {
        CacheKey {
            domain_id: self.snapshot.domain_id.clone(),
            domain_version: self.snapshot.version,
            formula_id: self.formula.id().clone(),
            formula_version: self.formula.version().to_string(),
        }
    }
}

/// Where a cell's result came from.
#[derive(Debug, Clone, PartialEq)]
pub enum CellSource {
    Cached,
    Computed,
    /// A cache entry existed at other versions and was bypassed.
    Recomputed(CacheError),
}

impl CellSource {
    pub fn is_cached(&self) -> bool {
        matches!(self, CellSource::Cached)
    }
}

/// A finished cell.
#[derive(Debug, Clone)]
pub struct CellReport {
    pub task: CellTask,
    pub outcome: CellResult<EvaluationResult>,
    pub source: CellSource,
}

/// Everything a batch produced.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub reports: Vec<CellReport>,
    /// Cells never started because the run was cancelled.
    pub skipped: usize,
    pub cancelled: Option<&'static str>,
}

impl BatchOutcome {
    pub fn cache_hits(&self) -> usize {
        self.reports.iter().filter(|r| r.source.is_cached()).count()
    }

    pub fn computed(&self) -> usize {
        self.reports.len() - self.cache_hits()
    }

    pub fn stale(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.source, CellSource::Recomputed(_)))
            .count()
    }
}

/// Evaluate `tasks` on at most `max_workers` concurrent workers.
///
/// Cache hits are returned without calling the evaluator. Computed results
/// are appended to the cache by this function after the worker returns.
/// Only a crashed worker task is an error; per-cell failures are reported
/// in [`CellReport::outcome`].
#[instrument(skip_all, fields(run_id = %run_id, cells = tasks.len()))]
pub async fn evaluate_cells(
    run_id: &str,
    tasks: Vec<CellTask>,
    cache: Arc<EvaluationCache>,
    evaluator: Arc<CorrelationEvaluator>,
    max_workers: usize,
    control: &RunControl,
) -> Result<BatchOutcome> {
    let sem = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut handles = Vec::with_capacity(tasks.len());

    for task in tasks {
        let sem = Arc::clone(&sem);
        let cache = Arc::clone(&cache);
        let evaluator = Arc::clone(&evaluator);
        let control = control.clone();

        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok();

            if control.is_cancelled() {
                return None;
            }

            let key = task.key();
            let source = match cache.lookup(&key) {
                CacheLookup::Hit(result) => {
                    return Some(CellReport {
                        task,
                        outcome: Ok(result),
                        source: CellSource::Cached,
                    });
                }
                CacheLookup::Miss => CellSource::Computed,
                CacheLookup::Stale(err) => CellSource::Recomputed(err),
            };

            let outcome = evaluator.evaluate(&task.snapshot, &task.formula);
            Some(CellReport {
                task,
                outcome,
                source,
            })
        }));
    }

    let mut batch = BatchOutcome::default();
    for handle in handles {
        let report = handle
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?;
        let Some(report) = report else {
            batch.skipped += 1;
            continue;
        };

        match &report.source {
            CellSource::Cached => METRICS.inc_cache_hits(),
            CellSource::Computed => {
                METRICS.inc_cache_misses();
                METRICS.inc_evaluations();
            }
            CellSource::Recomputed(stale) => {
                METRICS.inc_cache_misses();
                METRICS.inc_stale_entries();
                METRICS.inc_evaluations();
                obs::emit_cache_stale(run_id, &report.task.key().to_string(), stale);
            }
        }
        if !report.source.is_cached() {
            if let Ok(result) = &report.outcome {
                cache.insert(result.clone());
            }
        }
        batch.reports.push(report);
    }

    if batch.skipped > 0 {
        batch.cancelled = control.reason().or(Some("operator"));
    }
    debug!(
        reports = batch.reports.len(),
        hits = batch.cache_hits(),
        skipped = batch.skipped,
        "batch finished"
    );
    Ok(batch)
}

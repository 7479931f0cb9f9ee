//! Scheduler and run coordinator.
//!
//! One [`Scheduler`] owns the registries, caches and Result Store handle and
//! runs one trigger at a time:
//!
//! - `daily`: re-evaluate the best formulas of the latest generation on
//!   every active domain.
//! - `weekly`: run an evolution cycle from the latest generation checkpoint.
//! - `on-demand`: evaluate the current population on new or changed
//!   domains only, optionally followed by an evolution cycle.
//!
//! Each domain is snapshotted once per run before any cell is dispatched.
//! Generation N+1 is not dispatched until generation N is ranked and
//! checkpointed. Cancellation is checked between batches; a cancelled run
//! still writes its partial report.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};

use nomina_store::{EvaluationRecord, GenerationRecord, ResultStore, RunId};

use crate::cache::EvaluationCache;
use crate::config::EngineConfig;
use crate::domain::error::{CellError, EngineError, RegistryError, Result};
use crate::domain::evaluation::EvaluationResult;
use crate::domain::formula::Formula;
use crate::domain::generation::Generation;
use crate::domain::ids::{DomainId, FormulaId};
use crate::evaluator::{self, CorrelationEvaluator, FitnessMatrix};
use crate::evolution::{EvolutionCycle, EvolutionEngine, EvolutionState};
use crate::features::{FeatureCache, FeatureProvider};
use crate::formula_registry::FormulaRegistry;
use crate::invariants::InvariantDetector;
use crate::metrics::METRICS;
use crate::obs::{self, RunSpan};
use crate::pool::{self, CancelHandle, CellTask, RunControl};
use crate::registry::{DomainRegistry, DomainStatus};
use crate::report::{
    universal_features, AnalysisReport, AnalysisRun, BestFormula, Coverage, DomainReport,
    DomainRunStatus, DominantFeature, GenerationSummary, InvalidFormula, RunBest, RunStats,
    RunStatus, RunStatusSummary, TriggerMode,
};
use crate::snapshot::DomainSnapshot;

type CoveredVersions = BTreeMap<DomainId, (u64, Option<String>)>;

/// Keep the highest version seen per domain.
fn merge_coverage(covered: &mut CoveredVersions, coverage: Coverage) {
    let mut fingerprints = coverage.fingerprints;
    for (id, version) in coverage.domains {
        let fingerprint = fingerprints.remove(&id);
        match covered.get(&id) {
            Some((seen, _)) if *seen >= version => {}
            _ => {
                covered.insert(id, (version, fingerprint));
            }
        }
    }
}

/// Ledger entry persisted for every computed evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    result: EvaluationResult,
    formula: Formula,
}

/// Outcome of re-running a historical evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ReproducibilityCheck {
    /// Coefficient, p-value and sample size are bit-identical.
    Reproduced,
    Diverged {
        recorded: EvaluationResult,
        live: EvaluationResult,
    },
    /// The domain has moved on; the historical result cannot be re-derived.
    VersionChanged { recorded: u64, live: u64 },
    UnknownFormula { formula_id: FormulaId },
    Failed { reason: String },
}

/// Mutable state of one run.
struct RunState {
    run_id: RunId,
    trigger: TriggerMode,
    started_at: DateTime<Utc>,
    snapshots: BTreeMap<DomainId, Arc<DomainSnapshot>>,
    domains: BTreeMap<DomainId, DomainReport>,
    matrix: FitnessMatrix,
    formulas: BTreeMap<FormulaId, Formula>,
    generations: Vec<GenerationSummary>,
    last_ranked: Option<Generation>,
    stats: RunStats,
    pending: Vec<EvaluationRecord>,
}

impl RunState {
    fn new(trigger: TriggerMode) -> Self {
        Self {
            run_id: RunId::new(),
            trigger,
            started_at: Utc::now(),
            snapshots: BTreeMap::new(),
            domains: BTreeMap::new(),
            matrix: FitnessMatrix::new(),
            formulas: BTreeMap::new(),
            generations: Vec::new(),
            last_ranked: None,
            stats: RunStats::default(),
            pending: Vec::new(),
        }
    }

    fn id(&self) -> &str {
        &self.run_id.0
    }

    fn prepared(&self, id: &DomainId) -> bool {
        self.domains
            .get(id)
            .is_some_and(|d| d.status != DomainRunStatus::Unaffected)
    }

    fn exclude(&mut self, report: DomainReport) {
        obs::emit_domain_excluded(&self.run_id.0, report.domain_id.as_str(), &report.status.label());
        self.domains.insert(report.domain_id.clone(), report);
    }
}

pub struct Scheduler {
    config: EngineConfig,
    domains: Arc<DomainRegistry>,
    formulas: Arc<FormulaRegistry>,
    provider: Arc<dyn FeatureProvider>,
    features: FeatureCache,
    cache: Arc<EvaluationCache>,
    evaluator: Arc<CorrelationEvaluator>,
    evolution: EvolutionEngine,
    invariants: InvariantDetector,
    store: Arc<dyn ResultStore>,
    covered: Mutex<Option<CoveredVersions>>,
    cancel: CancelHandle,
    run_lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(
        config: EngineConfig,
        domains: Arc<DomainRegistry>,
        provider: Arc<dyn FeatureProvider>,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self> {
        config.validate()?;
        let formulas = Arc::new(FormulaRegistry::new(
            provider.feature_names(),
            config.evolution.max_terms,
        ));
        Ok(Self {
            evaluator: Arc::new(CorrelationEvaluator::new(config.min_sample)),
            evolution: EvolutionEngine::new(config.evolution.clone(), Arc::clone(&formulas)),
            invariants: InvariantDetector::new(config.invariants.clone()),
            formulas,
            domains,
            provider,
            features: FeatureCache::new(),
            cache: Arc::new(EvaluationCache::new()),
            store,
            covered: Mutex::new(None),
            cancel: CancelHandle::new(),
            run_lock: Mutex::new(()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn domains(&self) -> &Arc<DomainRegistry> {
        &self.domains
    }

    pub fn formulas(&self) -> &Arc<FormulaRegistry> {
        &self.formulas
    }

    pub fn cache(&self) -> &Arc<EvaluationCache> {
        &self.cache
    }

    pub fn evaluator(&self) -> &Arc<CorrelationEvaluator> {
        &self.evaluator
    }

    /// Handle that cancels the run in progress.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Load the persisted evaluation ledger into the cache and the formula
    /// registry. Returns how many results were new to the cache.
    ///
    /// Domain versions are first carried over from stored run coverage so
    /// that ledger entries keyed by an earlier process's versions only hit
    /// when the content is unchanged.
    pub async fn warm_cache(&self) -> Result<usize> {
        self.restore_domain_versions().await?;
        let records = self.store.evaluations().await?;
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let entry: LedgerEntry = match serde_json::from_value(record.payload) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(key = %record.cache_key, error = %e, "skipping unreadable ledger entry");
                    continue;
                }
            };
            if let Err(e) = self.formulas.register(entry.formula) {
                debug!(key = %record.cache_key, error = %e, "ledger formula not registered");
            }
            results.push(entry.result);
        }
        let loaded = self.cache.warm(results);
        info!(loaded, cached = self.cache.len(), "evaluation cache warmed");
        Ok(loaded)
    }

    /// The latest checkpointed generation, with its formulas registered.
    pub async fn current_generation(&self) -> Result<Option<Generation>> {
        let Some(record) = self.store.latest_generation().await? else {
            return Ok(None);
        };
        let generation: Generation = serde_json::from_value(record.payload)?;
        for member in &generation.members {
            if let Err(e) = self.formulas.register(member.formula.clone()) {
                warn!(formula = %member.formula.id(), error = %e, "checkpointed formula rejected");
            }
        }
        Ok(Some(generation))
    }

    pub async fn run_daily(&self) -> Result<AnalysisReport> {
        self.trigger(TriggerMode::Daily).await
    }

    pub async fn run_weekly(&self) -> Result<AnalysisReport> {
        self.trigger(TriggerMode::Weekly).await
    }

    pub async fn run_on_demand(&self, domain: Option<DomainId>) -> Result<AnalysisReport> {
        self.trigger(TriggerMode::OnDemand { domain }).await
    }

    /// Run one trigger to completion (or cancellation) and persist its report.
    ///
    /// Only infrastructure failures are returned as errors; a store that
    /// cannot be written aborts the run.
    pub async fn trigger(&self, mode: TriggerMode) -> Result<AnalysisReport> {
        let _guard = self.run_lock.lock().await;
        self.cancel.reset();
        let control = self
            .cancel
            .control(self.config.scheduler.run_timeout_secs.map(Duration::from_secs));

        let clock = Instant::now();
        let mut run = RunState::new(mode.clone());
        let span = tracing::info_span!("nomina.trigger", run_id = %run.run_id, trigger = %mode);

        let changed = self.domains.refresh_all().instrument(span.clone()).await;
        if !changed.is_empty() {
            debug!(?changed, "domain versions bumped on refresh");
        }
        obs::emit_run_started(run.id(), mode.as_str(), self.domains.len());

        let outcome = match &mode {
            TriggerMode::Daily => self.daily(&mut run, &control).instrument(span.clone()).await,
            TriggerMode::Weekly => self.weekly(&mut run, &control).instrument(span.clone()).await,
            TriggerMode::OnDemand { domain } => {
                self.on_demand(&mut run, domain.as_ref(), &control)
                    .instrument(span.clone())
                    .await
            }
        };

        let status = match outcome {
            Ok(()) => RunStatus::Completed,
            Err(EngineError::Cancelled) => {
                let reason = control.reason().unwrap_or("operator");
                obs::emit_run_cancelled(run.id(), reason);
                RunStatus::Cancelled {
                    reason: reason.to_string(),
                }
            }
            Err(e) => return Err(e),
        };

        self.flush_evaluations(&mut run).await?;
        let report = self.build_report(run, status);
        let record = report.to_record()?;
        self.store.append_run(record).await?;
        self.record_coverage(&report.coverage).await;

        METRICS.inc_runs_completed();
        METRICS.flush();
        obs::emit_run_finished(
            &report.run_id.0,
            clock.elapsed().as_millis() as u64,
            report.stats.cells as u64,
            report.aggregate_fitness,
            report.status == RunStatus::Completed,
        );
        Ok(report)
    }

    /// Latest run id and headline numbers.
    pub async fn status(&self) -> Result<Option<RunStatusSummary>> {
        let Some(record) = self.store.latest_run().await? else {
            return Ok(None);
        };
        let report = AnalysisReport::from_record(&record)?;
        Ok(Some(RunStatusSummary::from_report(&report, record.report_digest)))
    }

    /// Every stored run, newest first.
    pub async fn runs(&self) -> Result<Vec<AnalysisRun>> {
        self.store
            .list_runs()
            .await?
            .iter()
            .map(AnalysisRun::from_record)
            .collect()
    }

    /// Re-evaluate a historical result on the live domain and compare.
    pub async fn verify_reproducible(&self, recorded: &EvaluationResult) -> Result<ReproducibilityCheck> {
        let Some(formula) = self
            .formulas
            .get(&recorded.formula_id)
            .filter(|f| f.version() == recorded.formula_version)
        else {
            return Ok(ReproducibilityCheck::UnknownFormula {
                formula_id: recorded.formula_id.clone(),
            });
        };

        let live = self.domains.version_of(&recorded.domain_id)?;
        if live != recorded.domain_version {
            return Ok(ReproducibilityCheck::VersionChanged {
                recorded: recorded.domain_version,
                live,
            });
        }
        let snapshot = match DomainSnapshot::capture(
            &self.domains,
            &recorded.domain_id,
            self.provider.as_ref(),
            &self.features,
        )
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => return Ok(ReproducibilityCheck::Failed { reason: e.to_string() }),
        };
        if snapshot.version != recorded.domain_version {
            return Ok(ReproducibilityCheck::VersionChanged {
                recorded: recorded.domain_version,
                live: snapshot.version,
            });
        }

        Ok(match self.evaluator.evaluate(&snapshot, &formula) {
            Ok(live) if live.same_statistics(recorded) => ReproducibilityCheck::Reproduced,
            Ok(live) => ReproducibilityCheck::Diverged {
                recorded: recorded.clone(),
                live,
            },
            Err(e) => ReproducibilityCheck::Failed { reason: e.to_string() },
        })
    }

    /// Re-check the `limit` most recently persisted evaluations.
    pub async fn verify_ledger(
        &self,
        limit: usize,
    ) -> Result<Vec<(EvaluationResult, ReproducibilityCheck)>> {
        let records = self.store.evaluations().await?;
        let skip = records.len().saturating_sub(limit);
        let mut checks = Vec::new();
        for record in records.into_iter().skip(skip) {
            let entry: LedgerEntry = match serde_json::from_value(record.payload) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(key = %record.cache_key, error = %e, "skipping unreadable ledger entry");
                    continue;
                }
            };
            if let Err(e) = self.formulas.register(entry.formula) {
                debug!(key = %record.cache_key, error = %e, "ledger formula not registered");
            }
            let check = self.verify_reproducible(&entry.result).await?;
            checks.push((entry.result, check));
        }
        Ok(checks)
    }

    // -----------------------------------------------------------------------
    // Trigger bodies
    // -----------------------------------------------------------------------

    async fn daily(&self, run: &mut RunState, control: &RunControl) -> Result<()> {
        self.prepare_domains(run, None, control).await?;
        match self.current_generation().await? {
            Some(current) => {
                let mut population = current.top(self.config.scheduler.daily_top_k);
                if population.is_empty() {
                    population = current.formulas();
                    population.truncate(self.config.scheduler.daily_top_k);
                }
                self.evaluate_population(run, &population, control).await?;
                self.rank(run, current.number, &population);
            }
            None => {
                info!(run_id = %run.run_id, "no generation checkpoint, seeding generation 0");
                let population = self.seed();
                self.evaluate_population(run, &population, control).await?;
                let ranked = self.rank(run, 0, &population);
                self.checkpoint(run, &ranked).await?;
            }
        }
        Ok(())
    }

    async fn weekly(&self, run: &mut RunState, control: &RunControl) -> Result<()> {
        self.prepare_domains(run, None, control).await?;
        self.evolve(run, control).await
    }

    async fn on_demand(
        &self,
        run: &mut RunState,
        requested: Option<&DomainId>,
        control: &RunControl,
    ) -> Result<()> {
        let affected: BTreeSet<DomainId> = match requested {
            Some(id) => {
                self.domains.info(id)?;
                BTreeSet::from([id.clone()])
            }
            None => self.uncovered_domains().await?,
        };
        info!(run_id = %run.run_id, affected = affected.len(), "on-demand evaluation");

        self.prepare_domains(run, Some(&affected), control).await?;
        let (number, population) = match self.current_generation().await? {
            Some(current) => (current.number, current.formulas()),
            None => (0, self.seed()),
        };
        self.evaluate_population(run, &population, control).await?;
        self.rank(run, number, &population);

        if self.config.scheduler.on_demand_evolve {
            control.check()?;
            self.prepare_domains(run, None, control).await?;
            self.evolve(run, control).await?;
        }
        Ok(())
    }

    /// Highest covered version per domain across stored runs, with the
    /// content fingerprint recorded at that version. Read from the store
    /// once, then kept current as this scheduler appends runs.
    async fn covered_versions(&self) -> Result<CoveredVersions> {
        let mut covered = self.covered.lock().await;
        if let Some(map) = covered.as_ref() {
            return Ok(map.clone());
        }
        let mut map = CoveredVersions::new();
        for record in self.store.list_runs().await? {
            match AnalysisReport::from_record(&record) {
                Ok(report) => merge_coverage(&mut map, report.coverage),
                Err(e) => warn!(run_id = %record.run_id, error = %e, "skipping unreadable run report"),
            }
        }
        debug!(domains = map.len(), "coverage loaded from stored runs");
        *covered = Some(map.clone());
        Ok(map)
    }

    async fn record_coverage(&self, coverage: &Coverage) {
        if let Some(map) = self.covered.lock().await.as_mut() {
            merge_coverage(map, coverage.clone());
        }
    }

    async fn restore_domain_versions(&self) -> Result<()> {
        for (id, (version, fingerprint)) in self.covered_versions().await? {
            match self.domains.restore_version(&id, version, fingerprint.as_deref()) {
                Ok(live) => debug!(domain = %id, covered = version, live, "domain version restored"),
                Err(RegistryError::UnknownDomain(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Domains whose live version no stored run has covered.
    pub async fn uncovered_domains(&self) -> Result<BTreeSet<DomainId>> {
        let covered: BTreeMap<DomainId, u64> = self
            .covered_versions()
            .await?
            .into_iter()
            .map(|(id, (version, _))| (id, version))
            .collect();
        Ok(self
            .domains
            .list_domains()
            .into_iter()
            .filter(|d| covered.get(&d.id) != Some(&d.version))
            .map(|d| d.id)
            .collect())
    }

    /// One evolution cycle from the latest checkpoint, or from a fresh seed.
    async fn evolve(&self, run: &mut RunState, control: &RunControl) -> Result<()> {
        let (start, mut population) = match self.current_generation().await? {
            Some(current) => (current.number + 1, self.evolution.next_population(&current)),
            None => (0, self.seed()),
        };
        let mut cycle = EvolutionCycle::seeded(start, self.evolution.config());
        loop {
            control.check()?;
            cycle.begin_evaluation();
            self.evaluate_population(run, &population, control).await?;
            let ranked = self.rank(run, cycle.generation(), &population);
            self.checkpoint(run, &ranked).await?;
            match cycle.record_ranking(&ranked) {
                EvolutionState::Converged => {
                    info!(
                        run_id = %run.run_id,
                        generation = ranked.number,
                        reason = ?cycle.stop_reason(),
                        "evolution cycle converged"
                    );
                    return Ok(());
                }
                _ => population = self.evolution.next_population(&ranked),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    fn seed(&self) -> Vec<Formula> {
        let evo = self.evolution.config();
        self.formulas.seed(evo.population_size, evo.seed)
    }

    /// Snapshot eligible domains and record why the others are excluded.
    /// With `only`, every other domain is marked unaffected. Domains already
    /// prepared in this run are left alone.
    async fn prepare_domains(
        &self,
        run: &mut RunState,
        only: Option<&BTreeSet<DomainId>>,
        control: &RunControl,
    ) -> Result<()> {
        for info in self.domains.list_domains() {
            if run.prepared(&info.id) {
                continue;
            }
            if only.is_some_and(|set| !set.contains(&info.id)) {
                run.domains.insert(
                    info.id.clone(),
                    DomainReport::excluded(
                        info.id.clone(),
                        info.display_name.clone(),
                        info.version,
                        DomainRunStatus::Unaffected,
                    ),
                );
                continue;
            }
            control.check()?;

            let excluded = |status| {
                DomainReport::excluded(info.id.clone(), info.display_name.clone(), info.version, status)
            };
            match &info.status {
                DomainStatus::Inactive => {
                    run.exclude(excluded(DomainRunStatus::Inactive));
                    continue;
                }
                DomainStatus::Unavailable { reason } => {
                    run.exclude(excluded(DomainRunStatus::Degraded {
                        reason: reason.clone(),
                    }));
                    continue;
                }
                DomainStatus::Active => {}
            }

            let snapshot = match DomainSnapshot::capture(
                &self.domains,
                &info.id,
                self.provider.as_ref(),
                &self.features,
            )
            .await
            {
                Ok(snapshot) => snapshot,
                Err(RegistryError::DomainUnavailable { reason, .. }) => {
                    run.exclude(excluded(DomainRunStatus::Degraded { reason }));
                    continue;
                }
                Err(e) => {
                    run.exclude(excluded(DomainRunStatus::Degraded {
                        reason: e.to_string(),
                    }));
                    continue;
                }
            };

            let mut report = DomainReport::excluded(
                info.id.clone(),
                snapshot.display_name.clone(),
                snapshot.version,
                DomainRunStatus::Evaluated,
            );
            report.entities_listed = snapshot.listed();
            report.entities_usable = snapshot.usable();

            if snapshot.listed() == 0 {
                report.status = DomainRunStatus::Inactive;
                run.exclude(report);
                continue;
            }
            if let Err(CellError::InsufficientSample { usable, required, .. }) =
                self.evaluator.check_sample(&snapshot)
            {
                report.status = DomainRunStatus::InsufficientSample {
                    sample_size: usable,
                    required,
                };
                run.exclude(report);
                continue;
            }
            run.domains.insert(info.id.clone(), report);
            run.snapshots.insert(info.id.clone(), Arc::new(snapshot));
        }
        Ok(())
    }

    /// Dispatch every (domain, formula) cell of `population` and fold the
    /// results into the run.
    async fn evaluate_population(
        &self,
        run: &mut RunState,
        population: &[Formula],
        control: &RunControl,
    ) -> Result<()> {
        control.check()?;
        for formula in population {
            run.formulas.insert(formula.id().clone(), formula.clone());
        }
        let tasks: Vec<CellTask> = run
            .snapshots
            .values()
            .flat_map(|snapshot| {
                population
                    .iter()
                    .map(move |f| CellTask::new(Arc::clone(snapshot), f.clone()))
            })
            .collect();
        if tasks.is_empty() {
            return Ok(());
        }

        let batch = pool::evaluate_cells(
            run.id(),
            tasks,
            Arc::clone(&self.cache),
            Arc::clone(&self.evaluator),
            self.config.max_workers,
            control,
        )
        .await?;
        run.stats.absorb(&batch);

        for report in &batch.reports {
            let domain = &report.task.snapshot.domain_id;
            let formula = &report.task.formula;
            run.matrix.record(formula, domain, &report.outcome);
            match &report.outcome {
                Ok(result) if !report.source.is_cached() => run.pending.push(EvaluationRecord {
                    run_id: run.run_id.clone(),
                    cache_key: result.key().to_string(),
                    payload: serde_json::to_value(LedgerEntry {
                        result: result.clone(),
                        formula: formula.clone(),
                    })?,
                    recorded_at: Utc::now(),
                }),
                Ok(_) => {}
                Err(e) => obs::emit_cell_invalid(
                    &run.run_id.0,
                    domain.as_str(),
                    formula.id().as_str(),
                    &e.to_string(),
                ),
            }
        }

        if batch.cancelled.is_some() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    fn rank(&self, run: &mut RunState, number: u32, population: &[Formula]) -> Generation {
        let ranked = run.matrix.rank(number, population);
        METRICS.inc_generations();
        obs::emit_generation_ranked(run.id(), number, ranked.best_fitness(), population.len());
        run.generations.push(GenerationSummary {
            number,
            best_fitness: ranked.best_fitness(),
            best_formula: ranked.best().map(|b| b.formula.id().clone()),
            population: ranked.members.len(),
            globally_invalid: ranked.members.iter().filter(|m| m.globally_invalid).count(),
        });
        run.last_ranked = Some(ranked.clone());
        ranked
    }

    /// Persist pending evaluations, then the ranked generation.
    async fn checkpoint(&self, run: &mut RunState, ranked: &Generation) -> Result<()> {
        self.flush_evaluations(run).await?;
        self.store
            .append_generation(GenerationRecord {
                run_id: run.run_id.clone(),
                generation: ranked.number,
                best_fitness: ranked.best_fitness(),
                payload: serde_json::to_value(ranked)?,
                recorded_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    async fn flush_evaluations(&self, run: &mut RunState) -> Result<()> {
        if run.pending.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut run.pending);
        debug!(run_id = %run.run_id, records = records.len(), "appending evaluation ledger");
        self.store.append_evaluations(records).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Report
    // -----------------------------------------------------------------------

    fn build_report(&self, run: RunState, status: RunStatus) -> AnalysisReport {
        let _span = RunSpan::enter(run.id());
        let feature_names: Vec<&str> = self.formulas.features().iter().map(String::as_str).collect();
        let run_best = run.last_ranked.as_ref().and_then(|g| g.best());

        let mut domains = run.domains;
        let mut shares = Vec::new();
        for (id, snapshot) in &run.snapshots {
            let Some(report) = domains.get_mut(id) else {
                continue;
            };
            let mut best: Option<&EvaluationResult> = None;
            for result in run.matrix.results().filter(|r| &r.domain_id == id) {
                if best.map_or(true, |b| result.coefficient.abs() > b.coefficient.abs()) {
                    best = Some(result);
                }
            }
            report.best_formula = best.map(|r| BestFormula {
                formula_id: r.formula_id.clone(),
                formula_version: r.formula_version.clone(),
                expression: run
                    .formulas
                    .get(&r.formula_id)
                    .map(Formula::describe)
                    .unwrap_or_default(),
                coefficient: r.coefficient,
                p_value: r.p_value,
                sample_size: r.sample_size,
            });
            report.dominant_feature = evaluator::dominant_feature(snapshot, feature_names.iter().copied())
                .map(|(feature, coefficient)| DominantFeature {
                    feature,
                    coefficient,
                });
            report.invalid_formulas = run
                .matrix
                .invalid_cells()
                .filter(|(_, d, _)| *d == id)
                .map(|(f, d, reason)| InvalidFormula {
                    formula_id: f.clone(),
                    domain_id: d.clone(),
                    reason: reason.to_string(),
                })
                .collect();
            report.cells = run
                .matrix
                .results()
                .filter(|r| &r.domain_id == id)
                .count()
                + report.invalid_formulas.len();

            if let Some(best) = run_best {
                let valid = run
                    .matrix
                    .valid_results(best.formula.id())
                    .any(|r| &r.domain_id == id);
                shares.push(if valid {
                    evaluator::contribution_shares(&best.formula, snapshot)
                } else {
                    BTreeMap::new()
                });
            }
        }

        let invalid_formulas: Vec<InvalidFormula> = run
            .matrix
            .invalid_cells()
            .map(|(f, d, reason)| InvalidFormula {
                formula_id: f.clone(),
                domain_id: d.clone(),
                reason: reason.to_string(),
            })
            .collect();

        let formulas: Vec<Formula> = run.formulas.values().cloned().collect();
        let results: Vec<EvaluationResult> = run.matrix.results().cloned().collect();
        let invariants = self.invariants.detect(&formulas, &results);

        let coverage = Coverage {
            domains: domains
                .values()
                .filter(|d| d.status != DomainRunStatus::Unaffected)
                .map(|d| (d.domain_id.clone(), d.version))
                .collect(),
            fingerprints: domains
                .values()
                .filter(|d| d.status != DomainRunStatus::Unaffected)
                .filter_map(|d| {
                    self.domains
                        .fingerprint_at(&d.domain_id, d.version)
                        .map(|f| (d.domain_id.clone(), f))
                })
                .collect(),
            formulas: run
                .formulas
                .iter()
                .map(|(id, f)| (id.clone(), f.version().to_string()))
                .collect(),
        };

        AnalysisReport {
            run_id: run.run_id,
            trigger: run.trigger,
            status,
            started_at: run.started_at,
            completed_at: Utc::now(),
            coverage,
            domains: domains.into_values().collect(),
            aggregate_fitness: run_best.map_or(0.0, |b| b.fitness),
            best_formula: run_best.map(|b| RunBest {
                formula_id: b.formula.id().clone(),
                expression: b.formula.describe(),
                fitness: b.fitness,
                generation: run.last_ranked.as_ref().map_or(0, |g| g.number),
                valid_domains: b.valid_domains,
            }),
            universal_features: universal_features(&shares, self.config.report.contribution_threshold),
            invariants,
            invalid_formulas,
            globally_invalid: run
                .last_ranked
                .as_ref()
                .map(|g| {
                    g.members
                        .iter()
                        .filter(|m| m.globally_invalid)
                        .map(|m| m.formula.id().clone())
                        .collect()
                })
                .unwrap_or_default(),
            generations: run.generations,
            stats: run.stats,
        }
    }
}

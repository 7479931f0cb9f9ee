//! Analysis run report.
//!
//! Every run, completed or cancelled, produces one [`AnalysisReport`] that
//! lists excluded and degraded domains and invalid formulas with reasons.
//! The report is stored as JSON in a [`RunRecord`] together with its
//! content digest.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nomina_store::{ContentDigest, RunId, RunOutcome, RunRecord};

use crate::domain::error::Result;
use crate::domain::ids::{DomainId, FormulaId};
use crate::invariants::InvariantReport;

/// How a run was triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TriggerMode {
    Daily,
    Weekly,
    /// A new or changed domain; `None` means "whatever changed".
    OnDemand { domain: Option<DomainId> },
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Daily => "daily",
            TriggerMode::Weekly => "weekly",
            TriggerMode::OnDemand { .. } => "on-demand",
        }
    }
}

impl std::fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerMode::OnDemand { domain: Some(d) } => write!(f, "on-demand({d})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Stopped early; everything evaluated before the stop is still reported.
    Cancelled { reason: String },
}

impl RunStatus {
    pub fn outcome(&self) -> RunOutcome {
        match self {
            RunStatus::Completed => RunOutcome::Completed,
            RunStatus::Cancelled { .. } => RunOutcome::Cancelled,
        }
    }
}

/// Per-domain disposition for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DomainRunStatus {
    Evaluated,
    /// Registered with zero entities.
    Inactive,
    /// The adapter could not supply entities.
    Degraded { reason: String },
    InsufficientSample { sample_size: usize, required: usize },
    /// Not part of this run's trigger (on-demand runs only).
    Unaffected,
}

impl DomainRunStatus {
    /// Excluded from fitness aggregation for a reason worth reporting.
    pub fn is_excluded(&self) -> bool {
        !matches!(self, DomainRunStatus::Evaluated | DomainRunStatus::Unaffected)
    }

    pub fn label(&self) -> String {
        match self {
            DomainRunStatus::Evaluated => "evaluated".to_string(),
            DomainRunStatus::Inactive => "inactive".to_string(),
            DomainRunStatus::Degraded { reason } => format!("degraded: {reason}"),
            DomainRunStatus::InsufficientSample {
                sample_size,
                required,
            } => format!("insufficient sample: {sample_size} of {required}"),
            DomainRunStatus::Unaffected => "unaffected".to_string(),
        }
    }
}

/// A formula that failed on one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidFormula {
    pub formula_id: FormulaId,
    pub domain_id: DomainId,
    pub reason: String,
}

/// The best-scoring formula for one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestFormula {
    pub formula_id: FormulaId,
    pub formula_version: String,
    pub expression: String,
    pub coefficient: f64,
    pub p_value: f64,
    pub sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DominantFeature {
    pub feature: String,
    pub coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainReport {
    pub domain_id: DomainId,
    pub display_name: String,
    pub version: u64,
    pub status: DomainRunStatus,
    pub entities_listed: usize,
    pub entities_usable: usize,
    pub best_formula: Option<BestFormula>,
    pub dominant_feature: Option<DominantFeature>,
    pub invalid_formulas: Vec<InvalidFormula>,
    pub cells: usize,
}

impl DomainReport {
    pub fn excluded(
        domain_id: DomainId,
        display_name: impl Into<String>,
        version: u64,
        status: DomainRunStatus,
    ) -> Self {
        Self {
            domain_id,
            display_name: display_name.into(),
            version,
            status,
            entities_listed: 0,
            entities_usable: 0,
            best_formula: None,
            dominant_feature: None,
            invalid_formulas: Vec::new(),
            cells: 0,
        }
    }
}

/// Cross-domain best formula of the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunBest {
    pub formula_id: FormulaId,
    pub expression: String,
    pub fitness: f64,
    pub generation: u32,
    pub valid_domains: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub number: u32,
    pub best_fitness: f64,
    pub best_formula: Option<FormulaId>,
    pub population: usize,
    pub globally_invalid: usize,
}

/// Cell accounting for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub cells: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub stale: usize,
    pub invalid: usize,
    /// Dispatched but never started because the run was cancelled.
    pub skipped: usize,
}

impl RunStats {
    pub fn absorb(&mut self, batch: &crate::pool::BatchOutcome) {
        self.cells += batch.reports.len();
        self.cache_hits += batch.cache_hits();
        self.cache_misses += batch.computed();
        self.stale += batch.stale();
        self.invalid += batch.reports.iter().filter(|r| r.outcome.is_err()).count();
        self.skipped += batch.skipped;
    }
}

/// Domain and formula versions a run covered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub domains: BTreeMap<DomainId, u64>,
    /// Content fingerprint of each covered domain at its covered version.
    #[serde(default)]
    pub fingerprints: BTreeMap<DomainId, String>,
    pub formulas: BTreeMap<FormulaId, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub run_id: RunId,
    pub trigger: TriggerMode,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub coverage: Coverage,
    pub domains: Vec<DomainReport>,
    /// Sample-size-weighted fitness of the run's best formula.
    pub aggregate_fitness: f64,
    pub best_formula: Option<RunBest>,
    pub universal_features: Vec<String>,
    pub invariants: InvariantReport,
    pub invalid_formulas: Vec<InvalidFormula>,
    pub globally_invalid: Vec<FormulaId>,
    pub generations: Vec<GenerationSummary>,
    pub stats: RunStats,
}

impl AnalysisReport {
    pub fn excluded_domains(&self) -> impl Iterator<Item = &DomainReport> {
        self.domains.iter().filter(|d| d.status.is_excluded())
    }

    pub fn evaluated_domains(&self) -> impl Iterator<Item = &DomainReport> {
        self.domains
            .iter()
            .filter(|d| d.status == DomainRunStatus::Evaluated)
    }

    pub fn domain(&self, id: &DomainId) -> Option<&DomainReport> {
        self.domains.iter().find(|d| &d.domain_id == id)
    }

    /// Excluded domains, invalid cells or cancellation.
    pub fn is_partial(&self) -> bool {
        self.excluded_domains().next().is_some()
            || !self.invalid_formulas.is_empty()
            || self.status != RunStatus::Completed
    }

    pub fn to_record(&self) -> Result<RunRecord> {
        let report = serde_json::to_value(self)?;
        Ok(RunRecord::new(
            self.run_id.clone(),
            self.trigger.as_str(),
            self.status.outcome(),
            report,
            self.started_at,
        )?)
    }

    pub fn from_record(record: &RunRecord) -> Result<Self> {
        Ok(serde_json::from_value(record.report.clone())?)
    }
}

/// Features that explain at least `threshold` of the best formula's score
/// variance in a strict majority of the evaluated domains.
pub fn universal_features(per_domain: &[BTreeMap<String, f64>], threshold: f64) -> Vec<String> {
    if per_domain.is_empty() {
        return Vec::new();
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for shares in per_domain {
        for (feature, share) in shares {
            if *share >= threshold {
                *counts.entry(feature.as_str()).or_insert(0) += 1;
            }
        }
    }
    counts
        .into_iter()
        .filter(|(_, n)| n * 2 > per_domain.len())
        .map(|(f, _)| f.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// AnalysisRun / status
// ---------------------------------------------------------------------------

/// The stored unit a trigger produces: what it covered and where its
/// report lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub run_id: RunId,
    pub trigger: String,
    pub outcome: RunOutcome,
    pub coverage: Coverage,
    pub report_digest: ContentDigest,
    pub completed_at: DateTime<Utc>,
}

impl AnalysisRun {
    pub fn from_record(record: &RunRecord) -> Result<Self> {
        let report = AnalysisReport::from_record(record)?;
        Ok(Self {
            run_id: record.run_id.clone(),
            trigger: record.trigger.clone(),
            outcome: record.outcome,
            coverage: report.coverage,
            report_digest: record.report_digest.clone(),
            completed_at: record.completed_at,
        })
    }
}

/// Answer to the status query: the latest run and its headline numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusSummary {
    pub run_id: RunId,
    pub trigger: String,
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub aggregate_fitness: f64,
    pub best_formula: Option<String>,
    pub domains_evaluated: usize,
    pub domains_excluded: Vec<(DomainId, String)>,
    pub invalid_formulas: usize,
    pub invariants: usize,
    pub report_digest: ContentDigest,
}

impl RunStatusSummary {
    pub fn from_report(report: &AnalysisReport, digest: ContentDigest) -> Self {
        Self {
            run_id: report.run_id.clone(),
            trigger: report.trigger.to_string(),
            status: report.status.clone(),
            completed_at: report.completed_at,
            aggregate_fitness: report.aggregate_fitness,
            best_formula: report.best_formula.as_ref().map(|b| b.expression.clone()),
            domains_evaluated: report.evaluated_domains().count(),
            domains_excluded: report
                .excluded_domains()
                .map(|d| (d.domain_id.clone(), d.status.label()))
                .collect(),
            invalid_formulas: report.invalid_formulas.len(),
            invariants: report.invariants.clusters.len(),
            report_digest: digest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shares(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(f, s)| (f.to_string(), *s)).collect()
    }

    fn report() -> AnalysisReport {
        let now = Utc::now();
        AnalysisReport {
            run_id: RunId::new(),
            trigger: TriggerMode::Weekly,
            status: RunStatus::Completed,
            started_at: now,
            completed_at: now,
            coverage: Coverage::default(),
            domains: vec![
                DomainReport::excluded(DomainId::from("a"), "A", 1, DomainRunStatus::Evaluated),
                DomainReport::excluded(DomainId::from("b"), "B", 1, DomainRunStatus::Inactive),
                DomainReport::excluded(
                    DomainId::from("c"),
                    "C",
                    2,
                    DomainRunStatus::InsufficientSample {
                        sample_size: 10,
                        required: 30,
                    },
                ),
            ],
            aggregate_fitness: 0.42,
            best_formula: None,
            universal_features: vec![],
            invariants: InvariantReport::default(),
            invalid_formulas: vec![],
            globally_invalid: vec![],
            generations: vec![],
            stats: RunStats::default(),
        }
    }

    #[test]
    fn universal_needs_strict_majority() {
        let per_domain = vec![
            shares(&[("length", 0.6), ("harshness", 0.4)]),
            shares(&[("length", 0.9), ("harshness", 0.05)]),
            shares(&[("length", 0.2), ("harshness", 0.8)]),
            shares(&[("harshness", 1.0)]),
        ];
        // length: 3 of 4, harshness: 3 of 4 (0.05 is below threshold)
        assert_eq!(
            universal_features(&per_domain, 0.1),
            vec!["harshness".to_string(), "length".to_string()]
        );
        assert_eq!(universal_features(&per_domain[..2], 0.5), vec!["length".to_string()]);
        assert!(universal_features(&per_domain[2..], 0.5).contains(&"harshness".to_string()));
        assert!(universal_features(&[], 0.1).is_empty());
    }

    #[test]
    fn excluded_domains_are_listed_with_reasons() {
        let report = report();
        let excluded: Vec<_> = report.excluded_domains().map(|d| d.domain_id.as_str()).collect();
        assert_eq!(excluded, vec!["b", "c"]);
        assert!(report.is_partial());

        let summary = RunStatusSummary::from_report(&report, ContentDigest::from_bytes(b"x"));
        assert_eq!(summary.domains_evaluated, 1);
        assert_eq!(summary.domains_excluded[1].1, "insufficient sample: 10 of 30");
        assert_eq!(summary.trigger, "weekly");
    }

    #[test]
    fn record_keeps_report_and_digest() {
        let mut report = report();
        report.status = RunStatus::Cancelled {
            reason: "timeout".to_string(),
        };
        let record = report.to_record().unwrap();
        assert_eq!(record.outcome, RunOutcome::Cancelled);
        assert_eq!(record.trigger, "weekly");
        assert!(record.verify_digest().unwrap());
        assert_eq!(AnalysisReport::from_record(&record).unwrap(), report);

        let run = AnalysisRun::from_record(&record).unwrap();
        assert_eq!(run.run_id, report.run_id);
        assert_eq!(run.report_digest, record.report_digest);
    }

    #[test]
    fn trigger_labels() {
        assert_eq!(TriggerMode::Daily.to_string(), "daily");
        let on_demand = TriggerMode::OnDemand {
            domain: Some(DomainId::from("storms")),
        };
        assert_eq!(on_demand.as_str(), "on-demand");
        assert_eq!(on_demand.to_string(), "on-demand(storms)");
    }
}

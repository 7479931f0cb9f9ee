//! Correlation evaluator and the per-generation fitness matrix.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::domain::error::{CellError, CellResult};
use crate::domain::evaluation::EvaluationResult;
use crate::domain::formula::Formula;
use crate::domain::generation::{Generation, RankedFormula};
use crate::domain::ids::{DomainId, FormulaId};
use crate::snapshot::DomainSnapshot;
use crate::stats;

/// Correlates formula scores with domain outcomes.
#[derive(Debug)]
pub struct CorrelationEvaluator {
    min_sample: usize,
    calls: AtomicU64,
}

impl CorrelationEvaluator {
    pub fn new(min_sample: usize) -> Self {
        Self {
            min_sample,
            calls: AtomicU64::new(0),
        }
    }

    pub fn min_sample(&self) -> usize {
        self.min_sample
    }

    /// Number of evaluations this evaluator has computed.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Fails fast with `InsufficientSample` before scoring anything.
    pub fn check_sample(&self, snapshot: &DomainSnapshot) -> CellResult<()> {
        if snapshot.usable() < self.min_sample {
            return Err(CellError::InsufficientSample {
                domain: snapshot.domain_id.clone(),
                usable: snapshot.usable(),
                required: self.min_sample,
            });
        }
        Ok(())
    }

    /// Evaluate one (domain, formula) cell.
    pub fn evaluate(
        &self,
        snapshot: &DomainSnapshot,
        formula: &Formula,
    ) -> CellResult<EvaluationResult> {
        self.check_sample(snapshot)?;
        self.calls.fetch_add(1, Ordering::Relaxed);

        let mut scores = Vec::with_capacity(snapshot.usable());
        for row in &snapshot.rows {
            let score = formula
                .score(&row.features)
                .map_err(|reason| CellError::FormulaEvaluation {
                    formula: formula.id().clone(),
                    domain: snapshot.domain_id.clone(),
                    entity: row.name.clone(),
                    reason,
                })?;
            scores.push(score);
        }
        let outcomes = snapshot.outcomes();

        let coefficient = stats::pearson(&scores, &outcomes).ok_or_else(|| {
            let series = if stats::variance(&scores) == 0.0 {
                "score"
            } else {
                "outcome"
            };
            CellError::ConstantSeries {
                formula: formula.id().clone(),
                domain: snapshot.domain_id.clone(),
                series,
            }
        })?;

        Ok(EvaluationResult {
            domain_id: snapshot.domain_id.clone(),
            domain_version: snapshot.version,
            formula_id: formula.id().clone(),
            formula_version: formula.version().to_string(),
            coefficient,
            p_value: stats::p_value(coefficient, scores.len()),
            sample_size: scores.len(),
            evaluated_at: Utc::now(),
        })
    }
}

/// Sample-size-weighted mean of |r|: `sum(n * |r|) / sum(n)`.
pub fn aggregate_fitness<'a>(results: impl IntoIterator<Item = &'a EvaluationResult>) -> f64 {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for r in results {
        weighted += r.sample_size as f64 * r.coefficient.abs();
        total += r.sample_size as f64;
    }
    if total == 0.0 {
        0.0
    } else {
        weighted / total
    }
}

/// The feature most correlated with the outcome, with its coefficient.
/// Ties go to the alphabetically first feature.
pub fn dominant_feature<'a>(
    snapshot: &DomainSnapshot,
    features: impl IntoIterator<Item = &'a str>,
) -> Option<(String, f64)> {
    let outcomes = snapshot.outcomes();
    let names: BTreeSet<&str> = features.into_iter().collect();
    let mut best: Option<(String, f64)> = None;
    for name in names {
        let Some(series) = snapshot.feature_series(name) else {
            continue;
        };
        let Some(r) = stats::pearson(&series, &outcomes) else {
            continue;
        };
        if best.as_ref().map_or(true, |(_, b)| r.abs() > b.abs()) {
            best = Some((name.to_string(), r));
        }
    }
    best
}

/// Share of the formula's score variance attributable to each feature.
///
/// A term's share is `|cov(term, score)| / sum_j |cov(term_j, score)|`; a
/// feature collects the shares of every term that reads it.
pub fn contribution_shares(formula: &Formula, snapshot: &DomainSnapshot) -> BTreeMap<String, f64> {
    let mut columns: Vec<Vec<f64>> = vec![Vec::with_capacity(snapshot.usable()); formula.terms().len()];
    let mut scores = Vec::with_capacity(snapshot.usable());
    for row in &snapshot.rows {
        let Ok(values) = formula.term_values(&row.features) else {
            return BTreeMap::new();
        };
        scores.push(values.iter().sum::<f64>());
        for (column, value) in columns.iter_mut().zip(values) {
            column.push(value);
        }
    }
    if scores.is_empty() {
        return BTreeMap::new();
    }

    let score_mean = stats::mean(&scores);
    let covariances: Vec<f64> = columns
        .iter()
        .map(|column| {
            let m = stats::mean(column);
            column
                .iter()
                .zip(&scores)
                .map(|(v, s)| (v - m) * (s - score_mean))
                .sum::<f64>()
                .abs()
        })
        .collect();
    let total: f64 = covariances.iter().sum();

    let mut shares = BTreeMap::new();
    if total == 0.0 {
        return shares;
    }
    for (term, cov) in formula.terms().iter().zip(covariances) {
        for feature in term.referenced_features() {
            *shares.entry(feature.to_string()).or_insert(0.0) += cov / total;
        }
    }
    shares
}

// ---------------------------------------------------------------------------
// FitnessMatrix
// ---------------------------------------------------------------------------

/// One cell of the fitness matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cell", rename_all = "snake_case")]
pub enum Cell {
    Valid(EvaluationResult),
    Invalid { reason: String },
}

/// Formula x domain results for one population.
#[derive(Debug, Clone, Default)]
pub struct FitnessMatrix {
    cells: BTreeMap<(FormulaId, DomainId), Cell>,
}

impl FitnessMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, formula: FormulaId, domain: DomainId, cell: Cell) {
        self.cells.insert((formula, domain), cell);
    }

    pub fn record(&mut self, formula: &Formula, domain: &DomainId, outcome: &CellResult<EvaluationResult>) {
        let cell = match outcome {
            Ok(result) => Cell::Valid(result.clone()),
            Err(e) => Cell::Invalid {
                reason: e.to_string(),
            },
        };
        self.insert(formula.id().clone(), domain.clone(), cell);
    }

    pub fn get(&self, formula: &FormulaId, domain: &DomainId) -> Option<&Cell> {
        self.cells.get(&(formula.clone(), domain.clone()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn row<'a>(&'a self, formula: &'a FormulaId) -> impl Iterator<Item = (&'a DomainId, &'a Cell)> {
        self.cells
            .iter()
            .filter(move |((f, _), _)| f == formula)
            .map(|((_, d), c)| (d, c))
    }

    /// Valid results for one formula.
    pub fn valid_results<'a>(&'a self, formula: &'a FormulaId) -> impl Iterator<Item = &'a EvaluationResult> {
        self.row(formula).filter_map(|(_, c)| match c {
            Cell::Valid(r) => Some(r),
            Cell::Invalid { .. } => None,
        })
    }

    /// Invalid cells as (formula, domain, reason).
    pub fn invalid_cells(&self) -> impl Iterator<Item = (&FormulaId, &DomainId, &str)> {
        self.cells.iter().filter_map(|((f, d), c)| match c {
            Cell::Invalid { reason } => Some((f, d, reason.as_str())),
            Cell::Valid(_) => None,
        })
    }

    pub fn results(&self) -> impl Iterator<Item = &EvaluationResult> {
        self.cells.values().filter_map(|c| match c {
            Cell::Valid(r) => Some(r),
            Cell::Invalid { .. } => None,
        })
    }

    /// Fitness summary of one formula over the domains it was evaluated on.
    pub fn summarize(&self, formula: &Formula) -> RankedFormula {
        let id = formula.id();
        let fitness = aggregate_fitness(self.valid_results(id));
        let valid = self.valid_results(id).count();
        let invalid: Vec<DomainId> = self
            .row(id)
            .filter(|(_, c)| matches!(c, Cell::Invalid { .. }))
            .map(|(d, _)| d.clone())
            .collect();
        RankedFormula::unranked(formula.clone(), fitness, valid, invalid)
    }

    /// Rank a population by cross-domain fitness.
    pub fn rank(&self, number: u32, population: &[Formula]) -> Generation {
        Generation::ranked(number, population.iter().map(|f| self.summarize(f)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::formula::FormulaTerm;
    use crate::features::FeatureVector;
    use crate::snapshot::EntityRow;

    fn snapshot(id: &str, rows: Vec<(f64, f64, f64)>) -> DomainSnapshot {
        DomainSnapshot {
            domain_id: DomainId::from(id),
            display_name: id.to_string(),
            version: 1,
            rows: rows
                .into_iter()
                .enumerate()
                .map(|(i, (a, b, outcome))| EntityRow {
                    name: format!("e{i:03}"),
                    features: FeatureVector::new().with("a", a).with("b", b),
                    outcome,
                })
                .collect(),
            unusable: vec![],
            captured_at: Utc::now(),
        }
    }

    fn linear(feature: &str) -> Formula {
        Formula::new(vec![FormulaTerm::linear(feature, 1.0)], 0).unwrap()
    }

    #[test]
    fn insufficient_sample_fails_fast() {
        let evaluator = CorrelationEvaluator::new(5);
        let snap = snapshot("tiny", vec![(1.0, 1.0, 1.0), (2.0, 0.0, 2.0)]);
        let err = evaluator.evaluate(&snap, &linear("a")).unwrap_err();
        assert_eq!(
            err,
            CellError::InsufficientSample {
                domain: DomainId::from("tiny"),
                usable: 2,
                required: 5
            }
        );
        assert_eq!(evaluator.calls(), 0);
    }

    #[test]
    fn evaluation_is_bit_reproducible() {
        let evaluator = CorrelationEvaluator::new(3);
        let snap = snapshot(
            "d",
            vec![(1.0, 3.0, 2.0), (2.0, 1.0, 4.5), (3.0, 2.0, 5.0), (4.0, 0.5, 9.0)],
        );
        let first = evaluator.evaluate(&snap, &linear("a")).unwrap();
        let second = evaluator.evaluate(&snap, &linear("a")).unwrap();
        assert!(first.same_statistics(&second));
        assert!(first.coefficient > 0.9);
        assert_eq!(first.sample_size, 4);
        assert_eq!(evaluator.calls(), 2);
    }

    #[test]
    fn non_finite_score_marks_cell_invalid() {
        let evaluator = CorrelationEvaluator::new(2);
        let snap = snapshot("d", vec![(1.0, 0.0, 1.0), (2.0, 1.0, 2.0), (3.0, 2.0, 2.5)]);
        let f = Formula::new(vec![FormulaTerm::ratio("a", "b", 1.0)], 0).unwrap();
        match evaluator.evaluate(&snap, &f).unwrap_err() {
            CellError::FormulaEvaluation { entity, .. } => assert_eq!(entity, "e000"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn constant_series_is_named() {
        let evaluator = CorrelationEvaluator::new(2);
        let snap = snapshot("d", vec![(1.0, 5.0, 1.0), (2.0, 5.0, 2.0), (3.0, 5.0, 3.0)]);
        assert!(matches!(
            evaluator.evaluate(&snap, &linear("b")),
            Err(CellError::ConstantSeries { series: "score", .. })
        ));
        let flat = snapshot("f", vec![(1.0, 1.0, 7.0), (2.0, 2.0, 7.0), (3.0, 3.0, 7.0)]);
        assert!(matches!(
            evaluator.evaluate(&flat, &linear("a")),
            Err(CellError::ConstantSeries { series: "outcome", .. })
        ));
    }

    #[test]
    fn fitness_is_sample_weighted() {
        let make = |domain: &str, r: f64, n: usize| EvaluationResult {
            domain_id: DomainId::from(domain),
            domain_version: 1,
            formula_id: FormulaId::from("f-x"),
            formula_version: "v".to_string(),
            coefficient: r,
            p_value: 0.5,
            sample_size: n,
            evaluated_at: Utc::now(),
        };
        let results = [make("big", 0.8, 500), make("small", -0.1, 10)];
        let fitness = aggregate_fitness(&results);
        let expected = (500.0 * 0.8 + 10.0 * 0.1) / 510.0;
        assert!((fitness - expected).abs() < 1e-12);
        assert!(fitness > (0.8 + 0.1) / 2.0, "weighted above the plain mean");
        assert_eq!(aggregate_fitness(std::iter::empty::<&EvaluationResult>()), 0.0);
    }

    #[test]
    fn dominant_feature_picks_largest_abs_r() {
        let snap = snapshot(
            "d",
            vec![(1.0, 4.0, 1.0), (2.0, 3.0, 2.0), (3.0, 1.0, 3.0), (4.0, 2.0, 4.0)],
        );
        let (feature, r) = dominant_feature(&snap, ["b", "a"]).unwrap();
        assert_eq!(feature, "a");
        assert!((r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn contribution_shares_sum_to_one() {
        let snap = snapshot(
            "d",
            vec![(1.0, 4.0, 0.0), (2.0, 3.0, 0.0), (3.0, 1.0, 0.0), (4.0, 2.0, 0.0)],
        );
        let f = Formula::new(
            vec![FormulaTerm::linear("a", 1.0), FormulaTerm::linear("b", 0.001)],
            0,
        )
        .unwrap();
        let shares = contribution_shares(&f, &snap);
        let total: f64 = shares.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(shares["a"] > 0.99);
    }

    #[test]
    fn matrix_ranks_and_flags_majority_failures() {
        let evaluator = CorrelationEvaluator::new(2);
        let good = snapshot("good", vec![(1.0, 1.0, 1.0), (2.0, 2.0, 2.5), (3.0, 0.0, 2.0)]);
        let other = snapshot("other", vec![(1.0, 0.0, 3.0), (2.0, 2.0, 1.0), (3.0, 1.0, 1.5)]);
        let bad = snapshot("zeroes", vec![(1.0, 0.0, 1.0), (2.0, 0.0, 2.0), (3.0, 0.0, 3.0)]);

        let a = linear("a");
        let ratio = Formula::new(vec![FormulaTerm::ratio("a", "b", 1.0)], 0).unwrap();
        let mut matrix = FitnessMatrix::new();
        for snap in [&good, &other, &bad] {
            for f in [&a, &ratio] {
                matrix.record(f, &snap.domain_id, &evaluator.evaluate(snap, f));
            }
        }

        let generation = matrix.rank(0, &[ratio.clone(), a.clone()]);
        assert_eq!(generation.members[0].formula, a);
        let ratio_rank = &generation.members[1];
        // fails on "good", "other" (b = 0 on one entity) and "zeroes"
        assert!(ratio_rank.globally_invalid);
        assert_eq!(matrix.invalid_cells().count(), 3);
    }
}

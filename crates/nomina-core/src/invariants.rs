//! Invariant detector.
//!
//! Enumerates ratios between term weights within a formula and between
//! per-domain coefficients of a formula, then clusters near-equal ratios
//! and ratios near named constants. Output is exploratory: every cluster
//! carries its raw support counts and member observations.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::InvariantConfig;
use crate::domain::evaluation::EvaluationResult;
use crate::domain::formula::Formula;
use crate::domain::ids::{DomainId, FormulaId};

/// Named constants checked against every observation.
pub const NAMED_CONSTANTS: [(&str, f64); 9] = [
    ("phi", 1.618_033_988_749_895),
    ("pi", std::f64::consts::PI),
    ("e", std::f64::consts::E),
    ("sqrt2", std::f64::consts::SQRT_2),
    ("sqrt3", 1.732_050_807_568_877_2),
    ("two", 2.0),
    ("three_halves", 1.5),
    ("ln2", std::f64::consts::LN_2),
    ("one", 1.0),
];

/// Source of a ratio observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    /// |w_i| / |w_j| within one formula.
    WeightRatio,
    /// |r_a| / |r_b| for one formula across two domains.
    CoefficientRatio,
}

/// One ratio value. Always >= 1 (larger magnitude over smaller).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub kind: ObservationKind,
    pub value: f64,
    /// Independence key: the formula version for weight ratios, the
    /// formula version plus domain pair for coefficient ratios.
    pub origin: String,
    pub detail: String,
}

/// How a cluster was formed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterBasis {
    /// Greedy bin of mutually close values.
    Bin,
    /// Every observation near a named constant.
    Constant { name: String, value: f64 },
}

/// A named constant close to a cluster's center.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearConstant {
    pub name: String,
    pub value: f64,
    pub relative_error: f64,
}

/// A candidate invariant with its raw statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invariant {
    pub kind: ObservationKind,
    pub basis: ClusterBasis,
    pub center: f64,
    pub min: f64,
    pub max: f64,
    pub tolerance: f64,
    /// Distinct origins in the cluster.
    pub support: usize,
    /// Distinct origins of this kind in the whole input.
    pub total: usize,
    pub occurrence_rate: f64,
    pub observations: usize,
    pub near_constants: Vec<NearConstant>,
    pub members: Vec<Observation>,
}

/// All reported clusters for one input set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvariantReport {
    pub tolerance: f64,
    pub min_occurrence_rate: f64,
    pub total_observations: usize,
    pub clusters: Vec<Invariant>,
}

pub struct InvariantDetector {
    config: InvariantConfig,
}

fn by_value(a: &Observation, b: &Observation) -> Ordering {
    a.value
        .total_cmp(&b.value)
        .then_with(|| a.origin.cmp(&b.origin))
        .then_with(|| a.detail.cmp(&b.detail))
}

fn ratio(a: f64, b: f64) -> f64 {
    let (a, b) = (a.abs(), b.abs());
    if a >= b {
        a / b
    } else {
        b / a
    }
}

impl InvariantDetector {
    pub fn new(config: InvariantConfig) -> Self {
        Self { config }
    }

    /// Weight and coefficient ratio observations, in a canonical order.
    pub fn observations(&self, formulas: &[Formula], results: &[EvaluationResult]) -> Vec<Observation> {
        let min = self.config.min_weight;
        let mut out = Vec::new();

        let unique: BTreeMap<&str, &Formula> = formulas.iter().map(|f| (f.version(), f)).collect();
        for (version, formula) in &unique {
            let terms = formula.terms();
            for i in 0..terms.len() {
                for j in (i + 1)..terms.len() {
                    let (a, b) = (&terms[i], &terms[j]);
                    if a.weight.abs() < min || b.weight.abs() < min {
                        continue;
                    }
                    let value = ratio(a.weight, b.weight);
                    if value.is_finite() {
                        out.push(Observation {
                            kind: ObservationKind::WeightRatio,
                            value,
                            origin: (*version).to_string(),
                            detail: format!("{}: {} / {}", formula.id(), a.label(), b.label()),
                        });
                    }
                }
            }
        }

        // newest domain version per (formula, domain)
        let mut latest: BTreeMap<(&str, &DomainId), &EvaluationResult> = BTreeMap::new();
        for r in results {
            let slot = latest
                .entry((r.formula_version.as_str(), &r.domain_id))
                .or_insert(r);
            if r.domain_version > slot.domain_version {
                *slot = r;
            }
        }
        let mut per_formula: BTreeMap<(&str, &FormulaId), Vec<&EvaluationResult>> = BTreeMap::new();
        for ((version, _), r) in &latest {
            per_formula
                .entry((version, &r.formula_id))
                .or_default()
                .push(r);
        }
        for ((version, formula_id), rows) in &per_formula {
            for i in 0..rows.len() {
                for j in (i + 1)..rows.len() {
                    let (a, b) = (rows[i], rows[j]);
                    if a.coefficient.abs() < min || b.coefficient.abs() < min {
                        continue;
                    }
                    let value = ratio(a.coefficient, b.coefficient);
                    if value.is_finite() {
                        out.push(Observation {
                            kind: ObservationKind::CoefficientRatio,
                            value,
                            origin: format!("{version}:{}|{}", a.domain_id, b.domain_id),
                            detail: format!("{formula_id}: r[{}] / r[{}]", a.domain_id, b.domain_id),
                        });
                    }
                }
            }
        }

        out.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| by_value(a, b)));
        out
    }

    /// Cluster the observations derived from `formulas` and `results`.
    pub fn detect(&self, formulas: &[Formula], results: &[EvaluationResult]) -> InvariantReport {
        let observations = self.observations(formulas, results);
        let mut clusters = Vec::new();
        for kind in [ObservationKind::WeightRatio, ObservationKind::CoefficientRatio] {
            let group: Vec<&Observation> = observations.iter().filter(|o| o.kind == kind).collect();
            clusters.extend(self.cluster_kind(kind, &group));
        }
        InvariantReport {
            tolerance: self.config.tolerance,
            min_occurrence_rate: self.config.min_occurrence_rate,
            total_observations: observations.len(),
            clusters,
        }
    }

    fn cluster_kind(&self, kind: ObservationKind, sorted: &[&Observation]) -> Vec<Invariant> {
        let tol = self.config.tolerance;
        let total: usize = sorted.iter().map(|o| o.origin.as_str()).collect::<BTreeSet<_>>().len();
        if total == 0 {
            return Vec::new();
        }

        let mut out = Vec::new();

        let mut start = 0;
        while start < sorted.len() {
            let anchor = sorted[start].value;
            let mut end = start + 1;
            while end < sorted.len() && sorted[end].value - anchor <= tol * anchor {
                end += 1;
            }
            if let Some(inv) = self.build(kind, ClusterBasis::Bin, &sorted[start..end], total) {
                out.push(inv);
            }
            start = end;
        }

        for (name, value) in NAMED_CONSTANTS {
            let members: Vec<&Observation> = sorted
                .iter()
                .copied()
                .filter(|o| (o.value - value).abs() <= tol * value)
                .collect();
            let basis = ClusterBasis::Constant {
                name: name.to_string(),
                value,
            };
            if let Some(inv) = self.build(kind, basis, &members, total) {
                out.push(inv);
            }
        }
        out
    }

    fn build(
        &self,
        kind: ObservationKind,
        basis: ClusterBasis,
        members: &[&Observation],
        total: usize,
    ) -> Option<Invariant> {
        if members.is_empty() {
            return None;
        }
        let support = members
            .iter()
            .map(|o| o.origin.as_str())
            .collect::<BTreeSet<_>>()
            .len();
        let occurrence_rate = support as f64 / total as f64;
        if support < self.config.min_support || occurrence_rate < self.config.min_occurrence_rate {
            return None;
        }

        let center = members.iter().map(|o| o.value).sum::<f64>() / members.len() as f64;
        let near_constants = NAMED_CONSTANTS
            .iter()
            .filter_map(|(name, value)| {
                let relative_error = (center - value).abs() / value;
                (relative_error <= self.config.tolerance).then(|| NearConstant {
                    name: name.to_string(),
                    value: *value,
                    relative_error,
                })
            })
            .collect();

        Some(Invariant {
            kind,
            basis,
            center,
            min: members.first().map_or(center, |o| o.value),
            max: members.last().map_or(center, |o| o.value),
            tolerance: self.config.tolerance,
            support,
            total,
            occurrence_rate,
            observations: members.len(),
            near_constants,
            members: members.iter().map(|o| (*o).clone()).collect(),
        })
    }
}

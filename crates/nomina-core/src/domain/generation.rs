//! Ranked formula populations.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::formula::Formula;
use super::ids::DomainId;

/// A formula with its cross-domain fitness within one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedFormula {
    pub formula: Formula,
    /// Sample-size-weighted mean |r| over the domains where it was valid.
    pub fitness: f64,
    /// 1-based; assigned by [`Generation::ranked`].
    pub rank: usize,
    pub valid_domains: usize,
    pub invalid_domains: Vec<DomainId>,
    /// Failed on a majority of the domains it was evaluated on.
    pub globally_invalid: bool,
}

impl RankedFormula {
    pub fn unranked(
        formula: Formula,
        fitness: f64,
        valid_domains: usize,
        invalid_domains: Vec<DomainId>,
    ) -> Self {
        let attempted = valid_domains + invalid_domains.len();
        let globally_invalid = attempted > 0 && invalid_domains.len() * 2 > attempted;
        Self {
            formula,
            fitness,
            rank: 0,
            valid_domains,
            invalid_domains,
            globally_invalid,
        }
    }

    /// Fitness used for ranking; globally invalid formulas rank as zero.
    pub fn effective_fitness(&self) -> f64 {
        if self.globally_invalid {
            0.0
        } else {
            self.fitness
        }
    }
}

/// One population produced by one evolution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub number: u32,
    /// Sorted by rank, best first.
    pub members: Vec<RankedFormula>,
    pub created_at: DateTime<Utc>,
}

impl Generation {
    /// Rank members: valid formulas first, then fitness descending, then
    /// formula version so equal fitness orders deterministically.
    pub fn ranked(number: u32, mut members: Vec<RankedFormula>) -> Self {
        members.sort_by(|a, b| {
            a.globally_invalid
                .cmp(&b.globally_invalid)
                .then_with(|| {
                    b.effective_fitness()
                        .partial_cmp(&a.effective_fitness())
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.formula.version().cmp(b.formula.version()))
        });
        for (i, member) in members.iter_mut().enumerate() {
            member.rank = i + 1;
        }
        Self {
            number,
            members,
            created_at: Utc::now(),
        }
    }

    pub fn best(&self) -> Option<&RankedFormula> {
        self.members.first().filter(|m| !m.globally_invalid)
    }

    pub fn best_fitness(&self) -> f64 {
        self.best().map(|m| m.fitness).unwrap_or(0.0)
    }

    pub fn formulas(&self) -> Vec<Formula> {
        self.members.iter().map(|m| m.formula.clone()).collect()
    }

    /// The `k` best valid formulas.
    pub fn top(&self, k: usize) -> Vec<Formula> {
        self.members
            .iter()
            .filter(|m| !m.globally_invalid)
            .take(k)
            .map(|m| m.formula.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::formula::FormulaTerm;

    fn formula(feature: &str) -> Formula {
        Formula::new(vec![FormulaTerm::linear(feature, 1.0)], 0).unwrap()
    }

    #[test]
    fn ranks_by_fitness_with_invalid_last() {
        let gen = Generation::ranked(
            2,
            vec![
                RankedFormula::unranked(formula("a"), 0.2, 2, vec![]),
                RankedFormula::unranked(
                    formula("b"),
                    0.9,
                    1,
                    vec![DomainId::from("x"), DomainId::from("y")],
                ),
                RankedFormula::unranked(formula("c"), 0.5, 2, vec![]),
            ],
        );
        let order: Vec<&str> = gen
            .members
            .iter()
            .map(|m| m.formula.terms()[0].feature.as_str())
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        assert_eq!(gen.members[2].rank, 3);
        assert!(gen.members[2].globally_invalid);
        assert_eq!(gen.best_fitness(), 0.5);
        assert_eq!(gen.top(5).len(), 2);
    }

    #[test]
    fn half_failures_are_not_a_majority() {
        let m = RankedFormula::unranked(formula("a"), 0.4, 1, vec![DomainId::from("x")]);
        assert!(!m.globally_invalid);
    }

    #[test]
    fn empty_generation_has_zero_best() {
        let gen = Generation::ranked(0, vec![]);
        assert!(gen.best().is_none());
        assert_eq!(gen.best_fitness(), 0.0);
    }
}

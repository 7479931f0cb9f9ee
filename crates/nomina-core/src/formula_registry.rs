//! Formula registry: validation against the known feature set, seeding, and
//! lookup of every formula ever registered.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::domain::error::{FormulaError, FormulaResult};
use crate::domain::formula::{Formula, FormulaTerm, TermOp};
use crate::domain::ids::FormulaId;

/// Holds every registered formula, keyed by id. Formulas are never removed.
#[derive(Debug)]
pub struct FormulaRegistry {
    features: BTreeSet<String>,
    max_terms: usize,
    formulas: RwLock<BTreeMap<FormulaId, Formula>>,
}

impl FormulaRegistry {
    pub fn new(features: impl IntoIterator<Item = impl Into<String>>, max_terms: usize) -> Self {
        Self {
            features: features.into_iter().map(Into::into).collect(),
            max_terms,
            formulas: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn features(&self) -> &BTreeSet<String> {
        &self.features
    }

    pub fn max_terms(&self) -> usize {
        self.max_terms
    }

    /// Checks that depend on the registry: known features and term count.
    pub fn validate(&self, formula: &Formula) -> FormulaResult<()> {
        if formula.terms().len() > self.max_terms {
            return Err(FormulaError::TooManyTerms {
                terms: formula.terms().len(),
                limit: self.max_terms,
            });
        }
        for feature in formula.features() {
            if !self.features.contains(feature) {
                return Err(FormulaError::UnknownFeature(feature.to_string()));
            }
        }
        Ok(())
    }

    /// Validate and record a formula. Registering a structure that is
    /// already known returns the existing formula.
    pub fn register(&self, formula: Formula) -> FormulaResult<Formula> {
        self.validate(&formula)?;
        let mut formulas = self.formulas.write().unwrap_or_else(|p| p.into_inner());
        let entry = formulas
            .entry(formula.id().clone())
            .or_insert_with(|| formula.clone());
        Ok(entry.clone())
    }

    /// Build and register a formula from raw terms.
    pub fn define(&self, terms: Vec<FormulaTerm>, generation: u32) -> FormulaResult<Formula> {
        self.register(Formula::new(terms, generation)?)
    }

    pub fn get(&self, id: &FormulaId) -> Option<Formula> {
        self.formulas
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.formulas.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A random term over the known features.
    pub fn random_term(&self, rng: &mut StdRng, exclude: &BTreeSet<&str>) -> Option<FormulaTerm> {
        let candidates: Vec<&String> = self
            .features
            .iter()
            .filter(|f| !exclude.contains(f.as_str()))
            .collect();
        let feature = (*candidates.choose(rng)?).clone();
        let weight = rng.gen_range(-1.0..1.0);
        let term = match rng.gen_range(0..3) {
            0 => FormulaTerm::log(feature, weight),
            1 if self.features.len() > 1 => {
                let denominators: Vec<&String> =
                    self.features.iter().filter(|d| **d != feature).collect();
                let denominator = (*denominators.choose(rng)?).clone();
                FormulaTerm::ratio(feature, denominator, weight)
            }
            _ => FormulaTerm::linear(feature, weight),
        };
        Some(term)
    }

    /// A random, registered formula with 1..=3 terms.
    pub fn random_formula(&self, rng: &mut StdRng, generation: u32) -> FormulaResult<Formula> {
        let count = rng.gen_range(1..=3usize.min(self.max_terms.max(1)));
        let mut terms = Vec::with_capacity(count);
        let mut used: BTreeSet<&str> = BTreeSet::new();
        for _ in 0..count {
            let Some(term) = self.random_term(rng, &used) else {
                break;
            };
            if let Some(name) = self.features.get(&term.feature) {
                used.insert(name.as_str());
            }
            terms.push(term);
        }
        self.define(terms, generation)
    }

    /// Create an initial population of `n` distinct formulas.
    ///
    /// The first formulas are single-feature linear scores (one per known
    /// feature, alphabetically), so every feature gets a baseline; the rest
    /// are random. The result depends only on `n`, `seed` and the feature set.
    pub fn seed(&self, n: usize, seed: u64) -> Vec<Formula> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut population: Vec<Formula> = Vec::with_capacity(n);
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for feature in self.features.iter().take(n) {
            if let Ok(formula) = self.define(vec![FormulaTerm::linear(feature.clone(), 1.0)], 0) {
                seen.insert(formula.version().to_string());
                population.push(formula);
            }
        }

        let mut attempts = 0;
        while population.len() < n && attempts < n * 16 {
            attempts += 1;
            match self.random_formula(&mut rng, 0) {
                Ok(formula) if seen.insert(formula.version().to_string()) => population.push(formula),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "discarded seed candidate"),
            }
        }
        population
    }
}

/// Whether a term of this shape already exists in `terms`.
pub(crate) fn has_term(terms: &[FormulaTerm], feature: &str, op: &TermOp) -> bool {
    terms.iter().any(|t| t.feature == feature && t.op == *op)
}

//! Evolution engine: the generation state machine and the reproduction
//! operators that turn one ranked generation into the next population.
//!
//! Fitness evaluation is driven by the scheduler; this module only decides
//! what to evaluate next and when to stop.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EvolutionConfig;
use crate::domain::error::FormulaResult;
use crate::domain::formula::{Formula, FormulaTerm};
use crate::domain::generation::Generation;
use crate::formula_registry::{has_term, FormulaRegistry};

/// Lifecycle of one evolution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionState {
    Seeded,
    Evaluating,
    Ranked,
    Converged,
    NextGeneration,
}

impl fmt::Display for EvolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvolutionState::Seeded => "seeded",
            EvolutionState::Evaluating => "evaluating",
            EvolutionState::Ranked => "ranked",
            EvolutionState::Converged => "converged",
            EvolutionState::NextGeneration => "next_generation",
        };
        f.write_str(s)
    }
}

/// Why a cycle stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxGenerations,
    NoImprovement,
}

/// Tracks one evolution cycle through its states.
///
/// `SEEDED -> EVALUATING -> RANKED -> (CONVERGED | NEXT_GENERATION)`, and
/// `NEXT_GENERATION -> EVALUATING` for the following generation.
#[derive(Debug, Clone)]
pub struct EvolutionCycle {
    state: EvolutionState,
    generation: u32,
    evaluated: u32,
    max_generations: u32,
    patience: u32,
    epsilon: f64,
    best: Option<f64>,
    stalled: u32,
    stop_reason: Option<StopReason>,
}

impl EvolutionCycle {
    /// A cycle whose first population carries generation number `start`.
    pub fn seeded(start: u32, config: &EvolutionConfig) -> Self {
        Self {
            state: EvolutionState::Seeded,
            generation: start,
            evaluated: 0,
            max_generations: config.max_generations,
            patience: config.patience,
            epsilon: config.epsilon,
            best: None,
            stalled: 0,
            stop_reason: None,
        }
    }

    pub fn state(&self) -> EvolutionState {
        self.state
    }

    /// Number of the generation currently being evaluated or just ranked.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn begin_evaluation(&mut self) {
        debug_assert!(matches!(
            self.state,
            EvolutionState::Seeded | EvolutionState::NextGeneration
        ));
        if self.state == EvolutionState::NextGeneration {
            self.generation += 1;
        }
        self.state = EvolutionState::Evaluating;
    }

    /// Record a completed ranking and decide whether to continue.
    pub fn record_ranking(&mut self, ranked: &Generation) -> EvolutionState {
        debug_assert_eq!(self.state, EvolutionState::Evaluating);
        self.state = EvolutionState::Ranked;
        self.evaluated += 1;

        let best = ranked.best_fitness();
        match self.best {
            Some(previous) if best - previous <= self.epsilon => self.stalled += 1,
            _ => self.stalled = 0,
        }
        self.best = Some(self.best.map_or(best, |b| b.max(best)));

        self.state = if self.evaluated >= self.max_generations {
            self.stop_reason = Some(StopReason::MaxGenerations);
            EvolutionState::Converged
        } else if self.patience > 0 && self.stalled >= self.patience {
            self.stop_reason = Some(StopReason::NoImprovement);
            EvolutionState::Converged
        } else {
            EvolutionState::NextGeneration
        };
        self.state
    }
}

/// Mutation and crossover over registered formulas.
pub struct EvolutionEngine {
    config: EvolutionConfig,
    formulas: Arc<FormulaRegistry>,
}

impl EvolutionEngine {
    pub fn new(config: EvolutionConfig, formulas: Arc<FormulaRegistry>) -> Self {
        Self { config, formulas }
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    /// Seeded RNG for producing generation `number`.
    pub fn rng_for(&self, number: u32) -> StdRng {
        StdRng::seed_from_u64(self.config.seed ^ u64::from(number))
    }

    /// Build the population for generation `ranked.number + 1`: the elites
    /// unchanged, then offspring of the surviving top half.
    ///
    /// Invalid offspring are discarded and retried up to `max_attempts`
    /// times per slot; a slot that never yields a new valid formula is
    /// filled with a random formula, or left empty.
    pub fn next_population(&self, ranked: &Generation) -> Vec<Formula> {
        let next = ranked.number + 1;
        let mut rng = self.rng_for(next);

        let elites = ranked.top(self.config.elite_count);
        let mut seen: BTreeSet<String> = elites.iter().map(|f| f.version().to_string()).collect();
        let mut population = elites;

        let valid: Vec<&Formula> = ranked
            .members
            .iter()
            .filter(|m| !m.globally_invalid)
            .map(|m| &m.formula)
            .collect();
        let pool: Vec<&Formula> = if valid.is_empty() {
            ranked.members.iter().map(|m| &m.formula).collect()
        } else {
            let half = valid.len().div_ceil(2);
            valid.into_iter().take(half).collect()
        };
        if pool.is_empty() {
            return population;
        }

        while population.len() < self.config.population_size {
            let mut child = None;
            for _ in 0..self.config.max_attempts {
                let candidate = if pool.len() > 1 && rng.gen_bool(self.config.crossover_rate) {
                    let a = tournament(&pool, &mut rng);
                    let b = tournament(&pool, &mut rng);
                    self.crossover(a, b, &mut rng, next)
                } else {
                    let parent = tournament(&pool, &mut rng);
                    self.mutate(parent, &mut rng, next)
                };
                match candidate {
                    Ok(formula) if !seen.contains(formula.version()) => {
                        child = Some(formula);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => debug!(generation = next, error = %e, "discarded offspring"),
                }
            }
            let child = match child {
                Some(c) => Some(c),
                None => self
                    .formulas
                    .random_formula(&mut rng, next)
                    .ok()
                    .filter(|f| !seen.contains(f.version())),
            };
            match child {
                Some(formula) => {
                    seen.insert(formula.version().to_string());
                    population.push(formula);
                }
                None => break,
            }
        }
        population
    }

    /// Perturb weights, add a term, or drop a term.
    pub fn mutate(&self, parent: &Formula, rng: &mut StdRng, generation: u32) -> FormulaResult<Formula> {
        let mut terms: Vec<FormulaTerm> = parent.terms().to_vec();
        let roll: f64 = rng.gen();
        let can_add = terms.len() < self.config.max_terms;

        if roll < self.config.add_term_rate && can_add {
            let used: BTreeSet<&str> = parent.features();
            if let Some(term) = self.formulas.random_term(rng, &used) {
                if !has_term(&terms, &term.feature, &term.op) {
                    terms.push(term);
                }
            }
        } else if roll < self.config.add_term_rate + self.config.drop_term_rate && terms.len() > 1 {
            let idx = rng.gen_range(0..terms.len());
            terms.remove(idx);
        } else {
            let sigma = self.config.weight_sigma;
            let mut touched = false;
            for term in terms.iter_mut() {
                if rng.gen_bool(0.5) {
                    term.weight += rng.gen_range(-sigma..sigma);
                    touched = true;
                }
            }
            if !touched {
                let idx = rng.gen_range(0..terms.len());
                terms[idx].weight += rng.gen_range(-sigma..sigma);
            }
        }

        let child = Formula::new(terms, generation)?.with_parents(vec![parent.id().clone()]);
        self.formulas.register(child)
    }

    /// One-point crossover of two parents' term lists.
    pub fn crossover(
        &self,
        a: &Formula,
        b: &Formula,
        rng: &mut StdRng,
        generation: u32,
    ) -> FormulaResult<Formula> {
        let cut_a = rng.gen_range(1..=a.terms().len());
        let cut_b = rng.gen_range(0..b.terms().len());

        let mut terms: Vec<FormulaTerm> = Vec::new();
        for term in a.terms()[..cut_a].iter().chain(&b.terms()[cut_b..]) {
            if !has_term(&terms, &term.feature, &term.op) {
                terms.push(term.clone());
            }
        }
        terms.truncate(self.config.max_terms);

        let child = Formula::new(terms, generation)?
            .with_parents(vec![a.id().clone(), b.id().clone()]);
        self.formulas.register(child)
    }
}

/// Binary tournament: the better-ranked of two random picks.
fn tournament<'a>(pool: &[&'a Formula], rng: &mut StdRng) -> &'a Formula {
    let i = rng.gen_range(0..pool.len());
    let j = rng.gen_range(0..pool.len());
    // pool is ordered by rank
    pool[i.min(j)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::generation::RankedFormula;
    use crate::domain::ids::DomainId;

    fn setup(config: EvolutionConfig) -> (EvolutionEngine, Vec<Formula>) {
        let formulas = Arc::new(FormulaRegistry::new(
            ["alpha", "beta", "gamma", "delta"],
            config.max_terms,
        ));
        let seed = formulas.seed(config.population_size, config.seed);
        (EvolutionEngine::new(config, formulas), seed)
    }

    fn rank(number: u32, population: &[Formula]) -> Generation {
        let members = population
            .iter()
            .enumerate()
            .map(|(i, f)| RankedFormula::unranked(f.clone(), 1.0 / (i + 1) as f64, 2, vec![]))
            .collect();
        Generation::ranked(number, members)
    }

    #[test]
    fn elites_survive_unchanged() {
        let config = EvolutionConfig {
            population_size: 8,
            elite_count: 2,
            ..EvolutionConfig::default()
        };
        let (engine, seed) = setup(config);
        let gen0 = rank(0, &seed);
        let next = engine.next_population(&gen0);

        assert_eq!(next.len(), 8);
        assert_eq!(next[0], gen0.members[0].formula);
        assert_eq!(next[1], gen0.members[1].formula);
        let distinct: BTreeSet<&str> = next.iter().map(|f| f.version()).collect();
        assert_eq!(distinct.len(), next.len());
    }

    #[test]
    fn offspring_are_valid_and_tagged() {
        let (engine, seed) = setup(EvolutionConfig::default());
        let next = engine.next_population(&rank(4, &seed));
        for formula in &next[2..] {
            assert!(formula.generation() == 5 || formula.generation() == 0);
            assert!(formula.terms().len() <= engine.config().max_terms);
            for feature in formula.features() {
                assert!(["alpha", "beta", "gamma", "delta"].contains(&feature));
            }
        }
    }

    #[test]
    fn reproduction_is_deterministic() {
        let (engine_a, seed_a) = setup(EvolutionConfig::default());
        let (engine_b, seed_b) = setup(EvolutionConfig::default());
        let a = engine_a.next_population(&rank(0, &seed_a));
        let b = engine_b.next_population(&rank(0, &seed_b));
        assert_eq!(
            a.iter().map(|f| f.version()).collect::<Vec<_>>(),
            b.iter().map(|f| f.version()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn globally_invalid_members_are_not_elites() {
        let (engine, seed) = setup(EvolutionConfig::default());
        let failing = vec![DomainId::from("x"), DomainId::from("y")];
        let members = seed
            .iter()
            .enumerate()
            .map(|(i, f)| {
                if i == 0 {
                    RankedFormula::unranked(f.clone(), 0.99, 1, failing.clone())
                } else {
                    RankedFormula::unranked(f.clone(), 0.5 - i as f64 * 0.01, 3, vec![])
                }
            })
            .collect();
        let gen = Generation::ranked(0, members);
        let next = engine.next_population(&gen);
        assert_ne!(next[0], seed[0]);
        assert_eq!(next[0], gen.members[0].formula);
    }

    #[test]
    fn mutation_keeps_at_least_one_term() {
        let config = EvolutionConfig {
            add_term_rate: 0.0,
            drop_term_rate: 1.0,
            ..EvolutionConfig::default()
        };
        let (engine, seed) = setup(config);
        let mut rng = engine.rng_for(1);
        let single = &seed[0];
        assert_eq!(single.terms().len(), 1);
        // dropping is not possible, so weights are perturbed instead
        let child = engine.mutate(single, &mut rng, 1).unwrap();
        assert_eq!(child.terms().len(), 1);
        assert_ne!(child.version(), single.version());
        assert_eq!(child.parents(), &[single.id().clone()]);
    }

    #[test]
    fn crossover_dedupes_terms() {
        let (engine, _) = setup(EvolutionConfig::default());
        let a = Formula::new(
            vec![FormulaTerm::linear("alpha", 1.0), FormulaTerm::linear("beta", 1.0)],
            0,
        )
        .unwrap();
        let mut rng = engine.rng_for(3);
        for _ in 0..20 {
            let child = engine.crossover(&a, &a, &mut rng, 1).unwrap();
            let shapes: BTreeSet<String> =
                child.terms().iter().map(|t| format!("{}:{}", t.feature, t.op)).collect();
            assert_eq!(shapes.len(), child.terms().len());
        }
    }

    /// Parents over a feature the registry does not know: every mutation and
    /// crossover of them is rejected on registration.
    fn unregistered_parents() -> Generation {
        let parents = [
            Formula::new(vec![FormulaTerm::linear("zeta", 1.0)], 0).unwrap(),
            Formula::new(vec![FormulaTerm::log("zeta", 0.5)], 0).unwrap(),
        ];
        rank(0, &parents)
    }

    #[test]
    fn rejected_offspring_fall_back_to_random_formulas() {
        let config = EvolutionConfig {
            population_size: 6,
            elite_count: 0,
            max_attempts: 4,
            ..EvolutionConfig::default()
        };
        let (engine, _) = setup(config);
        let gen0 = unregistered_parents();
        let next = engine.next_population(&gen0);

        assert_eq!(next.len(), 6);
        let distinct: BTreeSet<&str> = next.iter().map(|f| f.version()).collect();
        assert_eq!(distinct.len(), next.len());
        for formula in &next {
            assert_eq!(formula.generation(), 1);
            assert!(formula.parents().is_empty());
            assert!(engine.formulas.validate(formula).is_ok());
            assert!(!formula.features().contains("zeta"));
        }

        let (again, _) = setup(engine.config().clone());
        let repeat = again.next_population(&gen0);
        assert_eq!(
            next.iter().map(|f| f.version()).collect::<Vec<_>>(),
            repeat.iter().map(|f| f.version()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn population_is_truncated_when_no_formula_can_be_built() {
        let config = EvolutionConfig {
            population_size: 6,
            elite_count: 1,
            ..EvolutionConfig::default()
        };
        let formulas = Arc::new(FormulaRegistry::new(Vec::<String>::new(), config.max_terms));
        let engine = EvolutionEngine::new(config, formulas);
        let gen0 = unregistered_parents();

        let next = engine.next_population(&gen0);
        assert_eq!(next, vec![gen0.members[0].formula.clone()]);
    }

    #[test]
    fn cycle_stops_at_max_generations() {
        let config = EvolutionConfig {
            max_generations: 3,
            patience: 0,
            ..EvolutionConfig::default()
        };
        let mut cycle = EvolutionCycle::seeded(0, &config);
        let mut states = vec![];
        for fitness in [0.1, 0.2, 0.3] {
            cycle.begin_evaluation();
            let gen = Generation::ranked(cycle.generation(), vec![RankedFormula::unranked(
                Formula::new(vec![FormulaTerm::linear("a", fitness)], 0).unwrap(),
                fitness,
                1,
                vec![],
            )]);
            states.push(cycle.record_ranking(&gen));
        }
        assert_eq!(
            states,
            vec![
                EvolutionState::NextGeneration,
                EvolutionState::NextGeneration,
                EvolutionState::Converged
            ]
        );
        assert_eq!(cycle.generation(), 2);
        assert_eq!(cycle.stop_reason(), Some(StopReason::MaxGenerations));
    }

    #[test]
    fn cycle_stops_early_without_improvement() {
        let config = EvolutionConfig {
            max_generations: 10,
            patience: 2,
            epsilon: 0.01,
            ..EvolutionConfig::default()
        };
        let mut cycle = EvolutionCycle::seeded(5, &config);
        let f = Formula::new(vec![FormulaTerm::linear("a", 1.0)], 0).unwrap();
        let mut last = EvolutionState::Seeded;
        for fitness in [0.5, 0.505, 0.509] {
            cycle.begin_evaluation();
            let gen = Generation::ranked(
                cycle.generation(),
                vec![RankedFormula::unranked(f.clone(), fitness, 1, vec![])],
            );
            last = cycle.record_ranking(&gen);
        }
        assert_eq!(last, EvolutionState::Converged);
        assert_eq!(cycle.stop_reason(), Some(StopReason::NoImprovement));
        assert_eq!(cycle.generation(), 7);
    }
}

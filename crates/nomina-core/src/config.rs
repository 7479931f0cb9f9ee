//! Engine configuration, loadable from TOML.
//!
//! Every section has defaults, so an empty file (or no file) is a valid
//! configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::error::{ConfigError, ConfigResult};

/// Evolution operator rates and termination settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub population_size: usize,
    /// Formulas carried unchanged into the next generation.
    pub elite_count: usize,
    pub max_generations: u32,
    /// Consecutive generations without improvement before stopping early.
    pub patience: u32,
    /// Minimum improvement that resets the patience counter.
    pub epsilon: f64,
    pub seed: u64,
    pub weight_sigma: f64,
    pub add_term_rate: f64,
    pub drop_term_rate: f64,
    pub crossover_rate: f64,
    pub max_terms: usize,
    /// Attempts per offspring slot before giving up on it.
    pub max_attempts: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population_size: 12,
            elite_count: 2,
            max_generations: 10,
            patience: 3,
            epsilon: 1e-4,
            seed: 42,
            weight_sigma: 0.25,
            add_term_rate: 0.2,
            drop_term_rate: 0.15,
            crossover_rate: 0.5,
            max_terms: 6,
            max_attempts: 16,
        }
    }
}

/// Invariant detector thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvariantConfig {
    /// Relative width of a cluster bin.
    pub tolerance: f64,
    pub min_occurrence_rate: f64,
    /// Minimum independent origins per reported cluster.
    pub min_support: usize,
    /// Weights and coefficients smaller than this are not used as ratio terms.
    pub min_weight: f64,
}

impl Default for InvariantConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.02,
            min_occurrence_rate: 0.05,
            min_support: 2,
            min_weight: 1e-6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Share of score variance a feature must explain to count as contributing.
    pub contribution_threshold: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            contribution_threshold: 0.1,
        }
    }
}

/// Trigger cadence and run limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub daily_interval_secs: u64,
    pub weekly_interval_secs: u64,
    pub run_timeout_secs: Option<u64>,
    /// Follow an on-demand evaluation with an evolution cycle.
    pub on_demand_evolve: bool,
    /// Formulas from the latest generation re-evaluated by a daily run.
    pub daily_top_k: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            daily_interval_secs: 86_400,
            weekly_interval_secs: 604_800,
            run_timeout_secs: None,
            on_demand_evolve: false,
            daily_top_k: 3,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum usable entities for a domain to be evaluated.
    pub min_sample: usize,
    /// Worker pool bound.
    pub max_workers: usize,
    pub evolution: EvolutionConfig,
    pub invariants: InvariantConfig,
    pub report: ReportConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_sample: 30,
            max_workers: 8,
            evolution: EvolutionConfig::default(),
            invariants: InvariantConfig::default(),
            report: ReportConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn check_rate(field: &'static str, value: f64) -> ConfigResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(invalid(field, format!("{value} is outside [0, 1]")));
    }
    Ok(())
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_sample < 3 {
            return Err(invalid("min_sample", "a p-value needs at least 3 entities"));
        }
        if self.max_workers == 0 {
            return Err(invalid("max_workers", "must be at least 1"));
        }

        let evo = &self.evolution;
        if evo.population_size < 2 {
            return Err(invalid("evolution.population_size", "must be at least 2"));
        }
        if evo.elite_count == 0 || evo.elite_count >= evo.population_size {
            return Err(invalid(
                "evolution.elite_count",
                format!("must be in 1..{}", evo.population_size),
            ));
        }
        if evo.max_generations == 0 {
            return Err(invalid("evolution.max_generations", "must be at least 1"));
        }
        if !(evo.epsilon >= 0.0 && evo.epsilon.is_finite()) {
            return Err(invalid("evolution.epsilon", "must be a finite non-negative number"));
        }
        if !(evo.weight_sigma > 0.0 && evo.weight_sigma.is_finite()) {
            return Err(invalid("evolution.weight_sigma", "must be positive"));
        }
        check_rate("evolution.add_term_rate", evo.add_term_rate)?;
        check_rate("evolution.drop_term_rate", evo.drop_term_rate)?;
        check_rate("evolution.crossover_rate", evo.crossover_rate)?;
        if evo.add_term_rate + evo.drop_term_rate > 1.0 {
            return Err(invalid(
                "evolution.add_term_rate",
                "add and drop rates together exceed 1",
            ));
        }
        if evo.max_terms == 0 {
            return Err(invalid("evolution.max_terms", "must be at least 1"));
        }
        if evo.max_attempts == 0 {
            return Err(invalid("evolution.max_attempts", "must be at least 1"));
        }

        let inv = &self.invariants;
        if !(inv.tolerance > 0.0 && inv.tolerance < 1.0) {
            return Err(invalid("invariants.tolerance", "must be in (0, 1)"));
        }
        check_rate("invariants.min_occurrence_rate", inv.min_occurrence_rate)?;
        if inv.min_support == 0 {
            return Err(invalid("invariants.min_support", "must be at least 1"));
        }
        if !(inv.min_weight >= 0.0 && inv.min_weight.is_finite()) {
            return Err(invalid("invariants.min_weight", "must be a finite non-negative number"));
        }

        check_rate("report.contribution_threshold", self.report.contribution_threshold)?;

        let sched = &self.scheduler;
        if sched.daily_interval_secs == 0 || sched.weekly_interval_secs == 0 {
            return Err(invalid("scheduler", "trigger intervals must be positive"));
        }
        if sched.run_timeout_secs == Some(0) {
            return Err(invalid("scheduler.run_timeout_secs", "must be positive when set"));
        }
        if sched.daily_top_k == 0 {
            return Err(invalid("scheduler.daily_top_k", "must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.min_sample, 30);
        assert_eq!(config.evolution.population_size, 12);
        assert_eq!(config.invariants.tolerance, 0.02);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        assert_eq!(
            EngineConfig::from_toml_str("").unwrap(),
            EngineConfig::default()
        );
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let config = EngineConfig::from_toml_str(
            r#"
            min_sample = 50

            [evolution]
            population_size = 20
            seed = 7

            [scheduler]
            run_timeout_secs = 600
            "#,
        )
        .unwrap();
        assert_eq!(config.min_sample, 50);
        assert_eq!(config.evolution.population_size, 20);
        assert_eq!(config.evolution.seed, 7);
        assert_eq!(config.evolution.elite_count, 2);
        assert_eq!(config.scheduler.run_timeout_secs, Some(600));
    }

    #[test]
    fn invalid_values_name_the_field() {
        let err = EngineConfig::from_toml_str("[evolution]\nelite_count = 12").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "evolution.elite_count",
                ..
            }
        ));

        let err = EngineConfig::from_toml_str("[invariants]\ntolerance = 1.5").unwrap_err();
        assert!(err.to_string().contains("invariants.tolerance"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("min_sample = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nomina.toml");
        std::fs::write(&path, "max_workers = 2\n").unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap().max_workers, 2);
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}

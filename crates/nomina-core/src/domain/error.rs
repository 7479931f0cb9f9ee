//! Error taxonomy for Nomina.
//!
//! Analysis errors (`RegistryError::DomainUnavailable`, `CellError`,
//! `CacheError`) are isolated to the smallest unit of work and folded into
//! the run report. Only `EngineError::Store` and `EngineError::Worker`
//! abort a run.

use nomina_store::StorageError;

use super::ids::{DomainId, FormulaId};

/// Errors raised by a domain adapter for a single request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid data for {entity}: {reason}")]
    InvalidData { entity: String, reason: String },
}

/// Errors raised by a feature provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FeatureError {
    #[error("no features known for entity {entity}")]
    UnknownEntity { entity: String },

    #[error("feature extraction failed for {entity}: {reason}")]
    Extraction { entity: String, reason: String },
}

/// Domain registry errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate domain: {0}")]
    DuplicateDomain(DomainId),

    #[error("unknown domain: {0}")]
    UnknownDomain(DomainId),

    #[error("domain {domain} unavailable: {reason}")]
    DomainUnavailable { domain: DomainId, reason: String },

    #[error("domain {domain}: {source}")]
    Adapter {
        domain: DomainId,
        #[source]
        source: AdapterError,
    },
}

/// Structural validation failures for a candidate formula.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FormulaError {
    #[error("formula has no terms")]
    EmptyFormula,

    #[error("formula references unknown feature: {0}")]
    UnknownFeature(String),

    #[error("formula weights are all zero")]
    DegenerateWeights,

    #[error("formula weight for {feature} is not finite")]
    NonFiniteWeight { feature: String },

    #[error("formula repeats term {feature} ({op})")]
    DuplicateTerm { feature: String, op: String },

    #[error("ratio term divides {0} by itself")]
    SelfRatio(String),

    #[error("formula has {terms} terms, limit is {limit}")]
    TooManyTerms { terms: usize, limit: usize },

    #[error("canonical encoding failed: {0}")]
    Encoding(String),
}

/// Failures of a single (domain, formula) evaluation cell.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CellError {
    #[error("domain {domain} has {usable} usable entities, {required} required")]
    InsufficientSample {
        domain: DomainId,
        usable: usize,
        required: usize,
    },

    #[error("formula {formula} produced a non-finite score on {entity} in {domain}: {reason}")]
    FormulaEvaluation {
        formula: FormulaId,
        domain: DomainId,
        entity: String,
        reason: String,
    },

    #[error("formula {formula} has a constant {series} series in {domain}")]
    ConstantSeries {
        formula: FormulaId,
        domain: DomainId,
        series: &'static str,
    },
}

/// Cache lookups whose recorded versions no longer match the live ones.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error(
        "cache entry for {domain}/{formula} is stale: recorded domain v{recorded_domain_version}, \
         live v{live_domain_version}; recorded formula {recorded_formula_version}, live {live_formula_version}"
    )]
    Inconsistent {
        domain: DomainId,
        formula: FormulaId,
        recorded_domain_version: u64,
        live_domain_version: u64,
        recorded_formula_version: String,
        live_formula_version: String,
    },
}

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level engine errors. Every variant here aborts the current run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("result store unavailable: {0}")]
    Store(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("formula error: {0}")]
    Formula(#[from] FormulaError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Worker(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Infrastructure failures (as opposed to analysis failures).
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::Worker(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
pub type FormulaResult<T> = std::result::Result<T, FormulaError>;
pub type CellResult<T> = std::result::Result<T, CellError>;
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_sample_reports_counts() {
        let err = CellError::InsufficientSample {
            domain: DomainId::from("hurricanes"),
            usable: 10,
            required: 30,
        };
        let msg = err.to_string();
        assert!(msg.contains("hurricanes"));
        assert!(msg.contains("10"));
        assert!(msg.contains("30"));
    }

    #[test]
    fn store_errors_are_infrastructure() {
        let err = EngineError::from(StorageError::Backend("disk full".to_string()));
        assert!(err.is_infrastructure());
        assert!(err.to_string().contains("disk full"));

        let err = EngineError::from(FormulaError::EmptyFormula);
        assert!(!err.is_infrastructure());
        assert!(!EngineError::Cancelled.is_infrastructure());
    }

    #[test]
    fn stale_cache_names_both_versions() {
        let err = CacheError::Inconsistent {
            domain: DomainId::from("crypto"),
            formula: FormulaId::from("f-abc"),
            recorded_domain_version: 3,
            live_domain_version: 4,
            recorded_formula_version: "aaa".to_string(),
            live_formula_version: "aaa".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("v3"));
        assert!(msg.contains("v4"));
    }
}

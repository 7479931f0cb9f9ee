//! Domain model for Nomina.
//!
//! - `Formula`: immutable, versioned scoring definition
//! - `EvaluationResult`: one (domain, formula) correlation record
//! - `Generation`: a ranked population produced by one evolution step

pub mod digest;
pub mod error;
pub mod evaluation;
pub mod formula;
pub mod generation;
pub mod ids;

pub use error::{
    AdapterError, CacheError, CellError, CellResult, ConfigError, ConfigResult, EngineError,
    FeatureError, FormulaError, FormulaResult, RegistryError, RegistryResult, Result,
};
pub use evaluation::{CacheKey, EvaluationResult};
pub use formula::{Formula, FormulaTerm, TermOp};
pub use generation::{Generation, RankedFormula};
pub use ids::{DomainId, FormulaId};

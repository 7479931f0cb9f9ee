//! Evaluation records and cache keys.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DomainId, FormulaId};

/// Identity of one (domain, formula) evaluation at specific versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub domain_id: DomainId,
    pub domain_version: u64,
    pub formula_id: FormulaId,
    pub formula_version: String,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.formula_version.get(..12).unwrap_or(&self.formula_version);
        write!(
            f,
            "{}@{}/{}@{}",
            self.domain_id, self.domain_version, self.formula_id, short
        )
    }
}

/// Immutable outcome of correlating one formula's scores with one domain's
/// outcomes. A re-evaluation produces a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub domain_id: DomainId,
    pub domain_version: u64,
    pub formula_id: FormulaId,
    pub formula_version: String,
    /// Pearson coefficient, always within [-1, 1].
    pub coefficient: f64,
    /// Two-tailed p-value.
    pub p_value: f64,
    pub sample_size: usize,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn key(&self) -> CacheKey {
        CacheKey {
            domain_id: self.domain_id.clone(),
            domain_version: self.domain_version,
            formula_id: self.formula_id.clone(),
            formula_version: self.formula_version.clone(),
        }
    }

    /// Bit-for-bit equality of the statistics, ignoring the timestamp.
    pub fn same_statistics(&self, other: &EvaluationResult) -> bool {
        self.key() == other.key()
            && self.coefficient.to_bits() == other.coefficient.to_bits()
            && self.p_value.to_bits() == other.p_value.to_bits()
            && self.sample_size == other.sample_size
    }
}

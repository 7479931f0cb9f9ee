//! Identifier newtypes.

use serde::{Deserialize, Serialize};

/// Identifier of a subject domain (e.g. `cryptocurrencies`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(pub String);

impl DomainId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DomainId {
    fn from(s: &str) -> Self {
        DomainId(s.to_string())
    }
}

impl From<String> for DomainId {
    fn from(s: String) -> Self {
        DomainId(s)
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a formula, derived from its structural version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormulaId(pub String);

impl FormulaId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FormulaId {
    fn from(s: &str) -> Self {
        FormulaId(s.to_string())
    }
}

impl std::fmt::Display for FormulaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

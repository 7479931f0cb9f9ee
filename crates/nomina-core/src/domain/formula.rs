//! Formula definitions: ordered term lists with a pure scoring function.
//!
//! A `Formula` is never edited in place. Mutation and crossover build a new
//! term list and go through [`Formula::new`] again, which recomputes the
//! structural version.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::digest::structural_digest;
use super::error::{FormulaError, FormulaResult};
use super::ids::FormulaId;
use crate::features::FeatureVector;

/// How a term transforms its feature before weighting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TermOp {
    /// `x`
    #[default]
    Linear,
    /// `ln(1 + x)`; undefined for `x <= -1`.
    Log,
    /// `x / denominator`; undefined when the denominator is zero.
    Ratio { denominator: String },
}

impl fmt::Display for TermOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TermOp::Linear => f.write_str("linear"),
            TermOp::Log => f.write_str("log"),
            TermOp::Ratio { denominator } => write!(f, "ratio/{denominator}"),
        }
    }
}

/// One weighted term of a formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaTerm {
    pub feature: String,
    pub weight: f64,
    #[serde(default)]
    pub op: TermOp,
}

impl FormulaTerm {
    pub fn linear(feature: impl Into<String>, weight: f64) -> Self {
        Self {
            feature: feature.into(),
            weight,
            op: TermOp::Linear,
        }
    }

    pub fn log(feature: impl Into<String>, weight: f64) -> Self {
        Self {
            feature: feature.into(),
            weight,
            op: TermOp::Log,
        }
    }

    pub fn ratio(feature: impl Into<String>, denominator: impl Into<String>, weight: f64) -> Self {
        Self {
            feature: feature.into(),
            weight,
            op: TermOp::Ratio {
                denominator: denominator.into(),
            },
        }
    }

    /// Feature names this term reads.
    pub fn referenced_features(&self) -> Vec<&str> {
        match &self.op {
            TermOp::Ratio { denominator } => vec![self.feature.as_str(), denominator.as_str()],
            _ => vec![self.feature.as_str()],
        }
    }

    fn read(features: &FeatureVector, name: &str) -> Result<f64, String> {
        features
            .get(name)
            .ok_or_else(|| format!("feature {name} missing from vector"))
    }

    /// The transformed, unweighted value of this term.
    pub fn basis(&self, features: &FeatureVector) -> Result<f64, String> {
        let x = Self::read(features, &self.feature)?;
        let value = match &self.op {
            TermOp::Linear => x,
            TermOp::Log => {
                if x <= -1.0 {
                    return Err(format!("ln(1 + {x}) is undefined"));
                }
                x.ln_1p()
            }
            TermOp::Ratio { denominator } => {
                let d = Self::read(features, denominator)?;
                if d == 0.0 {
                    return Err(format!("division by zero ({denominator} = 0)"));
                }
                x / d
            }
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(format!("term {} is not finite", self.label()))
        }
    }

    /// Weighted value of this term.
    pub fn value(&self, features: &FeatureVector) -> Result<f64, String> {
        Ok(self.weight * self.basis(features)?)
    }

    /// Human-readable term body without the weight, e.g. `ln1p(syllables)`.
    pub fn label(&self) -> String {
        match &self.op {
            TermOp::Linear => self.feature.clone(),
            TermOp::Log => format!("ln1p({})", self.feature),
            TermOp::Ratio { denominator } => format!("({}/{})", self.feature, denominator),
        }
    }
}

/// Serialized shape of a formula. The version is recomputed on load and
/// checked against the stored one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormulaDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FormulaId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub generation: u32,
    pub terms: Vec<FormulaTerm>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<FormulaId>,
}

/// A deterministic scoring function over a feature vector.
///
/// Identity (`Eq`, `Hash`) is the structural version: two formulas with the
/// same term list are the same formula regardless of generation or lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "FormulaDefinition", into = "FormulaDefinition")]
pub struct Formula {
    id: FormulaId,
    version: String,
    generation: u32,
    terms: Vec<FormulaTerm>,
    parents: Vec<FormulaId>,
}

impl Formula {
    /// Build a formula, checking the structural rules that do not depend on
    /// the known feature set.
    pub fn new(terms: Vec<FormulaTerm>, generation: u32) -> FormulaResult<Self> {
        if terms.is_empty() {
            return Err(FormulaError::EmptyFormula);
        }

        let mut seen: HashSet<(&str, &TermOp)> = HashSet::new();
        for term in &terms {
            if !term.weight.is_finite() {
                return Err(FormulaError::NonFiniteWeight {
                    feature: term.feature.clone(),
                });
            }
            if let TermOp::Ratio { denominator } = &term.op {
                if *denominator == term.feature {
                    return Err(FormulaError::SelfRatio(term.feature.clone()));
                }
            }
            if !seen.insert((term.feature.as_str(), &term.op)) {
                return Err(FormulaError::DuplicateTerm {
                    feature: term.feature.clone(),
                    op: term.op.to_string(),
                });
            }
        }
        if terms.iter().all(|t| t.weight == 0.0) {
            return Err(FormulaError::DegenerateWeights);
        }

        let version = structural_digest(&terms)?;
        let id = FormulaId(format!("f-{}", &version[..12]));
        Ok(Self {
            id,
            version,
            generation,
            terms,
            parents: Vec::new(),
        })
    }

    /// Record the formulas this one was derived from.
    pub fn with_parents(mut self, parents: Vec<FormulaId>) -> Self {
        self.parents = parents;
        self
    }

    pub fn id(&self) -> &FormulaId {
        &self.id
    }

    /// SHA-256 of the canonical term list.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn terms(&self) -> &[FormulaTerm] {
        &self.terms
    }

    pub fn parents(&self) -> &[FormulaId] {
        &self.parents
    }

    /// Every feature name the formula reads, including ratio denominators.
    pub fn features(&self) -> BTreeSet<&str> {
        self.terms
            .iter()
            .flat_map(|t| t.referenced_features())
            .collect()
    }

    /// Score a feature vector. Fails with a reason if any term is undefined
    /// or the sum is not finite.
    pub fn score(&self, features: &FeatureVector) -> Result<f64, String> {
        let mut total = 0.0;
        for term in &self.terms {
            total += term.value(features)?;
        }
        if total.is_finite() {
            Ok(total)
        } else {
            Err("score is not finite".to_string())
        }
    }

    /// Weighted value of each term, in term order.
    pub fn term_values(&self, features: &FeatureVector) -> Result<Vec<f64>, String> {
        self.terms.iter().map(|t| t.value(features)).collect()
    }

    /// Render as `0.500*harshness + 0.200*ln1p(syllables)`.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for (i, term) in self.terms.iter().enumerate() {
            let magnitude = term.weight.abs();
            if i == 0 {
                if term.weight < 0.0 {
                    out.push('-');
                }
            } else if term.weight < 0.0 {
                out.push_str(" - ");
            } else {
                out.push_str(" + ");
            }
            out.push_str(&format!("{magnitude:.3}*{}", term.label()));
        }
        out
    }
}

impl PartialEq for Formula {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Eq for Formula {}

impl Hash for Formula {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.version.hash(state);
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.id, self.describe())
    }
}

impl TryFrom<FormulaDefinition> for Formula {
    type Error = FormulaError;

    fn try_from(def: FormulaDefinition) -> Result<Self, Self::Error> {
        let formula = Formula::new(def.terms, def.generation)?.with_parents(def.parents);
        if let Some(stored) = def.version {
            if stored != formula.version {
                return Err(FormulaError::Encoding(format!(
                    "stored version {stored} does not match structure {}",
                    formula.version
                )));
            }
        }
        Ok(formula)
    }
}

impl From<Formula> for FormulaDefinition {
    fn from(formula: Formula) -> Self {
        FormulaDefinition {
            id: Some(formula.id),
            version: Some(formula.version),
            generation: formula.generation,
            terms: formula.terms,
            parents: formula.parents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> FeatureVector {
        FeatureVector::new()
            .with("harshness", 0.5)
            .with("syllables", 3.0)
            .with("length", 8.0)
            .with("words", 2.0)
            .with("zero", 0.0)
    }

    #[test]
    fn score_sums_weighted_terms() {
        let f = Formula::new(
            vec![
                FormulaTerm::linear("harshness", 2.0),
                FormulaTerm::log("syllables", 1.0),
                FormulaTerm::ratio("length", "words", -0.5),
            ],
            0,
        )
        .unwrap();
        let expected = 2.0 * 0.5 + 4.0_f64.ln() - 0.5 * 4.0;
        assert!((f.score(&features()).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn scoring_is_deterministic() {
        let f = Formula::new(vec![FormulaTerm::log("syllables", 0.3)], 0).unwrap();
        let a = f.score(&features()).unwrap();
        let b = f.score(&features()).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn division_by_zero_is_reported() {
        let f = Formula::new(vec![FormulaTerm::ratio("length", "zero", 1.0)], 0).unwrap();
        let err = f.score(&features()).unwrap_err();
        assert!(err.contains("division by zero"));
    }

    #[test]
    fn missing_feature_is_reported() {
        let f = Formula::new(vec![FormulaTerm::linear("hue", 1.0)], 0).unwrap();
        assert!(f.score(&features()).unwrap_err().contains("hue"));
    }

    #[test]
    fn structural_rules() {
        assert_eq!(Formula::new(vec![], 0).unwrap_err(), FormulaError::EmptyFormula);
        assert_eq!(
            Formula::new(vec![FormulaTerm::linear("a", 0.0)], 0).unwrap_err(),
            FormulaError::DegenerateWeights
        );
        assert!(matches!(
            Formula::new(vec![FormulaTerm::linear("a", f64::INFINITY)], 0),
            Err(FormulaError::NonFiniteWeight { .. })
        ));
        assert!(matches!(
            Formula::new(
                vec![FormulaTerm::linear("a", 1.0), FormulaTerm::linear("a", 2.0)],
                0
            ),
            Err(FormulaError::DuplicateTerm { .. })
        ));
        assert_eq!(
            Formula::new(vec![FormulaTerm::ratio("a", "a", 1.0)], 0).unwrap_err(),
            FormulaError::SelfRatio("a".to_string())
        );
        // same feature under different ops is allowed
        assert!(Formula::new(
            vec![FormulaTerm::linear("a", 1.0), FormulaTerm::log("a", 1.0)],
            0
        )
        .is_ok());
    }

    #[test]
    fn version_ignores_generation_and_lineage() {
        let a = Formula::new(vec![FormulaTerm::linear("a", 0.5)], 0).unwrap();
        let b = Formula::new(vec![FormulaTerm::linear("a", 0.5)], 7)
            .unwrap()
            .with_parents(vec![FormulaId::from("f-parent")]);
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
        assert!(a.id().as_str().starts_with("f-"));
        assert_eq!(a.id().as_str().len(), 14);

        let c = Formula::new(vec![FormulaTerm::linear("a", 0.5000001)], 0).unwrap();
        assert_ne!(a.version(), c.version());
    }

    #[test]
    fn serde_reload_recomputes_version() {
        let f = Formula::new(
            vec![
                FormulaTerm::linear("harshness", 0.25),
                FormulaTerm::ratio("length", "words", 1.0),
            ],
            3,
        )
        .unwrap();
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["version"], f.version());

        let back: Formula = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, f);
        assert_eq!(back.generation(), 3);

        let mut tampered = json;
        tampered["terms"][0]["weight"] = serde_json::json!(0.75);
        assert!(serde_json::from_value::<Formula>(tampered).is_err());
    }

    #[test]
    fn describe_renders_signs() {
        let f = Formula::new(
            vec![
                FormulaTerm::linear("harshness", -0.5),
                FormulaTerm::log("syllables", 0.25),
            ],
            0,
        )
        .unwrap();
        assert_eq!(f.describe(), "-0.500*harshness + 0.250*ln1p(syllables)");
    }

    #[test]
    fn features_include_denominators() {
        let f = Formula::new(vec![FormulaTerm::ratio("length", "words", 1.0)], 0).unwrap();
        let names: Vec<&str> = f.features().into_iter().collect();
        assert_eq!(names, vec!["length", "words"]);
    }
}

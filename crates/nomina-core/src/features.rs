//! Feature vectors and the feature-provider boundary.
//!
//! Feature extraction is external to the engine: a provider turns an entity
//! name into a named numeric vector. Providers are pure functions of
//! (entity, provider version), so vectors are cached on exactly that key.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::domain::error::FeatureError;

/// A named numeric feature vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(BTreeMap<String, f64>);

impl FeatureVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every value is a finite number.
    pub fn is_finite(&self) -> bool {
        self.0.values().all(|v| v.is_finite())
    }
}

impl FromIterator<(String, f64)> for FeatureVector {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        FeatureVector(iter.into_iter().collect())
    }
}

/// Extracts features from an entity name.
pub trait FeatureProvider: Send + Sync {
    /// Changes whenever extraction logic changes; part of the cache key.
    fn version(&self) -> &str;

    /// The complete set of feature names this provider can emit.
    fn feature_names(&self) -> BTreeSet<String>;

    /// Extract the feature vector for one entity.
    fn features(&self, entity: &str) -> Result<FeatureVector, FeatureError>;
}

// ---------------------------------------------------------------------------
// LexicalFeatureProvider
// ---------------------------------------------------------------------------

/// Surface-level linguistic features of a name.
///
/// - `length`: letters in the name
/// - `syllables`: vowel-group estimate, at least one per word
/// - `vowel_ratio`: vowels / letters
/// - `harshness`: plosive consonants (b d g k p t) / letters
/// - `words`: whitespace-separated words
/// - `uniqueness`: distinct letters / letters
#[derive(Debug, Clone, Default)]
pub struct LexicalFeatureProvider;

const LEXICAL_FEATURES: [&str; 6] = [
    "harshness",
    "length",
    "syllables",
    "uniqueness",
    "vowel_ratio",
    "words",
];

fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y')
}

fn syllables_in(word: &str) -> usize {
    let mut count = 0;
    let mut prev_vowel = false;
    for c in word.chars() {
        let vowel = is_vowel(c);
        if vowel && !prev_vowel {
            count += 1;
        }
        prev_vowel = vowel;
    }
    if word.ends_with('e') && count > 1 && !word.ends_with("le") {
        count -= 1;
    }
    count.max(1)
}

impl LexicalFeatureProvider {
    pub fn new() -> Self {
        Self
    }
}

impl FeatureProvider for LexicalFeatureProvider {
    fn version(&self) -> &str {
        "lexical-1"
    }

    fn feature_names(&self) -> BTreeSet<String> {
        LEXICAL_FEATURES.iter().map(|s| s.to_string()).collect()
    }

    fn features(&self, entity: &str) -> Result<FeatureVector, FeatureError> {
        let lowered = entity.to_lowercase();
        let letters: Vec<char> = lowered.chars().filter(|c| c.is_alphabetic()).collect();
        if letters.is_empty() {
            return Err(FeatureError::Extraction {
                entity: entity.to_string(),
                reason: "name has no letters".to_string(),
            });
        }

        let words: Vec<String> = lowered
            .split_whitespace()
            .map(|w| w.chars().filter(|c| c.is_alphabetic()).collect::<String>())
            .filter(|w| !w.is_empty())
            .collect();
        let n = letters.len() as f64;
        let vowels = letters.iter().filter(|c| is_vowel(**c)).count() as f64;
        let plosives = letters
            .iter()
            .filter(|c| matches!(c, 'b' | 'd' | 'g' | 'k' | 'p' | 't'))
            .count() as f64;
        let distinct = letters.iter().collect::<BTreeSet<_>>().len() as f64;
        let syllables: usize = words.iter().map(|w| syllables_in(w)).sum();

        Ok(FeatureVector::new()
            .with("harshness", plosives / n)
            .with("length", n)
            .with("syllables", syllables as f64)
            .with("uniqueness", distinct / n)
            .with("vowel_ratio", vowels / n)
            .with("words", words.len().max(1) as f64))
    }
}

// ---------------------------------------------------------------------------
// StaticFeatureProvider
// ---------------------------------------------------------------------------

/// Lookup-table provider for pre-computed feature dumps.
#[derive(Debug, Clone)]
pub struct StaticFeatureProvider {
    version: String,
    names: BTreeSet<String>,
    table: HashMap<String, FeatureVector>,
}

impl StaticFeatureProvider {
    pub fn new(version: impl Into<String>, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            version: version.into(),
            names: names.into_iter().map(Into::into).collect(),
            table: HashMap::new(),
        }
    }

    pub fn insert(&mut self, entity: impl Into<String>, features: FeatureVector) {
        self.table.insert(entity.into(), features);
    }
}

impl FeatureProvider for StaticFeatureProvider {
    fn version(&self) -> &str {
        &self.version
    }

    fn feature_names(&self) -> BTreeSet<String> {
        self.names.clone()
    }

    fn features(&self, entity: &str) -> Result<FeatureVector, FeatureError> {
        self.table
            .get(entity)
            .cloned()
            .ok_or_else(|| FeatureError::UnknownEntity {
                entity: entity.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// FeatureCache
// ---------------------------------------------------------------------------

/// Memoizes provider output per (entity, provider version).
#[derive(Debug, Default)]
pub struct FeatureCache {
    entries: RwLock<HashMap<(String, String), FeatureVector>>,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached vector, or extract and remember it. Extraction errors are not cached.
    pub fn get_or_extract(
        &self,
        provider: &dyn FeatureProvider,
        entity: &str,
    ) -> Result<FeatureVector, FeatureError> {
        let key = (entity.to_string(), provider.version().to_string());
        if let Some(hit) = self.entries.read().ok().and_then(|e| e.get(&key).cloned()) {
            return Ok(hit);
        }
        let features = provider.features(entity)?;
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, features.clone());
        }
        Ok(features)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_features_for_simple_name() {
        let provider = LexicalFeatureProvider::new();
        let fv = provider.features("Katrina").unwrap();
        assert_eq!(fv.get("length"), Some(7.0));
        assert_eq!(fv.get("syllables"), Some(3.0));
        assert_eq!(fv.get("words"), Some(1.0));
        // k, t
        assert!((fv.get("harshness").unwrap() - 2.0 / 7.0).abs() < 1e-12);
        assert_eq!(fv.len(), provider.feature_names().len());
    }

    #[test]
    fn lexical_counts_words_and_silent_e() {
        let provider = LexicalFeatureProvider::new();
        let fv = provider.features("Bitcoin Cash").unwrap();
        assert_eq!(fv.get("words"), Some(2.0));
        assert_eq!(fv.get("syllables"), Some(3.0));

        let fv = provider.features("Dune").unwrap();
        assert_eq!(fv.get("syllables"), Some(1.0));
    }

    #[test]
    fn lexical_rejects_names_without_letters() {
        let provider = LexicalFeatureProvider::new();
        assert!(matches!(
            provider.features("1234"),
            Err(FeatureError::Extraction { .. })
        ));
    }

    #[test]
    fn static_provider_unknown_entity() {
        let provider = StaticFeatureProvider::new("static-1", ["a"]);
        assert!(matches!(
            provider.features("missing"),
            Err(FeatureError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn cache_is_keyed_by_provider_version() {
        let cache = FeatureCache::new();
        let mut v1 = StaticFeatureProvider::new("v1", ["x"]);
        v1.insert("e", FeatureVector::new().with("x", 1.0));
        let mut v2 = StaticFeatureProvider::new("v2", ["x"]);
        v2.insert("e", FeatureVector::new().with("x", 2.0));

        assert_eq!(cache.get_or_extract(&v1, "e").unwrap().get("x"), Some(1.0));
        assert_eq!(cache.get_or_extract(&v2, "e").unwrap().get("x"), Some(2.0));
        assert_eq!(cache.len(), 2);
        // second lookup is served from the cache
        assert_eq!(cache.get_or_extract(&v1, "e").unwrap().get("x"), Some(1.0));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn feature_vector_finiteness() {
        let fv = FeatureVector::new().with("a", 1.0).with("b", f64::NAN);
        assert!(!fv.is_finite());
        assert!(FeatureVector::new().with("a", 1.0).is_finite());
    }
}

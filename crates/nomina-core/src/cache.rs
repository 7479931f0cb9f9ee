//! Append-only evaluation cache keyed by (domain, domain version, formula,
//! formula version).
//!
//! Workers read concurrently; only the coordinator inserts. Entries are
//! never replaced: a new version of a domain or formula produces a new key,
//! and the older entry stays available for reproducibility checks.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::domain::error::CacheError;
use crate::domain::evaluation::{CacheKey, EvaluationResult};
use crate::domain::ids::{DomainId, FormulaId};

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(EvaluationResult),
    Miss,
    /// The newest entry for this (domain, formula) was recorded at other
    /// versions. Treated as a miss by the coordinator.
    Stale(CacheError),
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, EvaluationResult>,
    latest: HashMap<(DomainId, FormulaId), CacheKey>,
}

/// In-process evaluation cache.
#[derive(Debug, Default)]
pub struct EvaluationCache {
    state: RwLock<CacheState>,
}

impl EvaluationCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn lookup(&self, key: &CacheKey) -> CacheLookup {
        let state = self.read();
        if let Some(hit) = state.entries.get(key) {
            return CacheLookup::Hit(hit.clone());
        }
        match state
            .latest
            .get(&(key.domain_id.clone(), key.formula_id.clone()))
        {
            Some(recorded) => CacheLookup::Stale(CacheError::Inconsistent {
                domain: key.domain_id.clone(),
                formula: key.formula_id.clone(),
                recorded_domain_version: recorded.domain_version,
                live_domain_version: key.domain_version,
                recorded_formula_version: recorded.formula_version.clone(),
                live_formula_version: key.formula_version.clone(),
            }),
            None => CacheLookup::Miss,
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<EvaluationResult> {
        self.read().entries.get(key).cloned()
    }

    /// Append a result. Returns `false` (and keeps the existing entry) if the
    /// key is already present.
    pub fn insert(&self, result: EvaluationResult) -> bool {
        let key = result.key();
        let mut state = self.write();
        if state.entries.contains_key(&key) {
            return false;
        }
        let pair = (key.domain_id.clone(), key.formula_id.clone());
        let newer = state
            .latest
            .get(&pair)
            .map_or(true, |current| key.domain_version >= current.domain_version);
        if newer {
            state.latest.insert(pair, key.clone());
        }
        state.entries.insert(key, result);
        true
    }

    /// Load previously persisted results. Returns how many were new.
    pub fn warm(&self, results: impl IntoIterator<Item = EvaluationResult>) -> usize {
        results.into_iter().filter(|r| self.insert(r.clone())).count()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(domain_version: u64, coefficient: f64) -> EvaluationResult {
        EvaluationResult {
            domain_id: DomainId::from("crypto"),
            domain_version,
            formula_id: FormulaId::from("f-aaaaaaaaaaaa"),
            formula_version: "aaaaaaaaaaaa0000".to_string(),
            coefficient,
            p_value: 0.2,
            sample_size: 40,
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = EvaluationCache::new();
        let r = result(1, 0.4);
        assert_eq!(cache.lookup(&r.key()), CacheLookup::Miss);
        assert!(cache.insert(r.clone()));
        assert_eq!(cache.lookup(&r.key()), CacheLookup::Hit(r));
    }

    #[test]
    fn entries_are_never_overwritten() {
        let cache = EvaluationCache::new();
        let first = result(1, 0.4);
        assert!(cache.insert(first.clone()));
        assert!(!cache.insert(result(1, 0.9)));
        assert_eq!(cache.get(&first.key()).unwrap().coefficient, 0.4);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn version_bump_reports_stale_and_keeps_history() {
        let cache = EvaluationCache::new();
        let old = result(1, 0.4);
        cache.insert(old.clone());

        let live = result(2, 0.0).key();
        match cache.lookup(&live) {
            CacheLookup::Stale(CacheError::Inconsistent {
                recorded_domain_version,
                live_domain_version,
                ..
            }) => {
                assert_eq!(recorded_domain_version, 1);
                assert_eq!(live_domain_version, 2);
            }
            other => panic!("expected stale entry, got {other:?}"),
        }

        cache.insert(result(2, 0.5));
        assert!(matches!(cache.lookup(&live), CacheLookup::Hit(_)));
        // the superseded entry is still readable
        assert!(matches!(cache.lookup(&old.key()), CacheLookup::Hit(_)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn warm_skips_known_keys() {
        let cache = EvaluationCache::new();
        cache.insert(result(1, 0.4));
        let loaded = cache.warm(vec![result(1, 0.4), result(2, 0.1), result(3, 0.2)]);
        assert_eq!(loaded, 2);
        assert_eq!(cache.len(), 3);
    }
}

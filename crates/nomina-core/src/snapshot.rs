//! Immutable per-run views of a domain.
//!
//! The coordinator captures every domain once before dispatching work, so a
//! collector update that lands mid-run cannot change results for cells that
//! claim to cover the captured version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::error::RegistryResult;
use crate::domain::ids::DomainId;
use crate::features::{FeatureCache, FeatureProvider, FeatureVector};
use crate::registry::{content_fingerprint, DomainRegistry};

const CAPTURE_ATTEMPTS: usize = 3;

/// One usable entity: finite features and a defined outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub name: String,
    pub features: FeatureVector,
    pub outcome: f64,
}

/// An entity that was listed but could not be used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnusableEntity {
    pub name: String,
    pub reason: String,
}

/// A domain's entities, features and outcomes at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSnapshot {
    pub domain_id: DomainId,
    pub display_name: String,
    pub version: u64,
    /// Sorted by entity name.
    pub rows: Vec<EntityRow>,
    pub unusable: Vec<UnusableEntity>,
    pub captured_at: DateTime<Utc>,
}

impl DomainSnapshot {
    /// Materialize a domain through the registry.
    ///
    /// The entity list actually read is fingerprinted and reported to the
    /// registry, which bumps the version if the content moved since the last
    /// refresh. A capture whose content does not match the version it started
    /// from is retried; the last attempt is labelled with the version the
    /// registry assigned to its content.
    pub async fn capture(
        registry: &DomainRegistry,
        id: &DomainId,
        provider: &dyn FeatureProvider,
        features: &FeatureCache,
    ) -> RegistryResult<Self> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let version = registry.version_of(id)?;
            let (mut snapshot, fingerprint, listed) =
                Self::read_once(registry, id, version, provider, features).await?;
            let observed = registry.observe(id, fingerprint, listed)?;
            if observed == version {
                return Ok(snapshot);
            }
            if attempt >= CAPTURE_ATTEMPTS {
                snapshot.version = observed;
                return Ok(snapshot);
            }
            debug!(domain = %id, attempt, version, observed, "domain changed during capture, retrying");
        }
    }

    /// One pass over the domain. Also returns the content fingerprint of the
    /// entity list read and its length.
    async fn read_once(
        registry: &DomainRegistry,
        id: &DomainId,
        version: u64,
        provider: &dyn FeatureProvider,
        features: &FeatureCache,
    ) -> RegistryResult<(Self, String, usize)> {
        let adapter = registry.adapter(id)?;
        let descriptor = adapter.descriptor();
        let mut names = registry.entities_of(id).await?;
        names.sort();
        let fingerprint = content_fingerprint(adapter.as_ref(), &names);
        let listed = names.len();
        names.dedup();

        let mut rows = Vec::with_capacity(names.len());
        let mut unusable = Vec::new();
        for name in names {
            let vector = match adapter.feature_vector(&name).await {
                Ok(Some(v)) => Ok(v),
                Ok(None) => features
                    .get_or_extract(provider, &name)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            let vector = match vector {
                Ok(v) if v.is_finite() => v,
                Ok(_) => {
                    unusable.push(UnusableEntity {
                        name,
                        reason: "non-finite feature value".to_string(),
                    });
                    continue;
                }
                Err(reason) => {
                    unusable.push(UnusableEntity { name, reason });
                    continue;
                }
            };
            match adapter.outcome(&name).await {
                Ok(Some(outcome)) if outcome.is_finite() => rows.push(EntityRow {
                    name,
                    features: vector,
                    outcome,
                }),
                Ok(Some(_)) => unusable.push(UnusableEntity {
                    name,
                    reason: "non-finite outcome".to_string(),
                }),
                Ok(None) => unusable.push(UnusableEntity {
                    name,
                    reason: "no outcome".to_string(),
                }),
                Err(e) => unusable.push(UnusableEntity {
                    name,
                    reason: e.to_string(),
                }),
            }
        }

        let snapshot = Self {
            domain_id: id.clone(),
            display_name: descriptor.display_name,
            version,
            rows,
            unusable,
            captured_at: Utc::now(),
        };
        Ok((snapshot, fingerprint, listed))
    }

    pub fn usable(&self) -> usize {
        self.rows.len()
    }

    /// Entities the adapter listed, usable or not.
    pub fn listed(&self) -> usize {
        self.rows.len() + self.unusable.len()
    }

    pub fn outcomes(&self) -> Vec<f64> {
        self.rows.iter().map(|r| r.outcome).collect()
    }

    /// Values of one feature across all rows, or `None` if any row lacks it.
    pub fn feature_series(&self, feature: &str) -> Option<Vec<f64>> {
        self.rows.iter().map(|r| r.features.get(feature)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adapters::InMemoryDomain;
    use crate::features::StaticFeatureProvider;

    fn provider() -> StaticFeatureProvider {
        let mut p = StaticFeatureProvider::new("static-1", ["x"]);
        p.insert("a", FeatureVector::new().with("x", 1.0));
        p.insert("b", FeatureVector::new().with("x", 2.0));
        p.insert("bad", FeatureVector::new().with("x", f64::NAN));
        p
    }

    #[tokio::test]
    async fn capture_sorts_rows_and_tracks_unusable() {
        let registry = DomainRegistry::new();
        let domain = Arc::new(InMemoryDomain::new("d", "o"));
        domain.insert("b", Some(20.0));
        domain.insert("a", Some(10.0));
        domain.insert("bad", Some(1.0));
        domain.insert("pending", None);
        domain.insert("unknown", Some(3.0));
        domain.insert_with_features("own", Some(5.0), FeatureVector::new().with("x", 9.0));
        registry.register(domain).await.unwrap();

        let cache = FeatureCache::new();
        let snap = DomainSnapshot::capture(&registry, &DomainId::from("d"), &provider(), &cache)
            .await
            .unwrap();

        let names: Vec<&str> = snap.rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "own"]);
        assert_eq!(snap.usable(), 3);
        assert_eq!(snap.listed(), 6);
        assert_eq!(snap.version, 1);
        assert_eq!(snap.feature_series("x").unwrap(), vec![1.0, 2.0, 9.0]);
        assert!(snap.feature_series("y").is_none());

        let reasons: Vec<(&str, &str)> = snap
            .unusable
            .iter()
            .map(|u| (u.name.as_str(), u.reason.as_str()))
            .collect();
        assert!(reasons.contains(&("bad", "non-finite feature value")));
        assert!(reasons.iter().any(|(n, _)| *n == "unknown"));
    }

    #[tokio::test]
    async fn snapshot_is_isolated_from_later_updates() {
        let registry = DomainRegistry::new();
        let domain = Arc::new(InMemoryDomain::new("d", "o"));
        domain.insert("a", Some(1.0));
        registry.register(domain.clone()).await.unwrap();

        let cache = FeatureCache::new();
        let id = DomainId::from("d");
        let snap = DomainSnapshot::capture(&registry, &id, &provider(), &cache)
            .await
            .unwrap();

        domain.insert("b", Some(2.0));
        registry.refresh(&id).await.unwrap();

        assert_eq!(snap.usable(), 1);
        assert_eq!(snap.version, 1);
        assert_eq!(registry.version_of(&id).unwrap(), 2);
    }

    /// Lists one extra entity from the `grow_on`-th listing onwards, with no
    /// refresh in between.
    struct GrowsUnseen {
        inner: InMemoryDomain,
        listings: std::sync::atomic::AtomicUsize,
        grow_on: usize,
    }

    #[async_trait::async_trait]
    impl crate::adapters::DomainAdapter for GrowsUnseen {
        fn descriptor(&self) -> crate::adapters::DomainDescriptor {
            self.inner.descriptor()
        }

        async fn list_entities(&self) -> Result<Vec<String>, crate::domain::error::AdapterError> {
            let n = self.listings.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            if n == self.grow_on {
                self.inner.insert("c", Some(3.0));
            }
            self.inner.list_entities().await
        }

        async fn outcome(&self, entity: &str) -> Result<Option<f64>, crate::domain::error::AdapterError> {
            self.inner.outcome(entity).await
        }
    }

    #[tokio::test]
    async fn content_read_after_refresh_gets_its_own_version() {
        let inner = InMemoryDomain::new("d", "o");
        inner.insert("a", Some(1.0));
        inner.insert("b", Some(2.0));
        let domain = Arc::new(GrowsUnseen {
            inner,
            listings: std::sync::atomic::AtomicUsize::new(0),
            // registration lists once, the capture below lists second
            grow_on: 2,
        });
        let registry = DomainRegistry::new();
        registry.register(domain.clone()).await.unwrap();
        let id = DomainId::from("d");

        let mut p = provider();
        p.insert("c", FeatureVector::new().with("x", 3.0));
        let cache = FeatureCache::new();
        let snap = DomainSnapshot::capture(&registry, &id, &p, &cache)
            .await
            .unwrap();

        assert_eq!(snap.usable(), 3);
        assert_eq!(snap.version, 2);
        assert_eq!(registry.version_of(&id).unwrap(), 2);
        assert_eq!(registry.info(&id).unwrap().entity_count, 3);
    }
}

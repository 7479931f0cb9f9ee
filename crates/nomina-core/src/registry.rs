//! Domain registry.
//!
//! Holds one adapter per domain and a monotonically increasing version per
//! domain. The version is bumped whenever the domain's content fingerprint
//! changes, either on [`DomainRegistry::refresh`] or when a snapshot reports
//! content through [`DomainRegistry::observe`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::adapters::{DomainAdapter, JsonFileDomain, OutcomeDefinition};
use crate::domain::error::{AdapterError, RegistryError, RegistryResult};
use crate::domain::ids::DomainId;

/// Availability of a registered domain as of its last refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DomainStatus {
    Active,
    /// Registered with zero entities; skipped by the evaluator.
    Inactive,
    /// The adapter could not list its entities.
    Unavailable { reason: String },
}

/// Registry view of one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub id: DomainId,
    pub display_name: String,
    pub outcome: OutcomeDefinition,
    pub entity_count: usize,
    pub version: u64,
    pub status: DomainStatus,
}

impl DomainInfo {
    pub fn is_active(&self) -> bool {
        self.status == DomainStatus::Active
    }
}

struct Entry {
    adapter: Arc<dyn DomainAdapter>,
    version: u64,
    fingerprint: Option<String>,
    entity_count: usize,
    status: DomainStatus,
}

impl Entry {
    fn info(&self) -> DomainInfo {
        let descriptor = self.adapter.descriptor();
        DomainInfo {
            id: descriptor.id,
            display_name: descriptor.display_name,
            outcome: descriptor.outcome,
            entity_count: self.entity_count,
            version: self.version,
            status: self.status.clone(),
        }
    }
}

struct Listing {
    fingerprint: Option<String>,
    entity_count: usize,
    status: DomainStatus,
}

/// Content fingerprint of a domain whose sorted entity list is `entities`.
pub(crate) fn content_fingerprint(adapter: &dyn DomainAdapter, entities: &[String]) -> String {
    adapter.fingerprint().unwrap_or_else(|| {
        let mut hasher = Sha256::new();
        for entity in entities {
            hasher.update(entity.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    })
}

impl Listing {
    fn listed(fingerprint: String, entity_count: usize) -> Self {
        Self {
            fingerprint: Some(fingerprint),
            entity_count,
            status: if entity_count == 0 {
                DomainStatus::Inactive
            } else {
                DomainStatus::Active
            },
        }
    }
}

async fn list_content(adapter: &dyn DomainAdapter) -> Listing {
    match adapter.list_entities().await {
        Ok(mut entities) => {
            entities.sort();
            Listing::listed(content_fingerprint(adapter, &entities), entities.len())
        }
        Err(e) => Listing {
            fingerprint: None,
            entity_count: 0,
            status: DomainStatus::Unavailable {
                reason: e.to_string(),
            },
        },
    }
}

/// Registry of domain adapters.
#[derive(Default)]
pub struct DomainRegistry {
    entries: RwLock<BTreeMap<DomainId, Entry>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<DomainId, Entry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<DomainId, Entry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a new domain at version 1.
    ///
    /// Domains with zero entities are accepted and marked inactive. A domain
    /// whose adapter fails to list entities is accepted and marked unavailable.
    pub async fn register(&self, adapter: Arc<dyn DomainAdapter>) -> RegistryResult<DomainInfo> {
        let id = adapter.descriptor().id;
        if self.read().contains_key(&id) {
            return Err(RegistryError::DuplicateDomain(id));
        }

        let listing = list_content(adapter.as_ref()).await;
        let entry = Entry {
            adapter,
            version: 1,
            fingerprint: listing.fingerprint,
            entity_count: listing.entity_count,
            status: listing.status,
        };
        let info = entry.info();

        let mut entries = self.write();
        if entries.contains_key(&id) {
            return Err(RegistryError::DuplicateDomain(id));
        }
        entries.insert(id.clone(), entry);
        info!(domain = %id, entities = info.entity_count, status = ?info.status, "domain registered");
        Ok(info)
    }

    /// Register a domain, or swap the adapter of an existing one. Returns the
    /// info and whether the version was bumped.
    pub async fn upsert(&self, adapter: Arc<dyn DomainAdapter>) -> RegistryResult<(DomainInfo, bool)> {
        let id = adapter.descriptor().id;
        if !self.read().contains_key(&id) {
            return self.register(adapter).await.map(|info| (info, true));
        }
        let listing = list_content(adapter.as_ref()).await;
        let mut entries = self.write();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| RegistryError::UnknownDomain(id.clone()))?;
        entry.adapter = adapter;
        let changed = Self::apply(&id, entry, listing);
        Ok((entry.info(), changed))
    }

    fn apply(id: &DomainId, entry: &mut Entry, listing: Listing) -> bool {
        let changed = listing.fingerprint.is_some() && listing.fingerprint != entry.fingerprint;
        if changed {
            entry.version += 1;
            entry.fingerprint = listing.fingerprint;
            debug!(domain = %id, version = entry.version, "domain content changed");
        }
        if let DomainStatus::Unavailable { reason } = &listing.status {
            warn!(domain = %id, reason = %reason, "domain unavailable");
        }
        entry.entity_count = listing.entity_count;
        entry.status = listing.status;
        changed
    }

    /// Re-list a domain's entities and bump its version if its content changed.
    pub async fn refresh(&self, id: &DomainId) -> RegistryResult<(DomainInfo, bool)> {
        let adapter = self.adapter(id)?;
        let listing = list_content(adapter.as_ref()).await;
        let mut entries = self.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownDomain(id.clone()))?;
        let changed = Self::apply(id, entry, listing);
        Ok((entry.info(), changed))
    }

    /// Refresh every domain; returns the ids whose version changed.
    pub async fn refresh_all(&self) -> Vec<DomainId> {
        let ids: Vec<DomainId> = self.read().keys().cloned().collect();
        let mut changed = Vec::new();
        for id in ids {
            if let Ok((_, true)) = self.refresh(&id).await {
                changed.push(id);
            }
        }
        changed
    }

    /// Upsert every `*.json` domain document directly inside `dir`. Files
    /// that fail to load are skipped with a warning. Returns the ids that
    /// are new or whose version changed.
    pub async fn sync_json_dir(&self, dir: impl AsRef<Path>) -> std::io::Result<Vec<DomainId>> {
        let mut changed = Vec::new();
        for path in JsonFileDomain::discover(dir)? {
            let domain = match JsonFileDomain::load(&path) {
                Ok(domain) => domain,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping domain document");
                    continue;
                }
            };
            match self.upsert(Arc::new(domain)).await {
                Ok((info, true)) => changed.push(info.id),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "domain not registered"),
            }
        }
        Ok(changed)
    }

    /// Record content a reader listed outside of a refresh. The version is
    /// bumped if `fingerprint` differs from the last one seen. Returns the
    /// version that labels this content.
    pub fn observe(
        &self,
        id: &DomainId,
        fingerprint: String,
        entity_count: usize,
    ) -> RegistryResult<u64> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownDomain(id.clone()))?;
        Self::apply(id, entry, Listing::listed(fingerprint, entity_count));
        Ok(entry.version)
    }

    /// Content fingerprint, if the domain is still at `version`.
    pub fn fingerprint_at(&self, id: &DomainId, version: u64) -> Option<String> {
        self.read()
            .get(id)
            .filter(|e| e.version == version)
            .and_then(|e| e.fingerprint.clone())
    }

    /// Carry a version over from persisted history. A domain whose content
    /// no longer matches `fingerprint` lands one past `version`. Versions
    /// never decrease. Returns the resulting version.
    pub fn restore_version(
        &self,
        id: &DomainId,
        version: u64,
        fingerprint: Option<&str>,
    ) -> RegistryResult<u64> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownDomain(id.clone()))?;
        let unchanged = fingerprint.is_some() && entry.fingerprint.as_deref() == fingerprint;
        let target = if unchanged { version } else { version + 1 };
        if target > entry.version {
            entry.version = target;
        }
        Ok(entry.version)
    }

    pub fn list_domains(&self) -> Vec<DomainInfo> {
        self.read().values().map(Entry::info).collect()
    }

    pub fn info(&self, id: &DomainId) -> RegistryResult<DomainInfo> {
        self.read()
            .get(id)
            .map(Entry::info)
            .ok_or_else(|| RegistryError::UnknownDomain(id.clone()))
    }

    pub fn version_of(&self, id: &DomainId) -> RegistryResult<u64> {
        self.read()
            .get(id)
            .map(|e| e.version)
            .ok_or_else(|| RegistryError::UnknownDomain(id.clone()))
    }

    pub fn adapter(&self, id: &DomainId) -> RegistryResult<Arc<dyn DomainAdapter>> {
        self.read()
            .get(id)
            .map(|e| Arc::clone(&e.adapter))
            .ok_or_else(|| RegistryError::UnknownDomain(id.clone()))
    }

    pub async fn entities_of(&self, id: &DomainId) -> RegistryResult<Vec<String>> {
        let adapter = self.adapter(id)?;
        adapter
            .list_entities()
            .await
            .map_err(|e| Self::adapter_error(id, e))
    }

    pub async fn outcome_of(&self, id: &DomainId, entity: &str) -> RegistryResult<Option<f64>> {
        let adapter = self.adapter(id)?;
        adapter
            .outcome(entity)
            .await
            .map_err(|e| Self::adapter_error(id, e))
    }

    fn adapter_error(id: &DomainId, err: AdapterError) -> RegistryError {
        match err {
            AdapterError::Unavailable(reason) => RegistryError::DomainUnavailable {
                domain: id.clone(),
                reason,
            },
            other => RegistryError::Adapter {
                domain: id.clone(),
                source: other,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

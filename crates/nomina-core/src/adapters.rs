//! Domain adapter contract and the adapters that ship with Nomina.
//!
//! An adapter exposes one subject domain: its entity names, optionally their
//! feature vectors, and a scalar outcome per entity. Adapters that cannot
//! supply an entity return an [`AdapterError`] instead of a sentinel value.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::error::AdapterError;
use crate::domain::ids::DomainId;
use crate::features::FeatureVector;

/// Whether outcomes are continuous values or ranks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    #[default]
    Scalar,
    Ordinal,
}

/// How a domain's outcome variable is read and interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeDefinition {
    pub name: String,
    #[serde(default)]
    pub kind: OutcomeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl OutcomeDefinition {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OutcomeKind::Scalar,
            description: None,
        }
    }
}

/// Static description of a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDescriptor {
    pub id: DomainId,
    pub display_name: String,
    pub outcome: OutcomeDefinition,
}

/// Contract every subject domain implements.
#[async_trait]
pub trait DomainAdapter: Send + Sync {
    fn descriptor(&self) -> DomainDescriptor;

    /// Names of every entity currently in the domain.
    async fn list_entities(&self) -> Result<Vec<String>, AdapterError>;

    /// Domain-supplied features. `None` delegates to the shared feature provider.
    async fn feature_vector(&self, _entity: &str) -> Result<Option<FeatureVector>, AdapterError> {
        Ok(None)
    }

    /// The entity's outcome, or `None` when it is not (yet) defined.
    async fn outcome(&self, entity: &str) -> Result<Option<f64>, AdapterError>;

    /// Content fingerprint used to detect data changes. Adapters that return
    /// `None` are fingerprinted by their entity list.
    fn fingerprint(&self) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// InMemoryDomain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct EntityData {
    outcome: Option<f64>,
    features: Option<FeatureVector>,
}

/// Adapter over an in-process entity table. Entities can be added after
/// registration to model a collector update.
#[derive(Debug)]
pub struct InMemoryDomain {
    descriptor: DomainDescriptor,
    entities: RwLock<BTreeMap<String, EntityData>>,
    unavailable: RwLock<Option<String>>,
}

impl InMemoryDomain {
    pub fn new(id: impl Into<String>, outcome: impl Into<String>) -> Self {
        let id: String = id.into();
        Self {
            descriptor: DomainDescriptor {
                id: DomainId(id.clone()),
                display_name: id,
                outcome: OutcomeDefinition::scalar(outcome),
            },
            entities: RwLock::new(BTreeMap::new()),
            unavailable: RwLock::new(None),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.display_name = name.into();
        self
    }

    /// Add (or replace) an entity whose features come from the shared provider.
    pub fn insert(&self, name: impl Into<String>, outcome: Option<f64>) {
        self.put(name.into(), outcome, None);
    }

    /// Add (or replace) an entity with domain-supplied features.
    pub fn insert_with_features(
        &self,
        name: impl Into<String>,
        outcome: Option<f64>,
        features: FeatureVector,
    ) {
        self.put(name.into(), outcome, Some(features));
    }

    fn put(&self, name: String, outcome: Option<f64>, features: Option<FeatureVector>) {
        self.entities
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name, EntityData { outcome, features });
    }

    /// Make every subsequent request fail with `Unavailable`.
    pub fn set_unavailable(&self, reason: Option<String>) {
        *self.unavailable.write().unwrap_or_else(|p| p.into_inner()) = reason;
    }

    fn check_available(&self) -> Result<(), AdapterError> {
        match self.unavailable.read().unwrap_or_else(|p| p.into_inner()).clone() {
            Some(reason) => Err(AdapterError::Unavailable(reason)),
            None => Ok(()),
        }
    }

    fn entity(&self, entity: &str) -> Result<EntityData, AdapterError> {
        self.check_available()?;
        self.entities
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(entity)
            .cloned()
            .ok_or_else(|| AdapterError::EntityNotFound {
                entity: entity.to_string(),
            })
    }
}

#[async_trait]
impl DomainAdapter for InMemoryDomain {
    fn descriptor(&self) -> DomainDescriptor {
        self.descriptor.clone()
    }

    async fn list_entities(&self) -> Result<Vec<String>, AdapterError> {
        self.check_available()?;
        let entities = self.entities.read().unwrap_or_else(|p| p.into_inner());
        Ok(entities.keys().cloned().collect())
    }

    async fn feature_vector(&self, entity: &str) -> Result<Option<FeatureVector>, AdapterError> {
        Ok(self.entity(entity)?.features)
    }

    async fn outcome(&self, entity: &str) -> Result<Option<f64>, AdapterError> {
        Ok(self.entity(entity)?.outcome)
    }
}

// ---------------------------------------------------------------------------
// JsonFileDomain
// ---------------------------------------------------------------------------

/// One entity in a domain document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDocument {
    pub name: String,
    #[serde(default)]
    pub outcome: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureVector>,
}

/// On-disk domain document.
///
/// ```json
/// { "id": "hurricanes", "display_name": "Atlantic hurricanes",
///   "outcome": { "name": "deaths" },
///   "entities": [ { "name": "Katrina", "outcome": 1833 } ] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainDocument {
    pub id: DomainId,
    #[serde(default)]
    pub display_name: Option<String>,
    pub outcome: OutcomeDefinition,
    #[serde(default)]
    pub entities: Vec<EntityDocument>,
}

/// Adapter backed by a JSON document on disk, loaded once.
#[derive(Debug)]
pub struct JsonFileDomain {
    path: PathBuf,
    descriptor: DomainDescriptor,
    entities: BTreeMap<String, EntityDocument>,
    fingerprint: String,
}

impl JsonFileDomain {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            AdapterError::Unavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        let doc: DomainDocument = serde_json::from_slice(&bytes).map_err(|e| {
            AdapterError::Unavailable(format!("cannot parse {}: {e}", path.display()))
        })?;

        let mut entities = BTreeMap::new();
        for entity in doc.entities {
            if entities.contains_key(&entity.name) {
                return Err(AdapterError::InvalidData {
                    entity: entity.name,
                    reason: format!("listed twice in {}", path.display()),
                });
            }
            entities.insert(entity.name.clone(), entity);
        }

        let mut hasher = Sha256::new();
        hasher.update(&bytes);

        Ok(Self {
            path: path.to_path_buf(),
            descriptor: DomainDescriptor {
                display_name: doc.display_name.unwrap_or_else(|| doc.id.to_string()),
                id: doc.id,
                outcome: doc.outcome,
            },
            entities,
            fingerprint: hex::encode(hasher.finalize()),
        })
    }

    /// Every `*.json` file directly inside `dir`, sorted by path.
    pub fn discover(dir: impl AsRef<Path>) -> std::io::Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entity(&self, entity: &str) -> Result<&EntityDocument, AdapterError> {
        self.entities
            .get(entity)
            .ok_or_else(|| AdapterError::EntityNotFound {
                entity: entity.to_string(),
            })
    }
}

#[async_trait]
impl DomainAdapter for JsonFileDomain {
    fn descriptor(&self) -> DomainDescriptor {
        self.descriptor.clone()
    }

    async fn list_entities(&self) -> Result<Vec<String>, AdapterError> {
        Ok(self.entities.keys().cloned().collect())
    }

    async fn feature_vector(&self, entity: &str) -> Result<Option<FeatureVector>, AdapterError> {
        Ok(self.entity(entity)?.features.clone())
    }

    async fn outcome(&self, entity: &str) -> Result<Option<f64>, AdapterError> {
        Ok(self.entity(entity)?.outcome)
    }

    fn fingerprint(&self) -> Option<String> {
        Some(self.fingerprint.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn in_memory_domain_lists_sorted_entities() {
        let domain = InMemoryDomain::new("cards", "price");
        domain.insert("Zapdos", Some(12.0));
        domain.insert("Abra", Some(1.5));
        assert_eq!(domain.list_entities().await.unwrap(), vec!["Abra", "Zapdos"]);
        assert_eq!(domain.outcome("Abra").await.unwrap(), Some(1.5));
        assert!(domain.feature_vector("Abra").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_survive_a_poisoned_table() {
        let domain = Arc::new(InMemoryDomain::new("cards", "price"));
        let writer = Arc::clone(&domain);
        let crashed = std::thread::spawn(move || {
            let _guard = writer.entities.write().unwrap();
            panic!("collector crashed mid-update");
        })
        .join();
        assert!(crashed.is_err());
        assert!(domain.entities.is_poisoned());

        domain.insert("Abra", Some(1.0));
        assert_eq!(domain.list_entities().await.unwrap(), vec!["Abra"]);
        assert_eq!(domain.outcome("Abra").await.unwrap(), Some(1.0));
    }

    #[tokio::test]
    async fn missing_entity_is_an_error() {
        let domain = InMemoryDomain::new("cards", "price");
        assert!(matches!(
            domain.outcome("Mew").await,
            Err(AdapterError::EntityNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unavailable_domain_fails_every_call() {
        let domain = InMemoryDomain::new("cards", "price");
        domain.insert("Abra", Some(1.0));
        domain.set_unavailable(Some("upstream 503".to_string()));
        assert!(matches!(
            domain.list_entities().await,
            Err(AdapterError::Unavailable(_))
        ));
        domain.set_unavailable(None);
        assert_eq!(domain.list_entities().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn json_domain_loads_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hurricanes.json");
        std::fs::write(
            &path,
            r#"{
                "id": "hurricanes",
                "display_name": "Atlantic hurricanes",
                "outcome": { "name": "deaths" },
                "entities": [
                    { "name": "Katrina", "outcome": 1833 },
                    { "name": "Sandy", "outcome": 233, "features": { "length": 5 } },
                    { "name": "Unnamed" }
                ]
            }"#,
        )
        .unwrap();

        let domain = JsonFileDomain::load(&path).unwrap();
        assert_eq!(domain.descriptor().display_name, "Atlantic hurricanes");
        assert_eq!(domain.list_entities().await.unwrap().len(), 3);
        assert_eq!(domain.outcome("Katrina").await.unwrap(), Some(1833.0));
        assert_eq!(domain.outcome("Unnamed").await.unwrap(), None);
        let features = domain.feature_vector("Sandy").await.unwrap().unwrap();
        assert_eq!(features.get("length"), Some(5.0));
        assert_eq!(domain.fingerprint().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn json_domain_rejects_duplicate_entities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.json");
        std::fs::write(
            &path,
            r#"{"id":"d","outcome":{"name":"o"},"entities":[{"name":"a"},{"name":"a"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            JsonFileDomain::load(&path),
            Err(AdapterError::InvalidData { .. })
        ));
    }

    #[test]
    fn discover_finds_only_json_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        let found = JsonFileDomain::discover(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }
}

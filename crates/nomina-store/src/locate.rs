//! Store selection from a single location string, as given on the command
//! line or in `NOMINA_STORE`.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::fakes::MemoryResultStore;
use crate::storage_traits::{ResultStore, StorageResult};
use crate::surreal_store::{StoreConfig, SurrealResultStore};

/// Location keyword for a process-local store.
pub const MEMORY: &str = "memory";

/// Open the store named by `location`.
///
/// - `memory`: a [`MemoryResultStore`], gone when the process exits
/// - `<scheme>://...`: a SurrealDB endpoint
/// - any other value: an on-disk SurrealKV database at that path
/// - `None`: [`StoreConfig::from_env`]
pub async fn open_store(location: Option<&str>) -> StorageResult<Arc<dyn ResultStore>> {
    let store: Arc<dyn ResultStore> = match location {
        Some(MEMORY) => {
            info!("using in-memory result store");
            Arc::new(MemoryResultStore::new())
        }
        Some(endpoint) if endpoint.contains("://") => {
            Arc::new(SurrealResultStore::connect(StoreConfig::new(endpoint)).await?)
        }
        Some(path) => Arc::new(SurrealResultStore::open_local(Path::new(path)).await?),
        None => Arc::new(SurrealResultStore::connect(StoreConfig::from_env()).await?),
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_traits::{RunId, RunOutcome, RunRecord};

    #[tokio::test]
    async fn memory_and_mem_endpoint_open_empty_stores() {
        for location in [MEMORY, "mem://"] {
            let store = open_store(Some(location)).await.unwrap();
            assert!(store.latest_run().await.unwrap().is_none(), "{location}");
        }
    }

    #[tokio::test]
    async fn path_opens_an_on_disk_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let store = open_store(path.to_str()).await.unwrap();
        assert!(path.is_dir());

        let record = RunRecord::new(
            RunId::new(),
            "daily",
            RunOutcome::Completed,
            serde_json::json!({ "ok": true }),
            chrono::Utc::now(),
        )
        .unwrap();
        store.append_run(record.clone()).await.unwrap();
        assert_eq!(store.latest_run().await.unwrap().unwrap().run_id, record.run_id);
    }
}

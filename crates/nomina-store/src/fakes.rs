//! In-memory fakes for the result store (testing and ephemeral runs)
//!
//! `MemoryResultStore` satisfies the `ResultStore` contract without any
//! external dependencies. `UnwritableResultStore` rejects every write and
//! is used to exercise the coordinator's fatal-store path.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryResultStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Streams {
    runs: Vec<RunRecord>,
    generations: Vec<GenerationRecord>,
    evaluations: Vec<EvaluationRecord>,
}

/// In-memory result store backed by append-only vectors.
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    streams: Mutex<Streams>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Streams>> {
        self.streams
            .lock()
            .map_err(|e| StorageError::Backend(format!("store lock poisoned: {e}")))
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn append_run(&self, record: RunRecord) -> StorageResult<()> {
        let mut streams = self.lock()?;
        if streams.runs.iter().any(|r| r.run_id == record.run_id) {
            return Err(StorageError::DuplicateRun {
                run_id: record.run_id.0,
            });
        }
        streams.runs.push(record);
        Ok(())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let streams = self.lock()?;
        streams
            .runs
            .iter()
            .find(|r| &r.run_id == run_id)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn latest_run(&self) -> StorageResult<Option<RunRecord>> {
        Ok(self.lock()?.runs.last().cloned())
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunRecord>> {
        let mut runs = self.lock()?.runs.clone();
        runs.reverse();
        Ok(runs)
    }

    async fn append_generation(&self, record: GenerationRecord) -> StorageResult<()> {
        self.lock()?.generations.push(record);
        Ok(())
    }

    async fn latest_generation(&self) -> StorageResult<Option<GenerationRecord>> {
        Ok(self.lock()?.generations.last().cloned())
    }

    async fn generations(&self, run_id: &RunId) -> StorageResult<Vec<GenerationRecord>> {
        Ok(self
            .lock()?
            .generations
            .iter()
            .filter(|g| &g.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn append_evaluations(&self, records: Vec<EvaluationRecord>) -> StorageResult<()> {
        self.lock()?.evaluations.extend(records);
        Ok(())
    }

    async fn evaluations(&self) -> StorageResult<Vec<EvaluationRecord>> {
        Ok(self.lock()?.evaluations.clone())
    }
}

// ---------------------------------------------------------------------------
// UnwritableResultStore
// ---------------------------------------------------------------------------

/// A store whose every write fails and whose reads are empty.
#[derive(Debug, Default)]
pub struct UnwritableResultStore;

impl UnwritableResultStore {
    pub fn new() -> Self {
        Self
    }

    fn refuse() -> StorageError {
        StorageError::Backend("store is read-only".to_string())
    }
}

#[async_trait]
impl ResultStore for UnwritableResultStore {
    async fn append_run(&self, _record: RunRecord) -> StorageResult<()> {
        Err(Self::refuse())
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        Err(StorageError::RunNotFound {
            run_id: run_id.0.clone(),
        })
    }

    async fn latest_run(&self) -> StorageResult<Option<RunRecord>> {
        Ok(None)
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunRecord>> {
        Ok(Vec::new())
    }

    async fn append_generation(&self, _record: GenerationRecord) -> StorageResult<()> {
        Err(Self::refuse())
    }

    async fn latest_generation(&self) -> StorageResult<Option<GenerationRecord>> {
        Ok(None)
    }

    async fn generations(&self, _run_id: &RunId) -> StorageResult<Vec<GenerationRecord>> {
        Ok(Vec::new())
    }

    async fn append_evaluations(&self, _records: Vec<EvaluationRecord>) -> StorageResult<()> {
        Err(Self::refuse())
    }

    async fn evaluations(&self) -> StorageResult<Vec<EvaluationRecord>> {
        Ok(Vec::new())
    }
}

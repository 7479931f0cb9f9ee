//! Nomina-Store: append-only persistence for analysis runs
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: write-once run reports, generation checkpoints and the
//! evaluation ledger that lets a restarted coordinator warm its cache.
//!
//! ## Key Components
//!
//! - `ResultStore`: backend-agnostic async trait
//! - `MemoryResultStore`: in-memory implementation (tests, ephemeral runs)
//! - `SurrealResultStore`: SurrealDB implementation (`mem://`, `surrealkv://`, `ws://`)
//! - `open_store`: pick a backend from a location string

mod error;
pub mod fakes;
pub mod locate;
pub mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use error::StorageError;
pub use fakes::{MemoryResultStore, UnwritableResultStore};
pub use locate::open_store;
pub use storage_traits::{
    ContentDigest, EvaluationRecord, GenerationRecord, ResultStore, RunId, RunOutcome, RunRecord,
    StorageResult,
};
pub use surreal_store::{Credentials, StoreConfig, SurrealResultStore};

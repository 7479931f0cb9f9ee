//! Storage trait definitions for Nomina
//!
//! The result store is an append-only log with three streams:
//! - runs: one record per completed (or cancelled) analysis run
//! - generations: one checkpoint per ranked evolution generation
//! - evaluations: every computed (domain, formula) evaluation result
//!
//! Payloads are opaque JSON documents; the store never interprets them
//! beyond computing a content digest for reproducibility checks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private so the string is always lowercase hex
/// produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Digest of a JSON document's compact serialization.
    pub fn of_json(value: &serde_json::Value) -> StorageResult<Self> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self::from_bytes(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for an analysis run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// How a run ended. Runs are only recorded once they stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> StorageResult<Self> {
        match s {
            "completed" => Ok(RunOutcome::Completed),
            "cancelled" => Ok(RunOutcome::Cancelled),
            other => Err(StorageError::Backend(format!("unknown run outcome: {other}"))),
        }
    }
}

/// A persisted analysis run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    /// Trigger mode label (`daily`, `weekly`, `on-demand`)
    pub trigger: String,
    pub outcome: RunOutcome,
    /// The full report document
    pub report: serde_json::Value,
    /// Digest of `report`, recomputable by readers
    pub report_digest: ContentDigest,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl RunRecord {
    /// Build a record, computing the report digest.
    pub fn new(
        run_id: RunId,
        trigger: impl Into<String>,
        outcome: RunOutcome,
        report: serde_json::Value,
        started_at: DateTime<Utc>,
    ) -> StorageResult<Self> {
        let report_digest = ContentDigest::of_json(&report)?;
        Ok(Self {
            run_id,
            trigger: trigger.into(),
            outcome,
            report,
            report_digest,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// Whether the stored digest still matches the stored report.
    pub fn verify_digest(&self) -> StorageResult<bool> {
        Ok(ContentDigest::of_json(&self.report)? == self.report_digest)
    }
}

/// A ranked generation checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub run_id: RunId,
    pub generation: u32,
    pub best_fitness: f64,
    /// The serialized generation (formulas, fitness, ranks)
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// One computed evaluation result, keyed by its cache key string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub run_id: RunId,
    pub cache_key: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ResultStore
// ---------------------------------------------------------------------------

/// Append-only result store.
///
/// Guarantees:
/// - A run id is written at most once; a second `append_run` fails with
///   `StorageError::DuplicateRun` and leaves the first record intact.
/// - `latest_*` returns the most recently appended record.
/// - Nothing is ever updated or deleted.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist a finished run.
    async fn append_run(&self, record: RunRecord) -> StorageResult<()>;

    /// Retrieve a run by id.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;

    /// The most recently appended run, if any.
    async fn latest_run(&self) -> StorageResult<Option<RunRecord>>;

    /// All runs, newest first.
    async fn list_runs(&self) -> StorageResult<Vec<RunRecord>>;

    /// Persist a ranked generation checkpoint.
    async fn append_generation(&self, record: GenerationRecord) -> StorageResult<()>;

    /// The most recently appended generation checkpoint, if any.
    async fn latest_generation(&self) -> StorageResult<Option<GenerationRecord>>;

    /// Generation checkpoints for one run, oldest first.
    async fn generations(&self, run_id: &RunId) -> StorageResult<Vec<GenerationRecord>>;

    /// Persist a batch of evaluation results.
    async fn append_evaluations(&self, records: Vec<EvaluationRecord>) -> StorageResult<()>;

    /// Every evaluation result ever appended, oldest first.
    async fn evaluations(&self) -> StorageResult<Vec<EvaluationRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_rejects_non_hex() {
        let err = ContentDigest::try_from("zz".repeat(32)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest { .. }));
    }

    #[test]
    fn digest_normalizes_case() {
        let upper = "AB".repeat(32);
        let digest = ContentDigest::try_from(upper).unwrap();
        assert_eq!(digest.as_str(), "ab".repeat(32));
        assert_eq!(digest.short().len(), 12);
    }

    #[test]
    fn run_record_digest_tracks_report() {
        let mut record = RunRecord::new(
            RunId::new(),
            "daily",
            RunOutcome::Completed,
            serde_json::json!({"fitness": 0.5}),
            Utc::now(),
        )
        .unwrap();
        assert!(record.verify_digest().unwrap());

        record.report = serde_json::json!({"fitness": 0.6});
        assert!(!record.verify_digest().unwrap());
    }

    #[test]
    fn run_outcome_parses_its_labels() {
        for outcome in [RunOutcome::Completed, RunOutcome::Cancelled] {
            assert_eq!(RunOutcome::parse(outcome.as_str()).unwrap(), outcome);
        }
        assert!(RunOutcome::parse("exploded").is_err());
    }
}

//! SurrealDB-backed ResultStore implementation
//!
//! Rows are flat string/number records (see `migrations`); conversion to
//! `storage_traits` types happens at the boundary.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::migrations;
use crate::storage_traits::{
    ContentDigest, EvaluationRecord, GenerationRecord, ResultStore, RunId, RunOutcome, RunRecord,
    StorageResult,
};

/// Connection settings for a remote SurrealDB instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Endpoint URL (`ws://`, `wss://`, `surrealkv://`, `mem://`)
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    /// Username/password, if the endpoint requires sign-in
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Root user (true) or database user (false)
    pub is_root: bool,
}

impl StoreConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            namespace: "nomina".to_string(),
            database: "main".to_string(),
            credentials: None,
        }
    }

    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = ns.into();
        self
    }

    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.database = db.into();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        is_root: bool,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
            is_root,
        });
        self
    }

    /// Read settings from the environment.
    ///
    /// - `NOMINA_SURREAL_URL` (default: `surrealkv://.nomina/db`)
    /// - `NOMINA_SURREAL_NAMESPACE` (default: `nomina`)
    /// - `NOMINA_SURREAL_DATABASE` (default: `main`)
    /// - `NOMINA_SURREAL_USERNAME` / `NOMINA_SURREAL_PASSWORD` (optional)
    /// - `NOMINA_SURREAL_ROOT` (`true` for root users)
    pub fn from_env() -> Self {
        let endpoint = std::env::var("NOMINA_SURREAL_URL")
            .unwrap_or_else(|_| "surrealkv://.nomina/db".to_string());
        let mut config = Self::new(endpoint);
        if let Ok(ns) = std::env::var("NOMINA_SURREAL_NAMESPACE") {
            config = config.with_namespace(ns);
        }
        if let Ok(db) = std::env::var("NOMINA_SURREAL_DATABASE") {
            config = config.with_database(db);
        }
        if let (Ok(user), Ok(pass)) = (
            std::env::var("NOMINA_SURREAL_USERNAME"),
            std::env::var("NOMINA_SURREAL_PASSWORD"),
        ) {
            let is_root = std::env::var("NOMINA_SURREAL_ROOT")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
            config = config.with_credentials(user, pass, is_root);
        }
        config
    }
}

// -- row types ---------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbRun {
    seq: i64,
    run_id: String,
    trigger: String,
    outcome: String,
    report_json: String,
    report_digest: String,
    started_at: String,
    completed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbGeneration {
    seq: i64,
    run_id: String,
    generation: i64,
    best_fitness: f64,
    payload_json: String,
    recorded_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbEvaluation {
    seq: i64,
    run_id: String,
    cache_key: String,
    payload_json: String,
    recorded_at: String,
}

#[derive(Debug, Deserialize)]
struct SeqRow {
    seq: i64,
}

const RUN_FIELDS: &str =
    "seq, run_id, trigger, outcome, report_json, report_digest, started_at, completed_at";
const GENERATION_FIELDS: &str = "seq, run_id, generation, best_fitness, payload_json, recorded_at";
const EVALUATION_FIELDS: &str = "seq, run_id, cache_key, payload_json, recorded_at";

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

/// SurrealDB-backed implementation of [`ResultStore`].
pub struct SurrealResultStore {
    db: Surreal<Any>,
    run_seq: AtomicI64,
    generation_seq: AtomicI64,
    evaluation_seq: AtomicI64,
}

impl SurrealResultStore {
    /// Create an in-memory instance (`mem://`).
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect(StoreConfig::new("mem://")).await
    }

    /// Open (or create) an on-disk SurrealKV database under `path`.
    pub async fn open_local(path: &std::path::Path) -> StorageResult<Self> {
        std::fs::create_dir_all(path).map_err(|e| {
            StorageError::Connection(format!(
                "failed to create database directory {}: {e}",
                path.display()
            ))
        })?;
        Self::connect(StoreConfig::new(format!("surrealkv://{}", path.display()))).await
    }

    /// Connect with explicit settings and initialize the schema.
    #[instrument(skip(config), fields(endpoint = %config.endpoint, namespace = %config.namespace))]
    pub async fn connect(config: StoreConfig) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(&config.endpoint)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("failed to connect to {}: {e}", config.endpoint))
            })?;

        if let Some(creds) = &config.credentials {
            if creds.is_root {
                db.signin(Root {
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| StorageError::Connection(format!("root auth failed: {e}")))?;
            } else {
                db.signin(Database {
                    namespace: &config.namespace,
                    database: &config.database,
                    username: &creds.username,
                    password: &creds.password,
                })
                .await
                .map_err(|e| StorageError::Connection(format!("db auth failed: {e}")))?;
            }
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        let store = Self {
            db,
            run_seq: AtomicI64::new(0),
            generation_seq: AtomicI64::new(0),
            evaluation_seq: AtomicI64::new(0),
        };
        store
            .run_seq
            .store(store.max_seq("runs").await?, Ordering::SeqCst);
        store
            .generation_seq
            .store(store.max_seq("generations").await?, Ordering::SeqCst);
        store
            .evaluation_seq
            .store(store.max_seq("evaluations").await?, Ordering::SeqCst);

        info!(endpoint = %config.endpoint, "SurrealResultStore connected");
        Ok(store)
    }

    // -- private helpers -----------------------------------------------------

    async fn max_seq(&self, table: &'static str) -> StorageResult<i64> {
        let mut res = self
            .db
            .query(format!("SELECT seq FROM {table} ORDER BY seq DESC LIMIT 1"))
            .await?;
        let rows: Vec<SeqRow> = res.take(0)?;
        Ok(rows.first().map(|r| r.seq).unwrap_or(0))
    }

    async fn create<T: Serialize + Send + 'static>(&self, table: &'static str, row: T) -> StorageResult<()> {
        self.db
            .query(format!("CREATE {table} CONTENT $row"))
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    async fn select_runs(&self, clause: &'static str, rid: Option<String>) -> StorageResult<Vec<DbRun>> {
        let sql = format!("SELECT {RUN_FIELDS} FROM runs {clause}");
        let mut res = match rid {
            Some(rid) => self.db.query(sql).bind(("rid", rid)).await?,
            None => self.db.query(sql).await?,
        };
        Ok(res.take(0)?)
    }

    fn db_run_to_record(row: DbRun) -> StorageResult<RunRecord> {
        Ok(RunRecord {
            run_id: RunId(row.run_id),
            trigger: row.trigger,
            outcome: RunOutcome::parse(&row.outcome)?,
            report: serde_json::from_str(&row.report_json)?,
            report_digest: ContentDigest::try_from(row.report_digest)?,
            started_at: parse_time(&row.started_at)?,
            completed_at: parse_time(&row.completed_at)?,
        })
    }

    fn db_generation_to_record(row: DbGeneration) -> StorageResult<GenerationRecord> {
        Ok(GenerationRecord {
            run_id: RunId(row.run_id),
            generation: u32::try_from(row.generation)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
            best_fitness: row.best_fitness,
            payload: serde_json::from_str(&row.payload_json)?,
            recorded_at: parse_time(&row.recorded_at)?,
        })
    }

    fn db_evaluation_to_record(row: DbEvaluation) -> StorageResult<EvaluationRecord> {
        Ok(EvaluationRecord {
            run_id: RunId(row.run_id),
            cache_key: row.cache_key,
            payload: serde_json::from_str(&row.payload_json)?,
            recorded_at: parse_time(&row.recorded_at)?,
        })
    }
}

#[async_trait]
impl ResultStore for SurrealResultStore {
    async fn append_run(&self, record: RunRecord) -> StorageResult<()> {
        let existing = self
            .select_runs("WHERE run_id = $rid", Some(record.run_id.0.clone()))
            .await?;
        if !existing.is_empty() {
            return Err(StorageError::DuplicateRun {
                run_id: record.run_id.0,
            });
        }

        let seq = self.run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(run_id = %record.run_id, seq, "appending run");
        let row = DbRun {
            seq,
            run_id: record.run_id.0,
            trigger: record.trigger,
            outcome: record.outcome.as_str().to_string(),
            report_json: serde_json::to_string(&record.report)?,
            report_digest: record.report_digest.as_str().to_string(),
            started_at: format_time(&record.started_at),
            completed_at: format_time(&record.completed_at),
        };
        self.create("runs", row).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let rows = self
            .select_runs("WHERE run_id = $rid", Some(run_id.0.clone()))
            .await?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        Self::db_run_to_record(row)
    }

    async fn latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let rows = self.select_runs("ORDER BY seq DESC LIMIT 1", None).await?;
        rows.into_iter().next().map(Self::db_run_to_record).transpose()
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunRecord>> {
        let rows = self.select_runs("ORDER BY seq DESC", None).await?;
        rows.into_iter().map(Self::db_run_to_record).collect()
    }

    async fn append_generation(&self, record: GenerationRecord) -> StorageResult<()> {
        let seq = self.generation_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let row = DbGeneration {
            seq,
            run_id: record.run_id.0,
            generation: i64::from(record.generation),
            best_fitness: record.best_fitness,
            payload_json: serde_json::to_string(&record.payload)?,
            recorded_at: format_time(&record.recorded_at),
        };
        self.create("generations", row).await
    }

    async fn latest_generation(&self) -> StorageResult<Option<GenerationRecord>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT {GENERATION_FIELDS} FROM generations ORDER BY seq DESC LIMIT 1"
            ))
            .await?;
        let rows: Vec<DbGeneration> = res.take(0)?;
        rows.into_iter()
            .next()
            .map(Self::db_generation_to_record)
            .transpose()
    }

    async fn generations(&self, run_id: &RunId) -> StorageResult<Vec<GenerationRecord>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT {GENERATION_FIELDS} FROM generations WHERE run_id = $rid ORDER BY seq ASC"
            ))
            .bind(("rid", run_id.0.clone()))
            .await?;
        let rows: Vec<DbGeneration> = res.take(0)?;
        rows.into_iter().map(Self::db_generation_to_record).collect()
    }

    async fn append_evaluations(&self, records: Vec<EvaluationRecord>) -> StorageResult<()> {
        for record in records {
            let seq = self.evaluation_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let row = DbEvaluation {
                seq,
                run_id: record.run_id.0,
                cache_key: record.cache_key,
                payload_json: serde_json::to_string(&record.payload)?,
                recorded_at: format_time(&record.recorded_at),
            };
            self.create("evaluations", row).await?;
        }
        Ok(())
    }

    async fn evaluations(&self) -> StorageResult<Vec<EvaluationRecord>> {
        let mut res = self
            .db
            .query(format!(
                "SELECT {EVALUATION_FIELDS} FROM evaluations ORDER BY seq ASC"
            ))
            .await?;
        let rows: Vec<DbEvaluation> = res.take(0)?;
        rows.into_iter().map(Self::db_evaluation_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_round_trip_with_nanos() {
        let now = Utc::now();
        let parsed = parse_time(&format_time(&now)).unwrap();
        assert_eq!(parsed, now);
    }

    #[test]
    fn store_config_defaults() {
        let config = StoreConfig::new("mem://");
        assert_eq!(config.namespace, "nomina");
        assert_eq!(config.database, "main");
        assert!(config.credentials.is_none());
    }

    #[tokio::test]
    async fn fresh_store_starts_at_zero_seq() {
        let store = SurrealResultStore::in_memory().await.unwrap();
        assert_eq!(store.max_seq("runs").await.unwrap(), 0);
    }
}

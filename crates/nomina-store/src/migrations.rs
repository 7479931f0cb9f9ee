//! SurrealDB schema initialization
//!
//! All tables are append-only logs ordered by an explicit `seq` column.
//! Datetimes and JSON payloads are stored as strings so a document read
//! back is byte-identical to the one written (report digests depend on it).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Initialize all Nomina tables. Idempotent.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing Nomina SurrealDB schema");

    init_runs_table(db).await?;
    init_generations_table(db).await?;
    init_evaluations_table(db).await?;

    info!("Nomina schema initialization complete");
    Ok(())
}

/// ```text
/// TABLE runs {
///   seq:            INT     (unique, ordering)
///   run_id:         STRING  (unique)
///   trigger:        STRING
///   outcome:        STRING  (completed | cancelled)
///   report_json:    STRING
///   report_digest:  STRING
///   started_at:     STRING  (RFC 3339)
///   completed_at:   STRING  (RFC 3339)
/// }
/// ```
async fn init_runs_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runs SCHEMAFULL;
        DEFINE FIELD IF NOT EXISTS seq ON runs TYPE int;
        DEFINE FIELD IF NOT EXISTS run_id ON runs TYPE string;
        DEFINE FIELD IF NOT EXISTS trigger ON runs TYPE string;
        DEFINE FIELD IF NOT EXISTS outcome ON runs TYPE string
            ASSERT $value INSIDE ["completed", "cancelled"];
        DEFINE FIELD IF NOT EXISTS report_json ON runs TYPE string;
        DEFINE FIELD IF NOT EXISTS report_digest ON runs TYPE string;
        DEFINE FIELD IF NOT EXISTS started_at ON runs TYPE string;
        DEFINE FIELD IF NOT EXISTS completed_at ON runs TYPE string;
        DEFINE INDEX IF NOT EXISTS idx_runs_run_id ON runs FIELDS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_runs_seq ON runs FIELDS seq UNIQUE;
    "#;

    run_ddl(db, sql, "runs").await
}

/// ```text
/// TABLE generations {
///   seq, run_id, generation: INT, best_fitness: FLOAT,
///   payload_json: STRING, recorded_at: STRING
/// }
/// ```
async fn init_generations_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing generations table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS generations SCHEMAFULL;
        DEFINE FIELD IF NOT EXISTS seq ON generations TYPE int;
        DEFINE FIELD IF NOT EXISTS run_id ON generations TYPE string;
        DEFINE FIELD IF NOT EXISTS generation ON generations TYPE int;
        DEFINE FIELD IF NOT EXISTS best_fitness ON generations TYPE float;
        DEFINE FIELD IF NOT EXISTS payload_json ON generations TYPE string;
        DEFINE FIELD IF NOT EXISTS recorded_at ON generations TYPE string;
        DEFINE INDEX IF NOT EXISTS idx_generations_seq ON generations FIELDS seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_generations_run ON generations FIELDS run_id;
    "#;

    run_ddl(db, sql, "generations").await
}

/// ```text
/// TABLE evaluations {
///   seq, run_id, cache_key: STRING, payload_json: STRING, recorded_at: STRING
/// }
/// ```
async fn init_evaluations_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing evaluations table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS evaluations SCHEMAFULL;
        DEFINE FIELD IF NOT EXISTS seq ON evaluations TYPE int;
        DEFINE FIELD IF NOT EXISTS run_id ON evaluations TYPE string;
        DEFINE FIELD IF NOT EXISTS cache_key ON evaluations TYPE string;
        DEFINE FIELD IF NOT EXISTS payload_json ON evaluations TYPE string;
        DEFINE FIELD IF NOT EXISTS recorded_at ON evaluations TYPE string;
        DEFINE INDEX IF NOT EXISTS idx_evaluations_seq ON evaluations FIELDS seq UNIQUE;
    "#;

    run_ddl(db, sql, "evaluations").await
}

async fn run_ddl(db: &Surreal<Any>, sql: &str, table: &str) -> StorageResult<()> {
    db.query(sql)
        .await
        .map_err(|e| StorageError::SchemaSetup(format!("{table}: {e}")))?
        .check()
        .map_err(|e| StorageError::SchemaSetup(format!("{table}: {e}")))?;
    Ok(())
}

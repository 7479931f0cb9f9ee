//! Contract tests for ResultStore.
//!
//! Every backend must pass the same behavioural checks; each check is
//! written once against `&dyn ResultStore` and run for the in-memory fake
//! and for SurrealDB (`mem://`).

use chrono::Utc;
use nomina_store::{
    EvaluationRecord, GenerationRecord, MemoryResultStore, ResultStore, RunId, RunOutcome,
    RunRecord, StorageError, SurrealResultStore, UnwritableResultStore,
};

fn run_record(trigger: &str, fitness: f64) -> RunRecord {
    RunRecord::new(
        RunId::new(),
        trigger,
        RunOutcome::Completed,
        serde_json::json!({ "aggregate_fitness": fitness, "domains": ["a", "b"] }),
        Utc::now(),
    )
    .expect("build run record")
}

fn generation_record(run_id: &RunId, generation: u32, best: f64) -> GenerationRecord {
    GenerationRecord {
        run_id: run_id.clone(),
        generation,
        best_fitness: best,
        payload: serde_json::json!({ "number": generation, "best": best }),
        recorded_at: Utc::now(),
    }
}

async fn check_append_and_get(store: &dyn ResultStore) {
    let record = run_record("daily", 0.41);
    store.append_run(record.clone()).await.unwrap();

    let fetched = store.get_run(&record.run_id).await.unwrap();
    assert_eq!(fetched.run_id, record.run_id);
    assert_eq!(fetched.trigger, "daily");
    assert_eq!(fetched.report, record.report);
    assert!(fetched.verify_digest().unwrap());
}

async fn check_duplicate_rejected(store: &dyn ResultStore) {
    let record = run_record("weekly", 0.5);
    store.append_run(record.clone()).await.unwrap();

    let mut second = record.clone();
    second.report = serde_json::json!({ "overwritten": true });
    let err = store.append_run(second).await.unwrap_err();
    assert!(matches!(err, StorageError::DuplicateRun { .. }));

    let kept = store.get_run(&record.run_id).await.unwrap();
    assert_eq!(kept.report, record.report, "first write must survive");
}

async fn check_latest_and_order(store: &dyn ResultStore) {
    assert!(store.latest_run().await.unwrap().is_none());

    let first = run_record("daily", 0.1);
    let second = run_record("on-demand", 0.2);
    store.append_run(first.clone()).await.unwrap();
    store.append_run(second.clone()).await.unwrap();

    let latest = store.latest_run().await.unwrap().unwrap();
    assert_eq!(latest.run_id, second.run_id);

    let all = store.list_runs().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].run_id, second.run_id, "newest first");
    assert_eq!(all[1].run_id, first.run_id);
}

async fn check_missing_run(store: &dyn ResultStore) {
    let err = store.get_run(&RunId::new()).await.unwrap_err();
    assert!(matches!(err, StorageError::RunNotFound { .. }));
}

async fn check_generations(store: &dyn ResultStore) {
    let run_a = RunId::new();
    let run_b = RunId::new();
    store
        .append_generation(generation_record(&run_a, 0, 0.2))
        .await
        .unwrap();
    store
        .append_generation(generation_record(&run_a, 1, 0.3))
        .await
        .unwrap();
    store
        .append_generation(generation_record(&run_b, 0, 0.25))
        .await
        .unwrap();

    let latest = store.latest_generation().await.unwrap().unwrap();
    assert_eq!(latest.run_id, run_b);

    let for_a = store.generations(&run_a).await.unwrap();
    assert_eq!(
        for_a.iter().map(|g| g.generation).collect::<Vec<_>>(),
        vec![0, 1]
    );
    assert_eq!(for_a[1].best_fitness, 0.3);
}

async fn check_evaluations(store: &dyn ResultStore) {
    let run = RunId::new();
    let records: Vec<EvaluationRecord> = (0..3)
        .map(|i| EvaluationRecord {
            run_id: run.clone(),
            cache_key: format!("domain@{i}/f-abc@v"),
            payload: serde_json::json!({ "coefficient": 0.1 * i as f64 }),
            recorded_at: Utc::now(),
        })
        .collect();
    store.append_evaluations(records.clone()).await.unwrap();

    let stored = store.evaluations().await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored[0].cache_key, records[0].cache_key);
    assert_eq!(stored[2].payload, records[2].payload);
}

// ===========================================================================
// MemoryResultStore
// ===========================================================================

#[tokio::test]
async fn memory_append_and_get() {
    check_append_and_get(&MemoryResultStore::new()).await;
}

#[tokio::test]
async fn memory_duplicate_rejected() {
    check_duplicate_rejected(&MemoryResultStore::new()).await;
}

#[tokio::test]
async fn memory_latest_and_order() {
    check_latest_and_order(&MemoryResultStore::new()).await;
}

#[tokio::test]
async fn memory_missing_run() {
    check_missing_run(&MemoryResultStore::new()).await;
}

#[tokio::test]
async fn memory_generations() {
    check_generations(&MemoryResultStore::new()).await;
}

#[tokio::test]
async fn memory_evaluations() {
    check_evaluations(&MemoryResultStore::new()).await;
}

// ===========================================================================
// SurrealResultStore
// ===========================================================================

#[tokio::test]
async fn surreal_append_and_get() {
    let store = SurrealResultStore::in_memory().await.unwrap();
    check_append_and_get(&store).await;
}

#[tokio::test]
async fn surreal_duplicate_rejected() {
    let store = SurrealResultStore::in_memory().await.unwrap();
    check_duplicate_rejected(&store).await;
}

#[tokio::test]
async fn surreal_latest_and_order() {
    let store = SurrealResultStore::in_memory().await.unwrap();
    check_latest_and_order(&store).await;
}

#[tokio::test]
async fn surreal_missing_run() {
    let store = SurrealResultStore::in_memory().await.unwrap();
    check_missing_run(&store).await;
}

#[tokio::test]
async fn surreal_generations() {
    let store = SurrealResultStore::in_memory().await.unwrap();
    check_generations(&store).await;
}

#[tokio::test]
async fn surreal_evaluations() {
    let store = SurrealResultStore::in_memory().await.unwrap();
    check_evaluations(&store).await;
}

// ===========================================================================
// UnwritableResultStore
// ===========================================================================

#[tokio::test]
async fn unwritable_store_rejects_writes() {
    let store = UnwritableResultStore::new();
    assert!(store.append_run(run_record("daily", 0.0)).await.is_err());
    assert!(store
        .append_generation(generation_record(&RunId::new(), 0, 0.0))
        .await
        .is_err());
    assert!(store.latest_run().await.unwrap().is_none());
}

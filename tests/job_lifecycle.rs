//! End-to-end job lifecycle scenarios against the in-memory store.
//!
//! Each test constructs a fresh store and config; there is no shared state
//! between tests.

use std::sync::Arc;

use serde_json::json;

use overlock::core::config::Config;
use overlock::job::{Job, JobError, JobRecord, JobStatus};
use overlock::lock::LockError;
use overlock::store::{MemoryStore, PutCondition, Store};

fn store_and_config() -> (MemoryStore, Config) {
    (MemoryStore::new(), Config::default())
}

async fn begin(store: &MemoryStore, config: &Config) -> Job {
    Job::begin(Arc::new(store.clone()), config.clone())
        .await
        .expect("begin job")
}

fn job_status(store: &MemoryStore, config: &Config, job: &Job) -> JobStatus {
    let value = store
        .value_of(&config.jobs_collection, job.job_id().as_str())
        .expect("job record present");
    let record: JobRecord = serde_json::from_value(value).unwrap();
    record.status
}

#[tokio::test]
async fn mutual_exclusion_is_immediate() {
    let (store, config) = store_and_config();
    let mut first = begin(&store, &config).await;
    let mut second = begin(&store, &config).await;

    first.write("orders", "o1", json!(1)).await.unwrap();

    // The second job is refused before any write occurs.
    let err = second.write("orders", "o1", json!(2)).await.unwrap_err();
    assert!(matches!(
        err,
        JobError::Locked(LockError::CollectionKeyIsLocked { .. })
    ));
    assert_eq!(store.value_of("orders", "o1"), Some(json!(1)));

    // At most one lock record exists for the pair.
    assert_eq!(store.record_count(&config.locks_collection), 1);

    // Once the first job finishes, the second can proceed.
    first.complete().await.unwrap();
    second.write("orders", "o1", json!(2)).await.unwrap();
    second.complete().await.unwrap();
    assert_eq!(store.value_of("orders", "o1"), Some(json!(2)));
}

#[tokio::test]
async fn rollback_restores_every_original_value() {
    let (store, config) = store_and_config();

    // Pre-existing records O1..On.
    let originals: Vec<(String, serde_json::Value)> = (0..5)
        .map(|i| (format!("k{i}"), json!({"original": i})))
        .collect();
    for (key, value) in &originals {
        store
            .put("records", key, value, PutCondition::Any)
            .await
            .unwrap();
    }

    let mut job = begin(&store, &config).await;
    for (i, (key, _)) in originals.iter().enumerate() {
        job.write("records", key, json!({"changed": i})).await.unwrap();
    }
    assert_eq!(store.record_count(&config.locks_collection), originals.len());

    job.roll_back().await.unwrap();

    for (key, original) in &originals {
        assert_eq!(store.value_of("records", key), Some(original.clone()));
    }
    assert_eq!(store.record_count(&config.locks_collection), 0);
    assert_eq!(job_status(&store, &config, &job), JobStatus::RolledBack);
}

#[tokio::test]
async fn rollback_of_created_records_deletes_them() {
    let (store, config) = store_and_config();
    let mut job = begin(&store, &config).await;

    job.write("orders", "new-1", json!("a")).await.unwrap();
    job.write("orders", "new-2", json!("b")).await.unwrap();

    job.roll_back().await.unwrap();

    assert_eq!(store.value_of("orders", "new-1"), None);
    assert_eq!(store.value_of("orders", "new-2"), None);
    assert_eq!(store.record_count("orders"), 0);
}

#[tokio::test]
async fn external_modification_wins_over_rollback() {
    let (store, config) = store_and_config();
    store
        .put("orders", "o1", &json!("original"), PutCondition::Any)
        .await
        .unwrap();

    let mut job = begin(&store, &config).await;
    job.write("orders", "o1", json!("job-value")).await.unwrap();

    // A third party overwrites the record before rollback runs.
    let current = store.get("orders", "o1").await.unwrap();
    store
        .put(
            "orders",
            "o1",
            &json!("external"),
            PutCondition::IfMatch(current.version),
        )
        .await
        .unwrap();

    job.roll_back().await.unwrap();

    // The external value is untouched; rollback did not restore "original".
    assert_eq!(store.value_of("orders", "o1"), Some(json!("external")));
}

#[tokio::test]
async fn terminal_transitions_are_mutually_exclusive() {
    let (store, config) = store_and_config();
    let mut job = begin(&store, &config).await;
    job.write("orders", "o1", json!(1)).await.unwrap();
    job.complete().await.unwrap();

    let mutations_before = store.mutation_count();

    assert!(matches!(
        job.complete().await.unwrap_err(),
        JobError::JobIsCompleted { .. }
    ));
    assert!(matches!(
        job.roll_back().await.unwrap_err(),
        JobError::JobIsCompleted { .. }
    ));
    assert!(matches!(
        job.fail().await.unwrap_err(),
        JobError::JobIsCompleted { .. }
    ));

    // None of the refused transitions touched the store.
    assert_eq!(store.mutation_count(), mutations_before);
    assert_eq!(job_status(&store, &config, &job), JobStatus::Completed);
}

#[tokio::test]
async fn rollback_caused_by_application_error_keeps_the_cause() {
    let (store, config) = store_and_config();
    let mut job = begin(&store, &config).await;
    job.write("orders", "o1", json!("pending")).await.unwrap();

    let err = job
        .roll_back_caused_by(anyhow::anyhow!("payment gateway returned 503"))
        .await;

    match err {
        JobError::RollbackCausedByException { cause, .. } => {
            assert!(cause.to_string().contains("payment gateway returned 503"));
        }
        other => panic!("expected RollbackCausedByException, got {other:?}"),
    }
    assert_eq!(store.value_of("orders", "o1"), None);
    assert_eq!(job_status(&store, &config, &job), JobStatus::RolledBack);
}

#[tokio::test]
async fn concurrent_jobs_on_distinct_keys_proceed_independently() {
    let (store, config) = store_and_config();
    let shared: Arc<dyn Store> = Arc::new(store.clone());

    let mut handles = Vec::new();
    for i in 0..8 {
        let shared = shared.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let mut job = Job::begin(shared, config).await.unwrap();
            let key = format!("k{i}");
            job.write("records", &key, json!(i)).await.unwrap();
            job.complete().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.record_count("records"), 8);
    assert_eq!(store.record_count(&config.locks_collection), 0);
}

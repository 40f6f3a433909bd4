//! Integration tests for the result store against a real SQLite file.

use std::thread;

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use tempfile::TempDir;
use toolcheck_core::{Env, RunResult, Status};
use toolcheck_store::{ResultStore, StoreError};

fn fresh_store() -> (TempDir, ResultStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ResultStore::open(dir.path().join("results.sqlite"));
    (dir, store)
}

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn ts(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
}

fn past() -> DateTime<Utc> {
    Utc::now() - Duration::hours(1)
}

/// Drive one instance from queued to complete with the given result.
fn complete(store: &ResultStore, run_id: i64, env: Env, id: &str, result: RunResult) {
    store.update_status(run_id, env, id, Status::Waiting, None, None).unwrap();
    store.update_status(run_id, env, id, Status::Running, None, None).unwrap();
    store
        .update_status(run_id, env, id, Status::Complete, Some(result), None)
        .unwrap();
}

// =============================================================================
// enqueue_run
// =============================================================================

#[test]
fn test_enqueue_creates_one_queued_instance_per_env_and_id() {
    let (_dir, store) = fresh_store();
    let run = store
        .enqueue_run(&ids(&["b.T.default", "a.T.default"]), &Env::ALL, false, past())
        .unwrap()
        .unwrap();
    assert_eq!(run.test_ids, ids(&["a.T.default", "b.T.default"]));

    let snapshot = store.fetch_all().unwrap();
    assert_eq!(snapshot.runs.len(), 1);
    assert_eq!(snapshot.runs[0].id, run.run_id);
    assert!(snapshot.runs[0].end.is_none());
    assert_eq!(snapshot.instances.len(), 4);
    assert!(snapshot.instances.iter().all(|i| i.status == Status::Queued && i.run_result.is_none()));
}

#[test]
fn test_enqueue_empty_is_a_no_op() {
    let (_dir, store) = fresh_store();
    assert_eq!(store.enqueue_run(&[], &Env::ALL, false, past()).unwrap(), None);
    let snapshot = store.fetch_all().unwrap();
    assert!(snapshot.runs.is_empty());
    assert!(snapshot.instances.is_empty());
}

#[test]
fn test_run_ids_increase() {
    let (_dir, store) = fresh_store();
    let first = store.enqueue_run(&ids(&["a"]), &[Env::Baseline], false, past()).unwrap().unwrap();
    let second = store.enqueue_run(&ids(&["a"]), &[Env::Baseline], false, past()).unwrap().unwrap();
    assert!(second.run_id > first.run_id);
}

#[test]
fn test_enqueue_prior_failures_uses_latest_result() {
    let (_dir, store) = fresh_store();
    let all = ids(&["flaky", "fixed", "good", "never_ran"]);

    let first = store.enqueue_run(&all[..3], &[Env::Baseline], false, past()).unwrap().unwrap();
    complete(&store, first.run_id, Env::Baseline, "flaky", RunResult::Fail);
    complete(&store, first.run_id, Env::Baseline, "fixed", RunResult::Fail);
    complete(&store, first.run_id, Env::Baseline, "good", RunResult::Pass);

    let second = store.enqueue_run(&ids(&["fixed"]), &[Env::Baseline], false, past()).unwrap().unwrap();
    complete(&store, second.run_id, Env::Baseline, "fixed", RunResult::Pass);

    let retry = store.enqueue_run(&all, &[Env::Baseline], true, past()).unwrap().unwrap();
    assert_eq!(retry.test_ids, ids(&["flaky"]));
}

#[test]
fn test_enqueue_prior_failures_with_none_failed_is_a_no_op() {
    let (_dir, store) = fresh_store();
    let run = store.enqueue_run(&ids(&["a"]), &[Env::Baseline], false, past()).unwrap().unwrap();
    complete(&store, run.run_id, Env::Baseline, "a", RunResult::Pass);

    assert_eq!(store.enqueue_run(&ids(&["a"]), &Env::ALL, true, past()).unwrap(), None);
    assert_eq!(store.fetch_all().unwrap().runs.len(), 1);
}

// =============================================================================
// dequeue
// =============================================================================

#[test]
fn test_dequeue_claims_batch_once() {
    let (_dir, store) = fresh_store();
    let run = store.enqueue_run(&ids(&["a", "b"]), &Env::ALL, false, past()).unwrap().unwrap();

    let batch = store.dequeue(Env::Baseline).unwrap().unwrap();
    assert_eq!(batch.run_id, run.run_id);
    assert_eq!(batch.test_ids.len(), 2);
    assert_eq!(store.dequeue(Env::Baseline).unwrap(), None);

    // The other environment's instances are untouched.
    let snapshot = store.fetch_all().unwrap();
    for instance in &snapshot.instances {
        let expected = match instance.env {
            Env::Baseline => Status::Waiting,
            Env::Target => Status::Queued,
        };
        assert_eq!(instance.status, expected);
    }
    assert!(store.dequeue(Env::Target).unwrap().is_some());
}

#[test]
fn test_dequeue_skips_runs_scheduled_in_the_future() {
    let (_dir, store) = fresh_store();
    let start = ts("2030-06-01T12:00:00Z");
    store.enqueue_run(&ids(&["a"]), &[Env::Baseline], false, start).unwrap().unwrap();

    assert_eq!(store.dequeue_at(Env::Baseline, ts("2030-06-01T11:59:59Z")).unwrap(), None);
    assert!(store.dequeue_at(Env::Baseline, start).unwrap().is_some());
}

#[test]
fn test_dequeue_prefers_most_recent_started_run() {
    let (_dir, store) = fresh_store();
    let older = store.enqueue_run(&ids(&["a"]), &[Env::Baseline], false, past()).unwrap().unwrap();
    let newer = store.enqueue_run(&ids(&["b"]), &[Env::Baseline], false, past()).unwrap().unwrap();

    let first = store.dequeue(Env::Baseline).unwrap().unwrap();
    assert_eq!(first.run_id, newer.run_id);
    let second = store.dequeue(Env::Baseline).unwrap().unwrap();
    assert_eq!(second.run_id, older.run_id);
    assert!(second.test_ids.contains("a"));
}

#[test]
fn test_dequeue_claims_one_run_per_call_until_empty() {
    let (_dir, store) = fresh_store();
    let first = store.enqueue_run(&ids(&["a", "b"]), &[Env::Target], false, past()).unwrap().unwrap();
    let second = store.enqueue_run(&ids(&["b", "c"]), &[Env::Target], false, past()).unwrap().unwrap();
    let future = Utc::now() + Duration::hours(1);
    store.enqueue_run(&ids(&["d"]), &[Env::Target], false, future).unwrap().unwrap();

    let batch = store.dequeue(Env::Target).unwrap().unwrap();
    assert_eq!(batch.run_id, second.run_id);
    assert_eq!(batch.test_ids.into_iter().collect::<Vec<_>>(), ids(&["b", "c"]));

    // The older run is untouched by the first claim.
    let snapshot = store.fetch_all().unwrap();
    assert!(
        snapshot
            .instances
            .iter()
            .filter(|i| i.run_id == first.run_id)
            .all(|i| i.status == Status::Queued)
    );

    let batch = store.dequeue(Env::Target).unwrap().unwrap();
    assert_eq!(batch.run_id, first.run_id);
    assert_eq!(batch.test_ids.into_iter().collect::<Vec<_>>(), ids(&["a", "b"]));

    assert_eq!(store.dequeue(Env::Target).unwrap(), None);
}

#[test]
fn test_dequeue_rejects_table_without_natural_key() {
    let (dir, store) = fresh_store();
    // A table created without the primary key lets the same instance be queued twice.
    let conn = rusqlite::Connection::open(dir.path().join("results.sqlite")).unwrap();
    conn.execute_batch(
        "CREATE TABLE runs (id INTEGER PRIMARY KEY AUTOINCREMENT, start TEXT NOT NULL, \"end\" TEXT);
         CREATE TABLE test_instances (run_id INTEGER NOT NULL, env TEXT NOT NULL, id TEXT NOT NULL,
             status TEXT NOT NULL, run_result TEXT, compare_result TEXT);
         INSERT INTO runs (id, start) VALUES (1, '2020-01-01T00:00:00.000000Z');
         INSERT INTO test_instances (run_id, env, id, status) VALUES (1, 'target', 'a', 'queued');
         INSERT INTO test_instances (run_id, env, id, status) VALUES (1, 'target', 'a', 'queued');",
    )
    .unwrap();
    drop(conn);

    let err = store.dequeue(Env::Target).unwrap_err();
    assert!(
        matches!(
            err,
            StoreError::Integrity {
                env: Env::Target,
                run_id: 1,
                expected: 1,
                claimed: 2
            }
        ),
        "{err}"
    );
    // Rolled back: both rows are still queued.
    let snapshot = store.fetch_all().unwrap();
    assert_eq!(snapshot.instances.len(), 2);
    assert!(snapshot.instances.iter().all(|i| i.status == Status::Queued));
}

// =============================================================================
// update_status / set_run_end
// =============================================================================

#[test]
fn test_update_status_upserts_on_natural_key() {
    let (_dir, store) = fresh_store();
    let run = store.enqueue_run(&ids(&["a"]), &[Env::Baseline], false, past()).unwrap().unwrap();
    complete(&store, run.run_id, Env::Baseline, "a", RunResult::Pass);
    store
        .update_status(run.run_id, Env::Baseline, "a", Status::Complete, Some(RunResult::Pass), Some("same"))
        .unwrap();

    let snapshot = store.fetch_all().unwrap();
    assert_eq!(snapshot.instances.len(), 1);
    let instance = &snapshot.instances[0];
    assert_eq!(instance.status, Status::Complete);
    assert_eq!(instance.run_result, Some(RunResult::Pass));
    assert_eq!(instance.compare_result.as_deref(), Some("same"));
}

#[test]
fn test_backward_transition_is_rejected() {
    let (_dir, store) = fresh_store();
    let run = store.enqueue_run(&ids(&["a"]), &[Env::Baseline], false, past()).unwrap().unwrap();
    complete(&store, run.run_id, Env::Baseline, "a", RunResult::Fail);

    let err = store
        .update_status(run.run_id, Env::Baseline, "a", Status::Running, None, None)
        .unwrap_err();
    assert!(matches!(err, StoreError::Transition(_)));

    let snapshot = store.fetch_all().unwrap();
    assert_eq!(snapshot.instances[0].status, Status::Complete);
    assert_eq!(snapshot.instances[0].run_result, Some(RunResult::Fail));
}

#[test]
fn test_status_for_unknown_instance_must_start_queued() {
    let (_dir, store) = fresh_store();
    let err = store.update_status(1, Env::Target, "x", Status::Running, None, None).unwrap_err();
    assert!(matches!(err, StoreError::Transition(_)));
}

#[test]
fn test_result_requires_complete_status() {
    let (_dir, store) = fresh_store();
    let run = store.enqueue_run(&ids(&["a"]), &[Env::Baseline], false, past()).unwrap().unwrap();
    let err = store
        .update_status(run.run_id, Env::Baseline, "a", Status::Waiting, Some(RunResult::Pass), None)
        .unwrap_err();
    assert!(matches!(err, StoreError::ResultWithoutCompletion { .. }));
}

#[test]
fn test_set_run_end() {
    let (_dir, store) = fresh_store();
    let run = store.enqueue_run(&ids(&["a"]), &[Env::Baseline], false, past()).unwrap().unwrap();
    let end = ts("2031-01-01T00:00:00Z");
    store.set_run_end(run.run_id, end).unwrap();
    assert_eq!(store.fetch_all().unwrap().runs[0].end, Some(end));

    assert!(matches!(store.set_run_end(999, end).unwrap_err(), StoreError::UnknownRun(999)));
}

#[test]
fn test_concurrent_updates_from_two_handles_both_land() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("results.sqlite");
    let run = ResultStore::open(&db)
        .enqueue_run(&ids(&["a", "b"]), &[Env::Baseline], false, past())
        .unwrap()
        .unwrap();

    let handles: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|id| {
            let db = db.clone();
            let run_id = run.run_id;
            thread::spawn(move || {
                let store = ResultStore::open(db);
                complete(&store, run_id, Env::Baseline, id, RunResult::Pass);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = ResultStore::open(&db).fetch_all().unwrap();
    assert_eq!(snapshot.instances.len(), 2);
    assert!(snapshot.instances.iter().all(|i| i.run_result == Some(RunResult::Pass)));
    assert!(!dir.path().join("db.lock").exists());
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Re-posting any prefix of the lifecycle never creates a second row.
    #[test]
    fn prop_reposting_status_never_duplicates(steps in 1usize..=4, reposts in 1usize..=3) {
        let (_dir, store) = fresh_store();
        let run = store.enqueue_run(&ids(&["a"]), &[Env::Target], false, past()).unwrap().unwrap();
        let lifecycle = [Status::Queued, Status::Waiting, Status::Running, Status::Complete];

        for status in &lifecycle[..steps] {
            for _ in 0..reposts {
                let result = (*status == Status::Complete).then_some(RunResult::Pass);
                store.update_status(run.run_id, Env::Target, "a", *status, result, None).unwrap();
            }
        }

        let snapshot = store.fetch_all().unwrap();
        prop_assert_eq!(snapshot.instances.len(), 1);
        prop_assert_eq!(snapshot.instances[0].status, lifecycle[steps - 1]);
    }
}

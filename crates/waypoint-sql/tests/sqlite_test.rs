// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite driver tests: stores on their own, then full runs through the runner.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{SqlOp, TestDir, count, test_config};
use waypoint_core::audit::{AuditContext, AuditFilter};
use waypoint_core::lock::{LockError, LockStore};
use waypoint_core::marker::{MarkOperation, MarkerError, OngoingTaskMark};
use waypoint_core::{
    AuditEntry, AuditResolution, AuditStatus, AuditStore, Change, ChangeRunner, ChangeStatus,
    EngineError, Pipeline, RecoveryStrategy, TransactionalTargetSystem, TxType,
};
use waypoint_sql::sqlite::{SqliteAuditStore, SqliteLockStore, SqliteTargetSystem};

use AuditStatus::{Applied, Failed, RolledBack, Started};

const CREATE_CUSTOMERS: &str = "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL)";

fn pipeline(changes: Vec<Change>) -> Pipeline {
    Pipeline::new("main", changes).unwrap()
}

async fn statuses(store: &dyn AuditStore, task_id: &str) -> Vec<AuditStatus> {
    store
        .history(&AuditFilter::for_task(task_id))
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.status)
        .collect()
}

fn runner(
    lock_store: Arc<SqliteLockStore>,
    audit: Arc<SqliteAuditStore>,
    target: Arc<SqliteTargetSystem>,
) -> ChangeRunner {
    ChangeRunner::builder()
        .config(test_config())
        .lock_store(lock_store)
        .audit_store(audit)
        .transactional_target_system(target)
        .default_target_system("app-db")
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_lock_store_lease_lifecycle() {
    let dir = TestDir::new();
    let store = SqliteLockStore::new(dir.open("locks.db").await);
    let ttl = Duration::from_secs(30);

    let lease = store.upsert("waypoint", "runner-a", ttl).await.unwrap();
    assert_eq!(lease.owner_id, "runner-a");

    let again = store.upsert("waypoint", "runner-a", ttl).await.unwrap();
    assert_eq!(again.acquired_at, lease.acquired_at);

    let err = store.upsert("waypoint", "runner-b", ttl).await.unwrap_err();
    match err {
        LockError::Held { owner_id, key, .. } => {
            assert_eq!(owner_id, "runner-a");
            assert_eq!(key, "waypoint");
        }
        other => panic!("expected Held, got {other}"),
    }

    let extended = store.extend(&lease, ttl).await.unwrap().unwrap();
    assert!(extended.expires_at >= lease.expires_at);

    store.release("waypoint", "runner-b").await.unwrap();
    assert!(store.get("waypoint").await.unwrap().is_some());

    store.release("waypoint", "runner-a").await.unwrap();
    assert!(store.get("waypoint").await.unwrap().is_none());
    assert!(store.extend(&lease, ttl).await.unwrap().is_none());

    let taken = store.upsert("waypoint", "runner-b", ttl).await.unwrap();
    assert_eq!(taken.owner_id, "runner-b");
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let dir = TestDir::new();
    let store = SqliteLockStore::new(dir.open("locks.db").await);

    let stale = store
        .upsert("waypoint", "runner-a", Duration::from_millis(1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let lease = store
        .upsert("waypoint", "runner-b", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(lease.owner_id, "runner-b");
    assert!(store.extend(&stale, Duration::from_secs(30)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_audit_store_appends_and_filters_history() {
    let dir = TestDir::new();
    let store = SqliteAuditStore::new(dir.open("audit.db").await);
    assert!(store.resource_identity().is_none());

    let change = Change::single("add-index", SqlOp::new(&[]), None)
        .with_order("002")
        .with_author("dev")
        .with_recovery(RecoveryStrategy::AlwaysRetry)
        .with_metadata(json!({"ticket": "OPS-7"}));
    let context = AuditContext {
        execution_id: "exec-1".to_string(),
        stage_id: "main".to_string(),
        hostname: "ci".to_string(),
        tx_type: TxType::TxSeparateWithMarker,
        target_system_id: "app-db".to_string(),
    };

    let mut failed = AuditEntry::for_change(&change, &context, Failed);
    failed.error_trace = Some("boom".to_string());
    for entry in [
        AuditEntry::for_change(&change, &context, Started),
        failed,
        AuditEntry::for_change(&change, &context, RolledBack),
    ] {
        store.append(&entry).await.unwrap();
    }
    let other = Change::single("seed", SqlOp::new(&[]), None);
    store
        .append(&AuditEntry::for_change(&other, &context, Started))
        .await
        .unwrap();

    let history = store
        .history(&AuditFilter::for_task("add-index"))
        .await
        .unwrap();
    assert_eq!(
        history.iter().map(|e| e.status).collect::<Vec<_>>(),
        vec![Started, Failed, RolledBack]
    );
    assert_eq!(history[1].error_trace.as_deref(), Some("boom"));
    assert_eq!(history[0].order.as_deref(), Some("002"));
    assert_eq!(history[0].recovery_strategy, RecoveryStrategy::AlwaysRetry);
    assert_eq!(history[0].tx_type, TxType::TxSeparateWithMarker);
    assert_eq!(history[0].metadata, Some(json!({"ticket": "OPS-7"})));

    let all = store.history(&AuditFilter::all()).await.unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[3].task_id, "seed");

    let started = store
        .history(&AuditFilter::all().with_status(Started))
        .await
        .unwrap();
    assert_eq!(started.len(), 2);

    let none = store
        .history(&AuditFilter::all().with_execution("exec-2"))
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_shared_audit_reports_target_resource() {
    let dir = TestDir::new();
    let target = SqliteTargetSystem::new("app-db", dir.open("app.db").await);
    let audit = SqliteAuditStore::shared_with(&target);

    assert_eq!(audit.resource_identity(), Some(target.resource_identity()));
    assert!(target.resource_identity().as_str().starts_with("sqlite:"));
    assert!(target.resource_identity().as_str().ends_with("app.db"));
}

#[tokio::test]
async fn test_shared_run_commits_change_and_audit_together() {
    let dir = TestDir::new();
    let pool = dir.open("app.db").await;
    let target = Arc::new(SqliteTargetSystem::new("app-db", pool.clone()));
    let audit = Arc::new(SqliteAuditStore::shared_with(&target));
    let runner = runner(
        Arc::new(SqliteLockStore::new(pool.clone())),
        audit.clone(),
        target,
    );
    let stage = pipeline(vec![
        Change::single("create-customers", SqlOp::new(&[CREATE_CUSTOMERS]), None),
        Change::single(
            "seed-customers",
            SqlOp::new(&["INSERT INTO customers (name) VALUES ('ada'), ('grace')"]),
            None,
        ),
    ]);

    let summary = runner.run(&stage).await.unwrap();
    assert_eq!(summary.applied(), vec!["create-customers", "seed-customers"]);
    assert_eq!(summary.changes[0].tx_type, Some(TxType::TxShared));
    assert_eq!(count(&pool, "customers").await, 2);
    assert_eq!(statuses(audit.as_ref(), "seed-customers").await, vec![Started, Applied]);

    let rerun = runner.run(&stage).await.unwrap();
    assert_eq!(rerun.skipped(), vec!["create-customers", "seed-customers"]);
    assert_eq!(count(&pool, "customers").await, 2);
    assert_eq!(count(&pool, "waypoint_locks").await, 0);
}

#[tokio::test]
async fn test_shared_failure_rolls_back_rows_then_halts() {
    let dir = TestDir::new();
    let pool = dir.open("app.db").await;
    let target = Arc::new(SqliteTargetSystem::new("app-db", pool.clone()));
    let audit = Arc::new(SqliteAuditStore::shared_with(&target));
    let runner = runner(
        Arc::new(SqliteLockStore::new(pool.clone())),
        audit.clone(),
        target,
    );
    let stage = pipeline(vec![
        Change::single("create-customers", SqlOp::new(&[CREATE_CUSTOMERS]), None),
        Change::single(
            "seed-customers",
            SqlOp::failing(
                &["INSERT INTO customers (name) VALUES ('ada')"],
                "seed data rejected",
            ),
            None,
        ),
    ]);

    let err = runner.run(&stage).await.unwrap_err();
    let EngineError::ChangeExecution(failure) = err else {
        panic!("expected change execution error, got {err}");
    };
    assert_eq!(failure.task_id, "seed-customers");
    assert!(failure.message.contains("seed data rejected"));

    assert_eq!(count(&pool, "customers").await, 0);
    assert_eq!(
        statuses(audit.as_ref(), "seed-customers").await,
        vec![Started, Failed, RolledBack]
    );
    assert_eq!(count(&pool, "waypoint_locks").await, 0);

    let err = runner.run(&stage).await.unwrap_err();
    assert!(matches!(err, EngineError::ManualInterventionRequired(_)));

    runner
        .audit_fix()
        .fix("seed-customers", AuditResolution::Applied)
        .await
        .unwrap();
    let summary = runner.run(&stage).await.unwrap();
    assert_eq!(summary.skipped(), vec!["create-customers", "seed-customers"]);
}

#[tokio::test]
async fn test_separate_run_marks_inside_target_and_clears_after_commit() {
    let dir = TestDir::new();
    let audit_pool = dir.open("audit.db").await;
    let app_pool = dir.open("app.db").await;
    let target = Arc::new(SqliteTargetSystem::new("app-db", app_pool.clone()));
    let audit = Arc::new(SqliteAuditStore::new(audit_pool.clone()));
    let runner = runner(
        Arc::new(SqliteLockStore::new(audit_pool.clone())),
        audit.clone(),
        target.clone(),
    );
    let stage = pipeline(vec![Change::single(
        "create-customers",
        SqlOp::new(&[CREATE_CUSTOMERS]),
        None,
    )]);

    let summary = runner.run(&stage).await.unwrap();
    assert_eq!(summary.changes[0].tx_type, Some(TxType::TxSeparateWithMarker));
    assert_eq!(count(&app_pool, "customers").await, 0);
    assert_eq!(
        statuses(audit.as_ref(), "create-customers").await,
        vec![Started, Applied]
    );
    assert_eq!(count(&app_pool, "waypoint_audit").await, 0);

    let marker = target.marker().unwrap();
    assert!(marker.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_separate_always_retry_failure_keeps_running() {
    let dir = TestDir::new();
    let audit_pool = dir.open("audit.db").await;
    let app_pool = dir.open("app.db").await;
    let target = Arc::new(SqliteTargetSystem::new("app-db", app_pool.clone()));
    let audit = Arc::new(SqliteAuditStore::new(audit_pool.clone()));
    let runner = runner(
        Arc::new(SqliteLockStore::new(audit_pool)),
        audit.clone(),
        target.clone(),
    );
    let stage = pipeline(vec![
        Change::single(
            "flaky",
            SqlOp::failing(&[CREATE_CUSTOMERS], "upstream unavailable"),
            None,
        )
        .with_recovery(RecoveryStrategy::AlwaysRetry),
        Change::single(
            "create-orders",
            SqlOp::new(&["CREATE TABLE orders (id INTEGER PRIMARY KEY)"]),
            None,
        ),
    ]);

    let summary = runner.run(&stage).await.unwrap();
    assert_eq!(summary.changes[0].status, ChangeStatus::RolledBack);
    assert_eq!(summary.failed(), vec!["flaky"]);
    assert_eq!(summary.applied(), vec!["create-orders"]);
    assert!(!summary.is_success());
    assert_eq!(
        statuses(audit.as_ref(), "flaky").await,
        vec![Started, Failed, RolledBack]
    );
    assert_eq!(count(&app_pool, "orders").await, 0);
    assert!(target.marker().unwrap().list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_non_transactional_change_uses_pool() {
    let dir = TestDir::new();
    let pool = dir.open("app.db").await;
    let target = Arc::new(SqliteTargetSystem::new("app-db", pool.clone()));
    let audit = Arc::new(SqliteAuditStore::shared_with(&target));
    let runner = runner(Arc::new(SqliteLockStore::new(pool.clone())), audit, target);

    let summary = runner
        .run_changes(vec![
            Change::single("create-customers", SqlOp::new(&[CREATE_CUSTOMERS]), None)
                .with_transactional(false),
        ])
        .await
        .unwrap();

    assert_eq!(summary.changes[0].tx_type, Some(TxType::NonTx));
    assert_eq!(count(&pool, "customers").await, 0);
}

#[tokio::test]
async fn test_marker_lists_and_validates_rows() {
    let dir = TestDir::new();
    let pool = dir.open("app.db").await;
    let target = SqliteTargetSystem::new("app-db", pool.clone());
    let marker = target.marker().unwrap();

    sqlx::query("INSERT INTO waypoint_ongoing_tasks (task_id, operation) VALUES ('b', 'ROLLBACK'), ('a', 'EXECUTION')")
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(
        marker.list_all().await.unwrap(),
        vec![
            OngoingTaskMark::execution("a"),
            OngoingTaskMark {
                task_id: "b".to_string(),
                operation: MarkOperation::Rollback,
            },
        ]
    );

    marker.clear_mark("a").await.unwrap();
    assert_eq!(marker.list_all().await.unwrap().len(), 1);

    assert!(target.without_marker().marker().is_none());
}

#[tokio::test]
async fn test_marker_rejects_unknown_operation() {
    let dir = TestDir::new();
    let pool = dir.open("raw.db").await;

    // The SQLite schema has no CHECK on the operation column.
    sqlx::query("INSERT INTO waypoint_ongoing_tasks (task_id, operation) VALUES ('c', 'PAUSED')")
        .execute(&pool)
        .await
        .unwrap();

    let target = SqliteTargetSystem::new("app-db", pool);
    let err = target.marker().unwrap().list_all().await.unwrap_err();
    assert!(matches!(err, MarkerError::Corrupted { .. }));
}

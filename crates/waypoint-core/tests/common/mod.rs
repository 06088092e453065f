// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for waypoint-core runner tests.
//!
//! Provides in-memory stores, a target system, and change operations that
//! write through whatever handle the target system injected.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use waypoint_core::memory::{
    InMemoryAuditStore, InMemoryLockStore, InMemoryTargetSystem, MemoryDatabase, MemorySession,
};
use waypoint_core::{
    AuditEntry, AuditStatus, ChangeOperation, ChangeRunner, EngineConfig, ExecutionRuntime,
    StepTemplate,
};

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast lock settings so tests never wait long on a held lock.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_lease_ttl(Duration::from_secs(30))
        .with_lock_acquire_timeout(Duration::from_millis(200))
        .with_lock_retry_interval(Duration::from_millis(20))
}

/// Stores and target system behind one runner.
pub struct TestContext {
    pub lock_store: Arc<InMemoryLockStore>,
    pub audit: Arc<InMemoryAuditStore>,
    pub target: Arc<InMemoryTargetSystem>,
}

impl TestContext {
    /// Audit store on the target system's database: changes run `TX_SHARED`.
    pub fn shared() -> Self {
        init_tracing();
        let target = Arc::new(InMemoryTargetSystem::new("orders-db", MemoryDatabase::new()));
        Self {
            lock_store: Arc::new(InMemoryLockStore::new()),
            audit: Arc::new(InMemoryAuditStore::shared_with(&target)),
            target,
        }
    }

    /// Audit store on its own database: changes run `TX_SEPARATE_WITH_MARKER`.
    pub fn separate() -> Self {
        init_tracing();
        Self {
            lock_store: Arc::new(InMemoryLockStore::new()),
            audit: Arc::new(InMemoryAuditStore::new()),
            target: Arc::new(InMemoryTargetSystem::new("orders-db", MemoryDatabase::new())),
        }
    }

    /// Runner over this context, with the target system as default.
    pub fn runner(&self) -> ChangeRunner {
        ChangeRunner::builder()
            .config(test_config())
            .lock_store(self.lock_store.clone())
            .audit_store(self.audit.clone())
            .transactional_target_system(self.target.clone())
            .default_target_system("orders-db")
            .build()
            .expect("runner should build")
    }

    pub fn db(&self) -> &Arc<MemoryDatabase> {
        self.target.database()
    }

    /// Statuses recorded for `task_id`, in order.
    pub fn statuses(&self, task_id: &str) -> Vec<AuditStatus> {
        self.history(task_id).iter().map(|e| e.status).collect()
    }

    pub fn history(&self, task_id: &str) -> Vec<AuditEntry> {
        self.audit
            .entries()
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect()
    }
}

/// Put `value` under `key`, inside the transaction when there is one.
pub fn put(runtime: &ExecutionRuntime, key: &str, value: Value) -> anyhow::Result<()> {
    if let Some(session) = runtime.dependency::<MemorySession>() {
        session.put(key, value);
    } else {
        runtime.require::<MemoryDatabase>()?.put(key, value);
    }
    Ok(())
}

/// Delete `key`, inside the transaction when there is one.
pub fn delete(runtime: &ExecutionRuntime, key: &str) -> anyhow::Result<()> {
    if let Some(session) = runtime.dependency::<MemorySession>() {
        session.delete(key);
    } else {
        runtime.require::<MemoryDatabase>()?.delete(key);
    }
    Ok(())
}

/// Writes a key, then fails on the first `failures` calls.
pub struct WriteOp {
    key: String,
    failures: usize,
    calls: AtomicUsize,
}

impl WriteOp {
    pub fn new(key: &str) -> Arc<Self> {
        Self::failing(key, 0)
    }

    pub fn failing(key: &str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeOperation for WriteOp {
    async fn execute(&self, runtime: &mut ExecutionRuntime) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        put(runtime, &self.key, json!(call))?;
        if call < self.failures {
            anyhow::bail!("write of '{}' rejected", self.key);
        }
        Ok(())
    }
}

/// Deletes a key.
pub struct DeleteOp {
    key: String,
    calls: AtomicUsize,
}

impl DeleteOp {
    pub fn new(key: &str) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeOperation for DeleteOp {
    async fn execute(&self, runtime: &mut ExecutionRuntime) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        delete(runtime, &self.key)
    }
}

/// Step payloads: `{"put": key}`, `{"delete": key}` or `{"fail": reason}`.
#[derive(Default)]
pub struct KeyTemplate {
    pub log: std::sync::Mutex<Vec<String>>,
}

impl KeyTemplate {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn run(&self, runtime: &ExecutionRuntime, payload: &Value) -> anyhow::Result<()> {
        if let Some(reason) = payload.get("fail").and_then(Value::as_str) {
            anyhow::bail!("{reason}");
        }
        if let Some(key) = payload.get("put").and_then(Value::as_str) {
            self.log.lock().unwrap().push(format!("put {key}"));
            return put(runtime, key, json!(true));
        }
        if let Some(key) = payload.get("delete").and_then(Value::as_str) {
            self.log.lock().unwrap().push(format!("delete {key}"));
            return delete(runtime, key);
        }
        anyhow::bail!("unknown step payload {payload}")
    }
}

#[async_trait]
impl StepTemplate for KeyTemplate {
    async fn apply(&self, runtime: &mut ExecutionRuntime, payload: &Value) -> anyhow::Result<()> {
        self.run(runtime, payload)
    }

    async fn rollback(&self, runtime: &mut ExecutionRuntime, payload: &Value) -> anyhow::Result<()> {
        self.run(runtime, payload)
    }
}

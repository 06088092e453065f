// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory backends.
//!
//! A [`MemoryDatabase`] plays the role of one physical transactional resource.
//! Several components can sit on the same database (a target system and the
//! audit store) and then share transactions, exactly like two tables in one
//! SQL database. Writes made through a [`MemorySession`] are staged and only
//! become visible on commit.
//!
//! Useful for tests and for embedding the engine without external services.

mod audit;
mod lock;
mod target;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::marker::{MarkOperation, OngoingTaskMark};
use crate::target::ResourceIdentity;

pub use audit::InMemoryAuditStore;
pub use lock::InMemoryLockStore;
pub use target::InMemoryTargetSystem;

#[derive(Default)]
struct DatabaseState {
    records: BTreeMap<String, serde_json::Value>,
    marks: BTreeMap<String, MarkOperation>,
    audit: Vec<AuditEntry>,
}

/// A write staged inside a session.
#[derive(Debug, Clone)]
enum PendingWrite {
    Put(String, serde_json::Value),
    Delete(String),
    Mark(OngoingTaskMark),
    Audit(AuditEntry),
}

/// Key/value records, ongoing-task marks and audit entries behind one lock.
pub struct MemoryDatabase {
    identity: ResourceIdentity,
    state: Mutex<DatabaseState>,
}

impl MemoryDatabase {
    /// Fresh database with a unique identity.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            identity: ResourceIdentity::new(format!("memory:{}", Uuid::new_v4())),
            state: Mutex::new(DatabaseState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resource identity shared by everything built on this database.
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    /// Committed value of `key`.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.state().records.get(key).cloned()
    }

    /// Write outside any transaction.
    pub fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.state().records.insert(key.into(), value);
    }

    /// Delete outside any transaction.
    pub fn delete(&self, key: &str) -> Option<serde_json::Value> {
        self.state().records.remove(key)
    }

    /// Committed keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.state().records.keys().cloned().collect()
    }

    /// Committed ongoing-task marks.
    pub fn marks(&self) -> Vec<OngoingTaskMark> {
        self.state()
            .marks
            .iter()
            .map(|(task_id, operation)| OngoingTaskMark {
                task_id: task_id.clone(),
                operation: *operation,
            })
            .collect()
    }

    /// Store a mark outside any transaction, as a crashed runner would have left it.
    pub fn insert_mark(&self, mark: OngoingTaskMark) {
        self.state().marks.insert(mark.task_id, mark.operation);
    }

    fn remove_mark(&self, task_id: &str) {
        self.state().marks.remove(task_id);
    }

    fn append_audit(&self, entry: AuditEntry) {
        self.state().audit.push(entry);
    }

    fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state().audit.clone()
    }

    fn apply(&self, writes: Vec<PendingWrite>) {
        let mut state = self.state();
        for write in writes {
            match write {
                PendingWrite::Put(key, value) => {
                    state.records.insert(key, value);
                }
                PendingWrite::Delete(key) => {
                    state.records.remove(&key);
                }
                PendingWrite::Mark(mark) => {
                    state.marks.insert(mark.task_id, mark.operation);
                }
                PendingWrite::Audit(entry) => state.audit.push(entry),
            }
        }
    }
}

struct SessionState {
    id: String,
    db: Arc<MemoryDatabase>,
    pending: Mutex<Vec<PendingWrite>>,
}

/// Open transaction on a [`MemoryDatabase`].
///
/// Injected into the execution runtime while a transactional change runs;
/// change code fetches it with `runtime.require::<MemorySession>()`.
#[derive(Clone)]
pub struct MemorySession {
    inner: Arc<SessionState>,
}

impl MemorySession {
    fn new(id: &str, db: Arc<MemoryDatabase>) -> Self {
        Self {
            inner: Arc::new(SessionState {
                id: id.to_string(),
                db,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<PendingWrite>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Session id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Value of `key` as seen inside this transaction.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let staged = self.pending().iter().rev().find_map(|write| match write {
            PendingWrite::Put(k, value) if k == key => Some(Some(value.clone())),
            PendingWrite::Delete(k) if k == key => Some(None),
            _ => None,
        });
        match staged {
            Some(value) => value,
            None => self.inner.db.get(key),
        }
    }

    /// Stage a write.
    pub fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.pending().push(PendingWrite::Put(key.into(), value));
    }

    /// Stage a delete.
    pub fn delete(&self, key: impl Into<String>) {
        self.pending().push(PendingWrite::Delete(key.into()));
    }

    /// Number of staged writes.
    pub fn pending_writes(&self) -> usize {
        self.pending().len()
    }

    fn stage(&self, write: PendingWrite) {
        self.pending().push(write);
    }

    fn commit(&self) {
        let writes = std::mem::take(&mut *self.pending());
        self.inner.db.apply(writes);
    }

    fn discard(&self) {
        self.pending().clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_session_writes_are_invisible_until_commit() {
        let db = MemoryDatabase::new();
        db.put("a", json!(1));
        let session = MemorySession::new("c1", db.clone());

        session.put("b", json!(2));
        session.delete("a");

        assert_eq!(session.get("b"), Some(json!(2)));
        assert_eq!(session.get("a"), None);
        assert_eq!(db.get("a"), Some(json!(1)));
        assert_eq!(db.get("b"), None);

        session.commit();
        assert_eq!(db.keys(), vec!["b"]);
        assert_eq!(session.pending_writes(), 0);
    }

    #[test]
    fn test_discard_drops_staged_writes() {
        let db = MemoryDatabase::new();
        let session = MemorySession::new("c1", db.clone());
        session.put("a", json!(1));
        session.stage(PendingWrite::Mark(OngoingTaskMark::execution("c1")));

        session.discard();
        session.commit();

        assert!(db.keys().is_empty());
        assert!(db.marks().is_empty());
    }

    #[test]
    fn test_identities_are_unique() {
        assert_ne!(MemoryDatabase::new().identity(), MemoryDatabase::new().identity());
    }
}

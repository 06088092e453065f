// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{MemoryDatabase, MemorySession, PendingWrite};
use crate::marker::{MarkerError, OngoingTaskMark, TargetSystemMarker};
use crate::runtime::ExecutionRuntime;
use crate::session::{SessionError, SessionManager, SessionSupplier};
use crate::target::{ResourceIdentity, TargetSystem, TransactionalTargetSystem};
use crate::transaction::{SessionTransactionWrapper, TransactionBackend, TransactionWrapper};

struct MemorySessionSupplier {
    db: Arc<MemoryDatabase>,
}

#[async_trait]
impl SessionSupplier<MemorySession> for MemorySessionSupplier {
    async fn open(&self, session_id: &str) -> Result<MemorySession, SessionError> {
        Ok(MemorySession::new(session_id, self.db.clone()))
    }
}

pub(super) struct MemoryBackend {
    pub(super) db: Arc<MemoryDatabase>,
    pub(super) sessions: SessionManager<MemorySession>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_next_commit: AtomicBool,
    fail_next_rollback: AtomicBool,
}

#[async_trait]
impl TransactionBackend for MemoryBackend {
    type Session = MemorySession;

    fn sessions(&self) -> &SessionManager<MemorySession> {
        &self.sessions
    }

    async fn commit(&self, session: &MemorySession) -> anyhow::Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            session.discard();
            anyhow::bail!("commit rejected for session '{}'", session.id());
        }
        session.commit();
        Ok(())
    }

    async fn rollback(&self, session: &MemorySession) -> anyhow::Result<()> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        session.discard();
        if self.fail_next_rollback.swap(false, Ordering::SeqCst) {
            anyhow::bail!("rollback failed for session '{}'", session.id());
        }
        Ok(())
    }

    fn isolation_level(&self) -> Option<String> {
        Some("SERIALIZABLE".to_string())
    }

    fn connection_info(&self) -> String {
        self.db.identity().to_string()
    }
}

struct MemoryMarker {
    backend: Arc<MemoryBackend>,
}

#[async_trait]
impl TargetSystemMarker for MemoryMarker {
    async fn mark(&self, mark: &OngoingTaskMark) -> Result<(), MarkerError> {
        let session = self.backend.sessions.get_session_or_throw(&mark.task_id)?;
        session.stage(PendingWrite::Mark(mark.clone()));
        Ok(())
    }

    async fn clear_mark(&self, task_id: &str) -> Result<(), MarkerError> {
        self.backend.db.remove_mark(task_id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<OngoingTaskMark>, MarkerError> {
        Ok(self.backend.db.marks())
    }
}

/// Transactional target system over a [`MemoryDatabase`].
///
/// Transactional changes get a [`MemorySession`] in their runtime; the
/// non-transactional ones get the `Arc<MemoryDatabase>` itself.
pub struct InMemoryTargetSystem {
    id: String,
    backend: Arc<MemoryBackend>,
    wrapper: Arc<SessionTransactionWrapper<MemoryBackend>>,
    marker: Option<Arc<MemoryMarker>>,
}

impl InMemoryTargetSystem {
    /// Target system `id` on `db`, keeping an ongoing-task marker.
    pub fn new(id: impl Into<String>, db: Arc<MemoryDatabase>) -> Self {
        let backend = Arc::new(MemoryBackend {
            sessions: SessionManager::new(Arc::new(MemorySessionSupplier { db: db.clone() })),
            db,
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            fail_next_commit: AtomicBool::new(false),
            fail_next_rollback: AtomicBool::new(false),
        });
        Self {
            id: id.into(),
            wrapper: Arc::new(SessionTransactionWrapper::new(backend.clone())),
            marker: Some(Arc::new(MemoryMarker {
                backend: backend.clone(),
            })),
            backend,
        }
    }

    /// Drop the ongoing-task marker.
    pub fn without_marker(mut self) -> Self {
        self.marker = None;
        self
    }

    /// Underlying database.
    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.backend.db
    }

    /// Make the next commit fail (the transaction's writes are lost).
    pub fn fail_next_commit(&self) {
        self.backend.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next rollback report failure.
    pub fn fail_next_rollback(&self) {
        self.backend.fail_next_rollback.store(true, Ordering::SeqCst);
    }

    /// Commits attempted so far.
    pub fn commits(&self) -> usize {
        self.backend.commits.load(Ordering::SeqCst)
    }

    /// Rollbacks attempted so far.
    pub fn rollbacks(&self) -> usize {
        self.backend.rollbacks.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    pub fn active_sessions(&self) -> usize {
        self.backend.sessions.active_sessions()
    }

    pub(super) fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }
}

impl TargetSystem for InMemoryTargetSystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn enhance_runtime(&self, runtime: &mut ExecutionRuntime) {
        runtime.add_shared(self.backend.db.clone());
    }
}

impl TransactionalTargetSystem for InMemoryTargetSystem {
    fn transaction_wrapper(&self) -> Arc<dyn TransactionWrapper> {
        self.wrapper.clone()
    }

    fn marker(&self) -> Option<Arc<dyn TargetSystemMarker>> {
        self.marker
            .clone()
            .map(|marker| marker as Arc<dyn TargetSystemMarker>)
    }

    fn resource_identity(&self) -> ResourceIdentity {
        self.backend.db.identity().clone()
    }

    fn same_transactional_resource_as(&self, other: &ResourceIdentity) -> bool {
        self.backend.db.identity() == other
    }
}

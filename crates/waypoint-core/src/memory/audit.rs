// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::target::MemoryBackend;
use super::{InMemoryTargetSystem, MemoryDatabase, PendingWrite};
use crate::audit::{AuditEntry, AuditFilter, AuditStore, AuditStoreError};
use crate::target::ResourceIdentity;

/// [`AuditStore`] over a [`MemoryDatabase`].
///
/// Built with [`shared_with`](Self::shared_with) it lives on a target system's
/// database and joins that target system's open transactions.
pub struct InMemoryAuditStore {
    db: Arc<MemoryDatabase>,
    backend: Option<Arc<MemoryBackend>>,
    fail_appends: AtomicBool,
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAuditStore {
    /// Store on its own database.
    pub fn new() -> Self {
        Self {
            db: MemoryDatabase::new(),
            backend: None,
            fail_appends: AtomicBool::new(false),
        }
    }

    /// Store on `target`'s database, sharing its transactions.
    pub fn shared_with(target: &InMemoryTargetSystem) -> Self {
        Self {
            db: target.database().clone(),
            backend: Some(target.backend().clone()),
            fail_appends: AtomicBool::new(false),
        }
    }

    /// Underlying database.
    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    /// Make every append fail until switched off.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Every committed entry, in append order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.db.audit_entries()
    }

    fn check_available(&self, operation: &str) -> Result<(), AuditStoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(AuditStoreError::Backend {
                operation: operation.to_string(),
                details: "audit store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditStoreError> {
        self.check_available("append")?;
        self.db.append_audit(entry.clone());
        Ok(())
    }

    async fn append_in_session(
        &self,
        session_id: &str,
        entry: &AuditEntry,
    ) -> Result<(), AuditStoreError> {
        self.check_available("append_in_session")?;
        let Some(backend) = &self.backend else {
            self.db.append_audit(entry.clone());
            return Ok(());
        };
        let session = backend
            .sessions
            .get_session_or_throw(session_id)
            .map_err(|e| AuditStoreError::Backend {
                operation: "append_in_session".to_string(),
                details: e.to_string(),
            })?;
        session.stage(PendingWrite::Audit(entry.clone()));
        Ok(())
    }

    async fn history(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditStoreError> {
        Ok(self
            .db
            .audit_entries()
            .into_iter()
            .filter(|entry| filter.matches(entry))
            .collect())
    }

    fn resource_identity(&self) -> Option<ResourceIdentity> {
        Some(self.db.identity().clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::audit::{AuditStatus, TxType};
    use crate::change::RecoveryStrategy;
    use crate::session::SessionError;
    use crate::transaction::TransactionBackend;

    fn entry(task_id: &str, status: AuditStatus) -> AuditEntry {
        AuditEntry {
            task_id: task_id.to_string(),
            execution_id: "exec-1".to_string(),
            stage_id: "main".to_string(),
            status,
            author: "dev".to_string(),
            class_name: "AddIndex".to_string(),
            method_name: "apply".to_string(),
            created_at: Utc::now(),
            execution_millis: 1,
            execution_hostname: "host".to_string(),
            error_trace: None,
            system_change: false,
            tx_type: TxType::TxShared,
            target_system_id: "db".to_string(),
            recovery_strategy: RecoveryStrategy::AlwaysRetry,
            order: None,
            transactional: true,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_in_session_entries_follow_the_transaction() {
        let target = InMemoryTargetSystem::new("db", MemoryDatabase::new());
        let store = InMemoryAuditStore::shared_with(&target);
        let backend = target.backend().clone();

        let session = backend.sessions.start_session("c1").await.unwrap();
        store
            .append_in_session("c1", &entry("c1", AuditStatus::Started))
            .await
            .unwrap();
        assert!(store.entries().is_empty());
        backend.commit(&session).await.unwrap();
        assert_eq!(store.entries().len(), 1);

        let session = backend.sessions.start_session("c2").await.unwrap();
        store
            .append_in_session("c2", &entry("c2", AuditStatus::Started))
            .await
            .unwrap();
        backend.rollback(&session).await.unwrap();
        assert_eq!(store.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_in_session_without_open_session_fails() {
        let target = InMemoryTargetSystem::new("db", MemoryDatabase::new());
        let store = InMemoryAuditStore::shared_with(&target);

        let err = store
            .append_in_session("ghost", &entry("ghost", AuditStatus::Started))
            .await
            .unwrap_err();
        assert!(err.to_string().contains(
            &SessionError::NoActiveSession {
                session_id: "ghost".to_string()
            }
            .to_string()
        ));
    }

    #[tokio::test]
    async fn test_standalone_store_appends_directly() {
        let store = InMemoryAuditStore::new();
        store
            .append_in_session("c1", &entry("c1", AuditStatus::Started))
            .await
            .unwrap();
        store.append(&entry("c1", AuditStatus::Applied)).await.unwrap();

        let applied = store
            .history(&AuditFilter::all().with_status(AuditStatus::Applied))
            .await
            .unwrap();
        assert_eq!(applied.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_appends() {
        let store = InMemoryAuditStore::new();
        store.fail_appends(true);
        assert!(store.append(&entry("c1", AuditStatus::Started)).await.is_err());
        store.fail_appends(false);
        assert!(store.append(&entry("c1", AuditStatus::Started)).await.is_ok());
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-attempt audit state machine.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error};

use super::{AuditEntry, AuditStatus, AuditStore};
use crate::error::EngineError;

/// How an entry reaches the store.
#[derive(Debug, Clone, Copy)]
pub enum AuditWriteMode<'a> {
    /// Standalone durable append.
    Direct,
    /// Inside the open transaction with this session id.
    InSession(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptState {
    NotStarted,
    Recorded(AuditStatus),
}

impl AttemptState {
    fn name(&self) -> String {
        match self {
            Self::NotStarted => "NOT_STARTED".to_string(),
            Self::Recorded(status) => status.to_string(),
        }
    }

    fn allows(&self, next: AuditStatus) -> bool {
        use AuditStatus::*;
        matches!(
            (self, next),
            (Self::NotStarted, Started)
                | (Self::Recorded(Started), Applied)
                | (Self::Recorded(Started), Failed)
                | (Self::Recorded(Failed), RolledBack)
                | (Self::Recorded(Failed), RollbackFailed)
        )
    }
}

/// Records one execution attempt of one change.
///
/// Rejects entries that would break the state machine before they reach the
/// store, and stamps each entry with the time spent since the attempt began.
pub struct ChangeAttempt {
    store: Arc<dyn AuditStore>,
    template: AuditEntry,
    started: Instant,
    state: Mutex<AttemptState>,
}

impl ChangeAttempt {
    /// Begin tracking an attempt. `template` supplies every field but status, time and trace.
    pub fn new(store: Arc<dyn AuditStore>, template: AuditEntry) -> Self {
        Self {
            store,
            template,
            started: Instant::now(),
            state: Mutex::new(AttemptState::NotStarted),
        }
    }

    /// Change id.
    pub fn task_id(&self) -> &str {
        &self.template.task_id
    }

    /// Last status recorded in this attempt.
    pub fn last_status(&self) -> Option<AuditStatus> {
        match *self.lock_state() {
            AttemptState::NotStarted => None,
            AttemptState::Recorded(status) => Some(status),
        }
    }

    /// Validate, build and write an entry with `status`.
    pub async fn record(
        &self,
        status: AuditStatus,
        error_trace: Option<String>,
        mode: AuditWriteMode<'_>,
    ) -> Result<AuditEntry, EngineError> {
        let current = *self.lock_state();
        if !current.allows(status) {
            return Err(EngineError::InvalidAuditTransition {
                task_id: self.template.task_id.clone(),
                from: current.name(),
                to: status,
            });
        }

        let mut entry = self.template.clone();
        entry.status = status;
        entry.created_at = Utc::now();
        entry.execution_millis = self.started.elapsed().as_millis() as i64;
        entry.error_trace = error_trace;

        let written = match mode {
            AuditWriteMode::Direct => self.store.append(&entry).await,
            AuditWriteMode::InSession(session_id) => {
                self.store.append_in_session(session_id, &entry).await
            }
        };
        if let Err(source) = written {
            error!(
                change_id = %entry.task_id,
                status = %status,
                error = %source,
                "Failed to write audit entry"
            );
            return Err(EngineError::AuditWrite {
                task_id: entry.task_id.clone(),
                status,
                source,
            });
        }

        *self.lock_state() = AttemptState::Recorded(status);
        debug!(change_id = %entry.task_id, status = %status, "Audit entry written");
        Ok(entry)
    }

    /// Forget entries written inside a transaction that was rolled back.
    pub fn discard_uncommitted(&self) {
        *self.lock_state() = AttemptState::NotStarted;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, AttemptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditContext, AuditFilter, TxType};
    use crate::change::{Change, ChangeOperation};
    use crate::memory::InMemoryAuditStore;
    use crate::runtime::ExecutionRuntime;

    struct Noop;

    #[async_trait::async_trait]
    impl ChangeOperation for Noop {
        async fn execute(&self, _runtime: &mut ExecutionRuntime) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn attempt(store: Arc<InMemoryAuditStore>) -> ChangeAttempt {
        let change = Change::single("create-users", Arc::new(Noop), None).with_author("dev");
        let context = AuditContext {
            execution_id: "exec-1".to_string(),
            stage_id: "main".to_string(),
            hostname: "host".to_string(),
            tx_type: TxType::NonTx,
            target_system_id: "db".to_string(),
        };
        ChangeAttempt::new(
            store,
            AuditEntry::for_change(&change, &context, AuditStatus::Started),
        )
    }

    #[tokio::test]
    async fn test_started_then_applied() {
        let store = Arc::new(InMemoryAuditStore::new());
        let attempt = attempt(store.clone());

        attempt
            .record(AuditStatus::Started, None, AuditWriteMode::Direct)
            .await
            .unwrap();
        let applied = attempt
            .record(AuditStatus::Applied, None, AuditWriteMode::Direct)
            .await
            .unwrap();

        assert_eq!(applied.author, "dev");
        assert_eq!(applied.execution_id, "exec-1");
        let statuses: Vec<_> = store
            .history(&AuditFilter::for_task("create-users"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses, vec![AuditStatus::Started, AuditStatus::Applied]);
    }

    #[tokio::test]
    async fn test_terminal_without_started_is_rejected() {
        let store = Arc::new(InMemoryAuditStore::new());
        let attempt = attempt(store.clone());

        let err = attempt
            .record(AuditStatus::Applied, None, AuditWriteMode::Direct)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_AUDIT_TRANSITION");
        assert!(store.history(&AuditFilter::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_one_terminal_entry_per_attempt() {
        let store = Arc::new(InMemoryAuditStore::new());
        let attempt = attempt(store.clone());

        attempt
            .record(AuditStatus::Started, None, AuditWriteMode::Direct)
            .await
            .unwrap();
        attempt
            .record(AuditStatus::Applied, None, AuditWriteMode::Direct)
            .await
            .unwrap();

        for status in [AuditStatus::Applied, AuditStatus::Failed, AuditStatus::Started] {
            assert!(
                attempt
                    .record(status, None, AuditWriteMode::Direct)
                    .await
                    .is_err()
            );
        }
        assert_eq!(store.history(&AuditFilter::all()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_outcome_follows_failed() {
        let store = Arc::new(InMemoryAuditStore::new());
        let attempt = attempt(store.clone());

        attempt
            .record(AuditStatus::Started, None, AuditWriteMode::Direct)
            .await
            .unwrap();
        let failed = attempt
            .record(
                AuditStatus::Failed,
                Some("boom".to_string()),
                AuditWriteMode::Direct,
            )
            .await
            .unwrap();
        assert_eq!(failed.error_trace.as_deref(), Some("boom"));

        attempt
            .record(AuditStatus::RolledBack, None, AuditWriteMode::Direct)
            .await
            .unwrap();
        assert_eq!(attempt.last_status(), Some(AuditStatus::RolledBack));
        assert!(
            attempt
                .record(AuditStatus::RollbackFailed, None, AuditWriteMode::Direct)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_surfaced() {
        let store = Arc::new(InMemoryAuditStore::new());
        store.fail_appends(true);
        let attempt = attempt(store);

        let err = attempt
            .record(AuditStatus::Started, None, AuditWriteMode::Direct)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "AUDIT_WRITE_ERROR");
        assert_eq!(attempt.last_status(), None);
    }
}

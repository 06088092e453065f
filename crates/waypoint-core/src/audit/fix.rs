// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator-facing audit fix.
//!
//! Resolves a change that halted a run by appending a terminal entry instead
//! of re-executing it. The operator is expected to have checked (and, if
//! needed, repaired) the target system first.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::{AuditEntry, AuditFilter, AuditStatus, AuditStore};
use crate::config::local_hostname;
use crate::error::EngineError;

/// Author recorded on entries appended by an audit fix.
pub const OPERATOR_AUTHOR: &str = "waypoint-operator";

/// Operator's verdict on a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditResolution {
    /// The change's effect is in place; never run it again.
    Applied,
    /// The change's effect is absent; run it again next time.
    RolledBack,
}

impl AuditResolution {
    /// Status appended for this resolution.
    pub fn status(&self) -> AuditStatus {
        match self {
            Self::Applied => AuditStatus::Applied,
            Self::RolledBack => AuditStatus::RolledBack,
        }
    }
}

impl fmt::Display for AuditResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status().as_str())
    }
}

/// Outcome of an audit fix.
#[derive(Debug, Clone, PartialEq)]
pub enum FixResult {
    /// The change's history needs no intervention; nothing was written.
    NoIssueFound,
    /// A resolving entry was appended.
    Applied(AuditEntry),
}

/// Appends resolving entries for changes awaiting manual intervention.
pub struct AuditFix {
    store: Arc<dyn AuditStore>,
    hostname: String,
}

impl AuditFix {
    /// Create a fixer writing to `store`.
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            hostname: local_hostname(),
        }
    }

    /// Resolve `task_id` as `resolution`.
    ///
    /// Only a change whose latest entry is STARTED, FAILED or ROLLBACK_FAILED has
    /// an issue; anything else returns [`FixResult::NoIssueFound`].
    pub async fn fix(
        &self,
        task_id: &str,
        resolution: AuditResolution,
    ) -> Result<FixResult, EngineError> {
        let history = self
            .store
            .history(&AuditFilter::for_task(task_id))
            .await
            .map_err(EngineError::AuditRead)?;

        let Some(latest) = history.last() else {
            return Ok(FixResult::NoIssueFound);
        };
        if matches!(latest.status, AuditStatus::Applied | AuditStatus::RolledBack) {
            return Ok(FixResult::NoIssueFound);
        }

        let entry = AuditEntry {
            execution_id: Uuid::new_v4().to_string(),
            status: resolution.status(),
            author: OPERATOR_AUTHOR.to_string(),
            created_at: Utc::now(),
            execution_millis: 0,
            execution_hostname: self.hostname.clone(),
            error_trace: None,
            ..latest.clone()
        };

        self.store
            .append(&entry)
            .await
            .map_err(|source| EngineError::AuditWrite {
                task_id: task_id.to_string(),
                status: entry.status,
                source,
            })?;

        info!(
            change_id = %task_id,
            previous = %latest.status,
            resolution = %resolution,
            "Audit entry fixed by operator"
        );
        Ok(FixResult::Applied(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TxType;
    use crate::change::RecoveryStrategy;
    use crate::memory::InMemoryAuditStore;

    fn entry(task_id: &str, status: AuditStatus) -> AuditEntry {
        AuditEntry {
            task_id: task_id.to_string(),
            execution_id: "exec-1".to_string(),
            stage_id: "main".to_string(),
            status,
            author: "dev".to_string(),
            class_name: "SeedUsers".to_string(),
            method_name: "apply".to_string(),
            created_at: Utc::now(),
            execution_millis: 12,
            execution_hostname: "node-1".to_string(),
            error_trace: Some("unique violation".to_string()),
            system_change: false,
            tx_type: TxType::NonTx,
            target_system_id: "users-db".to_string(),
            recovery_strategy: RecoveryStrategy::ManualIntervention,
            order: Some("002".to_string()),
            transactional: false,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_fix_failed_change_appends_resolution() {
        let store = Arc::new(InMemoryAuditStore::new());
        store.append(&entry("seed", AuditStatus::Started)).await.unwrap();
        store.append(&entry("seed", AuditStatus::Failed)).await.unwrap();

        let fixer = AuditFix::new(store.clone());
        let result = fixer.fix("seed", AuditResolution::Applied).await.unwrap();

        let FixResult::Applied(fixed) = result else {
            panic!("expected an appended entry");
        };
        assert_eq!(fixed.status, AuditStatus::Applied);
        assert_eq!(fixed.author, OPERATOR_AUTHOR);
        assert_ne!(fixed.execution_id, "exec-1");
        assert!(fixed.error_trace.is_none());
        assert_eq!(fixed.target_system_id, "users-db");
        assert_eq!(fixed.class_name, "SeedUsers");

        let history = store.history(&AuditFilter::for_task("seed")).await.unwrap();
        assert_eq!(history.len(), 3);
        // History is never rewritten.
        assert_eq!(history[1].status, AuditStatus::Failed);
        assert_eq!(history[2], fixed);
    }

    #[tokio::test]
    async fn test_fix_as_rolled_back() {
        let store = Arc::new(InMemoryAuditStore::new());
        store.append(&entry("seed", AuditStatus::Started)).await.unwrap();

        let fixer = AuditFix::new(store.clone());
        let result = fixer.fix("seed", AuditResolution::RolledBack).await.unwrap();

        assert!(matches!(result, FixResult::Applied(ref e) if e.status == AuditStatus::RolledBack));
    }

    #[tokio::test]
    async fn test_no_issue_for_unknown_or_applied_change() {
        let store = Arc::new(InMemoryAuditStore::new());
        store.append(&entry("done", AuditStatus::Started)).await.unwrap();
        store.append(&entry("done", AuditStatus::Applied)).await.unwrap();

        let fixer = AuditFix::new(store.clone());
        assert_eq!(
            fixer.fix("done", AuditResolution::Applied).await.unwrap(),
            FixResult::NoIssueFound
        );
        assert_eq!(
            fixer.fix("missing", AuditResolution::RolledBack).await.unwrap(),
            FixResult::NoIssueFound
        );
        assert_eq!(store.history(&AuditFilter::all()).await.unwrap().len(), 2);
    }
}

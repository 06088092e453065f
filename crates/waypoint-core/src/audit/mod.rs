// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Audit trail: the durable record of what ran, when, and with what outcome.
//!
//! Entries are append-only. Within one execution attempt a change's entries
//! follow this state machine (enforced by [`ChangeAttempt`]):
//!
//! ```text
//!   ∅ ──► STARTED ──► APPLIED
//!             │
//!             └─────► FAILED ──► ROLLED_BACK
//!                        │
//!                        └─────► ROLLBACK_FAILED
//! ```
//!
//! The latest entry of each change drives the next run's decision
//! (see [`RecoveryAction`]).

mod fix;
mod trail;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::change::{Change, RecoveryStrategy};
use crate::target::ResourceIdentity;

pub use fix::{AuditFix, AuditResolution, FixResult, OPERATOR_AUTHOR};
pub use trail::{AuditWriteMode, ChangeAttempt};

/// Audit entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    /// Execution attempt began.
    Started,
    /// Apply succeeded.
    Applied,
    /// Apply failed.
    Failed,
    /// Changes of a failed apply were undone.
    RolledBack,
    /// Undoing a failed apply failed.
    RollbackFailed,
}

impl AuditStatus {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Applied => "APPLIED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::RollbackFailed => "ROLLBACK_FAILED",
        }
    }

    /// Parse the stored representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STARTED" => Some(Self::Started),
            "APPLIED" => Some(Self::Applied),
            "FAILED" => Some(Self::Failed),
            "ROLLED_BACK" => Some(Self::RolledBack),
            "ROLLBACK_FAILED" => Some(Self::RollbackFailed),
            _ => None,
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction classification of a change against its target system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxType {
    /// No backend transaction wraps the change.
    NonTx,
    /// Change and audit writes share one transaction on the same resource.
    TxShared,
    /// Separate resources; the target system keeps an ongoing-task marker.
    TxSeparateWithMarker,
    /// Separate resources and no marker available.
    TxSeparateNoMarker,
}

impl TxType {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NonTx => "NON_TX",
            Self::TxShared => "TX_SHARED",
            Self::TxSeparateWithMarker => "TX_SEPARATE_WITH_MARKER",
            Self::TxSeparateNoMarker => "TX_SEPARATE_NO_MARKER",
        }
    }

    /// Parse the stored representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NON_TX" => Some(Self::NonTx),
            "TX_SHARED" => Some(Self::TxShared),
            "TX_SEPARATE_WITH_MARKER" => Some(Self::TxSeparateWithMarker),
            "TX_SEPARATE_NO_MARKER" => Some(Self::TxSeparateNoMarker),
            _ => None,
        }
    }

    /// Whether the change ran inside a backend transaction.
    pub fn is_transactional(&self) -> bool {
        !matches!(self, Self::NonTx)
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Change id.
    pub task_id: String,
    /// Run that produced the entry.
    pub execution_id: String,
    /// Stage of the change.
    pub stage_id: String,
    /// Status recorded.
    pub status: AuditStatus,
    /// Change author.
    pub author: String,
    /// Source type implementing the change.
    pub class_name: String,
    /// Source operation implementing the change.
    pub method_name: String,
    /// Write time.
    pub created_at: DateTime<Utc>,
    /// Time spent in the attempt when the entry was written.
    pub execution_millis: i64,
    /// Host of the runner.
    pub execution_hostname: String,
    /// Error trace for failure statuses.
    pub error_trace: Option<String>,
    /// Whether the change is an internal system change.
    pub system_change: bool,
    /// Transaction classification the change ran under.
    pub tx_type: TxType,
    /// Target system the change ran against.
    pub target_system_id: String,
    /// Recovery strategy declared by the change.
    pub recovery_strategy: RecoveryStrategy,
    /// Ordering key of the change.
    pub order: Option<String>,
    /// Whether the change declared itself transactional.
    pub transactional: bool,
    /// Free-form metadata supplied by the change descriptor.
    pub metadata: Option<serde_json::Value>,
}

/// Where an entry was produced, shared by every entry of one attempt.
#[derive(Debug, Clone)]
pub struct AuditContext {
    /// Run id.
    pub execution_id: String,
    /// Stage id.
    pub stage_id: String,
    /// Runner host.
    pub hostname: String,
    /// Classification of the change.
    pub tx_type: TxType,
    /// Resolved target system id.
    pub target_system_id: String,
}

impl AuditEntry {
    /// Build an entry for `change` with `status`, stamped now.
    pub fn for_change(change: &Change, context: &AuditContext, status: AuditStatus) -> Self {
        Self {
            task_id: change.id.clone(),
            execution_id: context.execution_id.clone(),
            stage_id: context.stage_id.clone(),
            status,
            author: change.author.clone(),
            class_name: change.class_name.clone(),
            method_name: change.method_name.clone(),
            created_at: Utc::now(),
            execution_millis: 0,
            execution_hostname: context.hostname.clone(),
            error_trace: None,
            system_change: change.system_change,
            tx_type: context.tx_type,
            target_system_id: context.target_system_id.clone(),
            recovery_strategy: change.recovery,
            order: change.order.clone(),
            transactional: change.transactional,
            metadata: change.metadata.clone(),
        }
    }
}

/// Audit store errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AuditStoreError {
    /// The store failed.
    #[error("Audit store error during '{operation}': {details}")]
    Backend {
        /// Store operation.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A stored entry could not be decoded.
    #[error("Corrupted audit entry for '{task_id}': {details}")]
    Corrupted {
        /// Task of the corrupted entry.
        task_id: String,
        /// What could not be decoded.
        details: String,
    },
}

/// Selects audit entries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Only entries of this change.
    pub task_id: Option<String>,
    /// Only entries of this run.
    pub execution_id: Option<String>,
    /// Only entries with this status.
    pub status: Option<AuditStatus>,
}

impl AuditFilter {
    /// Every entry.
    pub fn all() -> Self {
        Self::default()
    }

    /// Entries of one change.
    pub fn for_task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Self::default()
        }
    }

    /// Restrict to one run.
    pub fn with_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    /// Restrict to one status.
    pub fn with_status(mut self, status: AuditStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether `entry` passes the filter.
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.task_id.as_deref().is_none_or(|id| id == entry.task_id)
            && self
                .execution_id
                .as_deref()
                .is_none_or(|id| id == entry.execution_id)
            && self.status.is_none_or(|status| status == entry.status)
    }
}

/// Durable, append-only audit log.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append `entry` durably.
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditStoreError>;

    /// Append `entry` inside the open transaction `session_id` of the store's own
    /// resource, so it commits or rolls back with the change. Stores that share no
    /// resource with a target system append directly.
    async fn append_in_session(
        &self,
        session_id: &str,
        entry: &AuditEntry,
    ) -> Result<(), AuditStoreError> {
        let _ = session_id;
        self.append(entry).await
    }

    /// Entries matching `filter`, in append order.
    async fn history(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditStoreError>;

    /// Identity of the transactional resource backing the store, if any.
    fn resource_identity(&self) -> Option<ResourceIdentity> {
        None
    }
}

/// Decision for a change based on its audit history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Already applied; do nothing.
    Skip,
    /// Run (or re-run) the change.
    Apply,
    /// Halt until an operator resolves the change.
    ManualIntervention,
}

impl RecoveryAction {
    /// Decide what to do with a change from its latest audit status.
    ///
    /// `in_flight_mark` is true when the change's target system still holds an
    /// ongoing-task mark for it; the backend transaction is atomic, so such a
    /// change is re-run instead of escalated.
    pub fn decide(
        latest: Option<AuditStatus>,
        recovery: RecoveryStrategy,
        in_flight_mark: bool,
    ) -> Self {
        let retry_or_halt = || {
            if recovery.is_always_retry() || in_flight_mark {
                Self::Apply
            } else {
                Self::ManualIntervention
            }
        };

        match latest {
            None => Self::Apply,
            Some(AuditStatus::Applied) => Self::Skip,
            Some(AuditStatus::RolledBack) => Self::Apply,
            Some(AuditStatus::Started) | Some(AuditStatus::Failed) => retry_or_halt(),
            Some(AuditStatus::RollbackFailed) => retry_or_halt(),
        }
    }
}

/// Latest audit entry per change.
#[derive(Debug, Clone, Default)]
pub struct AuditSnapshot {
    latest: HashMap<String, AuditEntry>,
}

impl AuditSnapshot {
    /// Build from entries in append order; later entries win.
    pub fn from_history(entries: Vec<AuditEntry>) -> Self {
        let mut latest = HashMap::new();
        for entry in entries {
            latest.insert(entry.task_id.clone(), entry);
        }
        Self { latest }
    }

    /// Read the whole store.
    pub async fn load(store: &dyn AuditStore) -> Result<Self, AuditStoreError> {
        Ok(Self::from_history(store.history(&AuditFilter::all()).await?))
    }

    /// Latest entry of `task_id`.
    pub fn latest(&self, task_id: &str) -> Option<&AuditEntry> {
        self.latest.get(task_id)
    }

    /// Latest status of `task_id`.
    pub fn latest_status(&self, task_id: &str) -> Option<AuditStatus> {
        self.latest(task_id).map(|entry| entry.status)
    }

    /// Number of changes with at least one entry.
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    /// Whether the store had no entries.
    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

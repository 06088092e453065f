// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ongoing-task markers.
//!
//! A marker is a row in the target system itself saying "this task's backend
//! work is in flight". It is written through the change's open session, so it
//! commits or rolls back together with the business effect. A mark that
//! survives a crash is evidence for the next run that the task's transaction
//! committed without a matching terminal audit entry.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionError;

/// Phase a task was in when marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkOperation {
    /// Apply in flight.
    Execution,
    /// Rollback in flight.
    Rollback,
}

impl MarkOperation {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execution => "EXECUTION",
            Self::Rollback => "ROLLBACK",
        }
    }

    /// Parse the stored representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "EXECUTION" => Some(Self::Execution),
            "ROLLBACK" => Some(Self::Rollback),
            _ => None,
        }
    }
}

impl fmt::Display for MarkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OngoingTaskMark {
    /// Change id.
    pub task_id: String,
    /// Phase in flight.
    pub operation: MarkOperation,
}

impl OngoingTaskMark {
    /// Mark for an apply in flight.
    pub fn execution(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            operation: MarkOperation::Execution,
        }
    }

    /// Mark for a rollback in flight.
    pub fn rollback(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            operation: MarkOperation::Rollback,
        }
    }
}

/// Marker errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum MarkerError {
    /// `mark` was called outside an open transaction for the task.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The marker storage failed.
    #[error("Marker store error during '{operation}' for '{task_id}': {details}")]
    Backend {
        /// Marker operation.
        operation: String,
        /// Task involved (empty for list operations).
        task_id: String,
        /// Error details.
        details: String,
    },

    /// A stored mark could not be decoded.
    #[error("Corrupted mark for '{task_id}': unknown operation '{operation}'")]
    Corrupted {
        /// Task of the corrupted row.
        task_id: String,
        /// Stored operation value.
        operation: String,
    },
}

/// Target-system-local store of ongoing-task marks.
#[async_trait]
pub trait TargetSystemMarker: Send + Sync {
    /// Write `mark` inside the open session of `mark.task_id`.
    ///
    /// Fails with [`SessionError::NoActiveSession`] when no transaction is open for the task.
    async fn mark(&self, mark: &OngoingTaskMark) -> Result<(), MarkerError>;

    /// Remove the mark for `task_id`, outside any change transaction. Idempotent.
    async fn clear_mark(&self, task_id: &str) -> Result<(), MarkerError>;

    /// Every mark currently stored.
    async fn list_all(&self) -> Result<Vec<OngoingTaskMark>, MarkerError>;
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Row types shared by the SQLite and PostgreSQL drivers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use waypoint_core::audit::{AuditEntry, AuditStatus, AuditStoreError, TxType};
use waypoint_core::change::RecoveryStrategy;
use waypoint_core::lock::Lease;
use waypoint_core::marker::{MarkOperation, MarkerError, OngoingTaskMark};

/// Epoch microseconds `ttl` after `now`, saturating.
pub(crate) fn expiry_micros(now: DateTime<Utc>, ttl: Duration) -> i64 {
    let ttl = i64::try_from(ttl.as_micros()).unwrap_or(i64::MAX);
    now.timestamp_micros().saturating_add(ttl)
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LeaseRow {
    pub lock_key: String,
    pub owner_id: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Lease {
            key: row.lock_key,
            owner_id: row.owner_id,
            acquired_at: from_micros(row.acquired_at),
            expires_at: from_micros(row.expires_at),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct MarkRow {
    pub task_id: String,
    pub operation: String,
}

impl TryFrom<MarkRow> for OngoingTaskMark {
    type Error = MarkerError;

    fn try_from(row: MarkRow) -> Result<Self, Self::Error> {
        let Some(operation) = MarkOperation::parse(&row.operation) else {
            return Err(MarkerError::Corrupted {
                task_id: row.task_id,
                operation: row.operation,
            });
        };
        Ok(OngoingTaskMark {
            task_id: row.task_id,
            operation,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AuditRow {
    pub task_id: String,
    pub execution_id: String,
    pub stage_id: String,
    pub status: String,
    pub author: String,
    pub class_name: String,
    pub method_name: String,
    pub created_at: DateTime<Utc>,
    pub execution_millis: i64,
    pub execution_hostname: String,
    pub error_trace: Option<String>,
    pub system_change: bool,
    pub tx_type: String,
    pub target_system_id: String,
    pub recovery_strategy: String,
    pub change_order: Option<String>,
    pub transactional: bool,
    pub metadata: Option<String>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = AuditStoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        let corrupted = |details: String| AuditStoreError::Corrupted {
            task_id: row.task_id.clone(),
            details,
        };

        let status = AuditStatus::parse(&row.status)
            .ok_or_else(|| corrupted(format!("unknown status '{}'", row.status)))?;
        let tx_type = TxType::parse(&row.tx_type)
            .ok_or_else(|| corrupted(format!("unknown tx type '{}'", row.tx_type)))?;
        let recovery_strategy = RecoveryStrategy::parse(&row.recovery_strategy).ok_or_else(|| {
            corrupted(format!(
                "unknown recovery strategy '{}'",
                row.recovery_strategy
            ))
        })?;
        let metadata = row
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| corrupted(format!("invalid metadata: {e}")))?;

        Ok(AuditEntry {
            task_id: row.task_id,
            execution_id: row.execution_id,
            stage_id: row.stage_id,
            status,
            author: row.author,
            class_name: row.class_name,
            method_name: row.method_name,
            created_at: row.created_at,
            execution_millis: row.execution_millis,
            execution_hostname: row.execution_hostname,
            error_trace: row.error_trace,
            system_change: row.system_change,
            tx_type,
            target_system_id: row.target_system_id,
            recovery_strategy,
            order: row.change_order,
            transactional: row.transactional,
            metadata,
        })
    }
}

/// Metadata column value.
pub(crate) fn metadata_text(entry: &AuditEntry) -> Option<String> {
    entry.metadata.as_ref().map(|value| value.to_string())
}

pub(crate) const AUDIT_COLUMNS: &str = "task_id, execution_id, stage_id, status, author, \
     class_name, method_name, created_at, execution_millis, execution_hostname, error_trace, \
     system_change, tx_type, target_system_id, recovery_strategy, change_order, transactional, \
     metadata";

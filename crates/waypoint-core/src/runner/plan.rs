// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-change decisions for one run.

use std::collections::HashSet;

use crate::audit::{AuditEntry, AuditSnapshot, AuditStatus, RecoveryAction};
use crate::change::{Change, Pipeline};
use crate::error::{ManualInterventionRequired, RecoveryIssue};

/// One change with the decision taken for it.
#[derive(Debug)]
pub struct PlannedChange<'a> {
    /// The change.
    pub change: &'a Change,
    /// What the run does with it.
    pub action: RecoveryAction,
    /// Latest audit entry when the plan was built.
    pub latest: Option<&'a AuditEntry>,
}

/// Decisions for every change of a stage, in pipeline order.
#[derive(Debug)]
pub struct ExecutionPlan<'a> {
    stage_id: &'a str,
    changes: Vec<PlannedChange<'a>>,
}

impl<'a> ExecutionPlan<'a> {
    /// Decide for each change of `pipeline` from `snapshot`.
    ///
    /// `in_flight` holds the ids of changes with a leftover ongoing-task mark.
    pub fn build(
        pipeline: &'a Pipeline,
        snapshot: &'a AuditSnapshot,
        in_flight: &HashSet<String>,
    ) -> Self {
        let changes = pipeline
            .changes()
            .iter()
            .map(|change| {
                let latest = snapshot.latest(&change.id);
                PlannedChange {
                    change,
                    action: RecoveryAction::decide(
                        latest.map(|entry| entry.status),
                        change.recovery,
                        in_flight.contains(&change.id),
                    ),
                    latest,
                }
            })
            .collect();

        Self {
            stage_id: pipeline.stage_id(),
            changes,
        }
    }

    /// Stage id.
    pub fn stage_id(&self) -> &str {
        self.stage_id
    }

    /// Every change with its decision.
    pub fn changes(&self) -> &[PlannedChange<'a>] {
        &self.changes
    }

    /// Whether anything must run or be resolved.
    pub fn requires_execution(&self) -> bool {
        self.changes
            .iter()
            .any(|planned| planned.action != RecoveryAction::Skip)
    }

    /// Ids of changes that will run.
    pub fn pending_ids(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|planned| planned.action == RecoveryAction::Apply)
            .map(|planned| planned.change.id.as_str())
            .collect()
    }

    /// Fail with every change that needs an operator.
    pub fn validate(&self) -> Result<(), ManualInterventionRequired> {
        let issues: Vec<RecoveryIssue> = self
            .changes
            .iter()
            .filter(|planned| planned.action == RecoveryAction::ManualIntervention)
            .map(|planned| RecoveryIssue {
                task_id: planned.change.id.clone(),
                target_system_id: planned
                    .latest
                    .map(|entry| entry.target_system_id.clone())
                    .or_else(|| planned.change.target_system_id.clone()),
                status: planned
                    .latest
                    .map(|entry| entry.status)
                    .unwrap_or(AuditStatus::Started),
                error_trace: planned.latest.and_then(|entry| entry.error_trace.clone()),
            })
            .collect();

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ManualInterventionRequired {
                stage_id: self.stage_id.to_string(),
                issues,
            })
        }
    }
}

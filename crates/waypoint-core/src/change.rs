// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Change descriptors and pipelines.
//!
//! A [`Change`] is what the external planner hands the engine: identity,
//! ordering, ownership, transactional flag, recovery strategy, target system
//! and the apply/rollback behaviour, either a single operation or a template
//! walked step by step.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::runtime::ExecutionRuntime;
use crate::steps::{StepTemplate, TemplateStep};

/// What to do when a change fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryStrategy {
    /// Halt subsequent runs until an operator resolves the change.
    #[default]
    ManualIntervention,
    /// Re-run the change automatically on the next run.
    AlwaysRetry,
}

impl RecoveryStrategy {
    /// Whether failed attempts are retried without an operator.
    pub fn is_always_retry(&self) -> bool {
        matches!(self, Self::AlwaysRetry)
    }

    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualIntervention => "MANUAL_INTERVENTION",
            Self::AlwaysRetry => "ALWAYS_RETRY",
        }
    }

    /// Parse the stored representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MANUAL_INTERVENTION" => Some(Self::ManualIntervention),
            "ALWAYS_RETRY" => Some(Self::AlwaysRetry),
            _ => None,
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply or rollback logic of a change.
///
/// Handles injected by the target system (a session inside a transaction, a
/// plain handle otherwise) are available through [`ExecutionRuntime::require`].
#[async_trait]
pub trait ChangeOperation: Send + Sync {
    /// Run the operation.
    async fn execute(&self, runtime: &mut ExecutionRuntime) -> anyhow::Result<()>;
}

/// Behaviour attached to a change.
#[derive(Clone)]
pub enum ChangeAction {
    /// One apply operation with an optional rollback.
    Single {
        /// Apply logic.
        apply: Arc<dyn ChangeOperation>,
        /// Undo logic, if the change supports it.
        rollback: Option<Arc<dyn ChangeOperation>>,
    },
    /// A template applied once per step, rolled back in reverse order.
    Steps {
        /// Interprets step payloads.
        template: Arc<dyn StepTemplate>,
        /// Ordered steps.
        steps: Vec<TemplateStep>,
    },
}

impl ChangeAction {
    /// Whether any rollback logic exists.
    pub fn has_rollback(&self) -> bool {
        match self {
            Self::Single { rollback, .. } => rollback.is_some(),
            Self::Steps { steps, .. } => steps.iter().any(|step| step.rollback.is_some()),
        }
    }
}

impl fmt::Debug for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single { rollback, .. } => f
                .debug_struct("Single")
                .field("has_rollback", &rollback.is_some())
                .finish(),
            Self::Steps { steps, .. } => f.debug_struct("Steps").field("steps", steps).finish(),
        }
    }
}

/// One unit of migration work.
#[derive(Debug, Clone)]
pub struct Change {
    /// Unique id within the pipeline; the audit key.
    pub id: String,
    /// Ordering key as declared by the author.
    pub order: Option<String>,
    /// Author.
    pub author: String,
    /// Source type implementing the change, recorded in the audit trail.
    pub class_name: String,
    /// Source operation implementing the change, recorded in the audit trail.
    pub method_name: String,
    /// Whether the change runs inside a backend transaction when its target supports one.
    pub transactional: bool,
    /// Failure policy.
    pub recovery: RecoveryStrategy,
    /// Target system id; unset means the default target system.
    pub target_system_id: Option<String>,
    /// Internal change shipped by the engine rather than by users.
    pub system_change: bool,
    /// Free-form metadata copied into audit entries.
    pub metadata: Option<serde_json::Value>,
    /// Apply/rollback behaviour.
    pub action: ChangeAction,
}

impl Change {
    fn with_action(id: impl Into<String>, action: ChangeAction) -> Self {
        let id = id.into();
        Self {
            class_name: id.clone(),
            id,
            order: None,
            author: "unknown".to_string(),
            method_name: "apply".to_string(),
            transactional: true,
            recovery: RecoveryStrategy::default(),
            target_system_id: None,
            system_change: false,
            metadata: None,
            action,
        }
    }

    /// Change with a single apply operation and optional rollback.
    pub fn single(
        id: impl Into<String>,
        apply: Arc<dyn ChangeOperation>,
        rollback: Option<Arc<dyn ChangeOperation>>,
    ) -> Self {
        Self::with_action(id, ChangeAction::Single { apply, rollback })
    }

    /// Change applied step by step through `template`.
    pub fn steps(
        id: impl Into<String>,
        template: Arc<dyn StepTemplate>,
        steps: Vec<TemplateStep>,
    ) -> Self {
        Self::with_action(id, ChangeAction::Steps { template, steps })
    }

    /// Set the ordering key.
    pub fn with_order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    /// Set the author.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Set the recorded source type and operation names.
    pub fn with_source(mut self, class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self.method_name = method_name.into();
        self
    }

    /// Opt in or out of transaction wrapping.
    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// Set the recovery strategy.
    pub fn with_recovery(mut self, recovery: RecoveryStrategy) -> Self {
        self.recovery = recovery;
        self
    }

    /// Run against the target system `id`.
    pub fn with_target_system(mut self, id: impl Into<String>) -> Self {
        self.target_system_id = Some(id.into());
        self
    }

    /// Flag as an internal system change.
    pub fn as_system_change(mut self) -> Self {
        self.system_change = true;
        self
    }

    /// Attach metadata recorded with every audit entry.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Reject descriptors the engine cannot run.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.id.trim().is_empty() {
            return Err(ConfigurationError::InvalidChange {
                id: self.id.clone(),
                reason: "change id is empty".to_string(),
            });
        }
        if matches!(&self.action, ChangeAction::Steps { steps, .. } if steps.is_empty()) {
            return Err(ConfigurationError::InvalidChange {
                id: self.id.clone(),
                reason: "step list is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Ordered changes of one stage.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stage_id: String,
    changes: Vec<Change>,
}

impl Pipeline {
    /// Validate `changes` and keep them in the given order.
    pub fn new(stage_id: impl Into<String>, changes: Vec<Change>) -> Result<Self, ConfigurationError> {
        let stage_id = stage_id.into();
        let mut seen = HashSet::new();
        for change in &changes {
            change.validate()?;
            if !seen.insert(change.id.as_str()) {
                return Err(ConfigurationError::DuplicateChange {
                    id: change.id.clone(),
                    stage_id,
                });
            }
        }
        Ok(Self { stage_id, changes })
    }

    /// Stage id.
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Changes in execution order.
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// Change by id.
    pub fn get(&self, id: &str) -> Option<&Change> {
        self.changes.iter().find(|change| change.id == id)
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Whether the stage has no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for waypoint-core.
//!
//! Every component owns a narrow error enum (`LockError`, `TransactionError`,
//! `SessionError`, `MarkerError`, `AuditStoreError`). They all funnel into
//! [`EngineError`], which is what the runner surfaces to callers.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::audit::{AuditStatus, AuditStoreError};
use crate::lock::LockError;
use crate::marker::MarkerError;
use crate::session::SessionError;
use crate::transaction::TransactionError;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error returned by the change runner and its collaborators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Lease lock could not be acquired, renewed or was lost.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Backend transaction plumbing failed (commit, rollback, session).
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// The change's own apply or rollback logic failed.
    #[error(transparent)]
    ChangeExecution(#[from] ChangeExecutionError),

    /// Misconfiguration detected before any change ran.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Writing an audit entry failed. Always fatal to the run.
    #[error("Failed to write {status} audit entry for change '{task_id}': {source}")]
    AuditWrite {
        /// Change whose entry could not be written.
        task_id: String,
        /// Status that was being recorded.
        status: AuditStatus,
        /// Underlying store error.
        #[source]
        source: AuditStoreError,
    },

    /// Reading the audit history failed.
    #[error("Failed to read audit history: {0}")]
    AuditRead(#[source] AuditStoreError),

    /// An audit entry would break the per-attempt state machine.
    #[error("Invalid audit transition for change '{task_id}': {from} -> {to}")]
    InvalidAuditTransition {
        /// Change being recorded.
        task_id: String,
        /// Current attempt state.
        from: String,
        /// Requested status.
        to: AuditStatus,
    },

    /// Session bookkeeping failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Ongoing-task marker could not be written, cleared or listed.
    #[error(transparent)]
    Marker(#[from] MarkerError),

    /// One or more changes need an operator before the run may continue.
    #[error(transparent)]
    ManualInterventionRequired(#[from] ManualInterventionRequired),

    /// Change code asked the execution runtime for a dependency that was never injected.
    #[error("No dependency of type '{type_name}' is available in the execution runtime")]
    MissingDependency {
        /// Rust type name of the requested dependency.
        type_name: &'static str,
    },
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Lock(LockError::Held { .. }) => "LOCK_HELD",
            Self::Lock(LockError::Expired { .. }) => "LOCK_EXPIRED",
            Self::Lock(LockError::Store { .. }) => "LOCK_STORE_ERROR",
            Self::Transaction(_) => "TRANSACTION_ERROR",
            Self::ChangeExecution(_) => "CHANGE_EXECUTION_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::AuditWrite { .. } => "AUDIT_WRITE_ERROR",
            Self::AuditRead(_) => "AUDIT_READ_ERROR",
            Self::InvalidAuditTransition { .. } => "INVALID_AUDIT_TRANSITION",
            Self::Session(_) => "SESSION_ERROR",
            Self::Marker(_) => "MARKER_ERROR",
            Self::ManualInterventionRequired(_) => "MANUAL_INTERVENTION_REQUIRED",
            Self::MissingDependency { .. } => "MISSING_DEPENDENCY",
        }
    }

    /// Text persisted as the audit entry's error trace.
    pub fn error_trace(&self) -> String {
        let mut trace = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            let cause_text = cause.to_string();
            if !trace.contains(&cause_text) {
                trace.push_str("\nCaused by: ");
                trace.push_str(&cause_text);
            }
            source = cause.source();
        }
        trace
    }
}

/// Configuration errors. These are raised while wiring the engine, never mid-change.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// Strict resolution of a target system id that was never registered.
    #[error("Target system '{id}' is not registered. Available target systems: [{}]", .available.join(", "))]
    UnknownTargetSystem {
        /// Requested id.
        id: String,
        /// Ids currently registered.
        available: Vec<String>,
    },

    /// Registration attempted after the registry was sealed.
    #[error("Cannot register target system '{id}': registry is sealed")]
    RegistrySealed {
        /// Id of the rejected target system.
        id: String,
    },

    /// Two target systems share an id.
    #[error("Target system '{id}' is already registered")]
    DuplicateTargetSystem {
        /// Duplicated id.
        id: String,
    },

    /// Two changes in a pipeline share an id.
    #[error("Change '{id}' appears more than once in stage '{stage_id}'")]
    DuplicateChange {
        /// Duplicated change id.
        id: String,
        /// Stage containing the duplicates.
        stage_id: String,
    },

    /// A change descriptor is unusable.
    #[error("Invalid change '{id}': {reason}")]
    InvalidChange {
        /// Offending change id.
        id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A builder was finished without a required component.
    #[error("Missing required component: {0}")]
    MissingComponent(&'static str),
}

/// Failure of a change's business logic (apply or rollback action).
///
/// This is a value that flows through the transaction wrapper as a failed step,
/// and the payload of the run's error when a change could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeExecutionError {
    /// Change that failed.
    pub task_id: String,
    /// Failure message, including the cause chain.
    pub message: String,
    /// Stage the change belongs to.
    pub stage_id: Option<String>,
    /// Target system the change ran against.
    pub target_system_id: Option<String>,
    /// Transaction classification the change ran under.
    pub execution_mode: Option<String>,
    /// Time spent before the failure.
    pub duration: Option<Duration>,
}

impl ChangeExecutionError {
    /// Create an error carrying only the task id and message.
    pub fn new(task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            message: message.into(),
            stage_id: None,
            target_system_id: None,
            execution_mode: None,
            duration: None,
        }
    }

    /// Build from an error raised by change code, keeping the whole cause chain.
    pub fn from_error(task_id: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::new(task_id, format!("{err:#}"))
    }

    /// Attach the stage id.
    pub fn with_stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    /// Attach the target system id.
    pub fn with_target_system(mut self, target_system_id: impl Into<String>) -> Self {
        self.target_system_id = Some(target_system_id.into());
        self
    }

    /// Attach the execution mode (transaction classification).
    pub fn with_execution_mode(mut self, mode: impl Into<String>) -> Self {
        self.execution_mode = Some(mode.into());
        self
    }

    /// Attach the elapsed time.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

impl fmt::Display for ChangeExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        write!(f, "\n  Change ID: {}", self.task_id)?;
        if let Some(stage_id) = &self.stage_id {
            write!(f, "\n  Stage: {}", stage_id)?;
        }
        if let Some(mode) = &self.execution_mode {
            write!(f, "\n  Execution Mode: {}", mode)?;
        }
        if let Some(duration) = self.duration {
            write!(f, "\n  Execution Duration: {}", format_duration(duration))?;
        }
        if let Some(target) = &self.target_system_id {
            write!(f, "\n  Target System: {}", target)?;
        }
        Ok(())
    }
}

impl std::error::Error for ChangeExecutionError {}

/// A change that cannot run again until an operator resolves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryIssue {
    /// Change id.
    pub task_id: String,
    /// Target system the change runs against, when recorded.
    pub target_system_id: Option<String>,
    /// Latest recorded status.
    pub status: AuditStatus,
    /// Error trace from the latest audit entry.
    pub error_trace: Option<String>,
}

/// The run halted because changes need manual resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualInterventionRequired {
    /// Stage in which the conflicts were found.
    pub stage_id: String,
    /// Every conflicting change.
    pub issues: Vec<RecoveryIssue>,
}

impl ManualInterventionRequired {
    /// Ids of the conflicting changes.
    pub fn task_ids(&self) -> Vec<&str> {
        self.issues.iter().map(|i| i.task_id.as_str()).collect()
    }
}

impl fmt::Display for ManualInterventionRequired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Manual intervention required for {} change(s) in stage '{}':",
            self.issues.len(),
            self.stage_id
        )?;
        for issue in &self.issues {
            write!(
                f,
                "  - {} [target system: {}, status: {}]",
                issue.task_id,
                issue.target_system_id.as_deref().unwrap_or("default"),
                issue.status
            )?;
            if let Some(trace) = &issue.error_trace {
                write!(f, "\n      error: {}", trace.replace('\n', "\n      "))?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "Verify the state of each target system, then resolve every change with the audit fix \
             (mark it APPLIED or ROLLED_BACK) before running again."
        )
    }
}

impl std::error::Error for ManualInterventionRequired {}

/// Human-friendly duration: `850ms`, `2.5s`, `1.2m`.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1_000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{:.1}s", millis as f64 / 1_000.0)
    } else {
        format!("{:.1}m", millis as f64 / 60_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_codes() {
        let test_cases: Vec<(EngineError, &str)> = vec![
            (
                LockError::Expired {
                    key: "k".to_string(),
                }
                .into(),
                "LOCK_EXPIRED",
            ),
            (
                ConfigurationError::MissingComponent("audit store").into(),
                "CONFIGURATION_ERROR",
            ),
            (
                ChangeExecutionError::new("c1", "boom").into(),
                "CHANGE_EXECUTION_ERROR",
            ),
            (
                EngineError::MissingDependency {
                    type_name: "Pool",
                },
                "MISSING_DEPENDENCY",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code);
        }
    }

    #[test]
    fn test_unknown_target_system_lists_available_ids() {
        let err = ConfigurationError::UnknownTargetSystem {
            id: "mongo".to_string(),
            available: vec!["postgres".to_string(), "audit".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Target system 'mongo' is not registered. Available target systems: [postgres, audit]"
        );
    }

    #[test]
    fn test_change_execution_error_context() {
        let err = ChangeExecutionError::new("add-index", "duplicate column")
            .with_stage("main")
            .with_target_system("orders-db")
            .with_execution_mode("TX_SHARED")
            .with_duration(Duration::from_millis(1500));

        let text = err.to_string();
        assert!(text.starts_with("duplicate column"));
        assert!(text.contains("Change ID: add-index"));
        assert!(text.contains("Stage: main"));
        assert!(text.contains("Execution Mode: TX_SHARED"));
        assert!(text.contains("Execution Duration: 1.5s"));
        assert!(text.contains("Target System: orders-db"));
    }

    #[test]
    fn test_change_execution_error_keeps_cause_chain() {
        let err = anyhow::anyhow!("connection reset").context("insert failed");
        let exec = ChangeExecutionError::from_error("c1", &err);
        assert_eq!(exec.message, "insert failed: connection reset");
    }

    #[test]
    fn test_manual_intervention_report() {
        let err = ManualInterventionRequired {
            stage_id: "main".to_string(),
            issues: vec![RecoveryIssue {
                task_id: "create-users".to_string(),
                target_system_id: Some("users-db".to_string()),
                status: AuditStatus::Failed,
                error_trace: Some("table exists".to_string()),
            }],
        };

        let text = err.to_string();
        assert!(text.contains("1 change(s) in stage 'main'"));
        assert!(text.contains("create-users [target system: users-db, status: FAILED]"));
        assert!(text.contains("error: table exists"));
        assert!(text.contains("audit fix"));
        assert_eq!(err.task_ids(), vec!["create-users"]);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_millis(90_000)), "1.5m");
    }

    #[test]
    fn test_error_trace_includes_sources() {
        let err = EngineError::AuditWrite {
            task_id: "c1".to_string(),
            status: AuditStatus::Applied,
            source: AuditStoreError::Backend {
                operation: "append".to_string(),
                details: "disk full".to_string(),
            },
        };
        let trace = err.error_trace();
        assert!(trace.contains("APPLIED audit entry for change 'c1'"));
        assert!(trace.contains("disk full"));
    }
}

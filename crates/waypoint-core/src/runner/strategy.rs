// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution of one change according to its transaction classification.
//!
//! | Classification            | STARTED            | apply                 | terminal entry           |
//! |---------------------------|--------------------|-----------------------|--------------------------|
//! | `NON_TX`                  | direct             | no transaction        | direct                   |
//! | `TX_SEPARATE_*`           | direct             | backend transaction   | direct, after commit     |
//! | `TX_SHARED`               | inside transaction | backend transaction   | inside transaction       |
//!
//! Separate transactions with a marker also write an EXECUTION mark inside the
//! backend transaction and clear it once the terminal entry is durable.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::audit::{AuditStatus, AuditWriteMode, ChangeAttempt, TxType};
use crate::change::{Change, ChangeAction, ChangeOperation};
use crate::error::{ChangeExecutionError, EngineError};
use crate::marker::{OngoingTaskMark, TargetSystemMarker};
use crate::runtime::ExecutionRuntime;
use crate::steps::StepSequencer;
use crate::target::TargetSystemOps;
use crate::transaction::{StepOutcome, TransactionWrapper, UnitOfWork};

/// How an attempt ended, once its audit entries are durable.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Applied,
    Failed {
        error: ChangeExecutionError,
        rollback: AuditStatus,
    },
}

/// Apply/rollback behaviour of a change for one attempt.
enum Actions<'a> {
    Single {
        task_id: &'a str,
        apply: &'a Arc<dyn ChangeOperation>,
        rollback: Option<&'a Arc<dyn ChangeOperation>>,
    },
    Steps(StepSequencer),
}

impl<'a> Actions<'a> {
    fn new(change: &'a Change) -> Self {
        match &change.action {
            ChangeAction::Single { apply, rollback } => Self::Single {
                task_id: &change.id,
                apply,
                rollback: rollback.as_ref(),
            },
            ChangeAction::Steps { template, steps } => Self::Steps(StepSequencer::new(
                change.id.clone(),
                template.clone(),
                steps.clone(),
            )),
        }
    }

    fn has_rollback(&self) -> bool {
        match self {
            Self::Single { rollback, .. } => rollback.is_some(),
            Self::Steps(sequencer) => sequencer.has_rollback(),
        }
    }

    async fn apply(&self, runtime: &mut ExecutionRuntime) -> Result<(), ChangeExecutionError> {
        match self {
            Self::Single { task_id, apply, .. } => apply
                .execute(runtime)
                .await
                .map_err(|e| ChangeExecutionError::from_error(*task_id, &e)),
            Self::Steps(sequencer) => sequencer.apply(runtime).await,
        }
    }

    async fn rollback(&self, runtime: &mut ExecutionRuntime) -> Result<(), ChangeExecutionError> {
        match self {
            Self::Single {
                task_id,
                rollback: Some(rollback),
                ..
            } => rollback
                .execute(runtime)
                .await
                .map_err(|e| ChangeExecutionError::from_error(*task_id, &e)),
            Self::Single { rollback: None, .. } => Ok(()),
            Self::Steps(sequencer) => sequencer.rollback(runtime).await,
        }
    }
}

/// Apply inside a backend transaction.
struct ApplyWork<'a> {
    actions: &'a Actions<'a>,
    marker: Option<&'a dyn TargetSystemMarker>,
    shared_audit: Option<&'a ChangeAttempt>,
}

#[async_trait]
impl<'a> UnitOfWork for ApplyWork<'a> {
    fn name(&self) -> &str {
        "apply"
    }

    async fn run(&self, runtime: &mut ExecutionRuntime) -> Result<StepOutcome, EngineError> {
        let session_id = runtime.session_id().to_string();
        if let Some(attempt) = self.shared_audit {
            attempt
                .record(AuditStatus::Started, None, AuditWriteMode::InSession(&session_id))
                .await?;
        }
        if let Some(marker) = self.marker {
            marker.mark(&OngoingTaskMark::execution(&session_id)).await?;
        }

        match self.actions.apply(runtime).await {
            Ok(()) => {
                if let Some(attempt) = self.shared_audit {
                    attempt
                        .record(AuditStatus::Applied, None, AuditWriteMode::InSession(&session_id))
                        .await?;
                }
                Ok(StepOutcome::Completed)
            }
            Err(error) => Ok(StepOutcome::Failed(error)),
        }
    }
}

/// Run the rollback action inside a backend transaction.
struct RollbackWork<'a> {
    actions: &'a Actions<'a>,
    marker: Option<&'a dyn TargetSystemMarker>,
}

#[async_trait]
impl<'a> UnitOfWork for RollbackWork<'a> {
    fn name(&self) -> &str {
        "rollback"
    }

    async fn run(&self, runtime: &mut ExecutionRuntime) -> Result<StepOutcome, EngineError> {
        if let Some(marker) = self.marker {
            marker
                .mark(&OngoingTaskMark::rollback(runtime.change_id()))
                .await?;
        }
        match self.actions.rollback(runtime).await {
            Ok(()) => Ok(StepOutcome::Completed),
            Err(error) => Ok(StepOutcome::Failed(error)),
        }
    }
}

/// Executes one change and records its audit trail.
pub(crate) struct ChangeExecutor<'a> {
    pub(crate) change: &'a Change,
    pub(crate) ops: &'a TargetSystemOps,
    pub(crate) tx_type: TxType,
    pub(crate) attempt: ChangeAttempt,
}

impl ChangeExecutor<'_> {
    pub(crate) async fn execute(
        &self,
        runtime: &mut ExecutionRuntime,
    ) -> Result<AttemptOutcome, EngineError> {
        let started = Instant::now();
        self.ops.enhance_runtime(runtime);
        let actions = Actions::new(self.change);

        let outcome = match (self.tx_type, self.ops.transactional()) {
            (TxType::TxShared, Some(target)) => {
                self.execute_shared(runtime, &actions, target.transaction_wrapper())
                    .await?
            }
            (TxType::TxSeparateWithMarker | TxType::TxSeparateNoMarker, Some(target)) => {
                let marker = match self.tx_type {
                    TxType::TxSeparateWithMarker => target.marker(),
                    _ => None,
                };
                self.execute_separate(runtime, &actions, target.transaction_wrapper(), marker)
                    .await?
            }
            _ => self.execute_non_tx(runtime, &actions).await?,
        };

        Ok(match outcome {
            AttemptOutcome::Failed { error, rollback } => AttemptOutcome::Failed {
                error: error
                    .with_stage(runtime.stage_id())
                    .with_target_system(self.ops.id())
                    .with_execution_mode(self.tx_type.as_str())
                    .with_duration(started.elapsed()),
                rollback,
            },
            applied => applied,
        })
    }

    async fn execute_non_tx(
        &self,
        runtime: &mut ExecutionRuntime,
        actions: &Actions<'_>,
    ) -> Result<AttemptOutcome, EngineError> {
        self.record(AuditStatus::Started, None).await?;

        match actions.apply(runtime).await {
            Ok(()) => {
                // The change stays applied; the next run sees only STARTED.
                self.record(AuditStatus::Applied, None).await?;
                Ok(AttemptOutcome::Applied)
            }
            Err(error) => {
                self.record(AuditStatus::Failed, Some(error.message.clone()))
                    .await?;
                if !actions.has_rollback() {
                    return Ok(AttemptOutcome::Failed {
                        error,
                        rollback: AuditStatus::Failed,
                    });
                }
                let rollback = match actions.rollback(runtime).await {
                    Ok(()) => {
                        self.record(AuditStatus::RolledBack, None).await?;
                        AuditStatus::RolledBack
                    }
                    Err(rollback_error) => {
                        self.record(AuditStatus::RollbackFailed, Some(rollback_error.message))
                            .await?;
                        AuditStatus::RollbackFailed
                    }
                };
                Ok(AttemptOutcome::Failed { error, rollback })
            }
        }
    }

    async fn execute_separate(
        &self,
        runtime: &mut ExecutionRuntime,
        actions: &Actions<'_>,
        wrapper: Arc<dyn TransactionWrapper>,
        marker: Option<Arc<dyn TargetSystemMarker>>,
    ) -> Result<AttemptOutcome, EngineError> {
        self.record(AuditStatus::Started, None).await?;

        let work = ApplyWork {
            actions,
            marker: marker.as_deref(),
            shared_audit: None,
        };
        match wrapper.wrap_in_transaction(runtime, &work).await {
            Ok(StepOutcome::Completed) => {
                // On failure the mark stays behind for the next run to reconcile.
                self.record(AuditStatus::Applied, None).await?;
                self.clear_mark(marker.as_deref()).await;
                Ok(AttemptOutcome::Applied)
            }
            Ok(StepOutcome::Failed(error)) => {
                self.record(AuditStatus::Failed, Some(error.message.clone()))
                    .await?;
                self.record(AuditStatus::RolledBack, None).await?;
                Ok(AttemptOutcome::Failed {
                    error,
                    rollback: AuditStatus::RolledBack,
                })
            }
            Err(e @ EngineError::Transaction(_)) => {
                let e = surface_audit_failure(e)?;
                self.record(AuditStatus::Failed, Some(e.error_trace())).await?;
                let rollback = self
                    .finish_failed_transaction(&e, runtime, actions, &wrapper, marker.as_deref())
                    .await?;
                Ok(AttemptOutcome::Failed {
                    error: ChangeExecutionError::new(&self.change.id, e.to_string()),
                    rollback,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_shared(
        &self,
        runtime: &mut ExecutionRuntime,
        actions: &Actions<'_>,
        wrapper: Arc<dyn TransactionWrapper>,
    ) -> Result<AttemptOutcome, EngineError> {
        let work = ApplyWork {
            actions,
            marker: None,
            shared_audit: Some(&self.attempt),
        };
        let failure = match wrapper.wrap_in_transaction(runtime, &work).await {
            Ok(StepOutcome::Completed) => return Ok(AttemptOutcome::Applied),
            Ok(StepOutcome::Failed(error)) => Ok(error),
            Err(e) => match surface_audit_failure(e) {
                Ok(e) => Err(e),
                Err(audit_error) => {
                    self.attempt.discard_uncommitted();
                    error!(
                        change_id = %self.change.id,
                        error = %audit_error,
                        "Audit write failed inside the transaction, stopping the run"
                    );
                    return Err(audit_error);
                }
            },
        };

        // Whatever was written inside the transaction is gone.
        self.attempt.discard_uncommitted();
        self.record(AuditStatus::Started, None).await?;

        match failure {
            Ok(error) => {
                self.record(AuditStatus::Failed, Some(error.message.clone()))
                    .await?;
                self.record(AuditStatus::RolledBack, None).await?;
                Ok(AttemptOutcome::Failed {
                    error,
                    rollback: AuditStatus::RolledBack,
                })
            }
            Err(e) => {
                self.record(AuditStatus::Failed, Some(e.error_trace())).await?;
                let rollback = self
                    .finish_failed_transaction(&e, runtime, actions, &wrapper, None)
                    .await?;
                Ok(AttemptOutcome::Failed {
                    error: ChangeExecutionError::new(&self.change.id, e.to_string()),
                    rollback,
                })
            }
        }
    }

    /// Record how a transaction that ended in an error was undone.
    ///
    /// When the backend could not roll back on its own, the change's rollback
    /// action runs in a fresh transaction.
    async fn finish_failed_transaction(
        &self,
        failure: &EngineError,
        runtime: &mut ExecutionRuntime,
        actions: &Actions<'_>,
        wrapper: &Arc<dyn TransactionWrapper>,
        marker: Option<&dyn TargetSystemMarker>,
    ) -> Result<AuditStatus, EngineError> {
        let rolled_back = matches!(failure, EngineError::Transaction(tx) if tx.rolled_back());
        if rolled_back {
            self.record(AuditStatus::RolledBack, None).await?;
            return Ok(AuditStatus::RolledBack);
        }
        if !actions.has_rollback() {
            self.record(AuditStatus::RollbackFailed, Some(failure.error_trace()))
                .await?;
            return Ok(AuditStatus::RollbackFailed);
        }

        warn!(change_id = %self.change.id, "Backend rollback failed, running the change's rollback");
        let work = RollbackWork { actions, marker };
        match wrapper.wrap_in_transaction(runtime, &work).await {
            Ok(StepOutcome::Completed) => {
                self.record(AuditStatus::RolledBack, None).await?;
                self.clear_mark(marker).await;
                Ok(AuditStatus::RolledBack)
            }
            Ok(StepOutcome::Failed(error)) => {
                self.record(AuditStatus::RollbackFailed, Some(error.message))
                    .await?;
                Ok(AuditStatus::RollbackFailed)
            }
            Err(e) => {
                self.record(AuditStatus::RollbackFailed, Some(e.error_trace()))
                    .await?;
                Ok(AuditStatus::RollbackFailed)
            }
        }
    }

    async fn clear_mark(&self, marker: Option<&dyn TargetSystemMarker>) {
        let Some(marker) = marker else {
            return;
        };
        if let Err(e) = marker.clear_mark(&self.change.id).await {
            warn!(change_id = %self.change.id, error = %e, "Failed to clear ongoing-task mark");
        }
    }

    async fn record(&self, status: AuditStatus, error_trace: Option<String>) -> Result<(), EngineError> {
        self.attempt
            .record(status, error_trace, AuditWriteMode::Direct)
            .await?;
        if status != AuditStatus::Started {
            info!(change_id = %self.change.id, status = %status, "Change attempt recorded");
        }
        Ok(())
    }
}

/// Pull an audit write failure out of a failed transaction.
///
/// Audit failures raised by work inside the transaction end the run once the
/// transaction is rolled back. Any other error comes back unchanged in `Ok`.
fn surface_audit_failure(error: EngineError) -> Result<EngineError, EngineError> {
    match error {
        EngineError::Transaction(mut tx)
            if tx
                .cause
                .as_deref()
                .and_then(|cause| cause.downcast_ref::<EngineError>())
                .is_some_and(|inner| matches!(inner, EngineError::AuditWrite { .. })) =>
        {
            match tx.cause.take().map(|cause| cause.downcast::<EngineError>()) {
                Some(Ok(inner)) => Err(*inner),
                _ => Ok(EngineError::Transaction(tx)),
            }
        }
        other => Ok(other),
    }
}

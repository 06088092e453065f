// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The change runner.
//!
//! Drives one stage end to end: plan from the audit history, take the lease
//! lock, reconcile leftover ongoing-task marks, halt on changes awaiting an
//! operator, then execute pending changes one at a time.

mod plan;
mod strategy;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{
    AuditContext, AuditEntry, AuditFix, AuditSnapshot, AuditStatus, AuditStore, ChangeAttempt,
    RecoveryAction, TxType,
};
use crate::change::{Change, Pipeline};
use crate::config::{EngineConfig, local_hostname};
use crate::error::{ConfigurationError, EngineError, ManualInterventionRequired, RecoveryIssue};
use crate::lock::{LeaseLock, LockStore, RenewalDaemon};
use crate::runtime::ExecutionRuntime;
use crate::target::{TargetSystem, TargetSystemOps, TargetSystemRegistry, TransactionalTargetSystem};

pub use plan::{ExecutionPlan, PlannedChange};
use strategy::{AttemptOutcome, ChangeExecutor};

/// What happened to a change during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    /// Executed and recorded APPLIED.
    Applied,
    /// Already applied by an earlier run.
    Skipped,
    /// Failed and undone; retried by the next run.
    RolledBack,
    /// Failed without a successful rollback; retried by the next run.
    Failed,
}

/// Per-change line of an [`ExecutionSummary`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeReport {
    /// Change id.
    pub change_id: String,
    /// Outcome.
    pub status: ChangeStatus,
    /// Target system the change ran against (executed changes only).
    pub target_system_id: Option<String>,
    /// Classification it ran under (executed changes only).
    pub tx_type: Option<TxType>,
    /// Time spent executing.
    pub duration: Duration,
}

impl ChangeReport {
    fn skipped(change_id: &str) -> Self {
        Self {
            change_id: change_id.to_string(),
            status: ChangeStatus::Skipped,
            target_system_id: None,
            tx_type: None,
            duration: Duration::ZERO,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    /// Id stamped on every audit entry of the run.
    pub execution_id: String,
    /// Stage that ran.
    pub stage_id: String,
    /// One report per change, in pipeline order.
    pub changes: Vec<ChangeReport>,
    /// Wall time of the run.
    pub duration: Duration,
}

impl ExecutionSummary {
    /// Ids of changes applied by this run.
    pub fn applied(&self) -> Vec<&str> {
        self.with_status(ChangeStatus::Applied)
    }

    /// Ids of changes skipped by this run.
    pub fn skipped(&self) -> Vec<&str> {
        self.with_status(ChangeStatus::Skipped)
    }

    /// Ids of always-retry changes that failed during this run.
    pub fn failed(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|report| {
                matches!(report.status, ChangeStatus::Failed | ChangeStatus::RolledBack)
            })
            .map(|report| report.change_id.as_str())
            .collect()
    }

    /// Whether every change is applied.
    pub fn is_success(&self) -> bool {
        self.failed().is_empty()
    }

    fn with_status(&self, status: ChangeStatus) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|report| report.status == status)
            .map(|report| report.change_id.as_str())
            .collect()
    }
}

enum PendingTarget {
    Plain(Arc<dyn TargetSystem>),
    Transactional(Arc<dyn TransactionalTargetSystem>),
}

/// Builder for a [`ChangeRunner`].
pub struct ChangeRunnerBuilder {
    config: EngineConfig,
    lock_store: Option<Arc<dyn LockStore>>,
    audit_store: Option<Arc<dyn AuditStore>>,
    targets: Vec<PendingTarget>,
    default_target: Option<String>,
}

impl std::fmt::Debug for ChangeRunnerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeRunnerBuilder")
            .field("config", &self.config)
            .field("lock_store", &self.lock_store.as_ref().map(|_| "..."))
            .field("audit_store", &self.audit_store.as_ref().map(|_| "..."))
            .field("targets", &self.targets.len())
            .field("default_target", &self.default_target)
            .finish()
    }
}

impl Default for ChangeRunnerBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            lock_store: None,
            audit_store: None,
            targets: Vec::new(),
            default_target: None,
        }
    }
}

impl ChangeRunnerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Store backing the lease lock (required).
    pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.lock_store = Some(store);
        self
    }

    /// Audit store (required).
    pub fn audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    /// Register a non-transactional target system.
    pub fn target_system(mut self, target: Arc<dyn TargetSystem>) -> Self {
        self.targets.push(PendingTarget::Plain(target));
        self
    }

    /// Register a transactional target system.
    pub fn transactional_target_system(mut self, target: Arc<dyn TransactionalTargetSystem>) -> Self {
        self.targets.push(PendingTarget::Transactional(target));
        self
    }

    /// Target system for changes that name none.
    ///
    /// Default: the first transactional target system sharing the audit store's resource.
    pub fn default_target_system(mut self, id: impl Into<String>) -> Self {
        self.default_target = Some(id.into());
        self
    }

    /// Build the runner, sealing its target system registry.
    pub fn build(self) -> Result<ChangeRunner, ConfigurationError> {
        let lock_store = self
            .lock_store
            .ok_or(ConfigurationError::MissingComponent("lock store"))?;
        let audit = self
            .audit_store
            .ok_or(ConfigurationError::MissingComponent("audit store"))?;
        let audit_resource = audit.resource_identity();

        let default_target = self.default_target.or_else(|| {
            let audit_resource = audit_resource.as_ref()?;
            self.targets.iter().find_map(|target| match target {
                PendingTarget::Transactional(target)
                    if target.same_transactional_resource_as(audit_resource) =>
                {
                    Some(target.id().to_string())
                }
                _ => None,
            })
        });

        let mut registry = TargetSystemRegistry::new().with_audit_resource(audit_resource);
        if let Some(id) = default_target {
            registry = registry.with_default_target(id);
        }
        for target in self.targets {
            match target {
                PendingTarget::Plain(target) => registry.register(target)?,
                PendingTarget::Transactional(target) => registry.register_transactional(target)?,
            }
        }
        registry.seal();

        Ok(ChangeRunner {
            config: self.config,
            lock_store,
            audit,
            registry: Arc::new(registry),
            hostname: local_hostname(),
        })
    }
}

/// Applies pipelines under the lease lock.
pub struct ChangeRunner {
    config: EngineConfig,
    lock_store: Arc<dyn LockStore>,
    audit: Arc<dyn AuditStore>,
    registry: Arc<TargetSystemRegistry>,
    hostname: String,
}

impl ChangeRunner {
    /// Create a new builder.
    pub fn builder() -> ChangeRunnerBuilder {
        ChangeRunnerBuilder::new()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sealed target system registry.
    pub fn registry(&self) -> &Arc<TargetSystemRegistry> {
        &self.registry
    }

    /// Audit store.
    pub fn audit_store(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    /// Operator affordance resolving changes that halted a run.
    pub fn audit_fix(&self) -> AuditFix {
        AuditFix::new(self.audit.clone())
    }

    /// Run `changes` as the configured default stage.
    pub async fn run_changes(&self, changes: Vec<Change>) -> Result<ExecutionSummary, EngineError> {
        let pipeline = Pipeline::new(self.config.default_stage.clone(), changes)?;
        self.run(&pipeline).await
    }

    /// Apply every pending change of `pipeline`.
    ///
    /// Returns without taking the lock when nothing is pending. A failing
    /// manual-intervention change stops the run with its audit trail complete;
    /// a failing always-retry change is reported and the run moves on.
    #[instrument(skip(self, pipeline), fields(stage_id = %pipeline.stage_id()))]
    pub async fn run(&self, pipeline: &Pipeline) -> Result<ExecutionSummary, EngineError> {
        let started = Instant::now();
        let execution_id = Uuid::new_v4().to_string();

        let snapshot = self.snapshot().await?;
        let plan = ExecutionPlan::build(pipeline, &snapshot, &HashSet::new());
        if !plan.requires_execution() {
            info!(changes = pipeline.len(), "All changes already applied");
            return Ok(self.summary(execution_id, pipeline, skip_all(pipeline), started));
        }

        let lock = Arc::new(
            LeaseLock::acquire(self.lock_store.clone(), &self.config.lock_options()).await?,
        );
        let daemon = self
            .config
            .lock_renewal
            .then(|| RenewalDaemon::start(lock.clone()));

        let result = self.run_locked(pipeline, &execution_id, &lock).await;

        if let Some(daemon) = daemon {
            daemon.stop().await;
        }
        if let Err(e) = lock.release().await {
            warn!(key = %lock.key(), error = %e, "Failed to release lock");
        }

        let reports = result?;
        let summary = self.summary(execution_id, pipeline, reports, started);
        info!(
            execution_id = %summary.execution_id,
            applied = summary.applied().len(),
            skipped = summary.skipped().len(),
            failed = summary.failed().len(),
            duration_ms = summary.duration.as_millis() as u64,
            "Stage completed"
        );
        Ok(summary)
    }

    async fn snapshot(&self) -> Result<AuditSnapshot, EngineError> {
        AuditSnapshot::load(self.audit.as_ref())
            .await
            .map_err(EngineError::AuditRead)
    }

    fn summary(
        &self,
        execution_id: String,
        pipeline: &Pipeline,
        changes: Vec<ChangeReport>,
        started: Instant,
    ) -> ExecutionSummary {
        ExecutionSummary {
            execution_id,
            stage_id: pipeline.stage_id().to_string(),
            changes,
            duration: started.elapsed(),
        }
    }

    async fn run_locked(
        &self,
        pipeline: &Pipeline,
        execution_id: &str,
        lock: &Arc<LeaseLock>,
    ) -> Result<Vec<ChangeReport>, EngineError> {
        // Another runner may have finished while we waited for the lock.
        let snapshot = self.snapshot().await?;
        let in_flight = self.reconcile_marks(&snapshot).await?;
        let plan = ExecutionPlan::build(pipeline, &snapshot, &in_flight);
        if !plan.requires_execution() {
            info!("Changes were applied by another runner");
            return Ok(skip_all(pipeline));
        }
        plan.validate()?;

        // Resolve every target up front so misconfiguration fails before any change runs.
        let mut resolved = Vec::with_capacity(plan.changes().len());
        for planned in plan.changes() {
            let ops = match planned.action {
                RecoveryAction::Apply => Some(
                    self.registry
                        .resolve(planned.change.target_system_id.as_deref(), true)?,
                ),
                _ => None,
            };
            resolved.push((planned, ops));
        }

        info!(
            execution_id = %execution_id,
            pending = ?plan.pending_ids(),
            "Executing stage"
        );

        let mut reports = Vec::with_capacity(resolved.len());
        for (planned, ops) in resolved {
            let ops = match (planned.action, ops) {
                (RecoveryAction::Apply, Some(ops)) => ops,
                (RecoveryAction::Skip, _) => {
                    reports.push(ChangeReport::skipped(&planned.change.id));
                    continue;
                }
                _ => return Err(halt(plan.stage_id(), planned).into()),
            };
            lock.ensure_valid()?;
            reports.push(
                self.execute_change(planned.change, &ops, pipeline.stage_id(), execution_id, lock)
                    .await?,
            );
        }
        Ok(reports)
    }

    /// Look for marks left behind by crashed runs.
    ///
    /// Marks of changes whose latest entry is APPLIED are stale and cleared;
    /// every other marked change is returned so the plan re-runs it.
    async fn reconcile_marks(
        &self,
        snapshot: &AuditSnapshot,
    ) -> Result<HashSet<String>, EngineError> {
        let mut in_flight = HashSet::new();
        for target in self.registry.transactional_targets() {
            let Some(marker) = target.marker() else {
                continue;
            };
            for mark in marker.list_all().await? {
                match snapshot.latest_status(&mark.task_id) {
                    Some(AuditStatus::Applied) => {
                        info!(
                            change_id = %mark.task_id,
                            target_system_id = %target.id(),
                            operation = %mark.operation,
                            "Clearing stale mark of applied change"
                        );
                        marker.clear_mark(&mark.task_id).await?;
                    }
                    latest => {
                        warn!(
                            change_id = %mark.task_id,
                            target_system_id = %target.id(),
                            operation = %mark.operation,
                            latest = ?latest,
                            "Change left in flight by a previous run, re-running it"
                        );
                        in_flight.insert(mark.task_id);
                    }
                }
            }
        }
        Ok(in_flight)
    }

    #[instrument(skip_all, fields(change_id = %change.id))]
    async fn execute_change(
        &self,
        change: &Change,
        ops: &TargetSystemOps,
        stage_id: &str,
        execution_id: &str,
        lock: &Arc<LeaseLock>,
    ) -> Result<ChangeReport, EngineError> {
        let started = Instant::now();
        let tx_type = ops.classify(change.transactional);
        let context = AuditContext {
            execution_id: execution_id.to_string(),
            stage_id: stage_id.to_string(),
            hostname: self.hostname.clone(),
            tx_type,
            target_system_id: ops.id().to_string(),
        };
        info!(target_system_id = %ops.id(), tx_type = %tx_type, "Executing change");

        let executor = ChangeExecutor {
            change,
            ops,
            tx_type,
            attempt: ChangeAttempt::new(
                self.audit.clone(),
                AuditEntry::for_change(change, &context, AuditStatus::Started),
            ),
        };
        let mut runtime =
            ExecutionRuntime::new(execution_id, stage_id, &change.id).with_lock(lock.clone());

        let (status, duration) = match executor.execute(&mut runtime).await? {
            AttemptOutcome::Applied => {
                info!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Change applied"
                );
                (ChangeStatus::Applied, started.elapsed())
            }
            AttemptOutcome::Failed { error, rollback } if change.recovery.is_always_retry() => {
                warn!(
                    error = %error.message,
                    rollback = %rollback,
                    "Change failed, it will be retried by the next run"
                );
                let status = match rollback {
                    AuditStatus::RolledBack => ChangeStatus::RolledBack,
                    _ => ChangeStatus::Failed,
                };
                (status, error.duration.unwrap_or_else(|| started.elapsed()))
            }
            AttemptOutcome::Failed { error, rollback } => {
                error!(
                    error = %error.message,
                    rollback = %rollback,
                    recovery = %change.recovery,
                    "Change failed, stopping the run"
                );
                return Err(error.into());
            }
        };

        Ok(ChangeReport {
            change_id: change.id.clone(),
            status,
            target_system_id: Some(ops.id().to_string()),
            tx_type: Some(tx_type),
            duration,
        })
    }
}

fn skip_all(pipeline: &Pipeline) -> Vec<ChangeReport> {
    pipeline
        .changes()
        .iter()
        .map(|change| ChangeReport::skipped(&change.id))
        .collect()
}

fn halt(stage_id: &str, planned: &PlannedChange<'_>) -> ManualInterventionRequired {
    ManualInterventionRequired {
        stage_id: stage_id.to_string(),
        issues: vec![RecoveryIssue {
            task_id: planned.change.id.clone(),
            target_system_id: planned.change.target_system_id.clone(),
            status: planned
                .latest
                .map(|entry| entry.status)
                .unwrap_or(AuditStatus::Started),
            error_trace: planned.latest.and_then(|entry| entry.error_trace.clone()),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryAuditStore, InMemoryLockStore, InMemoryTargetSystem};

    #[test]
    fn test_builder_requires_stores() {
        let err = ChangeRunner::builder().build().err().unwrap();
        assert!(matches!(err, ConfigurationError::MissingComponent("lock store")));

        let err = ChangeRunner::builder()
            .lock_store(Arc::new(InMemoryLockStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::MissingComponent("audit store")));
    }

    #[test]
    fn test_default_target_is_the_audit_store_resource() {
        let target = Arc::new(InMemoryTargetSystem::new("main-db", crate::memory::MemoryDatabase::new()));
        let other = Arc::new(InMemoryTargetSystem::new("other-db", crate::memory::MemoryDatabase::new()));
        let audit = Arc::new(InMemoryAuditStore::shared_with(&target));

        let runner = ChangeRunner::builder()
            .lock_store(Arc::new(InMemoryLockStore::new()))
            .audit_store(audit)
            .transactional_target_system(other)
            .transactional_target_system(target)
            .build()
            .unwrap();

        assert_eq!(runner.registry().default_target(), Some("main-db"));
        assert!(runner.registry().is_sealed());
    }

    #[test]
    fn test_duplicate_target_fails_build() {
        let db = crate::memory::MemoryDatabase::new();
        let err = ChangeRunner::builder()
            .lock_store(Arc::new(InMemoryLockStore::new()))
            .audit_store(Arc::new(InMemoryAuditStore::new()))
            .transactional_target_system(Arc::new(InMemoryTargetSystem::new("db", db.clone())))
            .transactional_target_system(Arc::new(InMemoryTargetSystem::new("db", db)))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ConfigurationError::DuplicateTargetSystem { .. }));
    }
}

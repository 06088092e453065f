// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction wrapping for transactional target systems.
//!
//! Two signalling channels are kept apart:
//!
//! - the change's business logic failing is a value: [`StepOutcome::Failed`].
//!   The wrapper rolls back and hands the outcome back untouched.
//! - the plumbing failing (session open, marker write, commit, rollback) is an
//!   error: a [`TransactionError`] carrying duration, isolation level, rollback
//!   outcome and the failing operation.
//!
//! [`SessionTransactionWrapper`] implements the algorithm once on top of a
//! [`TransactionBackend`], so each backend family only supplies session
//! commit/rollback.
//!
//! | `work.run` returns     | wrapper action                  | result                         |
//! |------------------------|---------------------------------|--------------------------------|
//! | `Ok(Completed)`        | lease check, commit             | `Ok(Completed)` / commit error |
//! | `Ok(Failed(_))`        | rollback                        | `Ok(Failed(_))` / rollback err |
//! | `Err(e)`               | rollback, record its outcome    | `TransactionError` wrapping `e`|

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::error::{ChangeExecutionError, EngineError, format_duration};
use crate::runtime::ExecutionRuntime;
use crate::session::SessionManager;

/// Result of running a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Business logic finished.
    Completed,
    /// Business logic reported failure; the transaction must be rolled back.
    Failed(ChangeExecutionError),
}

impl StepOutcome {
    /// Whether this is the failed-step sentinel.
    pub fn is_failed_step(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Work executed inside a transaction.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Operation name reported in transaction errors.
    fn name(&self) -> &str;

    /// Run against `runtime`. Business failures are `Ok(StepOutcome::Failed)`.
    async fn run(&self, runtime: &mut ExecutionRuntime) -> Result<StepOutcome, EngineError>;
}

/// Backend-specific unit-of-work executor.
#[async_trait]
pub trait TransactionWrapper: Send + Sync {
    /// Open a session, inject it into `runtime`, run `work`, then commit or roll back.
    ///
    /// The session is closed on every path.
    async fn wrap_in_transaction(
        &self,
        runtime: &mut ExecutionRuntime,
        work: &dyn UnitOfWork,
    ) -> Result<StepOutcome, EngineError>;
}

/// Lifecycle state of a backend transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Session opened.
    Started,
    /// Work running.
    Active,
    /// Committed.
    Committed,
    /// Failed and not cleanly rolled back.
    Failed,
    /// Rolled back cleanly.
    RolledBack,
    /// Abandoned because the lease expired before commit.
    Timeout,
}

impl TransactionState {
    /// Upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Active => "ACTIVE",
            Self::Committed => "COMMITTED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the rollback attempted after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStatus {
    /// Rolled back cleanly.
    Success,
    /// Rollback itself failed; backend state is uncertain.
    Failed,
    /// No rollback was attempted.
    NotAttempted,
    /// The backend cannot roll back.
    NotSupported,
}

impl RollbackStatus {
    /// Upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::NotAttempted => "NOT_ATTEMPTED",
            Self::NotSupported => "NOT_SUPPORTED",
        }
    }
}

impl fmt::Display for RollbackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of the transaction plumbing itself.
#[derive(Debug)]
pub struct TransactionError {
    /// Operation that failed (`commit`, `rollback`, `begin`, or the unit of work name).
    pub operation: String,
    /// State the transaction ended in.
    pub state: TransactionState,
    /// Outcome of the rollback attempted after the failure.
    pub rollback: RollbackStatus,
    /// Time since the session was opened.
    pub duration: Duration,
    /// Backend isolation level, when known.
    pub isolation_level: Option<String>,
    /// Backend description (driver, database) for diagnostics.
    pub connection_info: String,
    /// Underlying error.
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransactionError {
    /// Whether the backend transaction ended rolled back cleanly.
    pub fn rolled_back(&self) -> bool {
        self.rollback == RollbackStatus::Success
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction failed during '{}' after {} [state: {}, rollback: {}, isolation: {}, connection: {}]",
            self.operation,
            format_duration(self.duration),
            self.state,
            self.rollback,
            self.isolation_level.as_deref().unwrap_or("unknown"),
            self.connection_info
        )?;
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransactionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// Session-level operations a backend provides to [`SessionTransactionWrapper`].
#[async_trait]
pub trait TransactionBackend: Send + Sync {
    /// Backend session handle, injected into the runtime while work runs.
    type Session: Clone + Send + Sync + 'static;

    /// Session registry of this backend.
    fn sessions(&self) -> &SessionManager<Self::Session>;

    /// Commit the session's transaction.
    async fn commit(&self, session: &Self::Session) -> anyhow::Result<()>;

    /// Roll back the session's transaction.
    async fn rollback(&self, session: &Self::Session) -> anyhow::Result<()>;

    /// Isolation level, when the backend knows it.
    fn isolation_level(&self) -> Option<String> {
        None
    }

    /// Short backend description for error reports.
    fn connection_info(&self) -> String;
}

/// [`TransactionWrapper`] driving any [`TransactionBackend`].
pub struct SessionTransactionWrapper<B> {
    backend: Arc<B>,
}

impl<B> SessionTransactionWrapper<B>
where
    B: TransactionBackend,
{
    /// Wrap `backend`.
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn error(
        &self,
        operation: &str,
        state: TransactionState,
        rollback: RollbackStatus,
        started: Instant,
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> EngineError {
        TransactionError {
            operation: operation.to_string(),
            state,
            rollback,
            duration: started.elapsed(),
            isolation_level: self.backend.isolation_level(),
            connection_info: self.backend.connection_info(),
            cause,
        }
        .into()
    }

    async fn try_rollback(&self, session: &B::Session, session_id: &str) -> RollbackStatus {
        match self.backend.rollback(session).await {
            Ok(()) => {
                debug!(session_id = %session_id, "Transaction rolled back");
                RollbackStatus::Success
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Transaction rollback failed");
                RollbackStatus::Failed
            }
        }
    }

    async fn drive(
        &self,
        runtime: &mut ExecutionRuntime,
        work: &dyn UnitOfWork,
        session: &B::Session,
        started: Instant,
    ) -> Result<StepOutcome, EngineError> {
        let session_id = runtime.session_id().to_string();

        match work.run(runtime).await {
            Ok(outcome) if outcome.is_failed_step() => {
                match self.backend.rollback(session).await {
                    Ok(()) => {
                        debug!(session_id = %session_id, "Failed step rolled back");
                        Ok(outcome)
                    }
                    Err(e) => Err(self.error(
                        "rollback",
                        TransactionState::Failed,
                        RollbackStatus::Failed,
                        started,
                        Some(e.into()),
                    )),
                }
            }
            Ok(outcome) => {
                if let Err(lock_error) = runtime.ensure_lease_valid() {
                    warn!(session_id = %session_id, "Lease lost before commit, rolling back");
                    let rollback = self.try_rollback(session, &session_id).await;
                    return Err(self.error(
                        "commit",
                        TransactionState::Timeout,
                        rollback,
                        started,
                        Some(Box::new(lock_error)),
                    ));
                }
                match self.backend.commit(session).await {
                    Ok(()) => {
                        debug!(session_id = %session_id, "Transaction committed");
                        Ok(outcome)
                    }
                    Err(e) => {
                        error!(session_id = %session_id, error = %e, "Transaction commit failed");
                        Err(self.error(
                            "commit",
                            TransactionState::Failed,
                            RollbackStatus::NotAttempted,
                            started,
                            Some(e.into()),
                        ))
                    }
                }
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Unit of work failed, rolling back");
                let rollback = self.try_rollback(session, &session_id).await;
                let state = match rollback {
                    RollbackStatus::Success => TransactionState::RolledBack,
                    _ => TransactionState::Failed,
                };
                Err(self.error(work.name(), state, rollback, started, Some(Box::new(e))))
            }
        }
    }
}

#[async_trait]
impl<B> TransactionWrapper for SessionTransactionWrapper<B>
where
    B: TransactionBackend,
{
    async fn wrap_in_transaction(
        &self,
        runtime: &mut ExecutionRuntime,
        work: &dyn UnitOfWork,
    ) -> Result<StepOutcome, EngineError> {
        let started = Instant::now();
        let session_id = runtime.session_id().to_string();

        let session = match self.backend.sessions().start_session(&session_id).await {
            Ok(session) => session,
            Err(e) => {
                return Err(self.error(
                    "begin",
                    TransactionState::Failed,
                    RollbackStatus::NotAttempted,
                    started,
                    Some(Box::new(e)),
                ));
            }
        };
        let _open = OpenSession {
            sessions: self.backend.sessions(),
            session_id: &session_id,
        };
        runtime.add_dependency(session.clone());

        let result = self.drive(runtime, work, &session, started).await;

        runtime.remove_dependency::<B::Session>();
        result
    }
}

/// Closes the registered session when dropped, including when the caller
/// abandons the transaction future mid-flight.
struct OpenSession<'a, H>
where
    H: Clone + Send + Sync + 'static,
{
    sessions: &'a SessionManager<H>,
    session_id: &'a str,
}

impl<H> Drop for OpenSession<'_, H>
where
    H: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.sessions.close_session(self.session_id);
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waypoint Core - Audited Change Execution Engine
//!
//! This crate applies ordered, idempotent changes ("changes") against one or more
//! target systems. Every attempt is recorded in an append-only audit trail, runs
//! are serialized by a lease lock, and a crashed run is recovered on the next one.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              ChangeRunner                               │
//! │        plan from audit ─► lease lock ─► reconcile marks ─► execute      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!        │                   │                          │
//!        ▼                   ▼                          ▼
//! ┌──────────────┐   ┌───────────────┐   ┌─────────────────────────────────┐
//! │  AuditStore  │   │   LockStore   │   │      TargetSystemRegistry       │
//! │ (history of  │   │ (lease rows,  │   │  non-transactional targets and  │
//! │  attempts)   │   │  renewal)     │   │  transactional targets + marker │
//! └──────────────┘   └───────────────┘   └─────────────────────────────────┘
//! ```
//!
//! # Transaction Classification
//!
//! Each change is classified against its target system before it runs:
//!
//! | Classification            | When                                                  |
//! |---------------------------|-------------------------------------------------------|
//! | `NON_TX`                  | Target is not transactional, or the change opts out   |
//! | `TX_SHARED`               | Target shares the audit store's resource              |
//! | `TX_SEPARATE_WITH_MARKER` | Separate resource, target keeps ongoing-task marks    |
//! | `TX_SEPARATE_NO_MARKER`   | Separate resource without marks                       |
//!
//! # Audit Status State Machine
//!
//! ```text
//!                 ┌─────────┐
//!                 │ STARTED │
//!                 └────┬────┘
//!           ┌──────────┴──────────┐
//!           ▼                     ▼
//!      ┌─────────┐           ┌────────┐
//!      │ APPLIED │           │ FAILED │
//!      └─────────┘           └───┬────┘
//!                        ┌───────┴────────┐
//!                        ▼                ▼
//!                 ┌─────────────┐ ┌─────────────────┐
//!                 │ ROLLED_BACK │ │ ROLLBACK_FAILED │
//!                 └─────────────┘ └─────────────────┘
//! ```
//!
//! On the next run, APPLIED is skipped and ROLLED_BACK is retried. Any other
//! latest status halts the run unless the change is `ALWAYS_RETRY` or a leftover
//! ongoing-task mark proves it never committed.
//!
//! # Configuration
//!
//! [`config::EngineConfig::from_env`] reads:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `WAYPOINT_LOCK_KEY` | No | `waypoint-lock` | Lease lock key |
//! | `WAYPOINT_LOCK_LEASE_MS` | No | `60000` | Lease TTL |
//! | `WAYPOINT_LOCK_ACQUIRE_TIMEOUT_MS` | No | `180000` | Acquire deadline |
//! | `WAYPOINT_LOCK_RETRY_INTERVAL_MS` | No | `1000` | Pause between acquire attempts |
//! | `WAYPOINT_LOCK_RENEWAL` | No | `true` | Keep the lease alive while running |
//! | `WAYPOINT_RUNNER_ID` | No | hostname + suffix | Lock owner identity |
//! | `WAYPOINT_DEFAULT_STAGE` | No | `default` | Stage id for [`runner::ChangeRunner::run_changes`] |
//!
//! # Modules
//!
//! - [`audit`]: Audit entries, store trait, recovery decisions and the operator fix
//! - [`change`]: Change descriptors and pipelines
//! - [`lock`]: Lease lock and renewal daemon
//! - [`memory`]: In-memory backends for embedding and tests
//! - [`runner`]: The change runner
//! - [`target`]: Target systems and their registry

#![deny(missing_docs)]

/// Audit trail: entries, store trait, recovery decisions and operator fixes.
pub mod audit;

/// Change descriptors, recovery strategies and pipelines.
pub mod change;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types shared by every component.
pub mod error;

/// Distributed lease lock and its renewal daemon.
pub mod lock;

/// Ongoing-task marks kept inside transactional target systems.
pub mod marker;

/// In-memory lock store, audit store and target system.
pub mod memory;

/// Change runner: planning, locking, recovery and execution.
pub mod runner;

/// Per-change execution context and dependency injection.
pub mod runtime;

/// Session bookkeeping for transactional backends.
pub mod session;

/// Steppable changes and their rollback sequencing.
pub mod steps;

/// Target system traits and registry.
pub mod target;

/// Transaction wrapping around units of work.
pub mod transaction;

pub use audit::{AuditEntry, AuditFix, AuditResolution, AuditStatus, AuditStore, TxType};
pub use change::{Change, ChangeOperation, Pipeline, RecoveryStrategy};
pub use config::EngineConfig;
pub use error::{ConfigurationError, EngineError, Result};
pub use runner::{ChangeReport, ChangeRunner, ChangeRunnerBuilder, ChangeStatus, ExecutionSummary};
pub use runtime::ExecutionRuntime;
pub use steps::{StepTemplate, TemplateStep};
pub use target::{TargetSystem, TransactionalTargetSystem};

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Waypoint SQL - sqlx drivers for the change execution engine
//!
//! Implements the `waypoint-core` backend contracts on SQLite and PostgreSQL:
//!
//! | Contract | SQLite | PostgreSQL |
//! |----------|--------|------------|
//! | `LockStore` | [`sqlite::SqliteLockStore`] | [`postgres::PgLockStore`] |
//! | `AuditStore` | [`sqlite::SqliteAuditStore`] | [`postgres::PgAuditStore`] |
//! | `TransactionalTargetSystem` | [`sqlite::SqliteTargetSystem`] | [`postgres::PgTargetSystem`] |
//!
//! Each target system opens one database transaction per executing change and
//! injects it into the execution runtime as a [`SqlSession`]. An audit store
//! built with `shared_with(&target)` writes its entries inside that transaction,
//! so the change runs `TX_SHARED`.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `waypoint_locks` | Lease lock rows, expiry in epoch microseconds |
//! | `waypoint_audit` | Append-only audit entries |
//! | `waypoint_ongoing_tasks` | Ongoing-task marks |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `WAYPOINT_DATABASE_URL` | Yes | - | `sqlite:` or `postgres://` connection string |
//! | `WAYPOINT_MAX_CONNECTIONS` | No | `5` | Pool size |

#![deny(missing_docs)]

/// Connection settings loaded from environment variables.
pub mod config;

/// Error types for the SQL drivers.
pub mod error;

/// Embedded schema migrations.
pub mod migrations;

/// PostgreSQL lock store, audit store and target system.
pub mod postgres;

/// SQLite lock store, audit store and target system.
pub mod sqlite;

mod rows;
mod session;

pub use config::SqlConfig;
pub use error::SqlError;
pub use session::SqlSession;

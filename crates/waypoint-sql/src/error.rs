// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for waypoint-sql.
//!
//! Driver failures surface through the narrow core error of the contract being
//! implemented (`LockError::Store`, `AuditStoreError::Backend`,
//! `MarkerError::Backend`); [`SqlError`] covers setup and session handling.

use sqlx::migrate::MigrateError;
use thiserror::Error;
use waypoint_core::audit::AuditStoreError;
use waypoint_core::config::ConfigError;
use waypoint_core::lock::LockError;
use waypoint_core::marker::MarkerError;

/// Result type using SqlError
pub type Result<T> = std::result::Result<T, SqlError>;

/// SQL driver errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SqlError {
    /// The database rejected a statement or the connection failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying the embedded migrations failed.
    #[error("Failed to run migrations: {0}")]
    Migration(#[from] MigrateError),

    /// Connection settings are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The directory of a SQLite database file could not be created.
    #[error("Failed to create directory {path}: {source}")]
    Io {
        /// Directory being created.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The session's transaction was already committed or rolled back.
    #[error("Session '{session_id}' has no open transaction")]
    NoTransaction {
        /// Session id.
        session_id: String,
    },
}

impl SqlError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::NoTransaction { .. } => "NO_TRANSACTION",
        }
    }
}

pub(crate) fn lock_store(operation: &'static str) -> impl FnOnce(sqlx::Error) -> LockError {
    move |e| LockError::Store {
        operation: operation.to_string(),
        details: e.to_string(),
    }
}

pub(crate) fn audit_store(operation: &'static str) -> impl FnOnce(SqlError) -> AuditStoreError {
    move |e| AuditStoreError::Backend {
        operation: operation.to_string(),
        details: e.to_string(),
    }
}

pub(crate) fn marker_store(
    operation: &'static str,
    task_id: &str,
) -> impl FnOnce(SqlError) -> MarkerError {
    let task_id = task_id.to_string();
    move |e| MarkerError::Backend {
        operation: operation.to_string(),
        task_id,
        details: e.to_string(),
    }
}

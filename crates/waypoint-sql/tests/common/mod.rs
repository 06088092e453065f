// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for waypoint-sql tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use waypoint_core::{ChangeOperation, EngineConfig, ExecutionRuntime};
use waypoint_sql::sqlite::{self, SqliteSession};

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast lock settings so tests never wait long on a held lock.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_lease_ttl(Duration::from_secs(30))
        .with_lock_acquire_timeout(Duration::from_millis(200))
        .with_lock_retry_interval(Duration::from_millis(20))
}

/// Temporary directory holding the test databases.
pub struct TestDir {
    dir: TempDir,
}

impl TestDir {
    pub fn new() -> Self {
        init_tracing();
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    /// Migrated database file `name` inside the directory.
    pub async fn open(&self, name: &str) -> SqlitePool {
        sqlite::from_path(self.dir.path().join(name))
            .await
            .expect("Failed to open SQLite database")
    }
}

/// Runs SQL statements in the change's transaction, or on the pool when the
/// change runs without one. Fails after the statements when asked to.
pub struct SqlOp {
    statements: Vec<String>,
    fail_with: Option<String>,
}

impl SqlOp {
    pub fn new(statements: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            statements: statements.iter().map(|s| s.to_string()).collect(),
            fail_with: None,
        })
    }

    pub fn failing(statements: &[&str], reason: &str) -> Arc<Self> {
        Arc::new(Self {
            statements: statements.iter().map(|s| s.to_string()).collect(),
            fail_with: Some(reason.to_string()),
        })
    }
}

#[async_trait]
impl ChangeOperation for SqlOp {
    async fn execute(&self, runtime: &mut ExecutionRuntime) -> anyhow::Result<()> {
        if let Some(session) = runtime.dependency::<SqliteSession>() {
            let mut tx = session.transaction().await?;
            for statement in &self.statements {
                sqlx::query(statement).execute(&mut **tx).await?;
            }
        } else {
            let pool = runtime.require::<SqlitePool>()?;
            for statement in &self.statements {
                sqlx::query(statement).execute(&*pool).await?;
            }
        }

        if let Some(reason) = &self.fail_with {
            anyhow::bail!("{reason}");
        }
        Ok(())
    }
}

/// Rows in `table`.
pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .expect("count query failed")
}

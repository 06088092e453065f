// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed lock store, audit store and target system.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool};
use tracing::{debug, info};

use waypoint_core::audit::{AuditEntry, AuditFilter, AuditStore, AuditStoreError};
use waypoint_core::lock::{Lease, LockError, LockStore};
use waypoint_core::marker::{MarkerError, OngoingTaskMark, TargetSystemMarker};
use waypoint_core::runtime::ExecutionRuntime;
use waypoint_core::session::{SessionError, SessionManager, SessionSupplier};
use waypoint_core::target::{ResourceIdentity, TargetSystem, TransactionalTargetSystem};
use waypoint_core::transaction::{
    SessionTransactionWrapper, TransactionBackend, TransactionWrapper,
};

use crate::config::SqlConfig;
use crate::error::{SqlError, audit_store, lock_store, marker_store};
use crate::migrations;
use crate::rows::{AUDIT_COLUMNS, AuditRow, LeaseRow, MarkRow, expiry_micros, metadata_text};
use crate::session::SqlSession;

/// Open transaction on a SQLite target system.
pub type SqliteSession = SqlSession<Sqlite>;

/// Connect to `config.database_url` and run migrations.
pub async fn connect(config: &SqlConfig) -> Result<SqlitePool, SqlError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    migrations::run_sqlite(&pool).await?;
    Ok(pool)
}

/// Open (creating if needed) the database file at `path` and run migrations.
///
/// Creates parent directories when they do not exist.
pub async fn from_path(path: impl AsRef<Path>) -> Result<SqlitePool, SqlError> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| SqlError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }

    let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
    connect(&SqlConfig::new(url)).await
}

/// Identity of the database file behind `pool`.
fn identity(pool: &SqlitePool) -> ResourceIdentity {
    ResourceIdentity::new(format!(
        "sqlite:{}",
        pool.connect_options().get_filename().display()
    ))
}

/// [`LockStore`] on the `waypoint_locks` table.
#[derive(Clone)]
pub struct SqliteLockStore {
    pool: SqlitePool,
}

impl SqliteLockStore {
    /// Create a lock store from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn upsert(&self, key: &str, owner_id: &str, ttl: Duration) -> Result<Lease, LockError> {
        let now = Utc::now();
        let taken = sqlx::query_as::<_, LeaseRow>(
            r#"
            INSERT INTO waypoint_locks (lock_key, owner_id, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (lock_key) DO UPDATE SET
                acquired_at = CASE
                    WHEN waypoint_locks.owner_id = excluded.owner_id
                         AND waypoint_locks.expires_at > excluded.acquired_at
                    THEN waypoint_locks.acquired_at
                    ELSE excluded.acquired_at
                END,
                owner_id = excluded.owner_id,
                expires_at = excluded.expires_at
            WHERE waypoint_locks.owner_id = excluded.owner_id
               OR waypoint_locks.expires_at <= excluded.acquired_at
            RETURNING lock_key, owner_id, acquired_at, expires_at
            "#,
        )
        .bind(key)
        .bind(owner_id)
        .bind(now.timestamp_micros())
        .bind(expiry_micros(now, ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(lock_store("upsert"))?;

        if let Some(row) = taken {
            return Ok(row.into());
        }

        match self.get(key).await? {
            Some(current) => Err(LockError::Held {
                key: current.key,
                owner_id: current.owner_id,
                expires_at: current.expires_at,
            }),
            None => Err(LockError::Store {
                operation: "upsert".to_string(),
                details: format!("lock row '{key}' vanished during acquisition"),
            }),
        }
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            UPDATE waypoint_locks
            SET expires_at = MAX(expires_at, ?1)
            WHERE lock_key = ?2 AND owner_id = ?3 AND expires_at > ?4
            RETURNING lock_key, owner_id, acquired_at, expires_at
            "#,
        )
        .bind(expiry_micros(now, ttl))
        .bind(&lease.key)
        .bind(&lease.owner_id)
        .bind(now.timestamp_micros())
        .fetch_optional(&self.pool)
        .await
        .map_err(lock_store("extend"))?;

        Ok(row.map(Lease::from))
    }

    async fn get(&self, key: &str) -> Result<Option<Lease>, LockError> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT lock_key, owner_id, acquired_at, expires_at
            FROM waypoint_locks
            WHERE lock_key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(lock_store("get"))?;

        Ok(row.map(Lease::from))
    }

    async fn release(&self, key: &str, owner_id: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM waypoint_locks WHERE lock_key = ? AND owner_id = ?")
            .bind(key)
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(lock_store("release"))?;
        Ok(())
    }
}

struct SqliteSessionSupplier {
    pool: SqlitePool,
}

#[async_trait]
impl SessionSupplier<SqliteSession> for SqliteSessionSupplier {
    async fn open(&self, session_id: &str) -> Result<SqliteSession, SessionError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SessionError::OpenFailed {
                session_id: session_id.to_string(),
                details: e.to_string(),
            })?;
        debug!(session_id = %session_id, "SQLite transaction started");
        Ok(SqliteSession::new(session_id, tx))
    }
}

struct SqliteBackend {
    pool: SqlitePool,
    identity: ResourceIdentity,
    sessions: SessionManager<SqliteSession>,
}

#[async_trait]
impl TransactionBackend for SqliteBackend {
    type Session = SqliteSession;

    fn sessions(&self) -> &SessionManager<SqliteSession> {
        &self.sessions
    }

    async fn commit(&self, session: &SqliteSession) -> anyhow::Result<()> {
        session.finish().await?.commit().await?;
        Ok(())
    }

    async fn rollback(&self, session: &SqliteSession) -> anyhow::Result<()> {
        session.finish().await?.rollback().await?;
        Ok(())
    }

    fn isolation_level(&self) -> Option<String> {
        Some("SERIALIZABLE".to_string())
    }

    fn connection_info(&self) -> String {
        self.identity.to_string()
    }
}

async fn insert_entry<'e, E>(executor: E, entry: &AuditEntry) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(&format!(
        "INSERT INTO waypoint_audit ({AUDIT_COLUMNS}) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&entry.task_id)
    .bind(&entry.execution_id)
    .bind(&entry.stage_id)
    .bind(entry.status.as_str())
    .bind(&entry.author)
    .bind(&entry.class_name)
    .bind(&entry.method_name)
    .bind(entry.created_at)
    .bind(entry.execution_millis)
    .bind(&entry.execution_hostname)
    .bind(&entry.error_trace)
    .bind(entry.system_change)
    .bind(entry.tx_type.as_str())
    .bind(&entry.target_system_id)
    .bind(entry.recovery_strategy.as_str())
    .bind(&entry.order)
    .bind(entry.transactional)
    .bind(metadata_text(entry))
    .execute(executor)
    .await?;
    Ok(())
}

/// [`AuditStore`] on the `waypoint_audit` table.
///
/// Built with [`shared_with`](Self::shared_with), in-session entries join the
/// target system's open transaction and the store reports the target's
/// resource, so changes on that target run `TX_SHARED`.
#[derive(Clone)]
pub struct SqliteAuditStore {
    pool: SqlitePool,
    backend: Option<Arc<SqliteBackend>>,
}

impl SqliteAuditStore {
    /// Standalone store; every entry is appended in its own statement.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            backend: None,
        }
    }

    /// Store on `target`'s database, sharing its transactions.
    pub fn shared_with(target: &SqliteTargetSystem) -> Self {
        Self {
            pool: target.backend.pool.clone(),
            backend: Some(target.backend.clone()),
        }
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AuditStoreError> {
        insert_entry(&self.pool, entry)
            .await
            .map_err(|e| audit_store("append")(e.into()))
    }

    async fn append_in_session(
        &self,
        session_id: &str,
        entry: &AuditEntry,
    ) -> Result<(), AuditStoreError> {
        let Some(backend) = &self.backend else {
            return self.append(entry).await;
        };
        let session = backend
            .sessions
            .get_session_or_throw(session_id)
            .map_err(|e| AuditStoreError::Backend {
                operation: "append_in_session".to_string(),
                details: e.to_string(),
            })?;
        let mut tx = session
            .transaction()
            .await
            .map_err(audit_store("append_in_session"))?;
        insert_entry(&mut **tx, entry)
            .await
            .map_err(|e| audit_store("append_in_session")(e.into()))
    }

    async fn history(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditStoreError> {
        let rows = sqlx::query_as::<_, AuditRow>(&format!(
            r#"
            SELECT {AUDIT_COLUMNS}
            FROM waypoint_audit
            WHERE (?1 IS NULL OR task_id = ?1)
              AND (?2 IS NULL OR execution_id = ?2)
              AND (?3 IS NULL OR status = ?3)
            ORDER BY id ASC
            "#
        ))
        .bind(filter.task_id.as_deref())
        .bind(filter.execution_id.as_deref())
        .bind(filter.status.map(|status| status.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| audit_store("history")(e.into()))?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    fn resource_identity(&self) -> Option<ResourceIdentity> {
        self.backend.as_ref().map(|backend| backend.identity.clone())
    }
}

struct SqliteMarker {
    backend: Arc<SqliteBackend>,
}

#[async_trait]
impl TargetSystemMarker for SqliteMarker {
    async fn mark(&self, mark: &OngoingTaskMark) -> Result<(), MarkerError> {
        let session = self.backend.sessions.get_session_or_throw(&mark.task_id)?;
        let mut tx = session
            .transaction()
            .await
            .map_err(marker_store("mark", &mark.task_id))?;
        sqlx::query(
            r#"
            INSERT INTO waypoint_ongoing_tasks (task_id, operation)
            VALUES (?, ?)
            ON CONFLICT (task_id) DO UPDATE SET operation = excluded.operation
            "#,
        )
        .bind(&mark.task_id)
        .bind(mark.operation.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| marker_store("mark", &mark.task_id)(e.into()))?;
        Ok(())
    }

    async fn clear_mark(&self, task_id: &str) -> Result<(), MarkerError> {
        sqlx::query("DELETE FROM waypoint_ongoing_tasks WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.backend.pool)
            .await
            .map_err(|e| marker_store("clear_mark", task_id)(e.into()))?;
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<OngoingTaskMark>, MarkerError> {
        let rows = sqlx::query_as::<_, MarkRow>(
            "SELECT task_id, operation FROM waypoint_ongoing_tasks ORDER BY task_id",
        )
        .fetch_all(&self.backend.pool)
        .await
        .map_err(|e| marker_store("list_all", "")(e.into()))?;

        rows.into_iter().map(OngoingTaskMark::try_from).collect()
    }
}

/// Transactional target system on a SQLite database.
///
/// Transactional changes get a [`SqliteSession`] in their runtime; the
/// non-transactional ones get the [`SqlitePool`].
pub struct SqliteTargetSystem {
    id: String,
    backend: Arc<SqliteBackend>,
    wrapper: Arc<SessionTransactionWrapper<SqliteBackend>>,
    marker: Option<Arc<SqliteMarker>>,
}

impl SqliteTargetSystem {
    /// Target system `id` on `pool`, keeping ongoing-task marks.
    pub fn new(id: impl Into<String>, pool: SqlitePool) -> Self {
        let backend = Arc::new(SqliteBackend {
            identity: identity(&pool),
            sessions: SessionManager::new(Arc::new(SqliteSessionSupplier { pool: pool.clone() })),
            pool,
        });
        let id = id.into();
        info!(target_system_id = %id, resource = %backend.identity, "SQLite target system created");
        Self {
            id,
            wrapper: Arc::new(SessionTransactionWrapper::new(backend.clone())),
            marker: Some(Arc::new(SqliteMarker {
                backend: backend.clone(),
            })),
            backend,
        }
    }

    /// Drop the ongoing-task marker.
    pub fn without_marker(mut self) -> Self {
        self.marker = None;
        self
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.backend.pool
    }
}

impl TargetSystem for SqliteTargetSystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn enhance_runtime(&self, runtime: &mut ExecutionRuntime) {
        runtime.add_dependency(self.backend.pool.clone());
    }
}

impl TransactionalTargetSystem for SqliteTargetSystem {
    fn transaction_wrapper(&self) -> Arc<dyn TransactionWrapper> {
        self.wrapper.clone()
    }

    fn marker(&self) -> Option<Arc<dyn TargetSystemMarker>> {
        self.marker
            .clone()
            .map(|marker| marker as Arc<dyn TargetSystemMarker>)
    }

    fn resource_identity(&self) -> ResourceIdentity {
        self.backend.identity.clone()
    }

    fn same_transactional_resource_as(&self, other: &ResourceIdentity) -> bool {
        &self.backend.identity == other
    }
}

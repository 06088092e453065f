// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database transaction handed to change code.

use std::sync::Arc;

use sqlx::{Database, Transaction};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::SqlError;

/// One open database transaction, shared by the change and the engine.
///
/// Change code borrows the transaction with [`transaction`](Self::transaction)
/// and runs statements on it:
///
/// ```ignore
/// let session = runtime.require::<SqliteSession>()?;
/// let mut tx = session.transaction().await?;
/// sqlx::query("CREATE TABLE customers (id INTEGER PRIMARY KEY)")
///     .execute(&mut **tx)
///     .await?;
/// ```
///
/// The engine commits or rolls it back; change code never does.
pub struct SqlSession<DB: Database> {
    id: Arc<str>,
    tx: Arc<Mutex<Option<Transaction<'static, DB>>>>,
}

impl<DB: Database> Clone for SqlSession<DB> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<DB: Database> std::fmt::Debug for SqlSession<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlSession").field("id", &self.id).finish()
    }
}

impl<DB: Database> SqlSession<DB> {
    pub(crate) fn new(id: &str, tx: Transaction<'static, DB>) -> Self {
        Self {
            id: Arc::from(id),
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Session id (the executing change's id).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Borrow the open transaction.
    ///
    /// Fails once the engine has committed or rolled it back.
    pub async fn transaction(
        &self,
    ) -> Result<MappedMutexGuard<'_, Transaction<'static, DB>>, SqlError> {
        MutexGuard::try_map(self.tx.lock().await, Option::as_mut).map_err(|_| {
            SqlError::NoTransaction {
                session_id: self.id.to_string(),
            }
        })
    }

    /// Take the transaction out to finish it.
    pub(crate) async fn finish(&self) -> Result<Transaction<'static, DB>, SqlError> {
        self.tx
            .lock()
            .await
            .take()
            .ok_or_else(|| SqlError::NoTransaction {
                session_id: self.id.to_string(),
            })
    }
}

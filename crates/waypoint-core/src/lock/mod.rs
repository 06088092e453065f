// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lease lock guaranteeing a single active runner.
//!
//! A lease is a named, time-boxed ownership token kept in a shared [`LockStore`].
//! [`LeaseLock`] is the holder-side view: it knows its key and owner, keeps the
//! current expiry in an atomic, and is what the [`RenewalDaemon`] refreshes.
//!
//! ```text
//!   acquire ──► held ──extend──► held (expires_at moves forward)
//!                │                 │
//!                │ release         │ extend refused / ttl elapsed
//!                ▼                 ▼
//!            released           expired ──► work must stop
//! ```

mod renewal;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use renewal::RenewalDaemon;

/// A time-boxed ownership token for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Lock name.
    pub key: String,
    /// Runner that owns the lease.
    pub owner_id: String,
    /// When the current owner first took the lock.
    pub acquired_at: DateTime<Utc>,
    /// When the lease lapses unless extended.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease has lapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry at `now` (zero once expired).
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Lock errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum LockError {
    /// Another runner holds a live lease on the key.
    #[error("Lock '{key}' is held by '{owner_id}' until {expires_at}")]
    Held {
        /// Lock name.
        key: String,
        /// Current owner.
        owner_id: String,
        /// Expiry of the current owner's lease.
        expires_at: DateTime<Utc>,
    },

    /// The lease lapsed or was taken over. Terminal: work must stop.
    #[error("Lease on lock '{key}' expired or was taken over by another runner")]
    Expired {
        /// Lock name.
        key: String,
    },

    /// The lock store failed. Transient: the caller may retry.
    #[error("Lock store error during '{operation}': {details}")]
    Store {
        /// Store operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl LockError {
    /// Terminal errors mean the lease is gone and in-flight work must be abandoned.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }
}

/// Shared storage for lease records.
///
/// Implementations must make each call atomic with respect to other runners.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take the lock for `owner_id` if it is free, already owned by `owner_id`, or expired.
    ///
    /// Returns [`LockError::Held`] when another owner holds a live lease.
    async fn upsert(&self, key: &str, owner_id: &str, ttl: Duration) -> Result<Lease, LockError>;

    /// Push the expiry of a live lease owned by `lease.owner_id` to `now + ttl`.
    ///
    /// Returns `None` when the lease is gone (expired, released or taken over).
    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LockError>;

    /// Current lease on `key`, expired or not.
    async fn get(&self, key: &str) -> Result<Option<Lease>, LockError>;

    /// Remove the lease if `owner_id` still owns it. Releasing a lease you do not own is a no-op.
    async fn release(&self, key: &str, owner_id: &str) -> Result<(), LockError>;
}

/// Parameters for acquiring a [`LeaseLock`].
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lock name.
    pub key: String,
    /// Runner identity.
    pub owner_id: String,
    /// Lease time-to-live.
    pub ttl: Duration,
    /// Stop retrying after this long.
    pub acquire_timeout: Duration,
    /// Pause between attempts.
    pub retry_interval: Duration,
}

/// A lease held by this runner.
pub struct LeaseLock {
    store: Arc<dyn LockStore>,
    key: String,
    owner_id: String,
    ttl: Duration,
    acquired_at: DateTime<Utc>,
    expires_at_micros: AtomicI64,
}

impl std::fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseLock")
            .field("key", &self.key)
            .field("owner_id", &self.owner_id)
            .field("ttl", &self.ttl)
            .field("expires_at", &self.expires_at())
            .finish()
    }
}

impl LeaseLock {
    /// Single acquisition attempt.
    pub async fn try_acquire(
        store: Arc<dyn LockStore>,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Self, LockError> {
        let lease = store.upsert(key, owner_id, ttl).await?;
        info!(
            key = %lease.key,
            owner_id = %lease.owner_id,
            expires_at = %lease.expires_at,
            "Lock acquired"
        );
        Ok(Self::from_lease(store, lease, ttl))
    }

    /// Acquire the lock, retrying until `options.acquire_timeout` elapses.
    ///
    /// Store failures are retried like a held lock; the last error is returned on timeout.
    pub async fn acquire(store: Arc<dyn LockStore>, options: &LockOptions) -> Result<Self, LockError> {
        let deadline = tokio::time::Instant::now() + options.acquire_timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match Self::try_acquire(store.clone(), &options.key, &options.owner_id, options.ttl).await {
                Ok(lock) => return Ok(lock),
                Err(e) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        warn!(
                            key = %options.key,
                            attempts = attempt,
                            error = %e,
                            "Giving up acquiring lock"
                        );
                        return Err(e);
                    }
                    debug!(key = %options.key, attempt, error = %e, "Lock not acquired, retrying");
                    let pause = options.retry_interval.min(deadline - now);
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    fn from_lease(store: Arc<dyn LockStore>, lease: Lease, ttl: Duration) -> Self {
        Self {
            store,
            key: lease.key,
            owner_id: lease.owner_id,
            ttl,
            acquired_at: lease.acquired_at,
            expires_at_micros: AtomicI64::new(lease.expires_at.timestamp_micros()),
        }
    }

    /// Lock name.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owner identity.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Lease time-to-live used on every extension.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current local view of the expiry.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let micros = self.expires_at_micros.load(Ordering::Acquire);
        DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_default()
    }

    /// Snapshot of the lease as this runner sees it.
    pub fn lease(&self) -> Lease {
        Lease {
            key: self.key.clone(),
            owner_id: self.owner_id.clone(),
            acquired_at: self.acquired_at,
            expires_at: self.expires_at(),
        }
    }

    /// Time left before the lease lapses.
    pub fn remaining(&self) -> Duration {
        self.lease().remaining_at(Utc::now())
    }

    /// Whether the lease has lapsed (or renewal was refused).
    pub fn is_expired(&self) -> bool {
        self.lease().is_expired_at(Utc::now())
    }

    /// Fail with [`LockError::Expired`] once the lease is gone.
    pub fn ensure_valid(&self) -> Result<(), LockError> {
        if self.is_expired() {
            return Err(LockError::Expired {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    /// Renew the lease for another TTL.
    ///
    /// Returns `Ok(false)` when the store refused (lease expired or stolen); the
    /// lease is then marked lost locally so [`is_expired`](Self::is_expired) turns true.
    pub async fn extend(&self) -> Result<bool, LockError> {
        if self.is_expired() {
            return Ok(false);
        }

        match self.store.extend(&self.lease(), self.ttl).await? {
            Some(renewed) => {
                let micros = renewed.expires_at.timestamp_micros();
                self.expires_at_micros.fetch_max(micros, Ordering::AcqRel);
                debug!(key = %self.key, expires_at = %renewed.expires_at, "Lease extended");
                Ok(true)
            }
            None => {
                warn!(key = %self.key, owner_id = %self.owner_id, "Lease could not be renewed");
                self.mark_lost();
                Ok(false)
            }
        }
    }

    /// Give the lock back. Safe to call after expiry.
    pub async fn release(&self) -> Result<(), LockError> {
        self.store.release(&self.key, &self.owner_id).await?;
        self.mark_lost();
        info!(key = %self.key, owner_id = %self.owner_id, "Lock released");
        Ok(())
    }

    fn mark_lost(&self) {
        self.expires_at_micros
            .store(Utc::now().timestamp_micros(), Ordering::Release);
    }
}

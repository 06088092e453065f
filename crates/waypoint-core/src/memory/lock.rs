// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::lock::{Lease, LockError, LockStore};

/// Process-local [`LockStore`]. Only serialises runners sharing the instance.
#[derive(Default)]
pub struct InMemoryLockStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLockStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<String, Lease>> {
        self.leases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the lock to `owner_id` regardless of the current lease.
    #[cfg(test)]
    pub(crate) fn force_owner(&self, key: &str, owner_id: &str, ttl: Duration) {
        let now = Utc::now();
        self.leases().insert(
            key.to_string(),
            Lease {
                key: key.to_string(),
                owner_id: owner_id.to_string(),
                acquired_at: now,
                expires_at: expiry(now, ttl),
            },
        );
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn upsert(&self, key: &str, owner_id: &str, ttl: Duration) -> Result<Lease, LockError> {
        let now = Utc::now();
        let mut leases = self.leases();

        let acquired_at = match leases.get(key) {
            Some(current) if !current.is_expired_at(now) && current.owner_id != owner_id => {
                return Err(LockError::Held {
                    key: key.to_string(),
                    owner_id: current.owner_id.clone(),
                    expires_at: current.expires_at,
                });
            }
            Some(current) if current.owner_id == owner_id && !current.is_expired_at(now) => {
                current.acquired_at
            }
            _ => now,
        };

        let lease = Lease {
            key: key.to_string(),
            owner_id: owner_id.to_string(),
            acquired_at,
            expires_at: expiry(now, ttl),
        };
        leases.insert(key.to_string(), lease.clone());
        Ok(lease)
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let now = Utc::now();
        let mut leases = self.leases();

        match leases.get_mut(&lease.key) {
            Some(current) if current.owner_id == lease.owner_id && !current.is_expired_at(now) => {
                let proposed = expiry(now, ttl);
                if proposed > current.expires_at {
                    current.expires_at = proposed;
                }
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Lease>, LockError> {
        Ok(self.leases().get(key).cloned())
    }

    async fn release(&self, key: &str, owner_id: &str) -> Result<(), LockError> {
        let mut leases = self.leases();
        if leases.get(key).is_some_and(|lease| lease.owner_id == owner_id) {
            leases.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_owner_reacquires_and_keeps_acquired_at() {
        let store = InMemoryLockStore::new();
        let first = store.upsert("k", "a", Duration::from_secs(5)).await.unwrap();
        let second = store.upsert("k", "a", Duration::from_secs(5)).await.unwrap();

        assert_eq!(first.acquired_at, second.acquired_at);
        assert!(second.expires_at >= first.expires_at);
    }

    #[tokio::test]
    async fn test_extend_refused_for_other_owner() {
        let store = InMemoryLockStore::new();
        let lease = store.upsert("k", "a", Duration::from_secs(5)).await.unwrap();
        store.force_owner("k", "b", Duration::from_secs(5));

        assert!(store.extend(&lease, Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_noop() {
        let store = InMemoryLockStore::new();
        store.upsert("k", "a", Duration::from_secs(5)).await.unwrap();
        store.release("k", "b").await.unwrap();

        assert_eq!(store.get("k").await.unwrap().unwrap().owner_id, "a");
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction session bookkeeping.
//!
//! A [`SessionManager`] maps a session id (the id of the change being executed)
//! to the live backend handle a [`SessionSupplier`] opened for it. It knows
//! nothing about backend semantics, only identity and lifetime.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Session errors.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// Code expected an open transaction for this id and there is none.
    #[error("No active session for '{session_id}'")]
    NoActiveSession {
        /// Requested session id.
        session_id: String,
    },

    /// The backend could not open a session.
    #[error("Failed to open session '{session_id}': {details}")]
    OpenFailed {
        /// Session id being opened.
        session_id: String,
        /// Error details.
        details: String,
    },
}

/// Opens backend sessions (connections with an open transaction, client sessions, ...).
#[async_trait]
pub trait SessionSupplier<H>: Send + Sync {
    /// Open a new session for `session_id`.
    async fn open(&self, session_id: &str) -> Result<H, SessionError>;
}

/// Registry of open sessions keyed by session id.
pub struct SessionManager<H> {
    supplier: Arc<dyn SessionSupplier<H>>,
    sessions: DashMap<String, H>,
}

impl<H> SessionManager<H>
where
    H: Clone + Send + Sync + 'static,
{
    /// Create a manager backed by `supplier`.
    pub fn new(supplier: Arc<dyn SessionSupplier<H>>) -> Self {
        Self {
            supplier,
            sessions: DashMap::new(),
        }
    }

    /// Open a session for `session_id`, or return the one already open.
    pub async fn start_session(&self, session_id: &str) -> Result<H, SessionError> {
        if let Some(existing) = self.get_session(session_id) {
            return Ok(existing);
        }

        let opened = self.supplier.open(session_id).await?;
        // If a concurrent start won the race, its handle stays and ours is dropped.
        let handle = self
            .sessions
            .entry(session_id.to_string())
            .or_insert(opened)
            .value()
            .clone();
        debug!(session_id, "Session started");
        Ok(handle)
    }

    /// The open session for `session_id`, if any.
    pub fn get_session(&self, session_id: &str) -> Option<H> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// The open session for `session_id`, or [`SessionError::NoActiveSession`].
    pub fn get_session_or_throw(&self, session_id: &str) -> Result<H, SessionError> {
        self.get_session(session_id)
            .ok_or_else(|| SessionError::NoActiveSession {
                session_id: session_id.to_string(),
            })
    }

    /// Forget the session. Idempotent; returns the handle when one was open.
    pub fn close_session(&self, session_id: &str) -> Option<H> {
        let removed = self.sessions.remove(session_id).map(|(_, handle)| handle);
        if removed.is_some() {
            debug!(session_id, "Session closed");
        }
        removed
    }

    /// Number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}

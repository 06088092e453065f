// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Target systems: the resources changes are applied against.
//!
//! A plain [`TargetSystem`] only injects handles into the execution runtime. A
//! [`TransactionalTargetSystem`] also supplies a transaction wrapper, an
//! optional ongoing-task marker and an explicit resource identity used to
//! decide whether its transactions can cover the audit store's writes.

mod registry;

use std::fmt;
use std::sync::Arc;

use crate::marker::TargetSystemMarker;
use crate::runtime::ExecutionRuntime;
use crate::transaction::TransactionWrapper;

pub use registry::{TargetSystemOps, TargetSystemRegistry};

/// Identity of a physical transactional resource (a database, a cluster).
///
/// Two components with equal identities can join one backend transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceIdentity(String);

impl ResourceIdentity {
    /// Wrap a backend-specific identity string.
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    /// The identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resource changes are applied against.
pub trait TargetSystem: Send + Sync {
    /// Registry id.
    fn id(&self) -> &str;

    /// Inject the handles non-transactional change code needs.
    fn enhance_runtime(&self, runtime: &mut ExecutionRuntime);
}

/// A target system whose work can run inside backend transactions.
pub trait TransactionalTargetSystem: TargetSystem {
    /// Wrapper that opens, injects and finishes the backend transaction.
    fn transaction_wrapper(&self) -> Arc<dyn TransactionWrapper>;

    /// Ongoing-task marker, when the target system keeps one.
    fn marker(&self) -> Option<Arc<dyn TargetSystemMarker>>;

    /// Identity of the underlying transactional resource.
    fn resource_identity(&self) -> ResourceIdentity;

    /// Whether this target system's transactions run on the resource `other` names.
    ///
    /// Implemented explicitly per backend; there is no structural default.
    fn same_transactional_resource_as(&self, other: &ResourceIdentity) -> bool;
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Target system registry and resolution.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use super::{ResourceIdentity, TargetSystem, TransactionalTargetSystem};
use crate::audit::TxType;
use crate::error::ConfigurationError;
use crate::runtime::ExecutionRuntime;

#[derive(Clone)]
enum Registered {
    Plain(Arc<dyn TargetSystem>),
    Transactional(Arc<dyn TransactionalTargetSystem>),
}

impl Registered {
    fn id(&self) -> &str {
        match self {
            Self::Plain(target) => target.id(),
            Self::Transactional(target) => target.id(),
        }
    }
}

/// Resolved target system, decorated by its transactional capability.
#[derive(Clone)]
pub enum TargetSystemOps {
    /// Target system without transactions.
    NonTransactional(Arc<dyn TargetSystem>),
    /// Transactional target system.
    Transactional {
        /// The target system.
        target: Arc<dyn TransactionalTargetSystem>,
        /// Whether its transactional resource is the audit store's resource.
        shares_audit_resource: bool,
    },
}

impl TargetSystemOps {
    /// Target system id.
    pub fn id(&self) -> &str {
        match self {
            Self::NonTransactional(target) => target.id(),
            Self::Transactional { target, .. } => target.id(),
        }
    }

    /// Inject the target system's plain handles into `runtime`.
    pub fn enhance_runtime(&self, runtime: &mut ExecutionRuntime) {
        match self {
            Self::NonTransactional(target) => target.enhance_runtime(runtime),
            Self::Transactional { target, .. } => target.enhance_runtime(runtime),
        }
    }

    /// The transactional target system, if any.
    pub fn transactional(&self) -> Option<&Arc<dyn TransactionalTargetSystem>> {
        match self {
            Self::NonTransactional(_) => None,
            Self::Transactional { target, .. } => Some(target),
        }
    }

    /// Classify a change declaring `change_transactional` against this target system.
    pub fn classify(&self, change_transactional: bool) -> TxType {
        match self {
            Self::NonTransactional(_) => TxType::NonTx,
            Self::Transactional { .. } if !change_transactional => TxType::NonTx,
            Self::Transactional {
                shares_audit_resource: true,
                ..
            } => TxType::TxShared,
            Self::Transactional { target, .. } if target.marker().is_some() => {
                TxType::TxSeparateWithMarker
            }
            Self::Transactional { .. } => TxType::TxSeparateNoMarker,
        }
    }
}

impl fmt::Debug for TargetSystemOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonTransactional(target) => f
                .debug_tuple("NonTransactional")
                .field(&target.id())
                .finish(),
            Self::Transactional {
                target,
                shares_audit_resource,
            } => f
                .debug_struct("Transactional")
                .field("id", &target.id())
                .field("shares_audit_resource", shares_audit_resource)
                .finish(),
        }
    }
}

/// Registry of target systems, sealed on first resolution.
///
/// Classification depends on a stable registry, so every registration must
/// happen while wiring the engine; afterwards it fails with
/// [`ConfigurationError::RegistrySealed`].
pub struct TargetSystemRegistry {
    targets: RwLock<Vec<Registered>>,
    sealed: AtomicBool,
    default_id: Option<String>,
    audit_resource: Option<ResourceIdentity>,
}

impl Default for TargetSystemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetSystemRegistry {
    /// Empty, open registry.
    pub fn new() -> Self {
        Self {
            targets: RwLock::new(Vec::new()),
            sealed: AtomicBool::new(false),
            default_id: None,
            audit_resource: None,
        }
    }

    /// Fall back to `id` for changes without (or with an unknown) target system under relaxed resolution.
    pub fn with_default_target(mut self, id: impl Into<String>) -> Self {
        self.default_id = Some(id.into());
        self
    }

    /// Resource the audit store writes to, compared against transactional targets.
    pub fn with_audit_resource(mut self, identity: Option<ResourceIdentity>) -> Self {
        self.audit_resource = identity;
        self
    }

    /// Default target system id.
    pub fn default_target(&self) -> Option<&str> {
        self.default_id.as_deref()
    }

    /// Register a non-transactional target system.
    pub fn register(&self, target: Arc<dyn TargetSystem>) -> Result<(), ConfigurationError> {
        self.insert(Registered::Plain(target))
    }

    /// Register a transactional target system.
    pub fn register_transactional(
        &self,
        target: Arc<dyn TransactionalTargetSystem>,
    ) -> Result<(), ConfigurationError> {
        self.insert(Registered::Transactional(target))
    }

    fn insert(&self, target: Registered) -> Result<(), ConfigurationError> {
        let id = target.id().to_string();
        let mut targets = self.targets.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_sealed() {
            return Err(ConfigurationError::RegistrySealed { id });
        }
        if targets.iter().any(|existing| existing.id() == id) {
            return Err(ConfigurationError::DuplicateTargetSystem { id });
        }
        debug!(target_system_id = %id, "Target system registered");
        targets.push(target);
        Ok(())
    }

    /// Refuse further registrations.
    pub fn seal(&self) {
        if !self.sealed.swap(true, Ordering::AcqRel) {
            info!(target_systems = ?self.ids(), "Target system registry sealed");
        }
    }

    /// Whether registration is closed.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Registered ids, in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|t| t.id().to_string())
            .collect()
    }

    /// Every transactional target system.
    pub fn transactional_targets(&self) -> Vec<Arc<dyn TransactionalTargetSystem>> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|t| match t {
                Registered::Transactional(target) => Some(target.clone()),
                Registered::Plain(_) => None,
            })
            .collect()
    }

    fn find(&self, id: &str) -> Option<Registered> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    /// Resolve `id` to its operations facade, sealing the registry.
    ///
    /// With `relaxed`, an unset or unknown id falls back to the default target
    /// system; otherwise it fails listing the registered ids.
    pub fn resolve(&self, id: Option<&str>, relaxed: bool) -> Result<TargetSystemOps, ConfigurationError> {
        self.seal();

        let found = match id {
            Some(id) => self.find(id),
            None => None,
        };
        let found = match found {
            Some(found) => found,
            None if relaxed => self
                .default_id
                .as_deref()
                .and_then(|default| self.find(default))
                .ok_or_else(|| self.unknown(id))?,
            None => return Err(self.unknown(id)),
        };

        Ok(match found {
            Registered::Plain(target) => TargetSystemOps::NonTransactional(target),
            Registered::Transactional(target) => {
                let shares_audit_resource = self
                    .audit_resource
                    .as_ref()
                    .is_some_and(|audit| target.same_transactional_resource_as(audit));
                TargetSystemOps::Transactional {
                    target,
                    shares_audit_resource,
                }
            }
        })
    }

    fn unknown(&self, id: Option<&str>) -> ConfigurationError {
        ConfigurationError::UnknownTargetSystem {
            id: id.unwrap_or("<unset>").to_string(),
            available: self.ids(),
        }
    }
}

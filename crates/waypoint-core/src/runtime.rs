// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-change execution runtime.
//!
//! Carries the identifiers of the running change and a typed dependency map.
//! Target systems put their handles here (a plain pool for non-transactional
//! work, the open session inside a transaction) and change code pulls them out
//! with [`ExecutionRuntime::require`].

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::EngineError;
use crate::lock::{LeaseLock, LockError};

/// Execution context handed to change code.
pub struct ExecutionRuntime {
    execution_id: String,
    stage_id: String,
    change_id: String,
    dependencies: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    lock: Option<Arc<LeaseLock>>,
}

impl std::fmt::Debug for ExecutionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRuntime")
            .field("execution_id", &self.execution_id)
            .field("stage_id", &self.stage_id)
            .field("change_id", &self.change_id)
            .field("dependencies", &self.dependencies.len())
            .field("lock", &self.lock.as_ref().map(|l| l.key().to_string()))
            .finish()
    }
}

impl ExecutionRuntime {
    /// Create a runtime for one change execution.
    pub fn new(
        execution_id: impl Into<String>,
        stage_id: impl Into<String>,
        change_id: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            stage_id: stage_id.into(),
            change_id: change_id.into(),
            dependencies: HashMap::new(),
            lock: None,
        }
    }

    /// Guard commits with the runner's lease.
    pub fn with_lock(mut self, lock: Arc<LeaseLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Execution id of the current run.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Stage the change belongs to.
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    /// Id of the change being executed.
    pub fn change_id(&self) -> &str {
        &self.change_id
    }

    /// Session id used by transaction wrappers and markers (the change id).
    pub fn session_id(&self) -> &str {
        &self.change_id
    }

    /// Register a dependency, replacing any previous value of the same type.
    pub fn add_dependency<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.add_shared(Arc::new(value));
    }

    /// Register an already shared dependency.
    pub fn add_shared<T>(&mut self, value: Arc<T>)
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(TypeId::of::<T>(), value);
    }

    /// Remove a dependency, returning it if present.
    pub fn remove_dependency<T>(&mut self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Look up a dependency by type.
    pub fn dependency<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.dependencies
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// Look up a dependency, failing with [`EngineError::MissingDependency`].
    pub fn require<T>(&self) -> Result<Arc<T>, EngineError>
    where
        T: Send + Sync + 'static,
    {
        self.dependency::<T>()
            .ok_or(EngineError::MissingDependency {
                type_name: type_name::<T>(),
            })
    }

    /// Fail when the runner's lease has lapsed. A runtime without a lock always passes.
    pub fn ensure_lease_valid(&self) -> Result<(), LockError> {
        match &self.lock {
            Some(lock) => lock.ensure_valid(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::memory::InMemoryLockStore;

    #[derive(Debug, PartialEq)]
    struct Pool(&'static str);

    #[test]
    fn test_dependencies_by_type() {
        let mut runtime = ExecutionRuntime::new("exec-1", "main", "c1");
        runtime.add_dependency(Pool("orders"));
        runtime.add_dependency(42_u32);

        assert_eq!(*runtime.require::<Pool>().unwrap(), Pool("orders"));
        assert_eq!(*runtime.dependency::<u32>().unwrap(), 42);
        assert!(runtime.dependency::<String>().is_none());

        runtime.add_dependency(Pool("users"));
        assert_eq!(runtime.require::<Pool>().unwrap().0, "users");

        assert!(runtime.remove_dependency::<Pool>().is_some());
        let err = runtime.require::<Pool>().unwrap_err();
        assert_eq!(err.error_code(), "MISSING_DEPENDENCY");
        assert!(err.to_string().contains("Pool"));
    }

    #[test]
    fn test_identifiers() {
        let runtime = ExecutionRuntime::new("exec-1", "main", "c1");
        assert_eq!(runtime.execution_id(), "exec-1");
        assert_eq!(runtime.stage_id(), "main");
        assert_eq!(runtime.change_id(), "c1");
        assert_eq!(runtime.session_id(), "c1");
        assert!(runtime.ensure_lease_valid().is_ok());
    }

    #[tokio::test]
    async fn test_lease_check_follows_the_lock() {
        let store = Arc::new(InMemoryLockStore::new());
        let lock = Arc::new(
            LeaseLock::try_acquire(store, "k", "a", Duration::from_millis(30))
                .await
                .unwrap(),
        );
        let runtime = ExecutionRuntime::new("exec-1", "main", "c1").with_lock(lock);

        assert!(runtime.ensure_lease_valid().is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(runtime.ensure_lease_valid().unwrap_err().is_terminal());
    }
}

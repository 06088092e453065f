// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steppable changes and their rollback sequencing.
//!
//! A steppable change is a [`StepTemplate`] plus an ordered list of
//! [`TemplateStep`] payloads. [`StepSequencer`] applies them in order and, on
//! failure, rolls back every reached step in reverse, the failing one included.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ChangeExecutionError;
use crate::runtime::ExecutionRuntime;

/// Interprets step payloads against the target system.
#[async_trait]
pub trait StepTemplate: Send + Sync {
    /// Apply one step.
    async fn apply(
        &self,
        runtime: &mut ExecutionRuntime,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Undo one step.
    async fn rollback(
        &self,
        runtime: &mut ExecutionRuntime,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Apply and rollback payloads of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateStep {
    /// Payload passed to [`StepTemplate::apply`].
    pub apply: serde_json::Value,
    /// Payload passed to [`StepTemplate::rollback`]; `None` means the step cannot be undone.
    #[serde(default)]
    pub rollback: Option<serde_json::Value>,
}

impl TemplateStep {
    /// Step with an undo payload.
    pub fn new(apply: serde_json::Value, rollback: serde_json::Value) -> Self {
        Self {
            apply,
            rollback: Some(rollback),
        }
    }

    /// Step without an undo payload.
    pub fn apply_only(apply: serde_json::Value) -> Self {
        Self {
            apply,
            rollback: None,
        }
    }
}

/// Walks the steps of one change for one execution attempt.
///
/// Remembers the highest step index reached by [`apply`](Self::apply), so a
/// later [`rollback`](Self::rollback) knows where to start.
pub struct StepSequencer {
    task_id: String,
    template: Arc<dyn StepTemplate>,
    steps: Vec<TemplateStep>,
    reached: Mutex<Option<usize>>,
}

impl StepSequencer {
    /// Sequencer for `task_id` over `steps`.
    pub fn new(
        task_id: impl Into<String>,
        template: Arc<dyn StepTemplate>,
        steps: Vec<TemplateStep>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            template,
            steps,
            reached: Mutex::new(None),
        }
    }

    /// Highest step index attempted so far, failed step included.
    pub fn reached(&self) -> Option<usize> {
        *self.reached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether any step can be undone.
    pub fn has_rollback(&self) -> bool {
        self.steps.iter().any(|step| step.rollback.is_some())
    }

    fn set_reached(&self, index: usize) {
        *self.reached.lock().unwrap_or_else(PoisonError::into_inner) = Some(index);
    }

    /// Apply every step in order, stopping at the first failure.
    pub async fn apply(&self, runtime: &mut ExecutionRuntime) -> Result<(), ChangeExecutionError> {
        for (index, step) in self.steps.iter().enumerate() {
            self.set_reached(index);
            debug!(change_id = %self.task_id, step = index, "Applying step");
            if let Err(e) = self.template.apply(runtime, &step.apply).await {
                warn!(change_id = %self.task_id, step = index, error = %e, "Step failed");
                return Err(ChangeExecutionError::from_error(&self.task_id, &e));
            }
        }
        Ok(())
    }

    /// Roll back from the last reached step down to the first.
    ///
    /// Steps without an undo payload are skipped. The first rollback failure ends
    /// the walk; it is never retried.
    pub async fn rollback(&self, runtime: &mut ExecutionRuntime) -> Result<(), ChangeExecutionError> {
        let Some(last) = self.reached() else {
            return Ok(());
        };

        for index in (0..=last).rev() {
            let Some(payload) = self.steps.get(index).and_then(|s| s.rollback.as_ref()) else {
                debug!(change_id = %self.task_id, step = index, "Step has no rollback, skipping");
                continue;
            };
            if let Err(e) = self.template.rollback(runtime, payload).await {
                warn!(change_id = %self.task_id, step = index, error = %e, "Step rollback failed");
                return Err(ChangeExecutionError::from_error(&self.task_id, &e));
            }
            info!(change_id = %self.task_id, step = index, "Step rolled back");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    /// Records payloads; fails apply or rollback on a given payload.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_apply_on: Option<&'static str>,
        fail_rollback_on: Option<&'static str>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StepTemplate for Recorder {
        async fn apply(&self, _runtime: &mut ExecutionRuntime, payload: &Value) -> anyhow::Result<()> {
            let name = payload.as_str().unwrap_or_default();
            if self.fail_apply_on == Some(name) {
                anyhow::bail!("cannot apply {name}");
            }
            self.calls.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn rollback(&self, _runtime: &mut ExecutionRuntime, payload: &Value) -> anyhow::Result<()> {
            let name = payload.as_str().unwrap_or_default();
            if self.fail_rollback_on == Some(name) {
                anyhow::bail!("cannot undo {name}");
            }
            self.calls.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn steps() -> Vec<TemplateStep> {
        vec![
            TemplateStep::new(json!("a0"), json!("r0")),
            TemplateStep::apply_only(json!("a1")),
            TemplateStep::new(json!("a2"), json!("r2")),
            TemplateStep::new(json!("a3"), json!("r3")),
        ]
    }

    fn runtime() -> ExecutionRuntime {
        ExecutionRuntime::new("exec", "main", "steppy")
    }

    #[tokio::test]
    async fn test_failure_rolls_back_reached_steps_in_reverse() {
        let recorder = Arc::new(Recorder {
            fail_apply_on: Some("a3"),
            ..Recorder::default()
        });
        let sequencer = StepSequencer::new("steppy", recorder.clone(), steps());
        let mut runtime = runtime();

        let err = sequencer.apply(&mut runtime).await.unwrap_err();
        assert_eq!(err.task_id, "steppy");
        assert!(err.message.contains("cannot apply a3"));
        assert_eq!(sequencer.reached(), Some(3));
        assert_eq!(recorder.calls(), vec!["a0", "a1", "a2"]);

        sequencer.rollback(&mut runtime).await.unwrap();
        assert_eq!(
            recorder.calls(),
            vec!["a0", "a1", "a2", "r3", "r2", "r0"]
        );
    }

    #[tokio::test]
    async fn test_rollback_failure_stops_the_walk() {
        let recorder = Arc::new(Recorder {
            fail_apply_on: Some("a3"),
            fail_rollback_on: Some("r2"),
            ..Recorder::default()
        });
        let sequencer = StepSequencer::new("steppy", recorder.clone(), steps());
        let mut runtime = runtime();

        sequencer.apply(&mut runtime).await.unwrap_err();
        let err = sequencer.rollback(&mut runtime).await.unwrap_err();

        assert!(err.message.contains("cannot undo r2"));
        // r0 is never attempted.
        assert_eq!(recorder.calls(), vec!["a0", "a1", "a2", "r3"]);
    }

    #[tokio::test]
    async fn test_rollback_before_apply_is_a_noop() {
        let recorder = Arc::new(Recorder::default());
        let sequencer = StepSequencer::new("steppy", recorder.clone(), steps());

        sequencer.rollback(&mut runtime()).await.unwrap();
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_successful_apply_reaches_last_step() {
        let recorder = Arc::new(Recorder::default());
        let sequencer = StepSequencer::new("steppy", recorder.clone(), steps());

        sequencer.apply(&mut runtime()).await.unwrap();
        assert_eq!(sequencer.reached(), Some(3));
        assert_eq!(recorder.calls(), vec!["a0", "a1", "a2", "a3"]);
    }

    #[test]
    fn test_step_deserializes_without_rollback() {
        let step: TemplateStep = serde_json::from_value(json!({"apply": {"sql": "x"}})).unwrap();
        assert!(step.rollback.is_none());
    }
}

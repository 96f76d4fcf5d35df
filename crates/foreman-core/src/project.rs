//! Collaborator seams: project registry, dependency declarations and
//! access control.
//!
//! The scheduler never owns project configuration. It enumerates tasks and
//! their declared dependencies through [`ProjectRegistry`], and consults
//! [`AccessControl`] as a yes/no gate before destructive operations.

use std::fmt;
use std::sync::Arc;

use crate::{Action, BuildOutcome, ItemId, Result, Task, TaskId};

/// Summary of one finished build, handed to trigger policies and the
/// scheduler's completion hook.
#[derive(Debug, Clone)]
pub struct BuildCompletion {
    pub task: TaskId,
    pub item_id: ItemId,
    pub outcome: BuildOutcome,
    /// Actions the completed build carried (causes, parameters, revision
    /// baselines).
    pub actions: Vec<Action>,
    /// Problems recorded by individual work units (instantiation failures,
    /// panics).
    pub problems: Vec<String>,
}

/// Per-edge decision whether completion of an upstream build should
/// trigger the downstream task.
pub trait TriggerPolicy: Send + Sync {
    /// Returns `true` to trigger the downstream build. Actions pushed into
    /// `actions` are attached to the triggered submission.
    fn should_trigger(&self, completion: &BuildCompletion, actions: &mut Vec<Action>) -> bool;
}

/// Triggers when the upstream outcome is no worse than a threshold.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdTrigger {
    pub threshold: BuildOutcome,
}

impl Default for ThresholdTrigger {
    fn default() -> Self {
        Self {
            threshold: BuildOutcome::Success,
        }
    }
}

impl TriggerPolicy for ThresholdTrigger {
    fn should_trigger(&self, completion: &BuildCompletion, _actions: &mut Vec<Action>) -> bool {
        completion.outcome <= self.threshold
    }
}

/// A directed dependency edge: completion of `upstream` may trigger
/// `downstream`, subject to the edge's trigger policy.
#[derive(Clone)]
pub struct Dependency {
    pub upstream: TaskId,
    pub downstream: TaskId,
    pub trigger: Arc<dyn TriggerPolicy>,
}

impl Dependency {
    /// Edge with the default success-only trigger.
    pub fn new(upstream: impl Into<TaskId>, downstream: impl Into<TaskId>) -> Self {
        Self {
            upstream: upstream.into(),
            downstream: downstream.into(),
            trigger: Arc::new(ThresholdTrigger::default()),
        }
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn TriggerPolicy>) -> Self {
        self.trigger = trigger;
        self
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .finish_non_exhaustive()
    }
}

/// Enumerates the schedulable tasks and their declared dependencies.
pub trait ProjectRegistry: Send + Sync {
    /// All tasks, used to rebuild the dependency graph wholesale.
    fn tasks(&self) -> Vec<Arc<dyn Task>>;

    /// Look up one task by its stable id.
    fn task(&self, id: &TaskId) -> Option<Arc<dyn Task>>;

    /// The dependency edges this task contributes to the graph. A failure
    /// here is isolated to the one contributor; the rebuild carries on
    /// with the others.
    fn collect_edges(&self, task: &dyn Task) -> Result<Vec<Dependency>> {
        let _ = task;
        Ok(Vec::new())
    }
}

/// Yes/no gate consulted before cancel/stop operations. Authorization
/// itself lives outside the scheduler.
pub trait AccessControl: Send + Sync {
    fn can_cancel(&self, task: &TaskId) -> bool {
        let _ = task;
        true
    }

    fn can_stop(&self, task: &TaskId) -> bool {
        let _ = task;
        true
    }
}

/// Permits everything. Useful as a default and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAll;

impl AccessControl for PermitAll {}

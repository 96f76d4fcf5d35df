//! Task, sub-task and executable abstractions.
//!
//! A `Task` is a schedulable unit of work, typically one project. Once the
//! queue hands a task to an executor, the task produces an `Executable`,
//! which is the concrete runnable for that build.

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::{Result, TaskId};

/// A node-affinity label. A task with an assigned label may only run on
/// executors whose node carries that label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct Label(String);

impl Label {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Label {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Opaque token that forces all work units of one build onto the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct SameNodeConstraint(String);

impl SameNodeConstraint {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

/// Final result of one build, worst-first ordering: a multi-unit build
/// aggregates to the most severe outcome of its units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BuildOutcome {
    Success,
    Aborted,
    Failure,
}

impl BuildOutcome {
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}

/// A raise-once signal delivered to a running executable when its build is
/// being stopped. The executable is responsible for observing it and
/// unwinding; the scheduler records the resulting completion as aborted.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

#[derive(Debug, Default)]
struct InterruptInner {
    raised: AtomicBool,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Completes once the interrupt has been raised. Returns immediately if
    /// it already was.
    pub async fn raised(&self) {
        let mut notified = pin!(self.inner.notify.notified());
        loop {
            // register before re-checking the flag so a concurrent raise()
            // cannot slip between the check and the await
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

/// One unit of execution that must be matched to an executor.
///
/// Every task is its own first sub-task; tasks that fan out (matrix axes)
/// contribute additional sub-tasks via [`Task::sub_tasks`].
pub trait SubTask: Send + Sync {
    /// The task that owns this unit.
    fn owner(&self) -> TaskId;

    fn display_name(&self) -> String;

    fn assigned_label(&self) -> Option<Label> {
        None
    }

    fn estimated_duration(&self) -> Option<Duration> {
        None
    }

    /// Produce the concrete runnable for this unit. Called by an executor
    /// after the unit has been matched; a failure here is transient and
    /// does not kill the executor.
    fn create_executable(&self) -> Result<Box<dyn Executable>>;
}

/// A schedulable unit of work, typically one project.
pub trait Task: Send + Sync {
    /// Stable identity; the queue references tasks by this key.
    fn id(&self) -> TaskId;

    fn display_name(&self) -> String {
        self.id().to_string()
    }

    /// Whether the task may be scheduled at all. `false` refuses
    /// submissions outright (e.g. a disabled project).
    fn is_buildable(&self) -> bool {
        true
    }

    /// Whether two builds of this task may run at the same time. When
    /// `false`, duplicate submissions merge and a running build blocks the
    /// next one.
    fn concurrent_build(&self) -> bool {
        false
    }

    fn block_when_downstream_building(&self) -> bool {
        false
    }

    fn block_when_upstream_building(&self) -> bool {
        false
    }

    /// Task-level quiet period override. `None` falls back to the
    /// scheduler-wide default.
    fn quiet_period(&self) -> Option<Duration> {
        None
    }

    fn assigned_label(&self) -> Option<Label> {
        None
    }

    /// When set, all work units of one build are placed on the same node.
    fn same_node_constraint(&self) -> Option<SameNodeConstraint> {
        None
    }

    fn estimated_duration(&self) -> Option<Duration> {
        None
    }

    /// Additional execution units beyond the task itself.
    fn sub_tasks(&self) -> Vec<Arc<dyn SubTask>> {
        Vec::new()
    }

    fn create_executable(&self) -> Result<Box<dyn Executable>>;
}

/// The concrete runnable produced by a task once a work unit is assigned.
#[async_trait]
pub trait Executable: Send + Sync {
    fn estimated_duration(&self) -> Option<Duration> {
        None
    }

    /// Run the build. The executable must observe `interrupt` and return
    /// [`crate::Error::Cancelled`] promptly once it is raised.
    async fn run(&self, interrupt: Interrupt) -> Result<()>;
}

//! Blocking-policy evaluation.
//!
//! Decides, for one queued item whose quiet period has elapsed, whether a
//! cause of blockage still applies. The checks run in order and the first
//! applicable cause wins; nothing is cached because the underlying
//! building/queued state changes continuously.

use crate::graph::DependencyGraph;
use async_trait::async_trait;
use foreman_core::{Task, TaskId};
use serde::Serialize;
use std::fmt;

/// Live view of what is currently building, provided by the executor
/// pool.
#[async_trait]
pub trait BuildActivity: Send + Sync {
    async fn is_building(&self, task: &TaskId) -> bool;
}

/// Why a buildable-looking item must still wait. Shown to users verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CauseOfBlockage {
    /// A previous build of the task is still running and the task does
    /// not allow concurrent builds.
    SelfBuilding { task: TaskId },
    /// The nearest transitively-downstream task that is building or
    /// queued, for tasks configured to wait on downstream activity.
    DownstreamBuilding { downstream: TaskId },
    /// The nearest transitively-upstream task that is building or queued.
    UpstreamBuilding { upstream: TaskId },
}

impl fmt::Display for CauseOfBlockage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CauseOfBlockage::SelfBuilding { task } => {
                write!(f, "a build of {} is already in progress", task)
            }
            CauseOfBlockage::DownstreamBuilding { downstream } => {
                write!(f, "downstream task {} is building or queued", downstream)
            }
            CauseOfBlockage::UpstreamBuilding { upstream } => {
                write!(f, "upstream task {} is building or queued", upstream)
            }
        }
    }
}

/// Evaluate the blocking policy for `task`. Returns the first applicable
/// cause, or `None` if the item may proceed to buildable.
///
/// `in_queue` reports whether some other task currently has a queue item;
/// the transitive walks skip the task itself so it never blocks on its
/// own submission.
pub async fn evaluate(
    task: &dyn Task,
    graph: &DependencyGraph,
    activity: &dyn BuildActivity,
    in_queue: impl Fn(&TaskId) -> bool,
) -> Option<CauseOfBlockage> {
    let id = task.id();

    if !task.concurrent_build() && activity.is_building(&id).await {
        return Some(CauseOfBlockage::SelfBuilding { task: id });
    }

    if task.block_when_downstream_building() {
        // nearest first: the closure is in BFS order
        for downstream in graph.transitive_downstream(&id) {
            if downstream == id {
                continue;
            }
            if activity.is_building(&downstream).await || in_queue(&downstream) {
                return Some(CauseOfBlockage::DownstreamBuilding { downstream });
            }
        }
    }

    if task.block_when_upstream_building() {
        for upstream in graph.transitive_upstream(&id) {
            if upstream == id {
                continue;
            }
            if activity.is_building(&upstream).await || in_queue(&upstream) {
                return Some(CauseOfBlockage::UpstreamBuilding { upstream });
            }
        }
    }

    None
}

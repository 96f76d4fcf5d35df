//! Build scheduling for Foreman.
//!
//! This crate contains:
//! - The build queue and its item lifecycle (waiting, blocked, buildable,
//!   pending)
//! - Blocking-policy evaluation (causes of blockage)
//! - The immutable dependency graph and downstream triggering
//! - Executors, nodes and the executor pool
//! - Workspace leasing
//! - The `Scheduler` that wires all of the above together

pub mod blockage;
pub mod executor;
pub mod graph;
pub mod queue;
pub mod scheduler;
pub mod workspace;

pub use blockage::{BuildActivity, CauseOfBlockage};
pub use executor::{
    Executor, ExecutorIdentity, ExecutorPool, ExecutorSnapshot, ExecutorStateSnapshot, Node,
    SchedulerEvents, current_executor, impersonate, likely_stuck, progress_percent,
};
pub use graph::{DependencyGraph, DependencyGroup, GraphBuilder, TopoOrder, build_graph};
pub use queue::{
    ExecutorProfile, ItemPhase, ItemSnapshot, Queue, WorkUnit, WorkUnitContext,
};
pub use scheduler::Scheduler;
pub use workspace::{WorkspaceLease, WorkspaceList};

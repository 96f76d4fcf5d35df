//! Core domain types and traits for the Foreman build scheduler.
//!
//! This crate contains:
//! - Task, sub-task and executable abstractions
//! - Queue actions (causes, parameters, revision baselines)
//! - Dependency declarations and trigger policies
//! - Project registry and access-control seams
//! - Identifiers and the common error type

pub mod action;
pub mod error;
pub mod id;
pub mod project;
pub mod task;

pub use action::{Action, Cause, merge_actions};
pub use error::{Error, Result};
pub use id::{ItemId, TaskId};
pub use project::{
    AccessControl, BuildCompletion, Dependency, PermitAll, ProjectRegistry, ThresholdTrigger,
    TriggerPolicy,
};
pub use task::{BuildOutcome, Executable, Interrupt, Label, SameNodeConstraint, SubTask, Task};

//! Actions attached to a queued build request.
//!
//! Actions accumulate on a queue item: a duplicate submission of the same
//! not-yet-started task merges its actions into the existing item instead
//! of creating a second one.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::TaskId;

/// Why a build was requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Cause {
    /// A user asked for the build.
    UserTriggered { user: String },
    /// Completion of an upstream build triggered this one.
    UpstreamBuild { task: TaskId },
    /// SCM polling detected a change.
    ScmChange,
    /// A timer fired.
    Timer,
}

/// One action carried by a queue item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Action {
    Cause(Cause),
    Parameters(HashMap<String, String>),
    /// SCM revision baseline. The scheduler does not interpret this; it is
    /// threaded through to the triggered build untouched.
    RevisionBaseline(serde_json::Value),
}

/// Merge `incoming` actions into an existing item's action list.
///
/// Identical causes are recorded once; parameters and baselines are
/// appended as-is.
pub fn merge_actions(existing: &mut Vec<Action>, incoming: Vec<Action>) {
    for action in incoming {
        if matches!(action, Action::Cause(_)) && existing.contains(&action) {
            continue;
        }
        existing.push(action);
    }
}

//! The build queue.
//!
//! Holds submitted build requests through their lifecycle:
//! waiting (quiet period running) → blocked (a cause of blockage applies)
//! ⇄ buildable (waiting for a free executor) → pending (work units being
//! handed out), after which the item leaves the queue. An item may
//! oscillate between blocked and buildable any number of times.
//!
//! All state transitions happen under one coarse lock; correctness over
//! throughput, since scheduling decisions are rare next to build
//! execution. `pop` never awaits while holding it. Queue state is
//! in-memory only: a restart loses queued-but-not-started items by
//! design.

use crate::blockage::{self, BuildActivity, CauseOfBlockage};
use crate::graph::DependencyGraph;
use chrono::{DateTime, Utc};
use foreman_core::{
    AccessControl, Action, BuildCompletion, BuildOutcome, Error, Executable, ItemId, Label,
    Result, SubTask, Task, TaskId, merge_actions,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Node identity and labels of the executor asking for work.
#[derive(Debug, Clone)]
pub struct ExecutorProfile {
    pub node: String,
    pub labels: HashSet<Label>,
}

impl ExecutorProfile {
    fn accepts(&self, label: Option<&Label>) -> bool {
        label.is_none_or(|l| self.labels.contains(l))
    }
}

/// Lifecycle phase of a queue item, for snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemPhase {
    Waiting,
    Blocked,
    Buildable,
    Pending,
}

/// Read-only view of one queue item for the UI/API layer.
#[derive(Debug, Clone, Serialize)]
pub struct ItemSnapshot {
    pub id: ItemId,
    pub task: TaskId,
    pub phase: ItemPhase,
    /// Human-readable reason the item has not started yet.
    pub why: String,
    pub queued_at: DateTime<Utc>,
    pub actions: Vec<Action>,
}

/// Synchronizes completion across all work units of one build. When the
/// last unit reports in, the aggregated completion is handed back for
/// downstream triggering.
pub struct WorkUnitContext {
    item_id: ItemId,
    task: Arc<dyn Task>,
    actions: Vec<Action>,
    state: StdMutex<ContextState>,
}

struct ContextState {
    remaining: usize,
    outcome: BuildOutcome,
    problems: Vec<String>,
}

impl WorkUnitContext {
    fn new(item_id: ItemId, task: Arc<dyn Task>, actions: Vec<Action>, total: usize) -> Self {
        Self {
            item_id,
            task,
            actions,
            state: StdMutex::new(ContextState {
                remaining: total,
                outcome: BuildOutcome::Success,
                problems: Vec::new(),
            }),
        }
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    pub fn task(&self) -> &Arc<dyn Task> {
        &self.task
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Record one finished work unit. Returns the aggregated completion
    /// once every unit of the build has reported.
    pub fn unit_finished(
        &self,
        elapsed: Duration,
        outcome: BuildOutcome,
        problem: Option<String>,
    ) -> Option<BuildCompletion> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.outcome = state.outcome.worst(outcome);
        if let Some(problem) = problem {
            state.problems.push(problem);
        }
        state.remaining -= 1;
        debug!(
            item = %self.item_id,
            task = %self.task.id(),
            elapsed_ms = elapsed.as_millis() as u64,
            ?outcome,
            remaining = state.remaining,
            "work unit finished"
        );
        if state.remaining > 0 {
            return None;
        }
        Some(BuildCompletion {
            task: self.task.id(),
            item_id: self.item_id,
            outcome: state.outcome,
            actions: self.actions.clone(),
            problems: std::mem::take(&mut state.problems),
        })
    }
}

/// Binds one sub-task of a buildable item to one executor for the
/// duration of execution.
pub struct WorkUnit {
    pub item_id: ItemId,
    pub task_id: TaskId,
    pub sub_task: Arc<dyn SubTask>,
    /// Whether this unit is the owning task itself rather than one of its
    /// extra sub-tasks.
    pub is_main: bool,
    pub context: Arc<WorkUnitContext>,
}

// The owning task is its own first work unit.
struct MainUnit(Arc<dyn Task>);

impl SubTask for MainUnit {
    fn owner(&self) -> TaskId {
        self.0.id()
    }

    fn display_name(&self) -> String {
        self.0.display_name()
    }

    fn assigned_label(&self) -> Option<Label> {
        self.0.assigned_label()
    }

    fn estimated_duration(&self) -> Option<Duration> {
        self.0.estimated_duration()
    }

    fn create_executable(&self) -> Result<Box<dyn Executable>> {
        self.0.create_executable()
    }
}

struct UnitSlot {
    sub_task: Arc<dyn SubTask>,
    is_main: bool,
}

struct PendingWork {
    context: Arc<WorkUnitContext>,
    units: VecDeque<UnitSlot>,
    /// Set on the first claim when the task carries a same-node
    /// constraint; later units only match executors on this node.
    required_node: Option<String>,
}

enum ItemState {
    Waiting,
    Blocked(CauseOfBlockage),
    Buildable,
    Pending(PendingWork),
}

struct QueueItem {
    id: ItemId,
    task: Arc<dyn Task>,
    seq: u64,
    queued_at: DateTime<Utc>,
    due: Instant,
    actions: Vec<Action>,
    state: ItemState,
}

impl QueueItem {
    fn started(&self) -> bool {
        matches!(self.state, ItemState::Pending(_))
    }

    fn phase(&self) -> ItemPhase {
        match self.state {
            ItemState::Waiting => ItemPhase::Waiting,
            ItemState::Blocked(_) => ItemPhase::Blocked,
            ItemState::Buildable => ItemPhase::Buildable,
            ItemState::Pending(_) => ItemPhase::Pending,
        }
    }

    fn why(&self) -> String {
        match &self.state {
            ItemState::Waiting => format!(
                "in the quiet period for another {}s",
                self.due.duration_since(Instant::now()).as_secs()
            ),
            ItemState::Blocked(cause) => cause.to_string(),
            ItemState::Buildable => "waiting for an available executor".to_string(),
            ItemState::Pending(_) => "build is about to start".to_string(),
        }
    }

    fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            id: self.id,
            task: self.task.id(),
            phase: self.phase(),
            why: self.why(),
            queued_at: self.queued_at,
            actions: self.actions.clone(),
        }
    }
}

struct QueueState {
    items: HashMap<ItemId, QueueItem>,
    next_seq: u64,
}

/// The central scheduling structure.
pub struct Queue {
    state: Mutex<QueueState>,
    // bumped whenever buildable work may have appeared; pop waiters
    // re-check on every change
    epoch: watch::Sender<u64>,
    access: Arc<dyn AccessControl>,
}

impl Queue {
    pub fn new(access: Arc<dyn AccessControl>) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            state: Mutex::new(QueueState {
                items: HashMap::new(),
                next_seq: 0,
            }),
            epoch,
            access,
        }
    }

    pub(crate) fn kick(&self) {
        self.epoch.send_modify(|v| *v += 1);
    }

    /// Submit a build request.
    ///
    /// If the same non-concurrent task already has a not-yet-started item
    /// queued, the new actions merge into it and its id is returned
    /// unchanged; the original quiet-period deadline is kept. Returns
    /// `None` if scheduling is refused outright (task not buildable).
    pub async fn schedule(
        &self,
        task: Arc<dyn Task>,
        quiet_period: Duration,
        actions: Vec<Action>,
    ) -> Option<ItemId> {
        if !task.is_buildable() {
            debug!(task = %task.id(), "scheduling refused: task is not buildable");
            return None;
        }

        let mut state = self.state.lock().await;

        if !task.concurrent_build() {
            let task_id = task.id();
            if let Some(item) = state
                .items
                .values_mut()
                .find(|i| i.task.id() == task_id && !i.started())
            {
                merge_actions(&mut item.actions, actions);
                debug!(task = %task_id, item = %item.id, "merged duplicate submission");
                return Some(item.id);
            }
        }

        let item = QueueItem {
            id: ItemId::new(),
            seq: state.next_seq,
            queued_at: Utc::now(),
            due: Instant::now() + quiet_period,
            actions,
            state: ItemState::Waiting,
            task,
        };
        state.next_seq += 1;
        info!(
            task = %item.task.id(),
            item = %item.id,
            quiet_period_ms = quiet_period.as_millis() as u64,
            "queued build request"
        );
        let id = item.id;
        state.items.insert(id, item);
        Some(id)
    }

    /// Remove a not-yet-started item for `task`. No-op returning `false`
    /// if the task has none (e.g. its build already started).
    pub async fn cancel(&self, task: &TaskId) -> Result<bool> {
        if !self.access.can_cancel(task) {
            return Err(Error::PermissionDenied(format!(
                "not allowed to cancel {}",
                task
            )));
        }
        let mut state = self.state.lock().await;
        let found = state
            .items
            .values()
            .find(|i| i.task.id() == *task && !i.started())
            .map(|i| i.id);
        match found {
            Some(id) => {
                state.items.remove(&id);
                info!(task = %task, item = %id, "cancelled queued build");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove one specific not-yet-started item by id.
    pub async fn cancel_item(&self, id: ItemId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.get(&id) else {
            return Ok(false);
        };
        if item.started() {
            return Ok(false);
        }
        let task = item.task.id();
        if !self.access.can_cancel(&task) {
            return Err(Error::PermissionDenied(format!(
                "not allowed to cancel {}",
                task
            )));
        }
        state.items.remove(&id);
        info!(task = %task, item = %id, "cancelled queued build");
        Ok(true)
    }

    /// Administrative flush of every not-yet-started item the caller may
    /// cancel. Returns the number of removed items.
    pub async fn clear(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state
            .items
            .retain(|_, item| item.started() || !self.access.can_cancel(&item.task.id()));
        let removed = before - state.items.len();
        if removed > 0 {
            info!(removed, "cleared queued builds");
        }
        Ok(removed)
    }

    pub async fn contains(&self, task: &TaskId) -> bool {
        let state = self.state.lock().await;
        state.items.values().any(|i| i.task.id() == *task)
    }

    pub async fn item_for(&self, task: &TaskId) -> Option<ItemSnapshot> {
        let state = self.state.lock().await;
        state
            .items
            .values()
            .filter(|i| i.task.id() == *task)
            .min_by_key(|i| i.seq)
            .map(QueueItem::snapshot)
    }

    /// All items in submission order.
    pub async fn items(&self) -> Vec<ItemSnapshot> {
        let state = self.state.lock().await;
        let mut items: Vec<&QueueItem> = state.items.values().collect();
        items.sort_by_key(|i| i.seq);
        items.iter().map(|i| i.snapshot()).collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }

    /// Re-evaluate every waiting item whose quiet period has elapsed and
    /// every blocked or buildable item, recomputing blocking causes.
    /// Idempotent and safe to call concurrently; invoked after every
    /// configuration change, queue mutation and executor becoming idle.
    pub async fn maintain(&self, graph: &DependencyGraph, activity: &dyn BuildActivity) {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let queued: HashSet<TaskId> = state.items.values().map(|i| i.task.id()).collect();
        let mut ids: Vec<(u64, ItemId)> = state
            .items
            .values()
            .filter(|i| !i.started())
            .map(|i| (i.seq, i.id))
            .collect();
        ids.sort_unstable_by_key(|(seq, _)| *seq);

        let mut woke = false;
        for (_, id) in ids {
            let task = {
                let Some(item) = state.items.get(&id) else {
                    continue;
                };
                let eligible = match &item.state {
                    ItemState::Waiting => item.due <= now,
                    ItemState::Blocked(_) | ItemState::Buildable => true,
                    ItemState::Pending(_) => false,
                };
                if !eligible {
                    continue;
                }
                item.task.clone()
            };

            let cause =
                blockage::evaluate(task.as_ref(), graph, activity, |t| queued.contains(t)).await;

            let Some(item) = state.items.get_mut(&id) else {
                continue;
            };
            match cause {
                None => {
                    if !matches!(item.state, ItemState::Buildable) {
                        debug!(item = %id, task = %task.id(), "item is buildable");
                        woke = true;
                    }
                    item.state = ItemState::Buildable;
                }
                Some(cause) => {
                    match &item.state {
                        ItemState::Blocked(previous) if *previous == cause => {}
                        _ => debug!(item = %id, task = %task.id(), %cause, "item is blocked"),
                    }
                    item.state = ItemState::Blocked(cause);
                }
            }
        }

        drop(state);
        if woke {
            self.kick();
        }
    }

    /// Called by an idle executor. Suspends until a buildable item (or a
    /// remaining work unit of a pending one) is compatible with the
    /// caller's node and labels, then atomically claims it.
    pub async fn pop(&self, profile: &ExecutorProfile) -> WorkUnit {
        let mut epoch = self.epoch.subscribe();
        loop {
            // mark the epoch seen before scanning, so a claim racing with
            // a promotion is never missed
            epoch.borrow_and_update();
            let claimed = {
                let mut state = self.state.lock().await;
                Self::try_claim(&mut state, profile)
            };
            if let Some((unit, more_units)) = claimed {
                if more_units {
                    // wake other executors for the remaining units
                    self.kick();
                }
                info!(
                    item = %unit.item_id,
                    task = %unit.task_id,
                    node = %profile.node,
                    "work unit assigned"
                );
                return unit;
            }
            let _ = epoch.changed().await;
        }
    }

    fn try_claim(state: &mut QueueState, profile: &ExecutorProfile) -> Option<(WorkUnit, bool)> {
        let mut candidates: Vec<(u64, ItemId)> = state
            .items
            .values()
            .filter(|i| matches!(i.state, ItemState::Buildable | ItemState::Pending(_)))
            .map(|i| (i.seq, i.id))
            .collect();
        candidates.sort_unstable_by_key(|(seq, _)| *seq);

        for (_, id) in candidates {
            let Some(item) = state.items.get_mut(&id) else {
                continue;
            };
            let claimed: Option<(WorkUnit, bool)> = match &mut item.state {
                ItemState::Buildable => {
                    if !profile.accepts(item.task.assigned_label().as_ref()) {
                        None
                    } else {
                        let mut units: VecDeque<UnitSlot> = VecDeque::new();
                        units.push_back(UnitSlot {
                            sub_task: Arc::new(MainUnit(item.task.clone())),
                            is_main: true,
                        });
                        for sub_task in item.task.sub_tasks() {
                            units.push_back(UnitSlot {
                                sub_task,
                                is_main: false,
                            });
                        }
                        let context = Arc::new(WorkUnitContext::new(
                            item.id,
                            item.task.clone(),
                            item.actions.clone(),
                            units.len(),
                        ));
                        // the first unit is the owning task itself, whose
                        // label was checked above
                        let Some(slot) = units.pop_front() else {
                            continue;
                        };
                        let required_node = item
                            .task
                            .same_node_constraint()
                            .map(|_| profile.node.clone());
                        let unit = WorkUnit {
                            item_id: item.id,
                            task_id: item.task.id(),
                            sub_task: slot.sub_task,
                            is_main: slot.is_main,
                            context: context.clone(),
                        };
                        let drained = units.is_empty();
                        if !drained {
                            item.state = ItemState::Pending(PendingWork {
                                context,
                                units,
                                required_node,
                            });
                        }
                        Some((unit, drained))
                    }
                }
                ItemState::Pending(pending) => {
                    if pending
                        .required_node
                        .as_deref()
                        .is_some_and(|node| node != profile.node)
                    {
                        None
                    } else if let Some(pos) = pending
                        .units
                        .iter()
                        .position(|u| profile.accepts(u.sub_task.assigned_label().as_ref()))
                    {
                        let Some(slot) = pending.units.remove(pos) else {
                            continue;
                        };
                        let unit = WorkUnit {
                            item_id: item.id,
                            task_id: item.task.id(),
                            sub_task: slot.sub_task,
                            is_main: slot.is_main,
                            context: pending.context.clone(),
                        };
                        Some((unit, pending.units.is_empty()))
                    } else {
                        None
                    }
                }
                _ => None,
            };

            if let Some((unit, drained)) = claimed {
                if drained {
                    // all units handed out: the item has left the queue
                    state.items.remove(&id);
                    debug!(item = %id, "item left the queue");
                }
                return Some((unit, !drained));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraph;
    use async_trait::async_trait;
    use foreman_core::{Cause, Interrupt, PermitAll};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::timeout;

    struct NoActivity;

    #[async_trait]
    impl BuildActivity for NoActivity {
        async fn is_building(&self, _task: &TaskId) -> bool {
            false
        }
    }

    struct NoopExecutable;

    #[async_trait]
    impl Executable for NoopExecutable {
        async fn run(&self, _interrupt: Interrupt) -> Result<()> {
            Ok(())
        }
    }

    struct TestTask {
        id: TaskId,
        concurrent: bool,
        label: Option<Label>,
        extra_units: usize,
        same_node: bool,
    }

    impl TestTask {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: TaskId::new(id),
                concurrent: false,
                label: None,
                extra_units: 0,
                same_node: false,
            })
        }
    }

    struct TestUnit {
        owner: TaskId,
        label: Option<Label>,
    }

    impl SubTask for TestUnit {
        fn owner(&self) -> TaskId {
            self.owner.clone()
        }

        fn display_name(&self) -> String {
            format!("{} (axis)", self.owner)
        }

        fn assigned_label(&self) -> Option<Label> {
            self.label.clone()
        }

        fn create_executable(&self) -> Result<Box<dyn Executable>> {
            Ok(Box::new(NoopExecutable))
        }
    }

    impl Task for TestTask {
        fn id(&self) -> TaskId {
            self.id.clone()
        }

        fn concurrent_build(&self) -> bool {
            self.concurrent
        }

        fn assigned_label(&self) -> Option<Label> {
            self.label.clone()
        }

        fn same_node_constraint(&self) -> Option<foreman_core::SameNodeConstraint> {
            self.same_node
                .then(|| foreman_core::SameNodeConstraint::new(self.id.as_str()))
        }

        fn sub_tasks(&self) -> Vec<Arc<dyn SubTask>> {
            (0..self.extra_units)
                .map(|_| {
                    Arc::new(TestUnit {
                        owner: self.id.clone(),
                        label: None,
                    }) as Arc<dyn SubTask>
                })
                .collect()
        }

        fn create_executable(&self) -> Result<Box<dyn Executable>> {
            Ok(Box::new(NoopExecutable))
        }
    }

    fn queue() -> Queue {
        Queue::new(Arc::new(PermitAll))
    }

    fn profile(node: &str, labels: &[&str]) -> ExecutorProfile {
        ExecutorProfile {
            node: node.to_string(),
            labels: labels.iter().map(|l| Label::new(*l)).collect(),
        }
    }

    async fn make_buildable(queue: &Queue) {
        queue.maintain(&DependencyGraph::empty(), &NoActivity).await;
    }

    #[tokio::test]
    async fn test_duplicate_submission_merges_for_non_concurrent_task() {
        let q = queue();
        let task = TestTask::new("app");

        let first = q
            .schedule(
                task.clone(),
                Duration::ZERO,
                vec![Action::Cause(Cause::ScmChange)],
            )
            .await
            .unwrap();
        let second = q
            .schedule(
                task.clone(),
                Duration::ZERO,
                vec![Action::Cause(Cause::UserTriggered {
                    user: "alice".to_string(),
                })],
            )
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(q.len().await, 1);
        let snapshot = q.item_for(&task.id()).await.unwrap();
        assert_eq!(snapshot.actions.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_task_gets_separate_items() {
        let q = queue();
        let task = Arc::new(TestTask {
            id: TaskId::new("app"),
            concurrent: true,
            label: None,
            extra_units: 0,
            same_node: false,
        });

        q.schedule(task.clone(), Duration::ZERO, Vec::new()).await;
        q.schedule(task.clone(), Duration::ZERO, Vec::new()).await;
        assert_eq!(q.len().await, 2);
    }

    #[tokio::test]
    async fn test_unbuildable_task_is_refused() {
        struct Disabled;
        impl Task for Disabled {
            fn id(&self) -> TaskId {
                TaskId::new("disabled")
            }
            fn is_buildable(&self) -> bool {
                false
            }
            fn create_executable(&self) -> Result<Box<dyn Executable>> {
                Ok(Box::new(NoopExecutable))
            }
        }

        let q = queue();
        let id = q
            .schedule(Arc::new(Disabled), Duration::ZERO, Vec::new())
            .await;
        assert!(id.is_none());
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_quiet_period_defers_buildability() {
        let q = queue();
        let task = TestTask::new("app");
        q.schedule(task.clone(), Duration::from_millis(200), Vec::new())
            .await;

        make_buildable(&q).await;
        assert_eq!(
            q.item_for(&task.id()).await.unwrap().phase,
            ItemPhase::Waiting
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        make_buildable(&q).await;
        assert_eq!(
            q.item_for(&task.id()).await.unwrap().phase,
            ItemPhase::Buildable
        );
    }

    #[tokio::test]
    async fn test_pop_blocks_until_an_item_is_buildable() {
        let q = Arc::new(queue());
        let task = TestTask::new("app");

        let popper = q.clone();
        let prof = profile("built-in", &[]);
        let waiter = tokio::spawn(async move { popper.pop(&prof).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        q.schedule(task.clone(), Duration::ZERO, Vec::new()).await;
        make_buildable(&q).await;

        let unit = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unit.task_id, task.id());
        assert!(unit.is_main);
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_pop_respects_labels() {
        let q = queue();
        let task = Arc::new(TestTask {
            id: TaskId::new("app"),
            concurrent: false,
            label: Some(Label::new("arm64")),
            extra_units: 0,
            same_node: false,
        });
        q.schedule(task, Duration::ZERO, Vec::new()).await;
        make_buildable(&q).await;

        // wrong label never matches
        let wrong = timeout(
            Duration::from_millis(100),
            q.pop(&profile("built-in", &["linux"])),
        )
        .await;
        assert!(wrong.is_err());

        let unit = timeout(
            Duration::from_secs(1),
            q.pop(&profile("arm-agent", &["arm64"])),
        )
        .await
        .unwrap();
        assert_eq!(unit.task_id, TaskId::new("app"));
    }

    #[tokio::test]
    async fn test_buildable_items_are_claimed_in_submission_order() {
        let q = queue();
        let first = TestTask::new("first");
        let second = TestTask::new("second");
        q.schedule(first.clone(), Duration::ZERO, Vec::new()).await;
        q.schedule(second.clone(), Duration::ZERO, Vec::new()).await;
        make_buildable(&q).await;

        let prof = profile("built-in", &[]);
        assert_eq!(q.pop(&prof).await.task_id, first.id());
        assert_eq!(q.pop(&prof).await.task_id, second.id());
    }

    #[tokio::test]
    async fn test_multi_unit_item_hands_out_every_unit_before_leaving() {
        let q = queue();
        let task = Arc::new(TestTask {
            id: TaskId::new("matrix"),
            concurrent: false,
            label: None,
            extra_units: 2,
            same_node: false,
        });
        q.schedule(task, Duration::ZERO, Vec::new()).await;
        make_buildable(&q).await;

        let prof = profile("built-in", &[]);
        let a = q.pop(&prof).await;
        assert!(a.is_main);
        assert!(!q.is_empty().await); // two units still pending
        let b = q.pop(&prof).await;
        let c = q.pop(&prof).await;
        assert!(!b.is_main);
        assert!(!c.is_main);
        assert!(q.is_empty().await);

        // completion fires only when the last unit reports
        assert!(
            a.context
                .unit_finished(Duration::ZERO, BuildOutcome::Success, None)
                .is_none()
        );
        assert!(
            b.context
                .unit_finished(Duration::ZERO, BuildOutcome::Aborted, None)
                .is_none()
        );
        let completion = c
            .context
            .unit_finished(Duration::ZERO, BuildOutcome::Success, None)
            .unwrap();
        assert_eq!(completion.outcome, BuildOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_same_node_constraint_pins_remaining_units() {
        let q = queue();
        let task = Arc::new(TestTask {
            id: TaskId::new("matrix"),
            concurrent: false,
            label: None,
            extra_units: 1,
            same_node: true,
        });
        q.schedule(task, Duration::ZERO, Vec::new()).await;
        make_buildable(&q).await;

        let _first = q.pop(&profile("node-a", &[])).await;

        // a different node must not receive the remaining unit
        let other = timeout(Duration::from_millis(100), q.pop(&profile("node-b", &[]))).await;
        assert!(other.is_err());

        let second = timeout(Duration::from_secs(1), q.pop(&profile("node-a", &[]))).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_removes_waiting_item_only() {
        let q = queue();
        let task = TestTask::new("app");
        q.schedule(task.clone(), Duration::ZERO, Vec::new()).await;

        assert!(q.cancel(&task.id()).await.unwrap());
        assert!(q.is_empty().await);
        // nothing left to cancel
        assert!(!q.cancel(&task.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_is_permission_gated() {
        struct DenyAll;
        impl AccessControl for DenyAll {
            fn can_cancel(&self, _task: &TaskId) -> bool {
                false
            }
        }

        let q = Queue::new(Arc::new(DenyAll));
        let task = TestTask::new("app");
        q.schedule(task.clone(), Duration::ZERO, Vec::new()).await;

        assert!(matches!(
            q.cancel(&task.id()).await,
            Err(Error::PermissionDenied(_))
        ));
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn test_clear_flushes_not_yet_started_items() {
        let q = queue();
        q.schedule(TestTask::new("a"), Duration::ZERO, Vec::new())
            .await;
        q.schedule(TestTask::new("b"), Duration::ZERO, Vec::new())
            .await;

        assert_eq!(q.clear().await.unwrap(), 2);
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_maintain_blocks_item_when_downstream_is_queued() {
        use crate::graph::GraphBuilder;
        use foreman_core::Dependency;

        struct BlockingTask(TaskId);
        impl Task for BlockingTask {
            fn id(&self) -> TaskId {
                self.0.clone()
            }
            fn block_when_downstream_building(&self) -> bool {
                true
            }
            fn create_executable(&self) -> Result<Box<dyn Executable>> {
                Ok(Box::new(NoopExecutable))
            }
        }

        let q = queue();
        let mut builder = GraphBuilder::new();
        builder.add(Dependency::new("a", "b"));
        let graph = builder.build();

        q.schedule(
            Arc::new(BlockingTask(TaskId::new("a"))),
            Duration::ZERO,
            Vec::new(),
        )
        .await;
        q.schedule(TestTask::new("b"), Duration::ZERO, Vec::new())
            .await;

        q.maintain(&graph, &NoActivity).await;

        let a = q.item_for(&TaskId::new("a")).await.unwrap();
        assert_eq!(a.phase, ItemPhase::Blocked);
        assert!(a.why.contains("downstream task b"));

        // once b is gone, a becomes buildable
        q.cancel(&TaskId::new("b")).await.unwrap();
        q.maintain(&graph, &NoActivity).await;
        assert_eq!(
            q.item_for(&TaskId::new("a")).await.unwrap().phase,
            ItemPhase::Buildable
        );
    }

    #[tokio::test]
    async fn test_maintain_blocks_item_while_self_is_building() {
        struct SelfBusy(AtomicBool);

        #[async_trait]
        impl BuildActivity for SelfBusy {
            async fn is_building(&self, task: &TaskId) -> bool {
                task == &TaskId::new("app") && self.0.load(Ordering::SeqCst)
            }
        }

        let q = queue();
        let activity = SelfBusy(AtomicBool::new(true));
        let task = TestTask::new("app");
        q.schedule(task.clone(), Duration::ZERO, Vec::new()).await;

        q.maintain(&DependencyGraph::empty(), &activity).await;
        assert_eq!(
            q.item_for(&task.id()).await.unwrap().phase,
            ItemPhase::Blocked
        );

        // oscillation back to buildable once the running build finishes
        activity.0.store(false, Ordering::SeqCst);
        q.maintain(&DependencyGraph::empty(), &activity).await;
        assert_eq!(
            q.item_for(&task.id()).await.unwrap().phase,
            ItemPhase::Buildable
        );
    }
}

//! Executors, nodes and the executor pool.
//!
//! An executor is one concurrent build slot on a node. Executors are plain
//! structs driven by a spawned loop: pop a work unit, run its executable in
//! a child task, report the result. A panicking executable fails the one
//! build; only a panic of the loop itself marks the executor dead, which a
//! supervisor task records so the pool can surface and replace it.

use crate::blockage::BuildActivity;
use crate::queue::{ExecutorProfile, Queue, WorkUnit};
use crate::workspace::{WorkspaceLease, WorkspaceList};
use async_trait::async_trait;
use foreman_config::{NodeConfig, SchedulerConfig};
use foreman_core::{
    AccessControl, BuildCompletion, BuildOutcome, Error, Interrupt, ItemId, Label, Result,
    SubTask, Task, TaskId,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

tokio::task_local! {
    static CURRENT_EXECUTOR: ExecutorIdentity;
}

/// Which executor slot is running the current code, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutorIdentity {
    pub node: String,
    pub number: usize,
}

/// The executor identity of the calling task, set while an executable
/// runs. `None` outside of build execution.
pub fn current_executor() -> Option<ExecutorIdentity> {
    CURRENT_EXECUTOR.try_with(Clone::clone).ok()
}

/// Run `future` with [`current_executor`] reporting `identity`.
pub async fn impersonate<F: Future>(identity: ExecutorIdentity, future: F) -> F::Output {
    CURRENT_EXECUTOR.scope(identity, future).await
}

/// A worker node: a named set of executor slots sharing labels and a
/// workspace root.
#[derive(Debug)]
pub struct Node {
    name: String,
    labels: HashSet<Label>,
    // watch channel so blocked executors notice shrinks immediately
    desired_executors: watch::Sender<usize>,
    workspace_root: PathBuf,
    workspaces: WorkspaceList,
}

impl Node {
    pub fn from_config(config: &NodeConfig) -> Arc<Self> {
        let (desired_executors, _) = watch::channel(config.executors);
        Arc::new(Self {
            name: config.name.clone(),
            labels: config.labels.iter().map(Label::new).collect(),
            desired_executors,
            workspace_root: config
                .workspace_root
                .clone()
                .unwrap_or_else(|| PathBuf::from("workspaces").join(&config.name)),
            workspaces: WorkspaceList::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn labels(&self) -> &HashSet<Label> {
        &self.labels
    }

    pub fn desired_executors(&self) -> usize {
        *self.desired_executors.borrow()
    }

    /// Completes once `number` is no longer a wanted slot.
    async fn surplus(&self, number: usize) {
        let mut desired = self.desired_executors.subscribe();
        loop {
            if number >= *desired.borrow_and_update() {
                return;
            }
            if desired.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn workspaces(&self) -> &WorkspaceList {
        &self.workspaces
    }

    fn profile(&self) -> ExecutorProfile {
        ExecutorProfile {
            node: self.name.clone(),
            labels: self.labels.clone(),
        }
    }

    /// Lease a workspace directory for one build of `task`. Non-concurrent
    /// tasks wait for the task's directory; concurrent builds take the
    /// first free numbered sibling, which always exists because in-flight
    /// builds are bounded by the executor count.
    pub async fn lease_workspace(&self, task: &TaskId, concurrent: bool) -> WorkspaceLease {
        let base = self.workspace_root.join(task.as_str());
        if !concurrent {
            return self.workspaces.acquire(base, true).await;
        }
        let mut n: u32 = 1;
        loop {
            let path = if n == 1 {
                base.clone()
            } else {
                self.workspace_root.join(format!("{}@{}", task, n))
            };
            if let Some(lease) = self.workspaces.try_acquire(path, true) {
                return lease;
            }
            n += 1;
        }
    }
}

enum ExecutorState {
    Idle,
    Busy {
        task: TaskId,
        item: ItemId,
        started: Instant,
        estimated: Option<Duration>,
        interrupt: Interrupt,
    },
    Dead {
        cause: String,
    },
}

/// Serializable view of one executor slot for the UI/API layer.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorSnapshot {
    pub node: String,
    pub number: usize,
    pub state: ExecutorStateSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ExecutorStateSnapshot {
    Idle,
    Busy {
        task: TaskId,
        item: ItemId,
        progress_percent: Option<u8>,
        likely_stuck: bool,
    },
    Dead {
        cause: String,
    },
}

/// Elapsed time as a percentage of the estimate, capped at 99 because a
/// build is never done until it reports. `None` without a usable estimate.
pub fn progress_percent(elapsed: Duration, estimated: Option<Duration>) -> Option<u8> {
    let estimated = estimated.filter(|e| !e.is_zero())?;
    let percent = (elapsed.as_secs_f64() / estimated.as_secs_f64() * 100.0) as u64;
    Some(percent.min(99) as u8)
}

/// Heuristic for builds that will probably never finish: ten times the
/// estimate, or a day when no estimate exists.
pub fn likely_stuck(elapsed: Duration, estimated: Option<Duration>) -> bool {
    match estimated.filter(|e| !e.is_zero()) {
        Some(estimated) => elapsed > estimated * 10,
        None => elapsed > Duration::from_secs(60 * 60 * 24),
    }
}

/// One build slot. Cheap to clone; all clones share the slot's state.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    number: usize,
    node: Arc<Node>,
    state: Mutex<ExecutorState>,
    abort: OnceLock<AbortHandle>,
}

impl Executor {
    fn new(node: Arc<Node>, number: usize) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                number,
                node,
                state: Mutex::new(ExecutorState::Idle),
                abort: OnceLock::new(),
            }),
        }
    }

    pub fn number(&self) -> usize {
        self.inner.number
    }

    pub fn node_name(&self) -> &str {
        self.inner.node.name()
    }

    pub async fn is_idle(&self) -> bool {
        matches!(*self.inner.state.lock().await, ExecutorState::Idle)
    }

    pub async fn is_dead(&self) -> bool {
        matches!(*self.inner.state.lock().await, ExecutorState::Dead { .. })
    }

    pub async fn current_task(&self) -> Option<TaskId> {
        match &*self.inner.state.lock().await {
            ExecutorState::Busy { task, .. } => Some(task.clone()),
            _ => None,
        }
    }

    pub async fn snapshot(&self) -> ExecutorSnapshot {
        let state = match &*self.inner.state.lock().await {
            ExecutorState::Idle => ExecutorStateSnapshot::Idle,
            ExecutorState::Busy {
                task,
                item,
                started,
                estimated,
                ..
            } => {
                let elapsed = started.elapsed();
                ExecutorStateSnapshot::Busy {
                    task: task.clone(),
                    item: *item,
                    progress_percent: progress_percent(elapsed, *estimated),
                    likely_stuck: likely_stuck(elapsed, *estimated),
                }
            }
            ExecutorState::Dead { cause } => ExecutorStateSnapshot::Dead {
                cause: cause.clone(),
            },
        };
        ExecutorSnapshot {
            node: self.inner.node.name().to_string(),
            number: self.inner.number,
            state,
        }
    }

    /// Request a graceful stop of whatever build this executor is running.
    /// The running executable observes the interrupt and unwinds; the
    /// build completes as aborted. Returns `false` when the slot is not
    /// busy.
    pub async fn stop(&self, access: &dyn AccessControl) -> Result<bool> {
        let state = self.inner.state.lock().await;
        if let ExecutorState::Busy {
            task, interrupt, ..
        } = &*state
        {
            if !access.can_stop(task) {
                return Err(Error::PermissionDenied(format!(
                    "not allowed to stop {}",
                    task
                )));
            }
            info!(
                node = %self.inner.node.name(),
                executor = self.inner.number,
                task = %task,
                "stopping running build"
            );
            interrupt.raise();
            return Ok(true);
        }
        Ok(false)
    }

    pub(crate) async fn stop_if_building(
        &self,
        task: &TaskId,
        access: &dyn AccessControl,
    ) -> Result<bool> {
        let state = self.inner.state.lock().await;
        if let ExecutorState::Busy {
            task: current,
            interrupt,
            ..
        } = &*state
        {
            if current == task {
                if !access.can_stop(task) {
                    return Err(Error::PermissionDenied(format!(
                        "not allowed to stop {}",
                        task
                    )));
                }
                info!(
                    node = %self.inner.node.name(),
                    executor = self.inner.number,
                    task = %task,
                    "stopping running build"
                );
                interrupt.raise();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Hard-abort the executor's loop without waiting for the running
    /// executable. The supervisor records the slot as dead. Last-resort
    /// administrative action; `stop` is the graceful path.
    pub fn kill(&self) {
        if let Some(abort) = self.inner.abort.get() {
            abort.abort();
        }
    }

    async fn run_loop(self, pool: Arc<PoolInner>) {
        let profile = self.inner.node.profile();
        loop {
            // shrunk below our slot number: retire quietly
            if self.inner.number >= self.inner.node.desired_executors() {
                if pool.retire_if_surplus(&self).await {
                    debug!(
                        node = %self.inner.node.name(),
                        executor = self.inner.number,
                        "executor retiring"
                    );
                    return;
                }
                // resized back up before we got the lock
                continue;
            }
            let unit = tokio::select! {
                unit = pool.queue.pop(&profile) => unit,
                _ = self.inner.node.surplus(self.inner.number) => continue,
            };
            self.execute(&pool, unit).await;
            if let Some(events) = pool.events.get() {
                events.on_executor_idle().await;
            }
        }
    }

    async fn execute(&self, pool: &PoolInner, unit: WorkUnit) {
        let started = Instant::now();
        let task_id = unit.task_id.clone();
        pool.mark_building(&task_id, true).await;

        let (outcome, problem) = match unit.sub_task.create_executable() {
            Err(err) => {
                warn!(
                    task = %task_id,
                    item = %unit.item_id,
                    error = %err,
                    "failed to create executable"
                );
                (
                    BuildOutcome::Failure,
                    Some(format!("failed to create executable: {}", err)),
                )
            }
            Ok(executable) => {
                let interrupt = Interrupt::new();
                let estimated = executable
                    .estimated_duration()
                    .or_else(|| unit.sub_task.estimated_duration());
                *self.inner.state.lock().await = ExecutorState::Busy {
                    task: task_id.clone(),
                    item: unit.item_id,
                    started,
                    estimated,
                    interrupt: interrupt.clone(),
                };
                info!(
                    node = %self.inner.node.name(),
                    executor = self.inner.number,
                    task = %task_id,
                    item = %unit.item_id,
                    "build started"
                );

                let lease = self
                    .inner
                    .node
                    .lease_workspace(&task_id, unit.context.task().concurrent_build())
                    .await;
                let identity = ExecutorIdentity {
                    node: self.inner.node.name().to_string(),
                    number: self.inner.number,
                };
                let child_interrupt = interrupt.clone();
                // run in a child task so an executable panic fails the
                // build, not the executor
                let handle = tokio::spawn(impersonate(identity, async move {
                    executable.run(child_interrupt).await
                }));
                let result = handle.await;
                drop(lease);

                match result {
                    Ok(Ok(())) => (BuildOutcome::Success, None),
                    Ok(Err(Error::Cancelled)) => (BuildOutcome::Aborted, None),
                    Ok(Err(err)) => (BuildOutcome::Failure, Some(err.to_string())),
                    Err(join) if join.is_panic() => {
                        warn!(task = %task_id, item = %unit.item_id, "executable panicked");
                        (BuildOutcome::Failure, Some("executable panicked".to_string()))
                    }
                    Err(_) => (BuildOutcome::Aborted, None),
                }
            }
        };

        *self.inner.state.lock().await = ExecutorState::Idle;
        pool.mark_building(&task_id, false).await;
        info!(
            node = %self.inner.node.name(),
            executor = self.inner.number,
            task = %task_id,
            item = %unit.item_id,
            ?outcome,
            "work unit done"
        );

        if let Some(completion) = unit.context.unit_finished(started.elapsed(), outcome, problem) {
            if let Some(events) = pool.events.get() {
                events.on_completed(completion).await;
            }
        }
    }
}

/// Hooks the pool calls back into as builds finish and slots free up.
#[async_trait]
pub trait SchedulerEvents: Send + Sync {
    /// The last work unit of a build reported in.
    async fn on_completed(&self, completion: BuildCompletion);

    /// An executor finished a unit and is about to ask for more work.
    async fn on_executor_idle(&self);
}

struct PoolInner {
    queue: Arc<Queue>,
    nodes: Vec<Arc<Node>>,
    executors: Mutex<Vec<Executor>>,
    // task -> number of currently running work units
    building: Mutex<HashMap<TaskId, usize>>,
    events: OnceLock<Arc<dyn SchedulerEvents>>,
}

impl PoolInner {
    fn spawn_executor(inner: &Arc<PoolInner>, node: Arc<Node>, number: usize) -> Executor {
        let executor = Executor::new(node, number);
        let handle = tokio::spawn(executor.clone().run_loop(inner.clone()));
        let _ = executor.inner.abort.set(handle.abort_handle());

        // supervisor: a loop that ends abnormally leaves a dead slot
        // behind instead of silently shrinking capacity
        let watched = executor.clone();
        tokio::spawn(async move {
            if let Err(err) = handle.await {
                let cause = if err.is_panic() {
                    "executor loop panicked"
                } else {
                    "executor loop aborted"
                };
                warn!(
                    node = %watched.inner.node.name(),
                    executor = watched.inner.number,
                    cause,
                    "executor died"
                );
                *watched.inner.state.lock().await = ExecutorState::Dead {
                    cause: cause.to_string(),
                };
            }
        });

        executor
    }

    /// Remove a surplus slot, unless the node has been resized back up
    /// since the slot noticed the shrink. Returns whether it retired.
    async fn retire_if_surplus(&self, executor: &Executor) -> bool {
        let mut executors = self.executors.lock().await;
        if executor.inner.number < executor.inner.node.desired_executors() {
            return false;
        }
        executors.retain(|e| !Arc::ptr_eq(&e.inner, &executor.inner));
        true
    }

    async fn mark_building(&self, task: &TaskId, building: bool) {
        let mut map = self.building.lock().await;
        if building {
            *map.entry(task.clone()).or_insert(0) += 1;
        } else if let Some(count) = map.get_mut(task) {
            *count -= 1;
            if *count == 0 {
                map.remove(task);
            }
        }
    }
}

/// All executor slots across all configured nodes.
#[derive(Clone)]
pub struct ExecutorPool {
    inner: Arc<PoolInner>,
}

impl ExecutorPool {
    pub fn new(queue: Arc<Queue>, config: &SchedulerConfig) -> Self {
        let nodes = config.nodes.iter().map(Node::from_config).collect();
        Self {
            inner: Arc::new(PoolInner {
                queue,
                nodes,
                executors: Mutex::new(Vec::new()),
                building: Mutex::new(HashMap::new()),
                events: OnceLock::new(),
            }),
        }
    }

    /// Spawn the configured executors. Events fire on the given hooks from
    /// here on; calling `start` twice keeps the first hooks.
    pub async fn start(&self, events: Arc<dyn SchedulerEvents>) {
        let _ = self.inner.events.set(events);
        let mut executors = self.inner.executors.lock().await;
        for node in &self.inner.nodes {
            for number in 0..node.desired_executors() {
                executors.push(PoolInner::spawn_executor(&self.inner, node.clone(), number));
            }
        }
        info!(
            nodes = self.inner.nodes.len(),
            executors = executors.len(),
            "executor pool started"
        );
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.inner.nodes
    }

    pub async fn executors(&self) -> Vec<Executor> {
        self.inner.executors.lock().await.clone()
    }

    pub async fn snapshots(&self) -> Vec<ExecutorSnapshot> {
        let executors = self.executors().await;
        let mut snapshots = Vec::with_capacity(executors.len());
        for executor in executors {
            snapshots.push(executor.snapshot().await);
        }
        snapshots
    }

    /// Resize one node's executor count. Growing fills slot numbers not
    /// held by a live executor; shrinking lets surplus slots retire once
    /// they next go looking for work, so running builds finish normally.
    /// A slot still winding down from an earlier shrink keeps its number
    /// and is reused rather than doubled up.
    pub async fn set_executor_count(&self, node_name: &str, count: usize) -> Result<()> {
        let node = self
            .inner
            .nodes
            .iter()
            .find(|n| n.name() == node_name)
            .ok_or_else(|| Error::Internal(format!("unknown node '{}'", node_name)))?
            .clone();
        let mut executors = self.inner.executors.lock().await;
        let previous = node.desired_executors.send_replace(count);
        info!(node = %node_name, previous, count, "executor count changed");
        if count > previous {
            let mut occupied = HashSet::new();
            for executor in executors.iter() {
                if executor.node_name() == node_name && !executor.is_dead().await {
                    occupied.insert(executor.number());
                }
            }
            for number in 0..count {
                if !occupied.contains(&number) {
                    executors.push(PoolInner::spawn_executor(&self.inner, node.clone(), number));
                }
            }
        }
        Ok(())
    }

    /// Gracefully stop the running build of `task`, if any executor has
    /// it. Permission-gated.
    pub async fn stop(&self, task: &TaskId, access: &dyn AccessControl) -> Result<bool> {
        let executors = self.executors().await;
        let mut stopped = false;
        for executor in executors {
            stopped |= executor.stop_if_building(task, access).await?;
        }
        Ok(stopped)
    }

    /// Drop dead slots from the pool. Returns how many were removed.
    pub async fn remove_dead(&self) -> usize {
        let mut executors = self.inner.executors.lock().await;
        let mut kept = Vec::with_capacity(executors.len());
        let mut removed = 0;
        for executor in executors.drain(..) {
            if executor.is_dead().await {
                removed += 1;
            } else {
                kept.push(executor);
            }
        }
        *executors = kept;
        if removed > 0 {
            info!(removed, "removed dead executors");
        }
        removed
    }
}

#[async_trait]
impl BuildActivity for ExecutorPool {
    async fn is_building(&self, task: &TaskId) -> bool {
        self.inner
            .building
            .lock()
            .await
            .get(task)
            .is_some_and(|count| *count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraph;
    use foreman_core::{Executable, PermitAll};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    #[test]
    fn test_progress_is_capped_below_done() {
        let estimate = Some(Duration::from_secs(100));
        assert_eq!(progress_percent(Duration::from_secs(50), estimate), Some(50));
        assert_eq!(progress_percent(Duration::from_secs(500), estimate), Some(99));
        assert_eq!(progress_percent(Duration::from_secs(50), None), None);
        assert_eq!(
            progress_percent(Duration::from_secs(50), Some(Duration::ZERO)),
            None
        );
    }

    #[test]
    fn test_stuck_detection_uses_estimate_when_available() {
        let estimate = Some(Duration::from_secs(10));
        assert!(!likely_stuck(Duration::from_secs(60), estimate));
        assert!(likely_stuck(Duration::from_secs(101), estimate));
        assert!(!likely_stuck(Duration::from_secs(60 * 60), None));
        assert!(likely_stuck(Duration::from_secs(25 * 60 * 60), None));
    }

    enum Behavior {
        Succeed,
        Panic,
        WaitForInterrupt,
        RefuseInstantiation,
    }

    struct TestTask {
        id: TaskId,
        behavior: Behavior,
        saw_identity: Arc<AtomicBool>,
    }

    impl TestTask {
        fn new(id: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                id: TaskId::new(id),
                behavior,
                saw_identity: Arc::new(AtomicBool::new(false)),
            })
        }
    }

    impl Task for TestTask {
        fn id(&self) -> TaskId {
            self.id.clone()
        }

        fn create_executable(&self) -> Result<Box<dyn Executable>> {
            match self.behavior {
                Behavior::RefuseInstantiation => {
                    Err(Error::Instantiation("missing toolchain".to_string()))
                }
                Behavior::Succeed => Ok(Box::new(TestExecutable {
                    panic: false,
                    wait: false,
                    saw_identity: self.saw_identity.clone(),
                })),
                Behavior::Panic => Ok(Box::new(TestExecutable {
                    panic: true,
                    wait: false,
                    saw_identity: self.saw_identity.clone(),
                })),
                Behavior::WaitForInterrupt => Ok(Box::new(TestExecutable {
                    panic: false,
                    wait: true,
                    saw_identity: self.saw_identity.clone(),
                })),
            }
        }
    }

    struct TestExecutable {
        panic: bool,
        wait: bool,
        saw_identity: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Executable for TestExecutable {
        async fn run(&self, interrupt: Interrupt) -> Result<()> {
            self.saw_identity
                .store(current_executor().is_some(), Ordering::SeqCst);
            if self.panic {
                panic!("boom");
            }
            if self.wait {
                interrupt.raised().await;
                return Err(Error::Cancelled);
            }
            Ok(())
        }
    }

    struct Recorder {
        completions: mpsc::UnboundedSender<BuildCompletion>,
    }

    #[async_trait]
    impl SchedulerEvents for Recorder {
        async fn on_completed(&self, completion: BuildCompletion) {
            let _ = self.completions.send(completion);
        }

        async fn on_executor_idle(&self) {}
    }

    struct NoActivity;

    #[async_trait]
    impl BuildActivity for NoActivity {
        async fn is_building(&self, _task: &TaskId) -> bool {
            false
        }
    }

    fn single_node_config() -> SchedulerConfig {
        SchedulerConfig {
            default_quiet_period_secs: 0,
            maintenance_interval_secs: 60,
            nodes: vec![NodeConfig {
                name: "built-in".to_string(),
                executors: 1,
                labels: Vec::new(),
                workspace_root: None,
            }],
        }
    }

    async fn started_pool() -> (
        Arc<Queue>,
        ExecutorPool,
        mpsc::UnboundedReceiver<BuildCompletion>,
    ) {
        let queue = Arc::new(Queue::new(Arc::new(PermitAll)));
        let pool = ExecutorPool::new(queue.clone(), &single_node_config());
        let (tx, rx) = mpsc::unbounded_channel();
        pool.start(Arc::new(Recorder { completions: tx })).await;
        (queue, pool, rx)
    }

    #[tokio::test]
    async fn test_runs_queued_build_and_reports_completion() {
        let (queue, pool, mut completions) = started_pool().await;
        let task = TestTask::new("app", Behavior::Succeed);

        queue
            .schedule(task.clone(), Duration::ZERO, Vec::new())
            .await;
        queue
            .maintain(&DependencyGraph::empty(), &NoActivity)
            .await;

        let completion = timeout(Duration::from_secs(5), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.task, task.id());
        assert_eq!(completion.outcome, BuildOutcome::Success);
        assert!(task.saw_identity.load(Ordering::SeqCst));
        assert!(!pool.is_building(&task.id()).await);
    }

    #[tokio::test]
    async fn test_executable_panic_fails_the_build_not_the_executor() {
        let (queue, pool, mut completions) = started_pool().await;
        let task = TestTask::new("flaky", Behavior::Panic);

        queue
            .schedule(task.clone(), Duration::ZERO, Vec::new())
            .await;
        queue
            .maintain(&DependencyGraph::empty(), &NoActivity)
            .await;

        let completion = timeout(Duration::from_secs(5), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.outcome, BuildOutcome::Failure);
        assert!(completion.problems.iter().any(|p| p.contains("panicked")));

        // the slot survives and picks up further work
        let next = TestTask::new("next", Behavior::Succeed);
        queue
            .schedule(next.clone(), Duration::ZERO, Vec::new())
            .await;
        queue
            .maintain(&DependencyGraph::empty(), &NoActivity)
            .await;
        let completion = timeout(Duration::from_secs(5), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.task, next.id());
        assert!(pool.remove_dead().await == 0);
    }

    #[tokio::test]
    async fn test_instantiation_failure_completes_as_failed() {
        let (queue, _pool, mut completions) = started_pool().await;
        let task = TestTask::new("broken", Behavior::RefuseInstantiation);

        queue
            .schedule(task.clone(), Duration::ZERO, Vec::new())
            .await;
        queue
            .maintain(&DependencyGraph::empty(), &NoActivity)
            .await;

        let completion = timeout(Duration::from_secs(5), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.outcome, BuildOutcome::Failure);
        assert!(
            completion
                .problems
                .iter()
                .any(|p| p.contains("failed to create executable"))
        );
    }

    #[tokio::test]
    async fn test_stop_interrupts_running_build() {
        let (queue, pool, mut completions) = started_pool().await;
        let task = TestTask::new("slow", Behavior::WaitForInterrupt);

        queue
            .schedule(task.clone(), Duration::ZERO, Vec::new())
            .await;
        queue
            .maintain(&DependencyGraph::empty(), &NoActivity)
            .await;

        // retry until the build occupies the slot
        timeout(Duration::from_secs(5), async {
            while !pool.stop(&task.id(), &PermitAll).await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let completion = timeout(Duration::from_secs(5), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.outcome, BuildOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_stop_is_permission_gated() {
        struct DenyAll;
        impl AccessControl for DenyAll {
            fn can_stop(&self, _task: &TaskId) -> bool {
                false
            }
        }

        let (queue, pool, _completions) = started_pool().await;
        let task = TestTask::new("slow", Behavior::WaitForInterrupt);

        queue
            .schedule(task.clone(), Duration::ZERO, Vec::new())
            .await;
        queue
            .maintain(&DependencyGraph::empty(), &NoActivity)
            .await;
        // wait for the build to occupy the slot
        timeout(Duration::from_secs(5), async {
            loop {
                let executors = pool.executors().await;
                if executors[0].current_task().await.as_ref() == Some(&task.id()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            pool.stop(&task.id(), &DenyAll).await,
            Err(Error::PermissionDenied(_))
        ));
        // still running
        assert!(pool.is_building(&task.id()).await);
        pool.stop(&task.id(), &PermitAll).await.unwrap();
    }

    #[tokio::test]
    async fn test_killed_executor_is_recorded_dead_and_removable() {
        let (_queue, pool, _completions) = started_pool().await;

        let executors = pool.executors().await;
        assert_eq!(executors.len(), 1);
        executors[0].kill();

        timeout(Duration::from_secs(5), async {
            while !executors[0].is_dead().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let snapshot = executors[0].snapshot().await;
        assert!(matches!(
            snapshot.state,
            ExecutorStateSnapshot::Dead { .. }
        ));
        assert_eq!(pool.remove_dead().await, 1);
        assert!(pool.executors().await.is_empty());
    }

    #[tokio::test]
    async fn test_shrinking_retires_surplus_executors() {
        let (queue, pool, mut completions) = started_pool().await;
        pool.set_executor_count("built-in", 3).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while pool.executors().await.len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        pool.set_executor_count("built-in", 1).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while pool.executors().await.len() > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // the surviving slot still picks up work
        let task = TestTask::new("app", Behavior::Succeed);
        queue
            .schedule(task.clone(), Duration::ZERO, Vec::new())
            .await;
        queue
            .maintain(&DependencyGraph::empty(), &NoActivity)
            .await;
        let completion = timeout(Duration::from_secs(5), completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completion.task, task.id());
    }

    #[tokio::test]
    async fn test_shrink_then_grow_does_not_duplicate_busy_slots() {
        let (queue, pool, mut completions) = started_pool().await;
        pool.set_executor_count("built-in", 3).await.unwrap();

        // occupy all three slots with interrupt-gated builds
        let tasks: Vec<_> = (0..3)
            .map(|i| TestTask::new(&format!("app-{i}"), Behavior::WaitForInterrupt))
            .collect();
        for task in &tasks {
            queue
                .schedule(task.clone(), Duration::ZERO, Vec::new())
                .await;
        }
        queue
            .maintain(&DependencyGraph::empty(), &NoActivity)
            .await;
        timeout(Duration::from_secs(5), async {
            for task in &tasks {
                while !pool.is_building(&task.id()).await {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        })
        .await
        .unwrap();

        // busy slots cannot retire yet, so growing back must reuse them
        // instead of spawning doubles with the same numbers
        pool.set_executor_count("built-in", 1).await.unwrap();
        pool.set_executor_count("built-in", 3).await.unwrap();
        assert_eq!(pool.executors().await.len(), 3);

        for task in &tasks {
            timeout(Duration::from_secs(5), async {
                while !pool.stop(&task.id(), &PermitAll).await.unwrap() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();
        }
        for _ in &tasks {
            timeout(Duration::from_secs(5), completions.recv())
                .await
                .unwrap()
                .unwrap();
        }

        // the freed slots keep looping rather than retiring
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.executors().await.len(), 3);
    }
}

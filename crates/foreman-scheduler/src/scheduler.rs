//! The scheduler: queue, executor pool and dependency graph wired
//! together.
//!
//! One `Scheduler` instance owns the whole scheduling context. It is
//! created with `Arc::new_cyclic` so background work (maintenance ticks,
//! quiet-period timers, completion hooks) holds only weak references and
//! everything winds down once the last strong handle is dropped.

use crate::executor::{ExecutorPool, SchedulerEvents};
use crate::graph::{DependencyGraph, build_graph};
use crate::queue::{ItemSnapshot, Queue};
use async_trait::async_trait;
use foreman_config::SchedulerConfig;
use foreman_core::{
    AccessControl, Action, BuildCompletion, Cause, Error, ItemId, ProjectRegistry, Result, Task,
    TaskId,
};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<dyn ProjectRegistry>,
    access: Arc<dyn AccessControl>,
    queue: Arc<Queue>,
    pool: ExecutorPool,
    graph: RwLock<Arc<DependencyGraph>>,
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    /// Build a scheduler from configuration and the collaborator seams.
    /// Executors do not run until [`Scheduler::start`].
    pub fn new(
        config: SchedulerConfig,
        registry: Arc<dyn ProjectRegistry>,
        access: Arc<dyn AccessControl>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| {
            let queue = Arc::new(Queue::new(access.clone()));
            let pool = ExecutorPool::new(queue.clone(), &config);
            let graph = RwLock::new(Arc::new(build_graph(registry.as_ref())));
            Self {
                config,
                registry,
                access,
                queue,
                pool,
                graph,
                self_ref: self_ref.clone(),
            }
        })
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn pool(&self) -> &ExecutorPool {
        &self.pool
    }

    /// Spawn the executor pool and the periodic maintenance loop. The
    /// maintenance loop stops once the scheduler is dropped.
    pub async fn start(&self) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        self.pool.start(this).await;

        let interval = self.config.maintenance_interval();
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                scheduler.maintain().await;
            }
        });
        info!(
            maintenance_interval_secs = self.config.maintenance_interval_secs,
            "scheduler started"
        );
    }

    /// Submit a build of the task named `task_id`.
    ///
    /// `quiet_period` overrides both the task's own setting and the
    /// configured default. A duplicate submission returns the existing
    /// item's id; `Ok(None)` means the task refused scheduling.
    pub async fn schedule(
        &self,
        task_id: &TaskId,
        quiet_period: Option<Duration>,
        actions: Vec<Action>,
    ) -> Result<Option<ItemId>> {
        let task = self
            .registry
            .task(task_id)
            .ok_or_else(|| Error::UnknownTask(task_id.to_string()))?;
        Ok(self.schedule_task(task, quiet_period, actions).await)
    }

    async fn schedule_task(
        &self,
        task: Arc<dyn Task>,
        quiet_period: Option<Duration>,
        actions: Vec<Action>,
    ) -> Option<ItemId> {
        let quiet = quiet_period
            .or_else(|| task.quiet_period())
            .unwrap_or_else(|| self.config.default_quiet_period());
        let id = self.queue.schedule(task, quiet, actions).await?;

        // promote the item as soon as its quiet period elapses, rather
        // than waiting for the next periodic tick
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            if let Some(scheduler) = weak.upgrade() {
                scheduler.maintain().await;
            }
        });
        Some(id)
    }

    /// Remove the not-yet-started queue item of `task`, if any.
    pub async fn cancel(&self, task: &TaskId) -> Result<bool> {
        let cancelled = self.queue.cancel(task).await?;
        if cancelled {
            // items blocked on the cancelled one may now proceed
            self.maintain().await;
        }
        Ok(cancelled)
    }

    /// Gracefully stop the running build of `task`, if any.
    pub async fn stop(&self, task: &TaskId) -> Result<bool> {
        self.pool.stop(task, self.access.as_ref()).await
    }

    /// One maintenance pass: promote items whose quiet period elapsed and
    /// recompute blocking causes.
    pub async fn maintain(&self) {
        let graph = self.dependency_graph().await;
        self.queue.maintain(&graph, &self.pool).await;
    }

    /// Rebuild the dependency graph from the registry and swap it in.
    /// Readers that already hold the old snapshot keep using it; there is
    /// no intermediate half-built state.
    pub async fn rebuild_dependency_graph(&self) {
        let graph = Arc::new(build_graph(self.registry.as_ref()));
        *self.graph.write().await = graph;
        self.maintain().await;
    }

    /// The current dependency graph snapshot.
    pub async fn dependency_graph(&self) -> Arc<DependencyGraph> {
        self.graph.read().await.clone()
    }

    pub async fn queue_items(&self) -> Vec<ItemSnapshot> {
        self.queue.items().await
    }
}

#[async_trait]
impl SchedulerEvents for Scheduler {
    async fn on_completed(&self, completion: BuildCompletion) {
        info!(
            task = %completion.task,
            item = %completion.item_id,
            outcome = ?completion.outcome,
            "build completed"
        );

        let graph = self.dependency_graph().await;
        for group in graph.downstream_groups(&completion.task) {
            let Some(mut actions) = group.should_trigger(&completion) else {
                continue;
            };
            actions.push(Action::Cause(Cause::UpstreamBuild {
                task: completion.task.clone(),
            }));
            match self.registry.task(group.downstream()) {
                Some(task) => {
                    let downstream = task.id();
                    info!(
                        upstream = %completion.task,
                        downstream = %downstream,
                        "triggering downstream build"
                    );
                    if self.schedule_task(task, None, actions).await.is_none() {
                        warn!(downstream = %downstream, "downstream task refused scheduling");
                    }
                }
                None => warn!(
                    downstream = %group.downstream(),
                    "downstream task no longer in the registry"
                ),
            }
        }

        self.maintain().await;
    }

    async fn on_executor_idle(&self) {
        self.maintain().await;
    }
}

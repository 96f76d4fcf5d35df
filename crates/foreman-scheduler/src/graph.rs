//! The dependency graph.
//!
//! An immutable snapshot of upstream/downstream relationships between
//! tasks. Rebuilt wholesale whenever project configuration changes; the
//! scheduler swaps in the fresh instance atomically, so readers always see
//! a fully built graph.

use foreman_core::{Action, BuildCompletion, Dependency, ProjectRegistry, TaskId};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// All dependencies between one ordered pair of tasks, coalesced for
/// traversal. Each edge keeps its own trigger policy.
pub struct DependencyGroup {
    upstream: TaskId,
    downstream: TaskId,
    edges: Vec<Dependency>,
}

impl DependencyGroup {
    fn new(dep: Dependency) -> Self {
        Self {
            upstream: dep.upstream.clone(),
            downstream: dep.downstream.clone(),
            edges: vec![dep],
        }
    }

    fn add(&mut self, dep: Dependency) {
        self.edges.push(dep);
    }

    pub fn upstream(&self) -> &TaskId {
        &self.upstream
    }

    pub fn downstream(&self) -> &TaskId {
        &self.downstream
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Ask each coalesced edge in turn whether the completed upstream
    /// build should trigger the downstream task. The first edge that
    /// agrees wins; its contributed actions are returned and the remaining
    /// edges are not consulted, so a completion triggers the downstream
    /// task at most once per group.
    pub fn should_trigger(&self, completion: &BuildCompletion) -> Option<Vec<Action>> {
        for edge in &self.edges {
            let mut actions = Vec::new();
            if edge.trigger.should_trigger(completion, &mut actions) {
                return Some(actions);
            }
        }
        None
    }
}

/// Aggregates dependency edges into a [`DependencyGraph`].
///
/// Consuming the builder in [`GraphBuilder::build`] is what freezes the
/// graph: there is no way to insert an edge into a built instance.
#[derive(Default)]
pub struct GraphBuilder {
    forward: BTreeMap<TaskId, BTreeMap<TaskId, DependencyGroup>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, dep: Dependency) {
        let by_downstream = self.forward.entry(dep.upstream.clone()).or_default();
        match by_downstream.entry(dep.downstream.clone()) {
            Entry::Occupied(mut group) => group.get_mut().add(dep),
            Entry::Vacant(slot) => {
                slot.insert(DependencyGroup::new(dep));
            }
        }
    }

    pub fn build(self) -> DependencyGraph {
        let mut forward: BTreeMap<TaskId, Vec<Arc<DependencyGroup>>> = BTreeMap::new();
        let mut backward: BTreeMap<TaskId, Vec<Arc<DependencyGroup>>> = BTreeMap::new();

        for (upstream, groups) in self.forward {
            for (_, group) in groups {
                let group = Arc::new(group);
                forward
                    .entry(upstream.clone())
                    .or_default()
                    .push(group.clone());
                backward
                    .entry(group.downstream().clone())
                    .or_default()
                    .push(group);
            }
        }

        // forward lists come out sorted by downstream name; sort backward
        // lists by upstream name for the same deterministic iteration
        for groups in backward.values_mut() {
            groups.sort_by(|a, b| a.upstream().cmp(b.upstream()));
        }

        DependencyGraph { forward, backward }
    }
}

/// Relative topological position of two tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopoOrder {
    /// The first task transitively precedes the second.
    Before,
    /// The first task transitively follows the second.
    After,
    /// Neither reaches the other.
    Unordered,
    /// Both reach each other; the graph is cyclic between them.
    Cycle,
}

/// Immutable snapshot of the dependency edge set, with forward and
/// backward adjacency keyed by task.
#[derive(Default)]
pub struct DependencyGraph {
    forward: BTreeMap<TaskId, Vec<Arc<DependencyGroup>>>,
    backward: BTreeMap<TaskId, Vec<Arc<DependencyGroup>>>,
}

impl DependencyGraph {
    /// A graph with no edges.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Direct downstream neighbors.
    pub fn downstream(&self, task: &TaskId) -> Vec<TaskId> {
        self.forward
            .get(task)
            .map(|groups| groups.iter().map(|g| g.downstream().clone()).collect())
            .unwrap_or_default()
    }

    /// Direct upstream neighbors.
    pub fn upstream(&self, task: &TaskId) -> Vec<TaskId> {
        self.backward
            .get(task)
            .map(|groups| groups.iter().map(|g| g.upstream().clone()).collect())
            .unwrap_or_default()
    }

    /// The coalesced dependency groups whose upstream is `task`.
    pub fn downstream_groups(&self, task: &TaskId) -> &[Arc<DependencyGroup>] {
        self.forward.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The coalesced dependency groups whose downstream is `task`.
    pub fn upstream_groups(&self, task: &TaskId) -> &[Arc<DependencyGroup>] {
        self.backward.get(task).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every task reachable by following downstream edges, in BFS order
    /// (nearest first). The start task appears only if a cycle leads back
    /// to it. Terminates on cyclic graphs.
    pub fn transitive_downstream(&self, task: &TaskId) -> Vec<TaskId> {
        self.closure(task, |t| self.downstream(t))
    }

    /// Every task reachable by following upstream edges, nearest first.
    pub fn transitive_upstream(&self, task: &TaskId) -> Vec<TaskId> {
        self.closure(task, |t| self.upstream(t))
    }

    fn closure(&self, start: &TaskId, neighbors: impl Fn(&TaskId) -> Vec<TaskId>) -> Vec<TaskId> {
        let frontier = neighbors(start);
        let mut visited: HashSet<TaskId> = frontier.iter().cloned().collect();
        let mut queue: VecDeque<TaskId> = frontier.into();
        let mut reached = Vec::new();

        while let Some(task) = queue.pop_front() {
            for next in neighbors(&task) {
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
            reached.push(task);
        }
        reached
    }

    /// Whether a path of length greater than one leads from `src` to
    /// `dst`, excluding the direct edge between them.
    pub fn has_indirect_dependencies(&self, src: &TaskId, dst: &TaskId) -> bool {
        let frontier: Vec<TaskId> = self
            .downstream(src)
            .into_iter()
            .filter(|t| t != dst)
            .collect();
        let mut visited: HashSet<TaskId> = frontier.iter().cloned().collect();
        let mut queue: VecDeque<TaskId> = frontier.into();

        while let Some(task) = queue.pop_front() {
            if &task == dst {
                return true;
            }
            for next in self.downstream(&task) {
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        false
    }

    /// Topological comparison. Not a total order: `Unordered` and `Cycle`
    /// are distinct outcomes, so callers can decide how to treat cyclic
    /// graphs instead of silently sorting them as equal.
    pub fn compare(&self, a: &TaskId, b: &TaskId) -> TopoOrder {
        match (self.reaches(a, b), self.reaches(b, a)) {
            (true, true) => TopoOrder::Cycle,
            (true, false) => TopoOrder::Before,
            (false, true) => TopoOrder::After,
            (false, false) => TopoOrder::Unordered,
        }
    }

    fn reaches(&self, from: &TaskId, to: &TaskId) -> bool {
        let frontier = self.downstream(from);
        let mut visited: HashSet<TaskId> = frontier.iter().cloned().collect();
        let mut queue: VecDeque<TaskId> = frontier.into();

        while let Some(task) = queue.pop_front() {
            if &task == to {
                return true;
            }
            for next in self.downstream(&task) {
                if visited.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }
        false
    }
}

/// Build a fresh graph from every registered task's declared edges.
///
/// A contributor that fails is reported and skipped; it must not corrupt
/// the graph for everyone else.
pub fn build_graph(registry: &dyn ProjectRegistry) -> DependencyGraph {
    let mut builder = GraphBuilder::new();
    for task in registry.tasks() {
        match registry.collect_edges(task.as_ref()) {
            Ok(edges) => {
                for edge in edges {
                    builder.add(edge);
                }
            }
            Err(e) => {
                warn!(task = %task.id(), error = %e, "dependency contribution failed; skipping this task's edges");
            }
        }
    }
    let graph = builder.build();
    debug!(
        upstream_keys = graph.forward.len(),
        downstream_keys = graph.backward.len(),
        "dependency graph built"
    );
    graph
}

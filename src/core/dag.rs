//! Dependency analyzer and merge plan.
//!
//! The analyzer holds a petgraph DiGraph of explicit dependencies
//! (prerequisite -> dependent) plus each task's touch-set. Computing the
//! order runs a Kahn topological sort of the explicit graph, choosing among
//! ready tasks with the configured [`TieBreak`]. The resulting linear order
//! then orients every conflict edge (earlier task first), so conflict edges
//! can never introduce a cycle and explicit dependencies always win.

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::core::task::{Resource, Task, TaskId, TouchSet};
use crate::error::{CycleError, Error, Result};

/// The facts about a task the analyzer orders by.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanNode {
    pub id: TaskId,
    pub name: String,
    pub priority: i32,
    pub sequence: usize,
    pub touch_set: TouchSet,
}

impl From<&Task> for PlanNode {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            priority: task.priority,
            sequence: task.sequence,
            touch_set: task.touch_set.clone(),
        }
    }
}

/// Orders two tasks that are otherwise unconstrained.
///
/// Implementations must be total and stable: the same inputs always give
/// the same answer, and `Equal` only for the same task. `Less` means `a`
/// merges first.
pub trait TieBreak: Send + Sync {
    fn name(&self) -> &'static str;
    fn compare(&self, a: &PlanNode, b: &PlanNode) -> Ordering;
}

/// Higher priority first, then submission order, then id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclarationOrder;

impl TieBreak for DeclarationOrder {
    fn name(&self) -> &'static str {
        "declaration"
    }

    fn compare(&self, a: &PlanNode, b: &PlanNode) -> Ordering {
        b.priority
            .cmp(&a.priority)
            .then(a.sequence.cmp(&b.sequence))
            .then(a.id.cmp(&b.id))
    }
}

/// Larger touch-set first (more foundational work lands early), falling
/// back to [`DeclarationOrder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TouchSetSize;

impl TieBreak for TouchSetSize {
    fn name(&self) -> &'static str {
        "touch_set_size"
    }

    fn compare(&self, a: &PlanNode, b: &PlanNode) -> Ordering {
        b.touch_set
            .len()
            .cmp(&a.touch_set.len())
            .then_with(|| DeclarationOrder.compare(a, b))
    }
}

/// Configurable choice of tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakKind {
    #[default]
    Declaration,
    TouchSetSize,
}

impl TieBreakKind {
    pub fn build(self) -> Arc<dyn TieBreak> {
        match self {
            TieBreakKind::Declaration => Arc::new(DeclarationOrder),
            TieBreakKind::TouchSetSize => Arc::new(TouchSetSize),
        }
    }
}

impl std::str::FromStr for TieBreakKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "declaration" => Ok(TieBreakKind::Declaration),
            "touch_set_size" | "touch-set-size" => Ok(TieBreakKind::TouchSetSize),
            other => Err(Error::Validation(format!("unknown tie-break: {}", other))),
        }
    }
}

/// Why one task is ordered before another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EdgeKind {
    /// Declared dependency.
    Explicit,
    /// Touch-sets intersect on these resources.
    Conflict { resources: Vec<Resource> },
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Explicit => write!(f, "explicit"),
            EdgeKind::Conflict { resources } => write!(f, "conflict: {}", resources.join(", ")),
        }
    }
}

/// `from` must integrate before `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEdge {
    pub from: TaskId,
    pub to: TaskId,
    pub kind: EdgeKind,
}

/// Total merge order plus the edges that constrain it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub order: Vec<TaskId>,
    pub edges: Vec<PlanEdge>,
    pub tie_break: String,
}

impl MergePlan {
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.order.iter().position(|t| t == id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.order.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Directed edge `from -> to`.
    pub fn has_edge(&self, from: &TaskId, to: &TaskId) -> bool {
        self.edges.iter().any(|e| &e.from == from && &e.to == to)
    }

    /// The edge between two tasks in either direction.
    pub fn edge_between(&self, a: &TaskId, b: &TaskId) -> Option<&PlanEdge> {
        self.edges
            .iter()
            .find(|e| (&e.from == a && &e.to == b) || (&e.from == b && &e.to == a))
    }

    /// Whether the two tasks are mutually independent.
    pub fn is_independent(&self, a: &TaskId, b: &TaskId) -> bool {
        self.edge_between(a, b).is_none()
    }

    /// Tasks `id` explicitly depends on.
    pub fn explicit_prerequisites(&self, id: &TaskId) -> Vec<TaskId> {
        self.edges
            .iter()
            .filter(|e| &e.to == id && e.kind == EdgeKind::Explicit)
            .map(|e| e.from)
            .collect()
    }
}

/// Builds the conflict graph and derives the merge order.
pub struct DependencyAnalyzer {
    /// Explicit dependencies, prerequisite -> dependent.
    graph: DiGraph<PlanNode, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
    tie_break: Arc<dyn TieBreak>,
}

impl DependencyAnalyzer {
    pub fn new(tie_break: Arc<dyn TieBreak>) -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            tie_break,
        }
    }

    /// Build an analyzer over registry snapshots, including each task's
    /// explicit dependencies on other tasks in the set.
    pub fn from_tasks<'a>(
        tasks: impl IntoIterator<Item = &'a Task>,
        tie_break: Arc<dyn TieBreak>,
    ) -> Self {
        let mut analyzer = Self::new(tie_break);
        let tasks: Vec<&Task> = tasks.into_iter().collect();
        for task in &tasks {
            analyzer.add_task(PlanNode::from(*task));
        }
        for task in &tasks {
            for prerequisite in &task.depends_on {
                // Prerequisites outside the set are handled by the sequencer.
                let _ = analyzer.add_explicit_dependency(&task.id, prerequisite);
            }
        }
        analyzer
    }

    /// Add a task. Re-adding an id returns the existing node.
    pub fn add_task(&mut self, node: PlanNode) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&node.id) {
            return index;
        }
        let id = node.id;
        let index = self.graph.add_node(node);
        self.task_index.insert(id, index);
        index
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Replace the recorded touch-set of a task.
    pub fn add_touch_set(&mut self, id: &TaskId, resources: TouchSet) -> Result<()> {
        let node = self.node_mut(id)?;
        node.touch_set = resources;
        Ok(())
    }

    /// Record that `task` must integrate after `depends_on`.
    ///
    /// Cycles are accepted here and reported by [`compute_order`](Self::compute_order).
    pub fn add_explicit_dependency(&mut self, task: &TaskId, depends_on: &TaskId) -> Result<()> {
        let to = self.index(task)?;
        let from = self.index(depends_on)?;
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    /// Unordered pairs of tasks whose touch-sets intersect, with the shared
    /// resources.
    pub fn conflicts(&self) -> Vec<(TaskId, TaskId, Vec<Resource>)> {
        let nodes: Vec<&PlanNode> = self.graph.node_weights().collect();
        let mut out = Vec::new();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let shared: Vec<Resource> =
                    a.touch_set.intersection(&b.touch_set).cloned().collect();
                if !shared.is_empty() {
                    out.push((a.id, b.id, shared));
                }
            }
        }
        out
    }

    /// Compute the merge order.
    ///
    /// Fails with [`CycleError`] naming every task on an explicit cycle.
    pub fn compute_order(&self) -> std::result::Result<MergePlan, CycleError> {
        let linear = self.linear_extension()?;
        let position: HashMap<TaskId, usize> =
            linear.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut edges: Vec<PlanEdge> = Vec::new();
        let mut linked: HashSet<(TaskId, TaskId)> = HashSet::new();
        for edge in self.graph.edge_indices() {
            if let Some((from, to)) = self.graph.edge_endpoints(edge) {
                let (from, to) = (self.graph[from].id, self.graph[to].id);
                linked.insert((from, to));
                linked.insert((to, from));
                edges.push(PlanEdge {
                    from,
                    to,
                    kind: EdgeKind::Explicit,
                });
            }
        }
        for (a, b, resources) in self.conflicts() {
            if linked.contains(&(a, b)) {
                continue;
            }
            let (from, to) = if position[&a] < position[&b] { (a, b) } else { (b, a) };
            edges.push(PlanEdge {
                from,
                to,
                kind: EdgeKind::Conflict { resources },
            });
        }
        edges.sort_by_key(|e| (position[&e.from], position[&e.to]));

        Ok(MergePlan {
            order: linear,
            edges,
            tie_break: self.tie_break.name().to_string(),
        })
    }

    /// Kahn's algorithm over the explicit graph, picking the tie-break
    /// minimum among ready tasks at each step.
    fn linear_extension(&self) -> std::result::Result<Vec<TaskId>, CycleError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();
        let mut ready: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(pick) = ready
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| self.tie_break.compare(&self.graph[**a], &self.graph[**b]))
            .map(|(i, _)| i)
        {
            let node = ready.swap_remove(pick);
            order.push(self.graph[node].id);
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(d) = in_degree.get_mut(&next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(next);
                    }
                }
            }
        }

        if order.len() == self.graph.node_count() {
            Ok(order)
        } else {
            Err(self.cycle_error())
        }
    }

    fn cycle_error(&self) -> CycleError {
        let mut members: Vec<&PlanNode> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .flatten()
            .map(|n| &self.graph[n])
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        CycleError {
            members: members.iter().map(|n| n.name.clone()).collect(),
            task_ids: members.iter().map(|n| n.id).collect(),
        }
    }

    fn index(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or(Error::TaskNotFound(*id))
    }

    fn node_mut(&mut self, id: &TaskId) -> Result<&mut PlanNode> {
        let index = self.index(id)?;
        self.graph
            .node_weight_mut(index)
            .ok_or(Error::TaskNotFound(*id))
    }
}

impl Default for DependencyAnalyzer {
    fn default() -> Self {
        Self::new(Arc::new(DeclarationOrder))
    }
}

impl std::fmt::Debug for DependencyAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyAnalyzer")
            .field("tasks", &self.graph.node_count())
            .field("explicit_edges", &self.graph.edge_count())
            .field("tie_break", &self.tie_break.name())
            .finish()
    }
}

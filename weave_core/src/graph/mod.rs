//! DAG-based task graph using petgraph.
//!
//! Turns a flat task list into a validated dependency graph and answers the
//! structural queries the scheduler needs: execution levels, dependents and
//! the critical path.
//!
//! # Example
//!
//! ```
//! use weave_core::graph::TaskGraph;
//! use weave_core::types::{TaskId, TaskSpec};
//!
//! let tasks = vec![
//!     TaskSpec::new("fetch", "Fetch the advisories"),
//!     TaskSpec::new("summarize", "Summarize them").depends_on("fetch"),
//! ];
//! let graph = TaskGraph::build(&tasks).unwrap();
//! assert_eq!(graph.levels().len(), 2);
//! assert_eq!(graph.critical_path(), vec![TaskId::new("fetch"), TaskId::new("summarize")]);
//! ```

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::ValidationError;
use crate::types::{Task, TaskId, TaskSpec};

/// Anything that can be placed in a [`TaskGraph`].
pub trait GraphNode {
    /// Identifier of the node.
    fn node_id(&self) -> &TaskId;
    /// Identifiers this node depends on.
    fn node_dependencies(&self) -> &[TaskId];
}

impl GraphNode for TaskSpec {
    fn node_id(&self) -> &TaskId {
        &self.task_id
    }

    fn node_dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }
}

impl GraphNode for Task {
    fn node_id(&self) -> &TaskId {
        &self.task_id
    }

    fn node_dependencies(&self) -> &[TaskId] {
        &self.dependencies
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Validated directed acyclic graph of tasks.
///
/// Edges run from a dependency to its dependent, so incoming neighbors are
/// the tasks a node waits for. Node indices follow submission order and are
/// used as the stable tiebreak for every query.
#[derive(Clone, Debug)]
pub struct TaskGraph {
    /// Directed graph of task ids with dependency edges
    graph: DiGraph<TaskId, ()>,
    /// Map from TaskId to graph node index for O(1) lookup
    task_map: HashMap<TaskId, NodeIndex>,
    /// Longest dependency chain below each node, indexed by node index
    depth: Vec<usize>,
}

impl TaskGraph {
    /// Builds and validates a graph.
    ///
    /// # Returns
    ///
    /// - `Ok(TaskGraph)` when the tasks form a DAG
    /// - `Err(ValidationError::EmptyWorkflow)` for an empty list
    /// - `Err(ValidationError::DuplicateTaskId)` when an id repeats
    /// - `Err(ValidationError::SelfDependency)` when a task depends on itself
    /// - `Err(ValidationError::MissingDependency)` for a dangling reference
    /// - `Err(ValidationError::CycleDetected)` with the cycle path otherwise
    pub fn build<T: GraphNode>(tasks: &[T]) -> Result<Self, ValidationError> {
        if tasks.is_empty() {
            return Err(ValidationError::EmptyWorkflow);
        }

        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut task_map = HashMap::with_capacity(tasks.len());

        // Add all nodes first so forward references resolve
        for task in tasks {
            let id = task.node_id();
            if task_map.contains_key(id) {
                return Err(ValidationError::DuplicateTaskId(id.clone()));
            }
            let idx = graph.add_node(id.clone());
            task_map.insert(id.clone(), idx);
        }

        for task in tasks {
            let id = task.node_id();
            let to = task_map[id];
            for dep in task.node_dependencies() {
                if dep == id {
                    return Err(ValidationError::SelfDependency(id.clone()));
                }
                let from = *task_map
                    .get(dep)
                    .ok_or_else(|| ValidationError::MissingDependency {
                        task_id: id.clone(),
                        missing: dep.clone(),
                    })?;
                if graph.find_edge(from, to).is_none() {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut this = Self {
            graph,
            task_map,
            depth: Vec::new(),
        };

        if let Some(cycle) = this.find_cycle() {
            return Err(ValidationError::CycleDetected(cycle));
        }

        this.depth = this.compute_depths()?;
        Ok(this)
    }

    /// Groups tasks into execution levels.
    ///
    /// Level 0 holds every task without dependencies; level `n` holds tasks
    /// whose dependencies all sit in levels below `n`. Within a level tasks
    /// keep submission order.
    pub fn levels(&self) -> Vec<Vec<TaskId>> {
        let count = self.depth.iter().max().map_or(0, |max| max + 1);
        let mut levels: Vec<Vec<TaskId>> = vec![Vec::new(); count];
        for idx in self.graph.node_indices() {
            levels[self.depth[idx.index()]].push(self.graph[idx].clone());
        }
        levels
    }

    /// Execution level of a single task.
    pub fn level_of(&self, id: &TaskId) -> Option<usize> {
        self.task_map.get(id).map(|idx| self.depth[idx.index()])
    }

    /// Longest dependency chain, from its root to its deepest task.
    ///
    /// Uses the memoized depth of every node; ties go to the task submitted
    /// first.
    pub fn critical_path(&self) -> Vec<TaskId> {
        let mut path = Vec::new();
        let mut current = self.deepest(self.graph.node_indices());

        while let Some(idx) = current {
            path.push(self.graph[idx].clone());
            current = self.deepest(self.graph.neighbors_directed(idx, Direction::Incoming));
        }

        path.reverse();
        path
    }

    /// Direct dependencies of a task, in submission order.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on `id`, in submission order.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every task that depends on `id` directly or transitively.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_map.get(id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        let mut found: Vec<NodeIndex> = seen.into_iter().collect();
        found.sort_by_key(|idx| idx.index());
        found.into_iter().map(|idx| self.graph[idx].clone()).collect()
    }

    /// All task ids in submission order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Submission position of a task.
    pub fn position(&self, id: &TaskId) -> Option<usize> {
        self.task_map.get(id).map(|idx| idx.index())
    }

    /// Checks if a task ID exists in the graph.
    pub fn contains(&self, id: &TaskId) -> bool {
        self.task_map.contains_key(id)
    }

    /// Returns the number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&idx) = self.task_map.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        found.sort_by_key(|n| n.index());
        found.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Deepest node among `candidates`, earliest submission on ties.
    fn deepest(&self, candidates: impl Iterator<Item = NodeIndex>) -> Option<NodeIndex> {
        candidates.max_by(|a, b| {
            self.depth[a.index()]
                .cmp(&self.depth[b.index()])
                .then_with(|| b.index().cmp(&a.index()))
        })
    }

    /// DFS with a recursion stack; a dependency edge back onto the stack is a cycle.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut stack = Vec::new();

        for idx in self.graph.node_indices() {
            if marks[idx.index()] == Mark::Unvisited {
                if let Some(cycle) = self.visit(idx, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        marks: &mut [Mark],
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<TaskId>> {
        marks[node.index()] = Mark::OnStack;
        stack.push(node);

        let mut deps: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .collect();
        deps.sort_by_key(|n| n.index());

        for dep in deps {
            match marks[dep.index()] {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<TaskId> = stack[start..]
                        .iter()
                        .map(|&n| self.graph[n].clone())
                        .collect();
                    cycle.push(self.graph[dep].clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(dep, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node.index()] = Mark::Done;
        None
    }

    /// depth(t) = 0 without dependencies, else 1 + max(depth(d)).
    fn compute_depths(&self) -> Result<Vec<usize>, ValidationError> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            ValidationError::CycleDetected(vec![self.graph[cycle.node_id()].clone()])
        })?;

        let mut depth = vec![0usize; self.graph.node_count()];
        for idx in order {
            depth[idx.index()] = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .map(|dep| depth[dep.index()] + 1)
                .max()
                .unwrap_or(0);
        }
        Ok(depth)
    }
}

/// Orders two tasks for dispatch: lower priority value first, then critical
/// path membership, then submission order.
pub fn dispatch_order(
    graph: &TaskGraph,
    critical: &HashSet<TaskId>,
    a: (&TaskId, u8),
    b: (&TaskId, u8),
) -> Ordering {
    a.1.cmp(&b.1)
        .then_with(|| critical.contains(b.0).cmp(&critical.contains(a.0)))
        .then_with(|| graph.position(a.0).cmp(&graph.position(b.0)))
}

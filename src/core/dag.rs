//! Task DAG (Directed Acyclic Graph) for dependency analysis.
//!
//! The graph is built from a task slice with an edge from each dependency
//! to its dependent. Building fails if the dependencies form a cycle, so a
//! constructed `TaskDAG` is always acyclic.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort, DfsSpace};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// The task dependency graph.
///
/// Nodes are task snapshots; an edge `a -> b` means `b` depends on `a`.
pub struct TaskDAG {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Build a DAG from a set of tasks.
    ///
    /// Dependencies on ids outside the set are skipped; they are either
    /// already satisfied or dangling, and neither constrains ordering here.
    ///
    /// # Errors
    /// Returns an error if:
    /// - Two tasks share an id (`Error::DuplicateTaskId`)
    /// - The dependencies form a cycle (`Error::CircularDependency`)
    pub fn from_tasks(tasks: &[Task]) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut task_index = HashMap::with_capacity(tasks.len());

        for task in tasks {
            if task_index.contains_key(&task.id) {
                return Err(Error::DuplicateTaskId(task.id.to_string()));
            }
            let index = graph.add_node(task.clone());
            task_index.insert(task.id.clone(), index);
        }

        for task in tasks {
            let to = task_index[&task.id];
            for dep in &task.dependencies {
                match task_index.get(dep) {
                    Some(&from) => {
                        if graph.find_edge(from, to).is_none() {
                            graph.add_edge(from, to, ());
                        }
                    }
                    None => {
                        debug!(task = %task.id, dependency = %dep, "Dependency outside task set");
                    }
                }
            }
        }

        let dag = Self { graph, task_index };
        if let Some(path) = dag.find_cycle() {
            return Err(Error::CircularDependency(
                path.into_iter().map(|id| id.to_string()).collect(),
            ));
        }
        Ok(dag)
    }

    /// Find one cycle, returned as a closed path `a -> b -> ... -> a`.
    fn find_cycle(&self) -> Option<Vec<TaskId>> {
        let start = match toposort(&self.graph, None) {
            Ok(_) => return None,
            Err(cycle) => cycle.node_id(),
        };

        // BFS from the start node's successors back to it.
        let mut prev: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut queue = VecDeque::new();
        for next in self.graph.neighbors_directed(start, Direction::Outgoing) {
            if next == start {
                let id = self.graph[start].id.clone();
                return Some(vec![id.clone(), id]);
            }
            if !prev.contains_key(&next) {
                prev.insert(next, start);
                queue.push_back(next);
            }
        }
        while let Some(node) = queue.pop_front() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if next == start {
                    let mut path = vec![self.graph[start].id.clone()];
                    let mut cur = node;
                    while cur != start {
                        path.push(self.graph[cur].id.clone());
                        cur = prev[&cur];
                    }
                    path.push(self.graph[start].id.clone());
                    path.reverse();
                    return Some(path);
                }
                if !prev.contains_key(&next) {
                    prev.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        Some(vec![self.graph[start].id.clone()])
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Check if the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check if the DAG contains a task.
    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Check if `to` directly depends on `from`.
    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&f), Some(&t)) => self.graph.find_edge(f, t).is_some(),
            _ => false,
        }
    }

    /// Get the ids of tasks the given task depends on (predecessors).
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get the ids of tasks that depend on the given task (successors).
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, dir: Direction) -> Vec<&TaskId> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, dir)
                .map(|n| &self.graph[n].id)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Get tasks in topological order (each task after its dependencies).
    pub fn topological_order(&self) -> Vec<&Task> {
        // Construction guarantees acyclicity, so toposort cannot fail here.
        toposort(&self.graph, None)
            .unwrap_or_default()
            .into_iter()
            .map(|index| &self.graph[index])
            .collect()
    }

    /// Compute the level of every task.
    ///
    /// A task with no in-set dependencies is level 0; otherwise its level is
    /// one more than the highest level among its dependencies.
    pub fn levels(&self) -> HashMap<TaskId, usize> {
        let mut by_node: HashMap<NodeIndex, usize> = HashMap::with_capacity(self.task_count());
        for index in toposort(&self.graph, None).unwrap_or_default() {
            let level = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|dep| by_node.get(&dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            by_node.insert(index, level);
        }
        by_node
            .into_iter()
            .map(|(index, level)| (self.graph[index].id.clone(), level))
            .collect()
    }

    /// Build a reachability oracle for repeated path queries.
    pub fn reachability(&self) -> Reachability<'_> {
        Reachability {
            dag: self,
            space: DfsSpace::new(&self.graph),
        }
    }
}

/// Answers "is there a dependency path between these tasks" with a reused
/// DFS workspace.
pub struct Reachability<'a> {
    dag: &'a TaskDAG,
    space: DfsSpace<NodeIndex, <DiGraph<Task, ()> as petgraph::visit::Visitable>::Map>,
}

impl Reachability<'_> {
    /// True if `to` transitively depends on `from`.
    pub fn has_path(&mut self, from: &TaskId, to: &TaskId) -> bool {
        match (self.dag.task_index.get(from), self.dag.task_index.get(to)) {
            (Some(&f), Some(&t)) if f != t => {
                has_path_connecting(&self.dag.graph, f, t, Some(&mut self.space))
            }
            _ => false,
        }
    }

    /// True if either task transitively depends on the other.
    pub fn related(&mut self, a: &TaskId, b: &TaskId) -> bool {
        self.has_path(a, b) || self.has_path(b, a)
    }
}

//! Dependency analysis: turns a task set into staged, resource-bounded groups.
//!
//! Planning runs in five passes:
//! 1. Build the task DAG (rejecting cycles) and compute levels.
//! 2. Group tasks by team, then level, then chunk by the strategy's group size.
//! 3. Coalesce compatible groups of the same team.
//! 4. Derive group-to-group dependencies from member task dependencies.
//! 5. Stage groups so that every group runs after the groups it depends on.
//!
//! The analyzer is pure: the same tasks and strategy always produce the
//! same plan.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::core::dag::TaskDAG;
use crate::core::task::{Task, TaskId, Team};
use crate::error::{Error, Result};
use crate::orchestration::estimate;
use crate::orchestration::strategy::ParallelStrategy;
use crate::resources::ResourceVector;

/// Minutes per task assumed by a plain sequential run, for speedup estimates.
const SEQUENTIAL_MINUTES_PER_TASK: f64 = 5.0;

/// Identifier of a task group within one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub usize);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group_{}", self.0)
    }
}

/// Tasks of one team with no dependency path between any two of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: GroupId,
    /// Members in execution order.
    pub tasks: Vec<Task>,
    pub team: Team,
    pub level: usize,
    pub priority: i32,
    /// Minutes.
    pub estimated_duration: f64,
    pub resources: ResourceVector,
    /// Groups that must finish before this one starts.
    pub dependencies: Vec<GroupId>,
}

impl TaskGroup {
    fn new(id: GroupId, team: Team, level: usize, tasks: Vec<Task>) -> Self {
        let priority = 100 - 10 * level as i32 + estimate::team_priority_bonus(team);
        let estimated_duration = estimate::group_minutes(tasks.iter());
        let resources = estimate::group_resources(tasks.iter());
        Self {
            id,
            tasks,
            team,
            level,
            priority,
            estimated_duration,
            resources,
            dependencies: Vec::new(),
        }
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.tasks.iter().map(|t| &t.id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Mean keyword complexity of the members; a staging tie-breaker.
    pub fn complexity_hint(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .tasks
            .iter()
            .map(|t| estimate::keyword_complexity(&t.description))
            .sum();
        total / self.tasks.len() as f64
    }

    fn absorb(&mut self, other: TaskGroup) {
        self.tasks.extend(other.tasks);
        self.level = self.level.min(other.level);
        self.priority = self.priority.max(other.priority);
        self.estimated_duration = self.estimated_duration.max(other.estimated_duration);
        self.resources += other.resources;
    }
}

/// Read-only digest of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub strategy: ParallelStrategy,
    pub task_count: usize,
    pub group_count: usize,
    pub stage_count: usize,
    pub max_stage_width: usize,
    pub parallelism_factor: f64,
    /// Minutes.
    pub estimated_total_time: f64,
    pub estimated_speedup: f64,
}

/// Groups arranged into stages.
///
/// Stages run strictly one after another; groups within a stage may run
/// concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelExecutionPlan {
    pub strategy: ParallelStrategy,
    pub groups: Vec<TaskGroup>,
    pub stages: Vec<Vec<GroupId>>,
    /// Minutes: sum over stages of the longest group in the stage.
    pub estimated_total_time: f64,
    pub max_concurrent_groups: usize,
    /// Per-resource maximum over all groups.
    pub resource_allocation: ResourceVector,
}

impl ParallelExecutionPlan {
    fn empty(strategy: ParallelStrategy) -> Self {
        Self {
            strategy,
            groups: Vec::new(),
            stages: Vec::new(),
            estimated_total_time: 0.0,
            max_concurrent_groups: strategy.max_concurrent_groups(),
            resource_allocation: ResourceVector::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn task_count(&self) -> usize {
        self.groups.iter().map(TaskGroup::len).sum()
    }

    /// Tasks per stage. 1.0 for an empty plan.
    pub fn parallelism_factor(&self) -> f64 {
        if self.stages.is_empty() {
            return 1.0;
        }
        self.task_count() as f64 / self.stages.len() as f64
    }

    pub fn group(&self, id: GroupId) -> Option<&TaskGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// The groups of one stage, in staging order.
    pub fn stage_groups(&self, stage: usize) -> Vec<&TaskGroup> {
        self.stages
            .get(stage)
            .map(|ids| ids.iter().filter_map(|id| self.group(*id)).collect())
            .unwrap_or_default()
    }

    /// Index of the stage a group was placed in.
    pub fn stage_of(&self, id: GroupId) -> Option<usize> {
        self.stages.iter().position(|s| s.contains(&id))
    }

    /// The group a task belongs to.
    pub fn group_of_task(&self, task: &TaskId) -> Option<&TaskGroup> {
        self.groups.iter().find(|g| g.task_ids().any(|t| t == task))
    }

    pub fn summary(&self) -> PlanSummary {
        let task_count = self.task_count();
        let estimated_speedup = if self.estimated_total_time > 0.0 {
            task_count as f64 * SEQUENTIAL_MINUTES_PER_TASK / self.estimated_total_time
        } else {
            1.0
        };
        PlanSummary {
            strategy: self.strategy,
            task_count,
            group_count: self.groups.len(),
            stage_count: self.stages.len(),
            max_stage_width: self.stages.iter().map(Vec::len).max().unwrap_or(0),
            parallelism_factor: self.parallelism_factor(),
            estimated_total_time: self.estimated_total_time,
            estimated_speedup,
        }
    }
}

/// Builds [`ParallelExecutionPlan`]s for a strategy.
#[derive(Debug, Clone, Default)]
pub struct DependencyAnalyzer {
    strategy: ParallelStrategy,
}

impl DependencyAnalyzer {
    pub fn new(strategy: ParallelStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> ParallelStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: ParallelStrategy) {
        self.strategy = strategy;
    }

    /// Plan the given tasks.
    ///
    /// Dependencies on ids outside `tasks` are treated as already satisfied.
    ///
    /// # Errors
    /// Returns `Error::CircularDependency` if the tasks form a cycle and
    /// `Error::DuplicateTaskId` if two tasks share an id. No partial plan is
    /// produced in either case.
    pub fn analyze(&self, tasks: &[Task]) -> Result<ParallelExecutionPlan> {
        if tasks.is_empty() {
            return Ok(ParallelExecutionPlan::empty(self.strategy));
        }

        let dag = TaskDAG::from_tasks(tasks)?;
        let levels = dag.levels();

        let groups = self.initial_groups(tasks, &levels);
        debug!(count = groups.len(), "Initial task groups");

        let (mut groups, owner) = self.merge_groups(groups, tasks, &dag);
        link_group_dependencies(&mut groups, tasks, &owner);

        let stages = self.stage_groups(&groups)?;

        let estimated_total_time: f64 = stages
            .iter()
            .map(|stage| {
                stage
                    .iter()
                    .filter_map(|id| groups.iter().find(|g| g.id == *id))
                    .map(|g| g.estimated_duration)
                    .fold(0.0, f64::max)
            })
            .sum();
        let resource_allocation = groups
            .iter()
            .fold(ResourceVector::ZERO, |acc, g| acc.max(&g.resources));

        let plan = ParallelExecutionPlan {
            strategy: self.strategy,
            groups,
            stages,
            estimated_total_time,
            max_concurrent_groups: self.strategy.max_concurrent_groups(),
            resource_allocation,
        };
        info!(
            strategy = %self.strategy,
            tasks = plan.task_count(),
            groups = plan.groups.len(),
            stages = plan.stages.len(),
            factor = plan.parallelism_factor(),
            "Execution plan built"
        );
        Ok(plan)
    }

    /// Plan the tasks and report only the summary.
    pub fn parallelism_opportunities(&self, tasks: &[Task]) -> Result<PlanSummary> {
        Ok(self.analyze(tasks)?.summary())
    }

    /// Team (first-seen order), then level (ascending), then chunks of at
    /// most `max_group_size`.
    fn initial_groups(&self, tasks: &[Task], levels: &HashMap<TaskId, usize>) -> Vec<TaskGroup> {
        let mut team_order: Vec<Team> = Vec::new();
        let mut by_team: HashMap<Team, BTreeMap<usize, Vec<Task>>> = HashMap::new();
        for task in tasks {
            if !by_team.contains_key(&task.team) {
                team_order.push(task.team);
            }
            let level = levels.get(&task.id).copied().unwrap_or(0);
            by_team
                .entry(task.team)
                .or_default()
                .entry(level)
                .or_default()
                .push(task.clone());
        }

        let size = self.strategy.max_group_size().max(1);
        let mut groups = Vec::new();
        for team in team_order {
            let Some(by_level) = by_team.remove(&team) else {
                continue;
            };
            for (level, members) in by_level {
                for chunk in members.chunks(size) {
                    let id = GroupId(groups.len());
                    groups.push(TaskGroup::new(id, team, level, chunk.to_vec()));
                }
            }
        }
        groups
    }

    /// Coalesce groups in priority order into earlier compatible groups.
    ///
    /// Returns the surviving groups and the task-to-group ownership map.
    fn merge_groups(
        &self,
        groups: Vec<TaskGroup>,
        tasks: &[Task],
        dag: &TaskDAG,
    ) -> (Vec<TaskGroup>, HashMap<TaskId, GroupId>) {
        let mut owner: HashMap<TaskId, GroupId> = groups
            .iter()
            .flat_map(|g| g.task_ids().map(move |t| (t.clone(), g.id)))
            .collect();

        let mut ordered = groups;
        // Stable sort keeps creation order among equal priorities.
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut reach = dag.reachability();
        let mut merged: Vec<TaskGroup> = Vec::with_capacity(ordered.len());
        let max_size = self.strategy.max_group_size();

        for group in ordered {
            let mut target = None;
            for (i, candidate) in merged.iter().enumerate() {
                if candidate.team != group.team
                    || candidate.len() + group.len() > max_size
                    || !(candidate.resources + group.resources).fits_within(1.0)
                {
                    continue;
                }
                let related = candidate
                    .task_ids()
                    .any(|a| group.task_ids().any(|b| reach.related(a, b)));
                if related {
                    continue;
                }
                if merge_creates_cycle(tasks, &owner, group.id, candidate.id) {
                    continue;
                }
                target = Some(i);
                break;
            }

            match target {
                Some(i) => {
                    let into = merged[i].id;
                    debug!(from = %group.id, into = %into, "Merging task groups");
                    for id in group.task_ids() {
                        owner.insert(id.clone(), into);
                    }
                    merged[i].absorb(group);
                }
                None => merged.push(group),
            }
        }

        merged.sort_by_key(|g| g.id);
        (merged, owner)
    }

    /// Arrange groups into stages.
    ///
    /// Each round takes the groups whose dependencies are all in earlier
    /// stages, ranks them by priority (then complexity, then id), and admits
    /// them while the stage stays within the concurrency cap and the summed
    /// resource vector stays within 1.0. If nothing fits, the top-ranked
    /// group is admitted alone so planning always makes progress.
    fn stage_groups(&self, groups: &[TaskGroup]) -> Result<Vec<Vec<GroupId>>> {
        let max_width = self.strategy.max_concurrent_groups().max(1);
        let mut staged: HashSet<GroupId> = HashSet::new();
        let mut remaining: Vec<&TaskGroup> = groups.iter().collect();
        let mut stages = Vec::new();

        while !remaining.is_empty() {
            let mut ready: Vec<&TaskGroup> = remaining
                .iter()
                .copied()
                .filter(|g| g.dependencies.iter().all(|d| staged.contains(d)))
                .collect();
            if ready.is_empty() {
                return Err(Error::Planning(format!(
                    "{} groups have unsatisfiable dependencies",
                    remaining.len()
                )));
            }
            ready.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| b.complexity_hint().total_cmp(&a.complexity_hint()))
                    .then_with(|| a.id.cmp(&b.id))
            });

            let mut stage: Vec<GroupId> = Vec::new();
            let mut load = ResourceVector::ZERO;
            for group in &ready {
                if stage.len() >= max_width {
                    break;
                }
                let next = load + group.resources;
                if next.fits_within(1.0) {
                    stage.push(group.id);
                    load = next;
                }
            }
            if stage.is_empty() {
                let forced = ready[0];
                warn!(
                    group = %forced.id,
                    resources = ?forced.resources,
                    "No group fits the stage budget; admitting the top group alone"
                );
                stage.push(forced.id);
            }

            staged.extend(stage.iter().copied());
            remaining.retain(|g| !staged.contains(&g.id));
            stages.push(stage);
        }
        Ok(stages)
    }
}

/// Would reassigning every task owned by `from` to `into` create a cycle in
/// the group graph?
fn merge_creates_cycle(
    tasks: &[Task],
    owner: &HashMap<TaskId, GroupId>,
    from: GroupId,
    into: GroupId,
) -> bool {
    let resolve = |g: GroupId| if g == from { into } else { g };
    let mut graph: DiGraph<GroupId, ()> = DiGraph::new();
    let mut nodes = HashMap::new();
    let mut node = |graph: &mut DiGraph<GroupId, ()>, g: GroupId| {
        *nodes.entry(g).or_insert_with(|| graph.add_node(g))
    };
    let mut seen = HashSet::new();
    for task in tasks {
        let Some(&to) = owner.get(&task.id) else {
            continue;
        };
        let to = resolve(to);
        for dep in &task.dependencies {
            let Some(&from_group) = owner.get(dep) else {
                continue;
            };
            let from_group = resolve(from_group);
            if from_group == to || !seen.insert((from_group, to)) {
                continue;
            }
            let a = node(&mut graph, from_group);
            let b = node(&mut graph, to);
            graph.add_edge(a, b, ());
        }
    }
    is_cyclic_directed(&graph)
}

/// Fill `dependencies` on each group from its members' task dependencies.
fn link_group_dependencies(
    groups: &mut [TaskGroup],
    tasks: &[Task],
    owner: &HashMap<TaskId, GroupId>,
) {
    let mut deps: HashMap<GroupId, BTreeSet<GroupId>> = HashMap::new();
    for task in tasks {
        let Some(&to) = owner.get(&task.id) else {
            continue;
        };
        for dep in &task.dependencies {
            if let Some(&from) = owner.get(dep) {
                if from != to {
                    deps.entry(to).or_default().insert(from);
                }
            }
        }
    }
    for group in groups.iter_mut() {
        group.dependencies = deps
            .remove(&group.id)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
    }
}

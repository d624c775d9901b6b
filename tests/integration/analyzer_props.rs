//! Property tests for the dependency analyzer.
//!
//! Random acyclic task sets are generated by letting each task depend on
//! any subset of the tasks declared before it. Every plan must:
//! - Place each task in exactly one group
//! - Keep dependency paths out of groups and stages
//! - Stage every dependency strictly earlier than its dependent
//! - Respect the strategy's group size and stage width
//! - Come out the same when built twice

use proptest::prelude::*;
use std::collections::HashMap;

use maos::core::{Task, TaskDAG, TaskId, Team};
use maos::orchestration::{DependencyAnalyzer, ParallelExecutionPlan, ParallelStrategy};
use maos::Error;

const DESCRIPTIONS: [&str; 5] = [
    "Quick fix",
    "Implement the full checkout flow with retries",
    "Write a comprehensive test plan",
    "Refactor storage layer",
    "Document the public API",
];

/// (team index, edges to earlier tasks, description index) per task.
type TaskSpec = (usize, Vec<bool>, usize);

fn build_tasks(specs: Vec<TaskSpec>) -> Vec<Task> {
    specs
        .into_iter()
        .enumerate()
        .map(|(i, (team, edges, description))| {
            let deps: Vec<String> = edges
                .iter()
                .take(i)
                .enumerate()
                .filter(|(_, edge)| **edge)
                .map(|(j, _)| format!("n{}", j))
                .collect();
            Task::new(
                format!("n{}", i),
                DESCRIPTIONS[description % DESCRIPTIONS.len()],
                Team::ALL[team % Team::ALL.len()],
            )
            .depends_on(deps)
        })
        .collect()
}

fn acyclic_tasks() -> impl Strategy<Value = Vec<Task>> {
    prop::collection::vec(
        (
            0..Team::ALL.len(),
            prop::collection::vec(any::<bool>(), 0..20),
            0..DESCRIPTIONS.len(),
        ),
        1..20,
    )
    .prop_map(build_tasks)
}

fn strategies() -> impl Strategy<Value = ParallelStrategy> {
    prop::sample::select(ParallelStrategy::ALL.to_vec())
}

fn stage_by_task(plan: &ParallelExecutionPlan) -> HashMap<TaskId, usize> {
    plan.groups
        .iter()
        .flat_map(|g| {
            let stage = plan.stage_of(g.id).unwrap();
            g.task_ids().map(move |t| (t.clone(), stage))
        })
        .collect()
}

proptest! {
    /// Test: Every task lands in exactly one group and every group in one stage
    #[test]
    fn test_plan_partitions_tasks(tasks in acyclic_tasks(), strategy in strategies()) {
        let plan = DependencyAnalyzer::new(strategy).analyze(&tasks).unwrap();

        let mut seen: Vec<&TaskId> = plan.groups.iter().flat_map(|g| g.task_ids()).collect();
        seen.sort();
        let mut expected: Vec<&TaskId> = tasks.iter().map(|t| &t.id).collect();
        expected.sort();
        prop_assert_eq!(seen, expected);

        let mut staged: Vec<_> = plan.stages.iter().flatten().copied().collect();
        staged.sort();
        let mut groups: Vec<_> = plan.groups.iter().map(|g| g.id).collect();
        groups.sort();
        prop_assert_eq!(staged, groups);
    }

    /// Test: No two tasks in the same group or stage are connected by a path
    #[test]
    fn test_no_paths_within_stage(tasks in acyclic_tasks(), strategy in strategies()) {
        let plan = DependencyAnalyzer::new(strategy).analyze(&tasks).unwrap();
        let dag = TaskDAG::from_tasks(&tasks).unwrap();
        let mut reach = dag.reachability();

        for stage in 0..plan.stages.len() {
            let members: Vec<&TaskId> = plan
                .stage_groups(stage)
                .into_iter()
                .flat_map(|g| g.task_ids())
                .collect();
            for (i, a) in members.iter().enumerate() {
                for b in &members[i + 1..] {
                    prop_assert!(!reach.related(a, b), "{} and {} share stage {}", a, b, stage);
                }
            }
        }
    }

    /// Test: Dependencies are always staged before their dependents
    #[test]
    fn test_dependencies_staged_first(tasks in acyclic_tasks(), strategy in strategies()) {
        let plan = DependencyAnalyzer::new(strategy).analyze(&tasks).unwrap();
        let stages = stage_by_task(&plan);

        for task in &tasks {
            for dep in &task.dependencies {
                prop_assert!(stages[dep] < stages[&task.id], "{} staged with or after {}", dep, task.id);
            }
        }
    }

    /// Test: Group size and stage width stay within the strategy's caps
    #[test]
    fn test_strategy_caps(tasks in acyclic_tasks(), strategy in strategies()) {
        let plan = DependencyAnalyzer::new(strategy).analyze(&tasks).unwrap();

        for group in &plan.groups {
            prop_assert!(group.len() <= strategy.max_group_size());
            prop_assert!(group.tasks.iter().all(|t| t.team == group.team));
        }
        for stage in &plan.stages {
            prop_assert!(!stage.is_empty());
            prop_assert!(stage.len() <= strategy.max_concurrent_groups());
        }
    }

    /// Test: Planning the same input twice gives the same plan
    #[test]
    fn test_plan_is_deterministic(tasks in acyclic_tasks(), strategy in strategies()) {
        let analyzer = DependencyAnalyzer::new(strategy);
        let first = analyzer.analyze(&tasks).unwrap();
        let second = analyzer.analyze(&tasks).unwrap();

        prop_assert_eq!(&first.stages, &second.stages);
        for (a, b) in first.groups.iter().zip(&second.groups) {
            let a_ids: Vec<_> = a.task_ids().collect();
            let b_ids: Vec<_> = b.task_ids().collect();
            prop_assert_eq!(a_ids, b_ids);
        }
        prop_assert_eq!(first.summary(), second.summary());
    }

    /// Test: Closing a chain into a loop is rejected without a plan
    #[test]
    fn test_cycle_rejected(len in 2usize..12) {
        let mut tasks: Vec<Task> = (0..len)
            .map(|i| Task::new(format!("c{}", i), "Loop step", Team::General))
            .collect();
        for i in 1..len {
            tasks[i].dependencies = vec![TaskId::new(format!("c{}", i - 1))];
        }
        tasks[0].dependencies = vec![TaskId::new(format!("c{}", len - 1))];

        let result = DependencyAnalyzer::default().analyze(&tasks);
        prop_assert!(matches!(result, Err(Error::CircularDependency(_))));
    }
}

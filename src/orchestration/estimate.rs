//! Heuristic cost tables used by planning and execution.
//!
//! Everything here is a guess about how expensive a task is. The tables are
//! keyed by [`Team`] and kept apart from the analyzer so they can be tuned
//! without touching graph logic.

use crate::core::task::{Task, Team};
use crate::resources::ResourceVector;

/// Scale applied to a multi-task group's summed resource vector.
pub const GROUP_SHARING_DISCOUNT: f64 = 0.7;

/// Divisor cap for group duration; at most this many members overlap.
pub const MAX_DURATION_OVERLAP: usize = 3;

/// Priority bonus for a team.
pub fn team_priority_bonus(team: Team) -> i32 {
    match team {
        Team::Frontend => 10,
        Team::Backend => 8,
        Team::Qa => 6,
        Team::Documentation => 4,
        Team::Research => 2,
        Team::General => 0,
    }
}

/// Base duration in minutes for a task of the given team.
pub fn team_base_minutes(team: Team) -> f64 {
    match team {
        Team::Frontend => 8.0,
        Team::Backend => 10.0,
        Team::Qa => 5.0,
        Team::Documentation => 6.0,
        Team::Research => 12.0,
        Team::General => 8.0,
    }
}

/// Planning-time resource vector for one task of the given team.
pub fn team_resource_vector(team: Team) -> ResourceVector {
    match team {
        Team::Frontend => ResourceVector::new(0.3, 0.2, 0.3),
        Team::Backend => ResourceVector::new(0.4, 0.3, 0.4),
        Team::Qa => ResourceVector::new(0.2, 0.1, 0.2),
        Team::Documentation => ResourceVector::new(0.3, 0.1, 0.2),
        Team::Research => ResourceVector::new(0.5, 0.2, 0.3),
        Team::General => ResourceVector::new(0.3, 0.2, 0.3),
    }
}

/// Expected consumption reported back to the resource manager after a task
/// of the given team has run.
pub fn team_usage_estimate(team: Team) -> ResourceVector {
    match team {
        Team::Frontend => ResourceVector::new(0.15, 0.1, 0.15),
        Team::Backend => ResourceVector::new(0.2, 0.15, 0.2),
        Team::Qa => ResourceVector::new(0.1, 0.05, 0.1),
        Team::Documentation => ResourceVector::new(0.15, 0.05, 0.1),
        Team::Research => ResourceVector::new(0.25, 0.1, 0.15),
        Team::General => ResourceVector::new(0.15, 0.1, 0.15),
    }
}

/// Description length relative to 50 characters, clamped to `[0.5, 2.0]`.
pub fn complexity_factor(description: &str) -> f64 {
    (description.chars().count() as f64 / 50.0).clamp(0.5, 2.0)
}

/// Keyword weights scanned in order; the first hit wins.
const KEYWORD_WEIGHTS: &[(&[&str], f64)] = &[
    (&["simple", "basic", "quick"], 0.5),
    (&["complex"], 2.0),
    (&["comprehensive"], 2.5),
    (&["full"], 2.0),
    (&["optimize"], 1.5),
    (&["refactor"], 1.8),
    (&["integrate"], 1.7),
    (&["test"], 0.8),
    (&["validate"], 0.7),
    (&["check"], 0.6),
];

/// Keyword-weighted complexity of a description.
///
/// Used only to break priority ties during staging.
pub fn keyword_complexity(description: &str) -> f64 {
    let lower = description.to_lowercase();
    let modifier = KEYWORD_WEIGHTS
        .iter()
        .find(|(words, _)| words.iter().any(|w| lower.contains(w)))
        .map(|(_, weight)| *weight)
        .unwrap_or(1.0);
    (lower.chars().count() as f64 / 50.0 * modifier).max(0.5)
}

/// Estimated minutes for one task.
pub fn task_minutes(task: &Task) -> f64 {
    team_base_minutes(task.team) * complexity_factor(&task.description)
}

/// Estimated minutes for a group: summed task minutes divided by the
/// number of members assumed to overlap.
pub fn group_minutes<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for task in tasks {
        total += task_minutes(task);
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    total / count.min(MAX_DURATION_OVERLAP) as f64
}

/// Planning-time resource vector for a group of tasks.
pub fn group_resources<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> ResourceVector {
    let mut total = ResourceVector::ZERO;
    let mut count = 0usize;
    for task in tasks {
        total += team_resource_vector(task.team);
        count += 1;
    }
    if count > 1 {
        total.scale(GROUP_SHARING_DISCOUNT)
    } else {
        total
    }
}

/// Usage estimate for a group that just ran.
pub fn group_usage<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> ResourceVector {
    tasks.into_iter().map(|t| team_usage_estimate(t.team)).sum()
}

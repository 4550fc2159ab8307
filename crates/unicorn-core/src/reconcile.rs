//! Canonical column ordering.
//!
//! Everything here is pure: the same input always yields the same lanes, and
//! keys repaired on the fly are never written back.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::{Column, OrderKey, Task, TaskId};

/// Completion timestamps inside the same window sort by creation instead.
pub const COMPLETION_WINDOW_MS: u64 = 1_000;

/// Board order: priority desc, key asc, newer first, then id.
#[must_use]
pub fn compare_tasks(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.order_key.cmp_numeric(&b.order_key))
        .then_with(|| b.created_at_ms.cmp(&a.created_at_ms))
        .then_with(|| a.id.cmp(&b.id))
}

fn compare_by_recency(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.created_at_ms.cmp(&a.created_at_ms))
        .then_with(|| a.id.cmp(&b.id))
}

/// Most recent completion first, compared in windows of
/// [`COMPLETION_WINDOW_MS`] aligned to whole seconds since the epoch. Only
/// completions inside the same window fall back to creation time, so two
/// completions a few milliseconds apart that straddle a window boundary
/// (42_999 and 43_001) still order by completion.
fn compare_completed(a: &Task, b: &Task) -> Ordering {
    let a_window = a.completion_ms() / COMPLETION_WINDOW_MS;
    let b_window = b.completion_ms() / COMPLETION_WINDOW_MS;
    b_window
        .cmp(&a_window)
        .then_with(|| b.created_at_ms.cmp(&a.created_at_ms))
        .then_with(|| a.id.cmp(&b.id))
}

/// Tasks of `column` in render order, with missing or default keys
/// re-derived from their priority/recency position.
#[must_use]
pub fn reconcile_column(tasks: &[Task], column: Column) -> Vec<Task> {
    let mut lane: Vec<Task> = tasks.iter().filter(|task| task.status == column).cloned().collect();

    if column == Column::Done {
        lane.sort_by(compare_completed);
        return lane;
    }

    lane.sort_by(compare_by_recency);
    for (index, task) in lane.iter_mut().enumerate() {
        if task.order_key.needs_repair() {
            task.order_key = OrderKey::at_position(index);
        }
    }

    lane.sort_by(compare_tasks);
    lane
}

#[must_use]
pub fn reconcile_board(tasks: &[Task]) -> BTreeMap<Column, Vec<Task>> {
    Column::ALL.into_iter().map(|column| (column, reconcile_column(tasks, column))).collect()
}

/// True when two neighbours of the same priority sit closer than `min_gap`.
#[must_use]
pub fn needs_rebalance(lane: &[Task], min_gap: f64) -> bool {
    lane.windows(2).any(|pair| {
        if pair[0].priority != pair[1].priority {
            return false;
        }
        match (pair[0].order_key.value(), pair[1].order_key.value()) {
            (Some(a), Some(b)) => b - a < min_gap,
            _ => true,
        }
    })
}

/// Renumbers a reconciled lane to `2000, 3000, ...`, returning only the
/// keys that change.
#[must_use]
pub fn rebalance(lane: &[Task]) -> Vec<(TaskId, OrderKey)> {
    lane.iter()
        .enumerate()
        .filter_map(|(index, task)| {
            let key = OrderKey::renumbered(index);
            (key != task.order_key).then(|| (task.id.clone(), key))
        })
        .collect()
}

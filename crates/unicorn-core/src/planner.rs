//! Drag-and-drop reorder planning.
//!
//! A gesture normally rewrites the moved task's key only. Neighbours whose
//! keys are still derived by reconciliation get those keys stored in the same
//! batch, and the whole lane is renumbered when the fractional keys around
//! the drop point have run out of room.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::order_key::OrderKey;
use crate::reconcile::reconcile_column;
use crate::{Column, OrderingError, Priority, Task, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DropTarget {
    /// Insert next to this task.
    Task(TaskId),
    /// Append to the column.
    Column(Column),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DragGesture {
    pub active: TaskId,
    pub target: DropTarget,
}

impl DragGesture {
    #[must_use]
    pub fn onto_task(active: TaskId, target: TaskId) -> Self {
        Self { active, target: DropTarget::Task(target) }
    }

    #[must_use]
    pub fn onto_column(active: TaskId, column: Column) -> Self {
        Self { active, target: DropTarget::Column(column) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyUpdate {
    pub task_id: TaskId,
    pub order_key: OrderKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Column>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderPlan {
    NoOp,
    Updates(Vec<KeyUpdate>),
}

impl ReorderPlan {
    #[must_use]
    pub fn updates(&self) -> &[KeyUpdate] {
        match self {
            Self::NoOp => &[],
            Self::Updates(updates) => updates,
        }
    }
}

/// Computes the key updates for a drag gesture over the tasks in scope.
///
/// Self-drops and targets that are no longer on the board yield
/// [`ReorderPlan::NoOp`]. A same-column drop next to a task of another
/// priority is rejected with [`OrderingError::PriorityMismatch`].
pub fn plan_reorder(tasks: &[Task], gesture: &DragGesture) -> Result<ReorderPlan, OrderingError> {
    let Some(active) = tasks.iter().find(|task| task.id == gesture.active) else {
        return Ok(ReorderPlan::NoOp);
    };

    let (destination, target) = match &gesture.target {
        DropTarget::Task(id) if *id == active.id => return Ok(ReorderPlan::NoOp),
        DropTarget::Task(id) => match tasks.iter().find(|task| task.id == *id) {
            Some(target) => (target.status, Some(target)),
            None => return Ok(ReorderPlan::NoOp),
        },
        DropTarget::Column(column) => (*column, None),
    };
    let same_column = destination == active.status;

    if destination == Column::Done {
        // `done` renders by completion time, keys carry no position there.
        if same_column {
            return Ok(ReorderPlan::NoOp);
        }
        return Ok(ReorderPlan::Updates(vec![KeyUpdate {
            task_id: active.id.clone(),
            order_key: active.order_key.clone(),
            status: Some(Column::Done),
        }]));
    }

    let full = reconcile_column(tasks, destination);
    let lane: Vec<Task> = full.iter().filter(|task| task.id != active.id).cloned().collect();
    let band = band_range(&lane, active.priority);

    let index = match target {
        None => {
            if same_column && is_band_tail(&full, &active.id) {
                return Ok(ReorderPlan::NoOp);
            }
            band.end
        }
        Some(target) => {
            let Some(target_index) = lane.iter().position(|task| task.id == target.id) else {
                return Ok(ReorderPlan::NoOp);
            };
            if same_column {
                if target.priority != active.priority {
                    return Err(OrderingError::PriorityMismatch {
                        active: active.id.clone(),
                        active_priority: active.priority,
                        target: target.id.clone(),
                        target_priority: target.priority,
                    });
                }
                let moving_down = position(&full, &active.id) < position(&full, &target.id);
                if moving_down { target_index + 1 } else { target_index }
            } else {
                target_index.clamp(band.start, band.end)
            }
        }
    };

    let left = (index > band.start).then(|| &lane[index - 1].order_key);
    let right = (index < band.end).then(|| &lane[index].order_key);
    let status = (!same_column).then_some(destination);

    let mut updates = match stable_key(left, right) {
        Some(order_key) => {
            let mut moved = active.clone();
            moved.order_key = order_key.clone();
            let mut ordered = lane.clone();
            ordered.insert(index, moved);
            let first = KeyUpdate { task_id: active.id.clone(), order_key, status };
            match pin_derived_keys(tasks, &ordered, &active.id) {
                Some(pins) => std::iter::once(first).chain(pins).collect(),
                None => renumber(&lane, Some((active, index, status))),
            }
        }
        None => renumber(&lane, Some((active, index, status))),
    };

    // Keys in `done` carry no position, nothing there needs pinning.
    if !same_column && active.status != Column::Done {
        let source: Vec<Task> = reconcile_column(tasks, active.status)
            .into_iter()
            .filter(|task| task.id != active.id)
            .collect();
        let pins = pin_derived_keys(tasks, &source, &active.id);
        updates.extend(pins.unwrap_or_else(|| renumber(&source, None)));
    }

    Ok(ReorderPlan::Updates(updates))
}

/// Writes planned keys and columns into `tasks`.
pub fn apply_updates(tasks: &mut [Task], updates: &[KeyUpdate]) {
    for update in updates {
        if let Some(task) = tasks.iter_mut().find(|task| task.id == update.task_id) {
            task.order_key = update.order_key.clone();
            if let Some(status) = update.status {
                task.status = status;
            }
        }
    }
}

/// Indices of `lane` holding tasks of `priority`; empty at the slot the band
/// would occupy when no such task exists.
fn band_range(lane: &[Task], priority: Priority) -> Range<usize> {
    let start = lane.partition_point(|task| task.priority > priority);
    let end = lane.partition_point(|task| task.priority >= priority);
    start..end
}

fn position(lane: &[Task], id: &TaskId) -> Option<usize> {
    lane.iter().position(|task| task.id == *id)
}

fn is_band_tail(lane: &[Task], id: &TaskId) -> bool {
    match position(lane, id) {
        Some(index) => lane.get(index + 1).is_none_or(|next| next.priority != lane[index].priority),
        None => false,
    }
}

/// A key strictly between `left` and `right` that reconciliation will keep
/// as stored. The default key is re-derived on every render, so it is only
/// acceptable for a task with no neighbours in its band.
fn stable_key(left: Option<&OrderKey>, right: Option<&OrderKey>) -> Option<OrderKey> {
    let mut key = OrderKey::between(left, right);
    if left.is_none() && right.is_none() {
        return Some(key);
    }
    if key.needs_repair() {
        key = OrderKey::between(left, Some(&key));
    }
    (!key.needs_repair() && key.is_strictly_between(left, right)).then_some(key)
}

/// Stores the keys reconciliation derived for tasks in `ordered` whose own
/// key is blank or the default. Derived keys follow recency position, which
/// shifts as soon as a task joins or leaves the lane. `None` when a derived
/// default key cannot be replaced without renumbering.
fn pin_derived_keys(tasks: &[Task], ordered: &[Task], skip: &TaskId) -> Option<Vec<KeyUpdate>> {
    let mut pins = Vec::new();
    for (index, task) in ordered.iter().enumerate() {
        if task.id == *skip || !stored_key(tasks, &task.id).is_some_and(OrderKey::needs_repair) {
            continue;
        }
        let left = index
            .checked_sub(1)
            .map(|previous| &ordered[previous])
            .filter(|neighbour| neighbour.priority == task.priority)
            .map(|neighbour| &neighbour.order_key);
        let right = ordered
            .get(index + 1)
            .filter(|neighbour| neighbour.priority == task.priority)
            .map(|neighbour| &neighbour.order_key);
        if left.is_none() && right.is_none() {
            continue;
        }
        let order_key =
            if task.order_key.needs_repair() { stable_key(left, right)? } else { task.order_key.clone() };
        pins.push(KeyUpdate { task_id: task.id.clone(), order_key, status: None });
    }
    Some(pins)
}

fn stored_key<'a>(tasks: &'a [Task], id: &TaskId) -> Option<&'a OrderKey> {
    tasks.iter().find(|task| task.id == *id).map(|task| &task.order_key)
}

/// Fresh keys for the whole lane, with `active` inserted at its index when
/// given.
fn renumber(lane: &[Task], active: Option<(&Task, usize, Option<Column>)>) -> Vec<KeyUpdate> {
    let mut ordered: Vec<&Task> = lane.iter().collect();
    if let Some((task, index, _)) = active {
        ordered.insert(index.min(ordered.len()), task);
    }
    ordered
        .into_iter()
        .enumerate()
        .map(|(position, task)| {
            let status = active.and_then(|(moved, _, status)| status.filter(|_| moved.id == task.id));
            KeyUpdate { task_id: task.id.clone(), order_key: OrderKey::renumbered(position), status }
        })
        .collect()
}

use thiserror::Error;

use crate::{Priority, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderingError {
    /// A same-column reorder would cross priority bands.
    #[error(
        "cannot reorder task {active} (priority {active_priority}) next to task {target} (priority {target_priority}); change its priority first"
    )]
    PriorityMismatch {
        active: TaskId,
        active_priority: Priority,
        target: TaskId,
        target_priority: Priority,
    },

    #[error("priority {0} is outside 1..=5")]
    InvalidPriority(u8),

    #[error("unknown column: {0}")]
    InvalidColumn(String),

    #[error("order key is not a finite number: {0:?}")]
    InvalidOrderKey(String),
}

//! Fractional order keys.
//!
//! Keys are decimal strings compared by numeric value. Inserting between two
//! neighbours takes the midpoint, so a move only ever rewrites the moved task.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::OrderingError;

pub const DEFAULT_ORDER_KEY: &str = "1000";

/// Distance between keys appended at an edge.
pub const KEY_STEP: f64 = 1000.0;

/// Lowest key produced by a head insert while there is room above it.
pub const HEAD_FLOOR: f64 = 100.0;

/// Below this gap two neighbours are treated as collapsed and the column
/// gets renumbered.
pub const MIN_KEY_GAP: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderKey(String);

impl OrderKey {
    /// Validating constructor for keys arriving from outside.
    pub fn parse(raw: &str) -> Result<Self, OrderingError> {
        let trimmed = raw.trim();
        match trimmed.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(Self(trimmed.to_string())),
            _ => Err(OrderingError::InvalidOrderKey(raw.to_string())),
        }
    }

    #[must_use]
    pub fn from_value(value: f64) -> Self {
        Self(format!("{value}"))
    }

    /// Key for the `index`-th task of a freshly numbered column.
    #[must_use]
    pub fn at_position(index: usize) -> Self {
        Self::from_value((index as f64 + 1.0) * KEY_STEP)
    }

    /// Key for the `index`-th task of a renumbered lane. Numbering starts one
    /// step past the default so no stored result is re-derived later.
    #[must_use]
    pub fn renumbered(index: usize) -> Self {
        Self::at_position(index + 1)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, `None` for empty or unparsable keys.
    #[must_use]
    pub fn value(&self) -> Option<f64> {
        self.0.trim().parse::<f64>().ok().filter(|value| value.is_finite())
    }

    /// True for keys reconciliation should re-derive: empty, unparsable, or
    /// still carrying the creation default.
    #[must_use]
    pub fn needs_repair(&self) -> bool {
        match self.value() {
            None => true,
            Some(value) => value == KEY_STEP,
        }
    }

    /// New key strictly between `left` and `right` (either may be an edge).
    #[must_use]
    pub fn between(left: Option<&OrderKey>, right: Option<&OrderKey>) -> Self {
        let left = left.and_then(OrderKey::value);
        let right = right.and_then(OrderKey::value);
        let value = match (left, right) {
            (None, None) => return Self::default(),
            (None, Some(right)) => head_value(right),
            (Some(left), None) => left + KEY_STEP,
            (Some(left), Some(right)) => (left + right) / 2.0,
        };
        Self::from_value(value)
    }

    /// Whether this key sorts strictly inside the given bounds, keeping at
    /// least [`MIN_KEY_GAP`] from each.
    #[must_use]
    pub fn is_strictly_between(&self, left: Option<&OrderKey>, right: Option<&OrderKey>) -> bool {
        let Some(value) = self.value() else {
            return false;
        };
        let above_left = left.and_then(OrderKey::value).is_none_or(|left| value - left >= MIN_KEY_GAP);
        let below_right =
            right.and_then(OrderKey::value).is_none_or(|right| right - value >= MIN_KEY_GAP);
        above_left && below_right
    }

    /// Numeric comparison; unparsable keys sort last.
    #[must_use]
    pub fn cmp_numeric(&self, other: &OrderKey) -> Ordering {
        match (self.value(), other.value()) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

fn head_value(right: f64) -> f64 {
    let candidate = (right - KEY_STEP).max(HEAD_FLOOR);
    if candidate < right {
        candidate
    } else if right > 0.0 {
        right / 2.0
    } else {
        right - KEY_STEP
    }
}

impl Default for OrderKey {
    fn default() -> Self {
        Self(DEFAULT_ORDER_KEY.to_string())
    }
}

impl From<String> for OrderKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for OrderKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

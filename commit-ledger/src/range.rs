/*!
Half-open millisecond time ranges
*/

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

pub const MINUTE_MS: i64 = 60 * 1000;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// A half-open `[start, end)` interval of epoch milliseconds.
///
/// Serialized as a two element array, `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[i64; 2]", into = "[i64; 2]")]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    /// Build a range, rejecting zero and negative lengths.
    pub fn new(start: i64, end: i64) -> Result<Self, LedgerError> {
        if start >= end {
            return Err(LedgerError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn duration_ms(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, other: &TimeRange) -> bool {
        self.start <= other.start && self.end >= other.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The common part of two ranges, if it has any length.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeRange { start, end })
    }
}

impl From<[i64; 2]> for TimeRange {
    fn from(bounds: [i64; 2]) -> Self {
        Self {
            start: bounds[0],
            end: bounds[1],
        }
    }
}

impl From<TimeRange> for [i64; 2] {
    fn from(range: TimeRange) -> Self {
        [range.start, range.end]
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

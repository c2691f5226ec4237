/*!
Output buckets and the updates they accumulate
*/

use std::ops::Range;

use crate::merge::{IntervalSeq, Merge, merge_interval, subtract};
use crate::range::TimeRange;

/// A policy-sized bucket holding the verified changes inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub range: TimeRange,
    pub committed: bool,
    pub updates: Vec<TimeRange>,
}

impl Output {
    pub fn new(range: TimeRange) -> Self {
        Self {
            range,
            committed: false,
            updates: Vec::new(),
        }
    }

    /// Record a change, clipped to this bucket. Returns whether the update set grew.
    pub fn add_update(&mut self, update: TimeRange) -> bool {
        match update.intersect(&self.range) {
            Some(clipped) => merge_interval(&mut self.updates, clipped).changed(),
            None => false,
        }
    }

    /// Drop any recorded change inside `window`.
    pub fn remove_updates(&mut self, window: TimeRange) -> bool {
        subtract(&mut self.updates, window)
    }

    pub fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    pub fn latest_update_end(&self) -> Option<i64> {
        self.updates.last().map(|update| update.end)
    }

    pub fn earliest_update_start(&self) -> Option<i64> {
        self.updates.first().map(|update| update.start)
    }
}

/// The output ledger seen as an interval sequence.
///
/// Adjacent outputs only combine when the policy allows it and neither side
/// has been committed already.
pub(crate) struct OutputSeq<'a> {
    pub(crate) outputs: &'a mut Vec<Output>,
    pub(crate) merge_adjacent: bool,
}

impl IntervalSeq for OutputSeq<'_> {
    type Entry = Output;

    fn len(&self) -> usize {
        self.outputs.len()
    }

    fn start(&self, index: usize) -> i64 {
        self.outputs[index].range.start
    }

    fn end(&self, index: usize) -> i64 {
        self.outputs[index].range.end
    }

    fn combine_contiguous(&self, index: usize) -> bool {
        self.merge_adjacent && !self.outputs[index].committed
    }

    fn drain(&mut self, indices: Range<usize>) -> Vec<Output> {
        self.outputs.drain(indices).collect()
    }

    fn insert(&mut self, index: usize, range: TimeRange) {
        self.outputs.insert(index, Output::new(range));
    }

    fn set_bounds(&mut self, index: usize, range: TimeRange) {
        self.outputs[index].range = range;
    }
}

/// Make sure an output exists for `bucket` and return its index. Outputs
/// swallowed by the merge hand their updates to the survivor.
pub(crate) fn ensure_output(outputs: &mut Vec<Output>, bucket: TimeRange, merge_adjacent: bool) -> usize {
    let outcome = merge_interval(
        &mut OutputSeq {
            outputs: &mut *outputs,
            merge_adjacent,
        },
        bucket,
    );
    let index = outcome.index();
    if let Merge::Extended { absorbed, .. } = outcome {
        let survivor = &mut outputs[index];
        for output in absorbed {
            survivor.committed &= output.committed;
            for update in output.updates {
                survivor.add_update(update);
            }
        }
    }
    index
}

/*!
Canonical interval sets.

One merge routine serves every ordered interval container in the crate:
the candidate queue, the output ledger and the updates inside each output.
Containers expose themselves through [`IntervalSeq`].
*/

use std::ops::Range;

use crate::range::TimeRange;

/// An ordered, indexable sequence of non-overlapping intervals.
pub trait IntervalSeq {
    /// Whatever the container stores per interval, returned when entries are absorbed.
    type Entry;

    fn len(&self) -> usize;

    fn start(&self, index: usize) -> i64;

    fn end(&self, index: usize) -> i64;

    /// Whether the entry may be combined with a range that only touches it.
    fn combine_contiguous(&self, _index: usize) -> bool {
        true
    }

    fn drain(&mut self, indices: Range<usize>) -> Vec<Self::Entry>;

    fn insert(&mut self, index: usize, range: TimeRange);

    /// Widen an existing entry in place.
    fn set_bounds(&mut self, index: usize, range: TimeRange);
}

/// Outcome of folding one range into an [`IntervalSeq`].
#[derive(Debug, PartialEq, Eq)]
pub enum Merge<E> {
    /// A single existing entry already covered the range; nothing changed.
    Covered(usize),
    /// No entry overlapped or touched the range, a new entry was inserted.
    Inserted(usize),
    /// The entry at `index` was widened; `absorbed` entries were removed and
    /// their payloads belong to it now.
    Extended { index: usize, absorbed: Vec<E> },
}

impl<E> Merge<E> {
    /// Index of the surviving entry.
    pub fn index(&self) -> usize {
        match self {
            Merge::Covered(index) | Merge::Inserted(index) => *index,
            Merge::Extended { index, .. } => *index,
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(self, Merge::Covered(_))
    }
}

/// Fold `range` into `seq`, keeping it sorted and free of overlaps (and of
/// touching neighbours where the entry allows combining).
pub fn merge_interval<S>(seq: &mut S, range: TimeRange) -> Merge<S::Entry>
where
    S: IntervalSeq + ?Sized,
{
    let len = seq.len();

    // Ends are strictly increasing, so the first candidate is a binary search away.
    let (mut low, mut high) = (0, len);
    while low < high {
        let mid = low + (high - low) / 2;
        if seq.end(mid) < range.start {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    let mut first = low;
    if first < len && seq.end(first) == range.start && !seq.combine_contiguous(first) {
        first += 1;
    }

    let mut last = first;
    while last < len
        && (seq.start(last) < range.end
            || (seq.start(last) == range.end && seq.combine_contiguous(last)))
    {
        last += 1;
    }

    if last == first {
        seq.insert(first, range);
        return Merge::Inserted(first);
    }

    if last - first == 1 && seq.start(first) <= range.start && seq.end(first) >= range.end {
        return Merge::Covered(first);
    }

    let merged = TimeRange {
        start: range.start.min(seq.start(first)),
        end: range.end.max(seq.end(last - 1)),
    };
    let absorbed = seq.drain(first + 1..last);
    seq.set_bounds(first, merged);
    Merge::Extended {
        index: first,
        absorbed,
    }
}

/// Remove `cut` from a canonical list of ranges, splitting entries that
/// straddle it. Returns whether anything was removed.
pub fn subtract(ranges: &mut Vec<TimeRange>, cut: TimeRange) -> bool {
    let mut changed = false;
    let mut kept = Vec::with_capacity(ranges.len() + 1);
    for range in ranges.drain(..) {
        if !range.overlaps(&cut) {
            kept.push(range);
            continue;
        }
        changed = true;
        if range.start < cut.start {
            kept.push(TimeRange {
                start: range.start,
                end: cut.start,
            });
        }
        if range.end > cut.end {
            kept.push(TimeRange {
                start: cut.end,
                end: range.end,
            });
        }
    }
    *ranges = kept;
    changed
}

impl IntervalSeq for Vec<TimeRange> {
    type Entry = TimeRange;

    fn len(&self) -> usize {
        <[TimeRange]>::len(self)
    }

    fn start(&self, index: usize) -> i64 {
        self[index].start
    }

    fn end(&self, index: usize) -> i64 {
        self[index].end
    }

    fn drain(&mut self, indices: Range<usize>) -> Vec<TimeRange> {
        Vec::drain(self, indices).collect()
    }

    fn insert(&mut self, index: usize, range: TimeRange) {
        Vec::insert(self, index, range);
    }

    fn set_bounds(&mut self, index: usize, range: TimeRange) {
        self[index] = range;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: i64, end: i64) -> TimeRange {
        TimeRange { start, end }
    }

    #[test]
    fn overlapping_ranges_merge() {
        let mut set: Vec<TimeRange> = Vec::new();
        merge_interval(&mut set, r(100, 200));
        merge_interval(&mut set, r(150, 300));
        assert_eq!(set, vec![r(100, 300)]);
    }

    #[test]
    fn disjoint_ranges_stay_sorted() {
        let mut set: Vec<TimeRange> = Vec::new();
        merge_interval(&mut set, r(300, 400));
        merge_interval(&mut set, r(100, 200));
        assert_eq!(set, vec![r(100, 200), r(300, 400)]);
    }

    #[test]
    fn touching_ranges_combine() {
        let mut set = vec![r(0, 10), r(20, 30)];
        let outcome = merge_interval(&mut set, r(10, 20));
        assert_eq!(set, vec![r(0, 30)]);
        assert_eq!(
            outcome,
            Merge::Extended {
                index: 0,
                absorbed: vec![r(20, 30)]
            }
        );
    }

    #[test]
    fn covered_range_is_a_no_op() {
        let mut set = vec![r(0, 100)];
        assert_eq!(merge_interval(&mut set, r(10, 20)), Merge::Covered(0));
        assert_eq!(set, vec![r(0, 100)]);
    }

    #[test]
    fn spanning_range_absorbs_contained_entries() {
        let mut set = vec![r(10, 20), r(30, 40), r(50, 60), r(90, 95)];
        let outcome = merge_interval(&mut set, r(5, 55));
        assert_eq!(set, vec![r(5, 60), r(90, 95)]);
        assert_eq!(outcome.index(), 0);
        assert!(outcome.changed());
    }

    #[test]
    fn merging_is_idempotent() {
        let mut once: Vec<TimeRange> = Vec::new();
        merge_interval(&mut once, r(100, 200));
        let mut twice = once.clone();
        merge_interval(&mut twice, r(100, 200));
        assert_eq!(once, twice);
    }

    struct Buckets(Vec<TimeRange>);

    impl IntervalSeq for Buckets {
        type Entry = TimeRange;

        fn len(&self) -> usize {
            self.0.len()
        }

        fn start(&self, index: usize) -> i64 {
            self.0[index].start
        }

        fn end(&self, index: usize) -> i64 {
            self.0[index].end
        }

        fn combine_contiguous(&self, _index: usize) -> bool {
            false
        }

        fn drain(&mut self, indices: Range<usize>) -> Vec<TimeRange> {
            self.0.drain(indices).collect()
        }

        fn insert(&mut self, index: usize, range: TimeRange) {
            self.0.insert(index, range);
        }

        fn set_bounds(&mut self, index: usize, range: TimeRange) {
            self.0[index] = range;
        }
    }

    #[test]
    fn non_combining_entries_stay_adjacent() {
        let mut buckets = Buckets(vec![r(0, 10)]);
        assert_eq!(merge_interval(&mut buckets, r(10, 20)), Merge::Inserted(1));
        assert_eq!(merge_interval(&mut buckets, r(10, 20)), Merge::Covered(1));
        assert_eq!(merge_interval(&mut buckets, r(20, 30)), Merge::Inserted(2));
        assert_eq!(buckets.0, vec![r(0, 10), r(10, 20), r(20, 30)]);
    }

    #[test]
    fn subtract_splits_straddling_entries() {
        let mut set = vec![r(0, 100), r(150, 200), r(300, 400)];
        assert!(subtract(&mut set, r(50, 160)));
        assert_eq!(set, vec![r(0, 50), r(160, 200), r(300, 400)]);
        assert!(!subtract(&mut set, r(500, 600)));
    }
}

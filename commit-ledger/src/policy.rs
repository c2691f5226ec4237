/*!
Commit policies: how updates are bucketed into outputs and when an output is
ready to be committed.
*/

use chrono::{DateTime, Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::ledger::Output;
use crate::range::{DAY_MS, HOUR_MS, MINUTE_MS, TimeRange};

/// Hooks a tracker consults while folding updates and committing outputs.
pub trait OutputPolicy: Send + Sync {
    /// Adjust a candidate before verification; `None` drops it.
    fn round_candidate(&self, candidate: TimeRange, _now: i64) -> Option<TimeRange> {
        Some(candidate)
    }

    /// Output buckets an update contributes to, in time order.
    fn updated_to_outputs(&self, update: TimeRange, now: i64) -> Vec<TimeRange>;

    /// Whether touching outputs collapse into one.
    fn merge_adjacent_outputs(&self) -> bool {
        false
    }

    /// Whether `outputs[index]` should be committed now. Later outputs are
    /// visible so that activity after a bucket can close it.
    fn is_ready(&self, index: usize, outputs: &[Output], now: i64) -> bool;

    /// Keep a committed output around so later corrections resubmit it.
    fn retain_after_commit(&self) -> bool {
        false
    }

    /// Outputs too old to ever be committed.
    fn is_expired(&self, _output: &Output, _now: i64) -> bool {
        false
    }
}

/// Bucket size for generic file inspection trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Granularity {
    /// Every update is its own output; touching outputs merge.
    #[default]
    Unbounded,
    Year,
    Hour,
    /// Epoch aligned buckets of a fixed size.
    Fixed { millis: i64 },
}

impl Granularity {
    pub fn buckets(&self, range: TimeRange) -> Vec<TimeRange> {
        match self {
            Granularity::Unbounded => vec![range],
            Granularity::Year => year_buckets(range),
            Granularity::Hour => fixed_buckets(range, HOUR_MS),
            Granularity::Fixed { millis } => fixed_buckets(range, *millis),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileInspectionPolicy {
    pub granularity: Granularity,
}

impl OutputPolicy for FileInspectionPolicy {
    fn updated_to_outputs(&self, update: TimeRange, _now: i64) -> Vec<TimeRange> {
        self.granularity.buckets(update)
    }

    fn merge_adjacent_outputs(&self) -> bool {
        self.granularity == Granularity::Unbounded
    }

    fn is_ready(&self, index: usize, outputs: &[Output], _now: i64) -> bool {
        outputs[index].has_updates()
    }
}

/// Calendar year submissions that are resubmitted when late corrections arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct YearlyPolicy;

impl OutputPolicy for YearlyPolicy {
    fn updated_to_outputs(&self, update: TimeRange, _now: i64) -> Vec<TimeRange> {
        year_buckets(update)
    }

    fn is_ready(&self, index: usize, outputs: &[Output], _now: i64) -> bool {
        let output = &outputs[index];
        let Some(latest) = output.latest_update_end() else {
            return false;
        };
        if latest >= output.range.end - DAY_MS {
            return true;
        }

        // Otherwise the following year must have data within its first day.
        outputs.get(index + 1).is_some_and(|next| {
            next.range.start == output.range.end
                && next
                    .earliest_update_start()
                    .is_some_and(|start| start < next.range.start + DAY_MS)
        })
    }

    fn retain_after_commit(&self) -> bool {
        true
    }
}

/// Hourly uploads that are only worth sending while recent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NearRealTimePolicy {
    pub maximum_age_ms: i64,
}

impl NearRealTimePolicy {
    pub const DEFAULT_MAXIMUM_AGE_MS: i64 = 2 * DAY_MS;

    fn cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(self.maximum_age_ms)
    }
}

impl Default for NearRealTimePolicy {
    fn default() -> Self {
        Self {
            maximum_age_ms: Self::DEFAULT_MAXIMUM_AGE_MS,
        }
    }
}

impl OutputPolicy for NearRealTimePolicy {
    fn round_candidate(&self, candidate: TimeRange, now: i64) -> Option<TimeRange> {
        let earliest = floor_to(self.cutoff(now), HOUR_MS);
        let start = candidate.start.max(earliest);
        (start < candidate.end).then_some(TimeRange {
            start,
            end: candidate.end,
        })
    }

    fn updated_to_outputs(&self, update: TimeRange, now: i64) -> Vec<TimeRange> {
        let cutoff = self.cutoff(now);
        // Hours are enumerated no further ahead of `now` than they are kept behind it.
        let window = TimeRange {
            start: update.start.max(floor_to(cutoff, HOUR_MS)),
            end: update.end.min(now.saturating_add(self.maximum_age_ms)),
        };
        if window.is_empty() {
            return Vec::new();
        }
        fixed_buckets(window, HOUR_MS)
            .into_iter()
            .filter(|bucket| bucket.end >= cutoff)
            .collect()
    }

    fn is_ready(&self, index: usize, outputs: &[Output], now: i64) -> bool {
        let output = &outputs[index];
        if self.is_expired(output, now) {
            return false;
        }
        let final_minute = output.range.end - MINUTE_MS;
        if output
            .latest_update_end()
            .is_some_and(|end| end > final_minute)
        {
            return true;
        }
        outputs[index + 1..].iter().any(Output::has_updates)
    }

    fn is_expired(&self, output: &Output, now: i64) -> bool {
        output.range.end < self.cutoff(now)
    }
}

/// The closed set of policies a tracker can run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    FileInspection(FileInspectionPolicy),
    Yearly(YearlyPolicy),
    NearRealTime(NearRealTimePolicy),
}

impl Policy {
    pub fn rules(&self) -> &dyn OutputPolicy {
        match self {
            Policy::FileInspection(policy) => policy as &dyn OutputPolicy,
            Policy::Yearly(policy) => policy as &dyn OutputPolicy,
            Policy::NearRealTime(policy) => policy as &dyn OutputPolicy,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Policy::FileInspection(_) => "file_inspection",
            Policy::Yearly(_) => "yearly",
            Policy::NearRealTime(_) => "near_real_time",
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::FileInspection(FileInspectionPolicy::default())
    }
}

fn floor_to(ms: i64, size: i64) -> i64 {
    ms.div_euclid(size) * size
}

fn fixed_buckets(range: TimeRange, size: i64) -> Vec<TimeRange> {
    if size <= 0 {
        return vec![range];
    }
    let mut buckets = Vec::new();
    let mut start = floor_to(range.start, size);
    while start < range.end {
        let end = start.saturating_add(size);
        buckets.push(TimeRange { start, end });
        start = end;
    }
    buckets
}

fn year_start(year: i32) -> Option<i64> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().timestamp_millis())
}

/// Calendar year (UTC) buckets overlapping `range`. Years outside what the
/// calendar can represent are skipped.
fn year_buckets(range: TimeRange) -> Vec<TimeRange> {
    let (Some(first), Some(last)) = (
        DateTime::from_timestamp_millis(range.start),
        DateTime::from_timestamp_millis(range.end - 1),
    ) else {
        return Vec::new();
    };
    (first.year()..=last.year())
        .filter_map(|year| {
            Some(TimeRange {
                start: year_start(year)?,
                end: year_start(year + 1)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn year(y: i32) -> TimeRange {
        TimeRange {
            start: year_start(y).unwrap(),
            end: year_start(y + 1).unwrap(),
        }
    }

    fn output(range: TimeRange, updates: &[TimeRange]) -> Output {
        let mut output = Output::new(range);
        for update in updates {
            output.add_update(*update);
        }
        output
    }

    #[test]
    fn year_buckets_follow_the_calendar() {
        let y2019 = year(2019);
        let y2020 = year(2020);
        let span = TimeRange {
            start: y2019.end - DAY_MS,
            end: y2020.start + DAY_MS,
        };
        assert_eq!(year_buckets(span), vec![y2019, y2020]);
        // 2020 is a leap year.
        assert_eq!(y2020.duration_ms(), 366 * DAY_MS);
    }

    #[test]
    fn hour_buckets_align_to_the_clock() {
        let range = TimeRange {
            start: HOUR_MS + 5,
            end: 3 * HOUR_MS + 1,
        };
        let buckets = fixed_buckets(range, HOUR_MS);
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].start, HOUR_MS);
        assert_eq!(buckets[2].end, 4 * HOUR_MS);
    }

    #[test]
    fn yearly_waits_for_the_end_of_the_year() {
        let y2020 = year(2020);
        let early = TimeRange {
            start: y2020.start,
            end: y2020.end - 2 * DAY_MS,
        };
        let outputs = vec![output(y2020, &[early])];
        assert!(!YearlyPolicy.is_ready(0, &outputs, 0));

        let late = TimeRange {
            start: y2020.end - DAY_MS / 2,
            end: y2020.end,
        };
        let outputs = vec![output(y2020, &[early, late])];
        assert!(YearlyPolicy.is_ready(0, &outputs, 0));
    }

    #[test]
    fn yearly_is_closed_by_the_following_year() {
        let y2020 = year(2020);
        let y2021 = year(2021);
        let early = TimeRange {
            start: y2020.start,
            end: y2020.start + DAY_MS,
        };

        // Activity later in the following year is not enough on its own,
        // only data within that year's first day closes this one.
        let mid_next = TimeRange {
            start: y2021.start + 10 * DAY_MS,
            end: y2021.start + 11 * DAY_MS,
        };
        let outputs = vec![output(y2020, &[early]), output(y2021, &[mid_next])];
        assert!(!YearlyPolicy.is_ready(0, &outputs, 0));

        let mut committed_next = output(y2021, &[mid_next]);
        committed_next.committed = true;
        let outputs = vec![output(y2020, &[early]), committed_next];
        assert!(!YearlyPolicy.is_ready(0, &outputs, 0));

        let y2022 = year(2022);
        let start_skipped = TimeRange {
            start: y2022.start,
            end: y2022.start + HOUR_MS,
        };
        let outputs = vec![output(y2020, &[early]), output(y2022, &[start_skipped])];
        assert!(!YearlyPolicy.is_ready(0, &outputs, 0));

        let start_next = TimeRange {
            start: y2021.start,
            end: y2021.start + HOUR_MS,
        };
        let outputs = vec![output(y2020, &[early]), output(y2021, &[start_next])];
        assert!(YearlyPolicy.is_ready(0, &outputs, 0));
    }

    #[test]
    fn near_real_time_readiness() {
        let policy = NearRealTimePolicy {
            maximum_age_ms: DAY_MS,
        };
        let now = 100 * DAY_MS;
        let hour = TimeRange {
            start: now - 3 * HOUR_MS,
            end: now - 2 * HOUR_MS,
        };
        let partial = TimeRange {
            start: hour.start,
            end: hour.start + 30 * MINUTE_MS,
        };
        let outputs = vec![output(hour, &[partial])];
        assert!(!policy.is_ready(0, &outputs, now));

        let final_minute = TimeRange {
            start: hour.end - MINUTE_MS,
            end: hour.end,
        };
        let outputs = vec![output(hour, &[partial, final_minute])];
        assert!(policy.is_ready(0, &outputs, now));

        let next_hour = TimeRange {
            start: hour.end,
            end: hour.end + HOUR_MS,
        };
        let activity = TimeRange {
            start: next_hour.start + MINUTE_MS,
            end: next_hour.start + 2 * MINUTE_MS,
        };
        let outputs = vec![output(hour, &[partial]), output(next_hour, &[activity])];
        assert!(policy.is_ready(0, &outputs, now));
    }

    #[test]
    fn near_real_time_drops_stale_hours() {
        let policy = NearRealTimePolicy {
            maximum_age_ms: DAY_MS,
        };
        let now = 100 * DAY_MS;
        let stale = TimeRange {
            start: now - 3 * DAY_MS,
            end: now - 3 * DAY_MS + HOUR_MS,
        };
        assert!(policy.updated_to_outputs(stale, now).is_empty());
        assert_eq!(policy.round_candidate(stale, now), None);

        let outputs = vec![output(stale, &[stale])];
        assert!(policy.is_expired(&outputs[0], now));
        assert!(!policy.is_ready(0, &outputs, now));
    }

    #[test]
    fn near_real_time_bounds_unbounded_updates() {
        let policy = NearRealTimePolicy {
            maximum_age_ms: DAY_MS,
        };
        let now = 100 * DAY_MS;
        let buckets = policy.updated_to_outputs(TimeRange { start: 0, end: i64::MAX }, now);
        assert_eq!(buckets.len(), 48);
        assert_eq!(buckets[0].start, now - DAY_MS);
        assert_eq!(buckets[47].end, now + DAY_MS);

        let far_future = TimeRange {
            start: now + 2 * DAY_MS,
            end: now + 3 * DAY_MS,
        };
        assert!(policy.updated_to_outputs(far_future, now).is_empty());
    }
}

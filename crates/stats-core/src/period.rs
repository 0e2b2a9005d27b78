//! Active period tracking.
//!
//! Every observed activity timestamp `t` is taken to mean "the user was
//! active from `t` until `t + cutoff`". [`IntervalMerger`] keeps the union
//! of those spans as a minimal sorted set of disjoint intervals, clipped at
//! a ceiling (usually "now") so inferred activity never reaches the future.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// A contiguous span of inferred activity, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeInterval {
    /// Length of the span.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Inclusive at both ends: a timestamp on `end` extends the span.
    fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Merges activity timestamps into disjoint, non-adjacent intervals.
///
/// After every [`append`](Self::append) the intervals are sorted by start,
/// each satisfies `start <= end <= max_time`, and `end < next.start` holds
/// between neighbours. The final set does not depend on insertion order.
#[derive(Debug, Clone)]
pub struct IntervalMerger {
    intervals: Vec<TimeInterval>,
    cutoff: Duration,
    max_time: DateTime<Utc>,
}

impl IntervalMerger {
    /// Creates an empty merger.
    ///
    /// `cutoff` is how long after an event the user still counts as
    /// active; `max_time` caps every interval end.
    pub const fn new(cutoff: Duration, max_time: DateTime<Utc>) -> Self {
        Self {
            intervals: Vec::new(),
            cutoff,
            max_time,
        }
    }

    /// Ceiling for interval ends.
    pub const fn max_time(&self) -> DateTime<Utc> {
        self.max_time
    }

    /// Records activity at `t`.
    ///
    /// Timestamps after `max_time` are ignored: they cannot contribute any
    /// activity before the ceiling. A negative cutoff counts as zero.
    pub fn append(&mut self, t: DateTime<Utc>) {
        if t > self.max_time {
            return;
        }
        let end = t
            .checked_add_signed(self.cutoff)
            .map_or(self.max_time, |end| end.min(self.max_time))
            .max(t);

        if self.intervals.is_empty() {
            self.intervals.push(TimeInterval { start: t, end });
            return;
        }

        // First interval whose start is not before `t`.
        let i = self.intervals.partition_point(|interval| interval.start < t);

        if i >= 1 && self.intervals[i - 1].contains(t) {
            self.extend_at(i - 1, end);
        } else if i < self.intervals.len() && self.intervals[i].contains(t) {
            self.extend_at(i, end);
        } else {
            self.intervals.insert(i, TimeInterval { start: t, end });
            self.merge_following(i);
        }
    }

    /// Records every timestamp in iteration order.
    pub fn extend<I>(&mut self, timestamps: I)
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        for t in timestamps {
            self.append(t);
        }
    }

    /// Sum of all interval lengths; zero when nothing was recorded.
    pub fn calc_total(&self) -> Duration {
        self.intervals
            .iter()
            .fold(Duration::zero(), |total, interval| total + interval.duration())
    }

    /// The current interval set, ascending by start.
    pub fn intervals(&self) -> &[TimeInterval] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    fn extend_at(&mut self, i: usize, end: DateTime<Utc>) {
        let interval = &mut self.intervals[i];
        interval.end = interval.end.max(end);
        self.merge_following(i);
    }

    /// Absorbs every successor that overlaps or touches interval `i`.
    fn merge_following(&mut self, i: usize) {
        while i + 1 < self.intervals.len() && self.intervals[i].end >= self.intervals[i + 1].start
        {
            let next = self.intervals.remove(i + 1);
            let interval = &mut self.intervals[i];
            interval.end = interval.end.max(next.end);
        }
    }
}

// Copyright 2024-2026 The metrics-harvester authors.
// This file is part of metrics-harvester.

// metrics-harvester is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// metrics-harvester is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
// You should have received a copy of the GNU General Public License
// along with metrics-harvester.  If not, see <http://www.gnu.org/licenses/>.

//! Interval arithmetic over harvested time ranges. Coverage bookkeeping is
//! kept apart from the cached payload so these stay pure functions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An interval of time, inclusive at both endpoints. Two ranges touching at
/// an endpoint are adjacent and can be coalesced into one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
	pub start: DateTime<Utc>,
	pub end: DateTime<Utc>,
}

/// The bounds and resolution of one range query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryRange {
	pub start: DateTime<Utc>,
	pub end: DateTime<Utc>,
	pub step: Duration,
}

impl QueryRange {
	/// Number of whole steps between the bounds, truncating.
	pub fn num_steps(&self) -> i64 {
		(self.end - self.start).num_seconds() / self.step.num_seconds()
	}

	pub fn time_range(&self) -> TimeRange {
		TimeRange { start: self.start, end: self.end }
	}
}

/// Determines if the time falls within the range.
pub fn within(t: DateTime<Utc>, r: &TimeRange) -> bool {
	r.start <= t && t <= r.end
}

/// Minimizes the number of ranges needed to describe a set of times, merging
/// ranges that touch at an endpoint. The output is sorted by start time.
pub fn coalesce(mut ranges: Vec<TimeRange>) -> Vec<TimeRange> {
	// repeat single passes until one produces no merge
	while let Some(merged) = coalesce_once(&ranges) {
		ranges = merged;
	}
	ranges.sort_by_key(|r| r.start);
	ranges
}

fn coalesce_once(ranges: &[TimeRange]) -> Option<Vec<TimeRange>> {
	for i in 0..ranges.len() {
		for j in (i + 1)..ranges.len() {
			let merged = if ranges[i].end == ranges[j].start {
				Some(TimeRange { start: ranges[i].start, end: ranges[j].end })
			} else if ranges[i].start == ranges[j].end {
				Some(TimeRange { start: ranges[j].start, end: ranges[i].end })
			} else {
				None
			};
			if let Some(merged) = merged {
				let mut out = Vec::with_capacity(ranges.len() - 1);
				out.extend_from_slice(&ranges[..i]);
				out.extend_from_slice(&ranges[i + 1..j]);
				out.extend_from_slice(&ranges[j + 1..]);
				out.push(merged);
				return Some(out);
			}
		}
	}
	None
}

/// Determines the largest subset ranges of `r` that are not covered by any
/// range in `coverage`. The result is disjoint, non-touching and sorted; its
/// union is exactly `r` minus the covered extents.
pub fn uncovered_ranges(r: TimeRange, coverage: &[TimeRange]) -> Vec<TimeRange> {
	let mut covered = Vec::new();
	for extent in coverage {
		let starts_inside = within(extent.start, &r);
		let ends_inside = within(extent.end, &r);
		match (starts_inside, ends_inside) {
			(true, true) => covered.push(*extent),
			(true, false) => covered.push(TimeRange { start: extent.start, end: r.end }),
			(false, true) => covered.push(TimeRange { start: r.start, end: extent.end }),
			(false, false) => {
				if extent.start < r.start && extent.end > r.end {
					covered.push(r);
				}
				// otherwise the extent is disjoint from r
			}
		}
	}
	covered.sort_by_key(|c| c.start);
	let covered = coalesce(covered);

	if covered.is_empty() {
		return vec![r];
	}
	let mut uncovered = Vec::new();
	if covered[0].start != r.start {
		uncovered.push(TimeRange { start: r.start, end: covered[0].start });
	}
	for pair in covered.windows(2) {
		uncovered.push(TimeRange { start: pair[0].end, end: pair[1].start });
	}
	if covered[covered.len() - 1].end != r.end {
		uncovered.push(TimeRange { start: covered[covered.len() - 1].end, end: r.end });
	}
	uncovered
}

#[cfg(test)]
mod test {
	use super::*;
	use chrono::TimeZone;

	fn ts(secs: i64) -> DateTime<Utc> {
		Utc.timestamp_opt(secs, 0).unwrap()
	}

	fn range(start: i64, end: i64) -> TimeRange {
		TimeRange { start: ts(start), end: ts(end) }
	}

	#[test]
	fn within_is_inclusive_at_both_ends() {
		let r = range(10, 20);
		assert!(within(ts(10), &r));
		assert!(within(ts(15), &r));
		assert!(within(ts(20), &r));
		assert!(!within(ts(9), &r));
		assert!(!within(ts(21), &r));
	}

	#[test]
	fn uncovered_of_empty_cover_is_the_whole_range() {
		assert_eq!(uncovered_ranges(range(100, 200), &[]), vec![range(100, 200)]);
	}

	#[test]
	fn uncovered_emits_leading_internal_and_trailing_gaps() {
		let got = uncovered_ranges(range(0, 100), &[range(10, 30), range(50, 70)]);
		assert_eq!(got, vec![range(0, 10), range(30, 50), range(70, 100)]);
	}

	#[test]
	fn extent_enclosing_the_range_covers_everything() {
		let got = uncovered_ranges(range(10, 20), &[range(0, 100)]);
		assert!(got.is_empty());
	}

	#[test]
	fn extents_are_clipped_to_the_query_range() {
		// hangs over the left edge
		let got = uncovered_ranges(range(10, 100), &[range(0, 30)]);
		assert_eq!(got, vec![range(30, 100)]);
		// hangs over the right edge
		let got = uncovered_ranges(range(10, 100), &[range(80, 200)]);
		assert_eq!(got, vec![range(10, 80)]);
		// fully disjoint extents are dropped
		let got = uncovered_ranges(range(10, 100), &[range(200, 300)]);
		assert_eq!(got, vec![range(10, 100)]);
	}

	#[test]
	fn coalesce_merges_touching_ranges() {
		let got = coalesce(vec![range(10, 20), range(30, 40), range(20, 30)]);
		assert_eq!(got, vec![range(10, 40)]);
	}

	#[test]
	fn coalesce_leaves_disjoint_ranges_sorted() {
		let got = coalesce(vec![range(30, 40), range(0, 10)]);
		assert_eq!(got, vec![range(0, 10), range(30, 40)]);
	}

	#[test]
	fn coalesce_is_idempotent() {
		let inputs = vec![
			vec![],
			vec![range(0, 10)],
			vec![range(10, 20), range(30, 40), range(20, 30)],
			vec![range(0, 5), range(5, 10), range(10, 15), range(40, 50)],
			vec![range(70, 80), range(0, 10), range(10, 20), range(50, 60)],
		];
		for input in inputs {
			let once = coalesce(input);
			let twice = coalesce(once.clone());
			assert_eq!(once, twice);
			assert!(once.windows(2).all(|w| w[0].start < w[1].start), "output must be sorted: {:?}", once);
		}
	}

	// Every instant of the query range lands in exactly one of: an uncovered
	// gap or a covered extent. Checked on a second granularity grid.
	#[test]
	fn uncovered_and_cover_partition_the_range() {
		let covers: Vec<Vec<TimeRange>> = vec![
			vec![],
			vec![range(0, 200)],
			vec![range(10, 30), range(50, 70)],
			vec![range(0, 10), range(90, 100)],
			vec![range(20, 40), range(40, 60)],
			vec![range(95, 130)],
		];
		let r = range(10, 90);
		for coverage in covers {
			let uncovered = uncovered_ranges(r, &coverage);
			// gaps never touch each other
			for pair in uncovered.windows(2) {
				assert!(pair[0].end < pair[1].start, "gaps must be disjoint: {:?}", uncovered);
			}
			for secs in 10..=90 {
				let t = ts(secs);
				let in_gap = uncovered.iter().any(|g| within(t, g));
				let in_cover = coverage.iter().any(|c| within(t, c));
				// endpoints shared between a gap and an extent are expected:
				// ranges are inclusive, so a gap closes where cover begins
				let boundary = uncovered.iter().any(|g| g.start == t || g.end == t);
				assert!(
					in_gap || in_cover,
					"instant {} lost from the partition of {:?}",
					secs,
					coverage
				);
				if in_gap && in_cover {
					assert!(boundary, "instant {} double-counted away from a boundary", secs);
				}
			}
		}
	}

	#[test]
	fn query_range_counts_whole_steps() {
		let r = QueryRange { start: ts(0), end: ts(600), step: Duration::minutes(1) };
		assert_eq!(r.num_steps(), 10);
		// a partial trailing step does not count
		let r = QueryRange { start: ts(0), end: ts(659), step: Duration::minutes(1) };
		assert_eq!(r.num_steps(), 10);
	}
}

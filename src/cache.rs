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

//! The persistent unit of the harvest, one per metric: a histogram per
//! series fingerprint, secondary indices by structured identity, and the
//! per-server record of which time ranges were already pulled. Every map is
//! ordered so the persisted encoding is canonical.

use std::collections::BTreeMap;

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};

use crate::{
	error::Result,
	histogram::Histogram,
	range::{coalesce, TimeRange},
	types::{Fingerprint, FullMetadata, SampleStream, StepMetadata},
};

/// Upper bound on fingerprints retained per identity; older arrivals are
/// evicted first.
pub const MAX_FINGERPRINTS_PER_IDENTITY: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedQuery {
	/// The query expression the data was produced with.
	pub metric: String,
	/// Per server, the coalesced cover of ranges already harvested.
	pub ranges_by_cluster: BTreeMap<String, Vec<TimeRange>>,
	/// Sample distribution per series.
	pub data: BTreeMap<Fingerprint, Histogram>,
	/// Fingerprints per full identity, in arrival order.
	pub data_by_metadata: BTreeMap<FullMetadata, Vec<Fingerprint>>,
	/// Fingerprints per step identity; only series belonging to a step.
	pub data_by_step: BTreeMap<StepMetadata, Vec<Fingerprint>>,
}

impl CachedQuery {
	/// An empty cache seeded with an empty cover per known server.
	pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(metric: &str, clusters: I) -> Self {
		CachedQuery {
			metric: metric.to_owned(),
			ranges_by_cluster: clusters.into_iter().map(|name| (name.into(), Vec::new())).collect(),
			data: BTreeMap::new(),
			data_by_metadata: BTreeMap::new(),
			data_by_step: BTreeMap::new(),
		}
	}

	pub fn ranges_for(&self, cluster: &str) -> &[TimeRange] {
		self.ranges_by_cluster.get(cluster).map(Vec::as_slice).unwrap_or(&[])
	}

	/// Merge one query response into the cache and extend the cluster's
	/// cover by the queried range.
	///
	/// Fingerprints are unique per label set, so a fingerprint that already
	/// has a histogram is also already indexed; only its histogram grows.
	/// Re-recording the same range would double-count values — the caller
	/// guards against that by only querying uncovered ranges.
	pub fn record(&mut self, cluster: &str, r: TimeRange, matrix: &[SampleStream]) {
		let mut cover = self.ranges_by_cluster.remove(cluster).unwrap_or_default();
		cover.push(r);
		self.ranges_by_cluster.insert(cluster.to_owned(), coalesce(cover));

		for stream in matrix {
			let fingerprint = stream.fingerprint();
			let meta = FullMetadata::from_labels(&stream.labels);
			let seen = self.data.contains_key(&fingerprint);
			let hist = self.data.entry(fingerprint).or_insert_with(Histogram::new);
			for sample in &stream.values {
				if let Err(err) = hist.record(sample.value) {
					log::warn!("Failed to insert data into histogram. This should never happen: {}", err);
				}
			}
			if !seen {
				if let Some(step_meta) = meta.step_metadata() {
					self.data_by_step.entry(step_meta).or_insert_with(Vec::new).push(fingerprint);
				}
				self.data_by_metadata.entry(meta).or_insert_with(Vec::new).push(fingerprint);
			}
		}
	}

	/// Cap every identity at [`MAX_FINGERPRINTS_PER_IDENTITY`] series by
	/// evicting the oldest arrivals, dropping their histograms and their
	/// step-index references. A fingerprint belongs to exactly one identity,
	/// so eviction under one never invalidates another.
	pub fn prune(&mut self) {
		for (meta, values) in self.data_by_metadata.iter_mut() {
			if values.len() <= MAX_FINGERPRINTS_PER_IDENTITY {
				continue;
			}
			let cutoff = values.len() - MAX_FINGERPRINTS_PER_IDENTITY;
			let to_remove: HashSet<Fingerprint> = values.drain(..cutoff).collect();
			for fingerprint in &to_remove {
				self.data.remove(fingerprint);
			}
			if let Some(step_meta) = meta.step_metadata() {
				if let Some(step_values) = self.data_by_step.get_mut(&step_meta) {
					step_values.retain(|fingerprint| !to_remove.contains(fingerprint));
				}
			}
		}
	}

	/// Encode for the object store. Named-field encoding keeps the blob
	/// self-describing; ordered maps keep it canonical.
	pub fn to_bytes(&self) -> Result<Vec<u8>> {
		Ok(rmp_serde::to_vec_named(self)?)
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
		Ok(rmp_serde::from_slice(bytes)?)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::types::{Labels, SamplePair, LABEL_CONTAINER, LABEL_ORG, LABEL_POD, LABEL_STEP};
	use chrono::{DateTime, TimeZone, Utc};

	fn ts(secs: i64) -> DateTime<Utc> {
		Utc.timestamp_opt(secs, 0).unwrap()
	}

	fn range(start: i64, end: i64) -> TimeRange {
		TimeRange { start: ts(start), end: ts(end) }
	}

	fn stream(pod: &str, step: &str, values: &[f64]) -> SampleStream {
		let mut labels = Labels::new();
		labels.insert(LABEL_ORG.into(), "openshift".into());
		labels.insert(LABEL_POD.into(), pod.into());
		labels.insert(LABEL_CONTAINER.into(), "test".into());
		if !step.is_empty() {
			labels.insert(LABEL_STEP.into(), step.into());
		}
		SampleStream {
			labels,
			values: values
				.iter()
				.enumerate()
				.map(|(i, v)| SamplePair { timestamp: ts(i as i64 * 60), value: *v })
				.collect(),
		}
	}

	fn assert_invariants(cache: &CachedQuery) {
		// every fingerprint is indexed under exactly one identity, once
		for fingerprint in cache.data.keys() {
			let homes: usize = cache
				.data_by_metadata
				.values()
				.map(|list| list.iter().filter(|f| *f == fingerprint).count())
				.sum();
			assert_eq!(homes, 1, "fingerprint {} must have exactly one identity", fingerprint);
		}
		// the step index mirrors the step-bearing identities
		for (meta, list) in &cache.data_by_metadata {
			match meta.step_metadata() {
				Some(step_meta) => {
					let step_list = &cache.data_by_step[&step_meta];
					for fingerprint in list {
						assert!(step_list.contains(fingerprint));
					}
				}
				None => {
					for fingerprint in list {
						assert!(
							!cache.data_by_step.values().any(|l| l.contains(fingerprint)),
							"stepless series must not appear in the step index"
						);
					}
				}
			}
		}
		// covers stay sorted, disjoint and non-touching
		for cover in cache.ranges_by_cluster.values() {
			for pair in cover.windows(2) {
				assert!(pair[0].end < pair[1].start, "cover must be coalesced: {:?}", cover);
			}
		}
	}

	#[test]
	fn record_merges_values_without_duplicating_indices() {
		let mut cache = CachedQuery::new("metric", vec!["build01"]);
		// one fingerprint shows up in two disjoint query ranges
		cache.record("build01", range(0, 100), &[stream("pod-a", "", &[1.0, 2.0])]);
		cache.record("build01", range(200, 300), &[stream("pod-a", "", &[3.0])]);

		let fingerprint = stream("pod-a", "", &[]).fingerprint();
		assert_eq!(cache.data[&fingerprint].count(), 3);
		let meta = FullMetadata::from_labels(&stream("pod-a", "", &[]).labels);
		assert_eq!(cache.data_by_metadata[&meta], vec![fingerprint]);
		assert_eq!(cache.ranges_for("build01"), &[range(0, 100), range(200, 300)]);
		assert_invariants(&cache);
	}

	#[test]
	fn record_coalesces_touching_covers() {
		let mut cache = CachedQuery::new("metric", vec!["build01"]);
		cache.record("build01", range(0, 100), &[]);
		cache.record("build01", range(100, 200), &[]);
		assert_eq!(cache.ranges_for("build01"), &[range(0, 200)]);
	}

	#[test]
	fn covers_are_tracked_per_cluster() {
		let mut cache = CachedQuery::new("metric", vec!["build01", "build02"]);
		cache.record("build01", range(0, 100), &[]);
		assert_eq!(cache.ranges_for("build01"), &[range(0, 100)]);
		assert_eq!(cache.ranges_for("build02"), &[]);
		// unknown clusters simply have nothing covered yet
		assert_eq!(cache.ranges_for("build03"), &[]);
	}

	#[test]
	fn step_series_are_indexed_twice_stepless_once() {
		let mut cache = CachedQuery::new("metric", vec!["build01"]);
		cache.record(
			"build01",
			range(0, 100),
			&[stream("pod-a", "e2e", &[1.0]), stream("pod-b", "", &[2.0])],
		);
		assert_eq!(cache.data_by_metadata.len(), 2);
		assert_eq!(cache.data_by_step.len(), 1);
		assert_invariants(&cache);
	}

	#[test]
	fn unrecordable_samples_are_skipped_not_fatal() {
		let mut cache = CachedQuery::new("metric", vec!["build01"]);
		cache.record("build01", range(0, 100), &[stream("pod-a", "", &[1.0, f64::NAN, 2.0])]);
		let fingerprint = stream("pod-a", "", &[]).fingerprint();
		assert_eq!(cache.data[&fingerprint].count(), 2);
	}

	#[test]
	fn prune_keeps_the_newest_fifty_per_identity() {
		let mut cache = CachedQuery::new("metric", vec!["build01"]);
		// one identity, sixty distinct fingerprints via a label that is not
		// part of the identity
		let mut streams = Vec::new();
		for i in 0..60 {
			let mut s = stream("pod-a", "e2e", &[i as f64]);
			s.labels.insert("namespace".into(), format!("ci-op-{}", i));
			streams.push(s);
		}
		cache.record("build01", range(0, 100), &streams);
		assert_eq!(cache.data.len(), 60);

		cache.prune();

		let meta = FullMetadata::from_labels(&streams[0].labels);
		let kept = &cache.data_by_metadata[&meta];
		assert_eq!(kept.len(), MAX_FINGERPRINTS_PER_IDENTITY);
		// the oldest ten arrivals are gone, the newest fifty remain
		let expected: Vec<_> = streams[10..].iter().map(SampleStream::fingerprint).collect();
		assert_eq!(kept, &expected);
		assert_eq!(cache.data.len(), MAX_FINGERPRINTS_PER_IDENTITY);
		let step_list = &cache.data_by_step[&meta.step_metadata().unwrap()];
		assert_eq!(step_list.len(), MAX_FINGERPRINTS_PER_IDENTITY);
		assert_invariants(&cache);
	}

	#[test]
	fn prune_leaves_small_identities_untouched() {
		let mut cache = CachedQuery::new("metric", vec!["build01"]);
		cache.record("build01", range(0, 100), &[stream("pod-a", "", &[1.0])]);
		let before = cache.clone();
		cache.prune();
		assert_eq!(cache, before);
	}

	#[test]
	fn encoding_is_stable_across_cycles_without_new_data() {
		let mut cache = CachedQuery::new("metric", vec!["build01", "build02"]);
		cache.record("build01", range(0, 100), &[stream("pod-a", "e2e", &[1.0, 2.0])]);
		cache.record("build02", range(50, 150), &[stream("pod-b", "", &[3.0])]);

		let first = cache.to_bytes().unwrap();
		let reloaded = CachedQuery::from_bytes(&first).unwrap();
		assert_eq!(reloaded, cache);
		// an idle cycle persists byte-identical state
		let second = reloaded.to_bytes().unwrap();
		assert_eq!(first, second);
	}
}

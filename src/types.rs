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

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

// Identifying labels attached to harvested series. The `label_`-prefixed
// names are carried over from `kube_pod_labels` by the query's join.
pub const LABEL_ORG: &str = "label_org";
pub const LABEL_REPO: &str = "label_repo";
pub const LABEL_BRANCH: &str = "label_branch";
pub const LABEL_VARIANT: &str = "label_variant";
pub const LABEL_TARGET: &str = "label_target";
pub const LABEL_STEP: &str = "label_step";
pub const LABEL_POD: &str = "pod";
pub const LABEL_CONTAINER: &str = "container";

/// The complete label set of one series, name to value.
pub type Labels = BTreeMap<String, String>;

/// Stable identity of a label set. Two series share a fingerprint exactly
/// when every label value matches. Persisted, so the hash must not change
/// across process versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
	pub fn of(labels: &Labels) -> Self {
		// labels are iterated in key order, the map is sorted
		let mut buf = Vec::with_capacity(labels.len() * 16);
		for (name, value) in labels {
			buf.extend_from_slice(name.as_bytes());
			buf.push(0xff);
			buf.extend_from_slice(value.as_bytes());
			buf.push(0xff);
		}
		Fingerprint(xxh3_64(&buf))
	}
}

impl fmt::Display for Fingerprint {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{:016x}", self.0)
	}
}

/// The structured identity a series belongs to, extracted from its labels.
/// Missing labels are recorded as empty strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FullMetadata {
	pub org: String,
	pub repo: String,
	pub branch: String,
	pub variant: String,
	pub target: String,
	pub step: String,
	pub pod: String,
	pub container: String,
}

/// The per-step prefix of [`FullMetadata`], without pod and container.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepMetadata {
	pub org: String,
	pub repo: String,
	pub branch: String,
	pub variant: String,
	pub target: String,
	pub step: String,
}

impl FullMetadata {
	pub fn from_labels(labels: &Labels) -> Self {
		let get = |name: &str| labels.get(name).cloned().unwrap_or_default();
		FullMetadata {
			org: get(LABEL_ORG),
			repo: get(LABEL_REPO),
			branch: get(LABEL_BRANCH),
			variant: get(LABEL_VARIANT),
			target: get(LABEL_TARGET),
			step: get(LABEL_STEP),
			pod: get(LABEL_POD),
			container: get(LABEL_CONTAINER),
		}
	}

	/// The per-step view of this identity; only series belonging to a step
	/// have one.
	pub fn step_metadata(&self) -> Option<StepMetadata> {
		if self.step.is_empty() {
			return None;
		}
		Some(StepMetadata {
			org: self.org.clone(),
			repo: self.repo.clone(),
			branch: self.branch.clone(),
			variant: self.variant.clone(),
			target: self.target.clone(),
			step: self.step.clone(),
		})
	}
}

/// One sample of a series.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplePair {
	pub timestamp: DateTime<Utc>,
	pub value: f64,
}

/// A labelled sequence of samples, one row of a range-query response.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleStream {
	pub labels: Labels,
	pub values: Vec<SamplePair>,
}

impl SampleStream {
	pub fn fingerprint(&self) -> Fingerprint {
		Fingerprint::of(&self.labels)
	}
}

/// Possible shapes of a query response. Only a matrix can be harvested.
#[derive(Clone, Debug)]
pub enum QueryValue {
	Matrix(Vec<SampleStream>),
	Vector(Vec<SampleStream>),
	Scalar(SamplePair),
}

impl QueryValue {
	pub fn kind(&self) -> &'static str {
		match self {
			QueryValue::Matrix(_) => "matrix",
			QueryValue::Vector(_) => "vector",
			QueryValue::Scalar(_) => "scalar",
		}
	}
}

/// A range-query result together with any warnings the server attached.
#[derive(Clone, Debug)]
pub struct QueryResponse {
	pub value: QueryValue,
	pub warnings: Vec<String>,
}

/// Cooperative cancellation. Every [`Shutdown`] clone resolves once its
/// [`Stopper`] fires or is dropped; the channel itself never carries data.
#[derive(Clone)]
pub struct Shutdown(flume::Receiver<()>);

pub struct Stopper(#[allow(dead_code)] flume::Sender<()>);

impl Stopper {
	pub fn stop(self) {}
}

pub fn shutdown() -> (Stopper, Shutdown) {
	let (tx, rx) = flume::bounded(1);
	(Stopper(tx), Shutdown(rx))
}

impl Shutdown {
	/// Resolves once the harvest should stop admitting new work.
	pub async fn cancelled(&self) {
		let _ = self.0.recv_async().await;
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.is_disconnected()
	}
}

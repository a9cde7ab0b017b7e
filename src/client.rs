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

//! The seam to the remote time-series servers: the query trait the harvester
//! drives, the metric expressions it asks for, and the retention grammar
//! servers report their storage window in.

use chrono::Duration;
use serde::Deserialize;

use crate::{
	error::{Error, Result},
	range::QueryRange,
	types::{QueryResponse, LABEL_BRANCH, LABEL_ORG, LABEL_REPO, LABEL_STEP, LABEL_TARGET, LABEL_VARIANT},
};

pub const METRIC_NAME_CPU_USAGE: &str = "container_cpu_usage_seconds_total";
pub const METRIC_CPU_USAGE: &str = r#"rate(container_cpu_usage_seconds_total{container!="POD",container!=""}[3m])"#;
pub const METRIC_NAME_MEMORY_WORKING_SET: &str = "container_memory_working_set_bytes";
pub const METRIC_MEMORY_WORKING_SET: &str =
	r#"container_memory_working_set_bytes{container!="POD",container!=""}"#;

/// Applies the filtering and left join to a metric expression, attaching the
/// identifying labels of the owning pod to every harvested series.
pub fn query_for(metric: &str) -> String {
	format!(
		"sum by (namespace,pod,container) ({metric}) * on(namespace,pod) \
		 group_left({org},{repo},{branch},{variant},{target},{step}) \
		 max by (namespace,pod,{org},{repo},{branch},{variant},{target},{step}) \
		 (kube_pod_labels{{{org}!=\"\",label_created_by_ci=\"true\"}})",
		metric = metric,
		org = LABEL_ORG,
		repo = LABEL_REPO,
		branch = LABEL_BRANCH,
		variant = LABEL_VARIANT,
		target = LABEL_TARGET,
		step = LABEL_STEP,
	)
}

/// Server build and configuration details, as reported by the server itself.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
	/// A duration string in the server's own grammar, e.g. `"15d"`.
	pub storage_retention: String,
}

/// A range-query client for one server. Implementations own transport,
/// authentication and response decoding; the harvester only sees the shapes
/// in [`crate::types`].
#[async_trait::async_trait]
pub trait QueryClient: Send + Sync {
	async fn runtime_info(&self) -> Result<RuntimeInfo>;

	async fn query_range(&self, query: &str, range: &QueryRange) -> Result<QueryResponse>;
}

/// Parse a duration in the server's grammar: decimal groups suffixed with
/// `ms`, `s`, `m`, `h`, `d`, `w` or `y`, concatenated without separators.
pub fn parse_retention(s: &str) -> Result<Duration> {
	let bytes = s.as_bytes();
	if bytes.is_empty() || !s.is_ascii() {
		return Err(Error::Retention(s.to_owned()));
	}
	let mut total_ms: i64 = 0;
	let mut i = 0;
	while i < bytes.len() {
		let digits_start = i;
		while i < bytes.len() && bytes[i].is_ascii_digit() {
			i += 1;
		}
		let unit_start = i;
		while i < bytes.len() && !bytes[i].is_ascii_digit() {
			i += 1;
		}
		let count: i64 = s[digits_start..unit_start]
			.parse()
			.map_err(|_| Error::Retention(s.to_owned()))?;
		let unit_ms = match &s[unit_start..i] {
			"ms" => 1,
			"s" => 1_000,
			"m" => 60_000,
			"h" => 3_600_000,
			"d" => 86_400_000,
			"w" => 7 * 86_400_000,
			"y" => 365 * 86_400_000,
			_ => return Err(Error::Retention(s.to_owned())),
		};
		total_ms += count * unit_ms;
	}
	Ok(Duration::milliseconds(total_ms))
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn query_joins_pod_labels_onto_the_metric() {
		let got = query_for(METRIC_CPU_USAGE);
		let want = "sum by (namespace,pod,container) \
		            (rate(container_cpu_usage_seconds_total{container!=\"POD\",container!=\"\"}[3m])) \
		            * on(namespace,pod) group_left(label_org,label_repo,label_branch,label_variant,\
		            label_target,label_step) max by (namespace,pod,label_org,label_repo,label_branch,\
		            label_variant,label_target,label_step) \
		            (kube_pod_labels{label_org!=\"\",label_created_by_ci=\"true\"})";
		assert_eq!(got, want);
	}

	#[test]
	fn retention_grammar_round_trips_common_values() {
		assert_eq!(parse_retention("15d").unwrap(), Duration::days(15));
		assert_eq!(parse_retention("2w6h").unwrap(), Duration::weeks(2) + Duration::hours(6));
		assert_eq!(parse_retention("1y").unwrap(), Duration::days(365));
		assert_eq!(parse_retention("90s").unwrap(), Duration::seconds(90));
		assert_eq!(parse_retention("500ms").unwrap(), Duration::milliseconds(500));
		assert_eq!(parse_retention("1h30m").unwrap(), Duration::minutes(90));
	}

	#[test]
	fn malformed_retention_is_rejected() {
		for bad in &["", "d", "15x", "15", "h1", "1.5h"] {
			assert!(parse_retention(bad).is_err(), "{} should not parse", bad);
		}
	}

	#[test]
	fn runtime_info_deserializes_from_a_status_payload() {
		// servers report more fields than we consume; only the retention
		// matters to the harvest
		let json = serde_json::json!({
			"startTime": "2026-07-30T08:00:00Z",
			"CWD": "/prometheus",
			"reloadConfigSuccess": true,
			"goroutineCount": 117,
			"storageRetention": "15d"
		});
		let info: RuntimeInfo = serde_json::from_value(json).unwrap();
		assert_eq!(info.storage_retention, "15d");
		assert_eq!(parse_retention(&info.storage_retention).unwrap(), Duration::days(15));
	}
}

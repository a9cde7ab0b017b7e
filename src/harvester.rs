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

//! The per-server harvest: computes what the cache does not cover yet,
//! fans range queries out under a sample budget, adapts the request size to
//! what the server currently answers, and merges responses into the cache.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Duration, Utc};
use futures::{future::BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::{
	cache::CachedQuery,
	client::{parse_retention, query_for, QueryClient},
	error::{Error, Result},
	range::{uncovered_ranges, QueryRange},
	types::{QueryValue, Shutdown},
};

/// Tuning knobs for the harvesting engine. The defaults match the operated
/// deployment; override via a deserialized config file where needed.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct HarvesterConfig {
	/// Seconds between harvest cycles.
	#[serde(default = "default_cycle_interval")]
	pub cycle_interval: u64,
	/// The maximum number of samples the server allows a client to ask for
	/// in one request. Also approximates how many samples we should have in
	/// flight against one server across many requests.
	#[serde(default = "default_max_samples_per_request")]
	pub max_samples_per_request: i64,
	/// Below this many steps a timed-out request is reported instead of
	/// subdivided further.
	#[serde(default = "default_subdivision_floor")]
	pub subdivision_floor: i64,
	/// Seconds between consecutive samples of a range query.
	#[serde(default = "default_step")]
	pub step: u64,
}

impl Default for HarvesterConfig {
	fn default() -> Self {
		Self {
			cycle_interval: default_cycle_interval(),
			max_samples_per_request: default_max_samples_per_request(),
			subdivision_floor: default_subdivision_floor(),
			step: default_step(),
		}
	}
}

const fn default_cycle_interval() -> u64 {
	3 * 60 * 60
}

const fn default_max_samples_per_request() -> i64 {
	11_000
}

const fn default_subdivision_floor() -> i64 {
	250
}

const fn default_step() -> u64 {
	60
}

/// Per-server state for one harvest cycle. The request-size cap is learned
/// within the cycle and not persisted: the server pool may have been scaled
/// or replaced by the time the next cycle starts.
pub struct Cluster {
	pub name: String,
	client: Arc<dyn QueryClient>,
	/// Adaptive cap on the steps a single request may ask for. Servers time
	/// out far below the request sizes they formally accept, so start at a
	/// twentieth of the largest request they answer at all.
	max_size: RwLock<i64>,
	/// Sample budget: every in-flight sub-query holds permits proportional
	/// to its step count, so many small requests run in parallel while one
	/// huge request holds back the rest.
	sync: Arc<Semaphore>,
	floor: i64,
	step: Duration,
}

impl Cluster {
	pub fn new(name: &str, client: Arc<dyn QueryClient>, config: &HarvesterConfig) -> Self {
		Cluster {
			name: name.to_owned(),
			client,
			max_size: RwLock::new(config.max_samples_per_request / 20),
			sync: Arc::new(Semaphore::new((config.max_samples_per_request / 5) as usize)),
			floor: config.subdivision_floor,
			step: Duration::seconds(config.step as i64),
		}
	}

	pub fn current_max(&self) -> i64 {
		*self.max_size.read()
	}
}

/// Drives harvest cycles against the shared cache of one metric.
pub struct Querier {
	cache: Arc<RwLock<CachedQuery>>,
}

impl Querier {
	pub fn new(cache: CachedQuery) -> Self {
		Querier { cache: Arc::new(RwLock::new(cache)) }
	}

	/// The cache under harvest. Writes happen only through [`execute`];
	/// consumers read and persist through this handle.
	///
	/// [`execute`]: Querier::execute
	pub fn cache(&self) -> &Arc<RwLock<CachedQuery>> {
		&self.cache
	}

	/// Harvest everything the server retains that the cache does not yet
	/// cover. Worker failures collect into one aggregate error; the cache
	/// keeps whatever was merged before a failure.
	pub async fn execute(&self, cluster: Arc<Cluster>, until: DateTime<Utc>, shutdown: &Shutdown) -> Result<()> {
		let info = cluster.client.runtime_info().await?;
		let retention = parse_retention(&info.storage_retention)?;
		let window = QueryRange { start: until - retention, end: until, step: cluster.step };

		let (err_tx, err_rx) = flume::unbounded();
		let collector = smol::spawn(async move {
			let mut errors = Vec::new();
			while let Ok(err) = err_rx.recv_async().await {
				errors.push(err);
			}
			errors
		});

		let query_start = Instant::now();
		log::info!(
			"[{}] Initiating queries over [{}, {}] at a {}s step.",
			cluster.name,
			window.start.to_rfc3339(),
			window.end.to_rfc3339(),
			cluster.step.num_seconds(),
		);

		let uncovered = {
			let cache = self.cache.read();
			uncovered_ranges(window.time_range(), cache.ranges_for(&cluster.name))
		};

		let (outstanding, done) = flume::bounded(1);
		let worker = Worker {
			cache: Arc::clone(&self.cache),
			cluster: Arc::clone(&cluster),
			errors: err_tx,
			_outstanding: outstanding,
			shutdown: shutdown.clone(),
		};
		for region in &uncovered {
			// split each uncovered region into chunks the server has a
			// chance of answering in one request
			let chunk_steps = cluster.current_max() - 1;
			let mut start = region.start;
			let mut stop = region.end;
			while start != region.end {
				if (stop - start).num_seconds() / cluster.step.num_seconds() > chunk_steps {
					stop = start + cluster.step * (chunk_steps as i32);
				}
				worker.spawn(QueryRange { start, end: stop, step: cluster.step });
				start = stop;
				stop = region.end;
			}
		}
		// the spawned sub-queries hold the only worker handles now; once the
		// last one is dropped the wait below resolves and the error channel
		// disconnects
		drop(worker);
		let _ = done.recv_async().await;
		log::info!("[{}] Query completed after {:?}.", cluster.name, query_start.elapsed());

		let errors = collector.await;
		match Error::aggregate(errors) {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}
}

/// Everything one range sub-query needs, cloned into each spawned task.
#[derive(Clone)]
struct Worker {
	cache: Arc<RwLock<CachedQuery>>,
	cluster: Arc<Cluster>,
	errors: flume::Sender<Error>,
	// held, never sent on: keeps the cycle's wait group open
	_outstanding: flume::Sender<()>,
	shutdown: Shutdown,
}

impl Worker {
	fn spawn(&self, r: QueryRange) {
		let worker = self.clone();
		smol::spawn(worker.execute_over_range(r)).detach();
	}

	// infallible in practice: the collector holds the receiver until the
	// last worker drops its sender
	fn emit(&self, err: Error) {
		let _ = self.errors.send(err);
	}

	/// Split the range at its midpoint and hand both halves to fresh
	/// workers. The caller's permits release when it returns; the halves
	/// admit themselves independently.
	fn subdivide(&self, r: &QueryRange, num_steps: i64) {
		let middle = r.start + r.step * ((num_steps / 2) as i32);
		self.spawn(QueryRange { start: r.start, end: middle, step: r.step });
		self.spawn(QueryRange { start: middle, end: r.end, step: r.step });
	}

	fn execute_over_range(self, r: QueryRange) -> BoxFuture<'static, ()> {
		async move {
			let num_steps = r.num_steps();

			// admission: hold a slice of the sample budget while in flight
			let _permit = {
				let acquire = Arc::clone(&self.cluster.sync).acquire_many_owned(num_steps as u32).fuse();
				let cancelled = self.shutdown.cancelled().fuse();
				futures::pin_mut!(acquire, cancelled);
				futures::select! {
					permit = acquire => match permit {
						Ok(permit) => permit,
						Err(err) => {
							self.emit(err.into());
							return;
						}
					},
					_ = cancelled => {
						self.emit(Error::Interrupted);
						return;
					}
				}
			};

			// a 504 elsewhere may have lowered the cap since this chunk was
			// cut; halve pre-emptively instead of asking for a known-too-
			// large range
			let current_max = self.cluster.current_max();
			if num_steps >= current_max {
				log::debug!(
					"[{}] Preemptively halving request as prior data shows ours is too large ({} >= {}).",
					self.cluster.name,
					num_steps,
					current_max,
				);
				self.subdivide(&r, num_steps);
				return;
			}

			let metric = self.cache.read().metric.clone();
			let query = query_for(&metric);
			let query_start = Instant::now();
			log::debug!("[{}] Querying server for {} steps.", self.cluster.name, num_steps);
			let result = {
				let request = self.cluster.client.query_range(&query, &r).fuse();
				let cancelled = self.shutdown.cancelled().fuse();
				futures::pin_mut!(request, cancelled);
				futures::select! {
					result = request => result,
					_ = cancelled => Err(Error::Interrupted),
				}
			};
			log::debug!("[{}] Queried server API in {:?}.", self.cluster.name, query_start.elapsed());

			let response = match result {
				Ok(response) => response,
				Err(err) => {
					if err.is_gateway_timeout() && self.handle_gateway_timeout(num_steps) {
						self.subdivide(&r, num_steps);
						return;
					}
					log::error!("[{}] Failed to query server API: {}", self.cluster.name, err);
					self.emit(err);
					return;
				}
			};
			if !response.warnings.is_empty() {
				log::warn!("[{}] Got warnings from the server: {:?}", self.cluster.name, response.warnings);
			}

			let matrix = match response.value {
				QueryValue::Matrix(matrix) => matrix,
				other => {
					self.emit(Error::UnexpectedShape(other.kind()));
					return;
				}
			};

			let save_start = Instant::now();
			{
				let mut cache = self.cache.write();
				cache.record(&self.cluster.name, r.time_range(), &matrix);
			}
			log::debug!("[{}] Saved server response after {:?}.", self.cluster.name, save_start.elapsed());
		}
		.boxed()
	}

	/// Decide under the cluster lock whether a gateway timeout subdivides
	/// this chunk (true) or aborts it (false).
	fn handle_gateway_timeout(&self, num_steps: i64) -> bool {
		let mut max_size = self.cluster.max_size.write();
		if num_steps >= *max_size {
			// timed out asking for a known large value, just subdivide
			true
		} else if num_steps > self.cluster.floor {
			// still asking for a reasonably large amount of data at once, so
			// halve it to have a better chance next time; below the floor
			// the server is likely on the verge of falling over and further
			// halving is wasted effort
			log::debug!(
				"[{}] Received 504 asking for {} samples, halving to {}.",
				self.cluster.name,
				num_steps,
				num_steps / 2,
			);
			*max_size = num_steps;
			true
		} else {
			log::debug!(
				"[{}] Received 504 but only asking for {} samples, aborting.",
				self.cluster.name,
				num_steps,
			);
			false
		}
	}
}

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

//! The production loop: every cycle, for every harvested metric, load the
//! checkpoint from the object store, harvest all servers, persist the
//! checkpoint back. Persisting is the commit point; it runs even when the
//! cycle was interrupted so partial progress is never lost.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;

use crate::{
	cache::CachedQuery,
	client::{
		QueryClient, METRIC_CPU_USAGE, METRIC_MEMORY_WORKING_SET, METRIC_NAME_CPU_USAGE,
		METRIC_NAME_MEMORY_WORKING_SET,
	},
	error::{Error, Result},
	harvester::{Cluster, HarvesterConfig, Querier},
	store::ObjectStore,
	types::Shutdown,
};

/// The fixed table of harvested metrics: blob name to query expression.
pub fn harvested_metrics() -> [(&'static str, &'static str); 2] {
	[
		(METRIC_NAME_CPU_USAGE, METRIC_CPU_USAGE),
		(METRIC_NAME_MEMORY_WORKING_SET, METRIC_MEMORY_WORKING_SET),
	]
}

/// Owns the harvest schedule across a set of servers and one object store.
pub struct Producer {
	clients: BTreeMap<String, Arc<dyn QueryClient>>,
	store: Arc<dyn ObjectStore>,
	config: HarvesterConfig,
}

impl Producer {
	pub fn new(clients: BTreeMap<String, Arc<dyn QueryClient>>, store: Arc<dyn ObjectStore>) -> Self {
		Self::with_config(clients, store, HarvesterConfig::default())
	}

	pub fn with_config(
		clients: BTreeMap<String, Arc<dyn QueryClient>>,
		store: Arc<dyn ObjectStore>,
		config: HarvesterConfig,
	) -> Self {
		Producer { clients, store, config }
	}

	/// Run harvest cycles until stopped. The first cycle starts immediately;
	/// a cycle in flight finishes (and persists) before the loop exits.
	pub async fn run(&self, shutdown: Shutdown) {
		loop {
			self.cycle(Utc::now(), &shutdown).await;
			let sleep = smol::Timer::after(Duration::from_secs(self.config.cycle_interval)).fuse();
			let cancelled = shutdown.cancelled().fuse();
			futures::pin_mut!(sleep, cancelled);
			futures::select! {
				_ = sleep => {}
				_ = cancelled => break,
			}
		}
	}

	/// One pass over every harvested metric, concurrently.
	pub async fn cycle(&self, now: DateTime<Utc>, shutdown: &Shutdown) {
		let metrics = harvested_metrics();
		let work = metrics.iter().map(|(name, metric)| self.harvest_metric(name, metric, now, shutdown));
		futures::future::join_all(work).await;
	}

	async fn harvest_metric(&self, name: &str, metric: &str, now: DateTime<Utc>, shutdown: &Shutdown) {
		let cache = match self.load_cache(name).await {
			Ok(cache) => cache,
			Err(Error::NotFound(_)) => {
				log::info!("[{}] No cached data exists yet, starting cold.", name);
				CachedQuery::new(metric, self.clients.keys().cloned())
			}
			Err(err) => {
				// the checkpoint on disk stays untouched, retry next cycle
				log::error!("[{}] Failed to load cached data, skipping this cycle: {}", name, err);
				return;
			}
		};

		let querier = Querier::new(cache);
		let harvests = self.clients.iter().map(|(cluster_name, client)| {
			let cluster = Arc::new(Cluster::new(cluster_name, Arc::clone(client), &self.config));
			let querier = &querier;
			async move {
				// one bad server never blocks the cycle for the others
				if let Err(err) = querier.execute(cluster, now, shutdown).await {
					log::error!("[{}] Failed to query server {}: {}", name, cluster_name, err);
				}
			}
		});
		futures::future::join_all(harvests).await;

		// commit point, interrupted or not
		if let Err(err) = self.store_cache(name, &querier).await {
			log::error!("[{}] Failed to write cached data: {}", name, err);
		}
	}

	async fn load_cache(&self, name: &str) -> Result<CachedQuery> {
		let bytes = self.store.load(name).await?;
		log::debug!("[{}] Loaded {} bytes of cached data.", name, bytes.len());
		CachedQuery::from_bytes(&bytes)
	}

	async fn store_cache(&self, name: &str, querier: &Querier) -> Result<()> {
		let bytes = querier.cache().read().to_bytes()?;
		log::debug!("[{}] Persisting {} bytes of cached data.", name, bytes.len());
		self.store.store(name, bytes).await
	}
}

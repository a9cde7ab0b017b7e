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

//! Harvests container usage metrics from a fleet of time-series servers
//! into a persistent cache of per-series histograms. Each cycle pulls only
//! the time ranges not harvested before, adapting request sizes to what
//! every server currently answers, and checkpoints the merged result
//! through an opaque object store.

#![forbid(unsafe_code)]

pub mod cache;
pub mod client;
mod error;
pub mod harvester;
pub mod histogram;
pub mod logger;
pub mod producer;
pub mod range;
pub mod store;
pub mod types;

pub use self::cache::{CachedQuery, MAX_FINGERPRINTS_PER_IDENTITY};
pub use self::client::{QueryClient, RuntimeInfo};
pub use self::error::{Error, Result};
pub use self::harvester::{Cluster, HarvesterConfig, Querier};
pub use self::histogram::Histogram;
pub use self::producer::{harvested_metrics, Producer};
pub use self::range::{QueryRange, TimeRange};
pub use self::store::{FsStore, MemoryStore, ObjectStore};
pub use self::types::{shutdown, Fingerprint, FullMetadata, Shutdown, StepMetadata, Stopper};

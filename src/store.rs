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

//! Opaque blob storage for the harvest checkpoints, one blob per metric.

use std::{
	collections::BTreeMap,
	fs, io,
	path::PathBuf,
};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Load and store blobs by name. Absent blobs surface as
/// [`Error::NotFound`], which callers treat as a cold start rather than a
/// failure.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
	async fn load(&self, name: &str) -> Result<Vec<u8>>;

	async fn store(&self, name: &str, bytes: Vec<u8>) -> Result<()>;
}

/// Get the path to a local directory where we can save data.
/// Platform | Value | Example
/// -- | -- | --
/// Linux | $XDG_DATA_HOME or $HOME/.local/share/metrics_harvester | /home/alice/.local/share/metrics_harvester/
/// macOS | $HOME/Library/Application Support/metrics_harvester | /Users/Alice/Library/Application Support/metrics_harvester
/// Windows | {FOLDERID_LocalAppData}\metrics_harvester | C:\Users\Alice\AppData\Local\metrics_harvester
pub fn default_data_dir() -> Option<PathBuf> {
	let base_dirs = dirs::BaseDirs::new()?;
	let mut path = base_dirs.data_local_dir().to_path_buf();
	path.push("metrics_harvester");
	Some(path)
}

/// Blob-per-file store rooted at a directory.
pub struct FsStore {
	dir: PathBuf,
}

impl FsStore {
	pub fn new<P: Into<PathBuf>>(dir: P) -> Result<Self> {
		let dir = dir.into();
		fs::create_dir_all(&dir)?;
		Ok(FsStore { dir })
	}

	fn path_of(&self, name: &str) -> PathBuf {
		self.dir.join(name)
	}
}

#[async_trait::async_trait]
impl ObjectStore for FsStore {
	async fn load(&self, name: &str) -> Result<Vec<u8>> {
		let path = self.path_of(name);
		let owned = name.to_owned();
		smol::unblock(move || match fs::read(&path) {
			Ok(bytes) => Ok(bytes),
			Err(err) if err.kind() == io::ErrorKind::NotFound => Err(Error::NotFound(owned)),
			Err(err) => Err(err.into()),
		})
		.await
	}

	async fn store(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
		let path = self.path_of(name);
		let tmp = self.path_of(&format!("{}.tmp", name));
		smol::unblock(move || {
			fs::write(&tmp, &bytes)?;
			fs::rename(&tmp, &path)?;
			Ok::<(), Error>(())
		})
		.await
	}
}

/// In-memory store for tests and embedding consumers.
#[derive(Default)]
pub struct MemoryStore {
	blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get(&self, name: &str) -> Option<Vec<u8>> {
		self.blobs.lock().get(name).cloned()
	}
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
	async fn load(&self, name: &str) -> Result<Vec<u8>> {
		self.blobs.lock().get(name).cloned().ok_or_else(|| Error::NotFound(name.to_owned()))
	}

	async fn store(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
		self.blobs.lock().insert(name.to_owned(), bytes);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn memory_store_round_trips_and_reports_missing_blobs() {
		smol::block_on(async {
			let store = MemoryStore::new();
			match store.load("absent").await {
				Err(Error::NotFound(name)) => assert_eq!(name, "absent"),
				other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
			}
			store.store("blob", vec![1, 2, 3]).await.unwrap();
			assert_eq!(store.load("blob").await.unwrap(), vec![1, 2, 3]);
		});
	}

	#[test]
	fn fs_store_round_trips_through_the_filesystem() {
		smol::block_on(async {
			let dir = std::env::temp_dir().join(format!("harvester-store-{}", std::process::id()));
			let store = FsStore::new(&dir).unwrap();
			match store.load("absent").await {
				Err(Error::NotFound(_)) => {}
				other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
			}
			store.store("blob", vec![4, 5, 6]).await.unwrap();
			assert_eq!(store.load("blob").await.unwrap(), vec![4, 5, 6]);
			let _ = fs::remove_dir_all(&dir);
		});
	}
}

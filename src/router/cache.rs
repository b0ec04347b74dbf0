//! The router's space cache: `(db, space) -> Space`, refreshed lazily on
//! miss and invalidated whenever a partition-server reply reports a
//! version the cache doesn't yet know about. There is no background
//! watcher here (the router has no long-lived connection to the
//! master's metadata store) — staleness is bounded only by how quickly
//! callers notice and invalidate.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use meridian_meta::{MetaReader, Space};
use meridian_util::error::{Error, ErrorKind, Result};

pub struct SpaceCache {
	meta: Arc<dyn MetaReader>,
	entries: RwLock<HashMap<(String, String), Space>>,
}

impl SpaceCache {
	pub fn new(meta: Arc<dyn MetaReader>) -> Self {
		SpaceCache { meta, entries: RwLock::new(HashMap::new()) }
	}

	/// Resolves `(db_name, space_name)`, serving the cached copy if one
	/// exists and hitting the metadata store on a miss.
	pub fn get(&self, db_name: &str, space_name: &str) -> Result<Space> {
		let key = (db_name.to_string(), space_name.to_string());
		if let Some(space) = self.entries.read().unwrap().get(&key) {
			return Ok(space.clone());
		}
		self.refresh(db_name, space_name)
	}

	fn refresh(&self, db_name: &str, space_name: &str) -> Result<Space> {
		let db = self
			.meta
			.get_db_by_name(db_name)?
			.ok_or_else(|| Error::new(ErrorKind::DbNotExists, format!("db {} does not exist", db_name)))?;
		let space = self
			.meta
			.get_space_by_name(db.id, space_name)?
			.ok_or_else(|| Error::new(ErrorKind::SpaceNotExists, format!("space {} does not exist", space_name)))?;
		self.entries
			.write()
			.unwrap()
			.insert((db_name.to_string(), space_name.to_string()), space.clone());
		Ok(space)
	}

	/// Drops the cached entry so the next `get` re-reads the metadata
	/// store. Called when a PS reply's error carries a space version the
	/// cache is behind on.
	pub fn invalidate(&self, db_name: &str, space_name: &str) {
		self.entries
			.write()
			.unwrap()
			.remove(&(db_name.to_string(), space_name.to_string()));
	}

	/// Ensures the cached copy is at least `min_version`, forcing a
	/// refresh if the cache is stale.
	pub fn ensure_version(&self, db_name: &str, space_name: &str, min_version: u64) -> Result<Space> {
		let current = self.get(db_name, space_name)?;
		if current.version < min_version {
			self.invalidate(db_name, space_name);
			return self.refresh(db_name, space_name);
		}
		Ok(current)
	}

	pub fn len(&self) -> usize {
		self.entries.read().unwrap().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use meridian_meta::{Db as DbEntity, MetaStore, MetaWriter, Partition};

	fn store_with_space() -> (Arc<dyn MetaReader>, u64) {
		let store = MetaStore::new(meridian_db::Db::open_memory());
		store.create_db(&DbEntity { id: 1, name: "default".into(), ps: vec![] }).unwrap();
		let space = Space {
			id: 1,
			db_id: 1,
			name: "docs".into(),
			partition_num: 1,
			replica_num: 1,
			properties: Default::default(),
			engine_config: Default::default(),
			partitions: vec![Partition { id: 1, space_id: 1, db_id: 1, slot: 0, replicas: vec![1], leader_id: Some(1), update_time: 0 }],
			version: 1,
			enabled: true,
		};
		store.put_space(&space).unwrap();
		(Arc::new(store), 1)
	}

	#[test]
	fn get_refreshes_on_miss_and_then_serves_from_cache() {
		let (meta, _) = store_with_space();
		let cache = SpaceCache::new(meta);
		assert_eq!(cache.len(), 0);
		let space = cache.get("default", "docs").unwrap();
		assert_eq!(space.version, 1);
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn ensure_version_refetches_when_stale() {
		let db = meridian_db::Db::open_memory();
		let store = MetaStore::new(db);
		store.create_db(&DbEntity { id: 1, name: "default".into(), ps: vec![] }).unwrap();
		let mut space = Space {
			id: 1,
			db_id: 1,
			name: "docs".into(),
			partition_num: 1,
			replica_num: 1,
			properties: Default::default(),
			engine_config: Default::default(),
			partitions: vec![Partition { id: 1, space_id: 1, db_id: 1, slot: 0, replicas: vec![1], leader_id: Some(1), update_time: 0 }],
			version: 1,
			enabled: true,
		};
		store.put_space(&space).unwrap();

		let cache = SpaceCache::new(Arc::new(store.clone()));
		assert_eq!(cache.get("default", "docs").unwrap().version, 1);

		// Master bumps the space's version directly in the store, behind the cache's back.
		space.version = 2;
		store.put_space(&space).unwrap();

		let refreshed = cache.ensure_version("default", "docs", 2).unwrap();
		assert_eq!(refreshed.version, 2);
	}

	#[test]
	fn unknown_db_is_reported_precisely() {
		let store = MetaStore::new(meridian_db::Db::open_memory());
		let cache = SpaceCache::new(Arc::new(store));
		let err = cache.get("nope", "docs").unwrap_err();
		assert_eq!(err.kind, ErrorKind::DbNotExists);
	}
}

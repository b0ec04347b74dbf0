//! The metadata store API. `MetaReader` is the read-only half injected
//! into the router and partition-server client layers; `MetaWriter`
//! extends it with the mutation primitives the master uses to implement
//! `createDB`/`createSpace`/etc. Splitting the trait this way is what
//! lets the master hold a `dyn MetaWriter` while handing routers only a
//! `dyn MetaReader`, resolving the cyclic Client↔Master reference without
//! either side needing the other's concrete type.

use meridian_db::Db;
use meridian_util::error::{Error, ErrorKind, Result};

use crate::entity::{Db as DbEntity, FailServer, Partition, Server, Space};

const TREE_DB: &str = "db";
const TREE_SPACE: &str = "space";
const TREE_SERVER: &str = "server";
const TREE_PARTITION: &str = "partition";
const TREE_FAIL_SERVER: &str = "fail_server";

pub trait MetaReader: Send + Sync {
	fn get_db_by_name(&self, name: &str) -> Result<Option<DbEntity>>;
	fn get_db_by_id(&self, id: u64) -> Result<Option<DbEntity>>;
	fn list_dbs(&self) -> Result<Vec<DbEntity>>;

	fn get_space(&self, db_id: u64, space_id: u64) -> Result<Option<Space>>;
	fn get_space_by_name(&self, db_id: u64, name: &str) -> Result<Option<Space>>;
	fn list_spaces(&self, db_id: u64) -> Result<Vec<Space>>;
	fn list_all_spaces(&self) -> Result<Vec<Space>>;

	fn get_server(&self, id: u64) -> Result<Option<Server>>;
	fn list_servers(&self) -> Result<Vec<Server>>;

	fn get_partition_record(&self, id: u64) -> Result<Option<Partition>>;

	fn list_fail_servers(&self) -> Result<Vec<FailServer>>;
	fn get_fail_server_by_ip(&self, ip: &str) -> Result<Option<FailServer>>;
}

pub trait MetaWriter: MetaReader {
	fn create_db(&self, db: &DbEntity) -> Result<()>;
	fn delete_db(&self, id: u64) -> Result<()>;

	fn put_space(&self, space: &Space) -> Result<()>;
	fn delete_space(&self, db_id: u64, id: u64) -> Result<()>;

	fn upsert_server(&self, server: &Server) -> Result<()>;
	fn delete_server(&self, id: u64) -> Result<()>;

	fn put_partition_record(&self, partition: &Partition) -> Result<()>;
	fn delete_partition_record(&self, id: u64) -> Result<()>;

	fn put_fail_server(&self, fs: &FailServer) -> Result<()>;
	fn delete_fail_server(&self, id: u64) -> Result<()>;
}

#[derive(Clone)]
pub struct MetaStore {
	db: Db,
}

impl MetaStore {
	pub fn new(db: Db) -> Self {
		MetaStore { db }
	}

	fn space_key(db_id: u64, id: u64) -> Vec<u8> {
		format!("{}/{}", db_id, id).into_bytes()
	}
}

fn decode<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T> {
	serde_json::from_slice(raw).map_err(Error::from)
}

fn encode<T: serde::Serialize>(v: &T) -> Result<Vec<u8>> {
	serde_json::to_vec(v).map_err(Error::from)
}

impl MetaReader for MetaStore {
	fn get_db_by_name(&self, name: &str) -> Result<Option<DbEntity>> {
		match self.db.get(TREE_DB, format!("name/{}", name).as_bytes())? {
			Some(raw) => {
				let id: u64 = decode(&raw)?;
				self.get_db_by_id(id)
			}
			None => Ok(None),
		}
	}

	fn get_db_by_id(&self, id: u64) -> Result<Option<DbEntity>> {
		match self.db.get(TREE_DB, format!("body/{}", id).as_bytes())? {
			Some(raw) => Ok(Some(decode(&raw)?)),
			None => Ok(None),
		}
	}

	fn list_dbs(&self) -> Result<Vec<DbEntity>> {
		self.db
			.prefix_scan(TREE_DB, b"body/")?
			.into_iter()
			.map(|(_, v)| decode(&v))
			.collect()
	}

	fn get_space(&self, db_id: u64, space_id: u64) -> Result<Option<Space>> {
		match self.db.get(TREE_SPACE, &Self::space_key(db_id, space_id))? {
			Some(raw) => Ok(Some(decode(&raw)?)),
			None => Ok(None),
		}
	}

	fn get_space_by_name(&self, db_id: u64, name: &str) -> Result<Option<Space>> {
		Ok(self
			.list_spaces(db_id)?
			.into_iter()
			.find(|s| s.name == name))
	}

	fn list_spaces(&self, db_id: u64) -> Result<Vec<Space>> {
		self.db
			.prefix_scan(TREE_SPACE, format!("{}/", db_id).as_bytes())?
			.into_iter()
			.map(|(_, v)| decode(&v))
			.collect()
	}

	fn list_all_spaces(&self) -> Result<Vec<Space>> {
		self.db
			.prefix_scan(TREE_SPACE, b"")?
			.into_iter()
			.map(|(_, v)| decode(&v))
			.collect()
	}

	fn get_server(&self, id: u64) -> Result<Option<Server>> {
		match self.db.get(TREE_SERVER, id.to_string().as_bytes())? {
			Some(raw) => Ok(Some(decode(&raw)?)),
			None => Ok(None),
		}
	}

	fn list_servers(&self) -> Result<Vec<Server>> {
		self.db
			.prefix_scan(TREE_SERVER, b"")?
			.into_iter()
			.map(|(_, v)| decode(&v))
			.collect()
	}

	fn get_partition_record(&self, id: u64) -> Result<Option<Partition>> {
		match self.db.get(TREE_PARTITION, id.to_string().as_bytes())? {
			Some(raw) => Ok(Some(decode(&raw)?)),
			None => Ok(None),
		}
	}

	fn list_fail_servers(&self) -> Result<Vec<FailServer>> {
		self.db
			.prefix_scan(TREE_FAIL_SERVER, b"")?
			.into_iter()
			.map(|(_, v)| decode(&v))
			.collect()
	}

	fn get_fail_server_by_ip(&self, ip: &str) -> Result<Option<FailServer>> {
		Ok(self.list_fail_servers()?.into_iter().find(|fs| fs.node.ip == ip))
	}
}

const DUP_NAME_TAG: &str = "dup-db-name:";
const DUP_ID_TAG: &str = "dup-db-id:";

impl MetaWriter for MetaStore {
	fn create_db(&self, db_entity: &DbEntity) -> Result<()> {
		let name_key = format!("name/{}", db_entity.name);
		let id_key = format!("id/{}", db_entity.id);
		let body_key = format!("body/{}", db_entity.id);
		let id_bytes = encode(&db_entity.id)?;
		let name_bytes = encode(&db_entity.name)?;
		let body_bytes = encode(db_entity)?;
		let dup_name_msg = format!("{}{}", DUP_NAME_TAG, db_entity.name);
		let dup_id_msg = format!("{}{}", DUP_ID_TAG, db_entity.id);

		self.db
			.transaction(move |tx| {
				if tx.get(TREE_DB, name_key.as_bytes())?.is_some() {
					return Err(meridian_db::Error::TransactionAborted(dup_name_msg.clone()));
				}
				if tx.get(TREE_DB, id_key.as_bytes())?.is_some() {
					return Err(meridian_db::Error::TransactionAborted(dup_id_msg.clone()));
				}
				tx.put(TREE_DB, name_key.as_bytes(), &id_bytes)?;
				tx.put(TREE_DB, id_key.as_bytes(), &name_bytes)?;
				tx.put(TREE_DB, body_key.as_bytes(), &body_bytes)?;
				Ok(())
			})
			.map_err(|e| match &e {
				meridian_db::Error::TransactionAborted(m) if m.starts_with(DUP_NAME_TAG) => {
					Error::new(ErrorKind::DupSpace, format!("db name {} already exists", &m[DUP_NAME_TAG.len()..]))
				}
				meridian_db::Error::TransactionAborted(m) if m.starts_with(DUP_ID_TAG) => {
					Error::new(ErrorKind::InternalError, format!("db id {} already exists", &m[DUP_ID_TAG.len()..]))
				}
				_ => Error::from(e),
			})
	}

	fn delete_db(&self, id: u64) -> Result<()> {
		let db_entity = self
			.get_db_by_id(id)?
			.ok_or_else(|| Error::new(ErrorKind::DbNotExists, format!("db {} not found", id)))?;
		let name_key = format!("name/{}", db_entity.name);
		let id_key = format!("id/{}", id);
		let body_key = format!("body/{}", id);
		self.db
			.transaction(move |tx| {
				tx.delete(TREE_DB, name_key.as_bytes())?;
				tx.delete(TREE_DB, id_key.as_bytes())?;
				tx.delete(TREE_DB, body_key.as_bytes())?;
				Ok(())
			})
			.map_err(Error::from)
	}

	fn put_space(&self, space: &Space) -> Result<()> {
		let key = Self::space_key(space.db_id, space.id);
		let raw = encode(space)?;
		self.db.put(TREE_SPACE, &key, &raw).map_err(Error::from)
	}

	fn delete_space(&self, db_id: u64, id: u64) -> Result<()> {
		self.db
			.delete(TREE_SPACE, &Self::space_key(db_id, id))
			.map_err(Error::from)
	}

	fn upsert_server(&self, server: &Server) -> Result<()> {
		let raw = encode(server)?;
		self.db
			.put(TREE_SERVER, server.id.to_string().as_bytes(), &raw)
			.map_err(Error::from)
	}

	fn delete_server(&self, id: u64) -> Result<()> {
		self.db
			.delete(TREE_SERVER, id.to_string().as_bytes())
			.map_err(Error::from)
	}

	fn put_partition_record(&self, partition: &Partition) -> Result<()> {
		let raw = encode(partition)?;
		self.db
			.put(TREE_PARTITION, partition.id.to_string().as_bytes(), &raw)
			.map_err(Error::from)
	}

	fn delete_partition_record(&self, id: u64) -> Result<()> {
		self.db
			.delete(TREE_PARTITION, id.to_string().as_bytes())
			.map_err(Error::from)
	}

	fn put_fail_server(&self, fs: &FailServer) -> Result<()> {
		let raw = encode(fs)?;
		self.db
			.put(TREE_FAIL_SERVER, fs.id.to_string().as_bytes(), &raw)
			.map_err(Error::from)
	}

	fn delete_fail_server(&self, id: u64) -> Result<()> {
		self.db
			.delete(TREE_FAIL_SERVER, id.to_string().as_bytes())
			.map_err(Error::from)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;

	fn store() -> MetaStore {
		MetaStore::new(Db::open_memory())
	}

	#[test]
	fn db_name_id_bijection_is_enforced() {
		let s = store();
		s.create_db(&DbEntity { id: 1, name: "d1".into(), ps: vec![] }).unwrap();
		let err = s
			.create_db(&DbEntity { id: 2, name: "d1".into(), ps: vec![] })
			.unwrap_err();
		assert_eq!(err.kind, ErrorKind::DupSpace);
		assert_eq!(s.get_db_by_name("d1").unwrap().unwrap().id, 1);
		assert_eq!(s.get_db_by_id(1).unwrap().unwrap().name, "d1");
	}

	#[test]
	fn delete_db_removes_all_three_keys() {
		let s = store();
		s.create_db(&DbEntity { id: 1, name: "d1".into(), ps: vec![] }).unwrap();
		s.delete_db(1).unwrap();
		assert!(s.get_db_by_id(1).unwrap().is_none());
        assert!(s.get_db_by_name("d1").unwrap().is_none());
	}

	#[test]
	fn spaces_are_scoped_by_db_id() {
		let s = store();
		let space = Space {
			id: 10,
			db_id: 1,
			name: "s1".into(),
			partition_num: 1,
			replica_num: 1,
			properties: BTreeMap::new(),
			engine_config: Default::default(),
			partitions: vec![],
			version: 1,
			enabled: false,
		};
		s.put_space(&space).unwrap();
		assert_eq!(s.list_spaces(1).unwrap().len(), 1);
		assert_eq!(s.list_spaces(2).unwrap().len(), 0);
		assert_eq!(s.get_space_by_name(1, "s1").unwrap().unwrap().id, 10);
	}
}

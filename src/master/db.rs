//! `createDB`/`deleteDB`/query, grounded on `createDBService` and
//! `deleteDBService`.

use meridian_meta::Db as DbEntity;
use meridian_util::error::{Error, ErrorKind, Result};

use crate::service::MasterService;

impl MasterService {
	pub fn create_db(&self, name: &str, ps: Vec<String>) -> Result<DbEntity> {
		if name.is_empty() {
			return Err(Error::new(ErrorKind::RpcParamError, "db name must not be empty"));
		}
		if self.meta.get_db_by_name(name)?.is_some() {
			return Err(Error::new(ErrorKind::DupSpace, format!("db {} already exists", name)));
		}

		let id = self.db_id_alloc.next_id()?;
		let db_entity = DbEntity { id, name: name.to_string(), ps };
		self.meta.create_db(&db_entity)?;
		Ok(db_entity)
	}

	pub fn delete_db(&self, name: &str) -> Result<()> {
		let db_entity = self
			.meta
			.get_db_by_name(name)?
			.ok_or_else(|| Error::new(ErrorKind::DbNotExists, format!("db {} not found", name)))?;

		if !self.meta.list_spaces(db_entity.id)?.is_empty() {
			return Err(Error::new(ErrorKind::DbNotEmpty, format!("db {} still has spaces", name)));
		}

		self.meta.delete_db(db_entity.id)
	}

	pub fn query_db(&self, name: &str) -> Result<DbEntity> {
		self.meta
			.get_db_by_name(name)?
			.ok_or_else(|| Error::new(ErrorKind::DbNotExists, format!("db {} not found", name)))
	}

	pub fn list_dbs(&self) -> Result<Vec<DbEntity>> {
		self.meta.list_dbs()
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use meridian_db::Db;
	use meridian_meta::{MetaStore, MetaWriter};

	use crate::ps_admin::fake::FakePsAdmin;

	use super::*;

	fn service() -> MasterService {
		let db = Db::open_memory();
		let meta = Arc::new(MetaStore::new(db.clone()));
		MasterService::new(db, meta.clone(), Arc::new(FakePsAdmin::always_live(meta)), 300)
	}

	#[test]
	fn create_db_rejects_duplicate_names() {
		let svc = service();
		svc.create_db("d1", vec![]).unwrap();
		let err = svc.create_db("d1", vec![]).unwrap_err();
		assert_eq!(err.kind, ErrorKind::DupSpace);
	}

	#[test]
	fn delete_db_refuses_when_spaces_remain() {
		let svc = service();
		let db_entity = svc.create_db("d1", vec![]).unwrap();
		svc.meta
			.put_space(&meridian_meta::Space {
				id: 1,
				db_id: db_entity.id,
				name: "s1".into(),
				partition_num: 1,
				replica_num: 1,
				properties: Default::default(),
				engine_config: Default::default(),
				partitions: vec![],
				version: 1,
				enabled: true,
			})
			.unwrap();
		let err = svc.delete_db("d1").unwrap_err();
		assert_eq!(err.kind, ErrorKind::DbNotEmpty);
	}

	#[test]
	fn delete_db_removes_an_empty_db() {
		let svc = service();
		svc.create_db("d1", vec![]).unwrap();
		svc.delete_db("d1").unwrap();
		assert_eq!(svc.query_db("d1").unwrap_err().kind, ErrorKind::DbNotExists);
	}
}

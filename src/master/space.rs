//! `createSpace`/`updateSpace`/`deleteSpace`, grounded on
//! `createSpaceService`/`updateSpaceService`/`deleteSpaceService`.
//!
//! `createSpace` follows the teacher's nine-step shape: resolve db,
//! lock the cluster, validate the field schema, check for a name
//! collision, allocate ids and slots, place replicas, persist the
//! space disabled, dispatch `CreatePartition` to every replica, poll
//! until every partition has self-registered, then flip `enabled` and
//! bump the version exactly once.
//!
//! `updateSpace` additionally requires every partition's leader to be
//! live before it pushes `UpdatePartition` to each of them; only then
//! is the updated space persisted.

use std::collections::BTreeMap;
use std::time::Duration;

use meridian_meta::{EngineConfig, FieldSchema, Partition, Space};
use meridian_util::error::{Error, ErrorKind, Result};

use crate::service::MasterService;

const SPACE_LOCK_KEY: &str = "lock/space";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const POLL_MAX_ATTEMPTS: u32 = 200;

const VALID_FIELD_TYPES: &[&str] = &["text", "keyword", "int", "float", "date", "geopoint", "vector", "bool"];

/// Rejects a schema with an unknown `field_type` or a `vector` field
/// with no positive `dimension`, before any placement or persistence
/// work begins.
fn validate_schema(properties: &BTreeMap<String, FieldSchema>) -> Result<()> {
	for (name, schema) in properties {
		if !VALID_FIELD_TYPES.contains(&schema.field_type.as_str()) {
			return Err(Error::new(ErrorKind::RpcParamError, format!("field {}: unknown field_type {:?}", name, schema.field_type)));
		}
		if schema.field_type == "vector" && !matches!(schema.dimension, Some(d) if d > 0) {
			return Err(Error::new(ErrorKind::RpcParamError, format!("field {}: vector field requires a positive dimension", name)));
		}
	}
	Ok(())
}

/// Deletes the not-yet-enabled space row on drop unless [`commit`] was
/// called — the Rust shape of the teacher's `defer` cleanup that undoes
/// a `createSpace` which never reached `enabled = true`.
struct SpaceCleanupGuard<'a> {
	svc: &'a MasterService,
	db_id: u64,
	space_id: u64,
	committed: bool,
}

impl<'a> SpaceCleanupGuard<'a> {
	fn commit(mut self) {
		self.committed = true;
	}
}

impl<'a> Drop for SpaceCleanupGuard<'a> {
	fn drop(&mut self) {
		if !self.committed {
			if let Err(e) = self.svc.meta.delete_space(self.db_id, self.space_id) {
				tracing::error!(error = %e, "failed to roll back uncommitted space");
			}
		}
	}
}

impl MasterService {
	pub async fn create_space(
		&self,
		db_name: &str,
		space_name: &str,
		partition_num: u32,
		replica_num: u32,
		properties: BTreeMap<String, FieldSchema>,
		engine_config: EngineConfig,
	) -> Result<Space> {
		if partition_num == 0 {
			return Err(Error::new(ErrorKind::RpcParamError, "partition_num must be > 0"));
		}
		validate_schema(&properties)?;

		let db_entity = self
			.meta
			.get_db_by_name(db_name)?
			.ok_or_else(|| Error::new(ErrorKind::DbNotExists, format!("db {} not found", db_name)))?;

		let owner = format!("create-space-{}-{}", db_name, space_name);
		let _guard = self.lock(SPACE_LOCK_KEY, &owner)?;

		if self.meta.get_space_by_name(db_entity.id, space_name)?.is_some() {
			return Err(Error::new(ErrorKind::DupSpace, format!("space {} already exists", space_name)));
		}

		let servers = self.meta.list_servers()?;
		if servers.is_empty() {
			return Err(Error::new(ErrorKind::MasterPsNotEnoughSelect, "no servers registered"));
		}

		let space_id = self.space_id_alloc.next_id()?;

		let mut partitions = Vec::with_capacity(partition_num as usize);
		for i in 0..partition_num {
			let id = self.partition_id_alloc.next_id()?;
			partitions.push(Partition {
				id,
				space_id,
				db_id: db_entity.id,
				slot: Partition::slot_for(i, partition_num),
				replicas: vec![],
				leader_id: None,
				update_time: 0,
			});
		}

		let all_spaces = self.meta.list_all_spaces()?;
		let mut load = crate::placement::filter_and_sort_servers(&db_entity, &servers, &all_spaces);
		for partition in &mut partitions {
			crate::placement::place_replicas(&servers, &mut load, replica_num, partition, self.probe.as_ref())?;
		}

		let mut space = Space {
			id: space_id,
			db_id: db_entity.id,
			name: space_name.to_string(),
			partition_num,
			replica_num,
			properties,
			engine_config,
			partitions,
			version: 1,
			enabled: false,
		};
		self.meta.put_space(&space)?;

		let guard = SpaceCleanupGuard { svc: self, db_id: db_entity.id, space_id, committed: false };

		for partition in &space.partitions {
			for &node_id in &partition.replicas {
				let server = self
					.meta
					.get_server(node_id)?
					.ok_or_else(|| Error::new(ErrorKind::InternalError, format!("dangling replica node {}", node_id)))?;
				self.dispatcher.create_partition(&server.rpc_addr(), &space, partition.id).await?;
			}
		}

		for partition in &mut space.partitions {
			let record = self.poll_partition_registered(partition.id).await?;
			partition.leader_id = record.leader_id;
			partition.update_time = record.update_time;
		}

		space.enabled = true;
		self.meta.put_space(&space)?;
		guard.commit();

		Ok(space)
	}

	/// Accepts a partition server's self-reported record from
	/// `POST /register_partition` (sent once it has started, and again
	/// whenever it elects a new local leader): writes the standalone
	/// partition record `poll_partition_registered` watches for, and
	/// merges the reported `leader_id` back into the owning
	/// `Space.partitions[]` entry, since that is what every data-plane
	/// dispatch actually reads. A report with no leader yet (`None`)
	/// never clobbers a leader already on record.
	pub fn register_partition(&self, partition: Partition) -> Result<()> {
		self.meta.put_partition_record(&partition)?;

		if let Some(mut space) = self.meta.get_space(partition.db_id, partition.space_id)? {
			if let Some(target) = space.partitions.iter_mut().find(|p| p.id == partition.id) {
				if partition.leader_id.is_some() && target.leader_id != partition.leader_id {
					target.leader_id = partition.leader_id;
					target.update_time = partition.update_time;
					self.meta.put_space(&space)?;
				}
			}
		}

		Ok(())
	}

	async fn poll_partition_registered(&self, partition_id: u64) -> Result<Partition> {
		for attempt in 0..POLL_MAX_ATTEMPTS {
			if let Some(record) = self.meta.get_partition_record(partition_id)? {
				return Ok(record);
			}
			if attempt % 5 == 0 {
				tracing::debug!(partition_id, "waiting for partition to register");
			}
			tokio::time::sleep(POLL_INTERVAL).await;
		}
		Err(Error::new(ErrorKind::Timeout, format!("partition {} never registered", partition_id)))
	}

	pub fn delete_space(&self, db_name: &str, space_name: &str) -> Result<()> {
		let db_entity = self
			.meta
			.get_db_by_name(db_name)?
			.ok_or_else(|| Error::new(ErrorKind::DbNotExists, format!("db {} not found", db_name)))?;
		let space = match self.meta.get_space_by_name(db_entity.id, space_name)? {
			Some(s) => s,
			None => return Ok(()),
		};
		self.meta.delete_space(db_entity.id, space.id)?;
		for partition in &space.partitions {
			for &node_id in &partition.replicas {
				if let Ok(Some(_)) = self.meta.get_server(node_id) {
					let _ = self.meta.delete_partition_record(partition.id);
				}
			}
		}
		Ok(())
	}

	pub fn query_space(&self, db_name: &str, space_name: &str) -> Result<Space> {
		let db_entity = self
			.meta
			.get_db_by_name(db_name)?
			.ok_or_else(|| Error::new(ErrorKind::DbNotExists, format!("db {} not found", db_name)))?;
		self.meta
			.get_space_by_name(db_entity.id, space_name)?
			.ok_or_else(|| Error::new(ErrorKind::SpaceNotExists, format!("space {} not found", space_name)))
	}

	pub fn list_spaces(&self, db_name: &str) -> Result<Vec<Space>> {
		let db_entity = self
			.meta
			.get_db_by_name(db_name)?
			.ok_or_else(|| Error::new(ErrorKind::DbNotExists, format!("db {} not found", db_name)))?;
		self.meta.list_spaces(db_entity.id)
	}

	/// Additive-only schema update: `partition_num`/`replica_num`/`db_id`
	/// are immutable once a space exists, and properties may only be
	/// merged in, never replaced or redefined — a field present in both
	/// the stored and incoming schema must be identical. Every partition
	/// leader must be live and accept the pushed `UpdatePartition` before
	/// any of this is persisted; version increments exactly once on
	/// success.
	pub async fn update_space(&self, db_name: &str, space_name: &str, incoming: SpaceUpdate) -> Result<Space> {
		let owner = format!("update-space-{}-{}", db_name, space_name);
		let _guard = self.lock(&format!("lock/space/{}/{}", db_name, space_name), &owner)?;

		let mut space = self.query_space(db_name, space_name)?;

		if let Some(partition_num) = incoming.partition_num {
			if partition_num != space.partition_num {
				return Err(Error::new(ErrorKind::RpcParamError, "partition_num can not change"));
			}
		}
		if let Some(replica_num) = incoming.replica_num {
			if replica_num != space.replica_num {
				return Err(Error::new(ErrorKind::RpcParamError, "replica_num can not change"));
			}
		}

		if let Some(enabled) = incoming.enabled {
			space.enabled = enabled;
		}

		if let Some(new_props) = incoming.properties {
			for (field, new_schema) in &new_props {
				if let Some(old_schema) = space.properties.get(field) {
					if old_schema != new_schema {
						return Err(Error::new(
							ErrorKind::NotEqualsByField,
							format!("field {} already exists with a different definition", field),
						));
					}
				}
			}
			for (field, new_schema) in new_props {
				space.properties.entry(field).or_insert(new_schema);
			}
		}

		let mut leaders = Vec::with_capacity(space.partitions.len());
		for partition in &space.partitions {
			let leader_id = partition
				.leader_id
				.ok_or_else(|| Error::new(ErrorKind::PartitionNoLeader, format!("partition {} has no leader", partition.id)))?;
			let leader = self
				.meta
				.get_server(leader_id)?
				.ok_or_else(|| Error::new(ErrorKind::InternalError, format!("leader {} has no server record", leader_id)))?;
			if !self.probe.is_live(&leader.rpc_addr()) {
				return Err(Error::new(ErrorKind::ServiceUnavailable, format!("leader {} is unreachable", leader.rpc_addr())));
			}
			leaders.push((partition.id, leader.rpc_addr()));
		}

		for (partition_id, leader_addr) in leaders {
			self.dispatcher.update_partition(&leader_addr, &space, partition_id).await?;
		}

		space.version += 1;
		self.meta.put_space(&space)?;
		Ok(space)
	}
}

#[derive(Default)]
pub struct SpaceUpdate {
	pub partition_num: Option<u32>,
	pub replica_num: Option<u32>,
	pub enabled: Option<bool>,
	pub properties: Option<BTreeMap<String, FieldSchema>>,
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use meridian_db::Db;
	use meridian_meta::{MetaStore, MetaWriter, Server};

	use crate::ps_admin::fake::FakePsAdmin;

	use super::*;

	fn service_with_server() -> MasterService {
		let db = Db::open_memory();
		let meta = Arc::new(MetaStore::new(db.clone()));
		meta.upsert_server(&Server {
			id: 1,
			ip: "127.0.0.1".into(),
			rpc_port: 9000,
			raft_heartbeat_port: 9001,
			raft_replicate_port: 9002,
			partition_ids: vec![],
			private: false,
			version: 1,
		})
		.unwrap();
		let svc = MasterService::new(db, meta.clone(), Arc::new(FakePsAdmin::always_live(meta)), 300);
		svc
	}

	#[tokio::test]
	async fn create_space_enables_once_every_partition_registers() {
		let svc = service_with_server();
		svc.create_db("d1", vec![]).unwrap();
		let space = svc.create_space("d1", "s1", 4, 1, BTreeMap::new(), EngineConfig::default()).await.unwrap();
		assert!(space.enabled);
		assert_eq!(space.partitions.len(), 4);
		for p in &space.partitions {
			assert_eq!(p.replicas.len(), 1);
			assert!(svc.meta.get_partition_record(p.id).unwrap().is_some());
		}
	}

	#[tokio::test]
	async fn create_space_propagates_leader_into_the_stored_space() {
		let svc = service_with_server();
		svc.create_db("d1", vec![]).unwrap();
		let space = svc.create_space("d1", "s1", 1, 1, BTreeMap::new(), EngineConfig::default()).await.unwrap();

		let partition = &space.partitions[0];
		assert_eq!(partition.leader_id, Some(1));

		let stored = svc.meta.get_space(space.db_id, space.id).unwrap().unwrap();
		assert_eq!(stored.partitions[0].leader_id, Some(1));
	}

	#[tokio::test]
	async fn create_space_rejects_unknown_field_type() {
		let svc = service_with_server();
		svc.create_db("d1", vec![]).unwrap();
		let mut props = BTreeMap::new();
		props.insert("x".to_string(), FieldSchema { field_type: "bogus".into(), dimension: None, index: false });
		let err = svc.create_space("d1", "s1", 1, 1, props, EngineConfig::default()).await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::RpcParamError);
	}

	#[tokio::test]
	async fn create_space_rejects_vector_field_without_dimension() {
		let svc = service_with_server();
		svc.create_db("d1", vec![]).unwrap();
		let mut props = BTreeMap::new();
		props.insert("vec".to_string(), FieldSchema { field_type: "vector".into(), dimension: None, index: true });
		let err = svc.create_space("d1", "s1", 1, 1, props, EngineConfig::default()).await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::RpcParamError);
	}

	#[tokio::test]
	async fn create_space_rejects_duplicate_name() {
		let svc = service_with_server();
		svc.create_db("d1", vec![]).unwrap();
		svc.create_space("d1", "s1", 1, 1, BTreeMap::new(), EngineConfig::default()).await.unwrap();
		let err = svc.create_space("d1", "s1", 1, 1, BTreeMap::new(), EngineConfig::default()).await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::DupSpace);
	}

	#[tokio::test]
	async fn update_space_pushes_update_partition_to_the_leader() {
		let db = Db::open_memory();
		let meta = Arc::new(MetaStore::new(db.clone()));
		meta.upsert_server(&Server {
			id: 1,
			ip: "127.0.0.1".into(),
			rpc_port: 9000,
			raft_heartbeat_port: 9001,
			raft_replicate_port: 9002,
			partition_ids: vec![],
			private: false,
			version: 1,
		})
		.unwrap();
		let fake = Arc::new(FakePsAdmin::always_live(meta.clone()));
		let svc = MasterService::new(db, meta, fake.clone(), 300).with_probe(fake.clone());

		svc.create_db("d1", vec![]).unwrap();
		svc.create_space("d1", "s1", 1, 1, BTreeMap::new(), EngineConfig::default()).await.unwrap();

		let mut new_props = BTreeMap::new();
		new_props.insert("label".to_string(), FieldSchema { field_type: "text".into(), dimension: None, index: false });
		let update = SpaceUpdate { properties: Some(new_props), ..Default::default() };
		svc.update_space("d1", "s1", update).await.unwrap();

		assert_eq!(fake.updated.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn update_space_rejects_when_leader_is_unreachable() {
		let db = Db::open_memory();
		let meta = Arc::new(MetaStore::new(db.clone()));
		meta.upsert_server(&Server {
			id: 1,
			ip: "127.0.0.1".into(),
			rpc_port: 9000,
			raft_heartbeat_port: 9001,
			raft_replicate_port: 9002,
			partition_ids: vec![],
			private: false,
			version: 1,
		})
		.unwrap();
		let fake = Arc::new(FakePsAdmin::always_live(meta.clone()));
		let svc = MasterService::new(db, meta, fake.clone(), 300).with_probe(fake.clone());

		svc.create_db("d1", vec![]).unwrap();
		svc.create_space("d1", "s1", 1, 1, BTreeMap::new(), EngineConfig::default()).await.unwrap();

		fake.live.lock().unwrap().clear();

		let update = SpaceUpdate { enabled: Some(false), ..Default::default() };
		let err = svc.update_space("d1", "s1", update).await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
	}

	#[tokio::test]
	async fn update_space_rejects_partition_num_change() {
		let svc = service_with_server();
		svc.create_db("d1", vec![]).unwrap();
		svc.create_space("d1", "s1", 1, 1, BTreeMap::new(), EngineConfig::default()).await.unwrap();
		let update = SpaceUpdate { partition_num: Some(2), ..Default::default() };
		let err = svc.update_space("d1", "s1", update).await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::RpcParamError);
	}

	#[tokio::test]
	async fn update_space_merges_new_fields_and_bumps_version_once() {
		let svc = service_with_server();
		svc.create_db("d1", vec![]).unwrap();
		let mut props = BTreeMap::new();
		props.insert("vec".to_string(), FieldSchema { field_type: "vector".into(), dimension: Some(128), index: true });
		svc.create_space("d1", "s1", 1, 1, props, EngineConfig::default()).await.unwrap();

		let mut new_props = BTreeMap::new();
		new_props.insert("label".to_string(), FieldSchema { field_type: "string".into(), dimension: None, index: false });
		let update = SpaceUpdate { properties: Some(new_props), ..Default::default() };
		let updated = svc.update_space("d1", "s1", update).await.unwrap();
		assert_eq!(updated.version, 2);
		assert_eq!(updated.properties.len(), 2);
	}

	#[tokio::test]
	async fn update_space_rejects_conflicting_redefinition() {
		let svc = service_with_server();
		svc.create_db("d1", vec![]).unwrap();
		let mut props = BTreeMap::new();
		props.insert("vec".to_string(), FieldSchema { field_type: "vector".into(), dimension: Some(128), index: true });
		svc.create_space("d1", "s1", 1, 1, props, EngineConfig::default()).await.unwrap();

		let mut conflicting = BTreeMap::new();
		conflicting.insert("vec".to_string(), FieldSchema { field_type: "vector".into(), dimension: Some(64), index: true });
		let update = SpaceUpdate { properties: Some(conflicting), ..Default::default() };
		let err = svc.update_space("d1", "s1", update).await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::NotEqualsByField);
	}
}

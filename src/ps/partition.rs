//! Local partition state: one entry per partition replica hosted on
//! this node, each holding its own consensus handle, engine handle and
//! durable sequence number. The table itself is a single `RwLock` over
//! the id -> partition map, but that lock is only ever held for the
//! instant it takes to insert, remove or clone out an `Arc`; all actual
//! partition mutation goes through the partition's own interior
//! locking, so concurrent calls against different partitions never
//! contend with each other.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use meridian_meta::{ChangeMemberMethod, Replica, Space};
use meridian_util::error::{Error, ErrorKind, Result};

use crate::engine::{IndexStatus, MemoryEngine, PartitionInfo, Reader};
use crate::sn::SnFile;

/// The consensus log replicator, treated as a black box: propose an
/// entry, reconfigure membership, report the current leader and a
/// human-readable status line. A real binding drives an actual
/// consensus group; [`SingleNodeConsensus`] is a stand-in that never
/// holds an election, for exercising the admin surface without one.
pub trait ConsensusGroup: Send + Sync {
	fn propose(&self, entry: Vec<u8>) -> Result<u64>;
	fn add_member(&self, replica: Replica) -> Result<()>;
	fn remove_member(&self, node_id: u64) -> Result<()>;
	fn leader(&self) -> Option<Replica>;
	fn status(&self) -> String;
}

pub struct SingleNodeConsensus {
	members: Mutex<Vec<Replica>>,
	applied: Mutex<u64>,
}

impl SingleNodeConsensus {
	/// The first entry in `members` is reported as leader for the
	/// lifetime of this stub — it never holds an election.
	pub fn new(members: Vec<Replica>) -> Self {
		SingleNodeConsensus { members: Mutex::new(members), applied: Mutex::new(0) }
	}
}

impl ConsensusGroup for SingleNodeConsensus {
	fn propose(&self, _entry: Vec<u8>) -> Result<u64> {
		let mut applied = self.applied.lock().unwrap();
		*applied += 1;
		Ok(*applied)
	}

	fn add_member(&self, replica: Replica) -> Result<()> {
		let mut members = self.members.lock().unwrap();
		if members.iter().any(|r| r.node_id == replica.node_id) {
			return Err(Error::new(ErrorKind::RpcParamError, format!("node {} is already a member", replica.node_id)));
		}
		members.push(replica);
		Ok(())
	}

	fn remove_member(&self, node_id: u64) -> Result<()> {
		self.members.lock().unwrap().retain(|r| r.node_id != node_id);
		Ok(())
	}

	fn leader(&self) -> Option<Replica> {
		self.members.lock().unwrap().first().cloned()
	}

	fn status(&self) -> String {
		let members = self.members.lock().unwrap();
		let ids: Vec<u64> = members.iter().map(|r| r.node_id).collect();
		format!("leader={:?} members={:?}", ids.first(), ids)
	}
}

/// One partition replica's state on this node.
pub struct LocalPartition {
	pub id: u64,
	pub space_id: u64,
	dir: PathBuf,
	sn: SnFile,
	engine: Box<dyn Reader>,
	consensus: Box<dyn ConsensusGroup>,
}

impl LocalPartition {
	pub fn new(id: u64, space_id: u64, dir: PathBuf, members: Vec<Replica>) -> Self {
		let sn = SnFile::new(&dir);
		LocalPartition { id, space_id, dir, sn, engine: Box::new(MemoryEngine::new()), consensus: Box::new(SingleNodeConsensus::new(members)) }
	}

	pub fn is_leader(&self, node_id: u64) -> bool {
		self.consensus.leader().map(|r| r.node_id) == Some(node_id)
	}

	pub fn leader(&self) -> Option<Replica> {
		self.consensus.leader()
	}

	pub fn add_member(&self, replica: Replica) -> Result<()> {
		self.consensus.add_member(replica)
	}

	pub fn remove_member(&self, node_id: u64) -> Result<()> {
		self.consensus.remove_member(node_id)
	}

	pub fn read_sn(&self) -> Result<u64> {
		self.sn.read()
	}

	pub fn write_sn(&self, value: u64) -> Result<()> {
		self.sn.write(value)
	}

	pub fn info(&self, unreachable: bool) -> Result<PartitionInfo> {
		Ok(PartitionInfo {
			partition_id: self.id,
			doc_num: self.engine.doc_count()?,
			size: self.engine.capacity()?,
			path: self.dir.display().to_string(),
			raft_status: self.consensus.status(),
			index_status: self.engine.index_status(),
			unreachable,
		})
	}

	pub fn engine(&self) -> &dyn Reader {
		self.engine.as_ref()
	}

	pub fn index_status(&self) -> IndexStatus {
		self.engine.index_status()
	}
}

/// All partitions this node currently hosts, by id.
pub struct PartitionTable {
	node_id: u64,
	data_dir: PathBuf,
	partitions: RwLock<BTreeMap<u64, Arc<LocalPartition>>>,
}

impl PartitionTable {
	pub fn new(node_id: u64, data_dir: PathBuf) -> Self {
		PartitionTable { node_id, data_dir, partitions: RwLock::new(BTreeMap::new()) }
	}

	pub fn node_id(&self) -> u64 {
		self.node_id
	}

	fn partition_dir(&self, partition_id: u64) -> PathBuf {
		self.data_dir.join(partition_id.to_string())
	}

	pub fn get(&self, partition_id: u64) -> Option<Arc<LocalPartition>> {
		self.partitions.read().unwrap().get(&partition_id).cloned()
	}

	pub fn all(&self) -> Vec<Arc<LocalPartition>> {
		self.partitions.read().unwrap().values().cloned().collect()
	}

	/// Creating an already-hosted partition is idempotent at the RPC
	/// layer: this returns `PARTITION_DUPLICATE` so a retried dispatch
	/// from the master is treated as success by the caller. `members`
	/// carries the full addresses of every replica, supplied by the
	/// master (which already resolved them from its own `Server`
	/// records) since this node has no metadata store of its own to
	/// resolve them from.
	pub fn create(&self, space: &Space, partition_id: u64, members: Vec<Replica>) -> Result<()> {
		if self.partitions.read().unwrap().contains_key(&partition_id) {
			return Err(Error::new(ErrorKind::PartitionDuplicate, format!("partition {} already hosted", partition_id)));
		}
		let dir = self.partition_dir(partition_id);
		let partition = Arc::new(LocalPartition::new(partition_id, space.id, dir, members));

		let mut table = self.partitions.write().unwrap();
		table.entry(partition_id).or_insert(partition);
		Ok(())
	}

	/// Deleting an absent partition is a no-op success, matching the
	/// idempotence contract retried dispatches rely on.
	pub fn delete(&self, partition_id: u64) -> Result<()> {
		self.partitions.write().unwrap().remove(&partition_id);
		Ok(())
	}

	pub fn change_member(&self, partition_id: u64, method: ChangeMemberMethod, replica: Replica) -> Result<()> {
		let partition = self
			.get(partition_id)
			.ok_or_else(|| Error::new(ErrorKind::RpcParamError, format!("partition {} not hosted here", partition_id)))?;
		if !partition.is_leader(self.node_id) {
			return Err(leader_error(partition.leader()));
		}
		match method {
			ChangeMemberMethod::Add => partition.add_member(replica),
			ChangeMemberMethod::Remove => partition.remove_member(replica.node_id),
		}
	}
}

/// Builds the redirect error the not-leader middleware (and direct
/// callers like `change_member`) return: `PARTITION_NOT_LEADER` carrying
/// the JSON-encoded leader `Replica` when one is known,
/// `PARTITION_NO_LEADER` otherwise.
pub fn leader_error(leader: Option<Replica>) -> Error {
	match leader {
		Some(replica) => {
			let payload = serde_json::to_string(&replica).unwrap_or_default();
			Error::with_redirect("not leader", payload)
		}
		None => Error::new(ErrorKind::PartitionNoLeader, "no leader known"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use meridian_meta::Partition;

	fn replica(node_id: u64) -> Replica {
		Replica { node_id, rpc_addr: format!("10.0.0.{}:9000", node_id), heartbeat_addr: format!("10.0.0.{}:9001", node_id), replicate_addr: format!("10.0.0.{}:9002", node_id) }
	}

	fn space_with_partition(partition_id: u64, replica_ids: Vec<u64>) -> Space {
		Space {
			id: 1,
			db_id: 1,
			name: "s1".into(),
			partition_num: 1,
			replica_num: replica_ids.len() as u32,
			properties: Default::default(),
			engine_config: Default::default(),
			partitions: vec![Partition { id: partition_id, space_id: 1, db_id: 1, slot: 0, replicas: replica_ids, leader_id: None, update_time: 0 }],
			version: 1,
			enabled: true,
		}
	}

	#[test]
	fn create_is_idempotent_and_reports_duplicate_on_retry() {
		let table = PartitionTable::new(1, PathBuf::from("/tmp/meridian-ps-test"));
		let space = space_with_partition(42, vec![1, 2]);
		table.create(&space, 42, vec![replica(1), replica(2)]).unwrap();
		let err = table.create(&space, 42, vec![replica(1), replica(2)]).unwrap_err();
		assert_eq!(err.kind, ErrorKind::PartitionDuplicate);
	}

	#[test]
	fn delete_missing_partition_is_success() {
		let table = PartitionTable::new(1, PathBuf::from("/tmp/meridian-ps-test"));
		table.delete(999).unwrap();
	}

	#[test]
	fn change_member_on_non_leader_redirects_with_leader_replica() {
		let table = PartitionTable::new(2, PathBuf::from("/tmp/meridian-ps-test"));
		let space = space_with_partition(1, vec![1, 2]);
		table.create(&space, 1, vec![replica(1), replica(2)]).unwrap();
		let partition = table.get(1).unwrap();
		assert!(!partition.is_leader(2));
		let err = table.change_member(1, ChangeMemberMethod::Add, replica(3)).unwrap_err();
		assert_eq!(err.kind, ErrorKind::PartitionNotLeader);
		let leader: Replica = serde_json::from_str(&err.redirect.unwrap()).unwrap();
		assert_eq!(leader.node_id, 1);
	}

	#[test]
	fn adding_an_existing_member_is_rejected() {
		let table = PartitionTable::new(1, PathBuf::from("/tmp/meridian-ps-test"));
		let space = space_with_partition(1, vec![1, 2]);
		table.create(&space, 1, vec![replica(1), replica(2)]).unwrap();
		let err = table.change_member(1, ChangeMemberMethod::Add, replica(2)).unwrap_err();
		assert_eq!(err.kind, ErrorKind::RpcParamError);
	}

	#[test]
	fn removing_a_non_member_succeeds() {
		let table = PartitionTable::new(1, PathBuf::from("/tmp/meridian-ps-test"));
		let space = space_with_partition(1, vec![1, 2]);
		table.create(&space, 1, vec![replica(1), replica(2)]).unwrap();
		table.change_member(1, ChangeMemberMethod::Remove, replica(99)).unwrap();
	}

	#[test]
	fn no_leader_known_yields_no_leader_error() {
		let table = PartitionTable::new(1, PathBuf::from("/tmp/meridian-ps-test"));
		let space = space_with_partition(1, vec![]);
		table.create(&space, 1, vec![]).unwrap();
		let err = table.change_member(1, ChangeMemberMethod::Add, replica(2)).unwrap_err();
		assert_eq!(err.kind, ErrorKind::PartitionNoLeader);
	}
}

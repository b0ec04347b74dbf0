//! Plain, strongly-consistent metadata entities. Unlike a CRDT-replicated
//! table these are mutated only through the master's serialized
//! transactions (see [`crate::store::MetaWriter`]); there is no merge
//! function because there is never more than one concurrent writer per
//! key once the cluster-wide lock is held.

use serde::{Deserialize, Serialize};

pub const MAX_U32: u64 = u32::MAX as u64 + 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Server {
	pub id: u64,
	pub ip: String,
	pub rpc_port: u16,
	pub raft_heartbeat_port: u16,
	pub raft_replicate_port: u16,
	#[serde(default)]
	pub partition_ids: Vec<u64>,
	#[serde(default)]
	pub private: bool,
	#[serde(default)]
	pub version: u64,
}

impl Server {
	pub fn rpc_addr(&self) -> String {
		format!("{}:{}", self.ip, self.rpc_port)
	}

	pub fn heartbeat_addr(&self) -> String {
		format!("{}:{}", self.ip, self.raft_heartbeat_port)
	}

	pub fn replicate_addr(&self) -> String {
		format!("{}:{}", self.ip, self.raft_replicate_port)
	}

	pub fn to_replica(&self) -> Replica {
		Replica {
			node_id: self.id,
			rpc_addr: self.rpc_addr(),
			heartbeat_addr: self.heartbeat_addr(),
			replicate_addr: self.replicate_addr(),
		}
	}
}

/// The payload carried in a `PARTITION_NOT_LEADER` redirect, and returned
/// by `PartitionInfo`/`Stats` admin calls.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Replica {
	pub node_id: u64,
	pub rpc_addr: String,
	pub heartbeat_addr: String,
	pub replicate_addr: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Db {
	pub id: u64,
	pub name: String,
	/// Optional allow-list of server IPs this db's spaces may place
	/// replicas on.
	#[serde(default)]
	pub ps: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
	pub field_type: String,
	#[serde(default)]
	pub dimension: Option<u32>,
	#[serde(default)]
	pub index: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EngineConfig {
	#[serde(default)]
	pub index_size: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Space {
	pub id: u64,
	pub db_id: u64,
	pub name: String,
	pub partition_num: u32,
	pub replica_num: u32,
	/// Schema, field name to definition. Mutation is additive-only: see
	/// `meridian_master::update_space`.
	pub properties: std::collections::BTreeMap<String, FieldSchema>,
	#[serde(default)]
	pub engine_config: EngineConfig,
	pub partitions: Vec<Partition>,
	pub version: u64,
	pub enabled: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Partition {
	pub id: u64,
	pub space_id: u64,
	pub db_id: u64,
	pub slot: u32,
	pub replicas: Vec<u64>,
	#[serde(default)]
	pub leader_id: Option<u64>,
	#[serde(default)]
	pub update_time: u64,
}

impl Partition {
	/// Assigns `slot = i * (MAX_U32 / partition_num)`, per the spec's
	/// contiguous, non-overlapping coverage of `[0, 2^32)`.
	pub fn slot_for(index: u32, partition_num: u32) -> u32 {
		debug_assert!(partition_num > 0);
		((index as u64) * MAX_U32 / partition_num as u64) as u32
	}
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FailServer {
	/// The id the failed `Server` record used to have.
	pub id: u64,
	/// A snapshot of the `Server` record at the moment it was declared
	/// failed, including `partition_ids` — that's what lets recovery
	/// walk every partition the dead node used to host.
	pub node: Server,
	pub timestamp: u64,
}

/// `ChangeMember` reconfiguration input, shared verbatim by the admin
/// HTTP route and the master-internal call used by `RecoverFailServer`
/// and `ChangeReplicas`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMemberMethod {
	Add,
	Remove,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChangeMemberRequest {
	pub partition_id: u64,
	pub node_id: u64,
	pub method: ChangeMemberMethod,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn slots_partition_the_u32_space_without_gaps() {
		let n = 5;
		let slots: Vec<u32> = (0..n).map(|i| Partition::slot_for(i, n)).collect();
		assert_eq!(slots[0], 0);
		for w in slots.windows(2) {
			assert!(w[1] > w[0]);
		}
		// last partition's slot must leave room to own up to MAX_U32
		assert!(*slots.last().unwrap() < u32::MAX);
	}

	#[test]
	fn single_partition_owns_entire_range() {
		assert_eq!(Partition::slot_for(0, 1), 0);
	}
}

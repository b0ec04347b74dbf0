//! The master's in-process handle: metadata access, id allocation and
//! the shared cluster lock, wired together once at startup and then
//! shared (behind an `Arc`) by every admin route handler.

use std::sync::Arc;

use meridian_db::{Db, IdAllocator, Lock, LockGuard};
use meridian_meta::{MetaWriter, Partition, Server};
use meridian_util::error::Result;

use crate::placement::{AlwaysLive, LivenessProbe};
use crate::ps_admin::PsAdmin;

/// Connection info a partition server reports about itself on `/register`.
pub struct ServerAddr {
	pub ip: String,
	pub rpc_port: u16,
	pub raft_heartbeat_port: u16,
	pub raft_replicate_port: u16,
}

pub struct MasterService {
	pub meta: Arc<dyn MetaWriter>,
	lock_db: Db,
	pub db_id_alloc: IdAllocator,
	pub space_id_alloc: IdAllocator,
	pub partition_id_alloc: IdAllocator,
	pub probe: Arc<dyn LivenessProbe>,
	pub dispatcher: Arc<dyn PsAdmin>,
	pub lease_ttl_secs: u64,
}

impl MasterService {
	pub fn new(db: Db, meta: Arc<dyn MetaWriter>, dispatcher: Arc<dyn PsAdmin>, lease_ttl_secs: u64) -> Self {
		MasterService {
			meta,
			lock_db: db.clone(),
			db_id_alloc: IdAllocator::new(db.clone(), "db", 1),
			space_id_alloc: IdAllocator::new(db.clone(), "space", 1),
			partition_id_alloc: IdAllocator::new(db, "partition", 1),
			probe: Arc::new(AlwaysLive),
			dispatcher,
			lease_ttl_secs,
		}
	}

	pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
		self.probe = probe;
		self
	}

	/// The raw lock/cluster `Db` handle, for admin operations (like
	/// `clean_lock`) that need to reach the lock tree directly rather
	/// than through a domain-specific method.
	pub fn lock_db_handle(&self) -> Db {
		self.lock_db.clone()
	}

	/// Acquires `key` for `owner`, leased for the configured lease TTL.
	/// Every multi-step master operation (createSpace, updateSpace,
	/// ChangeMember) wraps its body in one of these so a crashed master
	/// never wedges the cluster lock past the lease window.
	pub(crate) fn lock(&self, key: &str, owner: &str) -> Result<LockGuard> {
		Lock::acquire(&self.lock_db, key, owner, self.lease_ttl_secs).map_err(Into::into)
	}

	/// Every partition across every space that currently lists `node_id`
	/// as a replica. Answers a PS's `/register` call on startup — how it
	/// learns what it's supposed to be hosting without the master having
	/// to track that separately.
	pub fn partitions_for_node(&self, node_id: u64) -> Result<Vec<Partition>> {
		let spaces = self.meta.list_all_spaces()?;
		Ok(spaces.into_iter().flat_map(|s| s.partitions).filter(|p| p.replicas.contains(&node_id)).collect())
	}

	/// Upserts the `Server` record for `node_id` when `addr` is given,
	/// creating it on first register per the lifecycle invariant, then
	/// answers with what the node should currently be hosting. `addr` is
	/// optional so a restarted node whose address hasn't changed can
	/// register with just its id.
	pub fn register(&self, node_id: u64, addr: Option<ServerAddr>) -> Result<Vec<Partition>> {
		if let Some(addr) = addr {
			let mut server = self.meta.get_server(node_id)?.unwrap_or(Server {
				id: node_id,
				ip: String::new(),
				rpc_port: 0,
				raft_heartbeat_port: 0,
				raft_replicate_port: 0,
				partition_ids: Vec::new(),
				private: false,
				version: 0,
			});
			server.ip = addr.ip;
			server.rpc_port = addr.rpc_port;
			server.raft_heartbeat_port = addr.raft_heartbeat_port;
			server.raft_replicate_port = addr.raft_replicate_port;
			server.version += 1;
			self.meta.upsert_server(&server)?;
		}
		self.partitions_for_node(node_id)
	}
}

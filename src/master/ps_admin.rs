//! The admin surface the master drives on partition servers during
//! `createSpace`/`updateSpace`/`ChangeMember`. Pulled behind a trait so
//! the placement and reconfiguration algorithms can be tested without a
//! network, and so the real implementation is free to route every call
//! through the pooled, leader-chasing [`meridian_rpc::PsClient`].

use std::sync::Arc;

use async_trait::async_trait;

use meridian_meta::{ChangeMemberRequest, MetaReader, Replica, Space};
use meridian_rpc::envelope::{CHANGE_MEMBER_HANDLER, CREATE_PARTITION_HANDLER, DELETE_PARTITION_HANDLER, DELETE_REPLICA_HANDLER, UPDATE_PARTITION_HANDLER};
use meridian_rpc::PsClient;
use meridian_util::error::{Error, ErrorKind, Result};

use crate::placement::LivenessProbe;

#[async_trait]
pub trait PsAdmin: LivenessProbe {
	async fn create_partition(&self, addr: &str, space: &Space, partition_id: u64) -> Result<()>;
	async fn delete_partition(&self, addr: &str, partition_id: u64) -> Result<()>;
	async fn update_partition(&self, addr: &str, space: &Space, partition_id: u64) -> Result<()>;
	async fn change_member(&self, addr: &str, cm: &ChangeMemberRequest) -> Result<()>;
	async fn delete_replica(&self, addr: &str, partition_id: u64) -> Result<()>;
}

/// Drives the real partition-server admin surface over
/// [`meridian_rpc::PsClient`]. Every wire payload is JSON, matching the
/// admin-ops half of the envelope format; `meta` is only consulted to
/// turn a partition's `replicas: Vec<u64>` into full [`Replica`]
/// addresses, since the partition server has no metadata store of its
/// own to resolve them from.
pub struct RpcPsAdmin {
	client: PsClient,
	meta: Arc<dyn MetaReader>,
}

impl RpcPsAdmin {
	pub fn new(client: PsClient, meta: Arc<dyn MetaReader>) -> Self {
		RpcPsAdmin { client, meta }
	}

	fn replicas_for(&self, space: &Space, partition_id: u64) -> Result<Vec<Replica>> {
		let partition = space
			.partitions
			.iter()
			.find(|p| p.id == partition_id)
			.ok_or_else(|| Error::new(ErrorKind::RpcParamError, format!("space has no partition {}", partition_id)))?;
		partition
			.replicas
			.iter()
			.map(|&id| {
				self.meta
					.get_server(id)?
					.ok_or_else(|| Error::new(ErrorKind::InternalError, format!("dangling replica node {}", id)))
					.map(|s| s.to_replica())
			})
			.collect()
	}

	async fn call_json(&self, addr: &str, handler: &str, payload: serde_json::Value) -> Result<Vec<u8>> {
		let data = serde_json::to_vec(&payload)?;
		self.client.call_addr(addr, 0, handler, data).await
	}
}

/// Checking reachability ahead of a placement decision is a cheap,
/// synchronous TCP probe rather than a round trip through the async
/// admin-RPC client: `LivenessProbe` is called from the placement
/// algorithm's non-async code, and a raw connect-with-timeout is all
/// `IsLive` needs to mean here.
impl LivenessProbe for RpcPsAdmin {
	fn is_live(&self, addr: &str) -> bool {
		use std::net::ToSocketAddrs;
		use std::time::Duration;

		let socket_addr = match addr.to_socket_addrs().ok().and_then(|mut it| it.next()) {
			Some(a) => a,
			None => return false,
		};
		std::net::TcpStream::connect_timeout(&socket_addr, Duration::from_secs(1)).is_ok()
	}
}

#[async_trait]
impl PsAdmin for RpcPsAdmin {
	async fn create_partition(&self, addr: &str, space: &Space, partition_id: u64) -> Result<()> {
		let members = self.replicas_for(space, partition_id)?;
		let payload = serde_json::json!({"space": space, "partition_id": partition_id, "members": members});
		match self.call_json(addr, CREATE_PARTITION_HANDLER, payload).await {
			Ok(_) => Ok(()),
			// A retried dispatch landing on a partition server that
			// already created this partition is success, not failure.
			Err(e) if e.kind == ErrorKind::PartitionDuplicate => Ok(()),
			Err(e) => Err(e),
		}
	}

	async fn delete_partition(&self, addr: &str, partition_id: u64) -> Result<()> {
		self.call_json(addr, DELETE_PARTITION_HANDLER, serde_json::json!({"partition_id": partition_id})).await.map(|_| ())
	}

	async fn update_partition(&self, addr: &str, space: &Space, partition_id: u64) -> Result<()> {
		let payload = serde_json::json!({"space": space, "partition_id": partition_id});
		self.call_json(addr, UPDATE_PARTITION_HANDLER, payload).await.map(|_| ())
	}

	async fn change_member(&self, addr: &str, cm: &ChangeMemberRequest) -> Result<()> {
		let replica = self
			.meta
			.get_server(cm.node_id)?
			.ok_or_else(|| Error::new(ErrorKind::InternalError, format!("no server record for node {}", cm.node_id)))?
			.to_replica();
		let payload = serde_json::json!({"partition_id": cm.partition_id, "method": cm.method, "replica": replica});
		self.call_json(addr, CHANGE_MEMBER_HANDLER, payload).await.map(|_| ())
	}

	async fn delete_replica(&self, addr: &str, partition_id: u64) -> Result<()> {
		self.call_json(addr, DELETE_REPLICA_HANDLER, serde_json::json!({"partition_id": partition_id})).await.map(|_| ())
	}
}

#[cfg(test)]
pub mod fake {
	use std::sync::{Arc, Mutex};

	use meridian_meta::MetaWriter;

	use super::*;

	/// Simulates a partition server well enough to exercise the master's
	/// dispatch-then-poll handshake: `create_partition` looks up its own
	/// assignment in `space.partitions` and writes the confirmation
	/// record the real PS would register after starting up.
	pub struct FakePsAdmin {
		pub meta: Arc<dyn MetaWriter>,
		pub created: Mutex<Vec<(String, u64)>>,
		pub updated: Mutex<Vec<(String, u64)>>,
		pub live: Mutex<Vec<String>>,
	}

	impl FakePsAdmin {
		pub fn always_live(meta: Arc<dyn MetaWriter>) -> Self {
			FakePsAdmin { meta, created: Mutex::new(vec![]), updated: Mutex::new(vec![]), live: Mutex::new(vec!["*".into()]) }
		}
	}

	impl LivenessProbe for FakePsAdmin {
		fn is_live(&self, addr: &str) -> bool {
			let live = self.live.lock().unwrap();
			live.iter().any(|a| a == "*" || a == addr)
		}
	}

	#[async_trait]
	impl PsAdmin for FakePsAdmin {
		async fn create_partition(&self, addr: &str, space: &Space, partition_id: u64) -> Result<()> {
			self.created.lock().unwrap().push((addr.to_string(), partition_id));
			if let Some(p) = space.partitions.iter().find(|p| p.id == partition_id) {
				let mut record = p.clone();
				record.leader_id = record.replicas.first().copied();
				self.meta.put_partition_record(&record)?;

				if let Some(mut space) = self.meta.get_space(record.db_id, record.space_id)? {
					if let Some(target) = space.partitions.iter_mut().find(|p| p.id == partition_id) {
						target.leader_id = record.leader_id;
						self.meta.put_space(&space)?;
					}
				}
			}
			Ok(())
		}
		async fn delete_partition(&self, _addr: &str, partition_id: u64) -> Result<()> {
			self.meta.delete_partition_record(partition_id)
		}
		async fn update_partition(&self, addr: &str, _space: &Space, partition_id: u64) -> Result<()> {
			self.updated.lock().unwrap().push((addr.to_string(), partition_id));
			Ok(())
		}
		async fn change_member(&self, _addr: &str, _cm: &ChangeMemberRequest) -> Result<()> {
			Ok(())
		}
		async fn delete_replica(&self, _addr: &str, _partition_id: u64) -> Result<()> {
			Ok(())
		}
	}
}

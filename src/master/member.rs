//! `ChangeMember`, `RecoverFailServer`, and the supplemental
//! `ChangeReplicas`/`RemoveServerMeta` admin operations. Grounded on
//! the teacher's `ChangeMember`/`RecoverFailServer`.

use meridian_meta::{ChangeMemberMethod, ChangeMemberRequest, FailServer};
use meridian_util::error::{Error, ErrorKind, Result};

use crate::service::MasterService;

impl MasterService {
	/// Adds or removes `node_id` from `partition_id`'s replica set.
	/// Idempotent in the sense the teacher is: adding an already-present
	/// node, or removing an absent one, is rejected rather than silently
	/// accepted, so a retried call never double-applies.
	pub async fn change_member(&self, cm: &ChangeMemberRequest) -> Result<()> {
		let partition = self
			.meta
			.get_partition_record(cm.partition_id)?
			.ok_or_else(|| Error::new(ErrorKind::InternalError, format!("partition {} not found", cm.partition_id)))?;

		let mut space = self
			.meta
			.get_space(partition.db_id, partition.space_id)?
			.ok_or_else(|| Error::new(ErrorKind::SpaceNotExists, format!("space {} not found", partition.space_id)))?;

		let target_partition = space
			.partitions
			.iter_mut()
			.find(|p| p.id == cm.partition_id)
			.ok_or_else(|| Error::new(ErrorKind::InternalError, format!("partition {} missing from its space", cm.partition_id)))?;

		match cm.method {
			ChangeMemberMethod::Add => {
				if target_partition.replicas.contains(&cm.node_id) {
					return Err(Error::new(
						ErrorKind::RpcParamError,
						format!("partition {} already has node {} in its replicas", cm.partition_id, cm.node_id),
					));
				}
				target_partition.replicas.push(cm.node_id);
			}
			ChangeMemberMethod::Remove => {
				let before = target_partition.replicas.len();
				target_partition.replicas.retain(|id| *id != cm.node_id);
				if target_partition.replicas.len() == before {
					return Err(Error::new(
						ErrorKind::RpcParamError,
						format!("partition {} has no node {} to remove", cm.partition_id, cm.node_id),
					));
				}
			}
		}

		let leader_id = partition
			.leader_id
			.ok_or_else(|| Error::new(ErrorKind::PartitionNoLeader, format!("partition {} has no leader", cm.partition_id)))?;
		let leader = self
			.meta
			.get_server(leader_id)?
			.ok_or_else(|| Error::new(ErrorKind::InternalError, format!("leader {} has no server record", leader_id)))?;
		if !self.probe.is_live(&leader.rpc_addr()) {
			return Err(Error::new(ErrorKind::ServiceUnavailable, format!("leader {} is unreachable", leader.rpc_addr())));
		}

		space.version += 1;
		self.meta.put_space(&space)?;

		if cm.method == ChangeMemberMethod::Add {
			if let Some(target) = self.meta.get_server(cm.node_id)? {
				self.dispatcher.create_partition(&target.rpc_addr(), &space, cm.partition_id).await?;
			}
		}

		self.dispatcher.change_member(&leader.rpc_addr(), cm).await?;

		if cm.method == ChangeMemberMethod::Remove {
			if let Some(target) = self.meta.get_server(cm.node_id)? {
				if self.probe.is_live(&target.rpc_addr()) {
					self.dispatcher.delete_replica(&target.rpc_addr(), cm.partition_id).await?;
				}
			}
		}

		Ok(())
	}

	/// Replaces a failed server's replicas with a fresh node, one
	/// `ChangeMember(ADD)` per partition the failed server used to host,
	/// then removes the `fail_server` record.
	pub async fn recover_fail_server(&self, fail_node_addr: &str, new_node_addr: &str) -> Result<()> {
		let fail_servers = self.meta.list_fail_servers()?;
		let target = fail_servers
			.into_iter()
			.find(|fs| fs.node.ip == fail_node_addr)
			.ok_or_else(|| Error::new(ErrorKind::InternalError, format!("no fail_server record for {}", fail_node_addr)))?;

		let servers = self.meta.list_servers()?;
		let new_server = servers
			.into_iter()
			.find(|s| s.ip == new_node_addr)
			.ok_or_else(|| Error::new(ErrorKind::InternalError, format!("no server record for {}", new_node_addr)))?;

		for &partition_id in &target.node.partition_ids {
			let cm = ChangeMemberRequest { partition_id, node_id: new_server.id, method: ChangeMemberMethod::Add };
			self.change_member(&cm).await?;
		}

		self.meta.delete_fail_server(target.id)
	}

	/// Grows or shrinks a space's replica count per partition, reusing
	/// `createSpace`'s placement for new replicas and, when shrinking,
	/// removing the highest node id first so the outcome is deterministic
	/// across retries.
	pub async fn change_replicas(&self, db_name: &str, space_name: &str, replica_num: u32) -> Result<()> {
		let mut space = self.query_space(db_name, space_name)?;
		if replica_num == space.replica_num {
			return Ok(());
		}

		if replica_num > space.replica_num {
			let servers = self.meta.list_servers()?;
			let db_entity = self
				.meta
				.get_db_by_id(space.db_id)?
				.ok_or_else(|| Error::new(ErrorKind::DbNotExists, "owning db vanished"))?;
			let all_spaces = self.meta.list_all_spaces()?;
			let mut load = crate::placement::filter_and_sort_servers(&db_entity, &servers, &all_spaces);

			let partition_ids: Vec<u64> = space.partitions.iter().map(|p| p.id).collect();
			for partition_id in partition_ids {
				let mut to_add = Vec::new();
				{
					let partition = space.partitions.iter().find(|p| p.id == partition_id).unwrap();
					let needed = replica_num.saturating_sub(partition.replicas.len() as u32);
					let mut scratch = partition.clone();
					scratch.replicas.clear();
					if needed > 0 {
						crate::placement::place_replicas(&servers, &mut load, needed, &mut scratch, self.probe.as_ref())?;
						to_add = scratch.replicas;
					}
				}
				for node_id in to_add {
					self.change_member(&ChangeMemberRequest { partition_id, node_id, method: ChangeMemberMethod::Add }).await?;
				}
			}
		} else {
			let partition_ids: Vec<u64> = space.partitions.iter().map(|p| p.id).collect();
			for partition_id in partition_ids {
				let partition = space.partitions.iter().find(|p| p.id == partition_id).unwrap().clone();
				let mut sorted = partition.replicas.clone();
				sorted.sort_unstable_by(|a, b| b.cmp(a));
				let excess = (partition.replicas.len() as u32).saturating_sub(replica_num);
				for node_id in sorted.into_iter().take(excess as usize) {
					self.change_member(&ChangeMemberRequest { partition_id, node_id, method: ChangeMemberMethod::Remove }).await?;
				}
			}
		}

		space = self.query_space(db_name, space_name)?;
		space.replica_num = replica_num;
		self.meta.put_space(&space)
	}

	/// Removes every replica `server_id` hosts, then deletes its
	/// `Server` record — unlike `recover_fail_server`, no replacement
	/// node is added.
	pub async fn remove_server_meta(&self, server_id: u64) -> Result<()> {
		let server = self
			.meta
			.get_server(server_id)?
			.ok_or_else(|| Error::new(ErrorKind::InternalError, format!("server {} not found", server_id)))?;

		for &partition_id in &server.partition_ids {
			if let Some(partition) = self.meta.get_partition_record(partition_id)? {
				if partition.replicas.contains(&server_id) {
					let cm = ChangeMemberRequest { partition_id, node_id: server_id, method: ChangeMemberMethod::Remove };
					self.change_member(&cm).await?;
				}
			}
		}

		self.meta.delete_server(server_id)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use meridian_db::Db;
	use meridian_meta::{MetaStore, MetaWriter, Partition, Server, Space};

	use crate::ps_admin::fake::FakePsAdmin;

	use super::*;

	fn service_with_two_servers() -> (MasterService, u64, u64) {
		let db = Db::open_memory();
		let meta = Arc::new(MetaStore::new(db.clone()));
		for (id, port) in [(1u64, 9000u16), (2u64, 9010u16)] {
			meta.upsert_server(&Server {
				id,
				ip: format!("127.0.0.{}", id),
				rpc_port: port,
				raft_heartbeat_port: port + 1,
				raft_replicate_port: port + 2,
				partition_ids: vec![],
				private: false,
				version: 1,
			})
			.unwrap();
		}
		let svc = MasterService::new(db, meta.clone(), Arc::new(FakePsAdmin::always_live(meta)), 300);
		(svc, 1, 2)
	}

	#[tokio::test]
	async fn change_member_add_rejects_existing_replica() {
		let (svc, n1, _n2) = service_with_two_servers();
		svc.meta
			.put_space(&Space {
				id: 1,
				db_id: 1,
				name: "s1".into(),
				partition_num: 1,
				replica_num: 1,
				properties: Default::default(),
				engine_config: Default::default(),
				partitions: vec![Partition { id: 10, space_id: 1, db_id: 1, slot: 0, replicas: vec![n1], leader_id: Some(n1), update_time: 0 }],
				version: 1,
				enabled: true,
			})
			.unwrap();
		svc.meta
			.put_partition_record(&Partition { id: 10, space_id: 1, db_id: 1, slot: 0, replicas: vec![n1], leader_id: Some(n1), update_time: 0 })
			.unwrap();

		let err = svc
			.change_member(&ChangeMemberRequest { partition_id: 10, node_id: n1, method: ChangeMemberMethod::Add })
			.await
			.unwrap_err();
		assert_eq!(err.kind, ErrorKind::RpcParamError);
	}

	#[tokio::test]
	async fn change_member_add_grows_the_replica_set() {
		let (svc, n1, n2) = service_with_two_servers();
		svc.meta
			.put_space(&Space {
				id: 1,
				db_id: 1,
				name: "s1".into(),
				partition_num: 1,
				replica_num: 1,
				properties: Default::default(),
				engine_config: Default::default(),
				partitions: vec![Partition { id: 10, space_id: 1, db_id: 1, slot: 0, replicas: vec![n1], leader_id: Some(n1), update_time: 0 }],
				version: 1,
				enabled: true,
			})
			.unwrap();
		svc.meta
			.put_partition_record(&Partition { id: 10, space_id: 1, db_id: 1, slot: 0, replicas: vec![n1], leader_id: Some(n1), update_time: 0 })
			.unwrap();

		svc.change_member(&ChangeMemberRequest { partition_id: 10, node_id: n2, method: ChangeMemberMethod::Add })
			.await
			.unwrap();

		let space = svc.meta.get_space(1, 1).unwrap().unwrap();
		assert_eq!(space.version, 2);
		assert_eq!(space.partitions[0].replicas, vec![n1, n2]);
	}

	#[tokio::test]
	async fn remove_server_meta_detaches_every_partition_first() {
		let (svc, n1, n2) = service_with_two_servers();
		svc.meta
			.put_space(&Space {
				id: 1,
				db_id: 1,
				name: "s1".into(),
				partition_num: 1,
				replica_num: 2,
				properties: Default::default(),
				engine_config: Default::default(),
				partitions: vec![Partition { id: 10, space_id: 1, db_id: 1, slot: 0, replicas: vec![n1, n2], leader_id: Some(n1), update_time: 0 }],
				version: 1,
				enabled: true,
			})
			.unwrap();
		svc.meta
			.put_partition_record(&Partition { id: 10, space_id: 1, db_id: 1, slot: 0, replicas: vec![n1, n2], leader_id: Some(n1), update_time: 0 })
			.unwrap();
		svc.meta
			.upsert_server(&Server {
				id: n2,
				ip: "127.0.0.2".into(),
				rpc_port: 9010,
				raft_heartbeat_port: 9011,
				raft_replicate_port: 9012,
				partition_ids: vec![10],
				private: false,
				version: 1,
			})
			.unwrap();

		svc.remove_server_meta(n2).await.unwrap();

		let space = svc.meta.get_space(1, 1).unwrap().unwrap();
		assert_eq!(space.partitions[0].replicas, vec![n1]);
		assert!(svc.meta.get_server(n2).unwrap().is_none());
	}

	#[tokio::test]
	async fn recover_fail_server_reassigns_every_hosted_partition() {
		let (svc, n1, n2) = service_with_two_servers();
		svc.meta
			.put_space(&Space {
				id: 1,
				db_id: 1,
				name: "s1".into(),
				partition_num: 1,
				replica_num: 1,
				properties: Default::default(),
				engine_config: Default::default(),
				partitions: vec![Partition { id: 10, space_id: 1, db_id: 1, slot: 0, replicas: vec![n1], leader_id: Some(n1), update_time: 0 }],
				version: 1,
				enabled: true,
			})
			.unwrap();
		svc.meta
			.put_partition_record(&Partition { id: 10, space_id: 1, db_id: 1, slot: 0, replicas: vec![n1], leader_id: Some(n1), update_time: 0 })
			.unwrap();

		svc.meta
			.put_fail_server(&FailServer {
				id: 1,
				node: Server {
					id: 1,
					ip: "127.0.0.1".into(),
					rpc_port: 9000,
					raft_heartbeat_port: 9001,
					raft_replicate_port: 9002,
					partition_ids: vec![10],
					private: false,
					version: 1,
				},
				timestamp: 0,
			})
			.unwrap();

		svc.recover_fail_server("127.0.0.1", "127.0.0.2").await.unwrap();

		let space = svc.meta.get_space(1, 1).unwrap().unwrap();
		assert_eq!(space.partitions[0].replicas, vec![n1, n2]);
		assert!(svc.meta.list_fail_servers().unwrap().is_empty());
	}
}

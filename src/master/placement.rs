//! Replica placement: pick the least-loaded live servers for each new
//! partition, honoring a db's optional ip allow-list and the
//! public/private split servers declare themselves with.

use std::collections::{HashMap, HashSet};

use meridian_meta::{Db, Partition, Server, Space};
use meridian_util::error::{Error, ErrorKind, Result};

/// Abstracts the "is this partition server reachable" probe so
/// placement can be exercised without a network in tests, and so the
/// real implementation can go through the pooled RPC client.
pub trait LivenessProbe: Send + Sync {
	fn is_live(&self, addr: &str) -> bool;
}

pub struct AlwaysLive;

impl LivenessProbe for AlwaysLive {
	fn is_live(&self, _addr: &str) -> bool {
		true
	}
}

/// Restricts candidates to servers eligible for `db` (its `ps` allow-list
/// if set, otherwise every public server) and counts each candidate's
/// existing replica load across every space in the cluster, keyed by
/// index into `servers`.
pub fn filter_and_sort_servers(db: &Db, servers: &[Server], all_spaces: &[Space]) -> HashMap<usize, usize> {
	let allow: Option<HashSet<&str>> = if db.ps.is_empty() {
		None
	} else {
		Some(db.ps.iter().map(|s| s.as_str()).collect())
	};

	let mut candidate_index: HashMap<u64, usize> = HashMap::new();
	let mut load: HashMap<usize, usize> = HashMap::new();
	for (i, s) in servers.iter().enumerate() {
		let eligible = match &allow {
			Some(set) => set.contains(s.ip.as_str()),
			None => !s.private,
		};
		if eligible {
			load.insert(i, 0);
			candidate_index.insert(s.id, i);
		}
	}

	for space in all_spaces {
		for partition in &space.partitions {
			for node_id in &partition.replicas {
				if let Some(&i) = candidate_index.get(node_id) {
					*load.get_mut(&i).unwrap() += 1;
				}
			}
		}
	}

	load
}

/// Greedily assigns `replica_num` live servers to `partition`, picking
/// the lowest-load candidates first. Mutates `load` in place so that a
/// multi-partition `createSpace` call spreads subsequent partitions
/// across the servers this one didn't pick.
pub fn place_replicas(
	servers: &[Server],
	load: &mut HashMap<usize, usize>,
	replica_num: u32,
	partition: &mut Partition,
	probe: &dyn LivenessProbe,
) -> Result<()> {
	if replica_num as usize > load.len() {
		return Err(Error::new(
			ErrorKind::MasterPsNotEnoughSelect,
			format!("need {} replicas but only {} eligible servers", replica_num, load.len()),
		));
	}

	let mut order: Vec<usize> = load.keys().copied().collect();
	order.sort_by_key(|&i| (load[&i], i));

	partition.replicas.clear();
	let mut remaining = replica_num;
	for idx in order {
		if remaining == 0 {
			break;
		}
		let server = &servers[idx];
		if !probe.is_live(&server.rpc_addr()) {
			continue;
		}
		*load.get_mut(&idx).unwrap() += 1;
		partition.replicas.push(server.id);
		remaining -= 1;
	}

	if remaining > 0 {
		return Err(Error::new(
			ErrorKind::MasterPsNotEnoughSelect,
			format!("need {} replicas but only placed {}", replica_num, replica_num - remaining),
		));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn server(id: u64, ip: &str, private: bool) -> Server {
		Server {
			id,
			ip: ip.into(),
			rpc_port: 9000,
			raft_heartbeat_port: 9001,
			raft_replicate_port: 9002,
			partition_ids: vec![],
			private,
			version: 1,
		}
	}

	#[test]
	fn private_servers_are_excluded_without_an_allow_list() {
		let db = Db { id: 1, name: "d".into(), ps: vec![] };
		let servers = vec![server(1, "10.0.0.1", false), server(2, "10.0.0.2", true)];
		let load = filter_and_sort_servers(&db, &servers, &[]);
		assert_eq!(load.len(), 1);
		assert!(load.contains_key(&0));
	}

	#[test]
	fn allow_list_overrides_the_private_flag() {
		let db = Db { id: 1, name: "d".into(), ps: vec!["10.0.0.2".into()] };
		let servers = vec![server(1, "10.0.0.1", false), server(2, "10.0.0.2", true)];
		let load = filter_and_sort_servers(&db, &servers, &[]);
		assert_eq!(load.len(), 1);
		assert!(load.contains_key(&1));
	}

	#[test]
	fn placement_spreads_across_least_loaded_servers() {
		let servers = vec![server(1, "10.0.0.1", false), server(2, "10.0.0.2", false), server(3, "10.0.0.3", false)];
		let mut load = HashMap::from([(0, 5), (1, 0), (2, 2)]);
		let mut partition = Partition { id: 1, space_id: 1, db_id: 1, slot: 0, replicas: vec![], leader_id: None, update_time: 0 };
		place_replicas(&servers, &mut load, 2, &mut partition, &AlwaysLive).unwrap();
		assert_eq!(partition.replicas, vec![2, 3]);
	}

	#[test]
	fn dead_servers_are_skipped() {
		struct NoneLive;
		impl LivenessProbe for NoneLive {
			fn is_live(&self, _addr: &str) -> bool {
				false
			}
		}
		let servers = vec![server(1, "10.0.0.1", false)];
		let mut load = HashMap::from([(0, 0)]);
		let mut partition = Partition { id: 1, space_id: 1, db_id: 1, slot: 0, replicas: vec![], leader_id: None, update_time: 0 };
		let err = place_replicas(&servers, &mut load, 1, &mut partition, &NoneLive).unwrap_err();
		assert_eq!(err.kind, ErrorKind::MasterPsNotEnoughSelect);
	}
}

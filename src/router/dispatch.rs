//! Wires the write-path grouping and search-path replica selection to
//! the actual network calls: parallel fan-out via `PsClient::execute`,
//! gathered back with `futures::future::join_all` the way the teacher's
//! block manager gathers its own quorum RPCs.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;

use meridian_meta::Space;
use meridian_rpc::PsClient;
use meridian_util::error::{Error, ErrorKind, Result};

use crate::search::{pick_replica, Hit, LoadBalance, PartitionHits};

/// Fans `query_payload` out to one replica per partition of `space`
/// under `policy`, in parallel, each leg bounded by `deadline` (the
/// request head's timeout). A leg that errors — including hitting the
/// deadline, or a leader-chase that exhausts its retries — is folded
/// into that partition's `error` field rather than failing the whole
/// request; callers merge whatever came back within the deadline.
pub async fn search_partitions(
	client: &PsClient,
	space: &Space,
	policy: LoadBalance,
	handler: &str,
	query_payload: &[u8],
	deadline: Duration,
) -> Vec<PartitionHits> {
	let legs = space.partitions.iter().map(|partition| {
		let partition_id = partition.id;
		let node = pick_replica(partition, policy);
		let payload = query_payload.to_vec();
		async move {
			let node_id = match node {
				Ok(id) => id,
				Err(e) => return PartitionHits { partition_id, hits: vec![], error: Some(e.msg.clone()) },
			};
			match tokio::time::timeout(deadline, client.execute(node_id, partition_id, handler, payload)).await {
				Err(_) => PartitionHits { partition_id, hits: vec![], error: Some("TIMEOUT".into()) },
				Ok(Ok(bytes)) => match rmp_serde::from_slice::<Vec<Hit>>(&bytes) {
					Ok(hits) => PartitionHits { partition_id, hits, error: None },
					Err(e) => PartitionHits { partition_id, hits: vec![], error: Some(e.to_string()) },
				},
				Ok(Err(e)) => PartitionHits { partition_id, hits: vec![], error: Some(e.msg.clone()) },
			}
		}
	});
	join_all(legs).await
}

/// Dispatches `groups` (as produced by [`crate::partition::group_by_partition`])
/// to each partition's current leader, in parallel, each leg bounded by
/// `deadline`, and returns every input document's result tagged with
/// its original index so the caller can restore input order.
pub async fn dispatch_write<T>(
	client: &PsClient,
	space: &Space,
	handler: &str,
	groups: HashMap<u64, Vec<(usize, String, T)>>,
	encode: impl Fn(&[(usize, String, T)]) -> Vec<u8>,
	deadline: Duration,
) -> Vec<(usize, Result<Vec<u8>>)> {
	let leaders: HashMap<u64, u64> = space.partitions.iter().filter_map(|p| p.leader_id.map(|l| (p.id, l))).collect();

	let legs = groups.into_iter().map(|(partition_id, batch)| {
		let payload = encode(&batch);
		let node_id = leaders.get(&partition_id).copied();
		let handler = handler.to_string();
		async move {
			let result = match node_id {
				Some(node_id) => match tokio::time::timeout(deadline, client.execute(node_id, partition_id, &handler, payload)).await {
					Ok(r) => r,
					Err(_) => Err(Error::new(ErrorKind::Timeout, format!("partition {} deadline exceeded", partition_id))),
				},
				None => Err(Error::new(ErrorKind::PartitionNoLeader, format!("partition {} has no leader", partition_id))),
			};
			batch.into_iter().map(move |(idx, _, _)| (idx, result.clone())).collect::<Vec<_>>()
		}
	});

	join_all(legs).await.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	use meridian_meta::{MetaReader, MetaStore, Partition};

	fn space_with_leaderless_partition() -> Space {
		Space {
			id: 1,
			db_id: 1,
			name: "docs".into(),
			partition_num: 1,
			replica_num: 1,
			properties: Default::default(),
			engine_config: Default::default(),
			partitions: vec![Partition { id: 1, space_id: 1, db_id: 1, slot: 0, replicas: vec![], leader_id: None, update_time: 0 }],
			version: 1,
			enabled: true,
		}
	}

	#[tokio::test]
	async fn dispatch_write_reports_no_leader_without_attempting_an_rpc() {
		let meta: Arc<dyn MetaReader> = Arc::new(MetaStore::new(meridian_db::Db::open_memory()));
		let client = PsClient::new(meta);
		let space = space_with_leaderless_partition();

		let mut groups: HashMap<u64, Vec<(usize, String, ())>> = HashMap::new();
		groups.insert(1, vec![(0, "doc-1".into(), ())]);

		let results = dispatch_write(&client, &space, "UpsertDocHandler", groups, |_| Vec::new(), Duration::from_millis(500)).await;
		assert_eq!(results.len(), 1);
		let (idx, result) = &results[0];
		assert_eq!(*idx, 0);
		assert_eq!(result.as_ref().unwrap_err().kind, ErrorKind::PartitionNoLeader);
	}

	#[tokio::test]
	async fn search_partitions_folds_a_missing_leader_into_the_partition_error() {
		let meta: Arc<dyn MetaReader> = Arc::new(MetaStore::new(meridian_db::Db::open_memory()));
		let client = PsClient::new(meta);
		let space = space_with_leaderless_partition();

		let results = search_partitions(&client, &space, LoadBalance::Leader, "SearchHandler", &[], Duration::from_millis(500)).await;
		assert_eq!(results.len(), 1);
		assert!(results[0].hits.is_empty());
		assert!(results[0].error.is_some());
	}
}

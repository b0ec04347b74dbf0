//! Search-path scatter-gather: replica selection policy, per-partition
//! hit collection, and the k-way merge that turns N locally-sorted
//! partition results into one globally-sorted page.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use meridian_meta::Partition;
use meridian_util::error::{Error, ErrorKind, Result};

/// Mirrors the client's replica-selection policy for a search fan-out.
/// `All` is accepted by the type but rejected by [`pick_replica`] — it's
/// reserved for admin broadcast, never a search leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBalance {
	Leader,
	Random,
	NotLeader,
	All,
}

impl Default for LoadBalance {
	fn default() -> Self {
		LoadBalance::Leader
	}
}

/// Picks the node a search leg for `partition` should target under `policy`.
pub fn pick_replica(partition: &Partition, policy: LoadBalance) -> Result<u64> {
	let no_leader = || Error::new(ErrorKind::PartitionNoLeader, format!("partition {} has no leader", partition.id));
	match policy {
		LoadBalance::Leader => partition.leader_id.ok_or_else(no_leader),
		LoadBalance::Random => partition
			.replicas
			.choose(&mut rand::thread_rng())
			.copied()
			.ok_or_else(|| Error::new(ErrorKind::RpcParamError, format!("partition {} has no replicas", partition.id))),
		LoadBalance::NotLeader => {
			let candidates: Vec<u64> = partition.replicas.iter().copied().filter(|id| Some(*id) != partition.leader_id).collect();
			candidates
				.choose(&mut rand::thread_rng())
				.copied()
				.or(partition.leader_id)
				.ok_or_else(no_leader)
		}
		LoadBalance::All => Err(Error::new(ErrorKind::RpcParamError, "ALL is not a valid search dispatch policy")),
	}
}

/// One ranked result. `sort_fields` holds any explicit `SortField[]`
/// values, compared ahead of `score` (highest-priority sort key first);
/// `score` breaks ties (and is the sole key for plain vector search).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
	pub doc_id: String,
	pub score: f64,
	#[serde(default)]
	pub sort_fields: Vec<f64>,
}

/// One partition's contribution to a fan-out. `hits` must already be
/// sorted best-first; `error` records a failed or timed-out leg so the
/// merge can proceed with partial results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PartitionHits {
	pub partition_id: u64,
	pub hits: Vec<Hit>,
	pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct HeapKey(Vec<f64>, f64);

impl Eq for HeapKey {}

impl PartialOrd for HeapKey {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for HeapKey {
	fn cmp(&self, other: &Self) -> Ordering {
		for (a, b) in self.0.iter().zip(other.0.iter()) {
			match a.total_cmp(b) {
				Ordering::Equal => continue,
				ord => return ord,
			}
		}
		self.1.total_cmp(&other.1)
	}
}

impl HeapKey {
	fn of(hit: &Hit) -> Self {
		HeapKey(hit.sort_fields.clone(), hit.score)
	}
}

struct HeapEntry {
	key: HeapKey,
	partition: usize,
	index: usize,
}

impl PartialEq for HeapEntry {
	fn eq(&self, other: &Self) -> bool {
		self.key == other.key
	}
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for HeapEntry {
	fn cmp(&self, other: &Self) -> Ordering {
		self.key.cmp(&other.key)
	}
}

/// K-way merges `partitions`' already-sorted hit lists with a heap that
/// always yields the next globally-best hit, then applies the global
/// `from` skip and `size` truncation.
pub fn merge_hits(partitions: &[PartitionHits], from: usize, size: usize) -> Vec<Hit> {
	let mut heap = BinaryHeap::new();
	for (p_idx, part) in partitions.iter().enumerate() {
		if let Some(hit) = part.hits.first() {
			heap.push(HeapEntry { key: HeapKey::of(hit), partition: p_idx, index: 0 });
		}
	}

	let want = from + size;
	let mut merged = Vec::with_capacity(want.min(1024));
	while let Some(HeapEntry { partition, index, .. }) = heap.pop() {
		merged.push(partitions[partition].hits[index].clone());
		if merged.len() >= want {
			break;
		}
		if let Some(next) = partitions[partition].hits.get(index + 1) {
			heap.push(HeapEntry { key: HeapKey::of(next), partition, index: index + 1 });
		}
	}

	merged.into_iter().skip(from).take(size).collect()
}

/// `MSearch` merges each sub-query independently, then the caller
/// concatenates the per-query pages in input order — no cross-query
/// interleaving.
pub fn merge_msearch(per_query: &[Vec<PartitionHits>], from: usize, size: usize) -> Vec<Vec<Hit>> {
	per_query.iter().map(|parts| merge_hits(parts, from, size)).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hits(scores: &[f64]) -> Vec<Hit> {
		scores.iter().map(|&s| Hit { doc_id: format!("d{}", s), score: s, sort_fields: vec![] }).collect()
	}

	#[test]
	fn merge_produces_a_globally_sorted_page() {
		let parts = vec![
			PartitionHits { partition_id: 1, hits: hits(&[9.0, 5.0, 1.0]), error: None },
			PartitionHits { partition_id: 2, hits: hits(&[8.0, 4.0]), error: None },
			PartitionHits { partition_id: 3, hits: hits(&[7.0, 6.0]), error: None },
		];
		let merged = merge_hits(&parts, 0, 4);
		let scores: Vec<f64> = merged.iter().map(|h| h.score).collect();
		assert_eq!(scores, vec![9.0, 8.0, 7.0, 6.0]);
	}

	#[test]
	fn from_skips_the_leading_page() {
		let parts = vec![PartitionHits { partition_id: 1, hits: hits(&[9.0, 5.0, 1.0]), error: None }];
		let merged = merge_hits(&parts, 1, 1);
		assert_eq!(merged[0].score, 5.0);
	}

	#[test]
	fn a_failed_leg_does_not_block_the_merge_of_the_rest() {
		let parts = vec![
			PartitionHits { partition_id: 1, hits: vec![], error: Some("timeout".into()) },
			PartitionHits { partition_id: 2, hits: hits(&[3.0]), error: None },
		];
		let merged = merge_hits(&parts, 0, 10);
		assert_eq!(merged.len(), 1);
	}

	#[test]
	fn sort_fields_take_priority_over_score() {
		let a = Hit { doc_id: "a".into(), score: 100.0, sort_fields: vec![1.0] };
		let b = Hit { doc_id: "b".into(), score: 1.0, sort_fields: vec![2.0] };
		let parts = vec![PartitionHits { partition_id: 1, hits: vec![a, b], error: None }];
		// Partition hits are assumed pre-sorted, so feed them already ordered by sort_fields descending.
		let reordered = vec![PartitionHits {
			partition_id: 1,
			hits: vec![parts[0].hits[1].clone(), parts[0].hits[0].clone()],
			error: None,
		}];
		let merged = merge_hits(&reordered, 0, 2);
		assert_eq!(merged[0].doc_id, "b");
	}

	#[test]
	fn leader_policy_requires_a_known_leader() {
		let partition = Partition { id: 1, space_id: 1, db_id: 1, slot: 0, replicas: vec![1, 2], leader_id: None, update_time: 0 };
		let err = pick_replica(&partition, LoadBalance::Leader).unwrap_err();
		assert_eq!(err.kind, ErrorKind::PartitionNoLeader);
	}

	#[test]
	fn not_leader_policy_falls_back_to_leader_when_alone() {
		let partition = Partition { id: 1, space_id: 1, db_id: 1, slot: 0, replicas: vec![1], leader_id: Some(1), update_time: 0 };
		assert_eq!(pick_replica(&partition, LoadBalance::NotLeader).unwrap(), 1);
	}

	#[test]
	fn all_policy_is_rejected_for_search() {
		let partition = Partition { id: 1, space_id: 1, db_id: 1, slot: 0, replicas: vec![1], leader_id: Some(1), update_time: 0 };
		let err = pick_replica(&partition, LoadBalance::All).unwrap_err();
		assert_eq!(err.kind, ErrorKind::RpcParamError);
	}
}

//! Write-path partition resolution: hashing a document's primary key to
//! the partition that owns it, and grouping a batch of documents by
//! target partition so each group can be sent to its leader in one RPC.

use std::collections::HashMap;

use meridian_meta::{Partition, Space};
use meridian_rpc::hash::{key_to_slot, locate_partition};
use meridian_util::error::{Error, ErrorKind, Result};

/// Returns the partition owning `key`. Assumes `space.partitions` is
/// sorted ascending by `slot`, which holds for every space the master
/// ever produces (partitions are created in slot order and never
/// reordered in place).
pub fn partition_for_key<'a>(space: &'a Space, key: &str) -> Result<&'a Partition> {
	if space.partitions.is_empty() {
		return Err(Error::new(ErrorKind::SpaceNotExists, "space has no partitions"));
	}
	let slots: Vec<u32> = space.partitions.iter().map(|p| p.slot).collect();
	let slot = key_to_slot(key);
	let idx = locate_partition(&slots, slot);
	Ok(&space.partitions[idx])
}

/// Buckets `(key, doc)` pairs by target partition id. Each bucket keeps
/// the input index of every document so a caller can scatter the
/// batches, gather per-partition replies, and reassemble them back into
/// the caller's original order.
pub fn group_by_partition<T>(space: &Space, docs: Vec<(String, T)>) -> Result<HashMap<u64, Vec<(usize, String, T)>>> {
	let mut groups: HashMap<u64, Vec<(usize, String, T)>> = HashMap::new();
	for (input_index, (key, doc)) in docs.into_iter().enumerate() {
		let partition = partition_for_key(space, &key)?;
		groups.entry(partition.id).or_default().push((input_index, key, doc));
	}
	Ok(groups)
}

//! Partition-key hashing and slot lookup, shared by the router's
//! dispatch path and anything else that needs to answer "which
//! partition owns this key" without a round trip to the master.

use xxhash_rust::xxh3::xxh3_64;

/// Hashes a primary key string down to the u32 slot space partitions are
/// assigned from. Truncating a 64-bit hash keeps the distribution
/// uniform over `[0, 2^32)` without pulling in a second hash function.
pub fn key_to_slot(key: &str) -> u32 {
	(xxh3_64(key.as_bytes()) & 0xFFFF_FFFF) as u32
}

/// Given the ascending `slot` boundaries of a space's partitions (as
/// produced by `Partition::slot_for`), returns the index of the
/// partition that owns `slot`: the last boundary not greater than it.
pub fn locate_partition(sorted_slots: &[u32], slot: u32) -> usize {
	match sorted_slots.binary_search(&slot) {
		Ok(i) => i,
		Err(0) => 0,
		Err(i) => i - 1,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn locate_partition_finds_owning_range() {
		let slots = vec![0u32, 1000, 2000, 3000];
		assert_eq!(locate_partition(&slots, 0), 0);
		assert_eq!(locate_partition(&slots, 999), 0);
		assert_eq!(locate_partition(&slots, 1000), 1);
		assert_eq!(locate_partition(&slots, 2999), 2);
		assert_eq!(locate_partition(&slots, u32::MAX), 3);
	}

	#[test]
	fn key_to_slot_is_deterministic() {
		assert_eq!(key_to_slot("doc-1"), key_to_slot("doc-1"));
		assert_ne!(key_to_slot("doc-1"), key_to_slot("doc-2"));
	}
}

//! The capability set a local partition needs from the vector engine
//! that actually owns document storage and similarity search. The
//! engine's indexing and query algorithms are out of scope here; this
//! trait is the seam a real binding would implement, and
//! [`MemoryEngine`] is an in-memory stand-in that lets the admin and
//! partition-table logic be exercised without one.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use meridian_util::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexStatus {
	Unindexed,
	Indexing,
	Indexed,
}

/// The reply shape for `PartitionInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionInfo {
	pub partition_id: u64,
	pub doc_num: u64,
	pub size: u64,
	pub path: String,
	pub raft_status: String,
	pub index_status: IndexStatus,
	pub unreachable: bool,
}

/// One scored result, msgpack-encoded in the same field order as the
/// router's `Hit` type so `search`'s reply decodes directly into it on
/// the other end without either side depending on the other's crate.
#[derive(Debug, Clone, Serialize)]
struct ScoredDoc {
	doc_id: String,
	score: f64,
	sort_fields: Vec<f64>,
}

/// Storage and search surface a partition's engine handle must expose.
/// Implementations own their own locking; callers may hold one
/// [`Reader`] per partition indefinitely.
pub trait Reader: Send + Sync {
	fn get_doc(&self, id: &str) -> Result<Option<Vec<u8>>>;
	fn put_doc(&self, id: &str, doc: Vec<u8>) -> Result<()>;
	fn delete_doc(&self, id: &str) -> Result<bool>;
	/// Opaque query bytes in, opaque hit-list bytes out — the encoding
	/// is whatever the engine and its callers agree on; this trait does
	/// not interpret either side.
	fn search(&self, query: &[u8], top_k: usize) -> Result<Vec<u8>>;
	fn doc_count(&self) -> Result<u64>;
	/// Approximate on-disk footprint in bytes, for `PartitionInfo.size`.
	fn capacity(&self) -> Result<u64>;
	fn index_status(&self) -> IndexStatus;
}

/// In-memory `Reader` keyed by document id. `search` returns the first
/// `top_k` ids in key order rather than doing anything similarity-based
/// — enough to exercise the admin surface and partition bookkeeping
/// without a real index.
#[derive(Default)]
pub struct MemoryEngine {
	docs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryEngine {
	pub fn new() -> Self {
		MemoryEngine::default()
	}
}

impl Reader for MemoryEngine {
	fn get_doc(&self, id: &str) -> Result<Option<Vec<u8>>> {
		Ok(self.docs.read().unwrap().get(id).cloned())
	}

	fn put_doc(&self, id: &str, doc: Vec<u8>) -> Result<()> {
		self.docs.write().unwrap().insert(id.to_string(), doc);
		Ok(())
	}

	fn delete_doc(&self, id: &str) -> Result<bool> {
		Ok(self.docs.write().unwrap().remove(id).is_some())
	}

	/// No actual similarity ranking — the stand-in returns the first
	/// `top_k` ids in key order, each a zero-score hit, so callers can
	/// exercise the reply shape without a real index behind it.
	fn search(&self, _query: &[u8], top_k: usize) -> Result<Vec<u8>> {
		let hits: Vec<ScoredDoc> = self
			.docs
			.read()
			.unwrap()
			.keys()
			.take(top_k)
			.map(|doc_id| ScoredDoc { doc_id: doc_id.clone(), score: 0.0, sort_fields: vec![] })
			.collect();
		rmp_serde::to_vec(&hits).map_err(Error::from)
	}

	fn doc_count(&self) -> Result<u64> {
		Ok(self.docs.read().unwrap().len() as u64)
	}

	fn capacity(&self) -> Result<u64> {
		let docs = self.docs.read().unwrap();
		Ok(docs.values().map(|d| d.len() as u64).sum())
	}

	fn index_status(&self) -> IndexStatus {
		if self.docs.read().unwrap().is_empty() {
			IndexStatus::Unindexed
		} else {
			IndexStatus::Indexed
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn put_then_get_round_trips() {
		let engine = MemoryEngine::new();
		engine.put_doc("a", vec![1, 2, 3]).unwrap();
		assert_eq!(engine.get_doc("a").unwrap(), Some(vec![1, 2, 3]));
		assert_eq!(engine.get_doc("missing").unwrap(), None);
	}

	#[test]
	fn delete_reports_whether_anything_was_removed() {
		let engine = MemoryEngine::new();
		engine.put_doc("a", vec![1]).unwrap();
		assert!(engine.delete_doc("a").unwrap());
		assert!(!engine.delete_doc("a").unwrap());
	}

	#[test]
	fn index_status_tracks_emptiness() {
		let engine = MemoryEngine::new();
		assert_eq!(engine.index_status(), IndexStatus::Unindexed);
		engine.put_doc("a", vec![1]).unwrap();
		assert_eq!(engine.index_status(), IndexStatus::Indexed);
	}
}

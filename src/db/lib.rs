//! Abstraction over the embedded ordered key/value store that backs all
//! cluster metadata: `Get/Put/Delete/PrefixScan/STM/Lease/Lock`, with an
//! in-memory backend for tests and a `sled`-backed engine for production.
//!
//! Every operation is scoped to a `tree` name (a logical namespace), which
//! lets the metadata layer keep `db/*`, `space/*`, `server/*`,
//! `partition/*`, `fail_server/*`, `lock/*` and `sequence/*` separate
//! without key-prefix collisions.

mod error;
mod lock;
mod memory;
mod sequence;
#[cfg(feature = "sled")]
mod sled_backend;

pub use error::{Error, Result};
pub use lock::{Lock, LockGuard};
pub use sequence::IdAllocator;

use std::collections::BTreeMap;

/// A read/write handle into one transaction. Implementations guarantee
/// that either every `put`/`delete` issued through the handle is applied,
/// or (if the closure passed to [`Db::transaction`] returns `Err`) none
/// of them are: the STM guarantee the spec requires for multi-key
/// metadata mutation.
pub trait TxHandle {
	fn get(&mut self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;
	fn put(&mut self, tree: &str, key: &[u8], value: &[u8]) -> Result<()>;
	fn delete(&mut self, tree: &str, key: &[u8]) -> Result<()>;
}

enum Backend {
	Memory(memory::MemoryEngine),
	#[cfg(feature = "sled")]
	Sled(sled_backend::SledEngine),
}

/// A handle to the metadata store. Cheap to clone (an `Arc` internally for
/// the `sled` backend, a `Arc<Mutex<..>>` for the in-memory one); created
/// once at process start and passed by reference to every request
/// handler, per the "global connection cache... never module-level mutable
/// state" design note.
#[derive(Clone)]
pub struct Db(std::sync::Arc<Backend>);

impl Db {
	pub fn open_memory() -> Self {
		Db(std::sync::Arc::new(Backend::Memory(memory::MemoryEngine::new())))
	}

	#[cfg(feature = "sled")]
	pub fn open_sled(path: impl AsRef<std::path::Path>) -> Result<Self> {
		Ok(Db(std::sync::Arc::new(Backend::Sled(sled_backend::SledEngine::open(path)?))))
	}

	pub fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
		match &*self.0 {
			Backend::Memory(m) => m.get(tree, key),
			#[cfg(feature = "sled")]
			Backend::Sled(s) => s.get(tree, key),
		}
	}

	pub fn put(&self, tree: &str, key: &[u8], value: &[u8]) -> Result<()> {
		match &*self.0 {
			Backend::Memory(m) => m.put(tree, key, value),
			#[cfg(feature = "sled")]
			Backend::Sled(s) => s.put(tree, key, value),
		}
	}

	pub fn delete(&self, tree: &str, key: &[u8]) -> Result<()> {
		match &*self.0 {
			Backend::Memory(m) => m.delete(tree, key),
			#[cfg(feature = "sled")]
			Backend::Sled(s) => s.delete(tree, key),
		}
	}

	/// Returns every `(key, value)` pair in `tree` whose key starts with
	/// `prefix`, in ascending key order.
	pub fn prefix_scan(&self, tree: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		match &*self.0 {
			Backend::Memory(m) => m.prefix_scan(tree, prefix),
			#[cfg(feature = "sled")]
			Backend::Sled(s) => s.prefix_scan(tree, prefix),
		}
	}

	/// Runs `f` against a transaction handle spanning (potentially)
	/// multiple trees and keys. If `f` returns `Err`, none of the writes
	/// issued through the handle take effect.
	pub fn transaction<T>(&self, f: impl FnOnce(&mut dyn TxHandle) -> Result<T>) -> Result<T> {
		match &*self.0 {
			Backend::Memory(m) => m.transaction(f),
			#[cfg(feature = "sled")]
			Backend::Sled(s) => s.transaction(f),
		}
	}
}

pub(crate) fn tree_key(tree: &str, key: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(tree.len() + 1 + key.len());
	out.extend_from_slice(tree.as_bytes());
	out.push(0);
	out.extend_from_slice(key);
	out
}

pub(crate) type TreeMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn memory_roundtrip() {
		let db = Db::open_memory();
		db.put("space", b"1", b"hello").unwrap();
		assert_eq!(db.get("space", b"1").unwrap(), Some(b"hello".to_vec()));
		db.delete("space", b"1").unwrap();
		assert_eq!(db.get("space", b"1").unwrap(), None);
	}

	#[test]
	fn transaction_rolls_back_on_error() {
		let db = Db::open_memory();
		db.put("db", b"name/d1", b"1").unwrap();
		let res: Result<()> = db.transaction(|tx| {
			tx.put("db", b"name/d2", b"2")?;
			Err(Error::TransactionAborted("duplicate".into()))
		});
		assert!(res.is_err());
		assert_eq!(db.get("db", b"name/d2").unwrap(), None);
		assert_eq!(db.get("db", b"name/d1").unwrap(), Some(b"1".to_vec()));
	}

	#[test]
	fn transaction_commits_all_writes_on_success() {
		let db = Db::open_memory();
		db.transaction(|tx| {
			tx.put("db", b"id/1", b"d1")?;
			tx.put("db", b"name/d1", b"1")?;
			Ok(())
		})
		.unwrap();
		assert_eq!(db.get("db", b"id/1").unwrap(), Some(b"d1".to_vec()));
		assert_eq!(db.get("db", b"name/d1").unwrap(), Some(b"1".to_vec()));
	}

	#[test]
	fn prefix_scan_is_ordered_and_scoped_to_prefix() {
		let db = Db::open_memory();
		db.put("space", b"1/a", b"x").unwrap();
		db.put("space", b"1/b", b"y").unwrap();
		db.put("space", b"2/a", b"z").unwrap();
		let got = db.prefix_scan("space", b"1/").unwrap();
		assert_eq!(got.len(), 2);
		assert_eq!(got[0].0, b"1/a");
		assert_eq!(got[1].0, b"1/b");
	}
}

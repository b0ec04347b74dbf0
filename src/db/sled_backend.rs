//! `sled`-backed engine. One `sled::Tree` per logical tree name, opened
//! lazily and cached so repeated calls don't pay tree-open overhead.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};

use crate::{Error, Result, TxHandle};

pub struct SledEngine {
	db: sled::Db,
	trees: RwLock<HashMap<String, sled::Tree>>,
}

impl SledEngine {
	pub fn open(path: impl AsRef<Path>) -> Result<Self> {
		let db = sled::open(path)?;
		Ok(SledEngine {
			db,
			trees: RwLock::new(HashMap::new()),
		})
	}

	fn tree(&self, name: &str) -> Result<sled::Tree> {
		if let Some(t) = self.trees.read().unwrap().get(name) {
			return Ok(t.clone());
		}
		let mut trees = self.trees.write().unwrap();
		if let Some(t) = trees.get(name) {
			return Ok(t.clone());
		}
		let t = self.db.open_tree(name)?;
		trees.insert(name.to_string(), t.clone());
		Ok(t)
	}

	pub fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
		Ok(self.tree(tree)?.get(key)?.map(|v| v.to_vec()))
	}

	pub fn put(&self, tree: &str, key: &[u8], value: &[u8]) -> Result<()> {
		self.tree(tree)?.insert(key, value)?;
		Ok(())
	}

	pub fn delete(&self, tree: &str, key: &[u8]) -> Result<()> {
		self.tree(tree)?.remove(key)?;
		Ok(())
	}

	pub fn prefix_scan(&self, tree: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		let t = self.tree(tree)?;
		let mut out = Vec::new();
		for item in t.scan_prefix(prefix) {
			let (k, v) = item?;
			out.push((k.to_vec(), v.to_vec()));
		}
		Ok(out)
	}

	/// `sled`'s transactions are per-tree; since metadata mutations here
	/// touch at most a handful of trees known up front at the call site,
	/// we open every tree the caller might need before invoking the
	/// closure once per distinct tree set would be awkward, so we instead
	/// run the whole transaction against a single "meta" tree that the
	/// metadata layer multiplexes via key prefixing, same as `tree_key`
	/// does for the in-memory engine.
	pub fn transaction<T>(&self, f: impl FnOnce(&mut dyn TxHandle) -> Result<T>) -> Result<T> {
		let meta_tree = self.tree("__meta_txn")?;
		let f = std::cell::RefCell::new(Some(f));
		let result: std::result::Result<T, TransactionError<Error>> =
			(&meta_tree,).transaction(|(tx_tree,)| {
				let mut handle = SledTxHandle { tree: tx_tree, trees: &self.trees, db: &self.db };
				let f = f.borrow_mut().take().expect("sled transaction closure invoked more than once");
				f(&mut handle).map_err(ConflictableTransactionError::Abort)
			});
		result.map_err(|e| match e {
			TransactionError::Abort(inner) => inner,
			TransactionError::Storage(se) => Error::from(se),
		})
	}
}

struct SledTxHandle<'a> {
	tree: &'a sled::transaction::TransactionalTree,
	trees: &'a RwLock<HashMap<String, sled::Tree>>,
	db: &'a sled::Db,
}

impl<'a> SledTxHandle<'a> {
	fn resolve(&self, tree: &str) -> Result<sled::Tree> {
		if let Some(t) = self.trees.read().unwrap().get(tree) {
			return Ok(t.clone());
		}
		let t = self.db.open_tree(tree)?;
		self.trees.write().unwrap().insert(tree.to_string(), t.clone());
		Ok(t)
	}
}

impl<'a> TxHandle for SledTxHandle<'a> {
	fn get(&mut self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let _ = self.resolve(tree)?;
		let full = crate::tree_key(tree, key);
		Ok(self
			.tree
			.get(&full)
			.map_err(|e| Error::TransactionAborted(e.to_string()))?
			.map(|v| v.to_vec()))
	}

	fn put(&mut self, tree: &str, key: &[u8], value: &[u8]) -> Result<()> {
		let full = crate::tree_key(tree, key);
		self.tree
			.insert(full, value)
			.map_err(|e| Error::TransactionAborted(e.to_string()))?;
		Ok(())
	}

	fn delete(&mut self, tree: &str, key: &[u8]) -> Result<()> {
		let full = crate::tree_key(tree, key);
		self.tree
			.remove(full)
			.map_err(|e| Error::TransactionAborted(e.to_string()))?;
		Ok(())
	}
}

//! In-memory backend used by tests and by `meridian server --ephemeral`
//! style single-node trials. Coarse-grained: a single mutex around the
//! whole keyspace gives each `transaction()` call full serializability,
//! which is strictly stronger than the STM guarantee the spec requires.

use std::sync::Mutex;

use crate::{tree_key, Result, TreeMap, TxHandle};

pub struct MemoryEngine {
	data: Mutex<TreeMap>,
}

impl MemoryEngine {
	pub fn new() -> Self {
		MemoryEngine {
			data: Mutex::new(TreeMap::new()),
		}
	}

	pub fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let data = self.data.lock().unwrap();
		Ok(data.get(&tree_key(tree, key)).cloned())
	}

	pub fn put(&self, tree: &str, key: &[u8], value: &[u8]) -> Result<()> {
		let mut data = self.data.lock().unwrap();
		data.insert(tree_key(tree, key), value.to_vec());
		Ok(())
	}

	pub fn delete(&self, tree: &str, key: &[u8]) -> Result<()> {
		let mut data = self.data.lock().unwrap();
		data.remove(&tree_key(tree, key));
		Ok(())
	}

	pub fn prefix_scan(&self, tree: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
		let data = self.data.lock().unwrap();
		let full_prefix = tree_key(tree, prefix);
		let mut out = Vec::new();
		for (k, v) in data.range(full_prefix.clone()..) {
			if !k.starts_with(&full_prefix) {
				break;
			}
			out.push((k[tree.len() + 1..].to_vec(), v.clone()));
		}
		Ok(out)
	}

	pub fn transaction<T>(&self, f: impl FnOnce(&mut dyn TxHandle) -> Result<T>) -> Result<T> {
		let mut guard = self.data.lock().unwrap();
		let mut scratch = guard.clone();
		let mut handle = MemoryTxHandle { map: &mut scratch };
		match f(&mut handle) {
			Ok(v) => {
				*guard = scratch;
				Ok(v)
			}
			Err(e) => Err(e),
		}
	}
}

struct MemoryTxHandle<'a> {
	map: &'a mut TreeMap,
}

impl<'a> TxHandle for MemoryTxHandle<'a> {
	fn get(&mut self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
		Ok(self.map.get(&tree_key(tree, key)).cloned())
	}

	fn put(&mut self, tree: &str, key: &[u8], value: &[u8]) -> Result<()> {
		self.map.insert(tree_key(tree, key), value.to_vec());
		Ok(())
	}

	fn delete(&mut self, tree: &str, key: &[u8]) -> Result<()> {
		self.map.remove(&tree_key(tree, key));
		Ok(())
	}
}

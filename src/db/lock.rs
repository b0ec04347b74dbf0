//! Leased locks (`lock/cluster`, `lock/space`, `lock/space/{db}/{space}`),
//! built on top of the store's own `transaction`/`Get`/`Put` so they share
//! its atomicity guarantees instead of needing a separate coordination
//! channel.

use serde::{Deserialize, Serialize};

use crate::{Db, Error, Result};

const LOCK_TREE: &str = "lock";

#[derive(Serialize, Deserialize)]
struct LockRecord {
	owner: String,
	expires_at_msec: u64,
}

/// A held lock. Dropping it without calling [`LockGuard::release`] leaves
/// the record in place until its lease expires — matching "leased so
/// crash-holders auto-release".
pub struct LockGuard {
	db: Db,
	key: String,
	owner: String,
	released: bool,
}

impl std::fmt::Debug for LockGuard {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("LockGuard")
			.field("key", &self.key)
			.field("owner", &self.owner)
			.field("released", &self.released)
			.finish()
	}
}

impl LockGuard {
	pub fn release(mut self) -> Result<()> {
		self.do_release()
	}

	fn do_release(&mut self) -> Result<()> {
		if self.released {
			return Ok(());
		}
		self.db.transaction(|tx| {
			if let Some(raw) = tx.get(LOCK_TREE, self.key.as_bytes())? {
				let rec: LockRecord = serde_json::from_slice(&raw)
					.map_err(|e| Error::TransactionAborted(e.to_string()))?;
				if rec.owner == self.owner {
					tx.delete(LOCK_TREE, self.key.as_bytes())?;
				}
			}
			Ok(())
		})?;
		self.released = true;
		Ok(())
	}
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		let _ = self.do_release();
	}
}

pub struct Lock;

impl Lock {
	/// Acquires `key` for `owner` with a lease of `ttl_secs`. Fails with
	/// [`Error::LockHeld`] if another, still-live owner holds it.
	pub fn acquire(db: &Db, key: &str, owner: &str, ttl_secs: u64) -> Result<LockGuard> {
		let now = meridian_now_msec();
		let key_owned = key.to_string();
		let owner_owned = owner.to_string();
		db.transaction(|tx| {
			if let Some(raw) = tx.get(LOCK_TREE, key_owned.as_bytes())? {
				let rec: LockRecord = serde_json::from_slice(&raw)
					.map_err(|e| Error::TransactionAborted(e.to_string()))?;
				if rec.owner != owner_owned && rec.expires_at_msec > now {
					return Err(Error::LockHeld(key_owned.clone()));
				}
			}
			let rec = LockRecord {
				owner: owner_owned.clone(),
				expires_at_msec: now + ttl_secs * 1000,
			};
			let raw = serde_json::to_vec(&rec).map_err(|e| Error::TransactionAborted(e.to_string()))?;
			tx.put(LOCK_TREE, key_owned.as_bytes(), &raw)?;
			Ok(())
		})?;
		Ok(LockGuard {
			db: db.clone(),
			key: key.to_string(),
			owner: owner.to_string(),
			released: false,
		})
	}

	/// Deletes every key in `lock/*`, returning the keys removed. Backs
	/// the admin `clean_lock` route.
	pub fn clean_all(db: &Db) -> Result<Vec<String>> {
		let entries = db.prefix_scan(LOCK_TREE, b"")?;
		let mut removed = Vec::new();
		for (k, _) in entries {
			db.delete(LOCK_TREE, &k)?;
			removed.push(String::from_utf8_lossy(&k).into_owned());
		}
		Ok(removed)
	}
}

fn meridian_now_msec() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.expect("system clock before 1970")
		.as_millis() as u64
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn second_owner_is_rejected_while_lease_live() {
		let db = Db::open_memory();
		let _guard = Lock::acquire(&db, "lock/space", "master-a", 300).unwrap();
		let err = Lock::acquire(&db, "lock/space", "master-b", 300).unwrap_err();
		assert!(matches!(err, Error::LockHeld(_)));
	}

	#[test]
	fn same_owner_can_reacquire() {
		let db = Db::open_memory();
		let _g1 = Lock::acquire(&db, "lock/space", "master-a", 300).unwrap();
		let _g2 = Lock::acquire(&db, "lock/space", "master-a", 300).unwrap();
	}

	#[test]
	fn release_allows_new_owner() {
		let db = Db::open_memory();
		let guard = Lock::acquire(&db, "lock/space", "master-a", 300).unwrap();
		guard.release().unwrap();
		let _guard2 = Lock::acquire(&db, "lock/space", "master-b", 300).unwrap();
	}

	#[test]
	fn clean_all_removes_every_lock_key() {
		let db = Db::open_memory();
		let _g1 = Lock::acquire(&db, "lock/cluster", "x", 300).unwrap();
		let _g2 = Lock::acquire(&db, "lock/space", "x", 300).unwrap();
		let removed = Lock::clean_all(&db).unwrap();
		assert_eq!(removed.len(), 2);
		assert_eq!(db.prefix_scan("lock", b"").unwrap().len(), 0);
	}
}

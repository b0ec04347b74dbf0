//! The `RouterRequest` builder: the pipeline every client call runs
//! through before dispatch — attach a head (deadline, target db/space),
//! then resolve the target `Space` from the cache.

use std::time::Duration;

use meridian_meta::Space;
use meridian_util::error::Result;

use crate::cache::SpaceCache;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const MIN_TIMEOUT_MS: u64 = 1;

/// Carried on every client call; mirrors the head every RPC reply echoes
/// back so latency and error reporting stay attached to the request
/// that caused them.
#[derive(Debug, Clone)]
pub struct RequestHead {
	pub db_name: String,
	pub space_name: String,
	pub timeout_ms: u64,
}

impl RequestHead {
	/// Builds a head with `timeout_ms` clamped to `[1, DEFAULT_TIMEOUT_MS]`
	/// — a caller cannot ask for a longer deadline than the router's
	/// default, only a shorter one.
	pub fn new(db_name: impl Into<String>, space_name: impl Into<String>, timeout_ms: Option<u64>) -> Self {
		let timeout_ms = timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS).clamp(MIN_TIMEOUT_MS, DEFAULT_TIMEOUT_MS);
		RequestHead { db_name: db_name.into(), space_name: space_name.into(), timeout_ms }
	}

	pub fn deadline(&self) -> Duration {
		Duration::from_millis(self.timeout_ms)
	}
}

/// Builds up the context a dispatch needs: `SetHead` attaches the
/// target db/space and deadline, `SetSpace` resolves the actual `Space`
/// metadata from the cache. Both steps are mandatory before a request
/// can be routed to partitions.
pub struct RouterRequest {
	head: RequestHead,
	space: Option<Space>,
}

impl RouterRequest {
	pub fn set_head(db_name: impl Into<String>, space_name: impl Into<String>, timeout_ms: Option<u64>) -> Self {
		RouterRequest { head: RequestHead::new(db_name, space_name, timeout_ms), space: None }
	}

	pub fn set_space(mut self, cache: &SpaceCache) -> Result<Self> {
		let space = cache.get(&self.head.db_name, &self.head.space_name)?;
		self.space = Some(space);
		Ok(self)
	}

	pub fn head(&self) -> &RequestHead {
		&self.head
	}

	pub fn space(&self) -> &Space {
		self.space.as_ref().expect("set_space must run before a request is dispatched")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn timeout_is_clamped_to_the_default_ceiling() {
		let head = RequestHead::new("db", "space", Some(999_999));
		assert_eq!(head.timeout_ms, DEFAULT_TIMEOUT_MS);
	}

	#[test]
	fn timeout_floor_is_one_millisecond() {
		let head = RequestHead::new("db", "space", Some(0));
		assert_eq!(head.timeout_ms, 1);
	}

	#[test]
	fn missing_timeout_uses_the_default() {
		let head = RequestHead::new("db", "space", None);
		assert_eq!(head.timeout_ms, DEFAULT_TIMEOUT_MS);
	}
}

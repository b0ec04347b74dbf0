//! Pooled, leader-chasing RPC client.
//!
//! Two layers, mirroring the client this is grounded on: a cached
//! per-node entry (`ConnectionPool`) that remembers a node's resolved
//! address so the hot path doesn't re-read the metadata store on every
//! call, and a retry loop (`Execute`) layered on top that treats
//! `PARTITION_NO_LEADER`/`PARTITION_NOT_LEADER` as signals to keep
//! chasing the real leader instead of failing the caller's request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use hyper::client::HttpConnector;
use hyper::{Body, Client as HyperClient, Method, Request};

use meridian_meta::{MetaReader, Replica};
use meridian_util::error::{Error, ErrorKind, Result};
use meridian_util::time::now_msec;

use crate::envelope::PartitionData;

const ADAPT_RETRY: u32 = 3;
const BASE_SLEEP: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct CachedNode {
	addr: String,
	last_use_msec: AtomicU64,
}

impl CachedNode {
	fn touch(&self) {
		self.last_use_msec.store(now_msec(), Ordering::Relaxed);
	}
}

/// Caches node_id -> rpc address. Evicted entries simply get re-resolved
/// from the metadata store on next use; nothing is lost by sweeping.
pub struct ConnectionPool {
	meta: Arc<dyn MetaReader>,
	nodes: RwLock<HashMap<u64, Arc<CachedNode>>>,
}

impl ConnectionPool {
	pub fn new(meta: Arc<dyn MetaReader>) -> Self {
		ConnectionPool { meta, nodes: RwLock::new(HashMap::new()) }
	}

	fn resolve_addr(&self, node_id: u64) -> Result<String> {
		let server = self
			.meta
			.get_server(node_id)?
			.ok_or_else(|| Error::new(ErrorKind::CreateRpcClientFailed, format!("no server record for node {}", node_id)))?;
		Ok(server.rpc_addr())
	}

	/// Double-checked-locking cache fill, matching `GetOrCreateRPCClient`:
	/// an uncontended read first, then a write lock with a second read to
	/// avoid redundant metadata lookups from a thundering herd.
	fn get_or_create(&self, node_id: u64) -> Result<Arc<CachedNode>> {
		if let Some(entry) = self.nodes.read().unwrap().get(&node_id) {
			entry.touch();
			return Ok(entry.clone());
		}

		let mut nodes = self.nodes.write().unwrap();
		if let Some(entry) = nodes.get(&node_id) {
			entry.touch();
			return Ok(entry.clone());
		}

		let addr = self.resolve_addr(node_id)?;
		let entry = Arc::new(CachedNode { addr, last_use_msec: AtomicU64::new(now_msec()) });
		nodes.insert(node_id, entry.clone());
		Ok(entry)
	}

	fn invalidate(&self, node_id: u64) {
		self.nodes.write().unwrap().remove(&node_id);
	}

	/// Drops cache entries idle for longer than `idle_secs`, backing the
	/// router's/master's periodic sweeper.
	pub fn sweep_idle(&self, idle_secs: u64) {
		let cutoff = now_msec().saturating_sub(idle_secs * 1000);
		self.nodes
			.write()
			.unwrap()
			.retain(|_, entry| entry.last_use_msec.load(Ordering::Relaxed) >= cutoff);
	}

	pub fn len(&self) -> usize {
		self.nodes.read().unwrap().len()
	}
}

/// RPC client shared by the router and master for talking to partition
/// servers. Holds a pooled node cache plus the single `hyper::Client`
/// that actually manages keep-alive connections.
pub struct PsClient {
	pool: ConnectionPool,
	http: HyperClient<HttpConnector>,
}

impl PsClient {
	pub fn new(meta: Arc<dyn MetaReader>) -> Self {
		PsClient { pool: ConnectionPool::new(meta), http: HyperClient::new() }
	}

	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}

	async fn post(&self, addr: &str, handler: &str, body: PartitionData) -> Result<PartitionData> {
		let payload = rmp_serde::to_vec(&body)?;
		let req = Request::builder()
			.method(Method::POST)
			.uri(format!("http://{}/rpc/{}", addr, handler))
			.header("content-type", "application/msgpack")
			.body(Body::from(payload))
			.map_err(|e| Error::new(ErrorKind::RpcParamError, e.to_string()))?;

		let resp = self
			.http
			.request(req)
			.await
			.map_err(|e| Error::new(ErrorKind::ServiceUnavailable, e.to_string()))?;

		let bytes = hyper::body::to_bytes(resp.into_body())
			.await
			.map_err(|e| Error::new(ErrorKind::ServiceUnavailable, e.to_string()))?;

		rmp_serde::from_slice(&bytes).map_err(Error::from)
	}

	/// Single attempt against the cached address for `node_id`. No
	/// retry: callers that need leader-chasing use [`PsClient::execute`].
	pub async fn call(&self, node_id: u64, partition_id: u64, handler: &str, data: Vec<u8>) -> Result<Vec<u8>> {
		let node = self.pool.get_or_create(node_id)?;
		let env = self.post(&node.addr, handler, PartitionData::request(partition_id, data)).await?;
		env.into_result()
	}

	/// Single attempt against an address the caller already resolved
	/// itself (the master, dispatching `CreatePartition`/`ChangeMember`
	/// from a `Server` record it just read out of the metadata store).
	/// No pooling, no retry: admin calls are infrequent enough that the
	/// per-call connection setup is not worth caching, and the master
	/// already owns the retry/backoff policy for its own callers.
	pub async fn call_addr(&self, addr: &str, partition_id: u64, handler: &str, data: Vec<u8>) -> Result<Vec<u8>> {
		let env = self.post(addr, handler, PartitionData::request(partition_id, data)).await?;
		env.into_result()
	}

	/// Chases a moved leader the way the teacher's free-standing
	/// `Execute` function does: on `PARTITION_NO_LEADER`, back off and
	/// retry the same address (the partition may simply be mid-election);
	/// on `PARTITION_NOT_LEADER`, parse the redirect `Replica` out of the
	/// error and retry the new address immediately, no backoff.
	pub async fn execute(&self, node_id: u64, partition_id: u64, handler: &str, data: Vec<u8>) -> Result<Vec<u8>> {
		let node = self.pool.get_or_create(node_id)?;
		let mut addr = node.addr.clone();
		let mut sleep_time = BASE_SLEEP;
		let mut last_err = Error::new(ErrorKind::InternalError, "execute: no attempts made");

		for _ in 0..ADAPT_RETRY {
			let env = self.post(&addr, handler, PartitionData::request(partition_id, data.clone())).await?;
			match env.into_result() {
				Ok(payload) => return Ok(payload),
				Err(e) if e.kind == ErrorKind::PartitionNoLeader => {
					tracing::warn!(handler, partition_id, %addr, "no leader, retrying");
					tokio::time::sleep(sleep_time).await;
					sleep_time *= 2;
					last_err = e;
				}
				Err(e) if e.kind == ErrorKind::PartitionNotLeader => {
					let redirect = e.redirect.clone().unwrap_or_default();
					let replica: Replica = serde_json::from_str(&redirect).map_err(Error::from)?;
					tracing::debug!(handler, partition_id, new_addr = %replica.rpc_addr, "not leader, redirecting");
					addr = replica.rpc_addr;
					last_err = e;
				}
				Err(e) => {
					self.pool.invalidate(node_id);
					return Err(e);
				}
			}
		}

		self.pool.invalidate(node_id);
		Err(last_err)
	}
}

//! Partition-server RPC surface: handler dispatch plus the not-leader
//! redirect middleware, served over the same `POST /rpc/{handler}`
//! convention [`meridian_rpc::PsClient`] speaks. Every handler receives
//! and returns a `PartitionData` envelope msgpack-encoded on the wire;
//! `data` inside the envelope is JSON for admin ops and the document
//! write path, and for `SEARCH_HANDLER` the request is JSON but the
//! reply is the engine's own msgpack-encoded hit list passed through
//! unchanged.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};

use meridian_meta::{ChangeMemberMethod, Replica, Space};
use meridian_rpc::envelope::{
	PartitionData, BATCH_HANDLER, CHANGE_MEMBER_HANDLER, CREATE_DOC_HANDLER, CREATE_PARTITION_HANDLER, DELETE_DOCS_HANDLER,
	DELETE_PARTITION_HANDLER, DELETE_REPLICA_HANDLER, GET_DOC_HANDLER, IS_LIVE_HANDLER, PARTITION_INFO_HANDLER, REPLACE_DOC_HANDLER,
	SEARCH_HANDLER, STATS_HANDLER, UPDATE_PARTITION_HANDLER,
};
use meridian_util::error::{Error, ErrorKind, Result};

use crate::engine::PartitionInfo;
use crate::partition::{leader_error, LocalPartition, PartitionTable};

#[derive(Deserialize)]
struct CreatePartitionPayload {
	space: Space,
	partition_id: u64,
	members: Vec<Replica>,
}

#[derive(Deserialize)]
struct PartitionIdPayload {
	partition_id: u64,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct UpdatePartitionPayload {
	space: Space,
	partition_id: u64,
}

#[derive(Deserialize)]
struct ChangeMemberPayload {
	partition_id: u64,
	method: ChangeMemberMethod,
	replica: Replica,
}

#[derive(Serialize)]
struct NodeStats {
	active_conn: u64,
	cpu: f64,
	partition_infos: Vec<PartitionInfo>,
}

#[derive(Deserialize)]
struct DocIdPayload {
	partition_id: u64,
	doc_id: String,
}

#[derive(Deserialize)]
struct PutDocPayload {
	partition_id: u64,
	doc_id: String,
	doc: Vec<u8>,
}

#[derive(Deserialize)]
struct DeleteDocsPayload {
	partition_id: u64,
	doc_ids: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct DeleteDocsResult {
	doc_id: String,
	deleted: bool,
}

/// One leg of a `Batch` call: `doc` present means upsert, absent means
/// delete. Each op's own success/failure is reported independently —
/// one bad id in a batch never fails the rest.
#[derive(Deserialize)]
struct BatchOp {
	doc_id: String,
	doc: Option<Vec<u8>>,
}

#[derive(Deserialize)]
struct BatchPayload {
	partition_id: u64,
	ops: Vec<BatchOp>,
}

#[derive(Serialize, Deserialize)]
struct BatchOpResult {
	doc_id: String,
	ok: bool,
	err: Option<String>,
}

#[derive(Deserialize)]
struct SearchPayload {
	partition_id: u64,
	query: Vec<u8>,
	top_k: usize,
}

/// Owns this node's partition table and the bits of node-wide state the
/// admin handlers report (`active_conn` for `Stats`).
pub struct AdminHandlers {
	pub partitions: Arc<PartitionTable>,
	active_conn: AtomicU64,
}

impl AdminHandlers {
	pub fn new(partitions: Arc<PartitionTable>) -> Self {
		AdminHandlers { partitions, active_conn: AtomicU64::new(0) }
	}

	fn create_partition(&self, payload: CreatePartitionPayload) -> Result<()> {
		self.partitions.create(&payload.space, payload.partition_id, payload.members)
	}

	fn delete_partition(&self, payload: PartitionIdPayload) -> Result<()> {
		self.partitions.delete(payload.partition_id)
	}

	fn delete_replica(&self, payload: PartitionIdPayload) -> Result<()> {
		self.partitions.delete(payload.partition_id)
	}

	/// Schema/config updates have nothing to apply against the
	/// in-memory engine stand-in; this just confirms the partition is
	/// actually hosted here, the same check a real binding would do
	/// before forwarding the new `Space` to the engine.
	fn update_partition(&self, payload: UpdatePartitionPayload) -> Result<()> {
		self.partitions
			.get(payload.partition_id)
			.ok_or_else(|| Error::new(ErrorKind::RpcParamError, format!("partition {} not hosted here", payload.partition_id)))?;
		Ok(())
	}

	fn change_member(&self, payload: ChangeMemberPayload) -> Result<()> {
		self.partitions.change_member(payload.partition_id, payload.method, payload.replica)
	}

	fn is_live(&self) -> Result<()> {
		Ok(())
	}

	/// `partition_id == 0` reports every partition hosted on this node;
	/// otherwise just the one requested.
	fn partition_info(&self, payload: PartitionIdPayload) -> Result<Vec<PartitionInfo>> {
		if payload.partition_id == 0 {
			self.partitions.all().iter().map(|p| p.info(false)).collect()
		} else {
			let partition = self
				.partitions
				.get(payload.partition_id)
				.ok_or_else(|| Error::new(ErrorKind::RpcParamError, format!("partition {} not hosted here", payload.partition_id)))?;
			Ok(vec![partition.info(false)?])
		}
	}

	fn stats(&self) -> Result<NodeStats> {
		let partition_infos = self.partitions.all().iter().map(|p| p.info(false)).collect::<Result<Vec<_>>>()?;
		Ok(NodeStats { active_conn: self.active_conn.load(Ordering::Relaxed), cpu: 0.0, partition_infos })
	}

	fn require_partition(&self, partition_id: u64) -> Result<Arc<LocalPartition>> {
		self.partitions
			.get(partition_id)
			.ok_or_else(|| Error::new(ErrorKind::RpcParamError, format!("partition {} not hosted here", partition_id)))
	}

	/// Every write-path handler (`CreateDoc`/`ReplaceDoc`/`DeleteDocs`/
	/// `Batch`) only accepts documents on the partition's current
	/// leader; a non-leader call surfaces the same redirect contract as
	/// `ChangeMember`, so the router's leader chase applies uniformly.
	fn require_leader(&self, partition: &LocalPartition) -> Result<()> {
		if partition.is_leader(self.partitions.node_id()) {
			Ok(())
		} else {
			Err(leader_error(partition.leader()))
		}
	}

	fn get_doc(&self, payload: DocIdPayload) -> Result<Option<Vec<u8>>> {
		let partition = self.require_partition(payload.partition_id)?;
		partition.engine().get_doc(&payload.doc_id)
	}

	fn create_doc(&self, payload: PutDocPayload) -> Result<()> {
		let partition = self.require_partition(payload.partition_id)?;
		self.require_leader(&partition)?;
		partition.engine().put_doc(&payload.doc_id, payload.doc)
	}

	fn replace_doc(&self, payload: PutDocPayload) -> Result<()> {
		let partition = self.require_partition(payload.partition_id)?;
		self.require_leader(&partition)?;
		partition.engine().put_doc(&payload.doc_id, payload.doc)
	}

	fn delete_docs(&self, payload: DeleteDocsPayload) -> Result<Vec<DeleteDocsResult>> {
		let partition = self.require_partition(payload.partition_id)?;
		self.require_leader(&partition)?;
		payload
			.doc_ids
			.into_iter()
			.map(|doc_id| {
				let deleted = partition.engine().delete_doc(&doc_id)?;
				Ok(DeleteDocsResult { doc_id, deleted })
			})
			.collect()
	}

	fn batch(&self, payload: BatchPayload) -> Result<Vec<BatchOpResult>> {
		let partition = self.require_partition(payload.partition_id)?;
		self.require_leader(&partition)?;
		Ok(payload
			.ops
			.into_iter()
			.map(|op| {
				let result = match op.doc {
					Some(doc) => partition.engine().put_doc(&op.doc_id, doc),
					None => partition.engine().delete_doc(&op.doc_id).map(|_| ()),
				};
				match result {
					Ok(()) => BatchOpResult { doc_id: op.doc_id, ok: true, err: None },
					Err(e) => BatchOpResult { doc_id: op.doc_id, ok: false, err: Some(e.msg) },
				}
			})
			.collect())
	}

	/// Reads never require the leader — whichever replica the router
	/// picked under its `load_balance` policy answers locally.
	fn search(&self, payload: SearchPayload) -> Result<Vec<u8>> {
		let partition = self.require_partition(payload.partition_id)?;
		partition.engine().search(&payload.query, payload.top_k)
	}
}

fn json_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
	serde_json::from_slice(data).map_err(Error::from)
}

fn json_reply<T: Serialize>(value: &T) -> Result<Vec<u8>> {
	serde_json::to_vec(value).map_err(Error::from)
}

/// Invokes the named handler. A handler that fails with
/// `PARTITION_NOT_LEADER`/`PARTITION_NO_LEADER` is indistinguishable
/// here from any other error — `serve_envelope` is the layer that
/// inspects the error kind and applies the redirect contract.
fn dispatch(handlers: &AdminHandlers, handler: &str, data: &[u8]) -> Result<Vec<u8>> {
	match handler {
		CREATE_PARTITION_HANDLER => {
			handlers.create_partition(json_payload(data)?)?;
			json_reply(&serde_json::json!({"ok": true}))
		}
		DELETE_PARTITION_HANDLER => {
			handlers.delete_partition(json_payload(data)?)?;
			json_reply(&serde_json::json!({"ok": true}))
		}
		DELETE_REPLICA_HANDLER => {
			handlers.delete_replica(json_payload(data)?)?;
			json_reply(&serde_json::json!({"ok": true}))
		}
		UPDATE_PARTITION_HANDLER => {
			handlers.update_partition(json_payload(data)?)?;
			json_reply(&serde_json::json!({"ok": true}))
		}
		CHANGE_MEMBER_HANDLER => {
			handlers.change_member(json_payload(data)?)?;
			json_reply(&serde_json::json!({"ok": true}))
		}
		IS_LIVE_HANDLER => {
			handlers.is_live()?;
			json_reply(&serde_json::json!({"ok": true}))
		}
		PARTITION_INFO_HANDLER => {
			let infos = handlers.partition_info(json_payload(data)?)?;
			json_reply(&infos)
		}
		STATS_HANDLER => json_reply(&handlers.stats()?),
		GET_DOC_HANDLER => json_reply(&handlers.get_doc(json_payload(data)?)?),
		CREATE_DOC_HANDLER => {
			handlers.create_doc(json_payload(data)?)?;
			json_reply(&serde_json::json!({"ok": true}))
		}
		REPLACE_DOC_HANDLER => {
			handlers.replace_doc(json_payload(data)?)?;
			json_reply(&serde_json::json!({"ok": true}))
		}
		DELETE_DOCS_HANDLER => json_reply(&handlers.delete_docs(json_payload(data)?)?),
		BATCH_HANDLER => json_reply(&handlers.batch(json_payload(data)?)?),
		SEARCH_HANDLER => {
			let payload: SearchPayload = json_payload(data)?;
			Ok(handlers.search(payload)?)
		}
		other => Err(Error::new(ErrorKind::RpcParamError, format!("no such handler: {}", other))),
	}
}

/// Applies the not-leader redirect contract uniformly: any
/// `PARTITION_NOT_LEADER`/`PARTITION_NO_LEADER` error surfaced by a
/// handler is translated into the reply envelope rather than left to
/// propagate as a transport failure, so the caller always sees the
/// same shape.
fn serve_envelope(handlers: &AdminHandlers, handler: &str, req: PartitionData) -> PartitionData {
	match dispatch(handlers, handler, &req.data) {
		Ok(data) => PartitionData::ok(req.partition_id, data),
		Err(e) => PartitionData::from_error(req.partition_id, &e),
	}
}

/// Catches a panic raised inside a handler and converts it into the
/// `RECOVER` error kind, matching the propagation policy that panics
/// never cross a handler boundary.
fn serve_envelope_guarded(handlers: &AdminHandlers, handler: &str, req: PartitionData) -> PartitionData {
	let partition_id = req.partition_id;
	match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| serve_envelope(handlers, handler, req))) {
		Ok(reply) => reply,
		Err(panic) => {
			let msg = panic
				.downcast_ref::<&str>()
				.map(|s| s.to_string())
				.or_else(|| panic.downcast_ref::<String>().cloned())
				.unwrap_or_else(|| "handler panicked".to_string());
			PartitionData::from_error(partition_id, &Error::recovered(msg))
		}
	}
}

pub struct PsAdminServer {
	pub handlers: Arc<AdminHandlers>,
}

impl PsAdminServer {
	pub fn new(handlers: Arc<AdminHandlers>) -> Self {
		PsAdminServer { handlers }
	}

	pub async fn serve(self, addr: SocketAddr) -> Result<()> {
		let handlers = self.handlers;
		let make_svc = make_service_fn(move |_conn| {
			let handlers = handlers.clone();
			async move { Ok::<_, Infallible>(service_fn(move |req: Request<Body>| handle(req, handlers.clone()))) }
		});

		tracing::info!(%addr, "partition server admin API listening");
		Server::bind(&addr)
			.serve(make_svc)
			.await
			.map_err(|e| Error::new(ErrorKind::ServiceUnavailable, e.to_string()))
	}
}

async fn handle(req: Request<Body>, handlers: Arc<AdminHandlers>) -> std::result::Result<Response<Body>, Infallible> {
	let path = req.uri().path().to_string();
	let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

	let handler_name = match (req.method(), segments.as_slice()) {
		(&Method::POST, ["rpc", handler_name]) => handler_name.to_string(),
		_ => return Ok(Response::builder().status(StatusCode::NOT_FOUND).body(Body::from("no such route")).unwrap()),
	};

	let bytes = match hyper::body::to_bytes(req.into_body()).await {
		Ok(b) => b,
		Err(e) => {
			return Ok(Response::builder().status(StatusCode::BAD_REQUEST).body(Body::from(e.to_string())).unwrap());
		}
	};
	let envelope: PartitionData = match rmp_serde::from_slice(&bytes) {
		Ok(e) => e,
		Err(e) => {
			return Ok(Response::builder().status(StatusCode::BAD_REQUEST).body(Body::from(e.to_string())).unwrap());
		}
	};

	let reply = serve_envelope_guarded(&handlers, &handler_name, envelope);
	let body = rmp_serde::to_vec(&reply).unwrap_or_default();
	Ok(Response::builder().status(StatusCode::OK).header("content-type", "application/msgpack").body(Body::from(body)).unwrap())
}

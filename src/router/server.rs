//! The router's client-facing surface: JSON over HTTP, matching the
//! wire convention the master's admin API and the partition server's
//! RPC surface both already use in this cluster. Every reply carries a
//! `ResponseHead` so latency and error reporting travel with the data
//! instead of living only in the transport status code.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};

use meridian_rpc::envelope::{BATCH_HANDLER, CREATE_DOC_HANDLER, DELETE_DOCS_HANDLER, GET_DOC_HANDLER, REPLACE_DOC_HANDLER, SEARCH_HANDLER};
use meridian_rpc::PsClient;
use meridian_util::error::{Error, ErrorKind, Result};

use crate::cache::SpaceCache;
use crate::dispatch::search_partitions;
use crate::partition::{group_by_partition, partition_for_key};
use crate::request::RouterRequest;
use crate::search::{merge_hits, pick_replica, Hit, LoadBalance};

#[derive(Serialize, Default)]
struct ResponseHead {
	err: Option<ApiError>,
	params: BTreeMap<String, f64>,
}

#[derive(Serialize)]
struct ApiError {
	code: u16,
	msg: String,
}

impl From<&Error> for ApiError {
	fn from(e: &Error) -> Self {
		ApiError { code: e.kind.code(), msg: e.msg.clone() }
	}
}

impl ResponseHead {
	fn ok(cost: Duration) -> Self {
		let mut params = BTreeMap::new();
		params.insert("serializeCostTime".to_string(), cost.as_secs_f64() * 1000.0);
		ResponseHead { err: None, params }
	}

	fn failed(err: &Error) -> Self {
		ResponseHead { err: Some(err.into()), params: BTreeMap::new() }
	}
}

pub struct RouterServer {
	pub cache: Arc<SpaceCache>,
	pub client: Arc<PsClient>,
}

impl RouterServer {
	pub fn new(cache: Arc<SpaceCache>, client: Arc<PsClient>) -> Self {
		RouterServer { cache, client }
	}

	pub async fn serve(self, addr: SocketAddr) -> Result<()> {
		let cache = self.cache;
		let client = self.client;
		let make_svc = make_service_fn(move |_conn| {
			let cache = cache.clone();
			let client = client.clone();
			async move { Ok::<_, Infallible>(service_fn(move |req: Request<Body>| handle(req, cache.clone(), client.clone()))) }
		});

		tracing::info!(%addr, "router client API listening");
		Server::bind(&addr).serve(make_svc).await.map_err(|e| Error::new(ErrorKind::ServiceUnavailable, e.to_string()))
	}
}

fn query_params(req: &Request<Body>) -> BTreeMap<String, String> {
	req.uri()
		.query()
		.map(|q| q.split('&').filter_map(|kv| kv.split_once('=')).map(|(k, v)| (k.to_string(), v.to_string())).collect())
		.unwrap_or_default()
}

fn timeout_ms(params: &BTreeMap<String, String>) -> Option<u64> {
	params.get("timeout_ms").and_then(|v| v.parse().ok())
}

fn json_body<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
	let body = serde_json::to_vec(value).unwrap_or_default();
	Response::builder().status(status).header("content-type", "application/json").body(Body::from(body)).unwrap()
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T> {
	let bytes = hyper::body::to_bytes(req.into_body()).await.map_err(|e| Error::new(ErrorKind::RpcParamError, e.to_string()))?;
	serde_json::from_slice(&bytes).map_err(Error::from)
}

async fn handle(req: Request<Body>, cache: Arc<SpaceCache>, client: Arc<PsClient>) -> std::result::Result<Response<Body>, Infallible> {
	let path = req.uri().path().to_string();
	let segments: Vec<String> = path.trim_matches('/').split('/').map(|s| s.to_string()).collect();
	let params = query_params(&req);
	let method = req.method().clone();

	let result = route(method, segments, params, req, cache, client).await;
	let response = match result {
		Ok(resp) => resp,
		Err(e) => json_body(status_for(&e), &ResponseHead::failed(&e)),
	};
	Ok(response)
}

fn status_for(err: &Error) -> StatusCode {
	match err.kind {
		ErrorKind::SpaceNotExists | ErrorKind::DbNotExists => StatusCode::NOT_FOUND,
		ErrorKind::RpcParamError => StatusCode::BAD_REQUEST,
		ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	}
}

async fn route(
	method: Method,
	segments: Vec<String>,
	params: BTreeMap<String, String>,
	req: Request<Body>,
	cache: Arc<SpaceCache>,
	client: Arc<PsClient>,
) -> Result<Response<Body>> {
	let seg: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();
	match (method, seg.as_slice()) {
		(Method::GET, [db, space, "doc", id]) => get_doc(&cache, &client, db, space, id, timeout_ms(&params)).await,
		(Method::PUT, [db, space, "doc", id]) => write_doc(&cache, &client, db, space, id, req, CREATE_DOC_HANDLER, timeout_ms(&params)).await,
		(Method::POST, [db, space, "doc", id]) => write_doc(&cache, &client, db, space, id, req, REPLACE_DOC_HANDLER, timeout_ms(&params)).await,
		(Method::DELETE, [db, space, "doc", id]) => delete_doc(&cache, &client, db, space, id, timeout_ms(&params)).await,
		(Method::POST, [db, space, "_bulk"]) => bulk(&cache, &client, db, space, req, timeout_ms(&params)).await,
		(Method::POST, [db, space, "_search"]) => search(&cache, &client, db, space, req, timeout_ms(&params)).await,
		(Method::POST, [db, space, "_msearch"]) => msearch(&cache, &client, db, space, req, timeout_ms(&params)).await,
		_ => Err(Error::new(ErrorKind::RpcParamError, "no such route")),
	}
}

#[derive(Serialize)]
struct GetReply {
	head: ResponseHead,
	doc: Option<Vec<u8>>,
}

async fn get_doc(cache: &SpaceCache, client: &PsClient, db: &str, space: &str, id: &str, timeout: Option<u64>) -> Result<Response<Body>> {
	let started = Instant::now();
	let rr = RouterRequest::set_head(db, space, timeout).set_space(cache)?;
	let partition = partition_for_key(rr.space(), id)?;
	let node_id = pick_replica(partition, LoadBalance::Leader)?;
	let payload = serde_json::to_vec(&serde_json::json!({"partition_id": partition.id, "doc_id": id}))?;
	let reply = tokio::time::timeout(rr.head().deadline(), client.execute(node_id, partition.id, GET_DOC_HANDLER, payload))
		.await
		.map_err(|_| Error::new(ErrorKind::Timeout, "get doc deadline exceeded"))??;
	let doc: Option<Vec<u8>> = serde_json::from_slice(&reply)?;
	Ok(json_body(StatusCode::OK, &GetReply { head: ResponseHead::ok(started.elapsed()), doc }))
}

#[derive(Serialize)]
struct WriteReply {
	head: ResponseHead,
}

async fn write_doc(
	cache: &SpaceCache,
	client: &PsClient,
	db: &str,
	space: &str,
	id: &str,
	req: Request<Body>,
	handler: &str,
	timeout: Option<u64>,
) -> Result<Response<Body>> {
	let started = Instant::now();
	let doc: Vec<u8> = read_json(req).await?;
	let rr = RouterRequest::set_head(db, space, timeout).set_space(cache)?;
	let partition = partition_for_key(rr.space(), id)?;
	let node_id = partition
		.leader_id
		.ok_or_else(|| Error::new(ErrorKind::PartitionNoLeader, format!("partition {} has no leader", partition.id)))?;
	let payload = serde_json::to_vec(&serde_json::json!({"partition_id": partition.id, "doc_id": id, "doc": doc}))?;
	tokio::time::timeout(rr.head().deadline(), client.execute(node_id, partition.id, handler, payload))
		.await
		.map_err(|_| Error::new(ErrorKind::Timeout, "write deadline exceeded"))??;
	Ok(json_body(StatusCode::OK, &WriteReply { head: ResponseHead::ok(started.elapsed()) }))
}

async fn delete_doc(cache: &SpaceCache, client: &PsClient, db: &str, space: &str, id: &str, timeout: Option<u64>) -> Result<Response<Body>> {
	let started = Instant::now();
	let rr = RouterRequest::set_head(db, space, timeout).set_space(cache)?;
	let partition = partition_for_key(rr.space(), id)?;
	let node_id = partition
		.leader_id
		.ok_or_else(|| Error::new(ErrorKind::PartitionNoLeader, format!("partition {} has no leader", partition.id)))?;
	let payload = serde_json::to_vec(&serde_json::json!({"partition_id": partition.id, "doc_ids": [id]}))?;
	tokio::time::timeout(rr.head().deadline(), client.execute(node_id, partition.id, DELETE_DOCS_HANDLER, payload))
		.await
		.map_err(|_| Error::new(ErrorKind::Timeout, "delete deadline exceeded"))??;
	Ok(json_body(StatusCode::OK, &WriteReply { head: ResponseHead::ok(started.elapsed()) }))
}

#[derive(Deserialize)]
struct BulkDoc {
	key: String,
	/// Present means upsert, absent means delete — one `_bulk` call
	/// does both, matching the engine-level `Batch` handler it feeds.
	doc: Option<Vec<u8>>,
}

#[derive(Deserialize)]
struct BulkRequest {
	docs: Vec<BulkDoc>,
}

#[derive(Serialize)]
struct BulkItemResult {
	key: String,
	ok: bool,
	err: Option<String>,
}

#[derive(Serialize)]
struct BulkReply {
	head: ResponseHead,
	results: Vec<BulkItemResult>,
}

/// Groups `docs` by target partition and dispatches one `Batch` call
/// per partition leader in parallel, the way [`crate::dispatch::dispatch_write`]
/// does for a homogeneous op; here each leg carries a mixed
/// upsert/delete batch so one `_bulk` request can do both in one pass.
async fn bulk(cache: &SpaceCache, client: &PsClient, db: &str, space: &str, req: Request<Body>, timeout: Option<u64>) -> Result<Response<Body>> {
	let started = Instant::now();
	let body: BulkRequest = read_json(req).await?;
	let rr = RouterRequest::set_head(db, space, timeout).set_space(cache)?;
	let docs: Vec<(String, Option<Vec<u8>>)> = body.docs.into_iter().map(|d| (d.key, d.doc)).collect();
	let groups = group_by_partition(rr.space(), docs)?;
	let deadline = rr.head().deadline();

	let leaders: BTreeMap<u64, u64> = rr.space().partitions.iter().filter_map(|p| p.leader_id.map(|l| (p.id, l))).collect();
	let legs = groups.into_iter().map(|(partition_id, batch)| {
		let node_id = leaders.get(&partition_id).copied();
		async move {
			let ops: Vec<serde_json::Value> =
				batch.iter().map(|(_, key, doc)| serde_json::json!({"doc_id": key, "doc": doc})).collect();
			let payload = match serde_json::to_vec(&serde_json::json!({"partition_id": partition_id, "ops": ops})) {
				Ok(p) => p,
				Err(e) => return batch.into_iter().map(|(_, key, _)| BulkItemResult { key, ok: false, err: Some(e.to_string()) }).collect::<Vec<_>>(),
			};
			let node_id = match node_id {
				Some(id) => id,
				None => {
					return batch.into_iter().map(|(_, key, _)| BulkItemResult { key, ok: false, err: Some("no leader".into()) }).collect()
				}
			};
			match tokio::time::timeout(deadline, client.execute(node_id, partition_id, BATCH_HANDLER, payload)).await {
				Err(_) => batch.into_iter().map(|(_, key, _)| BulkItemResult { key, ok: false, err: Some("TIMEOUT".into()) }).collect(),
				Ok(Err(e)) => batch.into_iter().map(|(_, key, _)| BulkItemResult { key, ok: false, err: Some(e.msg.clone()) }).collect(),
				Ok(Ok(_)) => batch.into_iter().map(|(_, key, _)| BulkItemResult { key, ok: true, err: None }).collect(),
			}
		}
	});
	let results: Vec<BulkItemResult> = futures::future::join_all(legs).await.into_iter().flatten().collect();
	Ok(json_body(StatusCode::OK, &BulkReply { head: ResponseHead::ok(started.elapsed()), results }))
}

#[derive(Deserialize)]
struct SearchRequest {
	query: Vec<u8>,
	top_k: usize,
	#[serde(default)]
	from: usize,
	size: usize,
	#[serde(default)]
	load_balance: LoadBalance,
}

#[derive(Serialize)]
struct SearchReply {
	head: ResponseHead,
	hits: Vec<Hit>,
}

async fn search(cache: &SpaceCache, client: &PsClient, db: &str, space: &str, req: Request<Body>, timeout: Option<u64>) -> Result<Response<Body>> {
	let started = Instant::now();
	let body: SearchRequest = read_json(req).await?;
	let rr = RouterRequest::set_head(db, space, timeout).set_space(cache)?;
	let query_payload = serde_json::to_vec(&serde_json::json!({"query": body.query, "top_k": body.top_k}))?;
	let per_partition = search_partitions(client, rr.space(), body.load_balance, SEARCH_HANDLER, &query_payload, rr.head().deadline()).await;
	let hits = merge_hits(&per_partition, body.from, body.size);
	Ok(json_body(StatusCode::OK, &SearchReply { head: ResponseHead::ok(started.elapsed()), hits }))
}

#[derive(Deserialize)]
struct MSearchRequest {
	queries: Vec<SearchRequest>,
}

#[derive(Serialize)]
struct MSearchReply {
	head: ResponseHead,
	results: Vec<Vec<Hit>>,
}

/// Each sub-query runs its own full scatter-gather independently —
/// `merge_msearch`'s no-cross-query-interleaving contract falls out
/// naturally from just running the single-query path once per entry
/// and concatenating in input order.
async fn msearch(cache: &SpaceCache, client: &PsClient, db: &str, space: &str, req: Request<Body>, timeout: Option<u64>) -> Result<Response<Body>> {
	let started = Instant::now();
	let body: MSearchRequest = read_json(req).await?;
	let rr = RouterRequest::set_head(db, space, timeout).set_space(cache)?;
	let deadline = rr.head().deadline();

	let mut results = Vec::with_capacity(body.queries.len());
	for q in body.queries {
		let query_payload = serde_json::to_vec(&serde_json::json!({"query": q.query, "top_k": q.top_k}))?;
		let per_partition = search_partitions(client, rr.space(), q.load_balance, SEARCH_HANDLER, &query_payload, deadline).await;
		results.push(merge_hits(&per_partition, q.from, q.size));
	}
	Ok(json_body(StatusCode::OK, &MSearchReply { head: ResponseHead::ok(started.elapsed()), results }))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn response_head_failed_carries_the_error_code() {
		let err = Error::new(ErrorKind::SpaceNotExists, "no such space");
		let head = ResponseHead::failed(&err);
		assert_eq!(head.err.unwrap().code, ErrorKind::SpaceNotExists.code());
	}

	#[test]
	fn status_for_maps_not_found_kinds() {
		assert_eq!(status_for(&Error::new(ErrorKind::SpaceNotExists, "x")), StatusCode::NOT_FOUND);
		assert_eq!(status_for(&Error::new(ErrorKind::RpcParamError, "x")), StatusCode::BAD_REQUEST);
	}
}

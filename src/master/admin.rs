//! The admin HTTP API: JSON over HTTP, guarded by HTTP Basic Auth
//! unless `skip_auth` is set. Routes mirror the admin surface spec'd
//! for the master — db/space CRUD, cluster reconfiguration, partition
//! server self-registration, and an optional Prometheus `/metrics`
//! endpoint.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};

use meridian_meta::{ChangeMemberMethod, ChangeMemberRequest, EngineConfig, FieldSchema, Partition};
use meridian_util::error::{Error, ErrorKind};

use crate::metrics::MetricsRegistry;
use crate::service::{MasterService, ServerAddr};
use crate::space::SpaceUpdate;

pub struct AdminConfig {
	pub signkey: Option<String>,
	pub skip_auth: bool,
}

pub struct AdminServer {
	pub service: Arc<MasterService>,
	pub config: AdminConfig,
}

#[derive(Serialize)]
struct ApiError {
	code: u16,
	msg: String,
}

fn error_response(err: &Error) -> Response<Body> {
	let status = match err.kind {
		ErrorKind::DbNotExists | ErrorKind::SpaceNotExists => StatusCode::NOT_FOUND,
		ErrorKind::DupSpace | ErrorKind::DbNotEmpty | ErrorKind::RpcParamError | ErrorKind::NotEqualsByField => {
			StatusCode::BAD_REQUEST
		}
		ErrorKind::AuthenticationFailed => StatusCode::UNAUTHORIZED,
		_ => StatusCode::INTERNAL_SERVER_ERROR,
	};
	let body = serde_json::to_vec(&ApiError { code: err.kind.code(), msg: err.msg.clone() }).unwrap_or_default();
	Response::builder().status(status).header("content-type", "application/json").body(Body::from(body)).unwrap()
}

fn json_ok<T: Serialize>(value: &T) -> Response<Body> {
	let body = serde_json::to_vec(value).unwrap_or_default();
	Response::builder().status(StatusCode::OK).header("content-type", "application/json").body(Body::from(body)).unwrap()
}

fn text_ok(body: String) -> Response<Body> {
	Response::builder().status(StatusCode::OK).header("content-type", "text/plain; version=0.0.4").body(Body::from(body)).unwrap()
}

fn authorized(req: &Request<Body>, config: &AdminConfig) -> bool {
	if config.skip_auth {
		return true;
	}
	let expected = match &config.signkey {
		Some(k) => k,
		None => return true,
	};
	req.headers()
		.get(hyper::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.trim_start_matches("Basic ").trim() == expected.trim())
		.unwrap_or(false)
}

/// Parses `a=1&b=2` query strings by hand — the admin surface's only
/// query parameters are plain scalars, so pulling in a URL-encoding
/// crate for this would be pure overhead.
fn query_params(req: &Request<Body>) -> BTreeMap<String, String> {
	req.uri()
		.query()
		.map(|q| {
			q.split('&')
				.filter_map(|pair| {
					let mut it = pair.splitn(2, '=');
					let key = it.next()?;
					let value = it.next().unwrap_or("");
					Some((key.to_string(), value.to_string()))
				})
				.collect()
		})
		.unwrap_or_default()
}

#[derive(Deserialize)]
struct CreateDbRequest {
	name: String,
	#[serde(default)]
	ps: Vec<String>,
}

#[derive(Deserialize)]
struct CreateSpaceRequest {
	name: String,
	partition_num: u32,
	replica_num: u32,
	#[serde(default)]
	properties: BTreeMap<String, FieldSchema>,
	#[serde(default)]
	engine: EngineConfig,
}

#[derive(Deserialize)]
struct UpdateSpaceRequest {
	#[serde(default)]
	partition_num: Option<u32>,
	#[serde(default)]
	replica_num: Option<u32>,
	#[serde(default)]
	enabled: Option<bool>,
	#[serde(default)]
	properties: Option<BTreeMap<String, FieldSchema>>,
}

#[derive(Deserialize)]
struct ChangeReplicasRequest {
	replica_num: u32,
}

#[derive(Deserialize)]
struct RecoverFailServerRequest {
	fail_node_addr: String,
	new_node_addr: String,
}

#[derive(Deserialize)]
struct RemoveServerRequest {
	server_id: u64,
}

#[derive(Deserialize)]
struct RegisterBody {
	ip: String,
	rpc_port: u16,
	raft_heartbeat_port: u16,
	raft_replicate_port: u16,
}

#[derive(Deserialize)]
struct ChangeMemberBody {
	partition_id: u64,
	node_id: u64,
	method: ChangeMemberMethod,
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, Error> {
	let bytes = hyper::body::to_bytes(req.into_body())
		.await
		.map_err(|e| Error::new(ErrorKind::RpcParamError, e.to_string()))?;
	serde_json::from_slice(&bytes).map_err(Error::from)
}

async fn dispatch(req: Request<Body>, svc: Arc<MasterService>) -> Response<Body> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

	let result = route(method, &segments, req, &svc).await;
	match result {
		Ok(resp) => resp,
		Err(e) => error_response(&e),
	}
}

async fn route(method: Method, segments: &[&str], req: Request<Body>, svc: &Arc<MasterService>) -> Result<Response<Body>, Error> {
	match (&method, segments) {
		(&Method::GET, &[] | &[""]) => Ok(json_ok(&serde_json::json!({
			"build": meridian_util::version::meridian_version(),
			"status": "ok",
		}))),

		(&Method::GET, &["clean_lock"]) => {
			let removed = meridian_db::Lock::clean_all(&svc_lock_db(svc))?;
			Ok(json_ok(&removed))
		}

		(&Method::GET, &["list", "server"]) => {
			let params = query_params(&req);
			let servers = svc.meta.list_servers()?;
			match params.get("ids") {
				Some(csv) => {
					let wanted: Vec<u64> = csv.split(',').filter_map(|s| s.parse().ok()).collect();
					Ok(json_ok(&servers.into_iter().filter(|s| wanted.contains(&s.id)).collect::<Vec<_>>()))
				}
				None => Ok(json_ok(&servers)),
			}
		}

		(&Method::GET, &["list", "db"]) => Ok(json_ok(&svc.list_dbs()?)),

		(&Method::GET, &["list", "space"]) => {
			let params = query_params(&req);
			let db_param = params.get("db").ok_or_else(|| Error::new(ErrorKind::RpcParamError, "missing db param"))?;
			let db_entity = match db_param.parse::<u64>() {
				Ok(id) => svc.meta.get_db_by_id(id)?,
				Err(_) => svc.meta.get_db_by_name(db_param)?,
			}
			.ok_or_else(|| Error::new(ErrorKind::DbNotExists, format!("db {} not found", db_param)))?;
			Ok(json_ok(&svc.meta.list_spaces(db_entity.id)?))
		}

		(&Method::GET, &["list", "partition"]) => {
			let partitions: Vec<Partition> = svc.meta.list_all_spaces()?.into_iter().flat_map(|s| s.partitions).collect();
			Ok(json_ok(&partitions))
		}

		(&Method::POST, &["register"]) => {
			let params = query_params(&req);
			let node_id: u64 = params
				.get("nodeID")
				.ok_or_else(|| Error::new(ErrorKind::RpcParamError, "missing nodeID"))?
				.parse()
				.map_err(|_| Error::new(ErrorKind::RpcParamError, "invalid nodeID"))?;
			let _cluster_name = params.get("clusterName");
			let bytes = hyper::body::to_bytes(req.into_body()).await.map_err(|e| Error::new(ErrorKind::RpcParamError, e.to_string()))?;
			let addr = if bytes.is_empty() {
				None
			} else {
				let body: RegisterBody = serde_json::from_slice(&bytes)?;
				Some(ServerAddr {
					ip: body.ip,
					rpc_port: body.rpc_port,
					raft_heartbeat_port: body.raft_heartbeat_port,
					raft_replicate_port: body.raft_replicate_port,
				})
			};
			Ok(json_ok(&svc.register(node_id, addr)?))
		}

		(&Method::POST, &["register_partition"]) => {
			let partition: Partition = read_json(req).await?;
			svc.register_partition(partition)?;
			Ok(json_ok(&serde_json::json!({"ok": true})))
		}

		(&Method::PUT, &["db", "_create"]) => {
			let body: CreateDbRequest = read_json(req).await?;
			let db_entity = svc.create_db(&body.name, body.ps)?;
			Ok(json_ok(&db_entity))
		}
		(&Method::DELETE, &["db", db]) => {
			svc.delete_db(db)?;
			Ok(json_ok(&serde_json::json!({"deleted": db})))
		}

		(&Method::PUT, &["space", db, "_create"]) => {
			let body: CreateSpaceRequest = read_json(req).await?;
			let space = svc
				.create_space(db, &body.name, body.partition_num, body.replica_num, body.properties, body.engine)
				.await?;
			Ok(json_ok(&space))
		}
		(&Method::POST, &["space", db, space]) => {
			let body: UpdateSpaceRequest = read_json(req).await?;
			let update = SpaceUpdate {
				partition_num: body.partition_num,
				replica_num: body.replica_num,
				enabled: body.enabled,
				properties: body.properties,
			};
			let updated = svc.update_space(db, space, update).await?;
			Ok(json_ok(&updated))
		}
		(&Method::DELETE, &["space", db, space]) => {
			svc.delete_space(db, space)?;
			Ok(json_ok(&serde_json::json!({"deleted": space})))
		}
		(&Method::POST, &["space", db, space, "change_replicas"]) => {
			let body: ChangeReplicasRequest = read_json(req).await?;
			svc.change_replicas(db, space, body.replica_num).await?;
			Ok(json_ok(&svc.query_space(db, space)?))
		}

		(&Method::POST, &["partition", "change_member"]) => {
			let body: ChangeMemberBody = read_json(req).await?;
			let cm = ChangeMemberRequest { partition_id: body.partition_id, node_id: body.node_id, method: body.method };
			svc.change_member(&cm).await?;
			Ok(json_ok(&serde_json::json!({"ok": true})))
		}

		(&Method::POST, &["schedule", "recover_server"]) => {
			let body: RecoverFailServerRequest = read_json(req).await?;
			svc.recover_fail_server(&body.fail_node_addr, &body.new_node_addr).await?;
			Ok(json_ok(&serde_json::json!({"ok": true})))
		}
		(&Method::GET, &["schedule", "fail_server", "list"]) => Ok(json_ok(&svc.meta.list_fail_servers()?)),
		(&Method::DELETE, &["schedule", "fail_server", node_id]) => {
			let node_id: u64 = node_id.parse().map_err(|_| Error::new(ErrorKind::RpcParamError, "invalid nodeID"))?;
			svc.meta.delete_fail_server(node_id)?;
			Ok(json_ok(&serde_json::json!({"ok": true})))
		}

		(&Method::POST, &["meta", "remove_server"]) => {
			let body: RemoveServerRequest = read_json(req).await?;
			svc.remove_server_meta(body.server_id).await?;
			Ok(json_ok(&serde_json::json!({"ok": true})))
		}

		(&Method::GET, &["metrics"]) => {
			let registry = MetricsRegistry::new();
			registry.refresh(svc.meta.as_ref())?;
			Ok(text_ok(registry.render()?))
		}

		_ => Err(Error::new(ErrorKind::RpcParamError, format!("no such route: {} {:?}", method, segments))),
	}
}

/// `MasterService` keeps its cluster-lock `Db` handle private; admin's
/// `clean_lock` route is the one place outside `service.rs` that needs
/// it, so it goes through the metadata reader instead of poking at
/// private fields.
fn svc_lock_db(svc: &Arc<MasterService>) -> meridian_db::Db {
	svc.lock_db_handle()
}

impl AdminServer {
	pub async fn serve(self, addr: SocketAddr) -> Result<(), Error> {
		let service = self.service;
		let config = Arc::new(self.config);
		let make_svc = make_service_fn(move |_conn| {
			let service = service.clone();
			let config = config.clone();
			async move {
				Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
					let service = service.clone();
					let config = config.clone();
					async move {
						if !authorized(&req, &config) {
							return Ok::<_, Infallible>(
								Response::builder()
									.status(StatusCode::UNAUTHORIZED)
									.body(Body::from("unauthorized"))
									.unwrap(),
							);
						}
						Ok::<_, Infallible>(dispatch(req, service).await)
					}
				}))
			}
		});

		tracing::info!(%addr, "master admin API listening");
		Server::bind(&addr)
			.serve(make_svc)
			.await
			.map_err(|e| Error::new(ErrorKind::ServiceUnavailable, e.to_string()))
	}
}

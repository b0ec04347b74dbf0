//! Role launchers (`master`/`router`/`ps`) and the thin admin CLI
//! (`status`/`db`/`space`/`server`) that drives a running master's admin
//! HTTP API.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hyper::client::HttpConnector;
use hyper::{Body, Client as HyperClient, Method, Request};
use serde::{Deserialize, Serialize};
use structopt::StructOpt;

use meridian_master::admin::{AdminConfig, AdminServer};
use meridian_master::ps_admin::RpcPsAdmin;
use meridian_master::MasterService;
use meridian_meta::{EngineConfig, FieldSchema, MetaReader, MetaStore, MetaWriter};
use meridian_ps::{AdminHandlers, PartitionTable, PsAdminServer};
use meridian_rpc::PsClient;
use meridian_router::{RouterServer, SpaceCache};
use meridian_util::config::{read_config, Config};
use meridian_util::error::{Error, ErrorKind, Result};

#[derive(StructOpt, Debug)]
pub enum Command {
	/// Run the master role: metadata store, placement, and the cluster admin API.
	Master,
	/// Run the router role: client-facing request dispatch.
	Router,
	/// Run the partition-server role: document storage and search.
	Ps,
	/// Print build/cluster status from a running master.
	Status,
	Db(DbCommand),
	Space(SpaceCommand),
	Server(ServerCommand),
}

#[derive(StructOpt, Debug)]
pub enum DbCommand {
	Create {
		name: String,
		/// Optional allow-list of partition-server addresses this db's
		/// spaces may be placed on; empty means any live server.
		#[structopt(long)]
		ps: Vec<String>,
	},
	Delete {
		name: String,
	},
	List,
}

#[derive(StructOpt, Debug)]
pub enum SpaceCommand {
	Create {
		db: String,
		name: String,
		#[structopt(long)]
		partitions: u32,
		#[structopt(long)]
		replicas: u32,
	},
	Delete {
		db: String,
		name: String,
	},
	List {
		db: String,
	},
}

#[derive(StructOpt, Debug)]
pub enum ServerCommand {
	List,
}

pub struct RunOpt {
	pub config_file: PathBuf,
	pub rpc_secret: Option<String>,
	pub signkey: Option<String>,
	pub master_addr: Option<String>,
	pub cmd: Command,
}

pub async fn run(opt: RunOpt) -> Result<()> {
	let mut config = read_config(&opt.config_file).unwrap_or_default();
	if opt.rpc_secret.is_some() {
		config.rpc_secret = opt.rpc_secret;
	}
	if opt.signkey.is_some() {
		config.master.signkey = opt.signkey;
	}

	match opt.cmd {
		Command::Master => run_master(config).await,
		Command::Router => run_router(config).await,
		Command::Ps => run_ps(config).await,
		Command::Status => {
			let client = AdminClient::new(&config, opt.master_addr)?;
			let status: serde_json::Value = client.get("/").await?;
			println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
			Ok(())
		}
		Command::Db(cmd) => cmd_db(&config, opt.master_addr, cmd).await,
		Command::Space(cmd) => cmd_space(&config, opt.master_addr, cmd).await,
		Command::Server(cmd) => cmd_server(&config, opt.master_addr, cmd).await,
	}
}

fn open_store(config: &Config) -> Result<meridian_db::Db> {
	#[cfg(feature = "sled")]
	{
		meridian_db::Db::open_sled(&config.metadata_dir).map_err(Error::from)
	}
	#[cfg(not(feature = "sled"))]
	{
		let _ = &config.metadata_dir;
		Ok(meridian_db::Db::open_memory())
	}
}

async fn run_master(config: Config) -> Result<()> {
	let db = open_store(&config)?;
	let meta_store = MetaStore::new(db.clone());
	let meta: Arc<dyn MetaWriter> = Arc::new(meta_store.clone());
	let meta_reader: Arc<dyn MetaReader> = Arc::new(meta_store);

	let client = PsClient::new(meta_reader.clone());
	let dispatcher = Arc::new(RpcPsAdmin::new(client, meta_reader));

	let service = Arc::new(MasterService::new(db, meta, dispatcher.clone(), config.master.lease_ttl_secs).with_probe(dispatcher));
	let admin_config = AdminConfig { signkey: config.master.signkey.clone(), skip_auth: config.master.skip_auth };
	let addr = config.master.admin_bind_addr.unwrap_or(config.rpc_bind_addr);

	tracing::info!(%addr, "starting master role");
	AdminServer { service, config: admin_config }.serve(addr).await
}

async fn run_router(config: Config) -> Result<()> {
	let db = open_store(&config)?;
	let meta_store = MetaStore::new(db);
	let meta: Arc<dyn MetaReader> = Arc::new(meta_store);

	let cache = Arc::new(SpaceCache::new(meta.clone()));
	let client = Arc::new(PsClient::new(meta));
	let addr = config.router.listen_addr.unwrap_or(config.rpc_bind_addr);

	tracing::info!(%addr, "starting router role");
	RouterServer::new(cache, client).serve(addr).await
}

async fn run_ps(config: Config) -> Result<()> {
	let node_id = config.ps.node_id.ok_or_else(|| Error::new(ErrorKind::RpcParamError, "ps.node_id is required"))?;
	let data_dir = config.ps.data_dir.clone().unwrap_or_else(|| config.metadata_dir.join("partitions"));
	let addr = config.ps.listen_addr.unwrap_or(config.rpc_bind_addr);

	let partitions = Arc::new(PartitionTable::new(node_id, data_dir));
	let handlers = Arc::new(AdminHandlers::new(partitions));

	register_with_master(&config, node_id, addr).await;

	tracing::info!(%addr, node_id, "starting partition-server role");
	PsAdminServer::new(handlers).serve(addr).await
}

/// Tells the master this node is live and learns which partitions it's
/// expected to be hosting. Logged and otherwise ignored on failure — a PS
/// that can't reach the master on startup still serves whatever traffic
/// it can and will be caught by the master's own failure detection.
async fn register_with_master(config: &Config, node_id: u64, addr: SocketAddr) {
	let master_addr = match config.ps.master_addr {
		Some(a) => a,
		None => {
			tracing::warn!("ps.master_addr not set, skipping master registration");
			return;
		}
	};

	#[derive(Serialize)]
	struct RegisterBody {
		ip: String,
		rpc_port: u16,
		raft_heartbeat_port: u16,
		raft_replicate_port: u16,
	}
	let advertised = config.rpc_public_addr.unwrap_or(addr);
	let body = RegisterBody {
		ip: advertised.ip().to_string(),
		rpc_port: advertised.port(),
		raft_heartbeat_port: advertised.port(),
		raft_replicate_port: advertised.port(),
	};

	let http = HyperClient::new();
	let uri = format!("http://{}/register?clusterName={}&nodeID={}", master_addr, config.ps.cluster_name, node_id);
	let payload = serde_json::to_vec(&body).unwrap_or_default();
	let req = match Request::builder().method(Method::POST).uri(uri).header("content-type", "application/json").body(Body::from(payload)) {
		Ok(r) => r,
		Err(e) => {
			tracing::warn!(%e, "failed to build register request");
			return;
		}
	};
	match http.request(req).await {
		Ok(resp) if resp.status().is_success() => {
			tracing::info!(node_id, "registered with master");
		}
		Ok(resp) => tracing::warn!(status = %resp.status(), "master rejected registration"),
		Err(e) => tracing::warn!(%e, "could not reach master to register"),
	}
}

/// Thin JSON-over-HTTP client the admin CLI subcommands share, talking to
/// the same admin API [`AdminServer`] serves.
struct AdminClient {
	http: HyperClient<HttpConnector>,
	addr: String,
	signkey: Option<String>,
}

impl AdminClient {
	fn new(config: &Config, master_addr: Option<String>) -> Result<Self> {
		let addr = master_addr
			.or_else(|| config.master.admin_bind_addr.map(|a| a.to_string()))
			.ok_or_else(|| Error::new(ErrorKind::RpcParamError, "no master address: pass --master-addr or set master.admin_bind_addr"))?;
		Ok(AdminClient { http: HyperClient::new(), addr, signkey: config.master.signkey.clone() })
	}

	fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Request<Body>> {
		let mut builder = Request::builder().method(method).uri(format!("http://{}{}", self.addr, path)).header("content-type", "application/json");
		if let Some(key) = &self.signkey {
			builder = builder.header(hyper::header::AUTHORIZATION, format!("Basic {}", key));
		}
		builder.body(body.map(Body::from).unwrap_or_else(Body::empty)).map_err(|e| Error::new(ErrorKind::RpcParamError, e.to_string()))
	}

	async fn send<T: for<'de> Deserialize<'de>>(&self, req: Request<Body>) -> Result<T> {
		let resp = self.http.request(req).await.map_err(|e| Error::new(ErrorKind::ServiceUnavailable, e.to_string()))?;
		let status = resp.status();
		let bytes = hyper::body::to_bytes(resp.into_body()).await.map_err(|e| Error::new(ErrorKind::ServiceUnavailable, e.to_string()))?;
		if !status.is_success() {
			return Err(Error::new(ErrorKind::RpcParamError, format!("master returned {}: {}", status, String::from_utf8_lossy(&bytes))));
		}
		serde_json::from_slice(&bytes).map_err(Error::from)
	}

	async fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
		self.send(self.request(Method::GET, path, None)?).await
	}

	async fn delete<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T> {
		self.send(self.request(Method::DELETE, path, None)?).await
	}

	async fn put<B: Serialize, T: for<'de> Deserialize<'de>>(&self, path: &str, body: &B) -> Result<T> {
		let payload = serde_json::to_vec(body)?;
		self.send(self.request(Method::PUT, path, Some(payload))?).await
	}
}

async fn cmd_db(config: &Config, master_addr: Option<String>, cmd: DbCommand) -> Result<()> {
	let client = AdminClient::new(config, master_addr)?;
	match cmd {
		DbCommand::Create { name, ps } => {
			let body = serde_json::json!({"name": name, "ps": ps});
			let created: serde_json::Value = client.put("/db/_create", &body).await?;
			println!("{}", serde_json::to_string_pretty(&created).unwrap_or_default());
		}
		DbCommand::Delete { name } => {
			let result: serde_json::Value = client.delete(&format!("/db/{}", name)).await?;
			println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
		}
		DbCommand::List => {
			let dbs: serde_json::Value = client.get("/list/db").await?;
			println!("{}", serde_json::to_string_pretty(&dbs).unwrap_or_default());
		}
	}
	Ok(())
}

async fn cmd_space(config: &Config, master_addr: Option<String>, cmd: SpaceCommand) -> Result<()> {
	let client = AdminClient::new(config, master_addr)?;
	match cmd {
		SpaceCommand::Create { db, name, partitions, replicas } => {
			let body = serde_json::json!({
				"name": name,
				"partition_num": partitions,
				"replica_num": replicas,
				"properties": BTreeMap::<String, FieldSchema>::new(),
				"engine": EngineConfig::default(),
			});
			let created: serde_json::Value = client.put(&format!("/space/{}/_create", db), &body).await?;
			println!("{}", serde_json::to_string_pretty(&created).unwrap_or_default());
		}
		SpaceCommand::Delete { db, name } => {
			let result: serde_json::Value = client.delete(&format!("/space/{}/{}", db, name)).await?;
			println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
		}
		SpaceCommand::List { db } => {
			let spaces: serde_json::Value = client.get(&format!("/list/space?db={}", db)).await?;
			println!("{}", serde_json::to_string_pretty(&spaces).unwrap_or_default());
		}
	}
	Ok(())
}

async fn cmd_server(config: &Config, master_addr: Option<String>, cmd: ServerCommand) -> Result<()> {
	let client = AdminClient::new(config, master_addr)?;
	match cmd {
		ServerCommand::List => {
			let servers: serde_json::Value = client.get("/list/server").await?;
			println!("{}", serde_json::to_string_pretty(&servers).unwrap_or_default());
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn admin_client_prefers_explicit_master_addr_over_config() {
		let mut config = Config::default();
		config.master.admin_bind_addr = Some("127.0.0.1:9090".parse().unwrap());
		let client = AdminClient::new(&config, Some("127.0.0.1:1111".to_string())).unwrap();
		assert_eq!(client.addr, "127.0.0.1:1111");
	}

	#[test]
	fn admin_client_falls_back_to_config_admin_addr() {
		let mut config = Config::default();
		config.master.admin_bind_addr = Some("127.0.0.1:9090".parse().unwrap());
		let client = AdminClient::new(&config, None).unwrap();
		assert_eq!(client.addr, "127.0.0.1:9090");
	}

	#[test]
	fn admin_client_errors_without_any_master_addr() {
		let config = Config::default();
		assert!(AdminClient::new(&config, None).is_err());
	}

	#[test]
	fn request_attaches_basic_auth_header_when_signkey_set() {
		let mut config = Config::default();
		config.master.admin_bind_addr = Some("127.0.0.1:9090".parse().unwrap());
		config.master.signkey = Some("s3cr3t".to_string());
		let client = AdminClient::new(&config, None).unwrap();
		let req = client.request(Method::GET, "/list/db", None).unwrap();
		assert!(req.headers().contains_key(hyper::header::AUTHORIZATION));
		assert_eq!(req.uri(), "http://127.0.0.1:9090/list/db");
	}

	#[test]
	fn request_omits_auth_header_without_signkey() {
		let mut config = Config::default();
		config.master.admin_bind_addr = Some("127.0.0.1:9090".parse().unwrap());
		let client = AdminClient::new(&config, None).unwrap();
		let req = client.request(Method::GET, "/", None).unwrap();
		assert!(!req.headers().contains_key(hyper::header::AUTHORIZATION));
	}

	#[tokio::test]
	async fn run_ps_requires_node_id() {
		let config = Config::default();
		let err = run_ps(config).await.unwrap_err();
		assert_eq!(err.kind, ErrorKind::RpcParamError);
	}
}

//! Process configuration, loaded from a single TOML file shared by every
//! role. Each role reads its own sub-table; shared fields live at the top
//! level.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::Result;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Directory used for the embedded metadata store and node-local state.
	pub metadata_dir: PathBuf,

	/// Address this process's internal RPC server binds to.
	pub rpc_bind_addr: SocketAddr,

	/// Address advertised to peers, if different from `rpc_bind_addr`
	/// (e.g. behind NAT).
	#[serde(default)]
	pub rpc_public_addr: Option<SocketAddr>,

	/// Shared secret used to distinguish RPC callers across the cluster.
	/// Not a cryptographic identity scheme: the spec's Non-goals exclude
	/// authentication beyond a single shared key.
	#[serde(default)]
	pub rpc_secret: Option<String>,

	#[serde(default)]
	pub master: MasterConfig,
	#[serde(default)]
	pub router: RouterConfig,
	#[serde(default)]
	pub ps: PsConfig,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct MasterConfig {
	/// Address the admin HTTP API listens on.
	pub admin_bind_addr: Option<SocketAddr>,

	/// HTTP Basic Auth password for the `root` user. `None` together with
	/// `skip_auth = true` disables authentication entirely.
	pub signkey: Option<String>,

	#[serde(default)]
	pub skip_auth: bool,

	/// TTL, in seconds, for leases backing `lock/*` keys and id-sequence
	/// leases.
	#[serde(default = "default_lease_ttl_secs")]
	pub lease_ttl_secs: u64,

	/// How long a server's heartbeat lease may go unrenewed before the
	/// failure-detection loop records a `FailServer`.
	#[serde(default = "default_heartbeat_timeout_secs")]
	pub heartbeat_timeout_secs: u64,
}

fn default_lease_ttl_secs() -> u64 {
	300
}

fn default_heartbeat_timeout_secs() -> u64 {
	30
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RouterConfig {
	/// Address the client-facing RPC service listens on.
	pub listen_addr: Option<SocketAddr>,

	#[serde(default = "default_timeout_ms")]
	pub default_timeout_ms: u64,

	#[serde(default = "default_idle_conn_secs")]
	pub idle_conn_secs: u64,
}

fn default_timeout_ms() -> u64 {
	10_000
}

fn default_idle_conn_secs() -> u64 {
	60
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct PsConfig {
	/// This node's cluster-wide id, used both as the `Replica.node_id` the
	/// master places into partition membership and as the `nodeID` this
	/// process registers under.
	pub node_id: Option<u64>,

	pub listen_addr: Option<SocketAddr>,
	pub data_dir: Option<PathBuf>,

	/// Master admin API address this node registers itself against on
	/// startup. Distinct from `rpc_bind_addr`/`rpc_public_addr`, which
	/// describe this process's own address, not the master's.
	pub master_addr: Option<SocketAddr>,

	/// Cluster name sent on `/register`, purely informational on the
	/// master side.
	#[serde(default = "default_cluster_name")]
	pub cluster_name: String,
}

fn default_cluster_name() -> String {
	"default".to_string()
}

impl Default for Config {
	fn default() -> Self {
		Config {
			metadata_dir: PathBuf::from("./meridian-meta"),
			rpc_bind_addr: "127.0.0.1:7000".parse().unwrap(),
			rpc_public_addr: None,
			rpc_secret: None,
			master: MasterConfig::default(),
			router: RouterConfig::default(),
			ps: PsConfig::default(),
		}
	}
}

pub fn read_config(path: impl AsRef<Path>) -> Result<Config> {
	let data = std::fs::read_to_string(path.as_ref())?;
	let config: Config = toml::from_str(&data)?;
	Ok(config)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_minimal_config() {
		let toml_str = r#"
			metadata_dir = "/var/lib/meridian"
			rpc_bind_addr = "0.0.0.0:7000"
		"#;
		let config: Config = toml::from_str(toml_str).unwrap();
		assert_eq!(config.metadata_dir, PathBuf::from("/var/lib/meridian"));
		assert_eq!(config.master.lease_ttl_secs, 300);
		assert_eq!(config.router.default_timeout_ms, 10_000);
	}

	#[test]
	fn parses_role_sub_tables() {
		let toml_str = r#"
			metadata_dir = "/var/lib/meridian"
			rpc_bind_addr = "0.0.0.0:7000"

			[master]
			signkey = "s3cr3t"
			skip_auth = false

			[router]
			default_timeout_ms = 5000
		"#;
		let config: Config = toml::from_str(toml_str).unwrap();
		assert_eq!(config.master.signkey.as_deref(), Some("s3cr3t"));
		assert_eq!(config.router.default_timeout_ms, 5000);
	}
}

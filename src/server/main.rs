//! `meridian` binary: one process image for all three cluster roles
//! (`master`, `router`, `ps`) plus a thin admin CLI (`status`, `db`,
//! `space`, `server`) that talks to a running master over its admin
//! HTTP API.

#[macro_use]
extern crate tracing;

mod cli;

use std::path::PathBuf;

use structopt::StructOpt;

use cli::Command;

#[derive(StructOpt, Debug)]
#[structopt(name = "meridian", about = "Control plane and request router for a distributed vector-search cluster")]
struct Opt {
	/// Path to the shared TOML configuration file.
	#[structopt(short = "c", long = "config", env = "MERIDIAN_CONFIG_FILE", default_value = "/etc/meridian.toml")]
	config_file: PathBuf,

	/// Overrides `rpc_secret` from the config file.
	#[structopt(long = "rpc-secret", env = "MERIDIAN_RPC_SECRET")]
	rpc_secret: Option<String>,

	/// Overrides `master.signkey` from the config file; also used as the
	/// admin CLI's own HTTP Basic Auth credential against a running master.
	#[structopt(long = "signkey", env = "MERIDIAN_SIGNKEY")]
	signkey: Option<String>,

	/// Master admin API address the CLI subcommands talk to. Defaults to
	/// `master.admin_bind_addr` from the config file.
	#[structopt(short = "h", long = "master-addr", env = "MERIDIAN_MASTER_ADDR")]
	master_addr: Option<String>,

	#[structopt(subcommand)]
	cmd: Command,
}

#[tokio::main]
async fn main() {
	meridian_util::version::init_version(option_env!("CARGO_PKG_VERSION").unwrap_or("unknown"));

	std::panic::set_hook(Box::new(|panic_info| {
		eprintln!("======== PANIC (internal meridian error) ========");
		eprintln!("{}", panic_info);
		eprintln!();
		eprintln!("This is a bug: every fallible path should return a Result, not panic.");
		eprintln!("BACKTRACE:");
		eprintln!("{:?}", backtrace::Backtrace::new());
		std::process::abort();
	}));

	let opt = Opt::from_args();

	if std::env::var("RUST_LOG").is_err() {
		let default_log = match &opt.cmd {
			Command::Master | Command::Router | Command::Ps => "meridian=info",
			_ => "meridian=warn",
		};
		std::env::set_var("RUST_LOG", default_log);
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	let result = cli::run(cli::RunOpt {
		config_file: opt.config_file,
		rpc_secret: opt.rpc_secret,
		signkey: opt.signkey,
		master_addr: opt.master_addr,
		cmd: opt.cmd,
	})
	.await;

	if let Err(e) = result {
		error!("{}", e);
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}

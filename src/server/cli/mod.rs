//! CLI surface: one subcommand per cluster role (`master`/`router`/`ps`)
//! plus thin admin subcommands (`status`/`db`/`space`/`server`) that act
//! as an HTTP client against a running master's admin API.

pub mod cmd;

pub use cmd::{run, Command, DbCommand, RunOpt, ServerCommand, SpaceCommand};

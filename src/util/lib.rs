//! Shared utilities used by every Meridian crate: the error type, TOML
//! configuration loading, time/lease helpers and build version info.

pub mod config;
pub mod error;
pub mod time;
pub mod version;

pub use error::{Error, ErrorKind};

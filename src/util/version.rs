//! Build version string, set once at process startup from the CLI binary
//! so every role reports the same value in logs and admin responses.

use std::sync::OnceLock;

static VERSION: OnceLock<String> = OnceLock::new();

pub fn init_version(v: impl Into<String>) {
	let _ = VERSION.set(v.into());
}

pub fn meridian_version() -> &'static str {
	VERSION.get().map(String::as_str).unwrap_or("unknown")
}

//! A single tagged-variant error type shared by every Meridian crate.
//!
//! Clients must never pattern-match on `msg`; `kind` carries the stable
//! numeric code that crosses the wire in `PartitionData.err`, and
//! `redirect` carries the JSON-encoded `Replica` payload that accompanies
//! `PartitionNotLeader`.

use std::fmt;

use err_derive::Error as DeriveError;

/// Stable numeric error codes, grouped the way callers are expected to
/// branch on them: transient/retriable, client fault, placement capacity,
/// engine, internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorKind {
	PartitionNoLeader = 100,
	PartitionNotLeader = 101,
	ServiceUnavailable = 102,
	Timeout = 103,

	RpcParamError = 200,
	PrimaryIsInvalid = 201,
	DupSpace = 202,
	DbNotEmpty = 203,
	SpaceNotExists = 204,
	DbNotExists = 205,
	AuthenticationFailed = 206,
	NotEqualsByField = 207,

	MasterPsNotEnoughSelect = 300,

	GammaSearchQueryNumLess0 = 400,
	GammaSearchNoCreateIndex = 401,
	GammaSearchIndexQueryErr = 402,
	GammaSearchOtherErr = 403,

	PartitionDuplicate = 500,

	InternalError = 900,
	Recover = 901,
	CreateRpcClientFailed = 902,
}

impl ErrorKind {
	pub fn code(self) -> u16 {
		self as u16
	}

	/// Reconstructs a kind from the numeric code carried over the wire in
	/// `PartitionData.err`. Unknown codes collapse to `InternalError` rather
	/// than failing decode — a newer peer's error kind must not crash an
	/// older one.
	pub fn from_code(code: u16) -> ErrorKind {
		match code {
			100 => ErrorKind::PartitionNoLeader,
			101 => ErrorKind::PartitionNotLeader,
			102 => ErrorKind::ServiceUnavailable,
			103 => ErrorKind::Timeout,
			200 => ErrorKind::RpcParamError,
			201 => ErrorKind::PrimaryIsInvalid,
			202 => ErrorKind::DupSpace,
			203 => ErrorKind::DbNotEmpty,
			204 => ErrorKind::SpaceNotExists,
			205 => ErrorKind::DbNotExists,
			206 => ErrorKind::AuthenticationFailed,
			207 => ErrorKind::NotEqualsByField,
			300 => ErrorKind::MasterPsNotEnoughSelect,
			400 => ErrorKind::GammaSearchQueryNumLess0,
			401 => ErrorKind::GammaSearchNoCreateIndex,
			402 => ErrorKind::GammaSearchIndexQueryErr,
			403 => ErrorKind::GammaSearchOtherErr,
			500 => ErrorKind::PartitionDuplicate,
			901 => ErrorKind::Recover,
			902 => ErrorKind::CreateRpcClientFailed,
			_ => ErrorKind::InternalError,
		}
	}

	/// Transient conditions the caller is expected to retry, as opposed to
	/// surfacing the failure to its own caller.
	pub fn is_retriable(self) -> bool {
		matches!(
			self,
			ErrorKind::PartitionNoLeader
				| ErrorKind::PartitionNotLeader
				| ErrorKind::ServiceUnavailable
				| ErrorKind::Timeout
		)
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}({})", self, self.code())
	}
}

/// Wraps lower-level failures so `Error` always has a stable `kind` even
/// when the proximate cause came from I/O or (de)serialization.
#[derive(Debug, DeriveError)]
pub enum Cause {
	#[error(display = "I/O error: {}", _0)]
	Io(#[error(source)] std::io::Error),
	#[error(display = "JSON error: {}", _0)]
	Json(#[error(source)] serde_json::Error),
	#[error(display = "msgpack encode error: {}", _0)]
	MsgPackEncode(#[error(source)] rmp_serde::encode::Error),
	#[error(display = "msgpack decode error: {}", _0)]
	MsgPackDecode(#[error(source)] rmp_serde::decode::Error),
	#[error(display = "TOML error: {}", _0)]
	Toml(#[error(source)] toml::de::Error),
	#[error(display = "storage engine error: {}", _0)]
	Db(#[error(source)] meridian_db::Error),
}

#[derive(Debug, Clone)]
pub struct Error {
	pub kind: ErrorKind,
	pub msg: String,
	/// JSON-encoded `Replica` of the believed leader; only meaningful when
	/// `kind == PartitionNotLeader`.
	pub redirect: Option<String>,
}

impl Error {
	pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
		Error {
			kind,
			msg: msg.into(),
			redirect: None,
		}
	}

	pub fn with_redirect(msg: impl Into<String>, redirect_json: impl Into<String>) -> Self {
		Error {
			kind: ErrorKind::PartitionNotLeader,
			msg: msg.into(),
			redirect: Some(redirect_json.into()),
		}
	}

	pub fn message(msg: impl Into<String>) -> Self {
		Error::new(ErrorKind::InternalError, msg)
	}

	/// Converts a caught panic payload into the `RECOVER` error kind, per
	/// the propagation policy: panics never cross a handler boundary.
	pub fn recovered(panic_msg: impl Into<String>) -> Self {
		Error::new(ErrorKind::Recover, panic_msg)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "[{}] {}", self.kind, self.msg)
	}
}

impl std::error::Error for Error {}

impl From<Cause> for Error {
	fn from(cause: Cause) -> Self {
		Error::new(ErrorKind::InternalError, cause.to_string())
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Cause::Io(e).into()
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Self {
		Cause::Json(e).into()
	}
}

impl From<rmp_serde::encode::Error> for Error {
	fn from(e: rmp_serde::encode::Error) -> Self {
		Cause::MsgPackEncode(e).into()
	}
}

impl From<rmp_serde::decode::Error> for Error {
	fn from(e: rmp_serde::decode::Error) -> Self {
		Cause::MsgPackDecode(e).into()
	}
}

impl From<toml::de::Error> for Error {
	fn from(e: toml::de::Error) -> Self {
		Cause::Toml(e).into()
	}
}

impl From<meridian_db::Error> for Error {
	fn from(e: meridian_db::Error) -> Self {
		Cause::Db(e).into()
	}
}

impl From<String> for Error {
	fn from(msg: String) -> Self {
		Error::message(msg)
	}
}

impl From<&str> for Error {
	fn from(msg: &str) -> Self {
		Error::message(msg.to_string())
	}
}

pub type Result<T> = std::result::Result<T, Error>;

/// Mirrors the teacher's `OkOrMessage` convenience for turning `Option` into
/// a crate `Result` without an intermediate `.ok_or_else(...)` closure.
pub trait OkOrMessage<T> {
	fn ok_or_message<M: Into<String>>(self, msg: M) -> Result<T>;
}

impl<T> OkOrMessage<T> for Option<T> {
	fn ok_or_message<M: Into<String>>(self, msg: M) -> Result<T> {
		self.ok_or_else(|| Error::message(msg.into()))
	}
}

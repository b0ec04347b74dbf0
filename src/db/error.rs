use err_derive::Error as DeriveError;

#[derive(Debug, DeriveError)]
pub enum Error {
	#[error(display = "storage engine I/O error: {}", _0)]
	Io(#[error(source)] std::io::Error),
	#[cfg(feature = "sled")]
	#[error(display = "sled error: {}", _0)]
	Sled(#[error(source)] sled::Error),
	#[error(display = "serialization error: {}", _0)]
	Serialization(#[error(source)] serde_json::Error),
	#[error(display = "transaction aborted: {}", _0)]
	TransactionAborted(String),
	#[error(display = "lock {} held by another owner until lease expiry", _0)]
	LockHeld(String),
}

pub type Result<T> = std::result::Result<T, Error>;

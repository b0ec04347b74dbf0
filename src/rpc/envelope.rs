//! Wire envelope carried by every partition-server call, and the handler
//! name constants both sides dispatch on.

use serde::{Deserialize, Serialize};

use meridian_util::error::{Error, ErrorKind};

pub const UNARY_HANDLER: &str = "UnaryHandler";

pub const SEARCH_HANDLER: &str = "SearchHandler";
pub const BULK_SEARCH_HANDLER: &str = "BulkSearchHandler";
pub const DELETE_BY_QUERY_HANDLER: &str = "DeleteByQueryHandler";
pub const MSEARCH_HANDLER: &str = "MSearchHandler";
pub const MSEARCH_IDS_HANDLER: &str = "MSearchIDsHandler";
pub const STREAM_SEARCH_HANDLER: &str = "StreamSearchHandler";

pub const GET_DOC_HANDLER: &str = "GetDocHandler";
pub const GET_DOCS_HANDLER: &str = "GetDocsHandler";
pub const CREATE_DOC_HANDLER: &str = "CreateDocHandler";
pub const DELETE_DOCS_HANDLER: &str = "DeleteDocsHandler";
pub const REPLACE_DOC_HANDLER: &str = "ReplaceDocHandler";
pub const BATCH_HANDLER: &str = "BatchHandler";
pub const FORCE_MERGE_HANDLER: &str = "ForceMergeHandler";

pub const CREATE_PARTITION_HANDLER: &str = "CreatePartitionHandler";
pub const DELETE_PARTITION_HANDLER: &str = "DeletePartitionHandler";
pub const DELETE_REPLICA_HANDLER: &str = "DeleteReplicaHandler";
pub const UPDATE_PARTITION_HANDLER: &str = "UpdatePartitionHandler";
pub const STATS_HANDLER: &str = "StatsHandler";
pub const IS_LIVE_HANDLER: &str = "IsLiveHandler";
pub const PARTITION_INFO_HANDLER: &str = "PartitionInfoHandler";
pub const CHANGE_MEMBER_HANDLER: &str = "ChangeMemberHandler";
pub const REGISTER_PARTITION_HANDLER: &str = "RegisterPartitionHandler";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WireError {
	pub code: u16,
	pub msg: String,
}

/// The envelope every handler receives and returns. `data` is an
/// opaque, handler-specific msgpack payload; only `partition_id` and
/// `err` are interpreted generically by the client and the
/// not-leader-redirect middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionData {
	pub partition_id: u64,
	#[serde(default)]
	pub data: Vec<u8>,
	#[serde(default)]
	pub err: Option<WireError>,
}

impl PartitionData {
	pub fn request(partition_id: u64, data: Vec<u8>) -> Self {
		PartitionData { partition_id, data, err: None }
	}

	pub fn ok(partition_id: u64, data: Vec<u8>) -> Self {
		PartitionData { partition_id, data, err: None }
	}

	pub fn from_error(partition_id: u64, err: &Error) -> Self {
		let msg = err.redirect.clone().unwrap_or_else(|| err.msg.clone());
		PartitionData {
			partition_id,
			data: Vec::new(),
			err: Some(WireError { code: err.kind.code(), msg }),
		}
	}

	/// Collapses the envelope back into a `Result`, the inverse of
	/// `from_error`. The redirect payload (a JSON-encoded `Replica`) is
	/// preserved so the leader-chasing client can parse it out again.
	pub fn into_result(self) -> Result<Vec<u8>, Error> {
		match self.err {
			None => Ok(self.data),
			Some(WireError { code, msg }) => {
				let kind = ErrorKind::from_code(code);
				if kind == ErrorKind::PartitionNotLeader {
					Err(Error::with_redirect(msg.clone(), msg))
				} else {
					Err(Error::new(kind, msg))
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_roundtrips_through_the_envelope() {
		let err = Error::new(ErrorKind::Timeout, "deadline exceeded");
		let env = PartitionData::from_error(7, &err);
		assert_eq!(env.partition_id, 7);
		let back = env.into_result().unwrap_err();
		assert_eq!(back.kind, ErrorKind::Timeout);
	}

	#[test]
	fn redirect_payload_survives_the_roundtrip() {
		let err = Error::with_redirect("moved", "{\"nodeId\":9}");
		let env = PartitionData::from_error(1, &err);
		let back = env.into_result().unwrap_err();
		assert_eq!(back.kind, ErrorKind::PartitionNotLeader);
		assert_eq!(back.redirect.as_deref(), Some("{\"nodeId\":9}"));
	}

	#[test]
	fn success_carries_data_through_untouched() {
		let env = PartitionData::ok(3, vec![1, 2, 3]);
		assert_eq!(env.into_result().unwrap(), vec![1, 2, 3]);
	}
}

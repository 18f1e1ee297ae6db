use serde::{Deserialize, Serialize};

use crate::{
	checksum::BucketChecksum,
	ops::{BucketName, BucketPriority, OpId, OplogEntry},
};

/// One line of the streaming sync protocol.
///
/// Serialized externally tagged, so each line is a single-key JSON object
/// (`{"checkpoint": …}`, `{"data": …}`, …) matching what clients parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLine {
	Checkpoint(StreamingCheckpoint),
	CheckpointDiff(StreamingCheckpointDiff),
	CheckpointComplete(CheckpointComplete),
	PartialCheckpointComplete(PartialCheckpointComplete),
	Data(SyncBucketData),
	TokenExpires {},
}

/// Full checkpoint description, sent on the first line of a connection and
/// whenever the server cannot express the change as a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingCheckpoint {
	pub last_op_id: OpId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub write_checkpoint: Option<OpId>,
	pub buckets: Vec<BucketChecksum>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingCheckpointDiff {
	pub last_op_id: OpId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub write_checkpoint: Option<OpId>,
	pub updated_buckets: Vec<BucketChecksum>,
	pub removed_buckets: Vec<BucketName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointComplete {
	pub last_op_id: OpId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCheckpointComplete {
	pub last_op_id: OpId,
	pub priority: BucketPriority,
}

/// One batch of ops for a single bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBucketData {
	pub bucket: BucketName,
	pub after: OpId,
	pub next_after: OpId,
	pub has_more: bool,
	pub data: Vec<OplogEntry>,
}

/// Client request body for the streaming sync endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingSyncRequest {
	/// Bucket positions the client already holds.
	#[serde(default)]
	pub buckets: Vec<BucketRequest>,
	#[serde(default)]
	pub client_id: Option<String>,
	#[serde(default)]
	pub raw_data: bool,
	#[serde(default)]
	pub binary_data: bool,
	#[serde(default = "default_true")]
	pub include_checksum: bool,
	/// Free-form connection parameters merged into the token parameters.
	#[serde(default)]
	pub parameters: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Default for StreamingSyncRequest {
	fn default() -> Self {
		Self {
			buckets: Vec::new(),
			client_id: None,
			raw_data: false,
			binary_data: false,
			include_checksum: true,
			parameters: None,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketRequest {
	pub name: BucketName,
	pub after: OpId,
}

fn default_true() -> bool {
	true
}

use serde::Serialize;
use serde_json::value::RawValue;

use crate::{
	checksum::{BucketChecksum, Checksum},
	frames::{SyncBucketData, SyncLine},
	ops::{OpId, OpType, OplogEntry},
};

/// Wire payload encoding, selected per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFlavor {
	/// JSON lines; row `data` fields are embedded as literal JSON so numeric
	/// precision in the source document survives untouched.
	#[default]
	LegacyJson,
	/// JSON lines; row `data` stays an already-quoted JSON string.
	RawData,
	/// BSON documents; `op_id` and `checksum` stay numeric.
	BinaryData,
}

impl PayloadFlavor {
	#[must_use]
	pub fn from_request(raw_data: bool, binary_data: bool) -> Self {
		if binary_data {
			Self::BinaryData
		} else if raw_data {
			Self::RawData
		} else {
			Self::LegacyJson
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
	#[error("failed to encode sync line as JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("failed to encode sync line as BSON: {0}")]
	Bson(#[from] bson::ser::Error),
}

/// A single encoded frame, ready for the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
	Text(String),
	Binary(Vec<u8>),
}

impl EncodedFrame {
	#[must_use]
	pub fn len(&self) -> usize {
		match self {
			Self::Text(text) => text.len(),
			Self::Binary(bytes) => bytes.len(),
		}
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

pub fn encode_line(line: &SyncLine, flavor: PayloadFlavor) -> Result<EncodedFrame, EncodeError> {
	match flavor {
		PayloadFlavor::RawData => Ok(EncodedFrame::Text(serde_json::to_string(line)?)),
		PayloadFlavor::BinaryData => Ok(EncodedFrame::Binary(bson::to_vec(&BinaryLine::from(
			line,
		))?)),
		PayloadFlavor::LegacyJson => match line {
			SyncLine::Data(batch) => Ok(EncodedFrame::Text(serde_json::to_string(
				&LegacyDataLine {
					data: LegacyBatch::from(batch),
				},
			)?)),
			other => Ok(EncodedFrame::Text(serde_json::to_string(other)?)),
		},
	}
}

#[derive(Serialize)]
struct LegacyDataLine<'a> {
	data: LegacyBatch<'a>,
}

#[derive(Serialize)]
struct LegacyBatch<'a> {
	bucket: &'a str,
	after: OpId,
	next_after: OpId,
	has_more: bool,
	data: Vec<LegacyEntry<'a>>,
}

#[derive(Serialize)]
struct LegacyEntry<'a> {
	op_id: OpId,
	op: OpType,
	#[serde(skip_serializing_if = "Option::is_none")]
	object_type: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	object_id: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	subkey: Option<&'a str>,
	checksum: Checksum,
	data: Option<LegacyData>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum LegacyData {
	Embedded(Box<RawValue>),
	Text(String),
}

impl<'a> From<&'a SyncBucketData> for LegacyBatch<'a> {
	fn from(batch: &'a SyncBucketData) -> Self {
		Self {
			bucket: &batch.bucket,
			after: batch.after,
			next_after: batch.next_after,
			has_more: batch.has_more,
			data: batch
				.data
				.iter()
				.map(|entry| LegacyEntry {
					op_id: entry.op_id,
					op: entry.op,
					object_type: entry.object_type.as_deref(),
					object_id: entry.object_id.as_deref(),
					subkey: entry.subkey.as_deref(),
					checksum: entry.checksum,
					data: entry.data.as_ref().map(|data| {
						// Row payloads are JSON we serialized ourselves; anything
						// else falls back to a plain string.
						RawValue::from_string(data.clone()).map_or_else(
							|_| LegacyData::Text(data.clone()),
							LegacyData::Embedded,
						)
					}),
				})
				.collect(),
		}
	}
}

/// BSON wire mirror of [`SyncLine`]: same field layout as the JSON flavors,
/// but `op_id`, `count`, and `checksum` are carried as native BSON integers.
/// BSON has no unsigned 64-bit type; op ids are sequence-assigned and fit in
/// an int64.
#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum BinaryLine<'a> {
	Checkpoint {
		last_op_id: i64,
		#[serde(skip_serializing_if = "Option::is_none")]
		write_checkpoint: Option<i64>,
		buckets: Vec<BinaryBucketChecksum<'a>>,
	},
	CheckpointDiff {
		last_op_id: i64,
		#[serde(skip_serializing_if = "Option::is_none")]
		write_checkpoint: Option<i64>,
		updated_buckets: Vec<BinaryBucketChecksum<'a>>,
		removed_buckets: &'a [String],
	},
	CheckpointComplete {
		last_op_id: i64,
	},
	PartialCheckpointComplete {
		last_op_id: i64,
		priority: i32,
	},
	Data(BinaryBatch<'a>),
	TokenExpires {},
}

#[derive(Serialize)]
struct BinaryBucketChecksum<'a> {
	bucket: &'a str,
	checksum: i32,
	count: i64,
	priority: i32,
}

#[derive(Serialize)]
struct BinaryBatch<'a> {
	bucket: &'a str,
	after: i64,
	next_after: i64,
	has_more: bool,
	data: Vec<BinaryEntry<'a>>,
}

#[derive(Serialize)]
struct BinaryEntry<'a> {
	op_id: i64,
	op: OpType,
	#[serde(skip_serializing_if = "Option::is_none")]
	object_type: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	object_id: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	subkey: Option<&'a str>,
	checksum: i32,
	data: Option<&'a str>,
}

fn int64(op_id: OpId) -> i64 {
	op_id.0 as i64
}

impl<'a> From<&'a SyncLine> for BinaryLine<'a> {
	fn from(line: &'a SyncLine) -> Self {
		match line {
			SyncLine::Checkpoint(checkpoint) => Self::Checkpoint {
				last_op_id: int64(checkpoint.last_op_id),
				write_checkpoint: checkpoint.write_checkpoint.map(int64),
				buckets: checkpoint
					.buckets
					.iter()
					.map(BinaryBucketChecksum::from)
					.collect(),
			},
			SyncLine::CheckpointDiff(diff) => Self::CheckpointDiff {
				last_op_id: int64(diff.last_op_id),
				write_checkpoint: diff.write_checkpoint.map(int64),
				updated_buckets: diff
					.updated_buckets
					.iter()
					.map(BinaryBucketChecksum::from)
					.collect(),
				removed_buckets: &diff.removed_buckets,
			},
			SyncLine::CheckpointComplete(complete) => Self::CheckpointComplete {
				last_op_id: int64(complete.last_op_id),
			},
			SyncLine::PartialCheckpointComplete(partial) => Self::PartialCheckpointComplete {
				last_op_id: int64(partial.last_op_id),
				priority: i32::from(partial.priority.value()),
			},
			SyncLine::Data(batch) => Self::Data(BinaryBatch {
				bucket: &batch.bucket,
				after: int64(batch.after),
				next_after: int64(batch.next_after),
				has_more: batch.has_more,
				data: batch.data.iter().map(BinaryEntry::from).collect(),
			}),
			SyncLine::TokenExpires {} => Self::TokenExpires {},
		}
	}
}

impl<'a> From<&'a BucketChecksum> for BinaryBucketChecksum<'a> {
	fn from(bucket: &'a BucketChecksum) -> Self {
		Self {
			bucket: &bucket.bucket,
			checksum: bucket.checksum.to_wire(),
			count: bucket.count as i64,
			priority: i32::from(bucket.priority.value()),
		}
	}
}

impl<'a> From<&'a OplogEntry> for BinaryEntry<'a> {
	fn from(entry: &'a OplogEntry) -> Self {
		Self {
			op_id: int64(entry.op_id),
			op: entry.op,
			object_type: entry.object_type.as_deref(),
			object_id: entry.object_id.as_deref(),
			subkey: entry.subkey.as_deref(),
			checksum: entry.checksum.to_wire(),
			data: entry.data.as_deref(),
		}
	}
}

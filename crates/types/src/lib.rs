//! Shared wire and domain types for the opsync pipeline: op ids, checksums,
//! LSNs, bucket metadata and the streaming sync frames.

pub mod checksum;
pub mod encode;
pub mod frames;
pub mod lsn;
pub mod ops;

pub use checksum::{op_checksum, BucketChecksum, Checksum, PartialChecksum};
pub use encode::{EncodeError, EncodedFrame, PayloadFlavor};
pub use frames::{
	BucketRequest, CheckpointComplete, PartialCheckpointComplete, StreamingCheckpoint,
	StreamingCheckpointDiff, StreamingSyncRequest, SyncBucketData, SyncLine,
};
pub use lsn::Lsn;
pub use ops::{BucketName, BucketPriority, OpId, OpType, OplogEntry};

//! Storage adapter contract for the sync pipeline, plus the in-memory engine.
//!
//! The pipeline only ever talks to [`BucketStorage`]; everything about the
//! durable layout (bucket ops, current row images, parameter lookups,
//! checkpoint state) is behind this trait so alternative engines can be
//! plugged in without touching replication or streaming code.

pub mod adapter;
pub mod error;
pub mod memory;

pub use adapter::{
	ActiveCheckpoint, ActiveRulesHandle, BatchLimits, BucketDataChunk, BucketOpWrite,
	BucketStorage, CheckpointStateUpdate, CheckpointUpdate, CurrentBucket, CurrentDataRecord,
	CurrentDataWrite, FlushResult, GroupId, OpRange, ParameterRowWrite, SourceTableHandle,
	SourceTableId, SourceTableIdentity, SyncRulesStatus, WriteBatch,
};
pub use error::StorageError;
pub use memory::MemoryBucketStorage;

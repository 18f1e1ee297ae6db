#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::dbg_macro
)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

//! The sync streaming core: per-connection checkpoint lines, prioritized
//! bucket data delivery, checksum caching, and the shared checkpoint
//! demultiplexer.

pub mod checksum_cache;
pub mod connection;
pub mod demux;
pub mod orchestrator;
pub mod resolver;

use std::time::Duration;

use opsync_storage::BatchLimits;
use opsync_types::BucketName;

pub use checksum_cache::ChecksumCache;
pub use connection::{CheckpointLine, ConnectionState};
pub use demux::{CheckpointDemux, CheckpointSubscription, CheckpointWatch};
pub use orchestrator::{StreamEvent, SyncStreamParams, SyncStreamService};
pub use resolver::{BucketParameterResolver, BucketUpdates, ResolvedBuckets};

#[derive(Debug, thiserror::Error)]
pub enum SyncStreamError {
	#[error("connection resolves {count} buckets, over the limit of {max}")]
	TooManyBuckets { count: usize, max: usize },
	#[error("parameter queries returned {count} results, over the limit of {max}")]
	TooManyParameterResults { count: usize, max: usize },
	#[error("timed out waiting for a data-fetch slot")]
	SyncLockTimeout,
	#[error("no active sync rules")]
	NoActiveSyncRules,
	/// A bucket the checkpoint advertises has no checksum; an invariant
	/// breach the process must not paper over.
	#[error("bucket {0:?} has no checksum at the requested checkpoint")]
	MissingChecksum(BucketName),
	#[error("checkpoint watcher failed: {0}")]
	Watcher(String),
	#[error(transparent)]
	Storage(#[from] opsync_storage::StorageError),
}

impl SyncStreamError {
	#[must_use]
	pub fn code(&self) -> &'static str {
		match self {
			Self::TooManyBuckets { .. } => "TOO_MANY_BUCKETS",
			Self::TooManyParameterResults { .. } => "TOO_MANY_PARAMETER_RESULTS",
			Self::SyncLockTimeout => "SYNC_LOCK_TIMEOUT",
			Self::NoActiveSyncRules => "NO_ACTIVE_SYNC_RULES",
			Self::MissingChecksum(_) => "ASSERTION",
			Self::Watcher(_) => "FATAL_STORAGE_ERROR",
			Self::Storage(e) => e.code(),
		}
	}
}

/// Limits and pacing knobs of the streaming core.
#[derive(Debug, Clone)]
pub struct SyncStreamTuning {
	pub max_buckets_per_connection: usize,
	pub max_parameter_query_results: usize,
	/// Global cap on concurrent data fetches across all connections.
	pub max_active_connections: usize,
	/// Hard limit on waiting for a data-fetch slot.
	pub fetch_timeout: Duration,
	/// Minimum ops sent (after the first priority completes) before a new
	/// checkpoint may preempt the running batch.
	pub preempt_after_ops: usize,
	/// Breather between checkpoint cycles to avoid hot spinning.
	pub yield_interval: Duration,
	/// Frames at least this large are followed by a flush hint so buffers
	/// upstream can be released.
	pub flush_hint_bytes: usize,
	pub batch_limits: BatchLimits,
	pub checksum_cache_capacity: usize,
}

impl Default for SyncStreamTuning {
	fn default() -> Self {
		Self {
			max_buckets_per_connection: 1000,
			max_parameter_query_results: 1000,
			max_active_connections: 10,
			fetch_timeout: Duration::from_secs(30),
			preempt_after_ops: 1000,
			yield_interval: Duration::from_millis(10),
			flush_hint_bytes: 50 * 1024,
			batch_limits: BatchLimits::default(),
			checksum_cache_capacity: 10_000,
		}
	}
}

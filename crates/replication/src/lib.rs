//! Replication batch writer: turns source change events into bucket ops and
//! current-data mutations, committed atomically per source transaction.

pub mod runner;
pub mod source;
pub mod writer;

pub use runner::{run_replication, ReplicationEvent};
pub use source::SourceChange;
pub use writer::{BatchWriter, CommitStatus, WriterTuning};

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
	/// Serialized row exceeded the size ceiling; the row is replaced with a
	/// placeholder and replication continues, so this only surfaces through
	/// telemetry.
	#[error("row in {table:?} serialized to {size} bytes, over the limit")]
	RowTooLarge { table: String, size: usize },
	#[error("replication slot {slot:?} is missing on the source")]
	ReplicationSlotMissing { slot: String },
	#[error("replication write gave up after {tries} attempts")]
	MaxTransactionRetries { tries: u32 },
	#[error("replication assertion failed: {0}")]
	Assertion(String),
	#[error(transparent)]
	Storage(#[from] opsync_storage::StorageError),
	#[error(transparent)]
	Rules(#[from] opsync_rules::RulesError),
}

impl ReplicationError {
	#[must_use]
	pub fn code(&self) -> &'static str {
		match self {
			Self::RowTooLarge { .. } => "ROW_TOO_LARGE",
			Self::ReplicationSlotMissing { .. } => "REPLICATION_SLOT_MISSING",
			Self::MaxTransactionRetries { .. } => "MAX_TX_RETRIES",
			Self::Assertion(_) => "ASSERTION",
			Self::Storage(e) => e.code(),
			Self::Rules(_) => "ASSERTION",
		}
	}
}

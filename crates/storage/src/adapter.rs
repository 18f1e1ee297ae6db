use std::{
	collections::{BTreeMap, BTreeSet},
	fmt,
	sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use opsync_rules::{Lookup, ParameterSet, SyncRuleState, SyncRules};
use opsync_types::{
	BucketName, Checksum, Lsn, OpId, OpType, PartialChecksum, SyncBucketData,
};

use crate::error::StorageError;

/// Identifier of one sync-rules version; every durable row is scoped to the
/// group that wrote it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "group {}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceTableId(pub Uuid);

impl fmt::Display for SourceTableId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// What makes a replicated table "the same table" across schema changes.
/// Any mismatch beyond `relation_id` drops the old identity's data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTableIdentity {
	pub connection_id: u32,
	pub relation_id: Option<u32>,
	pub schema: String,
	pub name: String,
	pub replica_id_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SourceTableHandle {
	pub id: SourceTableId,
	pub group: GroupId,
	pub identity: SourceTableIdentity,
}

/// One bucket op staged for an atomic batch write. The storage layer assigns
/// the op id at flush time, in batch order.
#[derive(Debug, Clone)]
pub struct BucketOpWrite {
	pub bucket: BucketName,
	pub op: OpType,
	pub source_table: Option<SourceTableId>,
	pub source_key: Option<String>,
	pub object_type: Option<String>,
	pub object_id: Option<String>,
	pub subkey: Option<String>,
	pub checksum: Checksum,
	pub data: Option<String>,
	pub target_op: Option<OpId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentBucket {
	pub bucket: BucketName,
	pub object_type: String,
	pub object_id: String,
}

/// Latest known image of one replicated row: its serialized form, current
/// bucket membership, and the parameter lookups it feeds.
#[derive(Debug, Clone, Default)]
pub struct CurrentDataRecord {
	pub data: String,
	pub buckets: Vec<CurrentBucket>,
	pub lookups: Vec<Lookup>,
}

#[derive(Debug, Clone)]
pub struct CurrentDataWrite {
	pub table: SourceTableId,
	pub key: String,
	/// `None` erases the record.
	pub value: Option<CurrentDataRecord>,
}

#[derive(Debug, Clone)]
pub struct ParameterRowWrite {
	pub lookup: Lookup,
	pub table: SourceTableId,
	pub key: String,
	/// `None` erases the row.
	pub value: Option<ParameterSet>,
}

/// The atomic unit of replication output: bucket ops, current-data mutations
/// and parameter-row mutations applied together or not at all.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
	pub ops: Vec<BucketOpWrite>,
	pub current_data: Vec<CurrentDataWrite>,
	pub parameter_rows: Vec<ParameterRowWrite>,
}

impl WriteBatch {
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.ops.is_empty() && self.current_data.is_empty() && self.parameter_rows.is_empty()
	}
}

#[derive(Debug, Clone, Copy)]
pub struct FlushResult {
	/// Highest op id assigned by this batch, if it contained ops.
	pub last_op_id: Option<OpId>,
}

/// Durable checkpoint state of one sync-rules version.
#[derive(Debug, Clone)]
pub struct SyncRulesStatus {
	pub state: SyncRuleState,
	pub last_checkpoint: Option<OpId>,
	pub last_checkpoint_lsn: Option<Lsn>,
	pub no_checkpoint_before: Option<Lsn>,
	pub keepalive_op: Option<OpId>,
	pub snapshot_done: bool,
	pub last_fatal_error: Option<String>,
}

/// Partial update of [`SyncRulesStatus`]; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct CheckpointStateUpdate {
	pub last_checkpoint: Option<OpId>,
	pub last_checkpoint_lsn: Option<Lsn>,
	pub no_checkpoint_before: Option<Lsn>,
	pub keepalive_op: Option<Option<OpId>>,
	pub snapshot_done: Option<bool>,
	pub last_fatal_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCheckpoint {
	pub group: GroupId,
	pub checkpoint: OpId,
	pub lsn: Lsn,
}

/// Broadcast to checkpoint watchers whenever the active checkpoint moves.
#[derive(Debug, Clone)]
pub struct CheckpointUpdate {
	pub checkpoint: ActiveCheckpoint,
	/// Buckets with new ops since the previous notification.
	pub updated_buckets: Arc<BTreeSet<BucketName>>,
	/// Parameter lookups written since the previous notification.
	pub updated_parameter_lookups: Arc<BTreeSet<Lookup>>,
	/// Set when incremental tracking is unavailable (activation, restart);
	/// watchers must re-evaluate everything.
	pub invalidate_all: bool,
}

/// Half-open op range `(after, until]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRange {
	pub after: OpId,
	pub until: OpId,
}

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
	/// Upper bound on ops returned by one `get_bucket_data_batch` call.
	pub total_ops: usize,
	/// Soft byte budget per bucket chunk.
	pub chunk_bytes: usize,
}

impl Default for BatchLimits {
	fn default() -> Self {
		Self {
			total_ops: 1000,
			chunk_bytes: 1024 * 1024,
		}
	}
}

/// One bucket chunk returned to the orchestrator. `target_op` is the highest
/// op id any contained `MOVE`/`CLEAR` points at; a value past the requested
/// checkpoint means the checkpoint can no longer be completed.
#[derive(Debug, Clone)]
pub struct BucketDataChunk {
	pub batch: SyncBucketData,
	pub target_op: Option<OpId>,
}

#[derive(Clone)]
pub struct ActiveRulesHandle {
	pub group: GroupId,
	pub rules: Arc<SyncRules>,
}

/// The storage operations the sync pipeline consumes.
#[async_trait]
pub trait BucketStorage: Send + Sync + 'static {
	// Sync rules lifecycle

	async fn create_sync_rules(&self, rules: SyncRules) -> Result<GroupId, StorageError>;

	async fn active_rules(&self) -> Result<Option<ActiveRulesHandle>, StorageError>;

	async fn group_rules(&self, group: GroupId) -> Result<ActiveRulesHandle, StorageError>;

	async fn sync_rules_status(&self, group: GroupId) -> Result<SyncRulesStatus, StorageError>;

	async fn update_checkpoint_state(
		&self,
		group: GroupId,
		update: CheckpointStateUpdate,
	) -> Result<(), StorageError>;

	/// Promote `group` to ACTIVE, demoting any previously active or errored
	/// version to STOP in the same transaction.
	async fn activate_sync_rules(&self, group: GroupId) -> Result<(), StorageError>;

	// Source tables

	async fn resolve_source_table(
		&self,
		group: GroupId,
		identity: SourceTableIdentity,
	) -> Result<SourceTableHandle, StorageError>;

	// Replication writes

	async fn write_batch(
		&self,
		group: GroupId,
		batch: WriteBatch,
	) -> Result<FlushResult, StorageError>;

	async fn get_current_data(
		&self,
		group: GroupId,
		table: SourceTableId,
		key: &str,
	) -> Result<Option<CurrentDataRecord>, StorageError>;

	async fn scan_current_data(
		&self,
		group: GroupId,
		table: SourceTableId,
		after_key: Option<&str>,
		limit: usize,
	) -> Result<Vec<(String, CurrentDataRecord)>, StorageError>;

	/// Queue a row for re-reading from the source database.
	async fn mark_record_unavailable(
		&self,
		group: GroupId,
		table: SourceTableId,
		key: &str,
	) -> Result<(), StorageError>;

	async fn pending_resnapshots(
		&self,
		group: GroupId,
		table: SourceTableId,
	) -> Result<Vec<String>, StorageError>;

	// Streaming reads

	async fn sum_checksum(
		&self,
		group: GroupId,
		bucket: &str,
		range: OpRange,
	) -> Result<PartialChecksum, StorageError>;

	async fn get_bucket_data_batch(
		&self,
		group: GroupId,
		checkpoint: OpId,
		positions: &BTreeMap<BucketName, OpId>,
		limits: BatchLimits,
	) -> Result<Vec<BucketDataChunk>, StorageError>;

	async fn get_parameter_sets(
		&self,
		group: GroupId,
		lookups: &[Lookup],
	) -> Result<Vec<(Lookup, ParameterSet)>, StorageError>;

	// Checkpoint watching

	fn subscribe_checkpoints(&self) -> broadcast::Receiver<CheckpointUpdate>;

	async fn active_checkpoint(&self) -> Result<Option<ActiveCheckpoint>, StorageError>;

	// Write checkpoints

	async fn create_write_checkpoint(
		&self,
		user_id: &str,
		client_id: &str,
		lsn: Lsn,
	) -> Result<OpId, StorageError>;

	async fn resolve_write_checkpoint(
		&self,
		user_id: &str,
		at: &Lsn,
	) -> Result<Option<OpId>, StorageError>;

	// Maintenance

	/// Discard all replicated data of `group` so replication can restart
	/// from a fresh snapshot. The one unrecoverable-error path that does not
	/// exit the process.
	async fn restart_replication(&self, group: GroupId) -> Result<(), StorageError>;

	/// Collapse the history of `bucket` up to `below` into a single `CLEAR`
	/// op carrying the absorbed checksum.
	async fn clear_bucket_below(
		&self,
		group: GroupId,
		bucket: &str,
		below: OpId,
	) -> Result<(), StorageError>;

	/// Replace superseded `PUT`s below `below` with `MOVE` ops pointing past
	/// the current head, preserving per-op checksums.
	async fn move_superseded_below(
		&self,
		group: GroupId,
		bucket: &str,
		below: OpId,
	) -> Result<(), StorageError>;
}

#![allow(dead_code)]

use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicU32, Ordering},
		Arc,
	},
};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use opsync_replication::{BatchWriter, WriterTuning};
use opsync_rules::{row_from_json, Lookup, ParameterSet, Row, SyncRules};
use opsync_storage::{
	ActiveCheckpoint, ActiveRulesHandle, BatchLimits, BucketDataChunk, BucketStorage,
	CheckpointStateUpdate, CheckpointUpdate, CurrentDataRecord, FlushResult, GroupId,
	MemoryBucketStorage, OpRange, SourceTableHandle, SourceTableId, SourceTableIdentity,
	StorageError, SyncRulesStatus, WriteBatch,
};
use opsync_types::{BucketName, Lsn, OpId, PartialChecksum};

pub fn row(values: serde_json::Value) -> Row {
	let serde_json::Value::Object(object) = values else {
		panic!("expected a JSON object");
	};
	row_from_json(object)
}

pub fn test_rules() -> SyncRules {
	SyncRules::from_json(
		r#"{
			"bucket_definitions": [
				{
					"name": "global",
					"data": [{ "table": "users" }]
				},
				{
					"name": "by_user",
					"priority": 0,
					"request_parameters": ["token.sub"],
					"data": [{ "table": "todos", "partition_by": ["owner_id"] }]
				},
				{
					"name": "by_team",
					"priority": 1,
					"parameter_queries": [{
						"table": "memberships",
						"lookup": [{ "column": "user_id", "request": "token.sub" }],
						"outputs": ["team_id"]
					}],
					"data": [{ "table": "documents", "partition_by": ["team_id"] }]
				}
			]
		}"#,
	)
	.expect("test rules are valid")
}

pub struct TestSetup {
	pub storage: Arc<MemoryBucketStorage>,
	pub group: GroupId,
	pub rules: Arc<SyncRules>,
	pub writer: BatchWriter,
}

impl TestSetup {
	pub async fn new() -> Self {
		Self::with_tuning(WriterTuning::default()).await
	}

	pub async fn with_tuning(tuning: WriterTuning) -> Self {
		let storage = Arc::new(MemoryBucketStorage::new());
		let rules = Arc::new(test_rules());
		let group = storage
			.create_sync_rules(test_rules())
			.await
			.expect("create sync rules");

		let writer = BatchWriter::new(
			storage.clone(),
			group,
			Arc::clone(&rules),
			Arc::new(Mutex::new(())),
			tuning,
		);

		Self {
			storage,
			group,
			rules,
			writer,
		}
	}

	pub async fn table(&self, name: &str, replica_id_columns: &[&str]) -> Arc<SourceTableHandle> {
		Arc::new(
			self.storage
				.resolve_source_table(
					self.group,
					SourceTableIdentity {
						connection_id: 1,
						relation_id: None,
						schema: "public".to_owned(),
						name: name.to_owned(),
						replica_id_columns: replica_id_columns
							.iter()
							.map(|&column| column.to_owned())
							.collect(),
					},
				)
				.await
				.expect("resolve source table"),
		)
	}
}

/// Storage wrapper whose `write_batch` fails with a transient conflict a
/// configurable number of times.
pub struct FlakyStorage {
	inner: MemoryBucketStorage,
	remaining_failures: AtomicU32,
}

impl FlakyStorage {
	pub fn new(inner: MemoryBucketStorage, failures: u32) -> Self {
		Self {
			inner,
			remaining_failures: AtomicU32::new(failures),
		}
	}
}

#[async_trait]
impl BucketStorage for FlakyStorage {
	async fn create_sync_rules(&self, rules: SyncRules) -> Result<GroupId, StorageError> {
		self.inner.create_sync_rules(rules).await
	}

	async fn active_rules(&self) -> Result<Option<ActiveRulesHandle>, StorageError> {
		self.inner.active_rules().await
	}

	async fn group_rules(&self, group: GroupId) -> Result<ActiveRulesHandle, StorageError> {
		self.inner.group_rules(group).await
	}

	async fn sync_rules_status(&self, group: GroupId) -> Result<SyncRulesStatus, StorageError> {
		self.inner.sync_rules_status(group).await
	}

	async fn update_checkpoint_state(
		&self,
		group: GroupId,
		update: CheckpointStateUpdate,
	) -> Result<(), StorageError> {
		self.inner.update_checkpoint_state(group, update).await
	}

	async fn activate_sync_rules(&self, group: GroupId) -> Result<(), StorageError> {
		self.inner.activate_sync_rules(group).await
	}

	async fn resolve_source_table(
		&self,
		group: GroupId,
		identity: SourceTableIdentity,
	) -> Result<SourceTableHandle, StorageError> {
		self.inner.resolve_source_table(group, identity).await
	}

	async fn write_batch(
		&self,
		group: GroupId,
		batch: WriteBatch,
	) -> Result<FlushResult, StorageError> {
		let remaining = self.remaining_failures.load(Ordering::SeqCst);
		if remaining > 0 {
			self.remaining_failures
				.store(remaining.saturating_sub(1), Ordering::SeqCst);
			return Err(StorageError::WriteConflict("injected conflict".into()));
		}

		self.inner.write_batch(group, batch).await
	}

	async fn get_current_data(
		&self,
		group: GroupId,
		table: SourceTableId,
		key: &str,
	) -> Result<Option<CurrentDataRecord>, StorageError> {
		self.inner.get_current_data(group, table, key).await
	}

	async fn scan_current_data(
		&self,
		group: GroupId,
		table: SourceTableId,
		after_key: Option<&str>,
		limit: usize,
	) -> Result<Vec<(String, CurrentDataRecord)>, StorageError> {
		self.inner
			.scan_current_data(group, table, after_key, limit)
			.await
	}

	async fn mark_record_unavailable(
		&self,
		group: GroupId,
		table: SourceTableId,
		key: &str,
	) -> Result<(), StorageError> {
		self.inner.mark_record_unavailable(group, table, key).await
	}

	async fn pending_resnapshots(
		&self,
		group: GroupId,
		table: SourceTableId,
	) -> Result<Vec<String>, StorageError> {
		self.inner.pending_resnapshots(group, table).await
	}

	async fn sum_checksum(
		&self,
		group: GroupId,
		bucket: &str,
		range: OpRange,
	) -> Result<PartialChecksum, StorageError> {
		self.inner.sum_checksum(group, bucket, range).await
	}

	async fn get_bucket_data_batch(
		&self,
		group: GroupId,
		checkpoint: OpId,
		positions: &BTreeMap<BucketName, OpId>,
		limits: BatchLimits,
	) -> Result<Vec<BucketDataChunk>, StorageError> {
		self.inner
			.get_bucket_data_batch(group, checkpoint, positions, limits)
			.await
	}

	async fn get_parameter_sets(
		&self,
		group: GroupId,
		lookups: &[Lookup],
	) -> Result<Vec<(Lookup, ParameterSet)>, StorageError> {
		self.inner.get_parameter_sets(group, lookups).await
	}

	fn subscribe_checkpoints(&self) -> broadcast::Receiver<CheckpointUpdate> {
		self.inner.subscribe_checkpoints()
	}

	async fn active_checkpoint(&self) -> Result<Option<ActiveCheckpoint>, StorageError> {
		self.inner.active_checkpoint().await
	}

	async fn create_write_checkpoint(
		&self,
		user_id: &str,
		client_id: &str,
		lsn: Lsn,
	) -> Result<OpId, StorageError> {
		self.inner
			.create_write_checkpoint(user_id, client_id, lsn)
			.await
	}

	async fn resolve_write_checkpoint(
		&self,
		user_id: &str,
		at: &Lsn,
	) -> Result<Option<OpId>, StorageError> {
		self.inner.resolve_write_checkpoint(user_id, at).await
	}

	async fn restart_replication(&self, group: GroupId) -> Result<(), StorageError> {
		self.inner.restart_replication(group).await
	}

	async fn clear_bucket_below(
		&self,
		group: GroupId,
		bucket: &str,
		below: OpId,
	) -> Result<(), StorageError> {
		self.inner.clear_bucket_below(group, bucket, below).await
	}

	async fn move_superseded_below(
		&self,
		group: GroupId,
		bucket: &str,
		below: OpId,
	) -> Result<(), StorageError> {
		self.inner.move_superseded_below(group, bucket, below).await
	}
}

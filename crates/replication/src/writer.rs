use std::{
	collections::{BTreeSet, HashMap},
	sync::Arc,
	time::Duration,
};

use rand::Rng;
use tokio::{
	sync::Mutex,
	time::{sleep, Instant},
};
use tracing::{debug, warn};

use opsync_rules::{
	is_complete, merge_unchanged, parse_row, serialize_row, ColumnValue, EvaluatedRow, Lookup,
	Row, SyncRuleState, SyncRules,
};
use opsync_storage::{
	BucketOpWrite, BucketStorage, CheckpointStateUpdate, CurrentBucket, CurrentDataRecord,
	CurrentDataWrite, GroupId, ParameterRowWrite, SourceTableHandle, SourceTableId, WriteBatch,
};
use opsync_types::{op_checksum, Lsn, OpId, OpType};

use crate::{source::SourceChange, ReplicationError};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WriterTuning {
	/// Flush once the pending batch holds this many ops.
	pub max_batch_ops: usize,
	/// Flush once pending payload bytes reach this threshold.
	pub max_batch_bytes: usize,
	/// Rows serializing to at least this many bytes are replaced with a
	/// placeholder record.
	pub max_row_bytes: usize,
	pub truncate_batch_size: usize,
	pub max_flush_tries: u32,
	pub max_flush_time: Duration,
	/// Queue incomplete rows for resnapshot instead of skipping them.
	pub resnapshot_on_incomplete: bool,
}

impl Default for WriterTuning {
	fn default() -> Self {
		Self {
			max_batch_ops: 1000,
			max_batch_bytes: 5 * 1024 * 1024,
			max_row_bytes: 15 * 1024 * 1024,
			truncate_batch_size: 2000,
			max_flush_tries: 20,
			max_flush_time: Duration::from_secs(90),
			resnapshot_on_incomplete: true,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
	/// The checkpoint advanced and watchers were notified.
	Applied,
	/// The LSN is still before `no_checkpoint_before`; ops were persisted as
	/// a keepalive instead.
	Deferred,
	/// The LSN was at or before the last committed checkpoint.
	Skipped,
}

/// Consumes source changes for one sync-rules version and produces atomic
/// storage batches.
///
/// One source transaction may span several inner flushes for memory; the
/// checkpoint only advances in [`BatchWriter::commit`] once the source commit
/// LSN is known durable.
pub struct BatchWriter {
	group: GroupId,
	rules: Arc<SyncRules>,
	storage: Arc<dyn BucketStorage>,
	tuning: WriterTuning,
	/// Process-wide flush lock: serializes op-id assignment plus the batch
	/// write even if multiple replication sources are configured.
	flush_lock: Arc<Mutex<()>>,
	batch: WriteBatch,
	batch_bytes: usize,
	/// Uncommitted current-data view, so a batch observes its own writes.
	current_overlay: HashMap<(SourceTableId, String), Option<CurrentDataRecord>>,
	/// Highest op id persisted since the last committed checkpoint.
	persisted_op: Option<OpId>,
}

impl BatchWriter {
	pub fn new(
		storage: Arc<dyn BucketStorage>,
		group: GroupId,
		rules: Arc<SyncRules>,
		flush_lock: Arc<Mutex<()>>,
		tuning: WriterTuning,
	) -> Self {
		Self {
			group,
			rules,
			storage,
			tuning,
			flush_lock,
			batch: WriteBatch::default(),
			batch_bytes: 0,
			current_overlay: HashMap::new(),
			persisted_op: None,
		}
	}

	#[must_use]
	pub fn group(&self) -> GroupId {
		self.group
	}

	pub async fn save(&mut self, change: SourceChange) -> Result<(), ReplicationError> {
		match change {
			SourceChange::Insert { table, after } => {
				self.upsert(&table, None, after).await?;
			}
			SourceChange::Update {
				table,
				before,
				after,
			} => {
				self.upsert(&table, before, after).await?;
			}
			SourceChange::Delete { table, before } => {
				let key = replica_key(&table, &before)?;
				self.delete_key(&table, &key).await?;
			}
			SourceChange::Truncate { tables } => {
				for table in tables {
					self.truncate(&table).await?;
				}
			}
		}

		self.flush_if_needed().await
	}

	async fn upsert(
		&mut self,
		table: &SourceTableHandle,
		before: Option<Row>,
		mut after: Row,
	) -> Result<(), ReplicationError> {
		let key = replica_key(table, &after)?;

		// Columns the source did not ship are merged back from the stored
		// row image; without one the row cannot be evaluated yet.
		if !is_complete(&after) {
			match self.lookup_current(table.id, &key).await? {
				Some(existing) => {
					let prior = parse_row(&existing.data)?;
					let unresolved = merge_unchanged(&mut after, &prior);

					if !unresolved.is_empty() {
						warn!(
							table = %table.identity.name,
							?unresolved,
							"stored row image is missing replicated columns"
						);
						return self.record_unavailable(table, &key).await;
					}
				}
				None => return self.record_unavailable(table, &key).await,
			}
		}

		// Replica identity changed: the old row leaves its buckets under the
		// old key within the same transaction.
		if let Some(before) = &before {
			let old_key = replica_key(table, before)?;
			if old_key != key {
				self.delete_key(table, &old_key).await?;
			}
		}

		let existing = self.lookup_current(table.id, &key).await?;

		let evaluated = match self.rules.evaluate_row(
			&table.identity.schema,
			&table.identity.name,
			&after,
		) {
			Ok(evaluated) => evaluated,
			Err(e) => {
				warn!(table = %table.identity.name, ?e, "row failed sync-rules evaluation, skipping");
				Vec::new()
			}
		};
		let evaluated = self.cap_row_sizes(table, evaluated);

		let parameters =
			self.rules
				.evaluate_parameter_row(&table.identity.schema, &table.identity.name, &after);

		let new_buckets: Vec<CurrentBucket> = evaluated
			.iter()
			.map(|row| CurrentBucket {
				bucket: row.bucket.clone(),
				object_type: row.object_type.clone(),
				object_id: row.object_id.clone(),
			})
			.collect();

		// Rows that left a bucket get a REMOVE there before the new PUTs.
		if let Some(existing) = &existing {
			for old in &existing.buckets {
				if !new_buckets.contains(old) {
					self.push_remove(table.id, &key, old);
				}
			}
		}

		for row in &evaluated {
			self.batch_bytes += row.data.len();
			self.batch.ops.push(BucketOpWrite {
				bucket: row.bucket.clone(),
				op: OpType::Put,
				source_table: Some(table.id),
				source_key: Some(key.clone()),
				object_type: Some(row.object_type.clone()),
				object_id: Some(row.object_id.clone()),
				subkey: None,
				checksum: op_checksum(
					OpType::Put,
					Some(&row.object_type),
					Some(&row.object_id),
					None,
					Some(&row.data),
				),
				data: Some(row.data.clone()),
				target_op: None,
			});
		}

		// Parameter-lookup diff.
		let new_lookups: BTreeSet<Lookup> =
			parameters.iter().map(|row| row.lookup.clone()).collect();

		if let Some(existing) = &existing {
			for old in &existing.lookups {
				if !new_lookups.contains(old) {
					self.batch.parameter_rows.push(ParameterRowWrite {
						lookup: old.clone(),
						table: table.id,
						key: key.clone(),
						value: None,
					});
				}
			}
		}
		for row in parameters {
			self.batch.parameter_rows.push(ParameterRowWrite {
				lookup: row.lookup,
				table: table.id,
				key: key.clone(),
				value: Some(row.parameters),
			});
		}

		let record = if new_buckets.is_empty() && new_lookups.is_empty() {
			None
		} else {
			Some(CurrentDataRecord {
				data: serialize_row(&after, None)?,
				buckets: new_buckets,
				lookups: new_lookups.into_iter().collect(),
			})
		};

		if record.is_some() || existing.is_some() {
			self.push_current(table.id, key, record);
		}

		Ok(())
	}

	async fn delete_key(
		&mut self,
		table: &SourceTableHandle,
		key: &str,
	) -> Result<(), ReplicationError> {
		let Some(existing) = self.lookup_current(table.id, key).await? else {
			return Ok(());
		};

		for bucket in &existing.buckets {
			self.push_remove(table.id, key, bucket);
		}
		for lookup in &existing.lookups {
			self.batch.parameter_rows.push(ParameterRowWrite {
				lookup: lookup.clone(),
				table: table.id,
				key: key.to_owned(),
				value: None,
			});
		}

		self.push_current(table.id, key.to_owned(), None);

		Ok(())
	}

	async fn truncate(&mut self, table: &SourceTableHandle) -> Result<(), ReplicationError> {
		debug!(table = %table.identity.name, "truncating replicated table");

		// Work from the committed view in fixed-size batches; each flush
		// applies the deletions, so the next scan starts from the new head.
		self.flush().await?;

		loop {
			let rows = self
				.storage
				.scan_current_data(self.group, table.id, None, self.tuning.truncate_batch_size)
				.await?;

			if rows.is_empty() {
				return Ok(());
			}

			for (key, _) in rows {
				self.delete_key(table, &key).await?;
			}

			self.flush().await?;
		}
	}

	async fn record_unavailable(
		&mut self,
		table: &SourceTableHandle,
		key: &str,
	) -> Result<(), ReplicationError> {
		if self.tuning.resnapshot_on_incomplete {
			debug!(table = %table.identity.name, key, "queueing row for resnapshot");
			self.storage
				.mark_record_unavailable(self.group, table.id, key)
				.await?;
		} else {
			warn!(
				table = %table.identity.name,
				key,
				"incomplete row without a stored image, skipping bucket emission"
			);
		}

		Ok(())
	}

	fn cap_row_sizes(
		&mut self,
		table: &SourceTableHandle,
		evaluated: Vec<EvaluatedRow>,
	) -> Vec<EvaluatedRow> {
		evaluated
			.into_iter()
			.map(|mut row| {
				if row.data.len() >= self.tuning.max_row_bytes {
					let e = ReplicationError::RowTooLarge {
						table: table.identity.name.clone(),
						size: row.data.len(),
					};
					warn!(%e, object_id = %row.object_id, "replacing oversized row with placeholder");

					// Keep the stream moving with an id-only placeholder.
					row.data = format!(r#"{{"id":{}}}"#, serde_json::Value::from(row.object_id.clone()));
				}
				row
			})
			.collect()
	}

	fn push_remove(&mut self, table: SourceTableId, key: &str, bucket: &CurrentBucket) {
		self.batch.ops.push(BucketOpWrite {
			bucket: bucket.bucket.clone(),
			op: OpType::Remove,
			source_table: Some(table),
			source_key: Some(key.to_owned()),
			object_type: Some(bucket.object_type.clone()),
			object_id: Some(bucket.object_id.clone()),
			subkey: None,
			checksum: op_checksum(
				OpType::Remove,
				Some(&bucket.object_type),
				Some(&bucket.object_id),
				None,
				None,
			),
			data: None,
			target_op: None,
		});
	}

	fn push_current(
		&mut self,
		table: SourceTableId,
		key: String,
		value: Option<CurrentDataRecord>,
	) {
		self.current_overlay
			.insert((table, key.clone()), value.clone());
		self.batch.current_data.push(CurrentDataWrite { table, key, value });
	}

	async fn lookup_current(
		&self,
		table: SourceTableId,
		key: &str,
	) -> Result<Option<CurrentDataRecord>, ReplicationError> {
		if let Some(pending) = self.current_overlay.get(&(table, key.to_owned())) {
			return Ok(pending.clone());
		}

		Ok(self.storage.get_current_data(self.group, table, key).await?)
	}

	async fn flush_if_needed(&mut self) -> Result<(), ReplicationError> {
		if self.batch.ops.len() >= self.tuning.max_batch_ops
			|| self.batch_bytes >= self.tuning.max_batch_bytes
		{
			self.flush().await?;
		}

		Ok(())
	}

	/// Persist the pending batch. Serialized process-wide so assigned op ids
	/// stay strictly increasing across writers.
	pub async fn flush(&mut self) -> Result<(), ReplicationError> {
		if self.batch.is_empty() {
			return Ok(());
		}

		let batch = std::mem::take(&mut self.batch);
		self.batch_bytes = 0;

		let guard = self.flush_lock.lock().await;
		let result = self
			.with_retries(|| self.storage.write_batch(self.group, batch.clone()))
			.await?;
		drop(guard);

		self.current_overlay.clear();

		if let Some(last_op_id) = result.last_op_id {
			self.persisted_op = Some(last_op_id);
		}

		Ok(())
	}

	/// Advance the committed checkpoint to `lsn` if allowed.
	pub async fn commit(&mut self, lsn: Lsn) -> Result<CommitStatus, ReplicationError> {
		self.flush().await?;

		let status = self.storage.sync_rules_status(self.group).await?;

		if status
			.no_checkpoint_before
			.as_ref()
			.is_some_and(|gate| lsn < *gate)
		{
			// Not consistent yet; remember how far ops were persisted.
			self.storage
				.update_checkpoint_state(
					self.group,
					CheckpointStateUpdate {
						keepalive_op: Some(self.persisted_op),
						..CheckpointStateUpdate::default()
					},
				)
				.await?;

			return Ok(CommitStatus::Deferred);
		}

		if status
			.last_checkpoint_lsn
			.as_ref()
			.is_some_and(|current| lsn <= *current)
		{
			// Already covered; re-delivery of the same source transaction.
			return Ok(CommitStatus::Skipped);
		}

		let last_op = self
			.persisted_op
			.take()
			.or(status.keepalive_op)
			.or(status.last_checkpoint);

		self.storage
			.update_checkpoint_state(
				self.group,
				CheckpointStateUpdate {
					last_checkpoint: last_op,
					last_checkpoint_lsn: Some(lsn),
					keepalive_op: Some(None),
					snapshot_done: Some(true),
					..CheckpointStateUpdate::default()
				},
			)
			.await?;

		if status.state == SyncRuleState::Processing {
			self.storage.activate_sync_rules(self.group).await?;
		}

		Ok(CommitStatus::Applied)
	}

	/// Record source liveness; behaves as a commit when ops are pending.
	pub async fn keepalive(&mut self, lsn: Lsn) -> Result<CommitStatus, ReplicationError> {
		self.flush().await?;

		if self.persisted_op.is_some() {
			return self.commit(lsn).await;
		}

		let status = self.storage.sync_rules_status(self.group).await?;

		if status
			.last_checkpoint_lsn
			.as_ref()
			.is_some_and(|current| lsn <= *current)
			|| status
				.no_checkpoint_before
				.as_ref()
				.is_some_and(|gate| lsn < *gate)
		{
			return Ok(CommitStatus::Skipped);
		}

		self.storage
			.update_checkpoint_state(
				self.group,
				CheckpointStateUpdate {
					last_checkpoint_lsn: Some(lsn),
					..CheckpointStateUpdate::default()
				},
			)
			.await?;

		Ok(CommitStatus::Applied)
	}

	/// Recovery path for a missing replication slot: discard replicated state
	/// and let the adapter re-snapshot, without exiting the process.
	pub async fn recover_missing_slot(&mut self) -> Result<(), ReplicationError> {
		warn!(group = %self.group, "replication slot lost, restarting replication");

		self.batch = WriteBatch::default();
		self.batch_bytes = 0;
		self.current_overlay.clear();
		self.persisted_op = None;
		self.storage.restart_replication(self.group).await?;

		Ok(())
	}

	async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, ReplicationError>
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = Result<T, opsync_storage::StorageError>>,
	{
		let started = Instant::now();
		let mut tries = 0_u32;

		loop {
			match op().await {
				Ok(value) => return Ok(value),
				Err(e) if e.is_transient() => {
					tries += 1;

					if tries >= self.tuning.max_flush_tries
						|| started.elapsed() >= self.tuning.max_flush_time
					{
						return Err(ReplicationError::MaxTransactionRetries { tries });
					}

					let backoff = RETRY_BASE_DELAY * 2_u32.pow(tries.min(6));
					let jitter =
						Duration::from_millis(rand::thread_rng().gen_range(0..=50));
					let delay = (backoff + jitter).min(RETRY_MAX_DELAY);

					warn!(?e, tries, ?delay, "transient replication write failure, retrying");
					sleep(delay).await;
				}
				Err(e) => return Err(e.into()),
			}
		}
	}
}

fn replica_key(table: &SourceTableHandle, row: &Row) -> Result<String, ReplicationError> {
	let values: Vec<&serde_json::Value> = table
		.identity
		.replica_id_columns
		.iter()
		.map(|column| {
			row.get(column)
				.and_then(ColumnValue::as_value)
				.ok_or_else(|| {
					ReplicationError::Assertion(format!(
						"change for {:?} is missing replica id column {column:?}",
						table.identity.name,
					))
				})
		})
		.collect::<Result<_, _>>()?;

	serde_json::to_string(&values)
		.map_err(|e| ReplicationError::Assertion(format!("replica key serialization failed: {e}")))
}

//! In-memory [`BucketStorage`] engine.
//!
//! Used by the server in standalone mode and by the test suites. Op ids come
//! from a single process-wide sequence, so monotonicity holds across every
//! group this instance owns.

use std::{
	collections::{BTreeMap, BTreeSet},
	ops::Bound,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use opsync_rules::{Lookup, ParameterSet, SyncRuleState, SyncRules};
use opsync_types::{
	BucketName, Lsn, OpId, OpType, OplogEntry, PartialChecksum, SyncBucketData,
};

use crate::{
	adapter::{
		ActiveCheckpoint, ActiveRulesHandle, BatchLimits, BucketDataChunk, BucketStorage,
		CheckpointStateUpdate, CheckpointUpdate, CurrentDataRecord, FlushResult, GroupId, OpRange,
		SourceTableHandle, SourceTableId, SourceTableIdentity, SyncRulesStatus, WriteBatch,
	},
	error::StorageError,
};

const CHECKPOINT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct StoredOp {
	op: OpType,
	source_table: Option<SourceTableId>,
	source_key: Option<String>,
	object_type: Option<String>,
	object_id: Option<String>,
	subkey: Option<String>,
	checksum: opsync_types::Checksum,
	data: Option<String>,
	target_op: Option<OpId>,
}

impl StoredOp {
	fn to_entry(&self, op_id: OpId) -> OplogEntry {
		OplogEntry {
			op_id,
			op: self.op,
			object_type: self.object_type.clone(),
			object_id: self.object_id.clone(),
			subkey: self.subkey.clone(),
			checksum: self.checksum,
			data: self.data.clone(),
		}
	}
}

struct GroupState {
	rules: Arc<SyncRules>,
	status: SyncRulesStatus,
	source_tables: BTreeMap<SourceTableId, SourceTableIdentity>,
	bucket_data: BTreeMap<(BucketName, OpId), StoredOp>,
	current_data: BTreeMap<(SourceTableId, String), CurrentDataRecord>,
	parameter_rows: BTreeMap<(Lookup, SourceTableId, String), ParameterSet>,
	resnapshot: BTreeMap<SourceTableId, BTreeSet<String>>,
	// Accumulated between checkpoint notifications.
	pending_buckets: BTreeSet<BucketName>,
	pending_lookups: BTreeSet<Lookup>,
}

impl GroupState {
	fn new(rules: Arc<SyncRules>) -> Self {
		Self {
			rules,
			status: SyncRulesStatus {
				state: SyncRuleState::Processing,
				last_checkpoint: None,
				last_checkpoint_lsn: None,
				no_checkpoint_before: None,
				keepalive_op: None,
				snapshot_done: false,
				last_fatal_error: None,
			},
			source_tables: BTreeMap::new(),
			bucket_data: BTreeMap::new(),
			current_data: BTreeMap::new(),
			parameter_rows: BTreeMap::new(),
			resnapshot: BTreeMap::new(),
			pending_buckets: BTreeSet::new(),
			pending_lookups: BTreeSet::new(),
		}
	}

	fn active_checkpoint(&self, group: GroupId) -> ActiveCheckpoint {
		ActiveCheckpoint {
			group,
			checkpoint: self.status.last_checkpoint.unwrap_or(OpId::ZERO),
			lsn: self.status.last_checkpoint_lsn.clone().unwrap_or_default(),
		}
	}
}

struct MemoryInner {
	groups: BTreeMap<GroupId, GroupState>,
	next_group: u32,
	write_checkpoints: BTreeMap<(String, String), (u64, Lsn)>,
	next_write_checkpoint: u64,
}

pub struct MemoryBucketStorage {
	op_seq: AtomicU64,
	inner: RwLock<MemoryInner>,
	checkpoint_tx: broadcast::Sender<CheckpointUpdate>,
}

impl Default for MemoryBucketStorage {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryBucketStorage {
	#[must_use]
	pub fn new() -> Self {
		let (checkpoint_tx, _) = broadcast::channel(CHECKPOINT_CHANNEL_CAPACITY);

		Self {
			op_seq: AtomicU64::new(0),
			inner: RwLock::new(MemoryInner {
				groups: BTreeMap::new(),
				next_group: 1,
				write_checkpoints: BTreeMap::new(),
				next_write_checkpoint: 0,
			}),
			checkpoint_tx,
		}
	}

	fn next_op_id(&self) -> OpId {
		OpId(self.op_seq.fetch_add(1, Ordering::SeqCst) + 1)
	}

	/// Number of live checkpoint subscriptions; exposed for telemetry.
	#[must_use]
	pub fn checkpoint_watcher_count(&self) -> usize {
		self.checkpoint_tx.receiver_count()
	}

	fn notify(&self, update: CheckpointUpdate) {
		// No receivers is fine; watchers subscribe lazily.
		let _ = self.checkpoint_tx.send(update);
	}

	fn drain_pending(group: GroupId, state: &mut GroupState, invalidate_all: bool) -> CheckpointUpdate {
		CheckpointUpdate {
			checkpoint: state.active_checkpoint(group),
			updated_buckets: Arc::new(std::mem::take(&mut state.pending_buckets)),
			updated_parameter_lookups: Arc::new(std::mem::take(&mut state.pending_lookups)),
			invalidate_all,
		}
	}
}

fn group_mut<'a>(
	inner: &'a mut MemoryInner,
	group: GroupId,
) -> Result<&'a mut GroupState, StorageError> {
	inner
		.groups
		.get_mut(&group)
		.ok_or(StorageError::GroupNotFound(group))
}

fn group_ref<'a>(inner: &'a MemoryInner, group: GroupId) -> Result<&'a GroupState, StorageError> {
	inner
		.groups
		.get(&group)
		.ok_or(StorageError::GroupNotFound(group))
}

#[async_trait]
impl BucketStorage for MemoryBucketStorage {
	async fn create_sync_rules(&self, rules: SyncRules) -> Result<GroupId, StorageError> {
		let mut inner = self.inner.write().await;

		let group = GroupId(inner.next_group);
		inner.next_group += 1;
		inner.groups.insert(group, GroupState::new(Arc::new(rules)));

		debug!(%group, "created sync rules");

		Ok(group)
	}

	async fn active_rules(&self) -> Result<Option<ActiveRulesHandle>, StorageError> {
		let inner = self.inner.read().await;

		Ok(inner
			.groups
			.iter()
			.rev()
			.find(|(_, state)| state.status.state == SyncRuleState::Active)
			.map(|(group, state)| ActiveRulesHandle {
				group: *group,
				rules: Arc::clone(&state.rules),
			}))
	}

	async fn group_rules(&self, group: GroupId) -> Result<ActiveRulesHandle, StorageError> {
		let inner = self.inner.read().await;

		group_ref(&inner, group).map(|state| ActiveRulesHandle {
			group,
			rules: Arc::clone(&state.rules),
		})
	}

	async fn sync_rules_status(&self, group: GroupId) -> Result<SyncRulesStatus, StorageError> {
		let inner = self.inner.read().await;

		group_ref(&inner, group).map(|state| state.status.clone())
	}

	async fn update_checkpoint_state(
		&self,
		group: GroupId,
		update: CheckpointStateUpdate,
	) -> Result<(), StorageError> {
		let mut inner = self.inner.write().await;
		let state = group_mut(&mut inner, group)?;

		let advanced = update.last_checkpoint_lsn.is_some();

		if let Some(last_checkpoint) = update.last_checkpoint {
			if state
				.status
				.last_checkpoint
				.is_some_and(|current| last_checkpoint < current)
			{
				return Err(StorageError::Assertion(format!(
					"checkpoint regression for {group}: {last_checkpoint} < {}",
					state.status.last_checkpoint.unwrap_or(OpId::ZERO),
				)));
			}
			state.status.last_checkpoint = Some(last_checkpoint);
		}
		if let Some(lsn) = update.last_checkpoint_lsn {
			state.status.last_checkpoint_lsn = Some(lsn);
		}
		if let Some(lsn) = update.no_checkpoint_before {
			state.status.no_checkpoint_before = Some(lsn);
		}
		if let Some(keepalive_op) = update.keepalive_op {
			state.status.keepalive_op = keepalive_op;
		}
		if let Some(snapshot_done) = update.snapshot_done {
			state.status.snapshot_done = snapshot_done;
		}
		if let Some(error) = update.last_fatal_error {
			state.status.last_fatal_error = Some(error);
		}

		if advanced && state.status.state == SyncRuleState::Active {
			let update = Self::drain_pending(group, state, false);
			drop(inner);
			self.notify(update);
		}

		Ok(())
	}

	async fn activate_sync_rules(&self, group: GroupId) -> Result<(), StorageError> {
		let mut inner = self.inner.write().await;

		if !inner.groups.contains_key(&group) {
			return Err(StorageError::GroupNotFound(group));
		}

		for (other, state) in &mut inner.groups {
			if *other != group
				&& matches!(
					state.status.state,
					SyncRuleState::Active | SyncRuleState::Errored
				) {
				state.status.state = SyncRuleState::Stop;
			}
		}

		let state = group_mut(&mut inner, group)?;
		state.status.state = SyncRuleState::Active;

		let update = Self::drain_pending(group, state, true);
		drop(inner);
		self.notify(update);

		debug!(%group, "sync rules activated");

		Ok(())
	}

	async fn resolve_source_table(
		&self,
		group: GroupId,
		identity: SourceTableIdentity,
	) -> Result<SourceTableHandle, StorageError> {
		let mut inner = self.inner.write().await;
		let state = group_mut(&mut inner, group)?;

		let existing = state
			.source_tables
			.iter()
			.find(|(_, candidate)| {
				candidate.connection_id == identity.connection_id
					&& candidate.schema == identity.schema
					&& candidate.name == identity.name
			})
			.map(|(id, candidate)| (*id, candidate.clone()));

		if let Some((id, candidate)) = existing {
			if candidate == identity {
				return Ok(SourceTableHandle {
					id,
					group,
					identity,
				});
			}

			// Replica identity or relation changed; the old identity's data
			// is dropped in the same transaction.
			debug!(%group, table = %identity.name, "source table identity changed, dropping old data");
			state.source_tables.remove(&id);
			state.current_data.retain(|(table, _), _| *table != id);
			state.parameter_rows.retain(|(_, table, _), _| *table != id);
			state.resnapshot.remove(&id);
		}

		let id = SourceTableId(Uuid::new_v4());
		state.source_tables.insert(id, identity.clone());

		Ok(SourceTableHandle {
			id,
			group,
			identity,
		})
	}

	async fn write_batch(
		&self,
		group: GroupId,
		batch: WriteBatch,
	) -> Result<FlushResult, StorageError> {
		let mut inner = self.inner.write().await;
		let state = group_mut(&mut inner, group)?;

		let mut last_op_id = None;

		for write in batch.ops {
			let op_id = self.next_op_id();

			if last_op_id.is_some_and(|last| op_id <= last) {
				return Err(StorageError::Assertion(format!(
					"op id sequence regressed at {op_id}"
				)));
			}
			last_op_id = Some(op_id);

			state.pending_buckets.insert(write.bucket.clone());
			state.bucket_data.insert(
				(write.bucket, op_id),
				StoredOp {
					op: write.op,
					source_table: write.source_table,
					source_key: write.source_key,
					object_type: write.object_type,
					object_id: write.object_id,
					subkey: write.subkey,
					checksum: write.checksum,
					data: write.data,
					target_op: write.target_op,
				},
			);
		}

		for write in batch.current_data {
			let key = (write.table, write.key);
			match write.value {
				Some(record) => {
					state.current_data.insert(key, record);
				}
				None => {
					state.current_data.remove(&key);
				}
			}
		}

		for write in batch.parameter_rows {
			state.pending_lookups.insert(write.lookup.clone());
			let key = (write.lookup, write.table, write.key);
			match write.value {
				Some(parameters) => {
					state.parameter_rows.insert(key, parameters);
				}
				None => {
					state.parameter_rows.remove(&key);
				}
			}
		}

		Ok(FlushResult { last_op_id })
	}

	async fn get_current_data(
		&self,
		group: GroupId,
		table: SourceTableId,
		key: &str,
	) -> Result<Option<CurrentDataRecord>, StorageError> {
		let inner = self.inner.read().await;

		Ok(group_ref(&inner, group)?
			.current_data
			.get(&(table, key.to_owned()))
			.cloned())
	}

	async fn scan_current_data(
		&self,
		group: GroupId,
		table: SourceTableId,
		after_key: Option<&str>,
		limit: usize,
	) -> Result<Vec<(String, CurrentDataRecord)>, StorageError> {
		let inner = self.inner.read().await;
		let state = group_ref(&inner, group)?;

		let start = match after_key {
			Some(key) => Bound::Excluded((table, key.to_owned())),
			None => Bound::Included((table, String::new())),
		};

		Ok(state
			.current_data
			.range((start, Bound::Unbounded))
			.take_while(|((t, _), _)| *t == table)
			.take(limit)
			.map(|((_, key), record)| (key.clone(), record.clone()))
			.collect())
	}

	async fn mark_record_unavailable(
		&self,
		group: GroupId,
		table: SourceTableId,
		key: &str,
	) -> Result<(), StorageError> {
		let mut inner = self.inner.write().await;
		let state = group_mut(&mut inner, group)?;

		state
			.resnapshot
			.entry(table)
			.or_default()
			.insert(key.to_owned());

		Ok(())
	}

	async fn pending_resnapshots(
		&self,
		group: GroupId,
		table: SourceTableId,
	) -> Result<Vec<String>, StorageError> {
		let inner = self.inner.read().await;

		Ok(group_ref(&inner, group)?
			.resnapshot
			.get(&table)
			.map(|keys| keys.iter().cloned().collect())
			.unwrap_or_default())
	}

	async fn sum_checksum(
		&self,
		group: GroupId,
		bucket: &str,
		range: OpRange,
	) -> Result<PartialChecksum, StorageError> {
		let inner = self.inner.read().await;
		let state = group_ref(&inner, group)?;

		let mut aggregate = PartialChecksum::default();

		if range.after >= range.until {
			return Ok(aggregate);
		}

		let start = Bound::Excluded((bucket.to_owned(), range.after));
		let end = Bound::Included((bucket.to_owned(), range.until));

		for (_, op) in state.bucket_data.range((start, end)) {
			if op.op == OpType::Clear {
				// Everything before the CLEAR is absorbed by it.
				aggregate = PartialChecksum {
					count: 1,
					checksum: op.checksum,
					has_clear: true,
				};
			} else {
				aggregate.count += 1;
				aggregate.checksum += op.checksum;
			}
		}

		Ok(aggregate)
	}

	async fn get_bucket_data_batch(
		&self,
		group: GroupId,
		checkpoint: OpId,
		positions: &BTreeMap<BucketName, OpId>,
		limits: BatchLimits,
	) -> Result<Vec<BucketDataChunk>, StorageError> {
		let inner = self.inner.read().await;
		let state = group_ref(&inner, group)?;

		let mut chunks = Vec::new();
		let mut budget = limits.total_ops;

		for (bucket, after) in positions {
			if budget == 0 {
				break;
			}
			if *after >= checkpoint {
				continue;
			}

			let start = Bound::Excluded((bucket.clone(), *after));
			let end = Bound::Included((bucket.clone(), checkpoint));

			let mut data = Vec::new();
			let mut bytes = 0_usize;
			let mut target_op: Option<OpId> = None;
			let mut next_after = *after;
			let mut has_more = false;

			for ((_, op_id), op) in state.bucket_data.range((start, end)) {
				if budget == 0 || bytes >= limits.chunk_bytes {
					has_more = true;
					break;
				}

				let entry = op.to_entry(*op_id);
				bytes += op.data.as_ref().map_or(0, String::len);
				next_after = *op_id;
				budget -= 1;

				if let Some(target) = op.target_op {
					target_op = Some(target_op.map_or(target, |current| current.max(target)));
				}

				data.push(entry);
			}

			if data.is_empty() && !has_more {
				continue;
			}

			chunks.push(BucketDataChunk {
				batch: SyncBucketData {
					bucket: bucket.clone(),
					after: *after,
					next_after,
					has_more,
					data,
				},
				target_op,
			});
		}

		Ok(chunks)
	}

	async fn get_parameter_sets(
		&self,
		group: GroupId,
		lookups: &[Lookup],
	) -> Result<Vec<(Lookup, ParameterSet)>, StorageError> {
		let inner = self.inner.read().await;
		let state = group_ref(&inner, group)?;

		let mut out = Vec::new();

		for lookup in lookups {
			let start = Bound::Included((
				lookup.clone(),
				SourceTableId(Uuid::nil()),
				String::new(),
			));

			for ((candidate, _, _), parameters) in state
				.parameter_rows
				.range((start, Bound::Unbounded))
				.take_while(|((candidate, _, _), _)| candidate == lookup)
			{
				out.push((candidate.clone(), parameters.clone()));
			}
		}

		Ok(out)
	}

	fn subscribe_checkpoints(&self) -> broadcast::Receiver<CheckpointUpdate> {
		self.checkpoint_tx.subscribe()
	}

	async fn active_checkpoint(&self) -> Result<Option<ActiveCheckpoint>, StorageError> {
		let inner = self.inner.read().await;

		Ok(inner
			.groups
			.iter()
			.rev()
			.find(|(_, state)| state.status.state == SyncRuleState::Active)
			.map(|(group, state)| state.active_checkpoint(*group)))
	}

	async fn create_write_checkpoint(
		&self,
		user_id: &str,
		client_id: &str,
		lsn: Lsn,
	) -> Result<OpId, StorageError> {
		let mut inner = self.inner.write().await;

		inner.next_write_checkpoint += 1;
		let seq = inner.next_write_checkpoint;
		inner
			.write_checkpoints
			.insert((user_id.to_owned(), client_id.to_owned()), (seq, lsn));

		Ok(OpId(seq))
	}

	async fn resolve_write_checkpoint(
		&self,
		user_id: &str,
		at: &Lsn,
	) -> Result<Option<OpId>, StorageError> {
		let inner = self.inner.read().await;

		Ok(inner
			.write_checkpoints
			.iter()
			.filter(|((user, _), (_, lsn))| user == user_id && lsn <= at)
			.map(|(_, (seq, _))| OpId(*seq))
			.max())
	}

	async fn restart_replication(&self, group: GroupId) -> Result<(), StorageError> {
		let mut inner = self.inner.write().await;
		let state = group_mut(&mut inner, group)?;

		state.bucket_data.clear();
		state.current_data.clear();
		state.parameter_rows.clear();
		state.resnapshot.clear();
		state.pending_buckets.clear();
		state.pending_lookups.clear();
		state.source_tables.clear();
		state.status.last_checkpoint = None;
		state.status.last_checkpoint_lsn = None;
		state.status.keepalive_op = None;
		state.status.snapshot_done = false;

		debug!(%group, "replication state discarded for restart");

		Ok(())
	}

	async fn clear_bucket_below(
		&self,
		group: GroupId,
		bucket: &str,
		below: OpId,
	) -> Result<(), StorageError> {
		let mut inner = self.inner.write().await;
		let last_op = OpId(self.op_seq.load(Ordering::SeqCst));
		let state = group_mut(&mut inner, group)?;

		let absorbed: Vec<(BucketName, OpId)> = state
			.bucket_data
			.range((
				Bound::Included((bucket.to_owned(), OpId::ZERO)),
				Bound::Included((bucket.to_owned(), below)),
			))
			.map(|(key, _)| key.clone())
			.collect();

		if absorbed.len() < 2 {
			return Ok(());
		}

		let mut checksum = opsync_types::Checksum::ZERO;
		let clear_at = absorbed.last().map(|(_, op_id)| *op_id).unwrap_or(below);

		for key in &absorbed {
			if let Some(op) = state.bucket_data.remove(key) {
				checksum += op.checksum;
			}
		}

		state.bucket_data.insert(
			(bucket.to_owned(), clear_at),
			StoredOp {
				op: OpType::Clear,
				source_table: None,
				source_key: None,
				object_type: None,
				object_id: None,
				subkey: None,
				checksum,
				data: None,
				target_op: Some(last_op),
			},
		);
		state.pending_buckets.insert(bucket.to_owned());

		Ok(())
	}

	async fn move_superseded_below(
		&self,
		group: GroupId,
		bucket: &str,
		below: OpId,
	) -> Result<(), StorageError> {
		let mut inner = self.inner.write().await;
		let last_op = OpId(self.op_seq.load(Ordering::SeqCst));
		let state = group_mut(&mut inner, group)?;

		// Latest op id per row key within the bucket.
		let mut latest: BTreeMap<(Option<SourceTableId>, Option<String>), OpId> = BTreeMap::new();

		for ((candidate, op_id), op) in state.bucket_data.range((
			Bound::Included((bucket.to_owned(), OpId::ZERO)),
			Bound::Unbounded,
		)) {
			if candidate != bucket {
				break;
			}
			latest.insert((op.source_table, op.source_key.clone()), *op_id);
		}

		let superseded: Vec<(BucketName, OpId)> = state
			.bucket_data
			.range((
				Bound::Included((bucket.to_owned(), OpId::ZERO)),
				Bound::Included((bucket.to_owned(), below)),
			))
			.filter(|((_, op_id), op)| {
				matches!(op.op, OpType::Put | OpType::Remove)
					&& latest
						.get(&(op.source_table, op.source_key.clone()))
						.is_some_and(|newest| newest > op_id)
			})
			.map(|(key, _)| key.clone())
			.collect();

		for key in superseded {
			if let Some(op) = state.bucket_data.get_mut(&key) {
				op.op = OpType::Move;
				op.data = None;
				op.object_type = None;
				op.object_id = None;
				op.subkey = None;
				op.target_op = Some(last_op);
			}
		}
		state.pending_buckets.insert(bucket.to_owned());

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use opsync_types::op_checksum;

	use crate::adapter::BucketOpWrite;

	use super::*;

	fn storage() -> MemoryBucketStorage {
		MemoryBucketStorage::new()
	}

	fn rules() -> SyncRules {
		SyncRules::from_json(
			r#"{"bucket_definitions": [{"name": "global", "data": [{"table": "users"}]}]}"#,
		)
		.unwrap()
	}

	fn put(bucket: &str, object_id: &str, data: &str) -> BucketOpWrite {
		BucketOpWrite {
			bucket: bucket.to_owned(),
			op: OpType::Put,
			source_table: None,
			source_key: Some(object_id.to_owned()),
			object_type: Some("users".to_owned()),
			object_id: Some(object_id.to_owned()),
			subkey: None,
			checksum: op_checksum(OpType::Put, Some("users"), Some(object_id), None, Some(data)),
			data: Some(data.to_owned()),
			target_op: None,
		}
	}

	async fn write_ops(
		storage: &MemoryBucketStorage,
		group: GroupId,
		ops: Vec<BucketOpWrite>,
	) -> OpId {
		storage
			.write_batch(
				group,
				WriteBatch {
					ops,
					..WriteBatch::default()
				},
			)
			.await
			.unwrap()
			.last_op_id
			.unwrap()
	}

	#[tokio::test]
	async fn op_ids_are_strictly_monotonic() {
		let storage = storage();
		let group = storage.create_sync_rules(rules()).await.unwrap();

		let first = write_ops(&storage, group, vec![put("global[]", "u1", "{}")]).await;
		let second = write_ops(&storage, group, vec![put("global[]", "u2", "{}")]).await;

		assert!(second > first);
	}

	#[tokio::test]
	async fn sum_checksum_is_additive_and_absorbs_clear() {
		let storage = storage();
		let group = storage.create_sync_rules(rules()).await.unwrap();

		let mid = write_ops(
			&storage,
			group,
			vec![put("global[]", "u1", "{}"), put("global[]", "u2", "{}")],
		)
		.await;
		let end = write_ops(&storage, group, vec![put("global[]", "u3", "{}")]).await;

		let full = storage
			.sum_checksum(group, "global[]", OpRange { after: OpId::ZERO, until: end })
			.await
			.unwrap();
		let head = storage
			.sum_checksum(group, "global[]", OpRange { after: OpId::ZERO, until: mid })
			.await
			.unwrap();
		let tail = storage
			.sum_checksum(group, "global[]", OpRange { after: mid, until: end })
			.await
			.unwrap();

		assert_eq!(full.count, 3);
		assert_eq!(head.extend(tail), full);

		// Collapse everything below `mid` into a CLEAR; totals must not move.
		storage
			.clear_bucket_below(group, "global[]", mid)
			.await
			.unwrap();

		let after_clear = storage
			.sum_checksum(group, "global[]", OpRange { after: OpId::ZERO, until: end })
			.await
			.unwrap();

		assert_eq!(after_clear.checksum, full.checksum);
		assert_eq!(after_clear.count, 2); // CLEAR plus the trailing PUT

		let tail_with_clear = storage
			.sum_checksum(group, "global[]", OpRange { after: OpId(1), until: end })
			.await
			.unwrap();
		assert!(tail_with_clear.has_clear);
	}

	#[tokio::test]
	async fn bucket_data_batches_respect_limits_and_positions() {
		let storage = storage();
		let group = storage.create_sync_rules(rules()).await.unwrap();

		let ops = (0..5)
			.map(|i| put("global[]", &format!("u{i}"), "{}"))
			.collect();
		let end = write_ops(&storage, group, ops).await;

		let mut positions = BTreeMap::from([("global[]".to_owned(), OpId::ZERO)]);
		let limits = BatchLimits {
			total_ops: 2,
			chunk_bytes: 1024 * 1024,
		};

		let mut seen = Vec::new();
		loop {
			let chunks = storage
				.get_bucket_data_batch(group, end, &positions, limits)
				.await
				.unwrap();
			if chunks.is_empty() {
				break;
			}
			for chunk in chunks {
				seen.extend(chunk.batch.data.iter().map(|entry| entry.op_id));
				if chunk.batch.has_more {
					positions.insert(chunk.batch.bucket.clone(), chunk.batch.next_after);
				} else {
					positions.remove(&chunk.batch.bucket);
				}
			}
		}

		assert_eq!(seen.len(), 5);
		assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
	}

	#[tokio::test]
	async fn activation_demotes_previous_versions() {
		let storage = storage();
		let first = storage.create_sync_rules(rules()).await.unwrap();
		let second = storage.create_sync_rules(rules()).await.unwrap();

		storage.activate_sync_rules(first).await.unwrap();
		storage.activate_sync_rules(second).await.unwrap();

		assert_eq!(
			storage.sync_rules_status(first).await.unwrap().state,
			SyncRuleState::Stop
		);
		assert_eq!(
			storage.sync_rules_status(second).await.unwrap().state,
			SyncRuleState::Active
		);
		assert_eq!(storage.active_rules().await.unwrap().unwrap().group, second);
	}

	#[tokio::test]
	async fn checkpoint_notifications_carry_updated_buckets() {
		let storage = storage();
		let group = storage.create_sync_rules(rules()).await.unwrap();
		storage.activate_sync_rules(group).await.unwrap();

		let mut watcher = storage.subscribe_checkpoints();
		// Drain the activation notification if it raced our subscribe.
		while let Ok(update) = watcher.try_recv() {
			assert!(update.invalidate_all);
		}

		let last = write_ops(&storage, group, vec![put("global[]", "u1", "{}")]).await;
		storage
			.update_checkpoint_state(
				group,
				CheckpointStateUpdate {
					last_checkpoint: Some(last),
					last_checkpoint_lsn: Some(Lsn::from("0/1")),
					..CheckpointStateUpdate::default()
				},
			)
			.await
			.unwrap();

		let update = watcher.recv().await.unwrap();
		assert_eq!(update.checkpoint.checkpoint, last);
		assert!(update.updated_buckets.contains("global[]"));
		assert!(!update.invalidate_all);
	}

	#[tokio::test]
	async fn checkpoint_regression_is_an_assertion() {
		let storage = storage();
		let group = storage.create_sync_rules(rules()).await.unwrap();

		let last = write_ops(&storage, group, vec![put("global[]", "u1", "{}")]).await;
		storage
			.update_checkpoint_state(
				group,
				CheckpointStateUpdate {
					last_checkpoint: Some(last),
					last_checkpoint_lsn: Some(Lsn::from("0/2")),
					..CheckpointStateUpdate::default()
				},
			)
			.await
			.unwrap();

		let err = storage
			.update_checkpoint_state(
				group,
				CheckpointStateUpdate {
					last_checkpoint: Some(OpId(last.0 - 1)),
					..CheckpointStateUpdate::default()
				},
			)
			.await
			.unwrap_err();

		assert!(matches!(err, StorageError::Assertion(_)));
	}

	#[tokio::test]
	async fn move_superseded_preserves_checksums() {
		let storage = storage();
		let group = storage.create_sync_rules(rules()).await.unwrap();

		write_ops(&storage, group, vec![put("global[]", "u1", r#"{"v":1}"#)]).await;
		let end = write_ops(&storage, group, vec![put("global[]", "u1", r#"{"v":2}"#)]).await;

		let before = storage
			.sum_checksum(group, "global[]", OpRange { after: OpId::ZERO, until: end })
			.await
			.unwrap();

		storage
			.move_superseded_below(group, "global[]", end)
			.await
			.unwrap();

		let after = storage
			.sum_checksum(group, "global[]", OpRange { after: OpId::ZERO, until: end })
			.await
			.unwrap();
		assert_eq!(before, after);

		let positions = BTreeMap::from([("global[]".to_owned(), OpId::ZERO)]);
		let chunks = storage
			.get_bucket_data_batch(group, end, &positions, BatchLimits::default())
			.await
			.unwrap();

		assert_eq!(chunks[0].batch.data[0].op, OpType::Move);
		assert!(chunks[0].target_op.is_some());
	}

	#[tokio::test]
	async fn identity_change_drops_old_table_data() {
		let storage = storage();
		let group = storage.create_sync_rules(rules()).await.unwrap();

		let identity = SourceTableIdentity {
			connection_id: 1,
			relation_id: Some(10),
			schema: "public".to_owned(),
			name: "users".to_owned(),
			replica_id_columns: vec!["id".to_owned()],
		};
		let table = storage
			.resolve_source_table(group, identity.clone())
			.await
			.unwrap();

		storage
			.write_batch(
				group,
				WriteBatch {
					current_data: vec![crate::adapter::CurrentDataWrite {
						table: table.id,
						key: "u1".to_owned(),
						value: Some(CurrentDataRecord::default()),
					}],
					..WriteBatch::default()
				},
			)
			.await
			.unwrap();

		let changed = storage
			.resolve_source_table(
				group,
				SourceTableIdentity {
					replica_id_columns: vec!["uuid".to_owned()],
					..identity
				},
			)
			.await
			.unwrap();

		assert_ne!(changed.id, table.id);
		assert!(storage
			.get_current_data(group, table.id, "u1")
			.await
			.unwrap()
			.is_none());
	}
}

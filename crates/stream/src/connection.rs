//! Per-connection checkpoint state: what the client has been told, where each
//! bucket's download stands, and how the next checkpoint line is derived.

use std::{
	collections::{BTreeMap, BTreeSet},
	sync::Arc,
};

use tracing::trace;

use opsync_rules::BucketDescription;
use opsync_storage::{BucketStorage, CheckpointUpdate, GroupId};
use opsync_types::{
	BucketChecksum, BucketName, CheckpointComplete, Lsn, OpId, PartialCheckpointComplete,
	StreamingCheckpoint, StreamingCheckpointDiff, SyncLine,
};

use crate::{
	checksum_cache::ChecksumCache,
	resolver::{BucketParameterResolver, BucketUpdates},
	SyncStreamError,
};

/// A checkpoint line ready to send, plus what must be fetched below it.
#[derive(Debug)]
pub struct CheckpointLine {
	pub line: SyncLine,
	pub checkpoint: OpId,
	pub lsn: Lsn,
	pub buckets_to_fetch: Vec<BucketDescription>,
}

pub struct ConnectionState {
	resolver: BucketParameterResolver,
	cache: Arc<ChecksumCache>,
	storage: Arc<dyn BucketStorage>,
	group: GroupId,
	user_id: String,
	/// Checksums as last reported to the client.
	last_checksums: Option<BTreeMap<BucketName, BucketChecksum>>,
	last_write_checkpoint: Option<OpId>,
	/// Next `after` position per bucket.
	positions: BTreeMap<BucketName, OpId>,
	/// Buckets with data not yet fully delivered.
	pending: BTreeSet<BucketName>,
	max_buckets: usize,
}

impl ConnectionState {
	#[must_use]
	pub fn new(
		resolver: BucketParameterResolver,
		cache: Arc<ChecksumCache>,
		storage: Arc<dyn BucketStorage>,
		group: GroupId,
		user_id: String,
		initial_positions: BTreeMap<BucketName, OpId>,
		max_buckets: usize,
	) -> Self {
		Self {
			resolver,
			cache,
			storage,
			group,
			user_id,
			last_checksums: None,
			last_write_checkpoint: None,
			positions: initial_positions,
			pending: BTreeSet::new(),
			max_buckets,
		}
	}

	/// Derive the next checkpoint line for `update`, or `None` when nothing
	/// relevant to this connection changed.
	pub async fn build_next_checkpoint_line(
		&mut self,
		update: &CheckpointUpdate,
	) -> Result<Option<CheckpointLine>, SyncStreamError> {
		let resolved = self.resolver.buckets_for(update).await?;

		if resolved.buckets.len() > self.max_buckets {
			return Err(SyncStreamError::TooManyBuckets {
				count: resolved.buckets.len(),
				max: self.max_buckets,
			});
		}

		let checkpoint = update.checkpoint.checkpoint;
		let write_checkpoint = self
			.storage
			.resolve_write_checkpoint(&self.user_id, &update.checkpoint.lsn)
			.await?;

		if self.last_checksums.is_some()
			&& write_checkpoint == self.last_write_checkpoint
			&& matches!(&resolved.updates, BucketUpdates::Exact(updated) if updated.is_empty())
		{
			trace!("checkpoint update carries nothing for this connection");
			return Ok(None);
		}

		// Re-checksum only what changed; everything else is carried over.
		let to_fetch: Vec<BucketDescription> = match &resolved.updates {
			BucketUpdates::InvalidateAll => resolved.buckets.clone(),
			BucketUpdates::Exact(updated) => resolved
				.buckets
				.iter()
				.filter(|description| {
					updated.contains(&description.bucket)
						|| self
							.last_checksums
							.as_ref()
							.is_none_or(|prev| !prev.contains_key(&description.bucket))
				})
				.cloned()
				.collect(),
		};

		let fetched = self
			.cache
			.get_checksums(self.group, checkpoint, &to_fetch)
			.await?;

		let mut checksums = BTreeMap::new();
		for description in &resolved.buckets {
			let entry = match fetched.get(&description.bucket) {
				Some(entry) => entry.clone(),
				None => self
					.last_checksums
					.as_ref()
					.and_then(|prev| prev.get(&description.bucket))
					.cloned()
					.ok_or_else(|| {
						SyncStreamError::MissingChecksum(description.bucket.clone())
					})?,
			};
			checksums.insert(description.bucket.clone(), entry);
		}

		let (line, changed): (SyncLine, BTreeSet<BucketName>) = match &self.last_checksums {
			None => {
				let changed = checksums.keys().cloned().collect();
				(
					SyncLine::Checkpoint(StreamingCheckpoint {
						last_op_id: checkpoint,
						write_checkpoint,
						buckets: checksums.values().cloned().collect(),
					}),
					changed,
				)
			}
			Some(previous) => {
				let updated: Vec<BucketChecksum> = checksums
					.values()
					.filter(|entry| previous.get(&entry.bucket) != Some(*entry))
					.cloned()
					.collect();
				let removed: Vec<BucketName> = previous
					.keys()
					.filter(|bucket| !checksums.contains_key(*bucket))
					.cloned()
					.collect();
				let changed = updated.iter().map(|entry| entry.bucket.clone()).collect();

				(
					SyncLine::CheckpointDiff(StreamingCheckpointDiff {
						last_op_id: checkpoint,
						write_checkpoint,
						updated_buckets: updated,
						removed_buckets: removed,
					}),
					changed,
				)
			}
		};

		// Fetch set: updated buckets plus whatever is still pending delivery
		// from earlier checkpoints, as long as it still exists.
		self.pending.extend(changed);
		self.pending
			.retain(|bucket| checksums.contains_key(bucket));

		let buckets_to_fetch: Vec<BucketDescription> = resolved
			.buckets
			.iter()
			.filter(|description| self.pending.contains(&description.bucket))
			.cloned()
			.collect();

		// Positions default to zero and never run past the checkpoint.
		for description in &buckets_to_fetch {
			let position = self
				.positions
				.entry(description.bucket.clone())
				.or_insert(OpId::ZERO);
			*position = (*position).min(checkpoint);
		}
		self.positions
			.retain(|bucket, _| checksums.contains_key(bucket));

		self.last_checksums = Some(checksums);
		self.last_write_checkpoint = write_checkpoint;

		Ok(Some(CheckpointLine {
			line,
			checkpoint,
			lsn: update.checkpoint.lsn.clone(),
			buckets_to_fetch,
		}))
	}

	/// Positions for a subset of buckets, keyed for a storage batch request.
	#[must_use]
	pub fn positions_for(&self, buckets: &[BucketDescription]) -> BTreeMap<BucketName, OpId> {
		buckets
			.iter()
			.filter_map(|description| {
				self.positions
					.get(&description.bucket)
					.map(|after| (description.bucket.clone(), *after))
			})
			.collect()
	}

	/// Record delivery progress for one bucket chunk. Safe to call before the
	/// chunk is flushed to the socket: re-sending from the new position never
	/// skips ops the client has not seen.
	pub fn update_bucket_position(&mut self, bucket: &str, next_after: OpId, has_more: bool) {
		self.positions.insert(bucket.to_owned(), next_after);
		if !has_more {
			self.pending.remove(bucket);
		}
	}

	#[must_use]
	pub fn checkpoint_complete_line(checkpoint: OpId) -> SyncLine {
		SyncLine::CheckpointComplete(CheckpointComplete {
			last_op_id: checkpoint,
		})
	}

	#[must_use]
	pub fn partial_checkpoint_complete_line(
		checkpoint: OpId,
		priority: opsync_types::BucketPriority,
	) -> SyncLine {
		SyncLine::PartialCheckpointComplete(PartialCheckpointComplete {
			last_op_id: checkpoint,
			priority,
		})
	}
}

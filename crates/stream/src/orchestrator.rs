//! The per-connection sync stream loop: awaits checkpoints from the shared
//! watcher, emits checkpoint lines, and drains bucket data by priority with
//! mid-checkpoint preemption, global concurrency gating, and token expiry.

use std::{collections::BTreeMap, sync::Arc};

use async_stream::try_stream;
use futures::{FutureExt, Stream};
use futures_concurrency::future::Race;
use tokio::{
	sync::{OwnedSemaphorePermit, Semaphore},
	time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use opsync_rules::{BucketDescription, RequestParameters};
use opsync_storage::BucketStorage;
use opsync_types::{BucketName, BucketPriority, BucketRequest, OpId, SyncBucketData, SyncLine};

use crate::{
	checksum_cache::ChecksumCache,
	connection::ConnectionState,
	demux::CheckpointDemux,
	resolver::BucketParameterResolver,
	SyncStreamError, SyncStreamTuning,
};

/// One item of the outgoing stream. `FlushHint` asks the transport to flush
/// buffered frames and release references to large payloads; it is never a
/// terminator.
#[derive(Debug)]
pub enum StreamEvent {
	Line(SyncLine),
	FlushHint,
}

/// Per-request inputs of one streaming sync connection.
#[derive(Debug, Clone)]
pub struct SyncStreamParams {
	pub request: RequestParameters,
	pub client_id: Option<String>,
	pub initial_buckets: Vec<BucketRequest>,
	/// Deadline derived from the token's `exp` (minus skew); the stream ends
	/// cleanly when it passes.
	pub token_expires_at: Option<Instant>,
}

enum Wake {
	Aborted,
	TokenExpired,
	Update(Option<Result<opsync_storage::CheckpointUpdate, SyncStreamError>>),
}

/// Shared streaming service: one per process, shared by every connection.
/// Clones share the same caches, demultiplexer, and fetch permits.
#[derive(Clone)]
pub struct SyncStreamService {
	storage: Arc<dyn BucketStorage>,
	cache: Arc<ChecksumCache>,
	demux: Arc<CheckpointDemux>,
	fetch_permits: Arc<Semaphore>,
	tuning: SyncStreamTuning,
}

impl SyncStreamService {
	#[must_use]
	pub fn new(storage: Arc<dyn BucketStorage>, tuning: SyncStreamTuning) -> Arc<Self> {
		Arc::new(Self {
			cache: Arc::new(ChecksumCache::new(
				Arc::clone(&storage),
				tuning.checksum_cache_capacity,
			)),
			demux: Arc::new(CheckpointDemux::new(Arc::clone(&storage))),
			fetch_permits: Arc::new(Semaphore::new(tuning.max_active_connections)),
			storage,
			tuning,
		})
	}

	#[must_use]
	pub fn storage(&self) -> &Arc<dyn BucketStorage> {
		&self.storage
	}

	#[must_use]
	pub fn checksum_cache(&self) -> &Arc<ChecksumCache> {
		&self.cache
	}

	/// Run one connection. The returned stream ends when the client aborts,
	/// the token expires, or the upstream closes; protocol errors surface as
	/// the final item.
	pub fn stream_sync(
		&self,
		params: SyncStreamParams,
		abort: CancellationToken,
	) -> impl Stream<Item = Result<StreamEvent, SyncStreamError>> + Send {
		let service = self.clone();

		try_stream! {
			let active = service
				.storage
				.active_rules()
				.await?
				.ok_or(SyncStreamError::NoActiveSyncRules)?;
			let group = active.group;

			let resolver = BucketParameterResolver::new(
				Arc::clone(&active.rules),
				Arc::clone(&service.storage),
				group,
				&params.request,
				service.tuning.max_parameter_query_results,
			);

			let initial_positions: BTreeMap<BucketName, OpId> = params
				.initial_buckets
				.iter()
				.map(|bucket| (bucket.name.clone(), bucket.after))
				.collect();

			let mut state = ConnectionState::new(
				resolver,
				Arc::clone(&service.cache),
				Arc::clone(&service.storage),
				group,
				params.request.user_id.clone(),
				initial_positions,
				service.tuning.max_buckets_per_connection,
			);

			let mut subscription = service.demux.subscribe(&params.request.user_id).await?;

			debug!(user_id = %params.request.user_id, %group, "sync stream started");

			'connection: loop {
				// Race the next checkpoint against token expiry and abort.
				let wake = (
					abort.cancelled().map(|()| Wake::Aborted),
					expiry(params.token_expires_at).map(|()| Wake::TokenExpired),
					subscription.next().map(Wake::Update),
				)
					.race()
					.await;

				let update = match wake {
					Wake::Aborted => break 'connection,
					Wake::TokenExpired => {
						debug!("token expired, ending stream");
						yield StreamEvent::Line(SyncLine::TokenExpires {});
						break 'connection;
					}
					Wake::Update(None) => break 'connection,
					Wake::Update(Some(update)) => update?,
				};

				let Some(line) = state.build_next_checkpoint_line(&update).await? else {
					continue;
				};

				let checkpoint = line.checkpoint;
				let buckets_to_fetch = line.buckets_to_fetch;

				yield StreamEvent::Line(line.line);

				// Priority 0 ships first; BTreeMap iteration is ascending.
				let mut groups: BTreeMap<BucketPriority, Vec<BucketDescription>> = BTreeMap::new();
				for description in buckets_to_fetch {
					groups.entry(description.priority).or_default().push(description);
				}

				let group_count = groups.len();
				let batch_abort = abort.child_token();
				let mut monitor: Option<tokio::task::JoinHandle<()>> = None;
				let mut synced_ops = 0_usize;
				let mut checkpoint_invalidated = false;

				for (index, (priority, buckets)) in groups.into_iter().enumerate() {
					if batch_abort.is_cancelled() {
						break;
					}

					let mut positions = state.positions_for(&buckets);

					'priority: while !positions.is_empty() && !batch_abort.is_cancelled() {
						let Some(permit) = acquire_fetch_permit(
							&service.fetch_permits,
							&service.tuning,
							&batch_abort,
						)
						.await?
						else {
							// Aborted while waiting for a slot.
							break 'priority;
						};

						let chunks = service
							.storage
							.get_bucket_data_batch(
								group,
								checkpoint,
								&positions,
								service.tuning.batch_limits,
							)
							.await?;
						release_fetch_permit(permit);

						if chunks.is_empty() {
							break 'priority;
						}

						for chunk in chunks {
							if chunk.target_op.is_some_and(|target| target > checkpoint) {
								// A MOVE/CLEAR points past this checkpoint;
								// claiming completion would lie. The next
								// checkpoint line supersedes this cycle.
								checkpoint_invalidated = true;
							}

							let batch = chunk.batch;

							if batch.has_more {
								positions.insert(batch.bucket.clone(), batch.next_after);
							} else {
								positions.remove(&batch.bucket);
							}

							state.update_bucket_position(
								&batch.bucket,
								batch.next_after,
								batch.has_more,
							);
							synced_ops += batch.data.len();

							let flush_after =
								estimated_size(&batch) >= service.tuning.flush_hint_bytes;

							trace!(
								bucket = %batch.bucket,
								ops = batch.data.len(),
								"emitting bucket data frame"
							);

							yield StreamEvent::Line(SyncLine::Data(batch));

							if flush_after {
								// Let the transport release the large buffer.
								yield StreamEvent::FlushHint;
							}

							if batch_abort.is_cancelled() {
								// Positions were already advanced, so the data
								// sent so far stays consistent.
								break 'priority;
							}
						}
					}

					if batch_abort.is_cancelled() {
						break;
					}

					if index + 1 < group_count {
						yield StreamEvent::Line(ConnectionState::partial_checkpoint_complete_line(
							checkpoint,
							priority,
						));
					}

					// After the first completed priority, once enough ops went
					// out, let a newer checkpoint preempt the rest of this one.
					if monitor.is_none() && synced_ops >= service.tuning.preempt_after_ops {
						let watch = subscription.watch();
						let preempt = batch_abort.clone();

						monitor = Some(tokio::spawn(async move {
							watch.wait_changed().await;
							preempt.cancel();
						}));
					}
				}

				if let Some(monitor) = monitor {
					monitor.abort();
				}

				if abort.is_cancelled() {
					break 'connection;
				}

				if !batch_abort.is_cancelled() && !checkpoint_invalidated {
					yield StreamEvent::Line(ConnectionState::checkpoint_complete_line(checkpoint));
				}

				sleep(service.tuning.yield_interval).await;
			}

			debug!("sync stream ended");
		}
	}
}

/// Wait for expiry, or forever when the token has no deadline.
async fn expiry(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

async fn acquire_fetch_permit(
	permits: &Arc<Semaphore>,
	tuning: &SyncStreamTuning,
	abort: &CancellationToken,
) -> Result<Option<OwnedSemaphorePermit>, SyncStreamError> {
	tokio::select! {
		() = abort.cancelled() => Ok(None),
		acquired = timeout(tuning.fetch_timeout, Arc::clone(permits).acquire_owned()) => {
			match acquired {
				Ok(Ok(permit)) => Ok(Some(permit)),
				// Semaphore closed means shutdown; surface as abort.
				Ok(Err(_)) => Ok(None),
				Err(_) => Err(SyncStreamError::SyncLockTimeout),
			}
		}
	}
}

/// Releasing is dropping; spelled out so every unwind path reads the same.
fn release_fetch_permit(permit: OwnedSemaphorePermit) {
	drop(permit);
}

fn estimated_size(batch: &SyncBucketData) -> usize {
	// Rough encoded size: payload bytes plus per-op framing overhead.
	batch
		.data
		.iter()
		.map(|entry| entry.data.as_ref().map_or(0, String::len) + 96)
		.sum()
}

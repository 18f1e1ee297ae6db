//! Read-through cache for per-bucket checksums.
//!
//! Entries are immutable once inserted and keyed by `(bucket, op_id)`; an
//! entry always covers the full range `(0, op_id]`. Serial callers extend the
//! newest cached entry with a partial `(cached, requested]` lookup; concurrent
//! callers for the same upper bound share a single in-flight fetch and never
//! build on partials they cannot know are complete.

use std::{
	collections::{BTreeMap, HashMap},
	num::NonZeroUsize,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::trace;

use opsync_rules::BucketDescription;
use opsync_storage::{BucketStorage, GroupId, OpRange};
use opsync_types::{BucketChecksum, BucketName, Checksum, OpId, PartialChecksum};

use crate::SyncStreamError;

type CacheKey = (GroupId, BucketName, OpId);
type FetchKey = (GroupId, BucketName, OpId, OpId);
type FetchResult = Option<Result<FullChecksum, String>>;

/// Checksum over the full `(0, op_id]` range of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FullChecksum {
	count: u64,
	checksum: Checksum,
}

struct CacheState {
	entries: LruCache<CacheKey, FullChecksum>,
	/// Highest cached upper bound per bucket, for serial extension. May point
	/// at an evicted entry; validated on use.
	latest_end: HashMap<(GroupId, BucketName), OpId>,
	inflight: HashMap<FetchKey, watch::Receiver<FetchResult>>,
}

pub struct ChecksumCache {
	storage: Arc<dyn BucketStorage>,
	state: Mutex<CacheState>,
	fetches: AtomicU64,
}

enum Plan {
	Hit(FullChecksum),
	Join {
		key: FetchKey,
		rx: watch::Receiver<FetchResult>,
	},
	Fetch {
		key: FetchKey,
		base: Option<FullChecksum>,
		tx: watch::Sender<FetchResult>,
	},
}

impl ChecksumCache {
	#[must_use]
	pub fn new(storage: Arc<dyn BucketStorage>, capacity: usize) -> Self {
		let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");

		Self {
			storage,
			state: Mutex::new(CacheState {
				entries: LruCache::new(capacity),
				latest_end: HashMap::new(),
				inflight: HashMap::new(),
			}),
			fetches: AtomicU64::new(0),
		}
	}

	/// Storage lookups performed so far; exposed for telemetry.
	#[must_use]
	pub fn fetch_count(&self) -> u64 {
		self.fetches.load(Ordering::Relaxed)
	}

	pub async fn get_checksums(
		&self,
		group: GroupId,
		checkpoint: OpId,
		buckets: &[BucketDescription],
	) -> Result<BTreeMap<BucketName, BucketChecksum>, SyncStreamError> {
		let mut out = BTreeMap::new();

		for description in buckets {
			let full = self
				.bucket_checksum(group, &description.bucket, checkpoint)
				.await?;

			out.insert(
				description.bucket.clone(),
				BucketChecksum {
					bucket: description.bucket.clone(),
					checksum: full.checksum,
					count: full.count,
					priority: description.priority,
				},
			);
		}

		Ok(out)
	}

	async fn bucket_checksum(
		&self,
		group: GroupId,
		bucket: &str,
		end: OpId,
	) -> Result<FullChecksum, SyncStreamError> {
		loop {
			let plan = self.plan(group, bucket, end);

			match plan {
				Plan::Hit(entry) => return Ok(entry),
				Plan::Join { key, mut rx } => {
					loop {
						if let Some(result) = rx.borrow().clone() {
							match result {
								Ok(entry) => return Ok(entry),
								Err(message) => {
									return Err(SyncStreamError::Watcher(message));
								}
							}
						}

						if rx.changed().await.is_err() {
							// Fetch owner dropped without a result; clear the
							// stale in-flight entry and replan.
							self.remove_dead_inflight(&key);
							break;
						}
					}
				}
				Plan::Fetch { key, base, tx } => {
					return self.fetch(key, base, end, tx).await;
				}
			}
		}
	}

	fn plan(&self, group: GroupId, bucket: &str, end: OpId) -> Plan {
		let mut state = self.state.lock();

		if let Some(entry) = state.entries.get(&(group, bucket.to_owned(), end)) {
			return Plan::Hit(*entry);
		}

		// Serial extension: only a *completed* cache entry may serve as base.
		let base = match state
			.latest_end
			.get(&(group, bucket.to_owned()))
			.copied()
			.filter(|cached| *cached < end)
		{
			Some(cached) => {
				let entry = state.entries.get(&(group, bucket.to_owned(), cached)).copied();
				if entry.is_none() {
					// Evicted; forget the stale pointer.
					state.latest_end.remove(&(group, bucket.to_owned()));
				}
				entry.map(|entry| (cached, entry))
			}
			None => None,
		};

		let (after, base_entry) = match base {
			Some((cached, entry)) => (cached, Some(entry)),
			None => (OpId::ZERO, None),
		};

		let key = (group, bucket.to_owned(), after, end);

		if let Some(rx) = state.inflight.get(&key) {
			return Plan::Join {
				key,
				rx: rx.clone(),
			};
		}

		let (tx, rx) = watch::channel(None);
		state.inflight.insert(key.clone(), rx);

		Plan::Fetch {
			key,
			base: base_entry,
			tx,
		}
	}

	fn remove_dead_inflight(&self, key: &FetchKey) {
		let mut state = self.state.lock();

		if let Some(rx) = state.inflight.get(key) {
			if rx.has_changed().is_err() {
				state.inflight.remove(key);
			}
		}
	}

	async fn fetch(
		&self,
		key: FetchKey,
		base: Option<FullChecksum>,
		end: OpId,
		tx: watch::Sender<FetchResult>,
	) -> Result<FullChecksum, SyncStreamError> {
		let (group, bucket, after, _) = &key;

		trace!(bucket = %bucket, %after, %end, "fetching bucket checksum range");
		self.fetches.fetch_add(1, Ordering::Relaxed);

		let result = self
			.storage
			.sum_checksum(*group, bucket, OpRange { after: *after, until: end })
			.await;

		let mut state = self.state.lock();
		state.inflight.remove(&key);

		match result {
			Ok(partial) => {
				let full = compose(base, partial);

				state.entries.put((*group, bucket.clone(), end), full);
				state
					.latest_end
					.entry((*group, bucket.clone()))
					.and_modify(|latest| *latest = (*latest).max(end))
					.or_insert(end);
				drop(state);

				let _ = tx.send(Some(Ok(full)));
				Ok(full)
			}
			Err(e) => {
				drop(state);
				let _ = tx.send(Some(Err(e.to_string())));
				Err(e.into())
			}
		}
	}
}

fn compose(base: Option<FullChecksum>, partial: PartialChecksum) -> FullChecksum {
	match base {
		// A CLEAR inside the partial range absorbs the cached prefix.
		Some(base) if !partial.has_clear => FullChecksum {
			count: base.count + partial.count,
			checksum: base.checksum + partial.checksum,
		},
		_ => FullChecksum {
			count: partial.count,
			checksum: partial.checksum,
		},
	}
}

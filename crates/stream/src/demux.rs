//! Checkpoint watcher demultiplexer.
//!
//! Many connections share one upstream subscription to the storage layer's
//! checkpoint notifications. The upstream starts lazily with the first
//! subscriber and tears down with the last; every subscriber has a single-slot
//! "last value wins" mailbox so a slow connection only ever sees the newest
//! checkpoint, never a growing queue.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{broadcast::error::RecvError, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use opsync_storage::{BucketStorage, CheckpointUpdate};

use crate::SyncStreamError;

#[derive(Debug)]
enum SlotState {
	Empty,
	Value(CheckpointUpdate),
	Failed(String),
	Closed,
}

struct Slot {
	state: Mutex<SlotState>,
	notify: Notify,
}

impl Slot {
	fn new() -> Arc<Self> {
		Arc::new(Self {
			state: Mutex::new(SlotState::Empty),
			notify: Notify::new(),
		})
	}

	/// Overwrite whatever the subscriber has not consumed yet.
	fn publish(&self, update: CheckpointUpdate) {
		let mut state = self.state.lock();
		if matches!(*state, SlotState::Closed | SlotState::Failed(_)) {
			return;
		}
		*state = SlotState::Value(update);
		drop(state);
		self.notify.notify_waiters();
	}

	fn fail(&self, message: String) {
		*self.state.lock() = SlotState::Failed(message);
		self.notify.notify_waiters();
	}

	fn close(&self) {
		let mut state = self.state.lock();
		if !matches!(*state, SlotState::Failed(_)) {
			*state = SlotState::Closed;
		}
		drop(state);
		self.notify.notify_waiters();
	}

	fn publish_if_empty(&self, update: CheckpointUpdate) {
		let mut state = self.state.lock();
		if matches!(*state, SlotState::Empty) {
			*state = SlotState::Value(update);
			drop(state);
			self.notify.notify_waiters();
		}
	}

	fn take(&self) -> Option<Result<Option<CheckpointUpdate>, String>> {
		let mut state = self.state.lock();
		match &*state {
			SlotState::Empty => None,
			SlotState::Value(_) => {
				let SlotState::Value(update) = std::mem::replace(&mut *state, SlotState::Empty)
				else {
					unreachable!()
				};
				Some(Ok(Some(update)))
			}
			SlotState::Failed(message) => Some(Err(message.clone())),
			SlotState::Closed => Some(Ok(None)),
		}
	}

	/// Wait until a value, error, or close is available, without consuming.
	async fn wait_ready(&self) {
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			if !matches!(*self.state.lock(), SlotState::Empty) {
				return;
			}

			notified.await;
		}
	}
}

struct DemuxShared {
	subscribers: HashMap<u64, Arc<Slot>>,
	next_id: u64,
	upstream: Option<CancellationToken>,
}

pub struct CheckpointDemux {
	storage: Arc<dyn BucketStorage>,
	shared: Arc<Mutex<DemuxShared>>,
}

impl CheckpointDemux {
	#[must_use]
	pub fn new(storage: Arc<dyn BucketStorage>) -> Self {
		Self {
			storage,
			shared: Arc::new(Mutex::new(DemuxShared {
				subscribers: HashMap::new(),
				next_id: 0,
				upstream: None,
			})),
		}
	}

	/// Subscribe on behalf of one connection. The first value is synthesized
	/// from the current active checkpoint so the subscriber never starts
	/// blind; live updates may overwrite it before it is consumed.
	pub async fn subscribe(
		&self,
		user_id: &str,
	) -> Result<CheckpointSubscription, SyncStreamError> {
		let slot = Slot::new();

		let id = {
			let mut shared = self.shared.lock();
			let id = shared.next_id;
			shared.next_id += 1;
			shared.subscribers.insert(id, Arc::clone(&slot));

			if shared.upstream.is_none() {
				let cancel = CancellationToken::new();
				shared.upstream = Some(cancel.clone());

				tokio::spawn(run_upstream(
					Arc::clone(&self.storage),
					Arc::clone(&self.shared),
					cancel,
				));
			}

			id
		};

		debug!(user_id, subscriber = id, "checkpoint subscriber attached");

		match self.first_value().await {
			Ok(initial) => slot.publish_if_empty(initial),
			Err(e) => {
				self.detach(id);
				return Err(e);
			}
		}

		Ok(CheckpointSubscription {
			id,
			slot,
			shared: Arc::clone(&self.shared),
		})
	}

	async fn first_value(&self) -> Result<CheckpointUpdate, SyncStreamError> {
		let checkpoint = self
			.storage
			.active_checkpoint()
			.await?
			.ok_or(SyncStreamError::NoActiveSyncRules)?;

		Ok(CheckpointUpdate {
			checkpoint,
			updated_buckets: Arc::default(),
			updated_parameter_lookups: Arc::default(),
			invalidate_all: true,
		})
	}

	fn detach(&self, id: u64) {
		detach_subscriber(&self.shared, id);
	}
}

fn detach_subscriber(shared: &Arc<Mutex<DemuxShared>>, id: u64) {
	let mut shared = shared.lock();
	shared.subscribers.remove(&id);

	if shared.subscribers.is_empty() {
		// Last subscriber gone; stop the upstream within one iteration.
		if let Some(cancel) = shared.upstream.take() {
			cancel.cancel();
		}
	}
}

async fn run_upstream(
	storage: Arc<dyn BucketStorage>,
	shared: Arc<Mutex<DemuxShared>>,
	cancel: CancellationToken,
) {
	let mut rx = storage.subscribe_checkpoints();

	debug!("checkpoint upstream subscription started");

	loop {
		let result = tokio::select! {
			() = cancel.cancelled() => {
				debug!("checkpoint upstream subscription stopped");
				return;
			}
			result = rx.recv() => result,
		};

		match result {
			Ok(update) => {
				for slot in shared.lock().subscribers.values() {
					slot.publish(update.clone());
				}
			}
			Err(RecvError::Lagged(skipped)) => {
				// Mailboxes are last-value-wins anyway; resynthesize from the
				// current state and force a full re-evaluation.
				warn!(skipped, "checkpoint upstream lagged, resynchronizing");

				match storage.active_checkpoint().await {
					Ok(Some(checkpoint)) => {
						let update = CheckpointUpdate {
							checkpoint,
							updated_buckets: Arc::default(),
							updated_parameter_lookups: Arc::default(),
							invalidate_all: true,
						};
						for slot in shared.lock().subscribers.values() {
							slot.publish(update.clone());
						}
					}
					Ok(None) => {}
					Err(e) => {
						for slot in shared.lock().subscribers.values() {
							slot.fail(e.to_string());
						}
						return;
					}
				}
			}
			Err(RecvError::Closed) => {
				for slot in shared.lock().subscribers.values() {
					slot.close();
				}
				return;
			}
		}
	}
}

/// One connection's view of the shared checkpoint stream.
pub struct CheckpointSubscription {
	id: u64,
	slot: Arc<Slot>,
	shared: Arc<Mutex<DemuxShared>>,
}

impl CheckpointSubscription {
	/// Next unconsumed checkpoint update. `None` once the upstream ended.
	pub async fn next(&mut self) -> Option<Result<CheckpointUpdate, SyncStreamError>> {
		loop {
			self.slot.wait_ready().await;

			match self.slot.take() {
				Some(Ok(Some(update))) => return Some(Ok(update)),
				Some(Ok(None)) => return None,
				Some(Err(message)) => return Some(Err(SyncStreamError::Watcher(message))),
				None => {}
			}
		}
	}

	/// Cheap handle for peeking at arrival of the next value without
	/// consuming it; used for mid-checkpoint preemption.
	#[must_use]
	pub fn watch(&self) -> CheckpointWatch {
		CheckpointWatch {
			slot: Arc::clone(&self.slot),
		}
	}
}

impl Drop for CheckpointSubscription {
	fn drop(&mut self) {
		detach_subscriber(&self.shared, self.id);
	}
}

#[derive(Clone)]
pub struct CheckpointWatch {
	slot: Arc<Slot>,
}

impl CheckpointWatch {
	/// Resolves as soon as the subscriber's mailbox holds an unconsumed
	/// value (or the stream ended).
	pub async fn wait_changed(&self) {
		self.slot.wait_ready().await;
	}
}

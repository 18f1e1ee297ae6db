use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use opsync_types::Lsn;

use crate::{source::SourceChange, writer::BatchWriter, ReplicationError};

/// Events a replication adapter feeds into the writer loop.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
	Change(SourceChange),
	/// Source transaction commit at the given LSN.
	Commit(Lsn),
	/// Source liveness without new data.
	Keepalive(Lsn),
}

/// Drive a [`BatchWriter`] from an adapter's event channel until the channel
/// closes or `shutdown` fires. A lost replication slot restarts replication
/// in place; any other error is fatal to the loop.
pub async fn run_replication(
	mut writer: BatchWriter,
	mut events: mpsc::Receiver<ReplicationEvent>,
	shutdown: CancellationToken,
) -> Result<(), ReplicationError> {
	loop {
		let event = tokio::select! {
			() = shutdown.cancelled() => {
				debug!(group = %writer.group(), "replication loop shutting down");
				writer.flush().await?;
				return Ok(());
			}
			event = events.recv() => event,
		};

		let Some(event) = event else {
			writer.flush().await?;
			return Ok(());
		};

		let result = match event {
			ReplicationEvent::Change(change) => writer.save(change).await,
			ReplicationEvent::Commit(lsn) => writer.commit(lsn).await.map(drop),
			ReplicationEvent::Keepalive(lsn) => writer.keepalive(lsn).await.map(drop),
		};

		match result {
			Ok(()) => {}
			Err(ReplicationError::ReplicationSlotMissing { slot }) => {
				error!(slot, "replication slot missing, discarding state");
				writer.recover_missing_slot().await?;
			}
			Err(e) => return Err(e),
		}
	}
}

use crate::adapter::GroupId;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
	/// Transient conflict between concurrent writers; retried by the caller.
	#[error("storage write conflict: {0}")]
	WriteConflict(String),
	#[error("sync rules {0} not found")]
	GroupNotFound(GroupId),
	#[error("no active sync rules")]
	NoActiveSyncRules,
	#[error("checkpoint {checkpoint} is no longer readable for {group}")]
	CheckpointNotFound {
		group: GroupId,
		checkpoint: opsync_types::OpId,
	},
	/// An invariant the pipeline relies on was violated; callers treat this
	/// as a bug and abort.
	#[error("storage invariant violated: {0}")]
	Assertion(String),
	#[error("fatal storage error: {0}")]
	Fatal(String),
}

impl StorageError {
	#[must_use]
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::WriteConflict(_))
	}

	#[must_use]
	pub fn code(&self) -> &'static str {
		match self {
			Self::WriteConflict(_) => "WRITE_CONFLICT",
			Self::GroupNotFound(_) | Self::NoActiveSyncRules => "NO_ACTIVE_SYNC_RULES",
			Self::CheckpointNotFound { .. } => "CHECKPOINT_NOT_FOUND",
			Self::Assertion(_) => "ASSERTION",
			Self::Fatal(_) => "FATAL_STORAGE_ERROR",
		}
	}
}

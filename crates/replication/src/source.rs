use std::sync::Arc;

use opsync_rules::Row;
use opsync_storage::SourceTableHandle;

/// One decoded change from the source database's replication stream.
///
/// Adapters (logical replication, binlog, change streams) resolve their
/// relation metadata to a [`SourceTableHandle`] up front, so the writer never
/// sees raw relation ids.
#[derive(Debug, Clone)]
pub enum SourceChange {
	Insert {
		table: Arc<SourceTableHandle>,
		after: Row,
	},
	Update {
		table: Arc<SourceTableHandle>,
		/// Old row image, present when the source ships one (required when
		/// the replica identity may have changed).
		before: Option<Row>,
		after: Row,
	},
	Delete {
		table: Arc<SourceTableHandle>,
		before: Row,
	},
	Truncate {
		tables: Vec<Arc<SourceTableHandle>>,
	},
}

impl SourceChange {
	#[must_use]
	pub fn tag(&self) -> &'static str {
		match self {
			Self::Insert { .. } => "insert",
			Self::Update { .. } => "update",
			Self::Delete { .. } => "delete",
			Self::Truncate { .. } => "truncate",
		}
	}
}

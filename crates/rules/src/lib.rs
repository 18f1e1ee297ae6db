//! Declarative sync rules: which buckets a replicated row belongs to and what
//! payload each client sees.
//!
//! A rules document is written once per deployment and versioned by the
//! storage layer; this crate owns the document model and the evaluator the
//! replication and streaming pipelines share.

pub mod document;
pub mod evaluator;
pub mod request;
pub mod row;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use document::{
	BucketDefinition, DataQuery, EventDescriptor, LookupColumn, RequestValueRef, StaticFilter,
	SyncRulesDoc, TablePattern, TableParameterQuery,
};
pub use evaluator::{
	BucketDescription, EvaluatedParameterRow, EvaluatedRow, Lookup, ParameterSet, SyncRules,
};
pub use request::RequestParameters;
pub use row::{
	is_complete, merge_unchanged, parse_row, row_from_json, serialize_row, ColumnValue, Row,
};

/// Lifecycle of one sync-rules version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncRuleState {
	/// Initial replication of this version is still running.
	Processing,
	/// The version all new connections sync against.
	Active,
	/// Superseded; existing clients are moved off before termination.
	Stop,
	Terminated,
	Errored,
}

impl fmt::Display for SyncRuleState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Processing => f.write_str("PROCESSING"),
			Self::Active => f.write_str("ACTIVE"),
			Self::Stop => f.write_str("STOP"),
			Self::Terminated => f.write_str("TERMINATED"),
			Self::Errored => f.write_str("ERRORED"),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum RulesError {
	#[error("sync rules JSON handling failed: {0}")]
	Json(#[from] serde_json::Error),
	#[error("bucket definition {bucket:?} is invalid: {reason}")]
	InvalidBucketDefinition { bucket: String, reason: String },
	#[error("row for table {table:?} is missing id column {column:?}")]
	MissingIdColumn { table: String, column: String },
	#[error("row contains unresolved column placeholders: {column:?}")]
	IncompleteRow { column: String },
}

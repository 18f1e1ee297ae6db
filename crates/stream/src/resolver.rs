//! Bucket parameter resolver: turns a request's parameters into the set of
//! bucket instances the connection may sync at a checkpoint.

use std::{
	collections::BTreeSet,
	sync::Arc,
};

use tracing::debug;

use opsync_rules::{BucketDescription, Lookup, RequestParameters, SyncRules};
use opsync_storage::{BucketStorage, CheckpointUpdate, GroupId};
use opsync_types::BucketName;

use crate::SyncStreamError;

/// Which of the connection's buckets changed since the previous checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketUpdates {
	Exact(BTreeSet<BucketName>),
	/// Dynamic membership was re-evaluated; treat every bucket as updated.
	InvalidateAll,
}

#[derive(Debug, Clone)]
pub struct ResolvedBuckets {
	pub buckets: Vec<BucketDescription>,
	pub updates: BucketUpdates,
}

pub struct BucketParameterResolver {
	rules: Arc<SyncRules>,
	storage: Arc<dyn BucketStorage>,
	group: GroupId,
	/// Static buckets never change for the lifetime of a connection.
	static_buckets: Vec<BucketDescription>,
	lookups: Vec<Lookup>,
	lookup_set: BTreeSet<Lookup>,
	dynamic_buckets: Option<Vec<BucketDescription>>,
	max_parameter_query_results: usize,
}

impl BucketParameterResolver {
	#[must_use]
	pub fn new(
		rules: Arc<SyncRules>,
		storage: Arc<dyn BucketStorage>,
		group: GroupId,
		request: &RequestParameters,
		max_parameter_query_results: usize,
	) -> Self {
		let static_buckets = rules.static_bucket_descriptions(request);
		let lookups = rules.dynamic_lookups(request);
		let lookup_set = lookups.iter().cloned().collect();

		Self {
			rules,
			storage,
			group,
			static_buckets,
			lookups,
			lookup_set,
			dynamic_buckets: None,
			max_parameter_query_results,
		}
	}

	/// Resolve the bucket list for `update`.
	///
	/// Static buckets report exact per-bucket changes. Dynamic buckets use a
	/// coarser signal: when the update touches any of this connection's
	/// lookups (or demands full invalidation), the parameter queries are
	/// re-run and everything counts as updated.
	pub async fn buckets_for(
		&mut self,
		update: &CheckpointUpdate,
	) -> Result<ResolvedBuckets, SyncStreamError> {
		let needs_requery = !self.lookups.is_empty()
			&& (update.invalidate_all
				|| self.dynamic_buckets.is_none()
				|| update
					.updated_parameter_lookups
					.iter()
					.any(|lookup| self.lookup_set.contains(lookup)));

		let mut invalidate_all = update.invalidate_all;

		if needs_requery {
			let sets = self
				.storage
				.get_parameter_sets(self.group, &self.lookups)
				.await?;

			if sets.len() > self.max_parameter_query_results {
				return Err(SyncStreamError::TooManyParameterResults {
					count: sets.len(),
					max: self.max_parameter_query_results,
				});
			}

			let dynamic = self
				.rules
				.dynamic_bucket_descriptions(sets.iter().map(|(lookup, set)| (lookup, set)));

			debug!(buckets = dynamic.len(), "re-evaluated dynamic bucket membership");

			self.dynamic_buckets = Some(dynamic);
			invalidate_all = true;
		}

		let mut buckets = self.static_buckets.clone();
		if let Some(dynamic) = &self.dynamic_buckets {
			buckets.extend(dynamic.iter().cloned());
		}

		let updates = if invalidate_all {
			BucketUpdates::InvalidateAll
		} else {
			let mine: BTreeSet<&BucketName> =
				buckets.iter().map(|description| &description.bucket).collect();

			BucketUpdates::Exact(
				update
					.updated_buckets
					.iter()
					.filter(|bucket| mine.contains(bucket))
					.cloned()
					.collect(),
			)
		};

		Ok(ResolvedBuckets { buckets, updates })
	}
}

//! End-to-end batch writer behavior against the in-memory storage engine.

mod support;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use opsync_replication::{BatchWriter, CommitStatus, ReplicationError, SourceChange, WriterTuning};
use opsync_storage::{
	BatchLimits, BucketStorage, CheckpointStateUpdate, MemoryBucketStorage, OpRange,
};
use opsync_types::{Lsn, OpId, OpType};
use serde_json::json;

use support::{row, test_rules, FlakyStorage, TestSetup};

#[tokio::test]
async fn insert_emits_put_and_current_data() {
	let mut setup = TestSetup::new().await;
	let users = setup.table("users", &["id"]).await;

	setup
		.writer
		.save(SourceChange::Insert {
			table: users.clone(),
			after: row(json!({"id": "u1", "name": "a"})),
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/1")).await.unwrap();

	let ops = setup.bucket_ops("global[]").await;
	assert_eq!(ops.len(), 1);
	assert_eq!(ops[0].op, OpType::Put);
	assert_eq!(ops[0].object_id.as_deref(), Some("u1"));

	let current = setup
		.storage
		.get_current_data(setup.group, users.id, r#"["u1"]"#)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(current.buckets.len(), 1);
	assert_eq!(current.buckets[0].bucket, "global[]");
}

#[tokio::test]
async fn toast_update_merges_prior_row_image() {
	let mut setup = TestSetup::new().await;
	let users = setup.table("users", &["id"]).await;

	setup
		.writer
		.save(SourceChange::Insert {
			table: users.clone(),
			after: row(json!({"id": "u1", "name": "a", "bio": "a very long bio"})),
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/1")).await.unwrap();

	// Only `name` is shipped; `bio` arrives as an unchanged placeholder.
	let mut after = row(json!({"id": "u1", "name": "b"}));
	after.insert("bio".to_owned(), opsync_rules::ColumnValue::Unchanged);

	setup
		.writer
		.save(SourceChange::Update {
			table: users.clone(),
			before: None,
			after,
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/2")).await.unwrap();

	let ops = setup.bucket_ops("global[]").await;
	let last = ops.last().unwrap();
	let data = last.data.as_deref().unwrap();

	assert!(data.contains("a very long bio"), "prior bio must be merged: {data}");
	assert!(data.contains(r#""name":"b""#));
}

#[tokio::test]
async fn incomplete_row_without_image_queues_resnapshot() {
	let mut setup = TestSetup::new().await;
	let users = setup.table("users", &["id"]).await;

	let mut after = row(json!({"id": "u9"}));
	after.insert("bio".to_owned(), opsync_rules::ColumnValue::Unchanged);

	setup
		.writer
		.save(SourceChange::Update {
			table: users.clone(),
			before: None,
			after,
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/1")).await.unwrap();

	assert!(setup.bucket_ops("global[]").await.is_empty());
	assert_eq!(
		setup
			.storage
			.pending_resnapshots(setup.group, users.id)
			.await
			.unwrap(),
		vec![r#"["u9"]"#.to_owned()],
	);
}

#[tokio::test]
async fn replica_id_change_pairs_remove_and_put() {
	let mut setup = TestSetup::new().await;
	let users = setup.table("users", &["id"]).await;

	setup
		.writer
		.save(SourceChange::Insert {
			table: users.clone(),
			after: row(json!({"id": "u1", "name": "a"})),
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/1")).await.unwrap();

	setup
		.writer
		.save(SourceChange::Update {
			table: users.clone(),
			before: Some(row(json!({"id": "u1"}))),
			after: row(json!({"id": "u2", "name": "a"})),
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/2")).await.unwrap();

	let ops = setup.bucket_ops("global[]").await;
	assert_eq!(ops.len(), 3);

	// The REMOVE must reference the old replica id within the same checkpoint.
	assert_eq!(ops[1].op, OpType::Remove);
	assert_eq!(ops[1].object_id.as_deref(), Some("u1"));
	assert_eq!(ops[2].op, OpType::Put);
	assert_eq!(ops[2].object_id.as_deref(), Some("u2"));
}

#[tokio::test]
async fn update_moves_row_between_buckets() {
	let mut setup = TestSetup::new().await;
	let todos = setup.table("todos", &["id"]).await;

	setup
		.writer
		.save(SourceChange::Insert {
			table: todos.clone(),
			after: row(json!({"id": "t1", "owner_id": "u1", "text": "x"})),
		})
		.await
		.unwrap();
	setup
		.writer
		.save(SourceChange::Update {
			table: todos.clone(),
			before: None,
			after: row(json!({"id": "t1", "owner_id": "u2", "text": "x"})),
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/1")).await.unwrap();

	let old_bucket = setup.bucket_ops(r#"by_user["u1"]"#).await;
	let new_bucket = setup.bucket_ops(r#"by_user["u2"]"#).await;

	assert_eq!(
		old_bucket.iter().map(|op| op.op).collect::<Vec<_>>(),
		vec![OpType::Put, OpType::Remove],
	);
	assert_eq!(new_bucket.len(), 1);
	assert_eq!(new_bucket[0].op, OpType::Put);
}

#[tokio::test]
async fn parameter_rows_follow_membership_changes() {
	let mut setup = TestSetup::new().await;
	let memberships = setup.table("memberships", &["id"]).await;

	setup
		.writer
		.save(SourceChange::Insert {
			table: memberships.clone(),
			after: row(json!({"id": "m1", "user_id": "u1", "team_id": "team-a"})),
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/1")).await.unwrap();

	let request = opsync_rules::RequestParameters::new("u1");
	let lookups = setup.rules.dynamic_lookups(&request);
	let sets = setup
		.storage
		.get_parameter_sets(setup.group, &lookups)
		.await
		.unwrap();
	assert_eq!(sets.len(), 1);
	assert_eq!(sets[0].1, vec![json!("team-a")]);

	// Moving the membership to another user removes the old lookup row.
	setup
		.writer
		.save(SourceChange::Update {
			table: memberships.clone(),
			before: None,
			after: row(json!({"id": "m1", "user_id": "u2", "team_id": "team-a"})),
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/2")).await.unwrap();

	assert!(setup
		.storage
		.get_parameter_sets(setup.group, &lookups)
		.await
		.unwrap()
		.is_empty());
}

#[tokio::test]
async fn truncate_leaves_no_current_data_and_removes_rows() {
	let mut setup = TestSetup::with_tuning(WriterTuning {
		truncate_batch_size: 2,
		..WriterTuning::default()
	})
	.await;
	let users = setup.table("users", &["id"]).await;

	for i in 0..5 {
		setup
			.writer
			.save(SourceChange::Insert {
				table: users.clone(),
				after: row(json!({"id": format!("u{i}"), "name": "x"})),
			})
			.await
			.unwrap();
	}
	setup.writer.commit(Lsn::from("0/1")).await.unwrap();

	setup
		.writer
		.save(SourceChange::Truncate {
			tables: vec![users.clone()],
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/2")).await.unwrap();

	let ops = setup.bucket_ops("global[]").await;
	let removes = ops.iter().filter(|op| op.op == OpType::Remove).count();
	assert_eq!(removes, 5);

	assert!(setup
		.storage
		.scan_current_data(setup.group, users.id, None, 100)
		.await
		.unwrap()
		.is_empty());
}

#[tokio::test]
async fn redelivered_transaction_is_idempotent() {
	let mut setup = TestSetup::new().await;
	let users = setup.table("users", &["id"]).await;

	let change = SourceChange::Insert {
		table: users.clone(),
		after: row(json!({"id": "u1", "name": "a"})),
	};

	setup.writer.save(change.clone()).await.unwrap();
	assert_eq!(
		setup.writer.commit(Lsn::from("0/5")).await.unwrap(),
		CommitStatus::Applied
	);

	// The adapter replays the same source transaction after a reconnect. The
	// LSN gate skips the commit; the checkpoint does not move.
	let checkpoint_before = setup
		.storage
		.active_checkpoint()
		.await
		.unwrap()
		.unwrap()
		.checkpoint;

	setup.writer.save(change).await.unwrap();
	assert_eq!(
		setup.writer.commit(Lsn::from("0/5")).await.unwrap(),
		CommitStatus::Skipped
	);

	let checkpoint_after = setup
		.storage
		.active_checkpoint()
		.await
		.unwrap()
		.unwrap()
		.checkpoint;
	assert_eq!(checkpoint_before, checkpoint_after);
}

#[tokio::test]
async fn commit_before_consistency_gate_is_deferred() {
	let mut setup = TestSetup::new().await;
	let users = setup.table("users", &["id"]).await;

	setup
		.storage
		.update_checkpoint_state(
			setup.group,
			CheckpointStateUpdate {
				no_checkpoint_before: Some(Lsn::from("0/9")),
				..CheckpointStateUpdate::default()
			},
		)
		.await
		.unwrap();

	setup
		.writer
		.save(SourceChange::Insert {
			table: users.clone(),
			after: row(json!({"id": "u1", "name": "a"})),
		})
		.await
		.unwrap();

	assert_eq!(
		setup.writer.commit(Lsn::from("0/5")).await.unwrap(),
		CommitStatus::Deferred
	);
	let status = setup.storage.sync_rules_status(setup.group).await.unwrap();
	assert!(status.keepalive_op.is_some());
	assert!(status.last_checkpoint_lsn.is_none());

	// Once the gate is passed the deferred ops land in the checkpoint.
	assert_eq!(
		setup.writer.commit(Lsn::from("0/9")).await.unwrap(),
		CommitStatus::Applied
	);
	let status = setup.storage.sync_rules_status(setup.group).await.unwrap();
	assert!(status.last_checkpoint.is_some());
	assert_eq!(status.keepalive_op, None);
}

#[tokio::test]
async fn oversized_rows_are_replaced_with_placeholders() {
	let mut setup = TestSetup::with_tuning(WriterTuning {
		max_row_bytes: 256,
		..WriterTuning::default()
	})
	.await;
	let users = setup.table("users", &["id"]).await;

	setup
		.writer
		.save(SourceChange::Insert {
			table: users.clone(),
			after: row(json!({"id": "u1", "bio": "x".repeat(1024)})),
		})
		.await
		.unwrap();
	setup.writer.commit(Lsn::from("0/1")).await.unwrap();

	let ops = setup.bucket_ops("global[]").await;
	assert_eq!(ops.len(), 1);
	assert_eq!(ops[0].data.as_deref(), Some(r#"{"id":"u1"}"#));
}

#[tokio::test]
async fn transient_conflicts_exhaust_into_max_tx_retries() {
	let storage = Arc::new(FlakyStorage::new(MemoryBucketStorage::new(), u32::MAX));
	let rules = Arc::new(test_rules());
	let group = storage
		.create_sync_rules(test_rules())
		.await
		.unwrap();

	let mut writer = BatchWriter::new(
		storage.clone(),
		group,
		rules,
		Arc::new(tokio::sync::Mutex::new(())),
		WriterTuning {
			max_flush_tries: 3,
			max_flush_time: Duration::from_secs(5),
			..WriterTuning::default()
		},
	);

	let users = Arc::new(
		storage
			.resolve_source_table(
				group,
				opsync_storage::SourceTableIdentity {
					connection_id: 1,
					relation_id: None,
					schema: "public".to_owned(),
					name: "users".to_owned(),
					replica_id_columns: vec!["id".to_owned()],
				},
			)
			.await
			.unwrap(),
	);

	writer
		.save(SourceChange::Insert {
			table: users,
			after: row(json!({"id": "u1"})),
		})
		.await
		.unwrap();

	let err = writer.flush().await.unwrap_err();
	assert!(matches!(err, ReplicationError::MaxTransactionRetries { tries: 3 }));
}

#[tokio::test]
async fn ops_within_a_bucket_stay_strictly_monotonic() {
	let mut setup = TestSetup::new().await;
	let users = setup.table("users", &["id"]).await;

	for i in 0..20 {
		setup
			.writer
			.save(SourceChange::Insert {
				table: users.clone(),
				after: row(json!({"id": format!("u{i}")})),
			})
			.await
			.unwrap();
		if i % 5 == 4 {
			setup
				.writer
				.commit(Lsn::new(format!("0/{i}")))
				.await
				.unwrap();
		}
	}

	let ops = setup.bucket_ops("global[]").await;
	assert_eq!(ops.len(), 20);
	assert!(ops.windows(2).all(|pair| pair[0].op_id < pair[1].op_id));

	let checksum = setup
		.storage
		.sum_checksum(
			setup.group,
			"global[]",
			OpRange {
				after: OpId::ZERO,
				until: ops.last().unwrap().op_id,
			},
		)
		.await
		.unwrap();
	assert_eq!(checksum.count, 20);
	assert_eq!(
		checksum.checksum,
		ops.iter().map(|op| op.checksum).sum::<opsync_types::Checksum>()
	);
}

impl TestSetup {
	async fn bucket_ops(&self, bucket: &str) -> Vec<opsync_types::OplogEntry> {
		let checkpoint = OpId(u64::MAX);
		let positions = BTreeMap::from([(bucket.to_owned(), OpId::ZERO)]);

		self.storage
			.get_bucket_data_batch(self.group, checkpoint, &positions, BatchLimits::default())
			.await
			.unwrap()
			.into_iter()
			.flat_map(|chunk| chunk.batch.data)
			.collect()
	}
}

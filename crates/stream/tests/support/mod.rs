#![allow(dead_code)]

use std::{collections::BTreeMap, pin::Pin, sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use opsync_replication::{BatchWriter, SourceChange, WriterTuning};
use opsync_rules::{row_from_json, RequestParameters, Row, SyncRules};
use opsync_storage::{BucketStorage, GroupId, MemoryBucketStorage, SourceTableHandle, SourceTableIdentity};
use opsync_stream::{StreamEvent, SyncStreamError, SyncStreamParams, SyncStreamService, SyncStreamTuning};
use opsync_types::{BucketRequest, Lsn, OpId, SyncLine};

pub fn row(values: serde_json::Value) -> Row {
	let serde_json::Value::Object(object) = values else {
		panic!("expected a JSON object");
	};
	row_from_json(object)
}

pub fn test_rules() -> SyncRules {
	SyncRules::from_json(
		r#"{
			"bucket_definitions": [
				{
					"name": "global",
					"priority": 3,
					"data": [{ "table": "users" }]
				},
				{
					"name": "by_user",
					"priority": 0,
					"request_parameters": ["token.sub"],
					"data": [{ "table": "todos", "partition_by": ["owner_id"] }]
				},
				{
					"name": "by_team",
					"priority": 1,
					"parameter_queries": [{
						"table": "memberships",
						"lookup": [{ "column": "user_id", "request": "token.sub" }],
						"outputs": ["team_id"]
					}],
					"data": [{ "table": "documents", "partition_by": ["team_id"] }]
				}
			]
		}"#,
	)
	.expect("test rules are valid")
}

pub struct Harness {
	pub storage: Arc<MemoryBucketStorage>,
	pub group: GroupId,
	pub writer: BatchWriter,
	pub service: Arc<SyncStreamService>,
	pub tables: BTreeMap<String, Arc<SourceTableHandle>>,
	lsn_counter: u64,
}

impl Harness {
	pub async fn new() -> Self {
		Self::with_tuning(SyncStreamTuning::default()).await
	}

	pub async fn with_tuning(tuning: SyncStreamTuning) -> Self {
		let storage = Arc::new(MemoryBucketStorage::new());
		let rules = Arc::new(test_rules());
		let group = storage
			.create_sync_rules(test_rules())
			.await
			.expect("create sync rules");

		let writer = BatchWriter::new(
			storage.clone(),
			group,
			rules,
			Arc::new(Mutex::new(())),
			WriterTuning::default(),
		);

		let service = SyncStreamService::new(storage.clone(), tuning);

		Self {
			storage,
			group,
			writer,
			service,
			tables: BTreeMap::new(),
			lsn_counter: 0,
		}
	}

	pub async fn table(&mut self, name: &str) -> Arc<SourceTableHandle> {
		if let Some(table) = self.tables.get(name) {
			return Arc::clone(table);
		}

		let table = Arc::new(
			self.storage
				.resolve_source_table(
					self.group,
					SourceTableIdentity {
						connection_id: 1,
						relation_id: None,
						schema: "public".to_owned(),
						name: name.to_owned(),
						replica_id_columns: vec!["id".to_owned()],
					},
				)
				.await
				.expect("resolve source table"),
		);
		self.tables.insert(name.to_owned(), Arc::clone(&table));
		table
	}

	pub async fn insert(&mut self, table: &str, values: serde_json::Value) {
		let table = self.table(table).await;
		self.writer
			.save(SourceChange::Insert {
				table,
				after: row(values),
			})
			.await
			.expect("insert");
	}

	pub async fn commit(&mut self) -> Lsn {
		self.lsn_counter += 1;
		let lsn = Lsn::new(format!("{:0>16}", self.lsn_counter));
		self.writer.commit(lsn.clone()).await.expect("commit");
		lsn
	}

	pub fn params(&self, user_id: &str) -> SyncStreamParams {
		SyncStreamParams {
			request: RequestParameters::new(user_id),
			client_id: Some("test-client".to_owned()),
			initial_buckets: Vec::new(),
			token_expires_at: None,
		}
	}

	pub fn params_with_buckets(
		&self,
		user_id: &str,
		buckets: Vec<(String, OpId)>,
	) -> SyncStreamParams {
		SyncStreamParams {
			initial_buckets: buckets
				.into_iter()
				.map(|(name, after)| BucketRequest { name, after })
				.collect(),
			..self.params(user_id)
		}
	}

	pub fn open_stream(
		&self,
		params: SyncStreamParams,
	) -> (
		Pin<Box<dyn Stream<Item = Result<StreamEvent, SyncStreamError>> + Send>>,
		CancellationToken,
	) {
		let abort = CancellationToken::new();
		let stream = self.service.stream_sync(params, abort.clone());
		(Box::pin(stream), abort)
	}
}

pub type SyncStream =
	Pin<Box<dyn Stream<Item = Result<StreamEvent, SyncStreamError>> + Send>>;

/// Read lines until `stop` matches (inclusive), failing on timeout.
pub async fn read_until(
	stream: &mut SyncStream,
	stop: impl Fn(&SyncLine) -> bool,
) -> Vec<SyncLine> {
	let mut lines = Vec::new();

	let collected = tokio::time::timeout(Duration::from_secs(10), async {
		while let Some(event) = stream.next().await {
			match event.expect("stream error") {
				StreamEvent::Line(line) => {
					let done = stop(&line);
					lines.push(line);
					if done {
						break;
					}
				}
				StreamEvent::FlushHint => {}
			}
		}
	})
	.await;

	collected.expect("timed out waiting for sync lines");
	lines
}

pub fn is_checkpoint_complete(line: &SyncLine) -> bool {
	matches!(line, SyncLine::CheckpointComplete(_))
}

pub fn data_op_ids(lines: &[SyncLine]) -> BTreeMap<String, Vec<OpId>> {
	let mut out: BTreeMap<String, Vec<OpId>> = BTreeMap::new();

	for line in lines {
		if let SyncLine::Data(batch) = line {
			out.entry(batch.bucket.clone())
				.or_default()
				.extend(batch.data.iter().map(|entry| entry.op_id));
		}
	}

	out
}

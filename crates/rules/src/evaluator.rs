use std::fmt;

use serde_json::Value;

use opsync_types::{BucketName, BucketPriority};

use crate::{
	document::{BucketDefinition, DataQuery, SyncRulesDoc, TableParameterQuery},
	request::RequestParameters,
	row::{serialize_row, ColumnValue, Row},
	RulesError,
};

/// Ordered bucket parameter values, as extracted from a parameter row or the
/// request itself.
pub type ParameterSet = Vec<Value>;

/// Opaque key joining dynamic parameter rows written during replication with
/// the lookups a request resolves to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lookup(Vec<u8>);

impl Lookup {
	#[must_use]
	pub fn new(definition: &str, query_id: u32, values: &[Value]) -> Self {
		Self(
			serde_json::to_vec(&(definition, query_id, values))
				.expect("lookup components are json-serializable"),
		)
	}

	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}
}

impl fmt::Display for Lookup {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&String::from_utf8_lossy(&self.0))
	}
}

/// A bucket instance a client may subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketDescription {
	pub bucket: BucketName,
	pub priority: BucketPriority,
}

/// Output of the data queries for one row: the document as one bucket sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedRow {
	pub bucket: BucketName,
	pub object_type: String,
	pub object_id: String,
	pub data: String,
}

/// Output of the parameter queries for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedParameterRow {
	pub lookup: Lookup,
	pub parameters: ParameterSet,
}

/// A validated, immutable sync-rules document plus its evaluator.
#[derive(Debug)]
pub struct SyncRules {
	doc: SyncRulesDoc,
}

impl SyncRules {
	pub fn new(doc: SyncRulesDoc) -> Result<Self, RulesError> {
		for def in &doc.bucket_definitions {
			let invalid = |reason: String| RulesError::InvalidBucketDefinition {
				bucket: def.name.clone(),
				reason,
			};

			if def.name.contains('[') || def.name.contains(']') {
				return Err(invalid("bucket names must not contain brackets".into()));
			}
			if !def.request_parameters.is_empty() && def.is_dynamic() {
				return Err(invalid(
					"request parameters and parameter queries are mutually exclusive".into(),
				));
			}
			if def.data_queries.is_empty() {
				return Err(invalid("at least one data query is required".into()));
			}

			let arity = def.parameter_arity();
			for query in &def.parameter_queries {
				if query.outputs.len() != arity {
					return Err(invalid(format!(
						"parameter query {} yields {} parameters, expected {arity}",
						query.id,
						query.outputs.len(),
					)));
				}
			}
			for query in &def.data_queries {
				if query.partition_by.len() != arity {
					return Err(invalid(format!(
						"data query on {:?} partitions by {} columns, expected {arity}",
						query.table.name,
						query.partition_by.len(),
					)));
				}
			}
		}

		Ok(Self { doc })
	}

	pub fn from_json(json: &str) -> Result<Self, RulesError> {
		Self::new(serde_json::from_str(json)?)
	}

	#[must_use]
	pub fn definitions(&self) -> &[BucketDefinition] {
		&self.doc.bucket_definitions
	}

	/// Whether any data or parameter query touches the given source table.
	#[must_use]
	pub fn table_relevant(&self, schema: &str, table: &str) -> bool {
		self.doc.bucket_definitions.iter().any(|def| {
			def.data_queries
				.iter()
				.map(|q| &q.table)
				.chain(def.parameter_queries.iter().map(|q| &q.table))
				.any(|pattern| pattern.matches(schema, table))
		}) || self
			.doc
			.event_descriptors
			.iter()
			.any(|event| event.tables.iter().any(|t| t.matches(schema, table)))
	}

	/// Evaluate all data queries against one complete row.
	pub fn evaluate_row(
		&self,
		schema: &str,
		table: &str,
		row: &Row,
	) -> Result<Vec<EvaluatedRow>, RulesError> {
		let mut out = Vec::new();

		for def in &self.doc.bucket_definitions {
			for query in &def.data_queries {
				if !query.table.matches(schema, table) || !filters_match(query, row) {
					continue;
				}

				let Some(object_id) = id_value(row, &query.id_column) else {
					return Err(RulesError::MissingIdColumn {
						table: table.to_owned(),
						column: query.id_column.clone(),
					});
				};

				let params: ParameterSet = query
					.partition_by
					.iter()
					.map(|column| column_value(row, column))
					.collect();

				out.push(EvaluatedRow {
					bucket: render_bucket_name(&def.name, &params),
					object_type: query
						.output_table
						.clone()
						.unwrap_or_else(|| table.to_owned()),
					object_id,
					data: serialize_row(row, query.columns.as_deref())?,
				});
			}
		}

		Ok(out)
	}

	/// Evaluate all parameter queries against one complete row.
	#[must_use]
	pub fn evaluate_parameter_row(
		&self,
		schema: &str,
		table: &str,
		row: &Row,
	) -> Vec<EvaluatedParameterRow> {
		let mut out = Vec::new();

		for def in &self.doc.bucket_definitions {
			for query in &def.parameter_queries {
				if !query.table.matches(schema, table) {
					continue;
				}

				let key: Vec<Value> = query
					.lookup
					.iter()
					.map(|lookup| column_value(row, &lookup.column))
					.collect();

				out.push(EvaluatedParameterRow {
					lookup: Lookup::new(&def.name, query.id, &key),
					parameters: query
						.outputs
						.iter()
						.map(|column| column_value(row, column))
						.collect(),
				});
			}
		}

		out
	}

	/// Bucket instances known without replicated data: one per static
	/// definition whose request parameters all resolve.
	#[must_use]
	pub fn static_bucket_descriptions(
		&self,
		request: &RequestParameters,
	) -> Vec<BucketDescription> {
		self.doc
			.bucket_definitions
			.iter()
			.filter(|def| !def.is_dynamic())
			.filter_map(|def| {
				let params = def
					.request_parameters
					.iter()
					.map(|reference| request.resolve(reference))
					.collect::<Option<ParameterSet>>()?;

				Some(BucketDescription {
					bucket: render_bucket_name(&def.name, &params),
					priority: def.priority,
				})
			})
			.collect()
	}

	/// The lookups a request resolves to across all dynamic definitions.
	#[must_use]
	pub fn dynamic_lookups(&self, request: &RequestParameters) -> Vec<Lookup> {
		self.doc
			.bucket_definitions
			.iter()
			.flat_map(|def| {
				def.parameter_queries.iter().filter_map(|query| {
					let key = query
						.lookup
						.iter()
						.map(|lookup| request.resolve(&lookup.request))
						.collect::<Option<Vec<Value>>>()?;

					Some(Lookup::new(&def.name, query.id, &key))
				})
			})
			.collect()
	}

	/// Instantiate dynamic bucket descriptions from resolved parameter sets.
	#[must_use]
	pub fn dynamic_bucket_descriptions<'a>(
		&self,
		sets: impl IntoIterator<Item = (&'a Lookup, &'a ParameterSet)>,
	) -> Vec<BucketDescription> {
		let mut out = Vec::new();

		for (lookup, params) in sets {
			let Some(def) = self.definition_of_lookup(lookup) else {
				continue;
			};

			out.push(BucketDescription {
				bucket: render_bucket_name(&def.name, params),
				priority: def.priority,
			});
		}

		out.sort_by(|a, b| a.bucket.cmp(&b.bucket));
		out.dedup();
		out
	}

	fn definition_of_lookup(&self, lookup: &Lookup) -> Option<&BucketDefinition> {
		let (name, query_id): (String, u32) = {
			let (name, query_id, _values): (String, u32, Vec<Value>) =
				serde_json::from_slice(lookup.as_bytes()).ok()?;
			(name, query_id)
		};

		self.doc.bucket_definitions.iter().find(|def| {
			def.name == name && def.parameter_queries.iter().any(|q| q.id == query_id)
		})
	}

	/// Priority of a rendered bucket name, from its definition prefix.
	#[must_use]
	pub fn bucket_priority(&self, bucket: &str) -> BucketPriority {
		let def_name = bucket.split('[').next().unwrap_or(bucket);

		self.doc
			.bucket_definitions
			.iter()
			.find(|def| def.name == def_name)
			.map_or(BucketPriority::LOWEST, |def| def.priority)
	}

	#[must_use]
	pub fn parameter_queries_for(
		&self,
		schema: &str,
		table: &str,
	) -> Vec<&TableParameterQuery> {
		self.doc
			.bucket_definitions
			.iter()
			.flat_map(|def| &def.parameter_queries)
			.filter(|query| query.table.matches(schema, table))
			.collect()
	}
}

fn filters_match(query: &DataQuery, row: &Row) -> bool {
	query.filters.iter().all(|filter| {
		row.get(&filter.column)
			.and_then(ColumnValue::as_value)
			.is_some_and(|value| *value == filter.equals)
	})
}

fn column_value(row: &Row, column: &str) -> Value {
	row.get(column)
		.and_then(ColumnValue::as_value)
		.cloned()
		.unwrap_or(Value::Null)
}

fn id_value(row: &Row, column: &str) -> Option<String> {
	match row.get(column).and_then(ColumnValue::as_value)? {
		Value::String(id) => Some(id.clone()),
		Value::Null => None,
		other => Some(other.to_string()),
	}
}

/// Render a bucket instance name: definition name plus the JSON-serialized
/// parameter values, e.g. `by_user["u1"]` or `global[]`.
#[must_use]
pub fn render_bucket_name(definition: &str, params: &[Value]) -> BucketName {
	let mut name = String::with_capacity(definition.len() + 2 + params.len() * 8);
	name.push_str(definition);
	name.push('[');

	for (i, param) in params.iter().enumerate() {
		if i > 0 {
			name.push(',');
		}
		// Infallible for scalar JSON values.
		name.push_str(&serde_json::to_string(param).unwrap_or_default());
	}

	name.push(']');
	name
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use crate::row::row_from_json;

	use super::*;

	fn rules() -> SyncRules {
		SyncRules::from_json(
			r#"{
				"bucket_definitions": [
					{
						"name": "global",
						"data": [{ "table": "lists" }]
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
		.unwrap()
	}

	fn row(values: serde_json::Value) -> Row {
		let Value::Object(object) = values else {
			panic!("expected object");
		};
		row_from_json(object)
	}

	#[test]
	fn global_rows_land_in_the_global_bucket() {
		let rows = rules()
			.evaluate_row("public", "lists", &row(json!({"id": "l1", "name": "a"})))
			.unwrap();

		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].bucket, "global[]");
		assert_eq!(rows[0].object_type, "lists");
		assert_eq!(rows[0].object_id, "l1");
	}

	#[test]
	fn partitioned_rows_render_parameterized_buckets() {
		let rows = rules()
			.evaluate_row(
				"public",
				"todos",
				&row(json!({"id": "t1", "owner_id": "u1", "text": "x"})),
			)
			.unwrap();

		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].bucket, r#"by_user["u1"]"#);
	}

	#[test]
	fn parameter_rows_yield_lookups_and_parameters() {
		let rules = rules();
		let evaluated = rules.evaluate_parameter_row(
			"public",
			"memberships",
			&row(json!({"id": "m1", "user_id": "u1", "team_id": "team-a"})),
		);

		assert_eq!(evaluated.len(), 1);
		assert_eq!(evaluated[0].parameters, vec![json!("team-a")]);

		// A request for the same user produces the same lookup key.
		let request = RequestParameters::new("u1");
		assert_eq!(rules.dynamic_lookups(&request), vec![evaluated[0].lookup.clone()]);

		let sets = vec![(&evaluated[0].lookup, &evaluated[0].parameters)];
		let buckets = rules.dynamic_bucket_descriptions(sets);
		assert_eq!(buckets.len(), 1);
		assert_eq!(buckets[0].bucket, r#"by_team["team-a"]"#);
		assert_eq!(buckets[0].priority, BucketPriority::new(1).unwrap());
	}

	#[test]
	fn static_descriptions_cover_global_and_request_parameterized() {
		let buckets = rules().static_bucket_descriptions(&RequestParameters::new("u1"));

		assert_eq!(
			buckets
				.iter()
				.map(|b| b.bucket.as_str())
				.collect::<Vec<_>>(),
			vec!["global[]", r#"by_user["u1"]"#],
		);
		assert_eq!(buckets[1].priority, BucketPriority::HIGHEST);
	}

	#[test]
	fn arity_mismatch_is_rejected() {
		let err = SyncRules::from_json(
			r#"{
				"bucket_definitions": [{
					"name": "broken",
					"request_parameters": ["token.sub"],
					"data": [{ "table": "todos" }]
				}]
			}"#,
		)
		.unwrap_err();

		assert!(matches!(err, RulesError::InvalidBucketDefinition { .. }));
	}
}

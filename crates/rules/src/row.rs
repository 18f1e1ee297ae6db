use std::collections::BTreeMap;

use serde_json::Value;

use crate::RulesError;

/// One replicated column value.
///
/// `Unchanged` is the placeholder replication adapters emit for columns the
/// source did not ship with the change (Postgres TOAST, MySQL minimal row
/// images); the batch writer merges the prior value back in before the row
/// reaches the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
	Value(Value),
	Unchanged,
}

impl ColumnValue {
	#[must_use]
	pub fn as_value(&self) -> Option<&Value> {
		match self {
			Self::Value(value) => Some(value),
			Self::Unchanged => None,
		}
	}

	#[must_use]
	pub fn is_unchanged(&self) -> bool {
		matches!(self, Self::Unchanged)
	}
}

impl From<Value> for ColumnValue {
	fn from(value: Value) -> Self {
		Self::Value(value)
	}
}

/// A replicated row, keyed by column name.
pub type Row = BTreeMap<String, ColumnValue>;

/// Build a row from a plain JSON object, e.g. a stored `current_data` image.
pub fn row_from_json(object: serde_json::Map<String, Value>) -> Row {
	object
		.into_iter()
		.map(|(column, value)| (column, ColumnValue::Value(value)))
		.collect()
}

pub fn parse_row(data: &str) -> Result<Row, RulesError> {
	Ok(row_from_json(serde_json::from_str(data)?))
}

/// Serialize a row (optionally projected) to its canonical JSON string.
///
/// Fails if any serialized column is still an `Unchanged` placeholder.
pub fn serialize_row(row: &Row, columns: Option<&[String]>) -> Result<String, RulesError> {
	let mut object = serde_json::Map::new();

	match columns {
		Some(columns) => {
			for column in columns {
				object.insert(
					column.clone(),
					row.get(column)
						.map(|value| materialized(column, value))
						.transpose()?
						.unwrap_or(Value::Null),
				);
			}
		}
		None => {
			for (column, value) in row {
				object.insert(column.clone(), materialized(column, value)?);
			}
		}
	}

	Ok(serde_json::to_string(&Value::Object(object))?)
}

fn materialized(column: &str, value: &ColumnValue) -> Result<Value, RulesError> {
	value
		.as_value()
		.cloned()
		.ok_or_else(|| RulesError::IncompleteRow {
			column: column.to_owned(),
		})
}

/// Whether every column carries a real value.
#[must_use]
pub fn is_complete(row: &Row) -> bool {
	row.values().all(|value| !value.is_unchanged())
}

/// Fill `Unchanged` placeholders from a prior row image. Returns the columns
/// that stayed unresolved.
pub fn merge_unchanged(row: &mut Row, prior: &Row) -> Vec<String> {
	let mut unresolved = Vec::new();

	for (column, value) in row.iter_mut() {
		if value.is_unchanged() {
			match prior.get(column).and_then(ColumnValue::as_value) {
				Some(prior_value) => *value = ColumnValue::Value(prior_value.clone()),
				None => unresolved.push(column.clone()),
			}
		}
	}

	unresolved
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn row(values: serde_json::Value) -> Row {
		let Value::Object(object) = values else {
			panic!("expected object");
		};
		row_from_json(object)
	}

	#[test]
	fn merge_fills_placeholders_from_prior() {
		let mut updated = row(json!({"id": "u1", "name": "b"}));
		updated.insert("bio".to_owned(), ColumnValue::Unchanged);

		let prior = row(json!({"id": "u1", "name": "a", "bio": "long text"}));
		let unresolved = merge_unchanged(&mut updated, &prior);

		assert!(unresolved.is_empty());
		assert_eq!(
			updated.get("bio").unwrap().as_value(),
			Some(&json!("long text"))
		);
	}

	#[test]
	fn merge_reports_unresolved_columns() {
		let mut updated = row(json!({"id": "u1"}));
		updated.insert("bio".to_owned(), ColumnValue::Unchanged);

		let unresolved = merge_unchanged(&mut updated, &row(json!({"id": "u1"})));

		assert_eq!(unresolved, vec!["bio".to_owned()]);
		assert!(!is_complete(&updated));
	}

	#[test]
	fn serialize_projects_and_rejects_placeholders() {
		let mut r = row(json!({"id": "u1", "name": "a", "secret": "x"}));

		let projected = serialize_row(&r, Some(&["id".to_owned(), "name".to_owned()])).unwrap();
		assert_eq!(projected, r#"{"id":"u1","name":"a"}"#);

		r.insert("name".to_owned(), ColumnValue::Unchanged);
		assert!(serialize_row(&r, None).is_err());
	}
}

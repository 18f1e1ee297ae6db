use std::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize};

use opsync_types::BucketPriority;

/// The deserialized form of one sync-rules document.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRulesDoc {
	pub bucket_definitions: Vec<BucketDefinition>,
	#[serde(default)]
	pub event_descriptors: Vec<EventDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BucketDefinition {
	pub name: String,
	#[serde(default)]
	pub priority: BucketPriority,
	/// Bucket parameters taken straight from the verified request. A
	/// definition with request parameters and no parameter queries is
	/// *static*: its instances are known without touching replicated data.
	#[serde(default)]
	pub request_parameters: Vec<RequestValueRef>,
	/// Bucket parameters looked up in replicated tables. Any query here makes
	/// the definition *dynamic*.
	#[serde(default)]
	pub parameter_queries: Vec<TableParameterQuery>,
	#[serde(rename = "data")]
	pub data_queries: Vec<DataQuery>,
}

impl BucketDefinition {
	#[must_use]
	pub fn is_dynamic(&self) -> bool {
		!self.parameter_queries.is_empty()
	}

	/// Number of parameters a rendered instance of this definition carries.
	#[must_use]
	pub fn parameter_arity(&self) -> usize {
		if self.is_dynamic() {
			self.parameter_queries
				.first()
				.map_or(0, |query| query.outputs.len())
		} else {
			self.request_parameters.len()
		}
	}
}

/// Maps a source row to a client-visible document within bucket instances of
/// the owning definition.
#[derive(Debug, Clone, Deserialize)]
pub struct DataQuery {
	pub table: TablePattern,
	/// Row columns whose values select the bucket instance, in parameter
	/// order. Empty for single-instance definitions.
	#[serde(default)]
	pub partition_by: Vec<String>,
	/// Column projection; `None` ships the whole row.
	#[serde(default)]
	pub columns: Option<Vec<String>>,
	#[serde(default = "default_id_column")]
	pub id_column: String,
	/// Client-side object type; defaults to the source table name.
	#[serde(default)]
	pub output_table: Option<String>,
	#[serde(default)]
	pub filters: Vec<StaticFilter>,
}

fn default_id_column() -> String {
	"id".to_owned()
}

/// Equality filter on a row column against a constant.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticFilter {
	pub column: String,
	pub equals: serde_json::Value,
}

/// A dynamic parameter query: rows of `table` whose `lookup` columns match
/// the request provide `outputs` as bucket parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct TableParameterQuery {
	/// Distinguishes multiple queries within one definition in lookup keys.
	#[serde(default)]
	pub id: u32,
	pub table: TablePattern,
	pub lookup: Vec<LookupColumn>,
	pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LookupColumn {
	pub column: String,
	pub request: RequestValueRef,
}

/// Reference to a value of the verified request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestValueRef {
	/// The `sub` claim of the verified token.
	UserId,
	/// A named entry of the token/connection parameters.
	Parameter(String),
}

impl FromStr for RequestValueRef {
	type Err = String;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value {
			"token.sub" | "user_id" => Ok(Self::UserId),
			other => other
				.strip_prefix("token.parameters.")
				.map(|name| Self::Parameter(name.to_owned()))
				.ok_or_else(|| {
					format!("unknown request value reference {other:?}; expected \"token.sub\" or \"token.parameters.<name>\"")
				}),
		}
	}
}

impl fmt::Display for RequestValueRef {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::UserId => f.write_str("token.sub"),
			Self::Parameter(name) => write!(f, "token.parameters.{name}"),
		}
	}
}

impl<'de> Deserialize<'de> for RequestValueRef {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		String::deserialize(deserializer)?
			.parse()
			.map_err(de::Error::custom)
	}
}

impl Serialize for RequestValueRef {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

/// Source table matcher. A bare string matches the table name in any schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePattern {
	pub schema: Option<String>,
	pub name: String,
}

impl TablePattern {
	#[must_use]
	pub fn matches(&self, schema: &str, name: &str) -> bool {
		self.name == name && self.schema.as_deref().is_none_or(|s| s == schema)
	}
}

impl<'de> Deserialize<'de> for TablePattern {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		#[derive(Deserialize)]
		#[serde(untagged)]
		enum Repr {
			Name(String),
			Full {
				#[serde(default)]
				schema: Option<String>,
				name: String,
			},
		}

		Ok(match Repr::deserialize(deserializer)? {
			Repr::Name(name) => Self { schema: None, name },
			Repr::Full { schema, name } => Self { schema, name },
		})
	}
}

/// Named write-event hook descriptor; rows matching one of the tables are
/// surfaced to the event pipeline when replicated.
#[derive(Debug, Clone, Deserialize)]
pub struct EventDescriptor {
	pub name: String,
	pub tables: Vec<TablePattern>,
}

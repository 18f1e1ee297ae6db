use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::checksum::Checksum;

/// Buckets are identified by their rendered name, e.g. `by_user["u1"]`.
pub type BucketName = String;

/// Server-assigned 64-bit monotonic identifier of a bucket operation.
///
/// Opaque to clients. Always encoded as a decimal string on the JSON wire so
/// 64-bit values survive JavaScript number parsing; the binary flavor carries
/// it as a native integer through its own wire structs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

impl OpId {
	pub const ZERO: Self = Self(0);
}

impl fmt::Display for OpId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl From<u64> for OpId {
	fn from(value: u64) -> Self {
		Self(value)
	}
}

impl Serialize for OpId {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(&self.0)
	}
}

impl<'de> Deserialize<'de> for OpId {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		struct OpIdVisitor;

		impl de::Visitor<'_> for OpIdVisitor {
			type Value = OpId;

			fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str("an op id as a decimal string or unsigned integer")
			}

			fn visit_str<E: de::Error>(self, value: &str) -> Result<OpId, E> {
				value.parse::<u64>().map(OpId).map_err(de::Error::custom)
			}

			fn visit_u64<E: de::Error>(self, value: u64) -> Result<OpId, E> {
				Ok(OpId(value))
			}

			fn visit_i64<E: de::Error>(self, value: i64) -> Result<OpId, E> {
				u64::try_from(value)
					.map(OpId)
					.map_err(|_| de::Error::custom(format!("op id out of range: {value}")))
			}
		}

		deserializer.deserialize_any(OpIdVisitor)
	}
}

/// Bucket operation kind as it appears in the oplog and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
	Put,
	Remove,
	Move,
	Clear,
}

impl OpType {
	pub(crate) const fn tag(self) -> u8 {
		match self {
			Self::Put => b'P',
			Self::Remove => b'R',
			Self::Move => b'M',
			Self::Clear => b'C',
		}
	}
}

/// Bucket priority, 0..=3. Priority 0 ships first within a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BucketPriority(u8);

impl BucketPriority {
	pub const HIGHEST: Self = Self(0);
	pub const LOWEST: Self = Self(3);

	pub fn new(priority: u8) -> Option<Self> {
		(priority <= Self::LOWEST.0).then_some(Self(priority))
	}

	#[must_use]
	pub const fn value(self) -> u8 {
		self.0
	}
}

impl Default for BucketPriority {
	fn default() -> Self {
		Self::LOWEST
	}
}

impl fmt::Display for BucketPriority {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

impl<'de> Deserialize<'de> for BucketPriority {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let value = u8::deserialize(deserializer)?;

		Self::new(value)
			.ok_or_else(|| de::Error::custom(format!("bucket priority out of range: {value}")))
	}
}

/// A single oplog entry as delivered to clients inside a data frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OplogEntry {
	pub op_id: OpId,
	pub op: OpType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub object_type: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub object_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub subkey: Option<String>,
	pub checksum: Checksum,
	pub data: Option<String>,
}

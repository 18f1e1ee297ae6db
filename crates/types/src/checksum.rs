use std::{
	fmt,
	iter::Sum,
	ops::{Add, AddAssign},
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use xxhash_rust::xxh3::xxh3_64;

use crate::ops::{BucketName, BucketPriority, OpType};

/// Per-bucket checksum with 32-bit two's-complement additivity:
/// `checksum(a, c) = checksum(a, b) + checksum(b, c)` under wrapping addition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Checksum(u32);

impl Checksum {
	pub const ZERO: Self = Self(0);

	#[must_use]
	pub const fn from_value(value: u32) -> Self {
		Self(value)
	}

	/// Clients see checksums as signed 32-bit integers.
	#[must_use]
	pub const fn to_wire(self) -> i32 {
		self.0 as i32
	}

	#[must_use]
	pub const fn value(self) -> u32 {
		self.0
	}
}

impl Add for Checksum {
	type Output = Self;

	fn add(self, rhs: Self) -> Self {
		Self(self.0.wrapping_add(rhs.0))
	}
}

impl AddAssign for Checksum {
	fn add_assign(&mut self, rhs: Self) {
		*self = *self + rhs;
	}
}

impl Sum for Checksum {
	fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
		iter.fold(Self::ZERO, Add::add)
	}
}

impl fmt::Display for Checksum {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.to_wire().fmt(f)
	}
}

impl Serialize for Checksum {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_i32(self.to_wire())
	}
}

impl<'de> Deserialize<'de> for Checksum {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		struct ChecksumVisitor;

		impl de::Visitor<'_> for ChecksumVisitor {
			type Value = Checksum;

			fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str("a 32-bit checksum, signed or unsigned")
			}

			fn visit_i64<E: de::Error>(self, value: i64) -> Result<Checksum, E> {
				i32::try_from(value)
					.map(|v| Checksum(v as u32))
					.or_else(|_| u32::try_from(value).map(Checksum))
					.map_err(|_| de::Error::custom(format!("checksum out of range: {value}")))
			}

			fn visit_u64<E: de::Error>(self, value: u64) -> Result<Checksum, E> {
				u32::try_from(value)
					.map(Checksum)
					.map_err(|_| de::Error::custom(format!("checksum out of range: {value}")))
			}
		}

		deserializer.deserialize_any(ChecksumVisitor)
	}
}

/// Derive the 32-bit checksum of a single bucket operation.
///
/// The hash covers everything clients can observe about the op except its id,
/// so re-writing an identical op yields an identical checksum.
#[must_use]
pub fn op_checksum(
	op: OpType,
	object_type: Option<&str>,
	object_id: Option<&str>,
	subkey: Option<&str>,
	data: Option<&str>,
) -> Checksum {
	let mut buf = Vec::with_capacity(
		8 + object_type.map_or(0, str::len)
			+ object_id.map_or(0, str::len)
			+ subkey.map_or(0, str::len)
			+ data.map_or(0, str::len),
	);

	buf.push(op.tag());
	for field in [object_type, object_id, subkey, data] {
		buf.push(0);
		if let Some(field) = field {
			buf.extend_from_slice(field.as_bytes());
		}
	}

	Checksum(xxh3_64(&buf) as u32)
}

/// Aggregated checksum over a `(start, end]` op range of one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartialChecksum {
	pub count: u64,
	pub checksum: Checksum,
	/// Set when the range contains a `CLEAR` op; the aggregate then stands for
	/// the full bucket history from op id zero.
	pub has_clear: bool,
}

impl PartialChecksum {
	/// Extend this aggregate with the adjacent range that `next` covers.
	#[must_use]
	pub fn extend(self, next: Self) -> Self {
		if next.has_clear {
			// A CLEAR absorbs everything before it.
			return next;
		}

		Self {
			count: self.count + next.count,
			checksum: self.checksum + next.checksum,
			has_clear: self.has_clear,
		}
	}
}

/// The per-bucket checksum entry of a checkpoint line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketChecksum {
	pub bucket: BucketName,
	pub checksum: Checksum,
	pub count: u64,
	#[serde(default)]
	pub priority: BucketPriority,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn wrapping_addition_is_additive() {
		let a = Checksum::from_value(u32::MAX - 5);
		let b = Checksum::from_value(10);

		assert_eq!((a + b).value(), 4);
		assert_eq!(a + b, b + a);
	}

	#[test]
	fn wire_representation_is_signed() {
		let checksum = Checksum::from_value(0xFFFF_FFFF);

		assert_eq!(checksum.to_wire(), -1);
		assert_eq!(serde_json::to_string(&checksum).unwrap(), "-1");
		assert_eq!(
			serde_json::from_str::<Checksum>("-1").unwrap(),
			serde_json::from_str::<Checksum>("4294967295").unwrap(),
		);
	}

	#[test]
	fn op_checksum_discriminates_fields() {
		let base = op_checksum(OpType::Put, Some("users"), Some("u1"), None, Some("{}"));

		assert_eq!(
			base,
			op_checksum(OpType::Put, Some("users"), Some("u1"), None, Some("{}"))
		);
		assert_ne!(
			base,
			op_checksum(OpType::Remove, Some("users"), Some("u1"), None, Some("{}"))
		);
		assert_ne!(
			base,
			op_checksum(OpType::Put, Some("users"), Some("u2"), None, Some("{}"))
		);
		// Field boundaries must not be ambiguous.
		assert_ne!(
			op_checksum(OpType::Put, Some("ab"), Some(""), None, None),
			op_checksum(OpType::Put, Some("a"), Some("b"), None, None),
		);
	}

	#[test]
	fn partial_extend_respects_clear() {
		let head = PartialChecksum {
			count: 10,
			checksum: Checksum::from_value(100),
			has_clear: false,
		};
		let tail = PartialChecksum {
			count: 3,
			checksum: Checksum::from_value(7),
			has_clear: false,
		};

		assert_eq!(
			head.extend(tail),
			PartialChecksum {
				count: 13,
				checksum: Checksum::from_value(107),
				has_clear: false,
			}
		);

		let cleared = PartialChecksum {
			count: 2,
			checksum: Checksum::from_value(9),
			has_clear: true,
		};

		// The CLEAR range replaces the head entirely.
		assert_eq!(head.extend(cleared), cleared);
	}
}

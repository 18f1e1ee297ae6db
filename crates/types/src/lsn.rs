use std::fmt;

use serde::{Deserialize, Serialize};

/// Source-database log position.
///
/// Opaque to the pipeline apart from ordering: replication adapters must emit
/// LSNs whose lexicographic byte order matches the source's commit order
/// (Postgres adapters zero-pad, MongoDB adapters use resume-token timestamps).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lsn(String);

impl Lsn {
	pub fn new(lsn: impl Into<String>) -> Self {
		Self(lsn.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Lsn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for Lsn {
	fn from(value: &str) -> Self {
		Self(value.to_owned())
	}
}

#[cfg(test)]
mod tests {
	use super::Lsn;

	#[test]
	fn orders_lexicographically() {
		assert!(Lsn::from("00000001") < Lsn::from("00000002"));
		assert!(Lsn::from("00000010") > Lsn::from("00000002"));
		assert!(Lsn::default() < Lsn::from("0"));
	}
}

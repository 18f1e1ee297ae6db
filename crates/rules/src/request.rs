use serde_json::Value;

use crate::document::RequestValueRef;

/// Parameters of one authenticated sync request, derived from the verified
/// JWT claims plus any connection parameters the client sent alongside.
#[derive(Debug, Clone, Default)]
pub struct RequestParameters {
	pub user_id: String,
	pub parameters: serde_json::Map<String, Value>,
}

impl RequestParameters {
	#[must_use]
	pub fn new(user_id: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
			parameters: serde_json::Map::new(),
		}
	}

	#[must_use]
	pub fn with_parameters(mut self, parameters: serde_json::Map<String, Value>) -> Self {
		self.parameters = parameters;
		self
	}

	#[must_use]
	pub fn resolve(&self, reference: &RequestValueRef) -> Option<Value> {
		match reference {
			RequestValueRef::UserId => Some(Value::String(self.user_id.clone())),
			RequestValueRef::Parameter(name) => self.parameters.get(name).cloned(),
		}
	}
}

use std::{fmt, time::Duration};

use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;

use crate::AuthError;

/// Coarse algorithm grouping; a key selected by `kid` must agree with the
/// token's family, with no fallback to other keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmFamily {
	Hmac,
	Rsa,
	Ec,
	Ed,
}

impl AlgorithmFamily {
	#[must_use]
	pub fn of(algorithm: Algorithm) -> Self {
		match algorithm {
			Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Self::Hmac,
			Algorithm::RS256
			| Algorithm::RS384
			| Algorithm::RS512
			| Algorithm::PS256
			| Algorithm::PS384
			| Algorithm::PS512 => Self::Rsa,
			Algorithm::ES256 | Algorithm::ES384 => Self::Ec,
			Algorithm::EdDSA => Self::Ed,
		}
	}
}

/// One verification key with its selection metadata.
pub struct StoredKey {
	pub kid: Option<String>,
	pub algorithms: Vec<Algorithm>,
	pub key: DecodingKey,
	/// Additional audience restriction carried by the key itself.
	pub audiences: Option<Vec<String>>,
	/// Per-key override of the configured maximum token lifetime.
	pub max_lifetime: Option<Duration>,
}

impl fmt::Debug for StoredKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StoredKey")
			.field("kid", &self.kid)
			.field("algorithms", &self.algorithms)
			.field("audiences", &self.audiences)
			.finish_non_exhaustive()
	}
}

impl StoredKey {
	/// Shared-secret key accepting the HMAC family.
	#[must_use]
	pub fn from_secret(kid: Option<String>, secret: &[u8]) -> Self {
		Self {
			kid,
			algorithms: vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512],
			key: DecodingKey::from_secret(secret),
			audiences: None,
			max_lifetime: None,
		}
	}

	#[must_use]
	pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
		self.audiences = Some(audiences);
		self
	}

	#[must_use]
	pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
		self.max_lifetime = Some(max_lifetime);
		self
	}

	pub fn from_jwk(jwk: &Jwk) -> Result<Self, AuthError> {
		let (key, algorithms) = match jwk.kty.as_str() {
			"RSA" => {
				let (Some(n), Some(e)) = (&jwk.n, &jwk.e) else {
					return Err(AuthError::InvalidToken(
						"RSA JWK is missing n/e components".into(),
					));
				};

				let key = DecodingKey::from_rsa_components(n, e)
					.map_err(|e| AuthError::JwksFetch(format!("invalid RSA JWK: {e}")))?;
				let algorithms = match jwk.alg.as_deref() {
					Some("RS256") | None => vec![Algorithm::RS256],
					Some("RS384") => vec![Algorithm::RS384],
					Some("RS512") => vec![Algorithm::RS512],
					Some(other) => {
						return Err(AuthError::JwksFetch(format!(
							"unsupported RSA JWK algorithm {other:?}"
						)))
					}
				};

				(key, algorithms)
			}
			"OKP" => {
				let Some(x) = &jwk.x else {
					return Err(AuthError::JwksFetch("OKP JWK is missing x".into()));
				};

				let key = DecodingKey::from_ed_components(x)
					.map_err(|e| AuthError::JwksFetch(format!("invalid Ed JWK: {e}")))?;

				(key, vec![Algorithm::EdDSA])
			}
			other => {
				return Err(AuthError::JwksFetch(format!(
					"unsupported JWK key type {other:?}"
				)))
			}
		};

		Ok(Self {
			kid: jwk.kid.clone(),
			algorithms,
			key,
			audiences: None,
			max_lifetime: None,
		})
	}

	#[must_use]
	pub fn matches_algorithm(&self, algorithm: Algorithm) -> bool {
		self.algorithms
			.iter()
			.any(|candidate| AlgorithmFamily::of(*candidate) == AlgorithmFamily::of(algorithm))
	}
}

/// The subset of RFC 7517 this service understands.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
	pub kty: String,
	#[serde(default)]
	pub kid: Option<String>,
	#[serde(default)]
	pub alg: Option<String>,
	#[serde(default)]
	pub n: Option<String>,
	#[serde(default)]
	pub e: Option<String>,
	#[serde(default)]
	pub x: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwkSet {
	pub keys: Vec<Jwk>,
}

use std::{sync::Arc, time::Duration};

use base64::prelude::{Engine, BASE64_URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, decode_header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use opsync_rules::RequestParameters;

use crate::{collectors::KeyCollector, keys::StoredKey, AuthError};

const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// `aud` may be a single string or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
	One(String),
	Many(Vec<String>),
}

impl Audience {
	fn overlaps(&self, allowed: &[String]) -> bool {
		match self {
			Self::One(aud) => allowed.contains(aud),
			Self::Many(auds) => auds.iter().any(|aud| allowed.contains(aud)),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub sub: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub iss: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub aud: Option<Audience>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub exp: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub iat: Option<i64>,
	/// Free-form sync parameters, evaluated by the sync rules.
	#[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
	pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Claims of a fully verified token.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
	pub user_id: String,
	pub issuer: Option<String>,
	pub issued_at: DateTime<Utc>,
	pub expires_at: DateTime<Utc>,
	pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl VerifiedClaims {
	/// The parameter set the sync rules evaluate for this connection.
	#[must_use]
	pub fn request_parameters(&self) -> RequestParameters {
		RequestParameters::new(self.user_id.clone()).with_parameters(self.parameters.clone())
	}
}

/// Verifies sync tokens against keys from the configured collectors.
pub struct KeyStore {
	collectors: Vec<Arc<dyn KeyCollector>>,
	audiences: Vec<String>,
	max_lifetime: Duration,
}

impl KeyStore {
	#[must_use]
	pub fn new(audiences: Vec<String>) -> Self {
		Self {
			collectors: Vec::new(),
			audiences,
			max_lifetime: DEFAULT_MAX_LIFETIME,
		}
	}

	#[must_use]
	pub fn with_collector(mut self, collector: Arc<dyn KeyCollector>) -> Self {
		self.collectors.push(collector);
		self
	}

	#[must_use]
	pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
		self.max_lifetime = max_lifetime;
		self
	}

	pub async fn verify(&self, token: &str) -> Result<VerifiedClaims, AuthError> {
		let header =
			decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;

		let mut keys = Vec::new();
		let mut collect_error = None;
		for collector in &self.collectors {
			match collector.collect().await {
				Ok(collected) => keys.extend(collected),
				Err(e) => {
					warn!(%e, "key collector failed");
					collect_error.get_or_insert(e);
				}
			}
		}

		let claims = if let Some(selected) = header
			.kid
			.as_deref()
			.and_then(|kid| keys.iter().find(|key| key.kid.as_deref() == Some(kid)))
		{
			// An exact kid match is authoritative: algorithm-family mismatch
			// is an error, never a fallback to other keys.
			if !selected.matches_algorithm(header.alg) {
				return Err(AuthError::AlgorithmMismatch {
					kid: selected.kid.clone(),
				});
			}

			match decode_claims(token, selected, &header) {
				Ok(claims) => self.validate(claims, selected)?,
				Err(e) => {
					debug!(kid = ?header.kid, %e, "kid-selected key failed to verify token");
					return Err(self.key_not_found(token, &header, collect_error));
				}
			}
		} else {
			// Wildcard scan: first keyless key of the right family whose
			// signature verifies wins.
			let mut verified = None;
			for key in keys
				.iter()
				.filter(|key| key.kid.is_none() && key.matches_algorithm(header.alg))
			{
				if let Ok(claims) = decode_claims(token, key, &header) {
					verified = Some(self.validate(claims, key)?);
					break;
				}
			}

			match verified {
				Some(claims) => claims,
				None => return Err(self.key_not_found(token, &header, collect_error)),
			}
		};

		Ok(claims)
	}

	fn validate(
		&self,
		claims: JwtClaims,
		key: &StoredKey,
	) -> Result<VerifiedClaims, AuthError> {
		let sub = claims
			.sub
			.filter(|sub| !sub.is_empty())
			.ok_or(AuthError::MissingRequiredClaim("sub"))?;
		let exp = claims.exp.ok_or(AuthError::MissingRequiredClaim("exp"))?;
		let iat = claims.iat.ok_or(AuthError::MissingRequiredClaim("iat"))?;
		let aud = claims.aud.ok_or(AuthError::MissingRequiredClaim("aud"))?;

		if !aud.overlaps(&self.audiences) {
			return Err(AuthError::AudienceMismatch);
		}
		if let Some(key_audiences) = &key.audiences {
			if !aud.overlaps(key_audiences) {
				return Err(AuthError::AudienceMismatch);
			}
		}

		let now = Utc::now().timestamp();
		if exp <= now {
			return Err(AuthError::TokenExpired);
		}

		let max_lifetime = key.max_lifetime.unwrap_or(self.max_lifetime);
		let lifetime = exp - iat;
		if lifetime > max_lifetime.as_secs() as i64 {
			return Err(AuthError::MaxLifetimeExceeded {
				lifetime_secs: lifetime,
				max_secs: max_lifetime.as_secs() as i64,
			});
		}

		Ok(VerifiedClaims {
			user_id: sub,
			issuer: claims.iss,
			issued_at: Utc
				.timestamp_opt(iat, 0)
				.single()
				.ok_or(AuthError::MissingRequiredClaim("iat"))?,
			expires_at: Utc
				.timestamp_opt(exp, 0)
				.single()
				.ok_or(AuthError::MissingRequiredClaim("exp"))?,
			parameters: claims.parameters,
		})
	}

	fn key_not_found(
		&self,
		token: &str,
		header: &jsonwebtoken::Header,
		collect_error: Option<AuthError>,
	) -> AuthError {
		// A miss is often a rotation race; ask remote collectors to refresh
		// so the client's retry can succeed.
		for collector in &self.collectors {
			collector.request_refresh();
		}

		if let Some(e @ AuthError::JwksFetch(_)) = collect_error {
			return e;
		}

		let hint = unverified_issuer(token)
			.filter(|iss| iss.contains(".supabase.co"))
			.map(|iss| {
				format!(
					"tokens issued by {iss} require the Supabase shared secret or JWKS to be configured"
				)
			});

		AuthError::KeyNotFound {
			kid: header.kid.clone(),
			hint,
		}
	}
}

fn decode_claims(
	token: &str,
	key: &StoredKey,
	header: &jsonwebtoken::Header,
) -> Result<JwtClaims, jsonwebtoken::errors::Error> {
	let mut validation = Validation::new(header.alg);
	// Claim checks run manually afterwards so each failure maps to its own
	// error code; decode only verifies the signature here.
	validation.validate_exp = false;
	validation.validate_aud = false;
	validation.required_spec_claims.clear();

	decode::<JwtClaims>(token, &key.key, &validation).map(|data| data.claims)
}

/// Issuer read from the payload without verification; only ever used to
/// improve error messages.
fn unverified_issuer(token: &str) -> Option<String> {
	let payload = token.split('.').nth(1)?;
	let bytes = BASE64_URL_SAFE_NO_PAD.decode(payload).ok()?;
	let claims: JwtClaims = serde_json::from_slice(&bytes).ok()?;
	claims.iss
}

#[cfg(test)]
mod tests {
	use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

	use crate::collectors::StaticKeyCollector;

	use super::*;

	const SECRET: &[u8] = b"test-secret";

	fn claims(sub: &str) -> JwtClaims {
		let now = Utc::now().timestamp();

		JwtClaims {
			sub: Some(sub.to_owned()),
			iss: Some("https://auth.example.com".to_owned()),
			aud: Some(Audience::One("sync".to_owned())),
			exp: Some(now + 300),
			iat: Some(now),
			parameters: serde_json::Map::new(),
		}
	}

	fn sign(claims: &JwtClaims, kid: Option<&str>) -> String {
		let mut header = Header::new(Algorithm::HS256);
		header.kid = kid.map(str::to_owned);

		encode(&header, claims, &EncodingKey::from_secret(SECRET)).unwrap()
	}

	fn store_with(keys: Vec<StoredKey>) -> KeyStore {
		KeyStore::new(vec!["sync".to_owned()])
			.with_collector(Arc::new(StaticKeyCollector::new(keys)))
	}

	#[tokio::test]
	async fn kid_selected_key_verifies() {
		let store = store_with(vec![StoredKey::from_secret(Some("k1".into()), SECRET)]);
		let token = sign(&claims("u1"), Some("k1"));

		let verified = store.verify(&token).await.unwrap();
		assert_eq!(verified.user_id, "u1");
	}

	#[tokio::test]
	async fn wildcard_key_verifies_tokens_without_kid() {
		let store = store_with(vec![StoredKey::from_secret(None, SECRET)]);
		let token = sign(&claims("u1"), None);

		assert!(store.verify(&token).await.is_ok());
	}

	#[tokio::test]
	async fn algorithm_family_mismatch_has_no_fallback() {
		// The kid matches a key of a different family; a valid wildcard key
		// exists but must not be consulted.
		let rsa_shaped = StoredKey {
			algorithms: vec![Algorithm::RS256],
			..StoredKey::from_secret(Some("k1".into()), SECRET)
		};
		let store = store_with(vec![rsa_shaped, StoredKey::from_secret(None, SECRET)]);
		let token = sign(&claims("u1"), Some("k1"));

		let error = store.verify(&token).await.unwrap_err();
		assert!(matches!(error, AuthError::AlgorithmMismatch { .. }));
		assert_eq!(error.code(), "ALG_MISMATCH");
	}

	#[tokio::test]
	async fn audience_must_overlap() {
		let store = store_with(vec![StoredKey::from_secret(None, SECRET)]);
		let mut rejected = claims("u1");
		rejected.aud = Some(Audience::Many(vec!["other".to_owned()]));

		let error = store.verify(&sign(&rejected, None)).await.unwrap_err();
		assert_eq!(error.code(), "AUD_MISMATCH");
	}

	#[tokio::test]
	async fn key_level_audience_restriction_applies() {
		let store = store_with(vec![StoredKey::from_secret(None, SECRET)
			.with_audiences(vec!["payments".to_owned()])]);

		// Passes the store audience but not the key's restriction.
		let error = store.verify(&sign(&claims("u1"), None)).await.unwrap_err();
		assert_eq!(error.code(), "AUD_MISMATCH");
	}

	#[tokio::test]
	async fn expired_tokens_are_rejected() {
		let store = store_with(vec![StoredKey::from_secret(None, SECRET)]);
		let mut expired = claims("u1");
		expired.exp = Some(Utc::now().timestamp() - 10);

		let error = store.verify(&sign(&expired, None)).await.unwrap_err();
		assert_eq!(error.code(), "TOKEN_EXPIRED");
	}

	#[tokio::test]
	async fn excessive_lifetime_is_rejected() {
		let store = store_with(vec![StoredKey::from_secret(None, SECRET)]);
		let mut greedy = claims("u1");
		greedy.exp = Some(Utc::now().timestamp() + 60 * 60 * 24 * 30);

		let error = store.verify(&sign(&greedy, None)).await.unwrap_err();
		assert_eq!(error.code(), "MAX_LIFETIME_EXCEEDED");

		// A per-key override can allow it.
		let lenient = store_with(vec![StoredKey::from_secret(None, SECRET)
			.with_max_lifetime(Duration::from_secs(60 * 60 * 24 * 365))]);
		assert!(lenient.verify(&sign(&greedy, None)).await.is_ok());
	}

	#[tokio::test]
	async fn missing_claims_are_named() {
		let store = store_with(vec![StoredKey::from_secret(None, SECRET)]);
		let mut anonymous = claims("u1");
		anonymous.sub = None;

		let error = store.verify(&sign(&anonymous, None)).await.unwrap_err();
		assert!(matches!(error, AuthError::MissingRequiredClaim("sub")));
	}

	#[tokio::test]
	async fn unknown_supabase_issuer_gets_a_hint() {
		let store = store_with(vec![]);
		let mut supabase = claims("u1");
		supabase.iss = Some("https://example.supabase.co/auth/v1".to_owned());

		let error = store.verify(&sign(&supabase, Some("missing"))).await.unwrap_err();
		let AuthError::KeyNotFound { hint, .. } = error else {
			panic!("expected KeyNotFound, got {error:?}");
		};
		assert!(hint.unwrap().contains("Supabase"));
	}

	#[tokio::test]
	async fn wrong_signature_is_a_key_miss() {
		let store = store_with(vec![StoredKey::from_secret(None, b"other-secret")]);

		let error = store.verify(&sign(&claims("u1"), None)).await.unwrap_err();
		assert_eq!(error.code(), "KEY_NOT_FOUND");
	}
}

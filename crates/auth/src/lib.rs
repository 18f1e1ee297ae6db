//! Token verification for sync connections: key collectors, kid/wildcard key
//! selection, and claim enforcement.

pub mod collectors;
pub mod keys;
pub mod store;

pub use collectors::{
	CachedKeyCollector, KeyCollector, RemoteJwksCollector, StaticKeyCollector,
	SupabaseKeyCollector,
};
pub use keys::{AlgorithmFamily, Jwk, JwkSet, StoredKey};
pub use store::{KeyStore, VerifiedClaims};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
	#[error("token audience does not overlap the configured audiences")]
	AudienceMismatch,
	#[error("token expired")]
	TokenExpired,
	#[error("key {kid:?} uses a different algorithm family than the token")]
	AlgorithmMismatch { kid: Option<String> },
	#[error("no key found to verify this token (kid {kid:?})")]
	KeyNotFound {
		kid: Option<String>,
		hint: Option<String>,
	},
	#[error("token lifetime {lifetime_secs}s exceeds the maximum of {max_secs}s")]
	MaxLifetimeExceeded { lifetime_secs: i64, max_secs: i64 },
	#[error("token is missing required claim {0:?}")]
	MissingRequiredClaim(&'static str),
	#[error("failed to fetch JWKS: {0}")]
	JwksFetch(String),
	#[error("malformed token: {0}")]
	InvalidToken(String),
}

impl AuthError {
	#[must_use]
	pub fn code(&self) -> &'static str {
		match self {
			Self::AudienceMismatch => "AUD_MISMATCH",
			Self::TokenExpired => "TOKEN_EXPIRED",
			Self::AlgorithmMismatch { .. } => "ALG_MISMATCH",
			Self::KeyNotFound { .. } => "KEY_NOT_FOUND",
			Self::MaxLifetimeExceeded { .. } => "MAX_LIFETIME_EXCEEDED",
			Self::MissingRequiredClaim(_) => "MISSING_REQUIRED_CLAIM",
			Self::JwksFetch(_) => "JWKS_FETCH_FAILED",
			Self::InvalidToken(_) => "INVALID_TOKEN",
		}
	}
}

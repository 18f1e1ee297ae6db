use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};

use opsync_auth::{
	CachedKeyCollector, KeyStore, RemoteJwksCollector, StaticKeyCollector, StoredKey,
	SupabaseKeyCollector,
};
use opsync_rules::SyncRules;

const JWKS_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Sync rules used when no `OPSYNC_RULES` file is configured; everything in
/// `items` lands in one global bucket.
const DEFAULT_RULES: &str = r#"{
	"bucket_definitions": [
		{ "name": "global", "data": [{ "table": "items" }] }
	]
}"#;

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub port: u16,
	pub audiences: Vec<String>,
	pub rules_path: Option<PathBuf>,
	pub jwks_url: Option<String>,
	pub supabase_secret: Option<String>,
	/// Shared HS256 secret for development setups.
	pub dev_secret: Option<String>,
	pub token_expiry_skew: Duration,
	pub max_token_lifetime: Option<Duration>,
}

impl ServerConfig {
	pub fn from_env() -> Result<Self> {
		let port = match env::var("OPSYNC_PORT") {
			Ok(port) => port.parse::<u16>().context("invalid OPSYNC_PORT")?,
			Err(_) => 8080,
		};

		let audiences = env::var("OPSYNC_AUDIENCE")
			.unwrap_or_else(|_| "opsync".to_owned())
			.split(',')
			.map(|audience| audience.trim().to_owned())
			.filter(|audience| !audience.is_empty())
			.collect();

		Ok(Self {
			port,
			audiences,
			rules_path: env::var("OPSYNC_RULES").ok().map(PathBuf::from),
			jwks_url: env::var("OPSYNC_JWKS_URL").ok(),
			supabase_secret: env::var("OPSYNC_SUPABASE_SECRET").ok(),
			dev_secret: env::var("OPSYNC_DEV_SECRET").ok(),
			token_expiry_skew: Duration::from_secs(
				env::var("OPSYNC_TOKEN_EXPIRY_SKEW")
					.ok()
					.and_then(|skew| skew.parse().ok())
					.unwrap_or(0),
			),
			max_token_lifetime: env::var("OPSYNC_MAX_TOKEN_LIFETIME")
				.ok()
				.and_then(|lifetime| lifetime.parse().ok())
				.map(Duration::from_secs),
		})
	}

	pub fn load_rules(&self) -> Result<SyncRules> {
		let json = match &self.rules_path {
			Some(path) => fs::read_to_string(path)
				.with_context(|| format!("failed to read sync rules from {}", path.display()))?,
			None => DEFAULT_RULES.to_owned(),
		};

		SyncRules::from_json(&json).context("invalid sync rules document")
	}

	pub fn build_key_store(&self) -> Result<KeyStore> {
		let mut store = KeyStore::new(self.audiences.clone());

		if let Some(max_lifetime) = self.max_token_lifetime {
			store = store.with_max_lifetime(max_lifetime);
		}

		if let Some(secret) = &self.dev_secret {
			store = store.with_collector(Arc::new(StaticKeyCollector::new(vec![
				StoredKey::from_secret(None, secret.as_bytes()),
			])));
		}

		if let Some(secret) = &self.supabase_secret {
			store = store.with_collector(Arc::new(SupabaseKeyCollector::new(secret)));
		}

		if let Some(url) = &self.jwks_url {
			let url = url.parse().context("invalid OPSYNC_JWKS_URL")?;
			let remote = RemoteJwksCollector::new(url)
				.map_err(|e| anyhow::anyhow!("failed to build JWKS collector: {e}"))?;
			store = store.with_collector(Arc::new(CachedKeyCollector::new(
				Arc::new(remote),
				JWKS_CACHE_TTL,
			)));
		}

		Ok(store)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_rules_parse() {
		let config = ServerConfig {
			port: 8080,
			audiences: vec!["opsync".to_owned()],
			rules_path: None,
			jwks_url: None,
			supabase_secret: None,
			dev_secret: None,
			token_expiry_skew: Duration::ZERO,
			max_token_lifetime: None,
		};

		assert!(config.load_rules().is_ok());
	}
}

use std::{
	net::IpAddr,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::RwLock, time::Instant};
use tracing::{debug, warn};

use crate::{
	keys::{JwkSet, StoredKey},
	AuthError,
};

/// A source of verification keys.
#[async_trait]
pub trait KeyCollector: Send + Sync + 'static {
	async fn collect(&self) -> Result<Vec<Arc<StoredKey>>, AuthError>;

	/// Called when a token's key was not found; remote collectors refresh in
	/// the background so the *next* attempt may succeed.
	fn request_refresh(&self) {}
}

/// Keys configured directly in the service configuration.
pub struct StaticKeyCollector {
	keys: Vec<Arc<StoredKey>>,
}

impl StaticKeyCollector {
	#[must_use]
	pub fn new(keys: Vec<StoredKey>) -> Self {
		Self {
			keys: keys.into_iter().map(Arc::new).collect(),
		}
	}
}

#[async_trait]
impl KeyCollector for StaticKeyCollector {
	async fn collect(&self) -> Result<Vec<Arc<StoredKey>>, AuthError> {
		Ok(self.keys.clone())
	}
}

/// Supabase projects sign with a shared secret and a fixed audience.
pub struct SupabaseKeyCollector {
	key: Arc<StoredKey>,
}

impl SupabaseKeyCollector {
	#[must_use]
	pub fn new(secret: &str) -> Self {
		Self {
			key: Arc::new(
				StoredKey::from_secret(None, secret.as_bytes())
					.with_audiences(vec!["authenticated".to_owned()]),
			),
		}
	}
}

#[async_trait]
impl KeyCollector for SupabaseKeyCollector {
	async fn collect(&self) -> Result<Vec<Arc<StoredKey>>, AuthError> {
		Ok(vec![Arc::clone(&self.key)])
	}
}

/// Fetches a JWKS document over HTTPS.
///
/// The JWKS host is resolved before any request goes out; if any resolved
/// address falls in a private, loopback, link-local, or otherwise
/// non-routable range, the fetch is refused. A hostname pointing at internal
/// infrastructure is rejected the same as a literal internal address.
pub struct RemoteJwksCollector {
	url: reqwest::Url,
	client: reqwest::Client,
	block_private_hosts: bool,
}

impl RemoteJwksCollector {
	pub fn new(url: reqwest::Url) -> Result<Self, AuthError> {
		Ok(Self {
			url,
			client: reqwest::Client::builder()
				.timeout(Duration::from_secs(30))
				.build()
				.map_err(|e| AuthError::JwksFetch(format!("http client init failed: {e}")))?,
			block_private_hosts: true,
		})
	}

	#[must_use]
	pub fn allow_private_hosts(mut self) -> Self {
		self.block_private_hosts = false;
		self
	}

	async fn check_host(&self) -> Result<(), AuthError> {
		if !self.block_private_hosts {
			return Ok(());
		}

		let Some(host) = self.url.host_str() else {
			return Err(AuthError::JwksFetch(format!(
				"JWKS url {} has no host",
				self.url,
			)));
		};
		let host = host.trim_start_matches('[').trim_end_matches(']');
		let port = self.url.port_or_known_default().unwrap_or(443);

		let addresses = tokio::net::lookup_host((host, port))
			.await
			.map_err(|e| {
				AuthError::JwksFetch(format!("failed to resolve JWKS host {host:?}: {e}"))
			})?;

		for address in addresses {
			if blocked_address(address.ip()) {
				return Err(AuthError::JwksFetch(format!(
					"JWKS host {host:?} resolves to {}, which is not publicly routable",
					address.ip(),
				)));
			}
		}

		Ok(())
	}
}

fn blocked_address(ip: IpAddr) -> bool {
	match ip {
		IpAddr::V4(ip) => {
			ip.is_private()
				|| ip.is_loopback()
				|| ip.is_link_local()
				|| ip.is_unspecified()
				|| ip.is_broadcast()
		}
		IpAddr::V6(ip) => {
			if let Some(mapped) = ip.to_ipv4_mapped() {
				return blocked_address(IpAddr::V4(mapped));
			}

			// fc00::/7 unique-local plus loopback and unspecified.
			ip.is_loopback() || ip.is_unspecified() || (ip.segments()[0] & 0xfe00) == 0xfc00
		}
	}
}

#[async_trait]
impl KeyCollector for RemoteJwksCollector {
	async fn collect(&self) -> Result<Vec<Arc<StoredKey>>, AuthError> {
		self.check_host().await?;

		debug!(url = %self.url, "fetching JWKS");

		let response = self
			.client
			.get(self.url.clone())
			.send()
			.await
			.and_then(reqwest::Response::error_for_status)
			.map_err(|e| AuthError::JwksFetch(e.to_string()))?;

		let jwks: JwkSet = response
			.json()
			.await
			.map_err(|e| AuthError::JwksFetch(format!("invalid JWKS document: {e}")))?;

		let mut keys = Vec::with_capacity(jwks.keys.len());
		for jwk in &jwks.keys {
			match StoredKey::from_jwk(jwk) {
				Ok(key) => keys.push(Arc::new(key)),
				Err(e) => warn!(kid = ?jwk.kid, %e, "skipping unusable JWK"),
			}
		}

		Ok(keys)
	}
}

/// Caches another collector's keys with a TTL, serving stale keys when a
/// refresh fails, and refreshing in the background on key-miss hints.
pub struct CachedKeyCollector {
	inner: Arc<dyn KeyCollector>,
	ttl: Duration,
	state: Arc<RwLock<Option<CachedKeys>>>,
	refreshing: Arc<AtomicBool>,
}

#[derive(Clone)]
struct CachedKeys {
	fetched_at: Instant,
	keys: Vec<Arc<StoredKey>>,
}

impl CachedKeyCollector {
	#[must_use]
	pub fn new(inner: Arc<dyn KeyCollector>, ttl: Duration) -> Self {
		Self {
			inner,
			ttl,
			state: Arc::new(RwLock::new(None)),
			refreshing: Arc::new(AtomicBool::new(false)),
		}
	}

	async fn refresh(
		inner: &Arc<dyn KeyCollector>,
		state: &Arc<RwLock<Option<CachedKeys>>>,
	) -> Result<Vec<Arc<StoredKey>>, AuthError> {
		let keys = inner.collect().await?;

		*state.write().await = Some(CachedKeys {
			fetched_at: Instant::now(),
			keys: keys.clone(),
		});

		Ok(keys)
	}
}

#[async_trait]
impl KeyCollector for CachedKeyCollector {
	async fn collect(&self) -> Result<Vec<Arc<StoredKey>>, AuthError> {
		let cached = self.state.read().await.clone();

		if let Some(cached) = &cached {
			if cached.fetched_at.elapsed() < self.ttl {
				return Ok(cached.keys.clone());
			}
		}

		match Self::refresh(&self.inner, &self.state).await {
			Ok(keys) => Ok(keys),
			Err(e) => match cached {
				// Serving stale keys beats rejecting every connection.
				Some(cached) => {
					warn!(%e, "key refresh failed, serving stale keys");
					Ok(cached.keys)
				}
				None => Err(e),
			},
		}
	}

	fn request_refresh(&self) {
		if self
			.refreshing
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return;
		}

		let inner = Arc::clone(&self.inner);
		let state = Arc::clone(&self.state);
		let refreshing = Arc::clone(&self.refreshing);

		tokio::spawn(async move {
			if let Err(e) = Self::refresh(&inner, &state).await {
				warn!(%e, "background key refresh failed");
			}
			refreshing.store(false, Ordering::Release);
		});
	}
}

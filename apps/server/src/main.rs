use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
	routing::{get, post},
	Router,
};
use tokio::{
	net::TcpListener,
	sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use opsync_auth::KeyStore;
use opsync_replication::{run_replication, BatchWriter, ReplicationEvent, WriterTuning};
use opsync_storage::{BucketStorage, MemoryBucketStorage};
use opsync_stream::{SyncStreamService, SyncStreamTuning};
use opsync_types::Lsn;

mod config;
mod sync;

use config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
	pub service: Arc<SyncStreamService>,
	pub key_store: Arc<KeyStore>,
	pub token_expiry_skew: Duration,
	pub shutdown: CancellationToken,
	/// Replication adapters feed source events through this channel.
	pub replication_events: mpsc::Sender<ReplicationEvent>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::registry()
		.with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with(tracing_subscriber::fmt::layer())
		.init();

	let config = ServerConfig::from_env()?;
	let shutdown = CancellationToken::new();

	let storage: Arc<MemoryBucketStorage> = Arc::new(MemoryBucketStorage::new());
	let rules = config.load_rules()?;
	let group = storage.create_sync_rules(rules).await?;
	let rules = storage.group_rules(group).await?.rules;

	let writer = BatchWriter::new(
		storage.clone(),
		group,
		rules,
		Arc::new(Mutex::new(())),
		WriterTuning::default(),
	);

	let (replication_events, events_rx) = mpsc::channel(1024);

	// Replication loop; a fatal replication error takes the process down.
	let replication = tokio::spawn(run_replication(writer, events_rx, shutdown.clone()));
	tokio::spawn({
		let shutdown = shutdown.clone();
		async move {
			match replication.await {
				Ok(Ok(())) => {}
				Ok(Err(e)) => {
					error!(code = e.code(), %e, "replication failed fatally");
					std::process::exit(1);
				}
				Err(e) => {
					if !shutdown.is_cancelled() {
						error!(%e, "replication task aborted");
						std::process::exit(1);
					}
				}
			}
		}
	});

	// With no adapter attached yet, an initial empty commit activates the
	// sync rules so connections can stream.
	replication_events
		.send(ReplicationEvent::Commit(Lsn::from("0/0")))
		.await
		.ok();

	let service = SyncStreamService::new(
		storage.clone() as Arc<dyn BucketStorage>,
		SyncStreamTuning::default(),
	);

	let state = AppState {
		service,
		key_store: Arc::new(config.build_key_store()?),
		token_expiry_skew: config.token_expiry_skew,
		shutdown: shutdown.clone(),
		replication_events,
	};

	let app = Router::new()
		.route("/", get(|| async { "opsync server" }))
		.route("/health", get(|| async { "OK" }))
		.route("/sync/stream", post(sync::stream_sync))
		.route("/write-checkpoint", post(sync::create_write_checkpoint))
		.with_state(state);

	let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
	let listener = TcpListener::bind(addr).await?;
	info!("listening on http://{addr}");

	axum::serve(listener, app)
		.with_graceful_shutdown({
			let shutdown = shutdown.clone();
			async move {
				let _ = tokio::signal::ctrl_c().await;
				info!("shutting down");
				shutdown.cancel();
			}
		})
		.await?;

	shutdown.cancel();

	Ok(())
}

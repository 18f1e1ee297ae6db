//! The streaming sync HTTP surface.

use std::{sync::Arc, time::Duration};

use axum::{
	body::{Body, Bytes},
	extract::{Query, State},
	http::{header, HeaderMap, StatusCode},
	response::{IntoResponse, Response},
	Json,
};
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use opsync_storage::BucketStorage;
use opsync_stream::{StreamEvent, SyncStreamError, SyncStreamParams};
use opsync_types::{encode::encode_line, EncodedFrame, PayloadFlavor, StreamingSyncRequest};

use crate::AppState;

/// Error document sent to clients before the connection closes.
#[derive(Debug, Serialize)]
pub struct ErrorDoc {
	pub error_code: String,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub hint: Option<String>,
}

impl ErrorDoc {
	fn auth(e: &opsync_auth::AuthError) -> Self {
		let hint = match e {
			opsync_auth::AuthError::KeyNotFound { hint, .. } => hint.clone(),
			_ => None,
		};

		Self {
			error_code: e.code().to_owned(),
			message: e.to_string(),
			hint,
		}
	}

	fn stream(e: &SyncStreamError) -> Self {
		Self {
			error_code: e.code().to_owned(),
			message: e.to_string(),
			hint: None,
		}
	}
}

#[derive(Debug, Deserialize, Default)]
pub struct TokenQuery {
	#[serde(default)]
	token: Option<String>,
}

pub async fn stream_sync(
	State(state): State<AppState>,
	Query(query): Query<TokenQuery>,
	headers: HeaderMap,
	body: Bytes,
) -> Response {
	let Some(token) = bearer_token(&headers).or(query.token) else {
		return unauthorized(ErrorDoc {
			error_code: "KEY_NOT_FOUND".to_owned(),
			message: "missing sync token".to_owned(),
			hint: Some("pass a Bearer token or the `token` query parameter".to_owned()),
		});
	};

	let claims = match state.key_store.verify(&token).await {
		Ok(claims) => claims,
		Err(e) => {
			debug!(%e, "rejected sync token");
			return unauthorized(ErrorDoc::auth(&e));
		}
	};

	let request: StreamingSyncRequest = if body.is_empty() {
		StreamingSyncRequest::default()
	} else {
		match serde_json::from_slice(&body) {
			Ok(request) => request,
			Err(e) => {
				return (
					StatusCode::BAD_REQUEST,
					Json(ErrorDoc {
						error_code: "INVALID_REQUEST".to_owned(),
						message: format!("invalid sync request body: {e}"),
						hint: None,
					}),
				)
					.into_response();
			}
		}
	};

	let flavor = PayloadFlavor::from_request(request.raw_data, request.binary_data);

	// Merge connection parameters over the token's parameter claims.
	let mut request_parameters = claims.request_parameters();
	if let Some(parameters) = request.parameters {
		request_parameters.parameters.extend(parameters);
	}

	let expires_in = (claims.expires_at - Utc::now())
		.to_std()
		.unwrap_or(Duration::ZERO)
		.saturating_sub(state.token_expiry_skew);

	let params = SyncStreamParams {
		request: request_parameters,
		client_id: request.client_id,
		initial_buckets: request.buckets,
		token_expires_at: Some(tokio::time::Instant::now() + expires_in),
	};

	let abort = state.shutdown.child_token();
	let stream = state.service.stream_sync(params, abort.clone());
	// Cancels the connection scope when the client goes away and the body
	// stream is dropped.
	let connection_guard = abort.drop_guard();

	let body_stream = stream.filter_map(move |event| {
		let _keep_alive = &connection_guard;

		let frame = match event {
			Ok(StreamEvent::Line(line)) => match encode_line(&line, flavor) {
				Ok(frame) => Some(frame_bytes(frame)),
				Err(e) => {
					warn!(%e, "failed to encode sync line");
					None
				}
			},
			// Transports flush per chunk; the hint only matters for
			// buffering transports.
			Ok(StreamEvent::FlushHint) => None,
			Err(e) => {
				warn!(code = e.code(), %e, "sync stream failed");
				let doc = ErrorDoc::stream(&e);
				serde_json::to_vec(&doc).ok().map(|mut bytes| {
					bytes.push(b'\n');
					Bytes::from(bytes)
				})
			}
		};

		async move { frame.map(Ok::<_, std::convert::Infallible>) }
	});

	let content_type = match flavor {
		PayloadFlavor::BinaryData => "application/octet-stream",
		_ => "application/x-ndjson",
	};

	Response::builder()
		.status(StatusCode::OK)
		.header(header::CONTENT_TYPE, content_type)
		.body(Body::from_stream(body_stream))
		.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Register a write checkpoint for the authenticated user; the returned
/// checkpoint id shows up in checkpoint lines once replication passes the
/// current position.
pub async fn create_write_checkpoint(
	State(state): State<AppState>,
	Query(query): Query<TokenQuery>,
	headers: HeaderMap,
) -> Response {
	let Some(token) = bearer_token(&headers).or(query.token) else {
		return unauthorized(ErrorDoc {
			error_code: "KEY_NOT_FOUND".to_owned(),
			message: "missing sync token".to_owned(),
			hint: None,
		});
	};

	let claims = match state.key_store.verify(&token).await {
		Ok(claims) => claims,
		Err(e) => return unauthorized(ErrorDoc::auth(&e)),
	};

	let lsn = match state.service.storage().active_checkpoint().await {
		Ok(Some(checkpoint)) => checkpoint.lsn,
		Ok(None) => {
			return (
				StatusCode::SERVICE_UNAVAILABLE,
				Json(ErrorDoc {
					error_code: "NO_ACTIVE_SYNC_RULES".to_owned(),
					message: "no active sync rules".to_owned(),
					hint: None,
				}),
			)
				.into_response();
		}
		Err(e) => {
			return (
				StatusCode::INTERNAL_SERVER_ERROR,
				Json(ErrorDoc {
					error_code: e.code().to_owned(),
					message: e.to_string(),
					hint: None,
				}),
			)
				.into_response();
		}
	};

	match state
		.service
		.storage()
		.create_write_checkpoint(&claims.user_id, "http", lsn)
		.await
	{
		Ok(checkpoint) => Json(serde_json::json!({
			"write_checkpoint": checkpoint.to_string(),
		}))
		.into_response(),
		Err(e) => (
			StatusCode::INTERNAL_SERVER_ERROR,
			Json(ErrorDoc {
				error_code: e.code().to_owned(),
				message: e.to_string(),
				hint: None,
			}),
		)
			.into_response(),
	}
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
	headers
		.get(header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "))
		.map(str::to_owned)
}

fn unauthorized(doc: ErrorDoc) -> Response {
	(StatusCode::UNAUTHORIZED, Json(doc)).into_response()
}

/// Text flavors are newline-delimited; the binary flavor is length-prefixed.
fn frame_bytes(frame: EncodedFrame) -> Bytes {
	match frame {
		EncodedFrame::Text(mut text) => {
			text.push('\n');
			Bytes::from(text)
		}
		EncodedFrame::Binary(payload) => {
			let mut framed = Vec::with_capacity(payload.len() + 4);
			framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
			framed.extend_from_slice(&payload);
			Bytes::from(framed)
		}
	}
}

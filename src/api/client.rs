//! Client-facing API (port 8080).
//!
//! This is intentionally a thin layer: all routing logic lives in
//! [`crate::routing::router`]. Handlers translate HTTP concerns (status
//! codes, JSON bodies, SSE framing) into router calls and back. Caller
//! identity arrives as the `X-User-Id` header set by the deployment's auth
//! layer; requests without it are anonymous and use server credentials only.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, GatewayError};
use crate::fanout;
use crate::ledger::RequestKind;
use crate::routing::Strategy;
use crate::schema::ChatRequest;
use crate::store::StoredProviderKey;

use super::{user_from, AppState};

/// Build the client-facing axum router (port 8080).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(super::health::healthz))
        .route("/status", get(super::status::status))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/chat/ws", get(super::ws::chat_ws))
        .route("/v1/models", get(list_models))
        .route("/v1/providers", get(list_providers))
        .route("/v1/keys", get(list_keys).put(put_key))
        .route("/v1/keys/{provider}", axum::routing::delete(delete_key))
        .route("/v1/strategy", put(put_strategy).delete(clear_strategy))
        .with_state(state)
}

/// POST /v1/chat/completions — buffered JSON or SSE stream, depending on the
/// request's `stream` flag.
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    let user_id = user_from(&headers).or_else(|| req.user_id.clone());
    let cancel = CancellationToken::new();

    if req.wants_stream() {
        let stream = state
            .router
            .route_stream(req, user_id, RequestKind::ChatStream, cancel.clone())
            .await?;
        return Ok(fanout::sse_response(stream, cancel));
    }

    let resp = state.router.route(&req, user_id.as_deref(), &cancel).await?;
    Ok(Json(resp).into_response())
}

/// GET /v1/models — union of models advertised by providers this caller can
/// use, in the OpenAI listing shape.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user_id = user_from(&headers);
    let providers = state.router.list_providers_for(user_id.as_deref()).await?;

    let mut data: Vec<Value> = Vec::new();
    for provider in &providers {
        for model in &provider.models {
            data.push(json!({
                "id": model,
                "object": "model",
                "owned_by": provider.name,
            }));
        }
    }
    Ok(Json(json!({ "object": "list", "data": data })))
}

/// GET /v1/providers — providers usable by this caller.
pub async fn list_providers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user_id = user_from(&headers);
    let providers = state.router.list_providers_for(user_id.as_deref()).await?;
    Ok(Json(json!({ "providers": providers })))
}

fn require_user(headers: &HeaderMap) -> Result<String, GatewayError> {
    user_from(headers)
        .ok_or_else(|| GatewayError::Unauthorized("X-User-Id header is required".into()))
}

#[derive(Debug, Deserialize)]
pub struct PutKeyBody {
    provider: String,
    api_key: String,
}

/// PUT /v1/keys — seal and store the caller's own key for one provider.
pub async fn put_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PutKeyBody>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = require_user(&headers)?;
    if body.api_key.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("`api_key` must not be empty".into()).into());
    }
    let known = state
        .router
        .providers()
        .iter()
        .any(|p| p.name() == body.provider);
    if !known {
        return Err(
            GatewayError::InvalidRequest(format!("unknown provider `{}`", body.provider)).into(),
        );
    }

    // Plaintext is sealed immediately; only the ciphertext leaves this frame.
    let ciphertext = state.router.seal_key(&body.api_key)?;
    state
        .credentials
        .upsert_provider_key(StoredProviderKey {
            user_id,
            provider: body.provider.clone(),
            ciphertext,
            is_active: true,
            created_at: Utc::now(),
        })
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(Json(json!({ "provider": body.provider, "status": "stored" })))
}

/// GET /v1/keys — the caller's keys, ciphertext redacted.
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user_id = require_user(&headers)?;
    let keys = state
        .credentials
        .list_provider_keys(&user_id)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    let keys: Vec<Value> = keys
        .iter()
        .map(|k| {
            json!({
                "provider": k.provider,
                "is_active": k.is_active,
                "created_at": k.created_at,
            })
        })
        .collect();
    Ok(Json(json!({ "keys": keys })))
}

/// DELETE /v1/keys/{provider}.
pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = require_user(&headers)?;
    let removed = state
        .credentials
        .delete_provider_key(&user_id, &provider)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    if !removed {
        return Err(GatewayError::InvalidRequest(format!(
            "no key stored for provider `{provider}`"
        ))
        .into());
    }
    Ok(Json(json!({ "provider": provider, "status": "deleted" })))
}

#[derive(Debug, Deserialize)]
pub struct PutStrategyBody {
    strategy: Strategy,
}

/// PUT /v1/strategy — the caller's routing preference. Rejected while the
/// admin lock is on.
pub async fn put_strategy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PutStrategyBody>,
) -> Result<impl IntoResponse, AppError> {
    let user_id = require_user(&headers)?;
    state.router.set_user_strategy(&user_id, Some(body.strategy)).await?;
    Ok(Json(json!({ "strategy": body.strategy })))
}

/// DELETE /v1/strategy — fall back to the admin default.
pub async fn clear_strategy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let user_id = require_user(&headers)?;
    state.router.set_user_strategy(&user_id, None).await?;
    Ok(Json(json!({ "strategy": Value::Null })))
}

//! Liveness probe for the client port.
//!
//! `GET /healthz` reads nothing but in-process state — a registry snapshot
//! behind an uncontended read lock — so it cannot hang on an upstream
//! provider or a store and stays truthful as a container liveness probe
//! even while every backend is down. Whether the backends themselves are
//! reachable is a different question, answered by the admin
//! `/admin/providers/health` probes.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use super::AppState;

/// `GET /healthz` — always 200 while the process is serving. Reports how
/// many providers are registered and whether BYOK is enabled, so a probe
/// log line is enough to spot a misconfigured deployment.
pub async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "providers": state.router.providers().len(),
            "byok": state.router.byok_enabled(),
        })),
    )
}

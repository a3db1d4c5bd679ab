//! Public status endpoint (`GET /status`, client port).
//!
//! Safe to expose publicly without authentication.
//! Returns gateway liveness and aggregate counters only.
//!
//! What this endpoint **does not** include:
//! - Provider names or URLs
//! - Model names
//! - Routing configuration
//! - Any value that could reveal internal infrastructure

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use super::AppState;

/// `GET /status` — public liveness and counters.
///
/// Example response:
/// ```json
/// {
///   "status": "ok",
///   "ready": true,
///   "uptime_secs": 3600,
///   "providers": 4,
///   "ledger": { "pending": 0, "dropped": 0 }
/// }
/// ```
///
/// `ready` is `false` when one or more providers have `api_key_env`
/// configured but the environment variable is not set or is empty. No
/// provider names are exposed — only the boolean.
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();

    // Count providers that name a key env var but resolve nothing.
    // We expose the count as a boolean, not the names.
    let unconfigured = state
        .config
        .providers
        .iter()
        .filter(|p| p.api_key_env.is_some() && p.api_key().is_none())
        .count();
    let ready = unconfigured == 0;

    let ledger = state.router.ledger();
    Json(json!({
        "status": "ok",
        "ready": ready,
        "uptime_secs": uptime_secs,
        "providers": state.config.providers.len(),
        "ledger": {
            "pending": ledger.pending(),
            "dropped": ledger.dropped_total(),
        },
    }))
}

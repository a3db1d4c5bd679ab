//! Admin API (port 8081) — operator-facing introspection and routing control.
//!
//! These endpoints are separated onto a different port so they can be
//! network-restricted independently of the client API (e.g. accessible only
//! from the internal Docker network, never exposed to the internet).

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::providers::build_provider;
use crate::routing::{RoutingRule, RuleScope, Strategy};

use super::admin_auth::AdminActor;
use super::AppState;

/// Attribution recorded on settings changes. The auth middleware supplies
/// the [`AdminActor`] extension; routes mounted without it (tests, embedded
/// use) fall back to a generic identity.
fn actor_name(actor: Option<Extension<AdminActor>>) -> String {
    actor
        .map(|Extension(AdminActor(name))| name)
        .unwrap_or_else(|| "admin".to_string())
}

/// Build the admin-facing axum router (port 8081).
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/health", get(health))
        .route("/admin/providers", get(providers))
        .route("/admin/providers/health", get(providers_health))
        .route("/admin/providers/reload", post(providers_reload))
        .route("/admin/routing", get(routing))
        .route("/admin/routing/strategy", put(set_strategy))
        .route("/admin/routing/lock", put(set_lock))
        .route("/admin/routing/rules", put(set_rules))
        .route("/admin/pricing", get(pricing))
        .route("/admin/telemetry", get(telemetry))
        .with_state(state)
}

/// GET /admin/health — liveness plus registry size.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "providers": state.router.providers().len(),
        "byok": state.router.byok_enabled(),
    }))
}

/// GET /admin/providers — full registry view with advertised models.
pub async fn providers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut out: Vec<Value> = Vec::new();
    for provider in state.router.providers().iter() {
        out.push(json!({
            "name": provider.name(),
            "models": provider.models().await,
            "supports_streaming": provider.supports_streaming(),
            "requires_key": provider.requires_key(),
            "has_server_key": provider.has_server_key(),
        }));
    }
    Json(json!({ "providers": out }))
}

/// GET /admin/providers/health — probe every registered provider.
pub async fn providers_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut results = Vec::new();
    for provider in state.router.providers().iter() {
        match provider.health_check().await {
            Ok(()) => results.push(json!({ "provider": provider.name(), "status": "ok" })),
            Err(e) => results.push(json!({
                "provider": provider.name(),
                "status": "unreachable",
                "error": e.to_string(),
            })),
        }
    }

    let all_ok = results.iter().all(|r| r["status"] == "ok");
    let status = if all_ok { StatusCode::OK } else { StatusCode::MULTI_STATUS };
    (status, Json(json!({ "providers": results })))
}

/// POST /admin/providers/reload — rebuild the registry from the startup
/// config (picking up rotated keys / new env state) under the write lock.
/// Takes effect on subsequent requests; in-flight requests keep their
/// snapshot.
pub async fn providers_reload(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rebuilt: Vec<_> = state.config.providers.iter().map(build_provider).collect();
    let count = rebuilt.len();
    state.router.replace_providers(rebuilt);
    Json(json!({ "status": "reloaded", "providers": count }))
}

/// GET /admin/routing — effective routing settings and global rules.
pub async fn routing(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let default_strategy = state.router.default_strategy().await?;
    let locked = state.router.is_locked().await?;
    let rules = state.router.active_rules().await?;
    Ok(Json(json!({
        "default_strategy": default_strategy,
        "strategy_locked": locked,
        "rules": rules,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SetStrategyBody {
    strategy: Strategy,
}

/// PUT /admin/routing/strategy.
pub async fn set_strategy(
    State(state): State<Arc<AppState>>,
    actor: Option<Extension<AdminActor>>,
    Json(body): Json<SetStrategyBody>,
) -> Result<impl IntoResponse, AppError> {
    state
        .router
        .set_default_strategy(body.strategy, &actor_name(actor))
        .await?;
    Ok(Json(json!({ "default_strategy": body.strategy })))
}

#[derive(Debug, Deserialize)]
pub struct SetLockBody {
    locked: bool,
}

/// PUT /admin/routing/lock — while locked, user preferences and user-scoped
/// rules are ignored and the admin default applies to everyone.
pub async fn set_lock(
    State(state): State<Arc<AppState>>,
    actor: Option<Extension<AdminActor>>,
    Json(body): Json<SetLockBody>,
) -> Result<impl IntoResponse, AppError> {
    state
        .router
        .set_strategy_lock(body.locked, &actor_name(actor))
        .await?;
    Ok(Json(json!({ "strategy_locked": body.locked })))
}

#[derive(Debug, Deserialize)]
pub struct SetRulesBody {
    rules: Vec<RoutingRule>,
    /// Defaults to replacing the global rule set.
    #[serde(default)]
    scope: RuleScope,
}

/// PUT /admin/routing/rules — replace the rule set for one scope.
pub async fn set_rules(
    State(state): State<Arc<AppState>>,
    actor: Option<Extension<AdminActor>>,
    Json(body): Json<SetRulesBody>,
) -> Result<impl IntoResponse, AppError> {
    let count = body.rules.len();
    state
        .router
        .set_custom_rules(body.rules, body.scope, &actor_name(actor))
        .await?;
    Ok(Json(json!({ "status": "saved", "rules": count })))
}

/// GET /admin/pricing — the active price table.
pub async fn pricing(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rows: Vec<Value> = state
        .router
        .cost_table()
        .rows()
        .into_iter()
        .map(|(provider, model, price)| {
            json!({
                "provider": provider,
                "model": model,
                "input_cost_per_1k": price.input_cost_per_1k,
                "output_cost_per_1k": price.output_cost_per_1k,
            })
        })
        .collect();
    Json(json!({ "pricing": rows }))
}

/// GET /admin/telemetry — latency windows and ledger counters.
pub async fn telemetry(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let latency = state.router.latency_tracker();
    let per_provider: Vec<Value> = latency
        .tracked_providers()
        .into_iter()
        .map(|name| {
            let stats = latency.stats(&name);
            json!({
                "provider": name,
                "avg_ms": if stats.avg_ms.is_finite() { Some(stats.avg_ms) } else { None },
                "min_ms": stats.min_ms,
                "max_ms": stats.max_ms,
                "count": stats.count,
            })
        })
        .collect();

    let ledger = state.router.ledger();
    Json(json!({
        "latency": per_provider,
        "ledger": {
            "pending": ledger.pending(),
            "dropped": ledger.dropped_total(),
        },
    }))
}

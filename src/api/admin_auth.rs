//! Admin API access control and operator attribution.
//!
//! Every admin route is guarded by the shared bearer token resolved at
//! startup from `admin_token_env`. Beyond the yes/no decision, the
//! middleware also establishes *who* is acting: the optional
//! `X-Admin-Actor` header names the operator, and the resulting
//! [`AdminActor`] extension is what the routing handlers write into the
//! settings audit trail (`updated_by` on strategy, lock, and rule changes).
//!
//! When `admin_token_env` is unset the token check is skipped — acceptable
//! only when the admin port is firewalled to trusted hosts — but actor
//! attribution still applies.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::{AppError, GatewayError};

use super::AppState;

/// Operator identity for this admin request, recorded on settings changes.
#[derive(Clone, Debug)]
pub struct AdminActor(pub String);

/// Attribution when no `X-Admin-Actor` header is sent.
const DEFAULT_ACTOR: &str = "admin";

fn rejected(message: &str) -> Response {
    let mut response =
        AppError(GatewayError::Unauthorized(message.to_string())).into_response();
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Bearer realm=\"model-gateway-admin\""),
    );
    response
}

/// Axum middleware: validates the admin bearer token (when configured) and
/// attaches the [`AdminActor`] extension for downstream handlers.
pub async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.admin_token {
        let provided = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        match provided {
            Some(token) if token == expected.as_str() => {}
            Some(_) => return rejected("invalid admin token"),
            None => return rejected("admin API requires `Authorization: Bearer <token>`"),
        }
    }

    let actor = req
        .headers()
        .get("x-admin-actor")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string();
    req.extensions_mut().insert(AdminActor(actor));

    next.run(req).await
}

//! HTTP surface: client API (port 8080) and admin API (port 8081).
//!
//! Handlers are a thin layer — all routing logic lives in
//! [`crate::routing::router`]; this module translates HTTP concerns (status
//! codes, headers, JSON bodies, upgrades) into router calls and back.

pub mod admin;
pub mod admin_auth;
pub mod client;
pub mod health;
pub mod rate_limit;
pub mod request_id;
pub mod status;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;

use crate::config::Config;
use crate::routing::Router;
use crate::store::CredentialStore;

/// Shared application state injected into every handler via
/// [`axum::extract::State`].
pub struct AppState {
    pub router: Arc<Router>,
    pub config: Arc<Config>,
    /// Gateway start time — used to compute uptime for the status endpoint.
    pub started_at: Instant,
    /// Bearer token required for admin API access.
    ///
    /// `None` means admin auth is disabled (port should then be firewalled).
    /// Resolved at startup from `config.gateway.admin_token_env`.
    pub admin_token: Option<String>,
    /// Optional per-caller rate limiter (user identity first, peer IP for
    /// anonymous traffic). `None` means rate limiting is disabled.
    pub rate_limiter: Option<Arc<rate_limit::RateLimiter>>,
    /// BYOK key management surface; the router holds its own reference.
    pub credentials: Arc<dyn CredentialStore>,
}

impl AppState {
    pub fn new(
        router: Arc<Router>,
        config: Arc<Config>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let rate_limiter = config
            .gateway
            .rate_limit_rpm
            .filter(|&rpm| rpm > 0)
            .map(|rpm| Arc::new(rate_limit::RateLimiter::new(rpm)));
        let admin_token = config
            .gateway
            .admin_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());
        Self {
            router,
            config,
            started_at: Instant::now(),
            admin_token,
            rate_limiter,
            credentials,
        }
    }
}

/// Caller identity as established by the upstream auth layer.
///
/// Authentication itself is out of the gateway's hands; the deployment's
/// reverse proxy (or test harness) injects the verified `X-User-Id` header.
pub fn user_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
}

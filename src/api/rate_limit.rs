//! Per-caller request quotas on the client port.
//!
//! Throttling is keyed by the same identity the rest of the gateway uses:
//! the authenticated `X-User-Id` header when present — the identity BYOK
//! keys and strategy preferences hang off — so one user cannot starve
//! others by fanning requests out across connections. Anonymous traffic
//! falls back to one quota per peer IP.
//!
//! Accounting is a fixed 60-second window per caller: the first request
//! opens the window, each request consumes one slot, and the window resets
//! a minute after it opened. A full window rejects with:
//!
//! - `429 Too Many Requests` and a JSON error body in the gateway's shape
//! - `Retry-After: <seconds>` — time until the caller's window resets
//! - `X-RateLimit-Limit: <rpm>` — the configured per-window quota

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use serde_json::json;

use super::{user_from, AppState};

/// Window length for quota accounting.
const WINDOW: Duration = Duration::from_secs(60);

/// Map size above which stale windows are swept during admission.
const PRUNE_THRESHOLD: usize = 8_192;

/// One caller's accounting window.
#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    used: u32,
}

/// Fixed-window request quotas, keyed by caller identity.
pub struct RateLimiter {
    /// Requests allowed per caller per window.
    pub rpm: u32,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(rpm: u32) -> Self {
        Self { rpm, windows: DashMap::new() }
    }

    /// Account one request for `caller`.
    ///
    /// Returns `Err(seconds)` with the time until the caller's window
    /// resets when the quota is exhausted.
    pub fn admit(&self, caller: &str) -> Result<(), u64> {
        self.admit_at(caller, Instant::now())
    }

    /// Clock-injectable admission, so window rollover is testable.
    fn admit_at(&self, caller: &str, now: Instant) -> Result<(), u64> {
        if self.windows.len() > PRUNE_THRESHOLD {
            self.prune_at(now);
        }

        let mut window = self
            .windows
            .entry(caller.to_string())
            .or_insert(Window { opened: now, used: 0 });

        if now.duration_since(window.opened) >= WINDOW {
            window.opened = now;
            window.used = 0;
        }
        if window.used >= self.rpm {
            let reset = WINDOW.saturating_sub(now.duration_since(window.opened));
            return Err(reset.as_secs().max(1));
        }
        window.used += 1;
        Ok(())
    }

    /// Drop windows that expired more than a full window ago. Keeps the map
    /// bounded by the set of recently active callers.
    fn prune_at(&self, now: Instant) {
        self.windows
            .retain(|_, w| now.duration_since(w.opened) < WINDOW * 2);
    }
}

/// The quota key for one request: user identity first, peer IP otherwise.
fn caller_key(req: &Request) -> String {
    if let Some(user) = user_from(req.headers()) {
        return format!("user:{user}");
    }
    // Peer address from extensions — set by into_make_service_with_connect_info.
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    format!("ip:{ip}")
}

/// Axum middleware enforcing per-caller quotas.
///
/// No-ops (passes through) when `state.rate_limiter` is `None`.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limiter) = &state.rate_limiter else {
        return next.run(req).await;
    };

    match limiter.admit(&caller_key(&req)) {
        Ok(()) => next.run(req).await,
        Err(reset_secs) => (
            StatusCode::TOO_MANY_REQUESTS,
            [
                ("retry-after", reset_secs.to_string()),
                ("x-ratelimit-limit", limiter.rpm.to_string()),
            ],
            Json(json!({
                "error": {
                    "kind": "rate_limited",
                    "message": format!(
                        "quota of {} requests per minute exhausted; retry in {reset_secs}s",
                        limiter.rpm
                    ),
                }
            })),
        )
            .into_response(),
    }
}

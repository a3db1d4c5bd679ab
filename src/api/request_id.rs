//! Correlation IDs for gateway requests.
//!
//! Every request carries an ID that shows up in three places: the tracing
//! span wrapping the handler, the `X-Request-ID` response header, and (via
//! the [`RequestId`] extension) any handler that wants to attach it to its
//! own records. A platform fronting the gateway can supply its own ID to
//! stitch traces together end to end — but only well-formed ones are
//! honored. Over-long values or anything outside `[A-Za-z0-9._-]` is
//! discarded and replaced with a fresh UUID, so caller input is never
//! reflected into logs or response headers.

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument as _;
use uuid::Uuid;

/// Correlation ID for the current request, readable as an axum extension.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Longest caller-supplied ID accepted before falling back to a fresh UUID.
const MAX_CALLER_ID_LEN: usize = 64;

/// Validate a caller-supplied `X-Request-ID` value.
fn accept_caller_id(value: &str) -> Option<&str> {
    let value = value.trim();
    let well_formed = !value.is_empty()
        && value.len() <= MAX_CALLER_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    well_formed.then_some(value)
}

/// Axum middleware assigning a [`RequestId`] to every request.
///
/// Layer order matters: apply this middleware **inside** the
/// `tower_http::TraceLayer` so the correlation span nests in the trace span.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(accept_caller_id)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));

    let span = tracing::debug_span!(
        "request",
        id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let mut response = next.run(req).instrument(span).await;

    // The sanitizer guarantees a valid header value, but a generated UUID
    // goes through the same fallible path for uniformity.
    if let Ok(header_value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", header_value);
    }

    response
}

//! Error taxonomy for the gateway core, plus the axum response wrapper.
//!
//! Two layers:
//!
//! - [`ProviderError`] — what an adapter reports about one upstream call:
//!   a category (connect failure, HTTP status, malformed body, cancellation,
//!   content refusal) plus the upstream message. Adapters never retry; they
//!   only classify.
//! - [`GatewayError`] — what the router surfaces to callers after applying
//!   its fallback policy. [`AppError`] wraps it so handlers can return
//!   `Result<T, AppError>` and propagate with `?` — no manual `map_err`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Category of an upstream failure, as classified by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Transport-level failure: connect, DNS, TLS, broken body stream.
    Connect,
    /// Upstream answered with a non-2xx status.
    Status(u16),
    /// Upstream answered 2xx but the body did not parse as expected.
    Malformed,
    /// The caller's context was cancelled mid-call.
    Cancelled,
    /// Upstream explicitly refused to serve the content.
    Refused,
}

/// A single categorized upstream failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn connect(message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Connect, message: message.into() }
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Status(status), message: message.into() }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Malformed, message: message.into() }
    }

    pub fn cancelled() -> Self {
        Self { kind: ProviderErrorKind::Cancelled, message: "request cancelled".into() }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Refused, message: message.into() }
    }

    /// Classify a [`reqwest::Error`] from a send/body read.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::connect(err.to_string())
        } else {
            Self::malformed(err.to_string())
        }
    }

    /// Whether the router may fall back to the next ranked provider.
    ///
    /// Connect failures, 5xx, and 429 are transient; everything else
    /// (other 4xx, malformed bodies, cancellation, refusals) is not.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            ProviderErrorKind::Connect => true,
            ProviderErrorKind::Status(code) => code >= 500 || code == 429,
            ProviderErrorKind::Malformed
            | ProviderErrorKind::Cancelled
            | ProviderErrorKind::Refused => false,
        }
    }

    /// HTTP status to record in the ledger for this failure.
    pub fn ledger_status(&self) -> u16 {
        match self.kind {
            ProviderErrorKind::Status(code) => code,
            ProviderErrorKind::Cancelled => 499,
            _ => 502,
        }
    }
}

/// Router-level error taxonomy surfaced to callers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Schema-level violation (missing model, empty messages). Never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Caller identity missing or invalid at the gateway's edge.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No registered provider advertises the model, or no usable credential
    /// exists for any that do.
    #[error("no provider available: {0}")]
    NoProvider(String),

    /// Transient upstream failure — already retried across providers.
    #[error("provider `{provider}` failed: {message}")]
    ProviderTransient { provider: String, message: String },

    /// Permanent upstream failure; the provider's message is surfaced.
    #[error("provider `{provider}` rejected the request: {message}")]
    ProviderPermanent { provider: String, message: String },

    /// Caller-initiated cancellation. Not logged as an error.
    #[error("request cancelled")]
    Cancelled,

    /// Invariant breach (e.g. BYOK decryption failure with a configured key).
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Fold an adapter failure into the taxonomy, tagged with the provider name.
    pub fn from_provider(provider: &str, err: &ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::Cancelled => Self::Cancelled,
            _ if err.is_transient() => Self::ProviderTransient {
                provider: provider.to_string(),
                message: err.message.clone(),
            },
            _ => Self::ProviderPermanent {
                provider: provider.to_string(),
                message: err.message.clone(),
            },
        }
    }

    /// Short machine-readable tag used in JSON error bodies and the ledger.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::NoProvider(_) => "no_provider",
            Self::ProviderTransient { .. } => "provider_transient",
            Self::ProviderPermanent { .. } => "provider_permanent",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NoProvider(_) => StatusCode::NOT_FOUND,
            Self::ProviderTransient { .. } | Self::ProviderPermanent { .. } => {
                StatusCode::BAD_GATEWAY
            }
            // 499: client closed request (nginx convention).
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Wraps [`GatewayError`] so it can be returned from axum handlers.
#[derive(Debug)]
pub struct AppError(pub GatewayError);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self.0 {
            GatewayError::Cancelled => {}
            e => tracing::warn!(kind = e.kind(), error = %e, "handler error"),
        }
        (
            self.0.status_code(),
            Json(json!({ "error": { "kind": self.0.kind(), "message": self.0.to_string() } })),
        )
            .into_response()
    }
}

impl From<GatewayError> for AppError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        Self(GatewayError::Internal(e.to_string()))
    }
}

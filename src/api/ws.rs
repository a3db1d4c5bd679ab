//! WebSocket chat endpoint (`GET /v1/chat/ws`).
//!
//! The HTTP layer only performs the upgrade; the session protocol — initial
//! request frame, chunk frames, pings, deadlines — lives in
//! [`crate::fanout::serve_ws_session`].

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::HeaderMap,
    response::Response,
};

use crate::fanout;
use crate::ledger::RequestKind;

use super::{user_from, AppState};

/// Upgrade buffer kept deliberately small; chat frames are tiny.
const WS_BUFFER_SIZE: usize = 1024;

/// GET /v1/chat/ws — one streamed chat completion per connection.
pub async fn chat_ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let header_user = user_from(&headers);
    ws.write_buffer_size(WS_BUFFER_SIZE)
        .on_upgrade(move |socket| async move {
            let router = Arc::clone(&state.router);
            fanout::serve_ws_session(socket, move |req, cancel| {
                let user_id = header_user.or_else(|| req.user_id.clone());
                async move {
                    router
                        .route_stream(req, user_id, RequestKind::ChatWebsocket, cancel)
                        .await
                }
            })
            .await;
        })
}

//! Stream fan-out: one routed chunk stream, two surface forms.
//!
//! Both the SSE response and the WebSocket session consume a
//! [`RoutedStream`] and emit the same JSON chunk protocol; only the framing
//! differs. Keepalive, write deadlines, and disconnect handling live here so
//! the router stays transport-agnostic.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::providers::CHUNK_CHANNEL_CAPACITY;
use crate::routing::router::RoutedStream;
use crate::schema::{ChatRequest, StreamChunk};

/// Idle interval after which an SSE comment / WebSocket ping is sent.
const SSE_KEEPALIVE: Duration = Duration::from_secs(10);
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Per-frame write allowance; a stalled client fails the stream.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Base read deadline; extended whenever the client answers a ping.
const READ_DEADLINE: Duration = Duration::from_secs(60);

// ──────────────────────────────────────────────────────────────────────────────
// Server-Sent Events
// ──────────────────────────────────────────────────────────────────────────────

/// Wrap a routed stream as an SSE response.
///
/// One `data: <json>\n\n` event per chunk; the body closes after the terminal
/// chunk. Dropping the response (client disconnect) cancels `cancel`, which
/// propagates to the upstream adapter.
pub fn sse_response(stream: RoutedStream, cancel: CancellationToken) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(CHUNK_CHANNEL_CAPACITY);
    tokio::spawn(pump_sse(stream, tx, cancel));

    let sse = Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE));

    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert("cache-control", "no-cache".parse().expect("static header"));
    headers.insert("connection", "keep-alive".parse().expect("static header"));
    // Tell nginx-style intermediaries not to buffer the event stream.
    headers.insert("x-accel-buffering", "no".parse().expect("static header"));
    response
}

async fn pump_sse(
    mut stream: RoutedStream,
    tx: mpsc::Sender<Result<Event, Infallible>>,
    cancel: CancellationToken,
) {
    let mut delivered = false;
    loop {
        match stream.chunks.recv().await {
            Some(chunk) => {
                let done = chunk.done;
                let Some(event) = chunk_event(&chunk) else { continue };
                if tx.send(Ok(event)).await.is_err() {
                    // Client went away: stop the upstream, write nothing more.
                    debug!("sse client disconnected — cancelling upstream");
                    cancel.cancel();
                    return;
                }
                delivered = true;
                if done {
                    return;
                }
            }
            None => {
                // Pre-commit routing failure arrives on the error pipe. An
                // error chunk is only ever sent when nothing was delivered;
                // a partial response is closed as-is rather than corrupted.
                if let Ok(err) = stream.errors.try_recv() {
                    if !delivered {
                        let chunk =
                            StreamChunk::terminal_error(Uuid::new_v4().to_string(), err.to_string());
                        if let Some(event) = chunk_event(&chunk) {
                            let _ = tx.send(Ok(event)).await;
                        }
                    }
                }
                return;
            }
        }
    }
}

fn chunk_event(chunk: &StreamChunk) -> Option<Event> {
    match serde_json::to_string(chunk) {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize stream chunk");
            None
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// WebSocket
// ──────────────────────────────────────────────────────────────────────────────

/// The first client frame on a chat socket.
#[derive(Debug, Deserialize)]
struct InitialFrame {
    #[serde(rename = "type")]
    kind: String,
    request: Option<ChatRequest>,
}

/// Parse the initial WebSocket frame; anything but a well-formed
/// `{"type":"request","request":{…}}` is rejected.
pub(crate) fn parse_initial_frame(text: &str) -> Result<ChatRequest, String> {
    let frame: InitialFrame =
        serde_json::from_str(text).map_err(|e| format!("malformed initial frame: {e}"))?;
    if frame.kind != "request" {
        return Err(format!("expected frame type `request`, got `{}`", frame.kind));
    }
    frame.request.ok_or_else(|| "initial frame is missing `request`".into())
}

type WsSink = SplitSink<WebSocket, WsMessage>;

/// Outcome of one socket write with the write deadline applied.
async fn deadline_send(sink: &mut WsSink, message: WsMessage) -> Result<(), ()> {
    match tokio::time::timeout(WRITE_DEADLINE, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "websocket write failed");
            Err(())
        }
        Err(_) => {
            warn!("websocket write deadline exceeded");
            Err(())
        }
    }
}

fn chunk_frame(chunk: &StreamChunk) -> Option<WsMessage> {
    serde_json::to_string(chunk).ok().map(|json| WsMessage::Text(json.into()))
}

/// Drive one chat-over-WebSocket session after the upgrade.
///
/// Reads the initial request frame, opens the routed stream via `open`, then
/// enters a half-duplex send loop: chunks go out as JSON text frames, pings
/// every 30 s keep the connection alive, and the read deadline extends on
/// every pong. A client close, read timeout, or write failure cancels the
/// upstream; a caller-initiated close is never answered with an error frame.
pub async fn serve_ws_session<F, Fut>(socket: WebSocket, open: F)
where
    F: FnOnce(ChatRequest, CancellationToken) -> Fut,
    Fut: std::future::Future<Output = Result<RoutedStream, crate::error::GatewayError>>,
{
    let (mut sink, mut source) = socket.split();

    // One initial message of type "request".
    let initial = tokio::time::timeout(READ_DEADLINE, source.next()).await;
    let request = match initial {
        Ok(Some(Ok(WsMessage::Text(text)))) => match parse_initial_frame(&text) {
            Ok(req) => req,
            Err(reason) => {
                let chunk = StreamChunk::terminal_error(Uuid::new_v4().to_string(), reason);
                if let Some(frame) = chunk_frame(&chunk) {
                    let _ = deadline_send(&mut sink, frame).await;
                }
                let _ = sink.send(WsMessage::Close(None)).await;
                return;
            }
        },
        _ => {
            // Closed, errored, timed out, or a non-text opener.
            let chunk = StreamChunk::terminal_error(
                Uuid::new_v4().to_string(),
                "expected an initial text frame of type `request`",
            );
            if let Some(frame) = chunk_frame(&chunk) {
                let _ = deadline_send(&mut sink, frame).await;
            }
            let _ = sink.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let cancel = CancellationToken::new();
    let mut stream = match open(request, cancel.clone()).await {
        Ok(s) => s,
        Err(e) => {
            let chunk = StreamChunk::terminal_error(Uuid::new_v4().to_string(), e.to_string());
            if let Some(frame) = chunk_frame(&chunk) {
                let _ = deadline_send(&mut sink, frame).await;
            }
            let _ = sink.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let mut ping = tokio::time::interval(WS_PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick is immediate
    let mut read_deadline = tokio::time::Instant::now() + READ_DEADLINE;
    let mut delivered = false;

    loop {
        tokio::select! {
            chunk = stream.chunks.recv() => match chunk {
                Some(chunk) => {
                    let done = chunk.done;
                    let Some(frame) = chunk_frame(&chunk) else { continue };
                    if deadline_send(&mut sink, frame).await.is_err() {
                        cancel.cancel();
                        return;
                    }
                    delivered = true;
                    if done {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return;
                    }
                }
                None => {
                    if let Ok(err) = stream.errors.try_recv() {
                        if !delivered {
                            let chunk = StreamChunk::terminal_error(
                                Uuid::new_v4().to_string(),
                                err.to_string(),
                            );
                            if let Some(frame) = chunk_frame(&chunk) {
                                let _ = deadline_send(&mut sink, frame).await;
                            }
                        }
                    }
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Pong(_))) => {
                    read_deadline = tokio::time::Instant::now() + READ_DEADLINE;
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    // Caller-initiated close: cancel upstream, close cleanly,
                    // never an error frame.
                    cancel.cancel();
                    return;
                }
                Some(Ok(_)) => {} // half-duplex: ignore mid-stream input
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    cancel.cancel();
                    return;
                }
            },
            _ = ping.tick() => {
                if deadline_send(&mut sink, WsMessage::Ping(Bytes::new())).await.is_err() {
                    cancel.cancel();
                    return;
                }
            }
            _ = tokio::time::sleep_until(read_deadline) => {
                warn!("websocket read deadline exceeded");
                cancel.cancel();
                return;
            }
        }
    }
}

//! OpenAI-compatible chat completions adapter.
//!
//! Handles any backend that speaks the OpenAI `/v1/chat/completions`
//! protocol — including OpenRouter, LM Studio, LocalAI, and others. Requests
//! are encoded from the normalized schema (string content passes through;
//! multimodal parts become the typed content array) and responses are decoded
//! back. Streaming uses SSE with true deltas, so chunks are relayed without
//! recomputation.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::schema::{
    ChatRequest, ChatResponse, ContentPart, Message, MessageContent, ResponseChoice, Role,
    StreamChunk, Usage,
};

use super::{parse_data_url, ChatProvider, ProviderStream, StreamProducer};

/// Adapter for any OpenAI-compatible backend.
pub struct OpenAiAdapter {
    name: String,
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout (body arrives incrementally).
    stream_client: Client,
    base_url: String,
    server_key: Option<String>,
    models: Vec<String>,
    supports_streaming: bool,
}

impl OpenAiAdapter {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        // No request-level timeout for streaming — the response body arrives
        // incrementally. TCP connect timeout still applies.
        let stream_client = Client::builder().build().expect("failed to build streaming client");

        Self {
            name: cfg.name.clone(),
            client,
            stream_client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            server_key: cfg.api_key(),
            models: cfg.models.clone(),
            supports_streaming: cfg.supports_streaming,
        }
    }

    fn key<'a>(&'a self, api_key: Option<&'a str>) -> Option<&'a str> {
        api_key.or(self.server_key.as_deref())
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_streaming(&self) -> bool {
        self.supports_streaming
    }

    fn requires_key(&self) -> bool {
        true
    }

    fn has_server_key(&self) -> bool {
        self.server_key.is_some()
    }

    async fn models(&self) -> Vec<String> {
        self.models.clone()
    }

    /// Probe the backend with `GET /v1/models`.
    async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let mut builder = self.client.get(&url);
        if let Some(key) = self.key(None) {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(ProviderError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(ProviderError::status(
                response.status().as_u16(),
                format!("health check returned HTTP {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn chat(
        &self,
        req: &ChatRequest,
        api_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = wire_request(req, false);

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = self.key(api_key) {
            builder = builder.bearer_auth(key);
        }

        let call = async {
            let response = builder.send().await.map_err(ProviderError::from_reqwest)?;
            let status = response.status();
            let text = response.text().await.map_err(ProviderError::from_reqwest)?;
            if !status.is_success() {
                return Err(ProviderError::status(status.as_u16(), text));
            }
            let value: Value = serde_json::from_str(&text)
                .map_err(|e| ProviderError::malformed(format!("response is not JSON: {e}")))?;
            parse_buffered_response(value, &self.name)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ProviderError::cancelled()),
            result = call => result,
        }
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        api_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ProviderStream, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = wire_request(req, true);

        let mut builder = self.stream_client.post(&url).json(&body);
        if let Some(key) = self.key(api_key) {
            builder = builder.bearer_auth(key);
        }

        let open = async {
            let response = builder.send().await.map_err(ProviderError::from_reqwest)?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(ProviderError::status(status.as_u16(), text));
            }
            Ok(response)
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::cancelled()),
            result = open => result?,
        };

        let (producer, stream) = ProviderStream::pipe();
        tokio::spawn(relay_sse_stream(response, producer, cancel.clone()));
        Ok(stream)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Wire translation — shared with the vLLM adapter
// ──────────────────────────────────────────────────────────────────────────────

/// Encode a normalized request into the OpenAI chat-completions wire shape.
pub(crate) fn wire_request(req: &ChatRequest, stream: bool) -> Value {
    let messages: Vec<Value> = req.messages.iter().map(wire_message).collect();

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "stream": stream,
    });
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(m) = req.max_tokens {
        body["max_tokens"] = json!(m);
    }
    if let Some(tools) = &req.tools {
        body["tools"] = tools.clone();
    }
    if stream {
        // Ask for usage on the final data chunk.
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

fn wire_message(msg: &Message) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    match &msg.content {
        MessageContent::Text(text) => json!({ "role": role, "content": text }),
        MessageContent::Parts(parts) => {
            let mut wire_parts: Vec<Value> = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        wire_parts.push(json!({ "type": "text", "text": text }));
                    }
                    ContentPart::Image { url } => {
                        wire_parts.push(json!({
                            "type": "image_url",
                            "image_url": { "url": url },
                        }));
                    }
                    ContentPart::Audio { url } => match parse_data_url(url) {
                        Some((mime, data)) => {
                            let format = mime.rsplit('/').next().unwrap_or("wav");
                            wire_parts.push(json!({
                                "type": "input_audio",
                                "input_audio": { "data": data, "format": format },
                            }));
                        }
                        // Remote audio URLs cannot be inlined — degrade.
                        None => append_placeholder(&mut wire_parts, &format!("[audio: {url}]")),
                    },
                }
            }
            json!({ "role": role, "content": wire_parts })
        }
    }
}

/// Append a placeholder to the preceding text part, or start a new one,
/// keeping part order intact.
fn append_placeholder(parts: &mut Vec<Value>, placeholder: &str) {
    if let Some(last) = parts.last_mut() {
        if last["type"] == "text" {
            let existing = last["text"].as_str().unwrap_or_default();
            last["text"] = json!(format!("{existing} {placeholder}"));
            return;
        }
    }
    parts.push(json!({ "type": "text", "text": placeholder }));
}

/// Decode an OpenAI-shaped buffered response into the normalized schema.
pub(crate) fn parse_buffered_response(
    value: Value,
    provider: &str,
) -> Result<ChatResponse, ProviderError> {
    let content = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::malformed("missing `choices[0].message.content`"))?
        .to_string();

    let usage = parse_usage(&value["usage"]);

    Ok(ChatResponse {
        id: value["id"].as_str().map(String::from).unwrap_or_else(new_id),
        model: value["model"].as_str().unwrap_or_default().to_string(),
        provider: provider.to_string(),
        choices: vec![ResponseChoice { message: Message::text(Role::Assistant, content) }],
        usage,
        cost: 0.0,
        latency_ms: 0,
    })
}

pub(crate) fn parse_usage(value: &Value) -> Usage {
    let prompt = value["prompt_tokens"].as_u64().unwrap_or(0) as u32;
    let completion = value["completion_tokens"].as_u64().unwrap_or(0) as u32;
    Usage::new(prompt, completion)
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Relay an OpenAI-format SSE body into the chunk pipe.
///
/// Deltas pass through as-is; usage is captured from the final data chunk
/// (requested via `stream_options.include_usage`) and attached to the
/// terminal chunk emitted on `[DONE]`.
pub(crate) async fn relay_sse_stream(
    response: reqwest::Response,
    producer: StreamProducer,
    cancel: CancellationToken,
) {
    let mut events = Box::pin(response.bytes_stream().eventsource());
    let mut id = new_id();
    let mut saw_id = false;
    let mut usage: Option<Usage> = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                let data = event.data.trim();
                if data == "[DONE]" {
                    let _ = producer.send(StreamChunk::terminal(&id, usage)).await;
                    return;
                }
                let value: Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(e) => {
                        producer
                            .fail(ProviderError::malformed(format!("bad SSE data: {e}")))
                            .await;
                        return;
                    }
                };
                if !saw_id {
                    if let Some(upstream_id) = value["id"].as_str().filter(|s| !s.is_empty()) {
                        id = upstream_id.to_string();
                        saw_id = true;
                    }
                }
                if value.get("usage").map(|u| !u.is_null()).unwrap_or(false) {
                    let parsed = parse_usage(&value["usage"]);
                    if parsed.is_known() {
                        usage = Some(parsed);
                    }
                }
                // Chat streams carry deltas under `delta.content`; legacy
                // completions streams (vLLM fallback) under `text`.
                if let Some(delta) = value
                    .pointer("/choices/0/delta/content")
                    .or_else(|| value.pointer("/choices/0/text"))
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                {
                    if !producer.send(StreamChunk::delta(&id, delta)).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                producer.fail(ProviderError::connect(format!("stream error: {e}"))).await;
                return;
            }
            // Body ended without [DONE] — treat as terminal.
            None => {
                let _ = producer.send(StreamChunk::terminal(&id, usage)).await;
                return;
            }
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

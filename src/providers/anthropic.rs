//! Anthropic Messages API adapter.
//!
//! Translates between the normalized schema and Anthropic's
//! [`/v1/messages`](https://docs.anthropic.com/en/api/messages) API.
//!
//! # Protocol differences handled here
//!
//! | Concern | Normalized | Anthropic |
//! |---|---|---|
//! | System prompt | Messages with `role: "system"` | Top-level `system` field |
//! | Max tokens | Optional | **Required** (`max_tokens`) |
//! | Images | `ContentPart::Image` url/data-URL | `source: {type: "base64"\|"url"}` blocks |
//! | Response shape | `choices[].message.content` | `content[].text` |
//! | Auth header | — | `x-api-key: …` |
//! | Stream | uniform chunk protocol | typed SSE events (`content_block_delta`, …) |

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

/// Default max_tokens when the caller omits it. Required by Anthropic; sensible
/// ceiling for most conversational use-cases.
const DEFAULT_MAX_TOKENS: u64 = 8_192;

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for the Anthropic Messages API.
pub struct AnthropicAdapter {
    name: String,
    client: Client,
    stream_client: Client,
    base_url: String,
    server_key: Option<String>,
    models: Vec<String>,
    supports_streaming: bool,
}

impl AnthropicAdapter {
    pub fn from_config(cfg: &ProviderConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .expect("failed to build reqwest client");
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

    fn request_builder(
        &self,
        client: &Client,
        api_key: Option<&str>,
    ) -> Result<reqwest::RequestBuilder, ProviderError> {
        let key = api_key
            .or(self.server_key.as_deref())
            .ok_or_else(|| ProviderError::status(401, "no API key available for Anthropic"))?;
        let url = format!("{}/v1/messages", self.base_url);
        Ok(client
            .post(&url)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION))
    }
}

#[async_trait::async_trait]
impl ChatProvider for AnthropicAdapter {
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

    /// Probe Anthropic with a minimal 1-token request.
    ///
    /// Anthropic has no `/v1/models` endpoint, so a cheap model inference
    /// call is the only reliable way to verify auth + connectivity.
    async fn health_check(&self) -> Result<(), ProviderError> {
        let model = self
            .models
            .first()
            .cloned()
            .unwrap_or_else(|| "claude-haiku-4-5-20251001".into());
        let probe = json!({
            "model": model,
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        });
        let response = self
            .request_builder(&self.client, None)?
            .json(&probe)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
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
        let body = to_anthropic(req, false);
        let builder = self.request_builder(&self.client, api_key)?.json(&body);

        let call = async {
            let response = builder.send().await.map_err(ProviderError::from_reqwest)?;
            let status = response.status();
            let text = response.text().await.map_err(ProviderError::from_reqwest)?;
            if !status.is_success() {
                return Err(ProviderError::status(status.as_u16(), text));
            }
            let value: Value = serde_json::from_str(&text)
                .map_err(|e| ProviderError::malformed(format!("response is not JSON: {e}")))?;
            from_anthropic(value, &self.name)
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
        let body = to_anthropic(req, true);
        let builder = self.request_builder(&self.stream_client, api_key)?.json(&body);

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
        tokio::spawn(relay_anthropic_stream(response, producer, cancel.clone()));
        Ok(stream)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Schema translation — pub(crate) for unit testing
// ──────────────────────────────────────────────────────────────────────────────

/// Convert a normalized request to the Anthropic Messages format.
pub(crate) fn to_anthropic(req: &ChatRequest, stream: bool) -> Value {
    // Anthropic treats system content as a top-level field, not a message
    // role. Multiple system messages are concatenated; part ordering within
    // the remaining messages is preserved.
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for msg in &req.messages {
        if msg.role == Role::System {
            system_parts.push(msg.content.flatten_text());
            continue;
        }
        let role = match msg.role {
            Role::Assistant => "assistant",
            // Anthropic has no tool role in the basic Messages shape;
            // tool results travel as user turns.
            _ => "user",
        };
        messages.push(json!({ "role": role, "content": anthropic_content(&msg.content) }));
    }

    let mut body = json!({
        "model": req.model,
        "max_tokens": req.max_tokens.map(u64::from).unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n\n"));
    }
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

fn anthropic_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Parts(parts) => {
            let mut blocks: Vec<Value> = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        blocks.push(json!({ "type": "text", "text": text }));
                    }
                    ContentPart::Image { url } => match parse_data_url(url) {
                        Some((mime, data)) => blocks.push(json!({
                            "type": "image",
                            "source": { "type": "base64", "media_type": mime, "data": data },
                        })),
                        None => blocks.push(json!({
                            "type": "image",
                            "source": { "type": "url", "url": url },
                        })),
                    },
                    // No audio input support — degrade in place.
                    ContentPart::Audio { url } => {
                        append_text_block(&mut blocks, &format!("[audio: {url}]"));
                    }
                }
            }
            json!(blocks)
        }
    }
}

fn append_text_block(blocks: &mut Vec<Value>, placeholder: &str) {
    if let Some(last) = blocks.last_mut() {
        if last["type"] == "text" {
            let existing = last["text"].as_str().unwrap_or_default();
            last["text"] = json!(format!("{existing} {placeholder}"));
            return;
        }
    }
    blocks.push(json!({ "type": "text", "text": placeholder }));
}

/// Convert an Anthropic Messages response to the normalized schema.
pub(crate) fn from_anthropic(resp: Value, provider: &str) -> Result<ChatResponse, ProviderError> {
    // Responses contain a `content` array of typed blocks; concatenate the
    // text blocks in order.
    let blocks = resp["content"]
        .as_array()
        .ok_or_else(|| ProviderError::malformed("missing `content` array"))?;
    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() && !blocks.is_empty() {
        return Err(ProviderError::malformed("no text block in response `content`"));
    }

    let usage = Usage::new(
        resp["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        resp["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
    );

    Ok(ChatResponse {
        id: resp["id"].as_str().map(String::from).unwrap_or_else(|| Uuid::new_v4().to_string()),
        model: resp["model"].as_str().unwrap_or_default().to_string(),
        provider: provider.to_string(),
        choices: vec![ResponseChoice { message: Message::text(Role::Assistant, text) }],
        usage,
        cost: 0.0,
        latency_ms: 0,
    })
}

/// Relay Anthropic's typed SSE events into the chunk pipe.
///
/// `message_start` carries the id and input-token count, `content_block_delta`
/// carries text deltas, `message_delta` carries the output-token count, and
/// `message_stop` terminates the stream.
async fn relay_anthropic_stream(
    response: reqwest::Response,
    producer: StreamProducer,
    cancel: CancellationToken,
) {
    let mut events = Box::pin(response.bytes_stream().eventsource());
    let mut id = Uuid::new_v4().to_string();
    let mut input_tokens: u32 = 0;
    let mut output_tokens: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                let value: Value = match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(_) => continue, // pings and comments are not JSON
                };
                match event.event.as_str() {
                    "message_start" => {
                        if let Some(upstream_id) = value["message"]["id"].as_str() {
                            id = upstream_id.to_string();
                        }
                        input_tokens =
                            value["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
                    }
                    "content_block_delta" => {
                        if let Some(text) = value["delta"]["text"].as_str() {
                            if !text.is_empty()
                                && !producer.send(StreamChunk::delta(&id, text)).await
                            {
                                return;
                            }
                        }
                    }
                    "message_delta" => {
                        if let Some(out) = value["usage"]["output_tokens"].as_u64() {
                            output_tokens = out as u32;
                        }
                    }
                    "message_stop" => {
                        let usage = (input_tokens + output_tokens > 0)
                            .then(|| Usage::new(input_tokens, output_tokens));
                        let _ = producer.send(StreamChunk::terminal(&id, usage)).await;
                        return;
                    }
                    "error" => {
                        let message = value["error"]["message"]
                            .as_str()
                            .unwrap_or("upstream stream error")
                            .to_string();
                        producer.fail(ProviderError::status(529, message)).await;
                        return;
                    }
                    _ => {} // ping and future event types
                }
            }
            Some(Err(e)) => {
                producer.fail(ProviderError::connect(format!("stream error: {e}"))).await;
                return;
            }
            None => {
                // Body ended without message_stop — still terminate cleanly.
                let usage = (input_tokens + output_tokens > 0)
                    .then(|| Usage::new(input_tokens, output_tokens));
                let _ = producer.send(StreamChunk::terminal(&id, usage)).await;
                return;
            }
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "claude-haiku-4-5-20251001".into(),
            messages,
            temperature: None,
            max_tokens: None,
            stream: None,
            tools: None,
            user_id: None,
            conversation_id: None,
        }
    }

    fn adapter_for(server: &MockServer, key_env: Option<&str>) -> AnthropicAdapter {
        AnthropicAdapter::from_config(&ProviderConfig {
            name: "anthropic".into(),
            kind: ProviderKind::Anthropic,
            base_url: server.uri(),
            api_key_env: key_env.map(String::from),
            timeout_ms: 5_000,
            models: vec!["claude-haiku-4-5-20251001".into()],
            supports_streaming: true,
        })
    }

    // ── to_anthropic ──────────────────────────────────────────────────────────

    #[test]
    fn system_messages_move_to_top_level_field() {
        let req = request(vec![
            Message::text(Role::System, "You are a helpful assistant."),
            Message::text(Role::User, "Hello"),
        ]);
        let out = to_anthropic(&req, false);

        assert_eq!(out["system"], "You are a helpful assistant.");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1, "system message should leave the messages array");
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn multiple_system_messages_are_concatenated() {
        let req = request(vec![
            Message::text(Role::System, "Part one."),
            Message::text(Role::System, "Part two."),
            Message::text(Role::User, "Hello"),
        ]);
        let out = to_anthropic(&req, false);
        assert_eq!(out["system"], "Part one.\n\nPart two.");
    }

    #[test]
    fn max_tokens_defaults_when_absent() {
        let req = request(vec![Message::text(Role::User, "Hi")]);
        let out = to_anthropic(&req, false);
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);

        let mut req = request(vec![Message::text(Role::User, "Hi")]);
        req.max_tokens = Some(256);
        assert_eq!(to_anthropic(&req, false)["max_tokens"], 256);
    }

    #[test]
    fn data_url_image_becomes_base64_source_block() {
        let req = request(vec![Message {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "what is this?".into() },
                ContentPart::Image { url: "data:image/png;base64,aGk=".into() },
            ]),
        }]);
        let out = to_anthropic(&req, false);
        let blocks = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "image");
        assert_eq!(blocks[1]["source"]["type"], "base64");
        assert_eq!(blocks[1]["source"]["media_type"], "image/png");
        assert_eq!(blocks[1]["source"]["data"], "aGk=");
    }

    #[test]
    fn remote_image_becomes_url_source_block() {
        let req = request(vec![Message {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::Image {
                url: "https://example.com/cat.png".into(),
            }]),
        }]);
        let out = to_anthropic(&req, false);
        let blocks = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["source"]["type"], "url");
        assert_eq!(blocks[0]["source"]["url"], "https://example.com/cat.png");
    }

    #[test]
    fn audio_degrades_into_adjacent_text_block() {
        let req = request(vec![Message {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "transcribe".into() },
                ContentPart::Audio { url: "https://example.com/a.mp3".into() },
            ]),
        }]);
        let out = to_anthropic(&req, false);
        let blocks = out["messages"][0]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0]["text"].as_str().unwrap().contains("[audio:"));
    }

    // ── from_anthropic ────────────────────────────────────────────────────────

    #[test]
    fn response_text_and_usage_are_extracted() {
        let resp = json!({
            "id": "msg_123",
            "model": "claude-haiku-4-5-20251001",
            "content": [{ "type": "text", "text": "Hello!" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        let out = from_anthropic(resp, "anthropic").unwrap();
        assert_eq!(out.id, "msg_123");
        assert_eq!(out.content(), Some("Hello!"));
        assert_eq!(out.usage, Usage::new(10, 5));
        assert_eq!(out.provider, "anthropic");
    }

    #[test]
    fn tool_only_content_is_malformed() {
        let resp = json!({
            "id": "msg_789",
            "content": [{ "type": "tool_use", "id": "toolu_1", "name": "calc", "input": {} }],
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        assert!(from_anthropic(resp, "anthropic").is_err());
    }

    // ── live adapter ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn chat_sends_api_key_header() {
        let var = "MGW_ANTHROPIC_TEST_KEY_1";
        // SAFETY: single-threaded test setup; env mutation is acceptable here.
        unsafe { std::env::set_var(var, "sk-ant-server") };

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-server"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "model": "claude-haiku-4-5-20251001",
                "content": [{ "type": "text", "text": "pong" }],
                "usage": { "input_tokens": 1, "output_tokens": 1 },
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, Some(var));
        let resp = adapter
            .chat(
                &request(vec![Message::text(Role::User, "ping")]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.content(), Some("pong"));
        unsafe { std::env::remove_var(var) };
    }

    #[tokio::test]
    async fn byok_key_overrides_server_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "content": [{ "type": "text", "text": "ok" }],
                "usage": { "input_tokens": 1, "output_tokens": 1 },
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, None);
        let resp = adapter
            .chat(
                &request(vec![Message::text(Role::User, "hi")]),
                Some("sk-ant-user"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(resp.content(), Some("ok"));
    }

    #[tokio::test]
    async fn missing_key_fails_without_hitting_the_wire() {
        let server = MockServer::start().await;
        let adapter = adapter_for(&server, None);
        let err = adapter
            .chat(
                &request(vec![Message::text(Role::User, "hi")]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.ledger_status(), 401);
    }

    #[tokio::test]
    async fn stream_translates_typed_events_to_chunks() {
        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_s1\",\"usage\":{\"input_tokens\":7}}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, None);
        let mut stream = adapter
            .chat_stream(
                &request(vec![Message::text(Role::User, "hi")]),
                Some("sk-ant-user"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.chunks.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content, "Hel");
        assert_eq!(chunks[1].content, "lo");
        assert!(chunks[2].done);
        assert_eq!(chunks[2].usage, Some(Usage::new(7, 2)));
        assert_eq!(chunks[0].id, "msg_s1");
    }
}

//! Google Gemini adapter.
//!
//! Speaks the `generateContent` / `streamGenerateContent` API under
//! `/v1beta/models/{model}`. Roles map onto Gemini's two-party scheme
//! (`user` / `model`) with system messages lifted into `systemInstruction`;
//! media travels as `inline_data` (base64 data-URLs) or `file_data` (plain
//! URLs). Streaming uses `?alt=sse`, where each event is a self-contained
//! response carrying an incremental text delta.

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

/// Adapter for the Google Gemini API.
pub struct GoogleAdapter {
    name: String,
    client: Client,
    stream_client: Client,
    base_url: String,
    server_key: Option<String>,
    models: Vec<String>,
    supports_streaming: bool,
}

impl GoogleAdapter {
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

    fn resolve_key<'a>(&'a self, api_key: Option<&'a str>) -> Result<&'a str, ProviderError> {
        api_key
            .or(self.server_key.as_deref())
            .ok_or_else(|| ProviderError::status(401, "no API key available for Google"))
    }
}

#[async_trait::async_trait]
impl ChatProvider for GoogleAdapter {
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

    /// Probe with the model-listing endpoint.
    async fn health_check(&self) -> Result<(), ProviderError> {
        let key = self.resolve_key(None)?;
        let url = format!("{}/v1beta/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("x-goog-api-key", key)
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
        let key = self.resolve_key(api_key)?;
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, req.model);
        let body = to_gemini(req);
        let builder = self.client.post(&url).header("x-goog-api-key", key).json(&body);

        let call = async {
            let response = builder.send().await.map_err(ProviderError::from_reqwest)?;
            let status = response.status();
            let text = response.text().await.map_err(ProviderError::from_reqwest)?;
            if !status.is_success() {
                return Err(ProviderError::status(status.as_u16(), text));
            }
            let value: Value = serde_json::from_str(&text)
                .map_err(|e| ProviderError::malformed(format!("response is not JSON: {e}")))?;
            from_gemini(value, &self.name, &req.model)
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
        let key = self.resolve_key(api_key)?;
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, req.model
        );
        let body = to_gemini(req);
        let builder = self.stream_client.post(&url).header("x-goog-api-key", key).json(&body);

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
        tokio::spawn(relay_gemini_stream(response, producer, cancel.clone()));
        Ok(stream)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Schema translation
// ──────────────────────────────────────────────────────────────────────────────

/// Convert a normalized request to the Gemini `generateContent` shape.
pub(crate) fn to_gemini(req: &ChatRequest) -> Value {
    let mut system_parts: Vec<String> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();

    for msg in &req.messages {
        if msg.role == Role::System {
            system_parts.push(msg.content.flatten_text());
            continue;
        }
        let role = match msg.role {
            Role::Assistant => "model",
            _ => "user",
        };
        contents.push(json!({ "role": role, "parts": gemini_parts(&msg.content) }));
    }

    let mut body = json!({ "contents": contents });
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system_parts.join("\n\n") }] });
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = req.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(m) = req.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(m));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

fn gemini_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => vec![json!({ "text": text })],
        MessageContent::Parts(parts) => {
            let mut out: Vec<Value> = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    ContentPart::Text { text } => out.push(json!({ "text": text })),
                    ContentPart::Image { url } | ContentPart::Audio { url } => {
                        match parse_data_url(url) {
                            Some((mime, data)) => out.push(json!({
                                "inline_data": { "mime_type": mime, "data": data },
                            })),
                            None => out.push(json!({
                                "file_data": { "file_uri": url },
                            })),
                        }
                    }
                }
            }
            out
        }
    }
}

/// Convert a Gemini response to the normalized schema.
pub(crate) fn from_gemini(
    resp: Value,
    provider: &str,
    model: &str,
) -> Result<ChatResponse, ProviderError> {
    // A blocked prompt has no candidates but carries a block reason.
    if let Some(reason) = resp["promptFeedback"]["blockReason"].as_str() {
        return Err(ProviderError::refused(format!("prompt blocked: {reason}")));
    }

    let text = resp
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .ok_or_else(|| ProviderError::malformed("missing `candidates[0].content.parts`"))?;

    Ok(ChatResponse {
        id: Uuid::new_v4().to_string(),
        model: resp["modelVersion"].as_str().unwrap_or(model).to_string(),
        provider: provider.to_string(),
        choices: vec![ResponseChoice { message: Message::text(Role::Assistant, text) }],
        usage: parse_usage_metadata(&resp["usageMetadata"]),
        cost: 0.0,
        latency_ms: 0,
    })
}

fn parse_usage_metadata(value: &Value) -> Usage {
    Usage::new(
        value["promptTokenCount"].as_u64().unwrap_or(0) as u32,
        value["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
    )
}

/// Relay a `streamGenerateContent?alt=sse` body into the chunk pipe.
///
/// Each event is a complete response object whose parts hold the next text
/// delta. The final event carries `finishReason` and `usageMetadata`; the
/// stream then simply ends.
async fn relay_gemini_stream(
    response: reqwest::Response,
    producer: StreamProducer,
    cancel: CancellationToken,
) {
    let mut events = Box::pin(response.bytes_stream().eventsource());
    let id = Uuid::new_v4().to_string();
    let mut usage: Option<Usage> = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.next() => event,
        };
        match event {
            Some(Ok(event)) => {
                let value: Value = match serde_json::from_str(&event.data) {
                    Ok(v) => v,
                    Err(e) => {
                        producer
                            .fail(ProviderError::malformed(format!("bad SSE data: {e}")))
                            .await;
                        return;
                    }
                };
                if let Some(reason) = value["promptFeedback"]["blockReason"].as_str() {
                    producer
                        .fail(ProviderError::refused(format!("prompt blocked: {reason}")))
                        .await;
                    return;
                }
                if value.get("usageMetadata").map(|u| !u.is_null()).unwrap_or(false) {
                    let parsed = parse_usage_metadata(&value["usageMetadata"]);
                    if parsed.is_known() {
                        usage = Some(parsed);
                    }
                }
                if let Some(parts) =
                    value.pointer("/candidates/0/content/parts").and_then(Value::as_array)
                {
                    let delta: String =
                        parts.iter().filter_map(|p| p["text"].as_str()).collect();
                    if !delta.is_empty() && !producer.send(StreamChunk::delta(&id, delta)).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                producer.fail(ProviderError::connect(format!("stream error: {e}"))).await;
                return;
            }
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

//! Ollama adapter.
//!
//! Talks to Ollama's native `/api/chat` endpoint, which streams JSON lines
//! rather than SSE. Streamed `message.content` values are cumulative — the
//! adapter computes `delta = new − previous` and emits only the suffix,
//! falling back to the whole string when the prefix relation breaks.
//!
//! Local deployments are keyless; a configured key (for Ollama behind an
//! authenticating proxy) is attached as a Bearer token. The model list is
//! live: `/api/tags` is polled opportunistically with a short cache, with the
//! configured list as the offline fallback.

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::schema::{
    ChatRequest, ChatResponse, ContentPart, Message, MessageContent, ResponseChoice, Role,
    StreamChunk, Usage,
};

use super::{parse_data_url, ChatProvider, ProviderStream, StreamProducer};

/// How long a fetched model list stays fresh.
const MODELS_TTL: Duration = Duration::from_secs(60);

struct ModelCache {
    fetched_at: Option<Instant>,
    models: Vec<String>,
}

/// Adapter for a locally-running Ollama instance.
pub struct OllamaAdapter {
    name: String,
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout.
    stream_client: Client,
    base_url: String,
    server_key: Option<String>,
    supports_streaming: bool,
    cache: RwLock<ModelCache>,
}

impl OllamaAdapter {
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
            supports_streaming: cfg.supports_streaming,
            cache: RwLock::new(ModelCache { fetched_at: None, models: cfg.models.clone() }),
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.server_key.as_deref() {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Fetch the live model list from `/api/tags`.
    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(ProviderError::status(
                response.status().as_u16(),
                format!("model listing returned HTTP {}", response.status()),
            ));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(format!("bad /api/tags body: {e}")))?;
        let models = value["models"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["name"].as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

#[async_trait::async_trait]
impl ChatProvider for OllamaAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_streaming(&self) -> bool {
        self.supports_streaming
    }

    fn requires_key(&self) -> bool {
        false
    }

    fn has_server_key(&self) -> bool {
        self.server_key.is_some()
    }

    /// Cached live model list; falls back to the configured list while the
    /// backend is unreachable.
    async fn models(&self) -> Vec<String> {
        {
            let cache = self.cache.read().await;
            if let Some(at) = cache.fetched_at {
                if at.elapsed() < MODELS_TTL {
                    return cache.models.clone();
                }
            }
        }
        match self.fetch_models().await {
            Ok(models) if !models.is_empty() => {
                let mut cache = self.cache.write().await;
                cache.models = models.clone();
                cache.fetched_at = Some(Instant::now());
                models
            }
            _ => self.cache.read().await.models.clone(),
        }
    }

    /// Probe Ollama's root endpoint (`GET /`) — returns `"Ollama is running"`
    /// on success.
    async fn health_check(&self) -> Result<(), ProviderError> {
        let url = format!("{}/", self.base_url);
        let response = self
            .authorize(self.client.get(&url))
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
        let url = format!("{}/api/chat", self.base_url);
        let body = to_ollama(req, false);
        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = api_key.or(self.server_key.as_deref()) {
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
            from_ollama(value, &self.name)
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
        let url = format!("{}/api/chat", self.base_url);
        let body = to_ollama(req, true);
        let mut builder = self.stream_client.post(&url).json(&body);
        if let Some(key) = api_key.or(self.server_key.as_deref()) {
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
        tokio::spawn(relay_ollama_stream(response, producer, cancel.clone()));
        Ok(stream)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Schema translation
// ──────────────────────────────────────────────────────────────────────────────

/// Convert a normalized request to Ollama's `/api/chat` shape.
pub(crate) fn to_ollama(req: &ChatRequest, stream: bool) -> Value {
    let messages: Vec<Value> = req.messages.iter().map(ollama_message).collect();

    let mut body = json!({
        "model": req.model,
        "messages": messages,
        "stream": stream,
    });

    let mut options = serde_json::Map::new();
    if let Some(t) = req.temperature {
        options.insert("temperature".into(), json!(t));
    }
    if let Some(m) = req.max_tokens {
        // Ollama calls the completion cap num_predict.
        options.insert("num_predict".into(), json!(m));
    }
    if !options.is_empty() {
        body["options"] = Value::Object(options);
    }
    body
}

fn ollama_message(msg: &Message) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    match &msg.content {
        MessageContent::Text(text) => json!({ "role": role, "content": text }),
        MessageContent::Parts(parts) => {
            // Ollama takes one content string plus a parallel base64 image
            // array per message. Remote media URLs cannot be fetched on the
            // model host — degrade them into the text.
            let mut text = String::new();
            let mut images: Vec<String> = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text: t } => {
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(t);
                    }
                    ContentPart::Image { url } => match parse_data_url(url) {
                        Some((_, data)) => images.push(data.to_string()),
                        None => {
                            if !text.is_empty() {
                                text.push(' ');
                            }
                            text.push_str(&format!("[image: {url}]"));
                        }
                    },
                    ContentPart::Audio { url } => {
                        if !text.is_empty() {
                            text.push(' ');
                        }
                        text.push_str(&format!("[audio: {url}]"));
                    }
                }
            }
            let mut message = json!({ "role": role, "content": text });
            if !images.is_empty() {
                message["images"] = json!(images);
            }
            message
        }
    }
}

/// Convert an Ollama buffered response to the normalized schema.
pub(crate) fn from_ollama(resp: Value, provider: &str) -> Result<ChatResponse, ProviderError> {
    let content = resp
        .pointer("/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::malformed("missing `message.content`"))?
        .to_string();

    Ok(ChatResponse {
        id: Uuid::new_v4().to_string(),
        model: resp["model"].as_str().unwrap_or_default().to_string(),
        provider: provider.to_string(),
        choices: vec![ResponseChoice { message: Message::text(Role::Assistant, content) }],
        usage: eval_counts(&resp),
        cost: 0.0,
        latency_ms: 0,
    })
}

fn eval_counts(value: &Value) -> Usage {
    Usage::new(
        value["prompt_eval_count"].as_u64().unwrap_or(0) as u32,
        value["eval_count"].as_u64().unwrap_or(0) as u32,
    )
}

/// Relay Ollama's JSON-lines body into the chunk pipe, converting cumulative
/// content into suffix deltas.
async fn relay_ollama_stream(
    response: reqwest::Response,
    producer: StreamProducer,
    cancel: CancellationToken,
) {
    let mut body = Box::pin(response.bytes_stream());
    let id = Uuid::new_v4().to_string();
    let mut buffer = String::new();
    let mut seen = String::new();

    loop {
        let piece: Option<Result<Bytes, reqwest::Error>> = tokio::select! {
            _ = cancel.cancelled() => return,
            piece = body.next() => piece,
        };
        match piece {
            Some(Ok(bytes)) => {
                match std::str::from_utf8(&bytes) {
                    Ok(s) => buffer.push_str(s),
                    Err(e) => {
                        producer
                            .fail(ProviderError::malformed(format!("non-UTF-8 stream: {e}")))
                            .await;
                        return;
                    }
                }
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let value: Value = match serde_json::from_str(line) {
                        Ok(v) => v,
                        Err(e) => {
                            producer
                                .fail(ProviderError::malformed(format!("bad JSON line: {e}")))
                                .await;
                            return;
                        }
                    };
                    if let Some(err) = value["error"].as_str() {
                        producer.fail(ProviderError::status(500, err.to_string())).await;
                        return;
                    }
                    let content = value.pointer("/message/content").and_then(Value::as_str);
                    if let Some(content) = content {
                        // Cumulative stream: emit only the new suffix. If the
                        // prefix relation breaks, fall back to the whole string.
                        let delta = content.strip_prefix(seen.as_str()).unwrap_or(content);
                        if !delta.is_empty()
                            && !producer.send(StreamChunk::delta(&id, delta)).await
                        {
                            return;
                        }
                        seen = content.to_string();
                    }
                    if value["done"].as_bool() == Some(true) {
                        let usage = eval_counts(&value);
                        let usage = usage.is_known().then_some(usage);
                        let _ = producer.send(StreamChunk::terminal(&id, usage)).await;
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                producer.fail(ProviderError::connect(format!("stream error: {e}"))).await;
                return;
            }
            // Body ended without a done line.
            None => {
                let _ = producer.send(StreamChunk::terminal(&id, None)).await;
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "llama3.2".into(),
            messages,
            temperature: None,
            max_tokens: Some(128),
            stream: None,
            tools: None,
            user_id: None,
            conversation_id: None,
        }
    }

    fn adapter_for(server: &MockServer, fallback_models: Vec<String>) -> OllamaAdapter {
        OllamaAdapter::from_config(&ProviderConfig {
            name: "ollama".into(),
            kind: ProviderKind::Ollama,
            base_url: server.uri(),
            api_key_env: None,
            timeout_ms: 5_000,
            models: fallback_models,
            supports_streaming: true,
        })
    }

    // ── translation ───────────────────────────────────────────────────────────

    #[test]
    fn max_tokens_maps_to_num_predict() {
        let out = to_ollama(&request(vec![Message::text(Role::User, "hi")]), false);
        assert_eq!(out["options"]["num_predict"], 128);
        assert_eq!(out["stream"], false);
    }

    #[test]
    fn data_url_images_go_into_the_images_array() {
        let req = request(vec![Message {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "describe".into() },
                ContentPart::Image { url: "data:image/jpeg;base64,/9j4=".into() },
            ]),
        }]);
        let out = to_ollama(&req, false);
        let msg = &out["messages"][0];
        assert_eq!(msg["content"], "describe");
        assert_eq!(msg["images"][0], "/9j4=");
    }

    #[test]
    fn remote_media_degrades_into_content_text() {
        let req = request(vec![Message {
            role: Role::User,
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: "listen".into() },
                ContentPart::Audio { url: "https://example.com/a.mp3".into() },
            ]),
        }]);
        let out = to_ollama(&req, false);
        let content = out["messages"][0]["content"].as_str().unwrap();
        assert!(content.starts_with("listen"));
        assert!(content.contains("[audio: https://example.com/a.mp3]"));
        assert!(out["messages"][0].get("images").is_none());
    }

    #[test]
    fn buffered_response_maps_eval_counts_to_usage() {
        let resp = json!({
            "model": "llama3.2",
            "message": { "role": "assistant", "content": "hello" },
            "done": true,
            "prompt_eval_count": 12,
            "eval_count": 4,
        });
        let out = from_ollama(resp, "ollama").unwrap();
        assert_eq!(out.content(), Some("hello"));
        assert_eq!(out.usage, Usage::new(12, 4));
    }

    // ── streaming ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cumulative_stream_becomes_suffix_deltas() {
        let lines = concat!(
            "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"He\"},\"done\":false}\n",
            "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"Hello\"},\"done\":false}\n",
            "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"Hello!\"},\"done\":false}\n",
            "{\"model\":\"llama3.2\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"prompt_eval_count\":3,\"eval_count\":6}\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(lines, "application/x-ndjson"))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, vec!["llama3.2".into()]);
        let mut stream = adapter
            .chat_stream(
                &request(vec![Message::text(Role::User, "hi")]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.chunks.recv().await {
            chunks.push(chunk);
        }
        let deltas: Vec<&str> =
            chunks.iter().filter(|c| !c.done).map(|c| c.content.as_str()).collect();
        assert_eq!(deltas, vec!["He", "llo", "!"]);

        let terminal = chunks.last().unwrap();
        assert!(terminal.done);
        assert!(terminal.content.is_empty());
        assert_eq!(terminal.usage, Some(Usage::new(3, 6)));
        // Concatenated deltas equal the final cumulative content.
        assert_eq!(deltas.concat(), "Hello!");
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    }

    #[tokio::test]
    async fn broken_prefix_falls_back_to_whole_string() {
        let lines = concat!(
            "{\"message\":{\"content\":\"abc\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"xyz\"},\"done\":false}\n",
            "{\"message\":{\"content\":\"\"},\"done\":true}\n",
        );
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(lines, "application/x-ndjson"))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, vec![]);
        let mut stream = adapter
            .chat_stream(
                &request(vec![Message::text(Role::User, "hi")]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let mut deltas = Vec::new();
        while let Some(chunk) = stream.chunks.recv().await {
            if !chunk.done {
                deltas.push(chunk.content);
            }
        }
        assert_eq!(deltas, vec!["abc", "xyz"]);
    }

    #[tokio::test]
    async fn upstream_error_line_fails_the_stream() {
        let lines = "{\"error\":\"model not loaded\"}\n";
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(lines, "application/x-ndjson"))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, vec![]);
        let mut stream = adapter
            .chat_stream(
                &request(vec![Message::text(Role::User, "hi")]),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let err = stream.errors.recv().await.expect("error should surface");
        assert!(err.message.contains("model not loaded"));
        assert!(stream.chunks.recv().await.is_none());
    }

    // ── model listing ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn models_refresh_from_api_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{ "name": "llama3.2:latest" }, { "name": "qwen2.5:7b" }],
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, vec!["stale".into()]);
        let models = adapter.models().await;
        assert_eq!(models, vec!["llama3.2:latest".to_string(), "qwen2.5:7b".to_string()]);
    }

    #[tokio::test]
    async fn models_fall_back_to_configured_list_when_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server, vec!["llama3.2".into()]);
        assert_eq!(adapter.models().await, vec!["llama3.2".to_string()]);
    }

    #[test]
    fn local_backend_needs_no_key() {
        let cfg = ProviderConfig {
            name: "ollama".into(),
            kind: ProviderKind::Ollama,
            base_url: "http://localhost:11434".into(),
            api_key_env: None,
            timeout_ms: 5_000,
            models: vec![],
            supports_streaming: true,
        };
        let adapter = OllamaAdapter::from_config(&cfg);
        assert!(!adapter.requires_key());
        assert!(!adapter.has_server_key());
    }
}

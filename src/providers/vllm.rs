//! vLLM adapter.
//!
//! vLLM serves the OpenAI wire format, so request/response translation is
//! shared with the OpenAI adapter. Two differences:
//!
//! - Models without a chat template reject `/v1/chat/completions`; the
//!   adapter transparently retries `/v1/completions` with the conversation
//!   concatenated into a single prompt.
//! - The model list is live: a vLLM server advertises exactly the models it
//!   loaded, so `/v1/models` is polled opportunistically with a short cache.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::schema::{
    ChatRequest, ChatResponse, Message, MessageContent, ResponseChoice, Role, Usage,
};

use super::openai::{parse_buffered_response, parse_usage, relay_sse_stream, wire_request};
use super::{ChatProvider, ProviderStream};

/// How long a fetched model list stays fresh.
const MODELS_TTL: Duration = Duration::from_secs(60);

struct ModelCache {
    fetched_at: Option<Instant>,
    models: Vec<String>,
}

/// Adapter for a vLLM inference server.
pub struct VllmAdapter {
    name: String,
    client: Client,
    stream_client: Client,
    base_url: String,
    server_key: Option<String>,
    supports_streaming: bool,
    cache: RwLock<ModelCache>,
}

impl VllmAdapter {
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

    fn authorize<'a>(
        &self,
        builder: reqwest::RequestBuilder,
        api_key: Option<&'a str>,
    ) -> reqwest::RequestBuilder {
        match api_key.or(self.server_key.as_deref()) {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn fetch_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .authorize(self.client.get(&url), None)
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
            .map_err(|e| ProviderError::malformed(format!("bad /v1/models body: {e}")))?;
        Ok(value["data"]
            .as_array()
            .map(|models| {
                models.iter().filter_map(|m| m["id"].as_str()).map(String::from).collect()
            })
            .unwrap_or_default())
    }

    /// Retry path for models without a chat template: one flat prompt
    /// against `/v1/completions`.
    async fn completions_fallback(
        &self,
        req: &ChatRequest,
        api_key: Option<&str>,
    ) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/v1/completions", self.base_url);
        let mut body = json!({
            "model": req.model,
            "prompt": concat_prompt(&req.messages),
        });
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = req.max_tokens {
            body["max_tokens"] = json!(m);
        }

        let response = self
            .authorize(self.client.post(&url).json(&body), api_key)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        let status = response.status();
        let text = response.text().await.map_err(ProviderError::from_reqwest)?;
        if !status.is_success() {
            return Err(ProviderError::status(status.as_u16(), text));
        }
        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::malformed(format!("response is not JSON: {e}")))?;

        let completion = value
            .pointer("/choices/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::malformed("missing `choices[0].text`"))?
            .to_string();
        Ok(ChatResponse {
            id: value["id"].as_str().map(String::from).unwrap_or_else(|| Uuid::new_v4().to_string()),
            model: value["model"].as_str().unwrap_or(&req.model).to_string(),
            provider: self.name.clone(),
            choices: vec![ResponseChoice {
                message: Message::text(Role::Assistant, completion),
            }],
            usage: parse_usage(&value["usage"]),
            cost: 0.0,
            latency_ms: 0,
        })
    }
}

/// Whether an upstream rejection indicates a missing chat template.
fn is_chat_template_error(err: &ProviderError) -> bool {
    err.message.to_lowercase().contains("chat template")
}

/// Flatten the conversation into a single prompt, one `Role: text` paragraph
/// per message, primed for the assistant's turn.
pub(crate) fn concat_prompt(messages: &[Message]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        let role = match msg.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        let text = match &msg.content {
            MessageContent::Text(s) => s.clone(),
            parts => parts.flatten_text(),
        };
        prompt.push_str(&format!("{role}: {text}\n\n"));
    }
    prompt.push_str("Assistant: ");
    prompt
}

#[async_trait::async_trait]
impl ChatProvider for VllmAdapter {
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

    async fn health_check(&self) -> Result<(), ProviderError> {
        self.fetch_models().await.map(|_| ())
    }

    async fn chat(
        &self,
        req: &ChatRequest,
        api_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = wire_request(req, false);
        let builder = self.authorize(self.client.post(&url).json(&body), api_key);

        let call = async {
            let response = builder.send().await.map_err(ProviderError::from_reqwest)?;
            let status = response.status();
            let text = response.text().await.map_err(ProviderError::from_reqwest)?;
            if !status.is_success() {
                let err = ProviderError::status(status.as_u16(), text);
                if is_chat_template_error(&err) {
                    return self.completions_fallback(req, api_key).await;
                }
                return Err(err);
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
        let builder = self.authorize(self.stream_client.post(&url).json(&body), api_key);

        let open = async {
            let response = builder.send().await.map_err(ProviderError::from_reqwest)?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let text = response.text().await.unwrap_or_default();
            let err = ProviderError::status(status.as_u16(), text);
            if !is_chat_template_error(&err) {
                return Err(err);
            }
            // Same fallback as buffered: stream the flat-prompt completion.
            // The SSE relay understands both delta and text chunk shapes.
            let url = format!("{}/v1/completions", self.base_url);
            let mut body = json!({
                "model": req.model,
                "prompt": concat_prompt(&req.messages),
                "stream": true,
            });
            if let Some(m) = req.max_tokens {
                body["max_tokens"] = json!(m);
            }
            let response = self
                .authorize(self.stream_client.post(&url).json(&body), api_key)
                .send()
                .await
                .map_err(ProviderError::from_reqwest)?;
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
// Tests
// ──────────────────────────────────────────────────────────────────────────────

//! The normalized chat-completion schema.
//!
//! Every provider adapter translates to and from these types; nothing
//! upstream-specific leaks past an adapter boundary. The JSON shapes mirror
//! the OpenAI chat-completions wire format closely enough that existing
//! client SDKs work unmodified, with gateway-specific additions (`provider`,
//! `cost`, `latency_ms`) layered on top.

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Who authored a message. `Tool` carries tool-call results back to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One part of a multimodal message body.
///
/// `Image` and `Audio` carry either a plain URL or a `data:` URL with an
/// inline base64 payload; adapters decide per-backend whether to pass the
/// part through natively or degrade it to a textual placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
    Audio { url: String },
}

/// Message content: a plain string or an ordered sequence of parts.
///
/// Part ordering is significant and must survive every adapter round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Total character count, used by the cost estimator. Media parts count
    /// their URL length — a deliberate overestimate is preferable to zero.
    pub fn char_count(&self) -> usize {
        match self {
            Self::Text(s) => s.chars().count(),
            Self::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::Image { url } | ContentPart::Audio { url } => url.chars().count(),
                })
                .sum(),
        }
    }

    /// Flatten to plain text, substituting placeholders for media parts.
    /// Used by text-only upstream paths (e.g. the vLLM `/completions` fallback).
    pub fn flatten_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    match part {
                        ContentPart::Text { text } => out.push_str(text),
                        ContentPart::Image { .. } => out.push_str("[image]"),
                        ContentPart::Audio { .. } => out.push_str("[audio]"),
                    }
                }
                out
            }
        }
    }
}

/// One chat message. Ordering within a request is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: MessageContent::Text(content.into()) }
    }
}

/// The normalized inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Tool definitions, forwarded opaquely to wire-compatible backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Accepted for client convenience; the core does not interpret it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    /// Schema-level validation, applied once at the router's edge.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("`model` is required".into()));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "`messages` must contain at least one message".into(),
            ));
        }
        Ok(())
    }

    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Character count across all message content, for cost estimation.
    pub fn char_count(&self) -> usize {
        self.messages.iter().map(|m| m.content.char_count()).sum()
    }
}

/// Token accounting for one request. Zero means "unknown", never a claim of
/// zero tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn is_known(&self) -> bool {
        self.total_tokens > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseChoice {
    pub message: Message,
}

/// The normalized buffered response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    /// Name of the provider that actually served the request.
    pub provider: String,
    pub choices: Vec<ResponseChoice>,
    pub usage: Usage,
    /// Realized cost in USD; 0.0 for local providers and unknown price rows.
    pub cost: f64,
    pub latency_ms: u64,
}

impl ChatResponse {
    /// Convenience accessor for the first choice's text content.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| match &c.message.content {
            MessageContent::Text(s) => Some(s.as_str()),
            MessageContent::Parts(_) => None,
        })
    }
}

/// One unit of the client-facing stream protocol.
///
/// `content` is an append-only delta. Exactly one chunk per stream has
/// `done = true`; only a terminal chunk may carry `error` or `usage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub content: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamChunk {
    /// A non-terminal content delta.
    pub fn delta(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            done: false,
            usage: None,
            provider: None,
            error: None,
        }
    }

    /// The terminal chunk, optionally carrying upstream usage.
    pub fn terminal(id: impl Into<String>, usage: Option<Usage>) -> Self {
        Self {
            id: id.into(),
            content: String::new(),
            done: true,
            usage,
            provider: None,
            error: None,
        }
    }

    /// A terminal error chunk.
    pub fn terminal_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: String::new(),
            done: true,
            usage: None,
            provider: None,
            error: Some(error.into()),
        }
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_content_deserializes_untagged() {
        let msg: Message =
            serde_json::from_value(json!({ "role": "user", "content": "hello" })).unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, MessageContent::Text("hello".into()));
    }

    #[test]
    fn part_content_deserializes_tagged() {
        let msg: Message = serde_json::from_value(json!({
            "role": "user",
            "content": [
                { "type": "text", "text": "what is this?" },
                { "type": "image", "url": "data:image/png;base64,aGk=" },
            ],
        }))
        .unwrap();
        match &msg.content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[1], ContentPart::Image { .. }));
            }
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_empty_model_and_messages() {
        let req = ChatRequest {
            model: "".into(),
            messages: vec![Message::text(Role::User, "hi")],
            temperature: None,
            max_tokens: None,
            stream: None,
            tools: None,
            user_id: None,
            conversation_id: None,
        };
        assert!(req.validate().is_err());

        let req = ChatRequest { model: "m".into(), messages: vec![], ..req };
        assert!(req.validate().is_err());
    }

    #[test]
    fn char_count_sums_all_parts() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![
                Message::text(Role::System, "abcd"),
                Message {
                    role: Role::User,
                    content: MessageContent::Parts(vec![
                        ContentPart::Text { text: "efgh".into() },
                        ContentPart::Image { url: "ij".into() },
                    ]),
                },
            ],
            temperature: None,
            max_tokens: None,
            stream: None,
            tools: None,
            user_id: None,
            conversation_id: None,
        };
        assert_eq!(req.char_count(), 10);
    }

    #[test]
    fn flatten_text_substitutes_media_placeholders() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "look at".into() },
            ContentPart::Image { url: "https://example.com/cat.png".into() },
        ]);
        assert_eq!(content.flatten_text(), "look at [image]");
    }

    #[test]
    fn usage_totals_and_unknown_sentinel() {
        let u = Usage::new(10, 5);
        assert_eq!(u.total_tokens, 15);
        assert!(u.is_known());
        assert!(!Usage::default().is_known());
    }

    #[test]
    fn terminal_chunk_serializes_compactly() {
        let chunk = StreamChunk::terminal("abc", None);
        let v = serde_json::to_value(&chunk).unwrap();
        assert_eq!(v, json!({ "id": "abc", "content": "", "done": true }));
    }

    #[test]
    fn delta_chunk_omits_optional_fields() {
        let v = serde_json::to_value(StreamChunk::delta("abc", "He")).unwrap();
        assert!(v.get("usage").is_none());
        assert!(v.get("error").is_none());
        assert_eq!(v["content"], "He");
        assert_eq!(v["done"], false);
    }
}

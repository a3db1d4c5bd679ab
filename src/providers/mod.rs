//! Provider adapters and the unified capability trait.
//!
//! [`ChatProvider`] is the seam between the router and every upstream API.
//! One adapter per backend family; adapter-specific protocol differences —
//! schema translation, auth headers, endpoint paths, stream formats — are
//! fully encapsulated in the adapter modules. The router only ever sees the
//! normalized schema and categorized [`ProviderError`]s.

mod anthropic;
mod google;
mod ollama;
mod openai;
mod vllm;

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use vllm::VllmAdapter;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::ProviderError;
use crate::schema::{ChatRequest, ChatResponse, StreamChunk};

/// Capacity of the per-stream chunk channel. Small on purpose: upstream
/// producers must feel backpressure from slow consumers.
pub const CHUNK_CHANNEL_CAPACITY: usize = 10;

/// The consumer half of one upstream stream: a finite chunk pipe plus an
/// error pipe that yields at most one error. When an error is produced the
/// chunk pipe closes without a terminal chunk.
#[derive(Debug)]
pub struct ProviderStream {
    pub chunks: mpsc::Receiver<StreamChunk>,
    pub errors: mpsc::Receiver<ProviderError>,
}

/// The producer half, held by an adapter's stream task.
pub struct StreamProducer {
    chunks: mpsc::Sender<StreamChunk>,
    errors: mpsc::Sender<ProviderError>,
}

impl ProviderStream {
    /// Create a connected (producer, consumer) pair.
    pub fn pipe() -> (StreamProducer, ProviderStream) {
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(1);
        (
            StreamProducer { chunks: chunk_tx, errors: err_tx },
            ProviderStream { chunks: chunk_rx, errors: err_rx },
        )
    }
}

impl StreamProducer {
    /// Forward one chunk, waiting for channel capacity. Returns `false` when
    /// the consumer has gone away (the producer should stop promptly).
    pub async fn send(&self, chunk: StreamChunk) -> bool {
        self.chunks.send(chunk).await.is_ok()
    }

    /// Report the stream's single error. Dropping the producer afterwards
    /// closes the chunk pipe without a terminal chunk.
    pub async fn fail(self, err: ProviderError) {
        let _ = self.errors.send(err).await;
    }
}

/// The provider capability set: identity, model list, health, buffered chat,
/// and streaming chat.
///
/// `api_key` is the caller-scoped override (BYOK); `None` means the adapter
/// uses its server-configured key, or no key for local backends. Plaintext
/// keys are used within the call frame only — adapters must not store them.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stable lowercase identifier, unique within the registry.
    fn name(&self) -> &str;

    /// Whether streaming requests may be routed here.
    fn supports_streaming(&self) -> bool;

    /// Whether this backend needs a credential at all (local servers don't).
    fn requires_key(&self) -> bool;

    /// Whether a server-side key was configured at startup.
    fn has_server_key(&self) -> bool;

    /// Advertised models. Cached; dynamic backends (Ollama, vLLM) refresh
    /// opportunistically from their listing endpoint.
    async fn models(&self) -> Vec<String>;

    /// Lightweight liveness probe.
    async fn health_check(&self) -> Result<(), ProviderError>;

    /// One buffered chat completion.
    async fn chat(
        &self,
        req: &ChatRequest,
        api_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError>;

    /// Open a chunk stream. Errors before any bytes arrive surface as `Err`;
    /// later failures arrive on the stream's error pipe.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
        api_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ProviderStream, ProviderError>;
}

/// Build the adapter for one configured provider.
pub fn build_provider(cfg: &ProviderConfig) -> Arc<dyn ChatProvider> {
    match cfg.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiAdapter::from_config(cfg)),
        ProviderKind::Anthropic => Arc::new(AnthropicAdapter::from_config(cfg)),
        ProviderKind::Google => Arc::new(GoogleAdapter::from_config(cfg)),
        ProviderKind::Ollama => Arc::new(OllamaAdapter::from_config(cfg)),
        ProviderKind::Vllm => Arc::new(VllmAdapter::from_config(cfg)),
    }
}

/// Split a `data:` URL into (media type, base64 payload).
///
/// Returns `None` for plain URLs and for data-URLs that are not base64
/// encoded — callers treat both as pass-by-reference.
pub(crate) fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    Some((mime, payload))
}

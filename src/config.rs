//! Configuration types for model-gateway.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults.
//!
//! # Example
//! ```toml
//! [gateway]
//! client_port = 8080
//!
//! [[providers]]
//! name        = "openai"
//! kind        = "openai"
//! base_url    = "https://api.openai.com"
//! api_key_env = "OPENAI_API_KEY"
//! models      = ["gpt-4o", "gpt-4o-mini"]
//!
//! [[providers]]
//! name     = "ollama"
//! kind     = "ollama"
//! base_url = "http://localhost:11434"
//!
//! [[pricing]]
//! provider          = "openai"
//! model             = "gpt-4o"
//! input_cost_per_1k = 0.0025
//! output_cost_per_1k = 0.01
//!
//! [routing]
//! default_strategy = "balanced"
//! ```

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::routing::Strategy;

/// Which upstream API family a provider speaks.
///
/// The gateway normalizes all traffic to one internal schema; each kind maps
/// to an adapter that handles the request/response/stream translation at the
/// edge.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Standard OpenAI `/v1/chat/completions` protocol.
    /// Also used by LM Studio, LocalAI, OpenRouter, and many others.
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic Messages API (`/v1/messages`), translated to/from the
    /// normalized schema.
    Anthropic,
    /// Google Gemini `generateContent` / `streamGenerateContent`.
    Google,
    /// Ollama local inference server, native `/api/chat` JSON-lines protocol.
    Ollama,
    /// vLLM server: OpenAI wire format plus a `/completions` fallback for
    /// models without a chat template.
    Vllm,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Ollama => "ollama",
            Self::Vllm => "vllm",
        })
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Registered providers, in registration order. Order matters: strategy
    /// ties are broken by position in this list.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Price table rows. Providers without a row cost 0 and log once.
    #[serde(default)]
    pub pricing: Vec<PricingRow>,

    #[serde(default)]
    pub routing: RoutingConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Provider names must be unique — the registry is keyed by name.
        let mut seen = std::collections::HashSet::new();
        for p in &self.providers {
            anyhow::ensure!(!p.name.trim().is_empty(), "provider with empty name");
            anyhow::ensure!(
                seen.insert(p.name.as_str()),
                "duplicate provider name `{}`",
                p.name
            );
            anyhow::ensure!(
                !p.base_url.trim().is_empty(),
                "provider `{}` has an empty base_url",
                p.name
            );
        }

        // Every pricing row must reference a registered provider.
        for row in &self.pricing {
            anyhow::ensure!(
                seen.contains(row.provider.as_str()),
                "pricing row for unknown provider `{}`",
                row.provider
            );
        }

        let w = &self.routing;
        anyhow::ensure!(
            w.balanced_cost_weight >= 0.0 && w.balanced_latency_weight >= 0.0,
            "balanced strategy weights must be non-negative"
        );
        anyhow::ensure!(
            w.balanced_cost_weight + w.balanced_latency_weight > 0.0,
            "balanced strategy weights must not both be zero"
        );
        anyhow::ensure!(w.latency_window > 0, "latency_window must be positive");

        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// Core gateway settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port for the caller-facing client API (default: 8080).
    #[serde(default = "defaults::client_port")]
    pub client_port: u16,

    /// Port for the admin API (default: 8081).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Capacity of the request-ledger queue (default: 1024). Overflow drops
    /// the oldest entry and increments a counter.
    #[serde(default = "defaults::ledger_capacity")]
    pub ledger_capacity: usize,

    /// Maximum requests per minute per caller on the client port, counted
    /// against the authenticated `X-User-Id` (peer IP for anonymous
    /// traffic). Leave unset (or 0) to disable rate limiting.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,

    /// Environment variable whose value is the Bearer token required for all
    /// admin API requests. Leave unset to disable admin authentication (only
    /// recommended when the admin port is strictly firewalled).
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Environment variable holding the base64-encoded 32-byte master key
    /// used to seal BYOK provider keys (default: `MGW_BYOK_KEY`). When the
    /// variable is unset at startup, BYOK endpoints are disabled and only
    /// server-configured keys are used.
    #[serde(default = "defaults::byok_key_env")]
    pub byok_key_env: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty gateway config must deserialize")
    }
}

/// One registered provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    /// Unique lowercase provider name, e.g. `openai`, `ollama-lab`.
    pub name: String,

    /// Which adapter to use when talking to this backend.
    #[serde(default)]
    pub kind: ProviderKind,

    /// Base URL without a trailing `/v1` (the adapter appends paths).
    pub base_url: String,

    /// Environment variable name whose value is the server-side API key.
    /// Leave unset for keyless local backends (Ollama, vLLM without auth).
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Buffered-request timeout in milliseconds (default: 30 000).
    /// Streaming requests have no request-level timeout; the router applies
    /// an overall stream deadline instead.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Models this provider advertises. For Ollama and vLLM this is the
    /// fallback list; the live list is refreshed from the backend.
    #[serde(default)]
    pub models: Vec<String>,

    /// Whether streaming requests may be routed here (default: true).
    #[serde(default = "defaults::supports_streaming")]
    pub supports_streaming: bool,
}

impl ProviderConfig {
    /// Resolve the server-side API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty())
    }
}

/// One row of the (provider, model) price table. Costs are USD per 1 000 tokens.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PricingRow {
    pub provider: String,
    pub model: String,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

/// Routing and telemetry tunables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Strategy applied when neither an admin lock nor a user preference says
    /// otherwise (default: `model`).
    #[serde(default)]
    pub default_strategy: Strategy,

    /// Sliding-window size for per-provider latency tracking (default: 100).
    #[serde(default = "defaults::latency_window")]
    pub latency_window: usize,

    /// Weights for the balanced strategy (default: 0.5 / 0.5). Normalized
    /// internally, so only the ratio matters.
    #[serde(default = "defaults::balanced_weight")]
    pub balanced_cost_weight: f64,
    #[serde(default = "defaults::balanced_weight")]
    pub balanced_latency_weight: f64,

    /// Assumed completion size for cost estimation when the request carries
    /// no `max_tokens` (default: 1024).
    #[serde(default = "defaults::default_output_tokens")]
    pub default_output_tokens: u32,

    /// Overall deadline for one streaming response (default: 600 s).
    #[serde(default = "defaults::stream_timeout_secs")]
    pub stream_timeout_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty routing config must deserialize")
    }
}

mod defaults {
    pub fn client_port() -> u16 { 8080 }
    pub fn admin_port() -> u16 { 8081 }
    pub fn ledger_capacity() -> usize { 1024 }
    pub fn byok_key_env() -> String { "MGW_BYOK_KEY".into() }
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn supports_streaming() -> bool { true }
    pub fn latency_window() -> usize { 100 }
    pub fn balanced_weight() -> f64 { 0.5 }
    pub fn default_output_tokens() -> u32 { 1_024 }
    pub fn stream_timeout_secs() -> u64 { 600 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [[providers]]
            name     = "openai"
            kind     = "openai"
            base_url = "https://api.openai.com"
            api_key_env = "OPENAI_API_KEY"
            models   = ["gpt-4o"]

            [[providers]]
            name     = "ollama"
            kind     = "ollama"
            base_url = "http://localhost:11434"
            models   = ["llama3.2"]

            [[pricing]]
            provider = "openai"
            model = "gpt-4o"
            input_cost_per_1k = 0.0025
            output_cost_per_1k = 0.01
            "#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.toml");
        let config: Config = toml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
    }

    #[test]
    fn minimal_config_is_valid() {
        minimal_config().validate().expect("should validate");
    }

    #[test]
    fn validation_rejects_duplicate_provider_names() {
        let mut config = minimal_config();
        let dup = config.providers[0].clone();
        config.providers.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_pricing_for_unknown_provider() {
        let mut config = minimal_config();
        config.pricing.push(PricingRow {
            provider: "nonexistent".into(),
            model: "x".into(),
            input_cost_per_1k: 0.001,
            output_cost_per_1k: 0.002,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_weights() {
        let mut config = minimal_config();
        config.routing.balanced_cost_weight = 0.0;
        config.routing.balanced_latency_weight = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn gateway_defaults_are_applied_when_sections_are_absent() {
        let config: Config = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.gateway.client_port, 8080);
        assert_eq!(config.gateway.admin_port, 8081);
        assert_eq!(config.gateway.ledger_capacity, 1024);
        assert_eq!(config.gateway.byok_key_env, "MGW_BYOK_KEY");
        assert_eq!(config.routing.latency_window, 100);
        assert_eq!(config.routing.default_output_tokens, 1024);
        assert!((config.routing.balanced_cost_weight - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn provider_kind_deserializes_from_snake_case() {
        #[derive(Deserialize)]
        struct K { kind: ProviderKind }
        let k: K = toml::from_str("kind = \"anthropic\"").unwrap();
        assert_eq!(k.kind, ProviderKind::Anthropic);
        let k: K = toml::from_str("kind = \"vllm\"").unwrap();
        assert_eq!(k.kind, ProviderKind::Vllm);
    }

    #[test]
    fn provider_lookup_by_name() {
        let config = minimal_config();
        assert!(config.provider("ollama").is_some());
        assert!(config.provider("missing").is_none());
    }

    #[test]
    fn api_key_resolves_from_env() {
        let var = "MGW_CONFIG_TEST_KEY_RESOLVE_77";
        // SAFETY: single-threaded test setup; env mutation is acceptable here.
        unsafe { std::env::set_var(var, "sk-test-resolved") };
        let cfg = ProviderConfig {
            name: "x".into(),
            kind: ProviderKind::OpenAi,
            base_url: "http://x".into(),
            api_key_env: Some(var.into()),
            timeout_ms: 5_000,
            models: vec![],
            supports_streaming: true,
        };
        assert_eq!(cfg.api_key().as_deref(), Some("sk-test-resolved"));
        unsafe { std::env::remove_var(var) };
    }
}

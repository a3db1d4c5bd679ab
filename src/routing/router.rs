//! Request routing — the brain of the gateway.
//!
//! The router owns the provider registry and, per request: resolves the
//! effective strategy (admin lock → user preference → default), computes the
//! eligible provider set (advertises the model AND has a usable credential),
//! asks the strategy engine for a ranked fallback list, and walks it.
//! Transient upstream failures continue down the list; everything else
//! returns immediately. Every attempt feeds the latency tracker and the
//! request ledger.
//!
//! Streaming adds a commit barrier: before the first chunk reaches the
//! caller, failures fall back to the next candidate; after it, the stream
//! terminates with an error chunk — a mid-stream provider switch would
//! splice two unrelated completions together.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::crypto::KeyCipher;
use crate::error::{GatewayError, ProviderError, ProviderErrorKind};
use crate::ledger::{LedgerEntry, RequestKind, RequestLedger};
use crate::providers::{ChatProvider, ProviderStream};
use crate::schema::{ChatRequest, ChatResponse, StreamChunk, Usage};
use crate::store::{CredentialStore, RulesStore, SettingsStore};
use crate::telemetry::{CostTable, LatencyTracker};

use super::strategy::{self, Candidate, RankInputs, RoutingRule, RuleScope, Strategy};

/// Client-facing stream handle: the chunk pipe plus an error pipe used only
/// when the stream fails before anything was delivered.
pub struct RoutedStream {
    pub chunks: mpsc::Receiver<StreamChunk>,
    pub errors: mpsc::Receiver<GatewayError>,
}

/// What a caller can see about one registered provider.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderSummary {
    pub name: String,
    pub models: Vec<String>,
    pub supports_streaming: bool,
    /// Whether the caller has an active BYOK key for this provider.
    pub has_user_key: bool,
}

/// Assembles a [`Router`] from its collaborators.
pub struct RouterBuilder {
    providers: Vec<Arc<dyn ChatProvider>>,
    cost: Arc<CostTable>,
    latency: Arc<LatencyTracker>,
    credentials: Arc<dyn CredentialStore>,
    settings: Arc<dyn SettingsStore>,
    rules: Arc<dyn RulesStore>,
    ledger: RequestLedger,
    cipher: Option<KeyCipher>,
    cost_weight: f64,
    latency_weight: f64,
    stream_timeout: Duration,
}

impl RouterBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cost: Arc<CostTable>,
        latency: Arc<LatencyTracker>,
        credentials: Arc<dyn CredentialStore>,
        settings: Arc<dyn SettingsStore>,
        rules: Arc<dyn RulesStore>,
        ledger: RequestLedger,
    ) -> Self {
        Self {
            providers: Vec::new(),
            cost,
            latency,
            credentials,
            settings,
            rules,
            ledger,
            cipher: None,
            cost_weight: 0.5,
            latency_weight: 0.5,
            stream_timeout: Duration::from_secs(600),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn ChatProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn providers(mut self, providers: Vec<Arc<dyn ChatProvider>>) -> Self {
        self.providers.extend(providers);
        self
    }

    /// BYOK master cipher; without one, BYOK lookups are disabled.
    pub fn cipher(mut self, cipher: Option<KeyCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn balanced_weights(mut self, cost_weight: f64, latency_weight: f64) -> Self {
        self.cost_weight = cost_weight;
        self.latency_weight = latency_weight;
        self
    }

    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn build(self) -> Arc<Router> {
        Arc::new(Router {
            registry: RwLock::new(Arc::new(self.providers)),
            cost: self.cost,
            latency: self.latency,
            credentials: self.credentials,
            settings: self.settings,
            rules: self.rules,
            ledger: self.ledger,
            cipher: self.cipher,
            cost_weight: self.cost_weight,
            latency_weight: self.latency_weight,
            stream_timeout: self.stream_timeout,
        })
    }
}

pub struct Router {
    /// Registration-ordered providers. The lock is held only for the duration
    /// of `Arc::clone`, so readers get a stable snapshot with no contention.
    registry: RwLock<Arc<Vec<Arc<dyn ChatProvider>>>>,
    cost: Arc<CostTable>,
    latency: Arc<LatencyTracker>,
    credentials: Arc<dyn CredentialStore>,
    settings: Arc<dyn SettingsStore>,
    rules: Arc<dyn RulesStore>,
    ledger: RequestLedger,
    cipher: Option<KeyCipher>,
    cost_weight: f64,
    latency_weight: f64,
    stream_timeout: Duration,
}

impl Router {
    /// Snapshot of the registry; in-flight requests keep their own copy.
    pub fn providers(&self) -> Arc<Vec<Arc<dyn ChatProvider>>> {
        self.registry.read().expect("registry lock poisoned").clone()
    }

    /// Replace the registry (admin re-registration). Visible to subsequent
    /// requests only.
    pub fn replace_providers(&self, providers: Vec<Arc<dyn ChatProvider>>) {
        *self.registry.write().expect("registry lock poisoned") = Arc::new(providers);
    }

    pub fn cost_table(&self) -> &CostTable {
        &self.cost
    }

    pub fn latency_tracker(&self) -> &LatencyTracker {
        &self.latency
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    pub fn byok_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seal a plaintext provider key for storage. Used by the key-management
    /// surface; the router itself only ever opens keys.
    pub fn seal_key(&self, plaintext: &str) -> Result<String, GatewayError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| GatewayError::Internal("BYOK master key not configured".into()))?;
        cipher
            .seal(plaintext)
            .map_err(|e| GatewayError::Internal(format!("sealing key failed: {e}")))
    }

    // ── admin operations ─────────────────────────────────────────────────────

    pub async fn set_default_strategy(
        &self,
        strategy: Strategy,
        updated_by: &str,
    ) -> Result<(), GatewayError> {
        self.settings
            .set_default_strategy(strategy, updated_by)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    pub async fn set_strategy_lock(
        &self,
        locked: bool,
        updated_by: &str,
    ) -> Result<(), GatewayError> {
        self.settings
            .set_lock(locked, updated_by)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    pub async fn set_custom_rules(
        &self,
        rules: Vec<RoutingRule>,
        scope: RuleScope,
        updated_by: &str,
    ) -> Result<(), GatewayError> {
        self.rules
            .save_rules(rules, scope, updated_by)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    /// Per-user strategy preference. Rejected while the admin lock is on.
    pub async fn set_user_strategy(
        &self,
        user_id: &str,
        strategy: Option<Strategy>,
    ) -> Result<(), GatewayError> {
        if self.is_locked().await? {
            return Err(GatewayError::Unauthorized(
                "routing strategy is locked by the administrator".into(),
            ));
        }
        self.settings
            .set_user_strategy(user_id, strategy)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    pub async fn default_strategy(&self) -> Result<Strategy, GatewayError> {
        self.settings
            .default_strategy()
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    pub async fn is_locked(&self) -> Result<bool, GatewayError> {
        self.settings
            .is_locked()
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    pub async fn active_rules(&self) -> Result<Vec<RoutingRule>, GatewayError> {
        self.rules
            .active_rules()
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }

    /// Providers visible to this caller: a server key is configured, the
    /// caller has an active BYOK key, or the backend is keyless.
    pub async fn list_providers_for(
        &self,
        user_id: Option<&str>,
    ) -> Result<Vec<ProviderSummary>, GatewayError> {
        let mut out = Vec::new();
        for provider in self.providers().iter() {
            let has_user_key = match user_id {
                Some(uid) => self
                    .credentials
                    .get_provider_key(uid, provider.name())
                    .await
                    .map_err(|e| GatewayError::Internal(e.to_string()))?
                    .is_some(),
                None => false,
            };
            if provider.requires_key() && !provider.has_server_key() && !has_user_key {
                continue;
            }
            out.push(ProviderSummary {
                name: provider.name().to_string(),
                models: provider.models().await,
                supports_streaming: provider.supports_streaming(),
                has_user_key,
            });
        }
        Ok(out)
    }

    // ── selection ────────────────────────────────────────────────────────────

    async fn effective_strategy(&self, user_id: Option<&str>) -> Result<Strategy, GatewayError> {
        let locked = self.is_locked().await?;
        let default = self.default_strategy().await?;
        if locked {
            return Ok(default);
        }
        if let Some(uid) = user_id {
            if let Some(pref) = self
                .settings
                .user_strategy(uid)
                .await
                .map_err(|e| GatewayError::Internal(e.to_string()))?
            {
                return Ok(pref);
            }
        }
        Ok(default)
    }

    /// Build the ranked fallback list for one request. A single request
    /// observes one consistent snapshot of (strategy, rules, registry).
    async fn select(
        &self,
        req: &ChatRequest,
        user_id: Option<&str>,
        streaming: bool,
    ) -> Result<Vec<Arc<dyn ChatProvider>>, GatewayError> {
        let snapshot = self.providers();
        let locked = self.is_locked().await?;
        let strategy = self.effective_strategy(user_id).await?;
        let default = self.default_strategy().await?;

        let rules = if strategy == Strategy::Custom {
            // While locked, user-scoped rules are ignored everywhere.
            match (locked, user_id) {
                (false, Some(uid)) => self
                    .rules
                    .active_rules_for_user(uid)
                    .await
                    .map_err(|e| GatewayError::Internal(e.to_string()))?,
                _ => self.active_rules().await?,
            }
        } else {
            Vec::new()
        };

        let mut candidates = Vec::new();
        let mut by_name: HashMap<String, Arc<dyn ChatProvider>> = HashMap::new();
        for (order, provider) in snapshot.iter().enumerate() {
            if streaming && !provider.supports_streaming() {
                continue;
            }
            if !provider.models().await.iter().any(|m| m == &req.model) {
                continue;
            }
            let usable = !provider.requires_key()
                || provider.has_server_key()
                || self.has_active_byok(user_id, provider.name()).await?;
            if !usable {
                continue;
            }
            let name = provider.name().to_string();
            candidates.push(Candidate {
                name: name.clone(),
                order,
                cost_estimate: self.cost.estimate(&name, &req.model, req),
                avg_latency_ms: self.latency.average(&name),
            });
            by_name.insert(name, Arc::clone(provider));
        }

        if candidates.is_empty() {
            return Err(GatewayError::NoProvider(format!(
                "no eligible provider for model `{}`",
                req.model
            )));
        }

        let inputs = RankInputs {
            request_model: &req.model,
            user_id: if locked { None } else { user_id },
            default_strategy: default,
            rules: &rules,
            cost_weight: self.cost_weight,
            latency_weight: self.latency_weight,
        };
        let ranked = strategy::rank(&candidates, strategy, &inputs);
        debug!(strategy = %strategy, order = ?ranked, "ranked providers");

        Ok(ranked.into_iter().filter_map(|name| by_name.remove(&name)).collect())
    }

    async fn has_active_byok(
        &self,
        user_id: Option<&str>,
        provider: &str,
    ) -> Result<bool, GatewayError> {
        let Some(uid) = user_id else { return Ok(false) };
        if self.cipher.is_none() {
            return Ok(false);
        }
        Ok(self
            .credentials
            .get_provider_key(uid, provider)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
            .is_some())
    }

    /// Decrypt the caller's key for one provider. The plaintext lives for a
    /// single call frame in the caller; it is never stored on the adapter.
    async fn byok_plaintext(
        &self,
        user_id: Option<&str>,
        provider: &str,
    ) -> Result<Option<String>, GatewayError> {
        let Some(uid) = user_id else { return Ok(None) };
        let Some(cipher) = self.cipher.as_ref() else { return Ok(None) };
        let Some(stored) = self
            .credentials
            .get_provider_key(uid, provider)
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?
        else {
            return Ok(None);
        };
        cipher
            .open(&stored.ciphertext)
            .map(Some)
            .map_err(|e| GatewayError::Internal(format!("BYOK key decryption failed: {e}")))
    }

    // ── buffered execution ───────────────────────────────────────────────────

    /// Route one buffered chat completion with cross-provider fallback.
    #[tracing::instrument(skip(self, req, cancel), fields(model = %req.model))]
    pub async fn route(
        &self,
        req: &ChatRequest,
        user_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, GatewayError> {
        req.validate()?;
        let ordered = self.select(req, user_id, false).await?;

        let mut last_err: Option<GatewayError> = None;
        for provider in ordered {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            let name = provider.name().to_string();
            let key = self.byok_plaintext(user_id, &name).await?;

            let started = Instant::now();
            let result = provider.chat(req, key.as_deref(), cancel).await;
            drop(key);
            let elapsed = started.elapsed();
            self.latency.record(&name, elapsed);

            match result {
                Ok(mut resp) => {
                    resp.provider = name.clone();
                    resp.cost = self.cost.actual(&name, &req.model, &resp.usage);
                    resp.latency_ms = elapsed.as_millis() as u64;
                    self.ledger.record(
                        LedgerEntry::new(&name, &req.model, RequestKind::Chat)
                            .with_user(user_id)
                            .with_usage(&resp.usage)
                            .with_cost(resp.cost)
                            .with_latency(resp.latency_ms)
                            .with_status(200),
                    );
                    return Ok(resp);
                }
                Err(e) => {
                    self.ledger.record(
                        LedgerEntry::new(&name, &req.model, RequestKind::Chat)
                            .with_user(user_id)
                            .with_latency(elapsed.as_millis() as u64)
                            .with_status(e.ledger_status())
                            .with_error(&e.message),
                    );
                    let mapped = GatewayError::from_provider(&name, &e);
                    if e.kind == ProviderErrorKind::Cancelled {
                        return Err(mapped);
                    }
                    if !e.is_transient() {
                        return Err(mapped);
                    }
                    warn!(provider = %name, error = %e, "provider failed — trying next candidate");
                    last_err = Some(mapped);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| GatewayError::NoProvider("all candidates exhausted".into())))
    }

    // ── streaming execution ──────────────────────────────────────────────────

    /// Route one streaming chat completion. Returns immediately with the
    /// client-facing pipes; a relay task drives the fallback walk.
    pub async fn route_stream(
        self: &Arc<Self>,
        req: ChatRequest,
        user_id: Option<String>,
        kind: RequestKind,
        cancel: CancellationToken,
    ) -> Result<RoutedStream, GatewayError> {
        req.validate()?;
        let ordered = self.select(&req, user_id.as_deref(), true).await?;

        let (chunk_tx, chunk_rx) = mpsc::channel(crate::providers::CHUNK_CHANNEL_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(1);
        let router = Arc::clone(self);
        tokio::spawn(async move {
            router
                .relay_stream(req, user_id, kind, ordered, chunk_tx, err_tx, cancel)
                .await;
        });
        Ok(RoutedStream { chunks: chunk_rx, errors: err_rx })
    }

    #[allow(clippy::too_many_arguments)]
    async fn relay_stream(
        &self,
        req: ChatRequest,
        user_id: Option<String>,
        kind: RequestKind,
        ordered: Vec<Arc<dyn ChatProvider>>,
        chunk_tx: mpsc::Sender<StreamChunk>,
        err_tx: mpsc::Sender<GatewayError>,
        cancel: CancellationToken,
    ) {
        let deadline = tokio::time::Instant::now() + self.stream_timeout;
        let user = user_id.as_deref();
        let mut last_err: Option<GatewayError> = None;

        for provider in ordered {
            let name = provider.name().to_string();
            let entry = || {
                LedgerEntry::new(&name, &req.model, kind).with_user(user)
            };

            let key = match self.byok_plaintext(user, &name).await {
                Ok(k) => k,
                Err(e) => {
                    let _ = err_tx.send(e).await;
                    return;
                }
            };

            let started = Instant::now();
            let opened = provider.chat_stream(&req, key.as_deref(), &cancel).await;
            drop(key);

            let mut upstream = match opened {
                Ok(s) => s,
                Err(e) => {
                    self.latency.record(&name, started.elapsed());
                    self.ledger.record(
                        entry()
                            .with_latency(started.elapsed().as_millis() as u64)
                            .with_status(e.ledger_status())
                            .with_error(&e.message),
                    );
                    if e.kind == ProviderErrorKind::Cancelled {
                        let _ = err_tx.send(GatewayError::Cancelled).await;
                        return;
                    }
                    let mapped = GatewayError::from_provider(&name, &e);
                    if e.is_transient() {
                        warn!(provider = %name, error = %e, "stream open failed — trying next candidate");
                        last_err = Some(mapped);
                        continue;
                    }
                    let _ = err_tx.send(mapped).await;
                    return;
                }
            };

            // The commit barrier: once one chunk reaches the caller there is
            // no provider switch.
            let mut committed = false;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        // Caller-initiated: clean terminal, never an error chunk.
                        self.latency.record(&name, started.elapsed());
                        self.ledger.record(
                            entry()
                                .with_latency(started.elapsed().as_millis() as u64)
                                .with_status(499)
                                .with_error("cancelled"),
                        );
                        let _ = chunk_tx
                            .send(StreamChunk::terminal(uuid::Uuid::new_v4().to_string(), None))
                            .await;
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        self.latency.record(&name, started.elapsed());
                        self.ledger.record(
                            entry()
                                .with_latency(started.elapsed().as_millis() as u64)
                                .with_status(504)
                                .with_error("stream deadline exceeded"),
                        );
                        if committed {
                            let _ = chunk_tx
                                .send(
                                    StreamChunk::terminal_error(
                                        uuid::Uuid::new_v4().to_string(),
                                        "stream deadline exceeded",
                                    )
                                    .with_provider(&name),
                                )
                                .await;
                        } else {
                            let _ = err_tx
                                .send(GatewayError::ProviderTransient {
                                    provider: name.clone(),
                                    message: "stream deadline exceeded".into(),
                                })
                                .await;
                        }
                        return;
                    }
                    chunk = upstream.chunks.recv() => match chunk {
                        Some(chunk) => {
                            let terminal = chunk.done;
                            let usage = chunk.usage;
                            if chunk_tx.send(chunk.with_provider(&name)).await.is_err() {
                                // Caller went away without cancelling; abandon
                                // the upstream promptly.
                                cancel.cancel();
                                self.ledger.record(
                                    entry()
                                        .with_latency(started.elapsed().as_millis() as u64)
                                        .with_status(499)
                                        .with_error("client disconnected"),
                                );
                                return;
                            }
                            committed = true;
                            if terminal {
                                let elapsed = started.elapsed();
                                self.latency.record(&name, elapsed);
                                let usage = usage.unwrap_or_default();
                                self.ledger.record(
                                    entry()
                                        .with_usage(&usage)
                                        .with_cost(self.cost.actual(&name, &req.model, &usage))
                                        .with_latency(elapsed.as_millis() as u64)
                                        .with_status(200),
                                );
                                return;
                            }
                        }
                        None => {
                            // Chunk pipe closed without a terminal chunk: the
                            // producer reported an error (or died silently).
                            let failure = upstream.errors.try_recv().ok();
                            self.latency.record(&name, started.elapsed());
                            match failure {
                                Some(e) => {
                                    self.ledger.record(
                                        entry()
                                            .with_latency(started.elapsed().as_millis() as u64)
                                            .with_status(e.ledger_status())
                                            .with_error(&e.message),
                                    );
                                    if committed {
                                        let _ = chunk_tx
                                            .send(
                                                StreamChunk::terminal_error(
                                                    uuid::Uuid::new_v4().to_string(),
                                                    &e.message,
                                                )
                                                .with_provider(&name),
                                            )
                                            .await;
                                        return;
                                    }
                                    let mapped = GatewayError::from_provider(&name, &e);
                                    if e.is_transient() {
                                        warn!(provider = %name, error = %e, "stream failed before commit — trying next candidate");
                                        last_err = Some(mapped);
                                        break; // next candidate
                                    }
                                    let _ = err_tx.send(mapped).await;
                                    return;
                                }
                                None => {
                                    // Silent close: synthesize a clean terminal.
                                    self.ledger.record(
                                        entry()
                                            .with_latency(started.elapsed().as_millis() as u64)
                                            .with_status(200),
                                    );
                                    let _ = chunk_tx
                                        .send(
                                            StreamChunk::terminal(
                                                uuid::Uuid::new_v4().to_string(),
                                                None,
                                            )
                                            .with_provider(&name),
                                        )
                                        .await;
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }

        let _ = err_tx
            .send(last_err.unwrap_or_else(|| {
                GatewayError::NoProvider("all candidates exhausted".into())
            }))
            .await;
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::config::PricingRow;
    use crate::ledger::RequestKind;
    use crate::providers::StreamProducer;
    use crate::routing::strategy::RuleCondition;
    use crate::schema::{Message, ResponseChoice, Role};
    use crate::store::memory::MemoryStore;
    use crate::store::StoredProviderKey;

    /// Scripted in-memory provider for router tests.
    struct StubProvider {
        name: String,
        models: Vec<String>,
        requires_key: bool,
        server_key: bool,
        chat_calls: AtomicUsize,
        stream_calls: AtomicUsize,
        seen_keys: Mutex<Vec<Option<String>>>,
        chat_script: Mutex<VecDeque<Result<ChatResponse, ProviderError>>>,
        stream_script: Mutex<VecDeque<StreamAct>>,
    }

    enum StreamAct {
        FailOpen(ProviderError),
        /// Emit these deltas, then finish with a terminal chunk or an error.
        Play(Vec<&'static str>, Option<ProviderError>),
    }

    impl StubProvider {
        fn new(name: &str, models: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                models: models.iter().map(|s| s.to_string()).collect(),
                requires_key: false,
                server_key: false,
                chat_calls: AtomicUsize::new(0),
                stream_calls: AtomicUsize::new(0),
                seen_keys: Mutex::new(Vec::new()),
                chat_script: Mutex::new(VecDeque::new()),
                stream_script: Mutex::new(VecDeque::new()),
            })
        }

        fn keyed(name: &str, models: &[&str], server_key: bool) -> Arc<Self> {
            let mut stub = Self::new(name, models);
            {
                let inner = Arc::get_mut(&mut stub).unwrap();
                inner.requires_key = true;
                inner.server_key = server_key;
            }
            stub
        }

        fn ok_response(self: &Arc<Self>, content: &str, usage: Usage) -> &Arc<Self> {
            self.chat_script.lock().unwrap().push_back(Ok(ChatResponse {
                id: "resp-1".into(),
                model: self.models[0].clone(),
                provider: self.name.clone(),
                choices: vec![ResponseChoice {
                    message: Message::text(Role::Assistant, content),
                }],
                usage,
                cost: 0.0,
                latency_ms: 0,
            }));
            self
        }

        fn fail_with(self: &Arc<Self>, err: ProviderError) -> &Arc<Self> {
            self.chat_script.lock().unwrap().push_back(Err(err));
            self
        }

        fn stream_play(
            self: &Arc<Self>,
            deltas: Vec<&'static str>,
            end: Option<ProviderError>,
        ) -> &Arc<Self> {
            self.stream_script.lock().unwrap().push_back(StreamAct::Play(deltas, end));
            self
        }

        fn stream_fail_open(self: &Arc<Self>, err: ProviderError) -> &Arc<Self> {
            self.stream_script.lock().unwrap().push_back(StreamAct::FailOpen(err));
            self
        }
    }

    #[async_trait::async_trait]
    impl ChatProvider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }
        fn supports_streaming(&self) -> bool {
            true
        }
        fn requires_key(&self) -> bool {
            self.requires_key
        }
        fn has_server_key(&self) -> bool {
            self.server_key
        }
        async fn models(&self) -> Vec<String> {
            self.models.clone()
        }
        async fn health_check(&self) -> Result<(), ProviderError> {
            Ok(())
        }
        async fn chat(
            &self,
            _req: &ChatRequest,
            api_key: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<ChatResponse, ProviderError> {
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_keys.lock().unwrap().push(api_key.map(String::from));
            self.chat_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProviderError::status(500, "unscripted")))
        }
        async fn chat_stream(
            &self,
            _req: &ChatRequest,
            api_key: Option<&str>,
            _cancel: &CancellationToken,
        ) -> Result<ProviderStream, ProviderError> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_keys.lock().unwrap().push(api_key.map(String::from));
            let act = self
                .stream_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(StreamAct::FailOpen(ProviderError::status(500, "unscripted")));
            match act {
                StreamAct::FailOpen(e) => Err(e),
                StreamAct::Play(deltas, end) => {
                    let (producer, stream) = ProviderStream::pipe();
                    tokio::spawn(play_stream(producer, deltas, end));
                    Ok(stream)
                }
            }
        }
    }

    async fn play_stream(
        producer: StreamProducer,
        deltas: Vec<&'static str>,
        end: Option<ProviderError>,
    ) {
        for delta in deltas {
            if !producer.send(StreamChunk::delta("s1", delta)).await {
                return;
            }
        }
        match end {
            Some(e) => producer.fail(e).await,
            None => {
                let _ = producer
                    .send(StreamChunk::terminal("s1", Some(Usage::new(10, 5))))
                    .await;
            }
        }
    }

    struct Fixture {
        router: Arc<Router>,
        store: Arc<MemoryStore>,
        cipher: KeyCipher,
    }

    /// Coerce concrete stubs into registry trait objects.
    fn stubs(list: Vec<Arc<StubProvider>>) -> Vec<Arc<dyn ChatProvider>> {
        list.into_iter().map(|p| p as Arc<dyn ChatProvider>).collect()
    }

    fn fixture(providers: Vec<Arc<dyn ChatProvider>>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cost = Arc::new(CostTable::new(
            &[
                PricingRow {
                    provider: "openai".into(),
                    model: "gpt-4".into(),
                    input_cost_per_1k: 0.01,
                    output_cost_per_1k: 0.03,
                },
                PricingRow {
                    provider: "b".into(),
                    model: "m".into(),
                    input_cost_per_1k: 0.001,
                    output_cost_per_1k: 0.001,
                },
            ],
            1_024,
        ));
        let latency = Arc::new(LatencyTracker::new(100));
        let ledger = RequestLedger::start(store.clone(), 256);
        let cipher = KeyCipher::from_base64(
            &base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [9u8; 32]),
        )
        .unwrap();
        let router = RouterBuilder::new(
            cost,
            latency,
            store.clone(),
            store.clone(),
            store.clone(),
            ledger,
        )
        .providers(providers)
        .cipher(Some(cipher.clone()))
        .build();
        Fixture { router, store, cipher }
    }

    fn request(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.into(),
            messages: vec![Message::text(Role::User, "hi")],
            temperature: None,
            max_tokens: None,
            stream: None,
            tools: None,
            user_id: None,
            conversation_id: None,
        }
    }

    async fn wait_for_ledger(store: &MemoryStore, count: usize) -> Vec<LedgerEntry> {
        for _ in 0..100 {
            let entries = store.ledger_entries().await;
            if entries.len() >= count {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store.ledger_entries().await
    }

    // ── buffered routing ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn single_provider_round_trip_attaches_cost_and_provider() {
        let openai = StubProvider::new("openai", &["gpt-4"]);
        openai.ok_response("hello", Usage::new(10, 5));
        let fx = fixture(stubs(vec![openai.clone()]));

        let resp = fx
            .router
            .route(&request("gpt-4"), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resp.provider, "openai");
        assert_eq!(resp.content(), Some("hello"));
        let expected_cost = (10.0 * 0.01 + 5.0 * 0.03) / 1_000.0;
        assert!((resp.cost - expected_cost).abs() < 1e-12);

        let entries = wait_for_ledger(&fx.store, 1).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status_code, 200);
        assert_eq!(entries[0].total_tokens, 15);
    }

    #[tokio::test]
    async fn transient_failure_falls_back_and_writes_two_ledger_rows() {
        let a = StubProvider::new("a", &["m"]);
        a.fail_with(ProviderError::status(502, "bad gateway"));
        let b = StubProvider::new("b", &["m"]);
        b.ok_response("from b", Usage::new(1, 1));
        let fx = fixture(stubs(vec![a.clone(), b.clone()]));

        let resp = fx
            .router
            .route(&request("m"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.provider, "b");
        assert_eq!(a.chat_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.chat_calls.load(Ordering::SeqCst), 1);

        let entries = wait_for_ledger(&fx.store, 2).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status_code, 502);
        assert_eq!(entries[0].provider, "a");
        assert_eq!(entries[1].status_code, 200);
        assert_eq!(entries[1].provider, "b");
        let gap = (entries[1].created_at - entries[0].created_at).num_milliseconds();
        assert!(gap >= 0 && gap <= 50, "attempt rows should be near-simultaneous, gap {gap}ms");
    }

    #[tokio::test]
    async fn permanent_failure_stops_the_walk() {
        let a = StubProvider::new("a", &["m"]);
        a.fail_with(ProviderError::status(400, "bad request"));
        let b = StubProvider::new("b", &["m"]);
        b.ok_response("never", Usage::default());
        let fx = fixture(stubs(vec![a.clone(), b.clone()]));

        let err = fx
            .router
            .route(&request("m"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider_permanent");
        assert_eq!(b.chat_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exhausted_candidates_return_last_error() {
        let a = StubProvider::new("a", &["m"]);
        a.fail_with(ProviderError::status(503, "down"));
        let b = StubProvider::new("b", &["m"]);
        b.fail_with(ProviderError::status(502, "also down"));
        let fx = fixture(stubs(vec![a, b]));

        let err = fx
            .router
            .route(&request("m"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "provider_transient");
        assert!(err.to_string().contains("also down"));
    }

    #[tokio::test]
    async fn unknown_model_is_no_provider() {
        let a = StubProvider::new("a", &["m"]);
        let fx = fixture(stubs(vec![a]));
        let err = fx
            .router
            .route(&request("other"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_provider");
    }

    #[tokio::test]
    async fn keyed_provider_without_any_credential_is_ineligible() {
        let a = StubProvider::keyed("a", &["m"], false);
        let fx = fixture(stubs(vec![a]));
        let err = fx
            .router
            .route(&request("m"), Some("alice"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_provider");
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_selection() {
        let fx = fixture(stubs(vec![StubProvider::new("a", &["m"])]));
        let mut req = request("m");
        req.messages.clear();
        let err = fx
            .router
            .route(&req, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    // ── custom rules (S3) ────────────────────────────────────────────────────

    #[tokio::test]
    async fn custom_rule_beats_default_ordering() {
        let a = StubProvider::new("a", &["m", "n"]);
        a.ok_response("from a", Usage::default());
        let b = StubProvider::new("b", &["m"]);
        b.ok_response("from b", Usage::default());
        let fx = fixture(stubs(vec![a.clone(), b.clone()]));

        fx.store
            .save_rules(
                vec![RoutingRule {
                    name: "prefer-b".into(),
                    condition: RuleCondition::Model { model: "m".into() },
                    target_provider: "b".into(),
                    priority: 1,
                    enabled: true,
                    scope: RuleScope::Global,
                }],
                RuleScope::Global,
                "admin",
            )
            .await
            .unwrap();
        fx.router.set_default_strategy(Strategy::Custom, "admin").await.unwrap();

        let resp = fx
            .router
            .route(&request("m"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.provider, "b");

        // Model `n` is only advertised by `a` — the rule cannot apply.
        let resp = fx
            .router
            .route(&request("n"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.provider, "a");
    }

    // ── admin lock (S6) ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn lock_forces_default_strategy_and_rejects_user_preference() {
        // Cost ordering picks `cheap`; latency ordering would pick `fast`.
        let cheap = StubProvider::new("b", &["m"]);
        cheap.ok_response("from cheap", Usage::default());
        let fast = StubProvider::new("fast", &["m"]);
        fast.ok_response("from fast", Usage::default());
        let fx = fixture(stubs(vec![fast.clone(), cheap.clone()]));

        // Latency ranking favors `b`; cost ranking favors `fast` (no price
        // row → estimate 0, while `b`/`m` is priced in the fixture table).
        fx.router.latency_tracker().record("fast", Duration::from_millis(900));
        fx.router.latency_tracker().record("b", Duration::from_millis(10));

        fx.router.set_user_strategy("alice", Some(Strategy::Latency)).await.unwrap();
        fx.router.set_default_strategy(Strategy::Cost, "admin").await.unwrap();
        fx.router.set_strategy_lock(true, "admin").await.unwrap();

        // Locked: the user's latency preference is ignored; the admin's cost
        // strategy applies and picks `fast`.
        let resp = fx
            .router
            .route(&request("m"), Some("alice"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.provider, "fast");

        let err = fx
            .router
            .set_user_strategy("alice", Some(Strategy::Balanced))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
    }

    #[tokio::test]
    async fn locked_selection_ignores_user_scoped_rules() {
        let a = StubProvider::new("a", &["m"]);
        a.ok_response("from a", Usage::default());
        let b = StubProvider::new("b", &["m"]);
        b.ok_response("from b", Usage::default());
        let fx = fixture(stubs(vec![a.clone(), b.clone()]));

        fx.store
            .save_rules(
                vec![RoutingRule {
                    name: "alice-prefers-b".into(),
                    condition: RuleCondition::Model { model: "m".into() },
                    target_provider: "b".into(),
                    priority: 1,
                    enabled: true,
                    scope: RuleScope::User("alice".into()),
                }],
                RuleScope::User("alice".into()),
                "alice",
            )
            .await
            .unwrap();
        fx.router.set_default_strategy(Strategy::Custom, "admin").await.unwrap();
        fx.router.set_strategy_lock(true, "admin").await.unwrap();

        let resp = fx
            .router
            .route(&request("m"), Some("alice"), &CancellationToken::new())
            .await
            .unwrap();
        // The user rule is ignored while locked; registration order wins.
        assert_eq!(resp.provider, "a");
    }

    // ── BYOK ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn byok_key_reaches_the_adapter_for_its_owner_only() {
        let p = StubProvider::keyed("openai", &["gpt-4"], true);
        p.ok_response("one", Usage::default());
        p.ok_response("two", Usage::default());
        let fx = fixture(stubs(vec![p.clone()]));

        let sealed = fx.cipher.seal("sk-alice").unwrap();
        fx.store
            .upsert_provider_key(StoredProviderKey {
                user_id: "alice".into(),
                provider: "openai".into(),
                ciphertext: sealed,
                is_active: true,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        fx.router
            .route(&request("gpt-4"), Some("alice"), &CancellationToken::new())
            .await
            .unwrap();
        fx.router
            .route(&request("gpt-4"), Some("bob"), &CancellationToken::new())
            .await
            .unwrap();

        let keys = p.seen_keys.lock().unwrap().clone();
        assert_eq!(keys[0].as_deref(), Some("sk-alice"));
        // Bob has no key: the adapter falls back to its server credential.
        assert_eq!(keys[1], None);
    }

    #[tokio::test]
    async fn byok_makes_a_keyless_server_provider_eligible() {
        let p = StubProvider::keyed("openai", &["gpt-4"], false);
        p.ok_response("ok", Usage::default());
        let fx = fixture(stubs(vec![p.clone()]));

        let sealed = fx.cipher.seal("sk-alice").unwrap();
        fx.store
            .upsert_provider_key(StoredProviderKey {
                user_id: "alice".into(),
                provider: "openai".into(),
                ciphertext: sealed,
                is_active: true,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        // Without the key the provider is ineligible…
        let err = fx
            .router
            .route(&request("gpt-4"), Some("bob"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "no_provider");

        // …and with it the request goes through carrying the user key.
        let resp = fx
            .router
            .route(&request("gpt-4"), Some("alice"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.provider, "openai");
        assert_eq!(p.seen_keys.lock().unwrap()[0].as_deref(), Some("sk-alice"));
    }

    #[tokio::test]
    async fn corrupted_byok_ciphertext_is_an_internal_error() {
        let p = StubProvider::keyed("openai", &["gpt-4"], false);
        let fx = fixture(stubs(vec![p]));
        fx.store
            .upsert_provider_key(StoredProviderKey {
                user_id: "alice".into(),
                provider: "openai".into(),
                ciphertext: "not-a-sealed-key".into(),
                is_active: true,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let err = fx
            .router
            .route(&request("gpt-4"), Some("alice"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    // ── streaming (S4 + commit barrier) ──────────────────────────────────────

    async fn collect(stream: &mut RoutedStream) -> (Vec<StreamChunk>, Option<GatewayError>) {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.chunks.recv().await {
            chunks.push(chunk);
        }
        let err = stream.errors.try_recv().ok();
        (chunks, err)
    }

    #[tokio::test]
    async fn committed_stream_error_terminates_without_provider_switch() {
        let a = StubProvider::new("a", &["m"]);
        a.stream_play(vec!["partial"], Some(ProviderError::status(502, "upstream died")));
        let b = StubProvider::new("b", &["m"]);
        b.stream_play(vec!["never"], None);
        let fx = fixture(stubs(vec![a.clone(), b.clone()]));

        let mut stream = fx
            .router
            .route_stream(request("m"), None, RequestKind::ChatStream, CancellationToken::new())
            .await
            .unwrap();
        let (chunks, err) = collect(&mut stream).await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "partial");
        assert!(chunks[1].done);
        assert!(chunks[1].error.as_deref().unwrap().contains("upstream died"));
        assert!(err.is_none());
        assert_eq!(b.stream_calls.load(Ordering::SeqCst), 0, "no switch after commit");
    }

    #[tokio::test]
    async fn pre_commit_failure_falls_back_to_next_provider() {
        let a = StubProvider::new("a", &["m"]);
        a.stream_fail_open(ProviderError::status(503, "cold"));
        let b = StubProvider::new("b", &["m"]);
        b.stream_play(vec!["He", "llo"], None);
        let fx = fixture(stubs(vec![a.clone(), b.clone()]));

        let mut stream = fx
            .router
            .route_stream(request("m"), None, RequestKind::ChatStream, CancellationToken::new())
            .await
            .unwrap();
        let (chunks, err) = collect(&mut stream).await;

        assert!(err.is_none());
        let deltas: Vec<&str> =
            chunks.iter().filter(|c| !c.done).map(|c| c.content.as_str()).collect();
        assert_eq!(deltas, vec!["He", "llo"]);
        assert_eq!(chunks.last().unwrap().provider.as_deref(), Some("b"));
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    }

    #[tokio::test]
    async fn zero_chunk_error_stream_also_falls_back() {
        // Producer opens fine but errors before any chunk.
        let a = StubProvider::new("a", &["m"]);
        a.stream_play(vec![], Some(ProviderError::status(500, "boom")));
        let b = StubProvider::new("b", &["m"]);
        b.stream_play(vec!["ok"], None);
        let fx = fixture(stubs(vec![a, b.clone()]));

        let mut stream = fx
            .router
            .route_stream(request("m"), None, RequestKind::ChatStream, CancellationToken::new())
            .await
            .unwrap();
        let (chunks, err) = collect(&mut stream).await;
        assert!(err.is_none());
        assert_eq!(chunks[0].content, "ok");
        assert_eq!(b.stream_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_stream_candidates_surface_one_error() {
        let a = StubProvider::new("a", &["m"]);
        a.stream_fail_open(ProviderError::status(503, "down"));
        let fx = fixture(stubs(vec![a]));

        let mut stream = fx
            .router
            .route_stream(request("m"), None, RequestKind::ChatStream, CancellationToken::new())
            .await
            .unwrap();
        let (chunks, err) = collect(&mut stream).await;
        assert!(chunks.is_empty());
        assert_eq!(err.expect("error should surface").kind(), "provider_transient");
    }

    #[tokio::test]
    async fn cancellation_yields_clean_terminal_and_cancelled_ledger_row() {
        // An endless producer: one delta, then silence until cancelled.
        struct Hanging {
            name: String,
        }
        #[async_trait::async_trait]
        impl ChatProvider for Hanging {
            fn name(&self) -> &str {
                &self.name
            }
            fn supports_streaming(&self) -> bool {
                true
            }
            fn requires_key(&self) -> bool {
                false
            }
            fn has_server_key(&self) -> bool {
                false
            }
            async fn models(&self) -> Vec<String> {
                vec!["m".into()]
            }
            async fn health_check(&self) -> Result<(), ProviderError> {
                Ok(())
            }
            async fn chat(
                &self,
                _req: &ChatRequest,
                _key: Option<&str>,
                _cancel: &CancellationToken,
            ) -> Result<ChatResponse, ProviderError> {
                Err(ProviderError::status(500, "buffered unsupported"))
            }
            async fn chat_stream(
                &self,
                _req: &ChatRequest,
                _key: Option<&str>,
                cancel: &CancellationToken,
            ) -> Result<ProviderStream, ProviderError> {
                let (producer, stream) = ProviderStream::pipe();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _ = producer.send(StreamChunk::delta("h1", "start")).await;
                    // Hold the stream open until cancellation.
                    cancel.cancelled().await;
                });
                Ok(stream)
            }
        }

        let fx = fixture(vec![Arc::new(Hanging { name: "hang".into() }) as Arc<dyn ChatProvider>]);
        let cancel = CancellationToken::new();
        let mut stream = fx
            .router
            .route_stream(request("m"), None, RequestKind::ChatStream, cancel.clone())
            .await
            .unwrap();

        let first = stream.chunks.recv().await.unwrap();
        assert_eq!(first.content, "start");

        cancel.cancel();
        let terminal = stream.chunks.recv().await.unwrap();
        assert!(terminal.done);
        assert!(terminal.error.is_none(), "caller-initiated cancel is never an error");
        assert!(stream.chunks.recv().await.is_none());

        let entries = wait_for_ledger(&fx.store, 1).await;
        assert_eq!(entries[0].status_code, 499);
        assert_eq!(entries[0].error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn stream_ledger_row_carries_terminal_usage_and_cost() {
        let p = StubProvider::new("openai", &["gpt-4"]);
        p.stream_play(vec!["hi"], None); // terminal usage 10/5
        let fx = fixture(stubs(vec![p]));

        let mut stream = fx
            .router
            .route_stream(
                request("gpt-4"),
                Some("alice".into()),
                RequestKind::ChatWebsocket,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let (chunks, _) = collect(&mut stream).await;
        assert!(chunks.last().unwrap().done);

        let entries = wait_for_ledger(&fx.store, 1).await;
        assert_eq!(entries[0].request_type, RequestKind::ChatWebsocket);
        assert_eq!(entries[0].total_tokens, 15);
        assert_eq!(entries[0].user_id.as_deref(), Some("alice"));
        let expected_cost = (10.0 * 0.01 + 5.0 * 0.03) / 1_000.0;
        assert!((entries[0].cost - expected_cost).abs() < 1e-12);
    }

    // ── listing ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn provider_listing_respects_credentials() {
        let keyless = StubProvider::new("local", &["m"]);
        let keyed_with = StubProvider::keyed("cloud", &["m"], true);
        let keyed_without = StubProvider::keyed("cloud2", &["m"], false);
        let fx = fixture(stubs(vec![keyless, keyed_with, keyed_without]));

        let listed = fx.router.list_providers_for(None).await.unwrap();
        let names: Vec<&str> = listed.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["local", "cloud"]);

        // Alice holds a BYOK key for cloud2 — it appears for her.
        let sealed = fx.cipher.seal("sk-a").unwrap();
        fx.store
            .upsert_provider_key(StoredProviderKey {
                user_id: "alice".into(),
                provider: "cloud2".into(),
                ciphertext: sealed,
                is_active: true,
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let listed = fx.router.list_providers_for(Some("alice")).await.unwrap();
        let names: Vec<&str> = listed.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["local", "cloud", "cloud2"]);
        assert!(listed[2].has_user_key);
    }

    #[tokio::test]
    async fn registry_replacement_affects_subsequent_requests_only() {
        let a = StubProvider::new("a", &["m"]);
        a.ok_response("from a", Usage::default());
        let fx = fixture(stubs(vec![a]));

        let b = StubProvider::new("b", &["m"]);
        b.ok_response("from b", Usage::default());
        fx.router.replace_providers(stubs(vec![b]));

        let resp = fx
            .router
            .route(&request("m"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.provider, "b");
    }
}

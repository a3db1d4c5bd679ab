//! Best-effort request ledger.
//!
//! [`RequestLedger::record`] enqueues onto a bounded in-memory queue and
//! never blocks the request path; a background worker drains the queue in
//! batches and writes them through the [`LedgerStore`] collaborator with a
//! per-batch timeout. Queue overflow evicts the oldest entry and bumps a
//! counter; store failures are logged and the batch is discarded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

use crate::schema::Usage;
use crate::store::LedgerStore;

/// Which surface served the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Chat,
    ChatStream,
    ChatWebsocket,
}

/// One per-attempt accounting record. A fallback walk produces one entry per
/// provider attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub api_key_id: Option<String>,
    pub user_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub request_type: RequestKind,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub cost: f64,
    pub latency_ms: u64,
    pub status_code: u16,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(provider: &str, model: &str, request_type: RequestKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            api_key_id: None,
            user_id: None,
            provider: provider.to_string(),
            model: model.to_string(),
            request_type,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cost: 0.0,
            latency_ms: 0,
            status_code: 0,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: Option<&str>) -> Self {
        self.user_id = user_id.map(String::from);
        self
    }

    pub fn with_usage(mut self, usage: &Usage) -> Self {
        self.input_tokens = usage.prompt_tokens;
        self.output_tokens = usage.completion_tokens;
        self.total_tokens = usage.total_tokens;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_error(mut self, message: &str) -> Self {
        self.error_message = Some(message.to_string());
        self
    }
}

/// Maximum entries drained per store write.
const BATCH_SIZE: usize = 64;

/// Per-batch store write deadline.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct LedgerInner {
    queue: Mutex<VecDeque<LedgerEntry>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

/// Handle used by the request path. Clone freely; all clones share one queue
/// and one background worker.
#[derive(Clone)]
pub struct RequestLedger {
    inner: Arc<LedgerInner>,
}

impl RequestLedger {
    /// Create the ledger and spawn its background worker.
    pub fn start(store: Arc<dyn LedgerStore>, capacity: usize) -> Self {
        let inner = Arc::new(LedgerInner {
            queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        });
        tokio::spawn(worker(Arc::clone(&inner), store));
        Self { inner }
    }

    /// Enqueue one entry. Never blocks; overflow evicts the oldest entry.
    pub fn record(&self, entry: LedgerEntry) {
        {
            let mut queue = self.inner.queue.lock().expect("ledger queue lock poisoned");
            if queue.len() == self.inner.capacity {
                queue.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(entry);
        }
        self.inner.notify.notify_one();
    }

    /// Entries evicted due to queue overflow since startup.
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Entries currently waiting for the worker.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().expect("ledger queue lock poisoned").len()
    }
}

/// Drain loop: wake on notify, write batches until the queue is empty.
async fn worker(inner: Arc<LedgerInner>, store: Arc<dyn LedgerStore>) {
    loop {
        inner.notify.notified().await;
        loop {
            let batch: Vec<LedgerEntry> = {
                let mut queue = inner.queue.lock().expect("ledger queue lock poisoned");
                let n = queue.len().min(BATCH_SIZE);
                queue.drain(..n).collect()
            };
            if batch.is_empty() {
                break;
            }
            match tokio::time::timeout(WRITE_TIMEOUT, store.create(&batch)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(count = batch.len(), error = %e, "ledger batch write failed — dropping batch");
                }
                Err(_) => {
                    warn!(count = batch.len(), "ledger batch write timed out — dropping batch");
                }
            }
        }
    }
}

//! Per-request cost estimation and realization.
//!
//! A `(provider, model)` price table is seeded at startup from the built-in
//! rates merged with `[[pricing]]` config rows (config wins), and can be
//! updated at runtime under a write lock. Unknown pairs cost 0 and log once
//! per tuple — local backends simply have no rows.

use std::collections::HashMap;
use std::sync::RwLock;

use dashmap::DashSet;
use serde::Serialize;
use tracing::warn;

use crate::config::PricingRow;
use crate::schema::{ChatRequest, Usage};

/// USD per 1 000 tokens for one (provider, model) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPrice {
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

/// Rough characters-per-token ratio used by [`CostTable::estimate`].
const CHARS_PER_TOKEN: usize = 4;

/// Built-in price seed for the common hosted models. Config rows override.
fn builtin_prices() -> Vec<(&'static str, &'static str, f64, f64)> {
    vec![
        ("openai", "gpt-4o", 0.0025, 0.01),
        ("openai", "gpt-4o-mini", 0.00015, 0.0006),
        ("openai", "gpt-4.1", 0.002, 0.008),
        ("openai", "gpt-4.1-mini", 0.0004, 0.0016),
        ("anthropic", "claude-sonnet-4-20250514", 0.003, 0.015),
        ("anthropic", "claude-haiku-4-5-20251001", 0.001, 0.005),
        ("google", "gemini-2.0-flash", 0.0001, 0.0004),
        ("google", "gemini-1.5-pro", 0.00125, 0.005),
    ]
}

/// Read-mostly price table with one-shot warnings for unknown tuples.
pub struct CostTable {
    prices: RwLock<HashMap<(String, String), ModelPrice>>,
    warned: DashSet<(String, String)>,
    default_output_tokens: u32,
}

impl CostTable {
    /// Seed from built-ins plus config rows; config rows override built-ins.
    pub fn new(rows: &[PricingRow], default_output_tokens: u32) -> Self {
        let mut prices: HashMap<(String, String), ModelPrice> = builtin_prices()
            .into_iter()
            .map(|(p, m, i, o)| {
                ((p.to_string(), m.to_string()), ModelPrice {
                    input_cost_per_1k: i,
                    output_cost_per_1k: o,
                })
            })
            .collect();
        for row in rows {
            prices.insert(
                (row.provider.clone(), row.model.clone()),
                ModelPrice {
                    input_cost_per_1k: row.input_cost_per_1k,
                    output_cost_per_1k: row.output_cost_per_1k,
                },
            );
        }
        Self {
            prices: RwLock::new(prices),
            warned: DashSet::new(),
            default_output_tokens,
        }
    }

    fn price(&self, provider: &str, model: &str) -> Option<ModelPrice> {
        self.prices
            .read()
            .expect("price table lock poisoned")
            .get(&(provider.to_string(), model.to_string()))
            .copied()
    }

    fn warn_once(&self, provider: &str, model: &str) {
        let key = (provider.to_string(), model.to_string());
        if self.warned.insert(key) {
            warn!(provider, model, "no price row — treating cost as 0");
        }
    }

    /// Pre-call approximation: input tokens ≈ total characters / 4, output
    /// assumed to be the request's `max_tokens` (or the configured default).
    pub fn estimate(&self, provider: &str, model: &str, req: &ChatRequest) -> f64 {
        let Some(price) = self.price(provider, model) else {
            self.warn_once(provider, model);
            return 0.0;
        };
        let input_tokens = (req.char_count() / CHARS_PER_TOKEN) as f64;
        let output_tokens = req.max_tokens.unwrap_or(self.default_output_tokens) as f64;
        (input_tokens * price.input_cost_per_1k + output_tokens * price.output_cost_per_1k)
            / 1_000.0
    }

    /// Exact post-call cost from upstream-reported usage.
    pub fn actual(&self, provider: &str, model: &str, usage: &Usage) -> f64 {
        let Some(price) = self.price(provider, model) else {
            self.warn_once(provider, model);
            return 0.0;
        };
        (usage.prompt_tokens as f64 * price.input_cost_per_1k
            + usage.completion_tokens as f64 * price.output_cost_per_1k)
            / 1_000.0
    }

    /// Insert or replace a price row at runtime.
    pub fn set_price(&self, provider: &str, model: &str, price: ModelPrice) {
        self.prices
            .write()
            .expect("price table lock poisoned")
            .insert((provider.to_string(), model.to_string()), price);
    }

    /// Snapshot of all rows, sorted, for the admin API.
    pub fn rows(&self) -> Vec<(String, String, ModelPrice)> {
        let table = self.prices.read().expect("price table lock poisoned");
        let mut rows: Vec<_> = table
            .iter()
            .map(|((p, m), price)| (p.clone(), m.clone(), *price))
            .collect();
        rows.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        rows
    }
}

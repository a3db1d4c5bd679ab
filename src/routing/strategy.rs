//! The strategy engine — a pure, deterministic ranking function.
//!
//! Given the eligible candidates (already filtered to providers that
//! advertise the requested model and hold a usable credential) plus their
//! telemetry snapshot, `rank` returns an ordered fallback list. All I/O —
//! registry reads, store fetches, telemetry lookups — happens in the router
//! before this module is consulted, which keeps every ranking decision
//! reproducible from its inputs.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// How eligible providers are ordered for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Providers advertising the model, in registration order.
    #[default]
    Model,
    /// Ascending estimated cost.
    Cost,
    /// Ascending average latency.
    Latency,
    /// Weighted blend of normalized cost and latency.
    Balanced,
    /// Operator-defined rules, falling back to the default strategy.
    Custom,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Model => "model",
            Self::Cost => "cost",
            Self::Latency => "latency",
            Self::Balanced => "balanced",
            Self::Custom => "custom",
        })
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(Self::Model),
            "cost" => Ok(Self::Cost),
            "latency" => Ok(Self::Latency),
            "balanced" => Ok(Self::Balanced),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown strategy `{other}`")),
        }
    }
}

/// Condition of a custom routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition_type", content = "condition_value", rename_all = "snake_case")]
pub enum RuleCondition {
    /// The request's model equals `model`.
    Model { model: String },
    /// The target's estimated cost for this request is at most `max_cost`.
    CostThreshold { max_cost: f64 },
    /// The target's average latency is at most `max_latency_ms`.
    LatencyThreshold { max_latency_ms: u64 },
}

/// Who a rule applies to. Serializes as `"global"` or `{"user": "<id>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    #[default]
    Global,
    User(String),
}

/// One custom routing rule. Lower `priority` wins; evaluation order is
/// stable by `(priority, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub name: String,
    #[serde(flatten)]
    pub condition: RuleCondition,
    pub target_provider: String,
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: RuleScope,
}

fn default_enabled() -> bool {
    true
}

impl RoutingRule {
    fn applies_to(&self, user_id: Option<&str>) -> bool {
        match &self.scope {
            RuleScope::Global => true,
            RuleScope::User(uid) => user_id == Some(uid.as_str()),
        }
    }
}

/// One eligible provider plus the telemetry snapshot the ranking needs.
///
/// `order` is the provider's position in the registry — the deterministic
/// tie-breaker everywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub name: String,
    pub order: usize,
    /// Estimated request cost in USD (0 for local/unpriced providers).
    pub cost_estimate: f64,
    /// Average latency in milliseconds; `+∞` when no samples exist.
    pub avg_latency_ms: f64,
}

/// Request-scoped inputs that parameterize a ranking.
#[derive(Debug, Clone)]
pub struct RankInputs<'a> {
    pub request_model: &'a str,
    pub user_id: Option<&'a str>,
    /// Fallback strategy for `Custom` (and the strategy's own tie rules).
    pub default_strategy: Strategy,
    /// Active rules, scope-unfiltered; `rank` applies scope itself.
    pub rules: &'a [RoutingRule],
    pub cost_weight: f64,
    pub latency_weight: f64,
}

/// Rank eligible candidates into an ordered fallback list of provider names.
///
/// Deterministic: identical inputs produce identical output. No randomness,
/// no clock reads.
pub fn rank(candidates: &[Candidate], strategy: Strategy, inputs: &RankInputs<'_>) -> Vec<String> {
    match strategy {
        Strategy::Model => by_registration(candidates),
        Strategy::Cost => by_cost(candidates),
        Strategy::Latency => by_latency(candidates),
        Strategy::Balanced => by_balanced(candidates, inputs.cost_weight, inputs.latency_weight),
        Strategy::Custom => by_rules(candidates, inputs),
    }
}

fn by_registration(candidates: &[Candidate]) -> Vec<String> {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by_key(|c| c.order);
    sorted.into_iter().map(|c| c.name.clone()).collect()
}

fn by_cost(candidates: &[Candidate]) -> Vec<String> {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        float_cmp(a.cost_estimate, b.cost_estimate).then_with(|| a.order.cmp(&b.order))
    });
    sorted.into_iter().map(|c| c.name.clone()).collect()
}

fn by_latency(candidates: &[Candidate]) -> Vec<String> {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|a, b| {
        float_cmp(a.avg_latency_ms, b.avg_latency_ms)
            .then_with(|| float_cmp(a.cost_estimate, b.cost_estimate))
            .then_with(|| a.order.cmp(&b.order))
    });
    sorted.into_iter().map(|c| c.name.clone()).collect()
}

fn by_balanced(candidates: &[Candidate], cost_weight: f64, latency_weight: f64) -> Vec<String> {
    let total = cost_weight + latency_weight;
    let (wc, wl) = if total > 0.0 {
        (cost_weight / total, latency_weight / total)
    } else {
        (0.5, 0.5)
    };

    let costs: Vec<f64> = candidates.iter().map(|c| c.cost_estimate).collect();
    let latencies: Vec<f64> = candidates.iter().map(|c| c.avg_latency_ms).collect();

    let mut scored: Vec<(&Candidate, f64)> = candidates
        .iter()
        .map(|c| {
            let score = wc * min_max_normalize(c.cost_estimate, &costs)
                + wl * min_max_normalize(c.avg_latency_ms, &latencies);
            (c, score)
        })
        .collect();
    scored.sort_by(|a, b| float_cmp(a.1, b.1).then_with(|| a.0.order.cmp(&b.0.order)));
    scored.into_iter().map(|(c, _)| c.name.clone()).collect()
}

/// Min-max normalize over the finite values of the eligible set.
/// Infinite inputs (providers without latency samples) score worst.
fn min_max_normalize(value: f64, all: &[f64]) -> f64 {
    if !value.is_finite() {
        return 1.0;
    }
    let finite: Vec<f64> = all.iter().copied().filter(|v| v.is_finite()).collect();
    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !min.is_finite() || max <= min {
        return 0.0;
    }
    (value - min) / (max - min)
}

fn by_rules(candidates: &[Candidate], inputs: &RankInputs<'_>) -> Vec<String> {
    // A default strategy of `custom` would recurse; fall back to `model`.
    let fallback = match inputs.default_strategy {
        Strategy::Custom => Strategy::Model,
        s => s,
    };

    let mut rules: Vec<&RoutingRule> = inputs
        .rules
        .iter()
        .filter(|r| r.enabled && r.applies_to(inputs.user_id))
        .collect();
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

    for rule in rules {
        let Some(target) = candidates.iter().find(|c| c.name == rule.target_provider) else {
            // Target is not eligible for this request — skip the rule.
            continue;
        };
        let matches = match &rule.condition {
            RuleCondition::Model { model } => inputs.request_model == model,
            RuleCondition::CostThreshold { max_cost } => target.cost_estimate <= *max_cost,
            RuleCondition::LatencyThreshold { max_latency_ms } => {
                target.avg_latency_ms <= *max_latency_ms as f64
            }
        };
        if matches {
            // Rule target first; the rest keep working as fallbacks in
            // default-strategy order so transient failures still recover.
            let rest: Vec<Candidate> = candidates
                .iter()
                .filter(|c| c.name != target.name)
                .cloned()
                .collect();
            let mut ranked = vec![target.name.clone()];
            ranked.extend(rank(&rest, fallback, inputs));
            return ranked;
        }
    }

    rank(candidates, fallback, inputs)
}

fn float_cmp(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

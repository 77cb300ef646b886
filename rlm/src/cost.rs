//! Cost accounting for model calls.
//!
//! All money is kept in micro-dollars so budget comparisons are exact integer
//! arithmetic.

use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::budget::BudgetState;
use crate::error::Result;
use crate::error::RlmError;

pub const MICROS_PER_USD: f64 = 1_000_000.0;

/// Converts a non-negative USD amount to micro-dollars.
pub fn usd_to_micros(usd: f64) -> u64 {
    (usd * MICROS_PER_USD).round() as u64
}

pub fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// Cost per million tokens in micro-dollars.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPricing {
    /// Cost per 1M input tokens.
    pub input_per_m: u64,
    /// Cost per 1M output tokens.
    pub output_per_m: u64,
}

impl TokenPricing {
    pub fn new(input_per_m: u64, output_per_m: u64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Pricing as written in configuration: USD per million tokens.
    pub fn from_usd_per_million(model: &str, input: f64, output: f64) -> Result<Self> {
        for (side, rate) in [("input", input), ("output", output)] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(RlmError::config(
                    format!("pricing.{model}.{side}"),
                    format!("must be a non-negative number, got {rate}"),
                ));
            }
        }
        Ok(Self::new(usd_to_micros(input), usd_to_micros(output)))
    }

    /// Cost of a call, rounded up to the next micro-dollar.
    pub fn calculate(&self, input: u64, output: u64) -> u64 {
        let input_cost = u128::from(input) * u128::from(self.input_per_m);
        let output_cost = u128::from(output) * u128::from(self.output_per_m);
        let micros = (input_cost + output_cost).div_ceil(1_000_000);
        u64::try_from(micros).unwrap_or(u64::MAX)
    }
}

/// Built-in pricing (micro-dollars per 1M tokens). Local models are free.
pub fn default_pricing() -> HashMap<String, TokenPricing> {
    let mut pricing = HashMap::new();

    // Local models served through an OpenAI-compatible gateway
    pricing.insert("qwen2.5-coder:7b".to_string(), TokenPricing::new(0, 0));
    pricing.insert("qwen2.5-coder:32b".to_string(), TokenPricing::new(0, 0));

    // Anthropic models
    pricing.insert(
        "claude-3-5-sonnet".to_string(),
        TokenPricing::new(3_000_000, 15_000_000),
    );
    pricing.insert(
        "claude-3-haiku".to_string(),
        TokenPricing::new(250_000, 1_250_000),
    );

    // OpenAI models
    pricing.insert(
        "gpt-4o".to_string(),
        TokenPricing::new(2_500_000, 10_000_000),
    );
    pricing.insert(
        "gpt-4o-mini".to_string(),
        TokenPricing::new(150_000, 600_000),
    );

    pricing
}

/// Token usage for a single call.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Pre-call token estimate from character counts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TokenEstimator {
    pub chars_per_token: f64,
    pub safety_multiplier: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: 4.0,
            safety_multiplier: 1.2,
        }
    }
}

impl TokenEstimator {
    /// `ceil(chars / chars_per_token * safety_multiplier)`, at least 1.
    pub fn estimate(&self, text: &str) -> u64 {
        let chars = text.chars().count() as f64;
        let estimate = (chars / self.chars_per_token * self.safety_multiplier).ceil() as u64;
        estimate.max(1)
    }

    /// Estimate for a call: the prompt plus the full output allowance.
    pub fn estimate_call(&self, prompt: &str, max_output_tokens: u32) -> TokenUsage {
        TokenUsage::new(self.estimate(prompt), u64::from(max_output_tokens))
    }
}

/// Aggregated cost statistics.
#[derive(Debug, Default)]
pub struct CostStats {
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    total_cost_micros: AtomicU64,
    api_calls: AtomicU64,
}

impl CostStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tokens: &TokenUsage, cost: u64) {
        self.input_tokens
            .fetch_add(tokens.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(tokens.output_tokens, Ordering::Relaxed);
        self.total_cost_micros.fetch_add(cost, Ordering::Relaxed);
        self.api_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CostStatsSnapshot {
        let input_tokens = self.input_tokens.load(Ordering::Relaxed);
        let output_tokens = self.output_tokens.load(Ordering::Relaxed);
        let total_cost_micros = self.total_cost_micros.load(Ordering::Relaxed);
        let api_calls = self.api_calls.load(Ordering::Relaxed);

        CostStatsSnapshot {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            total_cost_micros,
            total_cost_dollars: micros_to_usd(total_cost_micros),
            api_calls,
        }
    }
}

/// Serializable snapshot of cost stats.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CostStatsSnapshot {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost_micros: u64,
    pub total_cost_dollars: f64,
    pub api_calls: u64,
}

/// Budget status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    /// Under the soft limit.
    Ok,
    /// Soft limit crossed.
    Warning,
    /// A hard cap refused a charge.
    Exceeded,
}

/// Per-model call statistics for a session.
///
/// Pricing lookups go through the validated table; the authoritative spend
/// lives in [`crate::budget::BudgetGovernor`].
pub struct CostTracker {
    pricing: HashMap<String, TokenPricing>,
    model_stats: RwLock<HashMap<String, CostStats>>,
    total_stats: CostStats,
}

impl CostTracker {
    pub fn new(pricing: HashMap<String, TokenPricing>) -> Self {
        Self {
            pricing,
            model_stats: RwLock::new(HashMap::new()),
            total_stats: CostStats::new(),
        }
    }

    pub fn pricing_for(&self, model: &str) -> Option<TokenPricing> {
        self.pricing.get(model).copied()
    }

    /// Cost of `tokens` on `model`. Unknown models are a configuration error.
    pub fn cost_of(&self, model: &str, tokens: &TokenUsage) -> Result<u64> {
        let pricing = self.pricing_for(model).ok_or_else(|| {
            RlmError::config(format!("pricing.{model}"), "no pricing entry for model")
        })?;
        Ok(pricing.calculate(tokens.input_tokens, tokens.output_tokens))
    }

    /// Record a committed call.
    pub fn record_call(&self, model: &str, tokens: TokenUsage, cost_micros: u64) {
        self.total_stats.record(&tokens, cost_micros);
        if let Ok(mut stats) = self.model_stats.write() {
            stats
                .entry(model.to_string())
                .or_default()
                .record(&tokens, cost_micros);
        }
    }

    pub fn total_stats(&self) -> CostStatsSnapshot {
        self.total_stats.snapshot()
    }

    pub fn model_stats(&self) -> HashMap<String, CostStatsSnapshot> {
        self.model_stats
            .read()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(k, v)| (k.clone(), v.snapshot()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn report(&self, budget: &BudgetState) -> CostReport {
        let budget_status = if budget.exhausted {
            BudgetStatus::Exceeded
        } else if budget.soft_limit_crossed {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        };
        let budget_remaining_pct = if budget.max_cost_micros == 0 {
            0.0
        } else {
            let remaining = budget.max_cost_micros.saturating_sub(budget.spent_micros);
            (remaining as f64 / budget.max_cost_micros as f64) * 100.0
        };
        CostReport {
            total: self.total_stats(),
            per_model: self.model_stats(),
            budget_remaining_pct,
            budget_status,
        }
    }
}

/// Cost report structure.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CostReport {
    pub total: CostStatsSnapshot,
    pub per_model: HashMap<String, CostStatsSnapshot>,
    pub budget_remaining_pct: f64,
    pub budget_status: BudgetStatus,
}

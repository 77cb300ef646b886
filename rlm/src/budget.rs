//! Budget governor: the single owner of cumulative session spend.
//!
//! Every charge is a two-step exchange. [`BudgetGovernor::propose_charge`]
//! holds an estimate against the remaining headroom before the provider is
//! called; [`Reservation::commit`] swaps the hold for the real usage once it
//! is known. Both steps run under one mutex, so concurrent sub-calls can never
//! be approved against the same headroom.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use anyhow::anyhow;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::cost::TokenPricing;
use crate::cost::TokenUsage;
use crate::cost::micros_to_usd;
use crate::error::BudgetExceededKind;
use crate::error::Result;
use crate::error::RlmError;

/// Hard caps and the soft warning threshold.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BudgetLimits {
    pub max_cost_micros: u64,
    pub max_tokens: u64,
    pub soft_limit_percentage: f64,
}

/// Point-in-time copy of the governor's books.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct BudgetState {
    pub spent_micros: u64,
    pub spent_usd: f64,
    pub tokens_used: u64,
    pub reserved_micros: u64,
    pub reserved_tokens: u64,
    pub max_cost_micros: u64,
    pub max_tokens: u64,
    pub soft_limit_crossed: bool,
    pub exhausted: bool,
    pub committed_charges: u64,
}

impl BudgetState {
    pub fn remaining_micros(&self) -> u64 {
        self.max_cost_micros
            .saturating_sub(self.spent_micros + self.reserved_micros)
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.max_tokens
            .saturating_sub(self.tokens_used + self.reserved_tokens)
    }

    /// One-line summary for prompts.
    pub fn summary(&self) -> String {
        let spent = self.spent_usd;
        let max = micros_to_usd(self.max_cost_micros);
        let tokens = self.tokens_used;
        let max_tokens = self.max_tokens;
        format!("spent=${spent:.4} of ${max:.2}; tokens={tokens} of {max_tokens}")
    }
}

#[derive(Debug, Default)]
struct BudgetBook {
    spent_micros: u64,
    tokens_used: u64,
    reserved_micros: u64,
    reserved_tokens: u64,
    soft_limit_crossed: bool,
    exhausted: bool,
    committed_charges: u64,
}

struct GovernorInner {
    limits: BudgetLimits,
    pricing: HashMap<String, TokenPricing>,
    book: StdMutex<BudgetBook>,
}

impl GovernorInner {
    fn lock(&self) -> Result<MutexGuard<'_, BudgetBook>> {
        self.book
            .lock()
            .map_err(|_| RlmError::Internal(anyhow!("budget lock poisoned")))
    }

    fn snapshot(&self, book: &BudgetBook) -> BudgetState {
        BudgetState {
            spent_micros: book.spent_micros,
            spent_usd: micros_to_usd(book.spent_micros),
            tokens_used: book.tokens_used,
            reserved_micros: book.reserved_micros,
            reserved_tokens: book.reserved_tokens,
            max_cost_micros: self.limits.max_cost_micros,
            max_tokens: self.limits.max_tokens,
            soft_limit_crossed: book.soft_limit_crossed,
            exhausted: book.exhausted,
            committed_charges: book.committed_charges,
        }
    }

    fn price(&self, model_id: &str, usage: &TokenUsage) -> Result<u64> {
        let pricing = self.pricing.get(model_id).ok_or_else(|| {
            RlmError::config(format!("pricing.{model_id}"), "no pricing entry for model")
        })?;
        Ok(pricing.calculate(usage.input_tokens, usage.output_tokens))
    }

    fn release(book: &mut BudgetBook, micros: u64, tokens: u64) {
        book.reserved_micros = book.reserved_micros.saturating_sub(micros);
        book.reserved_tokens = book.reserved_tokens.saturating_sub(tokens);
    }
}

/// Cloneable handle to the session's budget books.
#[derive(Clone)]
pub struct BudgetGovernor {
    inner: Arc<GovernorInner>,
}

impl BudgetGovernor {
    pub fn new(limits: BudgetLimits, pricing: HashMap<String, TokenPricing>) -> Self {
        Self {
            inner: Arc::new(GovernorInner {
                limits,
                pricing,
                book: StdMutex::new(BudgetBook::default()),
            }),
        }
    }

    pub fn limits(&self) -> BudgetLimits {
        self.inner.limits
    }

    /// Pre-approve a call from its estimated usage.
    ///
    /// On approval the estimate is held until the returned reservation is
    /// committed or dropped.
    pub fn propose_charge(
        &self,
        estimated: TokenUsage,
        model_id: &str,
        correlation_id: &str,
    ) -> Result<Reservation> {
        let micros = self.inner.price(model_id, &estimated)?;
        let tokens = estimated.total();
        let limits = self.inner.limits;

        let mut book = self.inner.lock()?;
        let committed_micros = book.spent_micros + book.reserved_micros;
        let committed_tokens = book.tokens_used + book.reserved_tokens;

        if book.exhausted || committed_micros + micros > limits.max_cost_micros {
            return Err(RlmError::BudgetExceeded {
                kind: BudgetExceededKind::Cost,
                remaining: limits.max_cost_micros.saturating_sub(committed_micros),
                requested: micros,
                correlation_id: correlation_id.to_string(),
            });
        }
        if committed_tokens + tokens > limits.max_tokens {
            return Err(RlmError::BudgetExceeded {
                kind: BudgetExceededKind::Tokens,
                remaining: limits.max_tokens.saturating_sub(committed_tokens),
                requested: tokens,
                correlation_id: correlation_id.to_string(),
            });
        }

        book.reserved_micros += micros;
        book.reserved_tokens += tokens;
        debug!(
            correlation_id,
            model_id, micros, tokens, "budget reservation approved"
        );

        Ok(Reservation {
            inner: Arc::clone(&self.inner),
            model_id: model_id.to_string(),
            correlation_id: correlation_id.to_string(),
            micros,
            tokens,
            settled: false,
        })
    }

    pub fn status(&self) -> Result<BudgetState> {
        let book = self.inner.lock()?;
        Ok(self.inner.snapshot(&book))
    }
}

/// An approved estimate held against the budget.
///
/// Dropping it without committing (provider failure, cancellation) returns the
/// held headroom.
pub struct Reservation {
    inner: Arc<GovernorInner>,
    model_id: String,
    correlation_id: String,
    micros: u64,
    tokens: u64,
    settled: bool,
}

/// Outcome of a committed charge.
#[derive(Clone, Debug, PartialEq)]
pub struct ChargeReceipt {
    pub cost_micros: u64,
    pub usage: TokenUsage,
    /// Books as they stood right after this charge.
    pub state: BudgetState,
}

impl Reservation {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Replace the hold with the actual usage.
    ///
    /// A charge that would breach a cap is refused, the books keep their last
    /// valid totals, and the governor stops approving further work.
    pub fn commit(mut self, actual: TokenUsage) -> Result<ChargeReceipt> {
        let cost_micros = self.inner.price(&self.model_id, &actual)?;
        let limits = self.inner.limits;
        let mut book = self.inner.lock()?;

        GovernorInner::release(&mut book, self.micros, self.tokens);
        self.settled = true;

        if book.spent_micros + cost_micros > limits.max_cost_micros {
            book.exhausted = true;
            warn!(
                correlation_id = %self.correlation_id,
                cost_micros, "committed charge refused: cost cap reached"
            );
            return Err(RlmError::BudgetExceeded {
                kind: BudgetExceededKind::Cost,
                remaining: limits.max_cost_micros.saturating_sub(book.spent_micros),
                requested: cost_micros,
                correlation_id: self.correlation_id.clone(),
            });
        }
        if book.tokens_used + actual.total() > limits.max_tokens {
            book.exhausted = true;
            warn!(
                correlation_id = %self.correlation_id,
                tokens = actual.total(),
                "committed charge refused: token cap reached"
            );
            return Err(RlmError::BudgetExceeded {
                kind: BudgetExceededKind::Tokens,
                remaining: limits.max_tokens.saturating_sub(book.tokens_used),
                requested: actual.total(),
                correlation_id: self.correlation_id.clone(),
            });
        }

        book.spent_micros += cost_micros;
        book.tokens_used += actual.total();
        book.committed_charges += 1;

        let threshold = limits.max_cost_micros as f64 * limits.soft_limit_percentage;
        if !book.soft_limit_crossed && limits.max_cost_micros > 0 && book.spent_micros as f64 >= threshold
        {
            book.soft_limit_crossed = true;
            warn!(
                spent_usd = micros_to_usd(book.spent_micros),
                max_usd = micros_to_usd(limits.max_cost_micros),
                "session spend crossed the soft budget limit"
            );
        }

        Ok(ChargeReceipt {
            cost_micros,
            usage: actual,
            state: self.inner.snapshot(&book),
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Ok(mut book) = self.inner.book.lock() {
            GovernorInner::release(&mut book, self.micros, self.tokens);
        }
    }
}

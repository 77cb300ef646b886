//! Tier selection and promotion.
//!
//! A unit of work starts on the cheapest tier its structural signals allow and
//! is escalated by [`PromotionMachine`] when an attempt fails. Every decision
//! lands in the machine's history, which is what the ledger records.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::cost::TokenEstimator;

/// Capability levels, cheapest first.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    Mid,
    High,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Mid => "mid",
            Tier::High => "high",
        }
    }

    fn step_up(self) -> Tier {
        match self {
            Tier::Low => Tier::Mid,
            Tier::Mid | Tier::High => Tier::High,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoutingThresholds {
    pub pre_flight_token_limit: u64,
    pub node_limit: u64,
    pub depth_limit: u32,
    pub array_limit: u64,
    pub csv_column_limit: u64,
    pub low_line_limit: u64,
    pub nesting_limit: u32,
    pub weak_retrieval_score: f64,
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self {
            pre_flight_token_limit: 28_000,
            node_limit: 800,
            depth_limit: 6,
            array_limit: 5_000,
            csv_column_limit: 60,
            low_line_limit: 60,
            nesting_limit: 3,
            weak_retrieval_score: 0.25,
        }
    }
}

/// Hit count and mean score from the retrieval index.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievalSignals {
    pub k: u32,
    pub avg_score: f64,
}

/// Shape of one unit of work.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RouteSignals {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub node_count: u64,
    pub schema_depth: u32,
    pub array_elements: u64,
    pub csv_columns: u64,
    pub line_count: u64,
    pub nesting_depth: u32,
    /// `None` when no retrieval index was consulted.
    pub retrieval: Option<RetrievalSignals>,
}

impl RouteSignals {
    /// Measure `text` as the input of a call allowed `tokens_out` output tokens.
    pub fn measure(text: &str, estimator: &TokenEstimator, tokens_out: u64) -> Self {
        let mut signals = Self {
            tokens_in: estimator.estimate(text),
            tokens_out,
            line_count: text.lines().count() as u64,
            nesting_depth: nesting_depth(text),
            ..Self::default()
        };
        match serde_json::from_str::<Value>(text.trim()) {
            Ok(value) if value.is_object() || value.is_array() => {
                let shape = JsonShape::of(&value);
                signals.node_count = shape.nodes;
                signals.schema_depth = shape.depth;
                signals.array_elements = shape.widest_array;
            }
            _ => signals.csv_columns = csv_columns(text),
        }
        signals
    }

    /// Same shape, priced as the prompt that is actually sent.
    pub fn with_prompt_tokens(mut self, tokens_in: u64) -> Self {
        self.tokens_in = tokens_in;
        self
    }

    pub fn with_retrieval(mut self, retrieval: Option<RetrievalSignals>) -> Self {
        self.retrieval = retrieval;
        self
    }
}

/// Deepest bracket nesting or indentation level, whichever is larger.
fn nesting_depth(text: &str) -> u32 {
    let mut depth: u32 = 0;
    let mut max_depth: u32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' | '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' | ']' | ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    let max_indent = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.chars()
                .take_while(|c| c.is_whitespace())
                .map(|c| if c == '\t' { 4 } else { 1 })
                .sum::<u32>()
                / 4
        })
        .max()
        .unwrap_or(0);

    max_depth.max(max_indent)
}

/// Column count when the first two lines agree on a comma-separated layout.
fn csv_columns(text: &str) -> u64 {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let (Some(header), Some(row)) = (lines.next(), lines.next()) else {
        return 0;
    };
    let header_commas = header.matches(',').count();
    if header_commas == 0 || header_commas != row.matches(',').count() {
        return 0;
    }
    (header_commas + 1) as u64
}

struct JsonShape {
    nodes: u64,
    depth: u32,
    widest_array: u64,
}

impl JsonShape {
    fn of(value: &Value) -> Self {
        let mut shape = JsonShape {
            nodes: 0,
            depth: 0,
            widest_array: 0,
        };
        shape.visit(value, 1);
        shape
    }

    fn visit(&mut self, value: &Value, depth: u32) {
        self.nodes += 1;
        match value {
            Value::Object(map) => {
                self.depth = self.depth.max(depth);
                for child in map.values() {
                    self.visit(child, depth + 1);
                }
            }
            Value::Array(items) => {
                self.depth = self.depth.max(depth);
                self.widest_array = self.widest_array.max(items.len() as u64);
                for child in items {
                    self.visit(child, depth + 1);
                }
            }
            _ => {}
        }
    }
}

/// Which pre-flight limit sent the work straight to the high tier.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PreFlightCause {
    TokenLimit,
    NodeLimit,
    DepthLimit,
    ArrayLimit,
    CsvColumnLimit,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "cause")]
pub enum StartReason {
    PreFlight(PreFlightCause),
    Structural,
    WeakRetrieval,
}

impl StartReason {
    pub fn describe(&self) -> String {
        match self {
            StartReason::PreFlight(cause) => {
                let cause = serde_json::to_value(cause)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                format!("pre_flight:{cause}")
            }
            StartReason::Structural => "structural".to_string(),
            StartReason::WeakRetrieval => "weak_retrieval".to_string(),
        }
    }
}

/// Picks the tier a unit of work starts on.
#[derive(Clone, Debug, Default)]
pub struct TieredRouter {
    thresholds: RoutingThresholds,
}

impl TieredRouter {
    pub fn new(thresholds: RoutingThresholds) -> Self {
        Self { thresholds }
    }

    pub fn pre_flight(&self, signals: &RouteSignals) -> Option<PreFlightCause> {
        let t = &self.thresholds;
        if signals.tokens_in + signals.tokens_out > t.pre_flight_token_limit {
            Some(PreFlightCause::TokenLimit)
        } else if signals.node_count > t.node_limit {
            Some(PreFlightCause::NodeLimit)
        } else if signals.schema_depth > t.depth_limit {
            Some(PreFlightCause::DepthLimit)
        } else if signals.array_elements > t.array_limit {
            Some(PreFlightCause::ArrayLimit)
        } else if signals.csv_columns > t.csv_column_limit {
            Some(PreFlightCause::CsvColumnLimit)
        } else {
            None
        }
    }

    pub fn choose_start_tier(&self, signals: &RouteSignals) -> (Tier, StartReason) {
        if let Some(cause) = self.pre_flight(signals) {
            return (Tier::High, StartReason::PreFlight(cause));
        }

        let t = &self.thresholds;
        let structural = if signals.line_count <= t.low_line_limit
            && signals.nesting_depth <= t.nesting_limit
        {
            Tier::Low
        } else {
            Tier::Mid
        };

        let weak = signals
            .retrieval
            .is_some_and(|r| r.k == 0 || r.avg_score < t.weak_retrieval_score);
        if weak && structural == Tier::Low {
            (Tier::Mid, StartReason::WeakRetrieval)
        } else {
            (structural, StartReason::Structural)
        }
    }
}

/// Why an attempt failed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Output hit the length cap.
    Truncation,
    /// Output did not parse or did not match the schema.
    Validation,
    /// Provider could not be reached.
    Transport,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Truncation => "truncation",
            FailureKind::Validation => "validation",
            FailureKind::Transport => "transport",
        }
    }
}

/// One entry of a unit of work's routing history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum Decision {
    Start {
        tier: Tier,
        reason: StartReason,
    },
    Retry {
        tier: Tier,
        failure: FailureKind,
    },
    Promote {
        from: Tier,
        to: Tier,
        failure: FailureKind,
    },
    Terminal {
        tier: Tier,
        failure: FailureKind,
    },
}

impl Decision {
    /// Tier the decision leaves the work on.
    pub fn tier(&self) -> Tier {
        match self {
            Decision::Start { tier, .. }
            | Decision::Retry { tier, .. }
            | Decision::Terminal { tier, .. } => *tier,
            Decision::Promote { to, .. } => *to,
        }
    }

    /// Short label for the ledger's `promo` column.
    pub fn label(&self) -> String {
        match self {
            Decision::Start { .. } => "start".to_string(),
            Decision::Retry { .. } => "retry".to_string(),
            Decision::Promote { from, to, .. } => format!("{from}->{to}"),
            Decision::Terminal { .. } => "terminal".to_string(),
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Decision::Start { reason, .. } => reason.describe(),
            Decision::Retry { failure, .. }
            | Decision::Promote { failure, .. }
            | Decision::Terminal { failure, .. } => failure.as_str().to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Retry(Tier),
    Promote(Tier),
    Terminal,
}

/// Next step for a failure at `(tier, attempt)`.
///
/// `attempt` counts attempts already made on `tier`; a transport failure on
/// the first attempt of a unit of work's only retry gets one more go on the
/// same tier.
pub fn next_transition(
    tier: Tier,
    attempt: u32,
    retry_available: bool,
    failure: FailureKind,
) -> Transition {
    match (tier, attempt, failure) {
        (_, 1, FailureKind::Transport) if retry_available => Transition::Retry(tier),
        (Tier::High, _, _) => Transition::Terminal,
        (Tier::Low, _, FailureKind::Truncation) => Transition::Promote(Tier::High),
        (Tier::Low, _, _) => Transition::Promote(Tier::Mid),
        (Tier::Mid, _, _) => Transition::Promote(Tier::High),
    }
}

/// Retry/promotion state for one unit of work.
#[derive(Clone, Debug)]
pub struct PromotionMachine {
    tier: Tier,
    attempt: u32,
    retry_used: bool,
    history: Vec<Decision>,
}

impl PromotionMachine {
    pub fn start(tier: Tier, reason: StartReason) -> Self {
        Self {
            tier,
            attempt: 0,
            retry_used: false,
            history: vec![Decision::Start { tier, reason }],
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Call when an attempt on the current tier begins.
    pub fn begin_attempt(&mut self) {
        self.attempt += 1;
    }

    pub fn on_failure(&mut self, failure: FailureKind) -> Transition {
        let transition = next_transition(self.tier, self.attempt, !self.retry_used, failure);
        let decision = match transition {
            Transition::Retry(tier) => {
                self.retry_used = true;
                Decision::Retry { tier, failure }
            }
            Transition::Promote(to) => {
                let from = self.tier;
                self.tier = to;
                self.attempt = 0;
                Decision::Promote { from, to, failure }
            }
            Transition::Terminal => Decision::Terminal {
                tier: self.tier,
                failure,
            },
        };
        self.history.push(decision);
        transition
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.history
    }

    pub fn last_decision(&self) -> Option<&Decision> {
        self.history.last()
    }

    pub fn into_history(self) -> Vec<Decision> {
        self.history
    }
}

/// Longest usage/example snippet kept before validation.
pub const SNIPPET_MAX_LINES: usize = 12;

const SNIPPET_KEYS: [&str; 4] = ["usage", "example", "examples", "usage_example"];

/// Required top-level keys of an extraction.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputSchema {
    pub required_keys: Vec<String>,
}

impl OutputSchema {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Clip every usage/example string in `value` to [`SNIPPET_MAX_LINES`].
/// Returns how many snippets were clipped.
pub fn clip_snippets(value: &mut Value) -> usize {
    let mut clipped = 0;
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if SNIPPET_KEYS.contains(&key.as_str()) {
                    clipped += clip_snippet_value(child);
                } else {
                    clipped += clip_snippets(child);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                clipped += clip_snippets(item);
            }
        }
        _ => {}
    }
    clipped
}

fn clip_snippet_value(value: &mut Value) -> usize {
    match value {
        Value::String(text) => {
            if text.lines().count() <= SNIPPET_MAX_LINES {
                return 0;
            }
            *text = text
                .lines()
                .take(SNIPPET_MAX_LINES)
                .collect::<Vec<_>>()
                .join("\n");
            1
        }
        Value::Array(items) => items.iter_mut().map(clip_snippet_value).sum(),
        other => clip_snippets(other),
    }
}

/// Parse, clip and check an extraction. The same rules apply on every tier.
pub fn validate_extraction(
    tier: Tier,
    raw: &str,
    schema: &OutputSchema,
) -> std::result::Result<Value, String> {
    let mut value: Value = serde_json::from_str(raw.trim())
        .map_err(|err| format!("{tier} output is not valid JSON: {err}"))?;
    let clipped = clip_snippets(&mut value);
    if clipped > 0 {
        tracing::debug!(%tier, clipped, "clipped usage snippets");
    }
    let Some(object) = value.as_object() else {
        return Err(format!("{tier} output is not a JSON object"));
    };
    let missing: Vec<&str> = schema
        .required_keys
        .iter()
        .filter(|key| !object.contains_key(key.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required keys: {}", missing.join(", ")));
    }
    Ok(value)
}

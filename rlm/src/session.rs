//! Session orchestrator.
//!
//! A session drives the root frame through at most `max_turns` model turns.
//! Each turn is one unit of work: the router picks a starting tier, the
//! governor pre-approves the call, the provider answers, and failures walk the
//! promotion machine until a tier produces a usable reply or the high tier
//! fails. Code in a reply runs in the sandbox; `SUBCALL` lines open child
//! frames that run the same loop one level deeper, fanned out concurrently.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use anyhow::anyhow;
use chrono::DateTime;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::budget::BudgetGovernor;
use crate::budget::BudgetState;
use crate::config::SessionConfig;
use crate::cost::CostReport;
use crate::cost::CostTracker;
use crate::cost::TokenUsage;
use crate::error::Result;
use crate::error::RlmError;
use crate::ledger::LedgerEntry;
use crate::ledger::LedgerHandle;
use crate::ledger::TraceKind;
use crate::ledger::timestamp;
use crate::provider::ModelProvider;
use crate::provider::NoRetrieval;
use crate::provider::ProviderRequest;
use crate::provider::RetrievalIndex;
use crate::reply::ModelReply;
use crate::reply::parse_reply;
use crate::routing::Decision;
use crate::routing::FailureKind;
use crate::routing::OutputSchema;
use crate::routing::PromotionMachine;
use crate::routing::RouteSignals;
use crate::routing::Tier;
use crate::routing::TieredRouter;
use crate::routing::Transition;
use crate::sandbox::SandboxExecutor;

/// One node of the call tree.
#[derive(Clone, Debug)]
pub struct RecursionFrame {
    /// Correlation id of the frame's work.
    pub id: String,
    pub parent: Option<String>,
    pub depth: u32,
    /// Tier of the most recent attempt.
    pub tier: Option<Tier>,
    pub created_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub children: Vec<String>,
    /// Child of the parent's token; cancelling a frame cancels its subtree.
    pub cancel: CancellationToken,
}

/// Arena of live frames keyed by correlation id.
#[derive(Debug)]
pub struct FrameTree {
    frames: HashMap<String, RecursionFrame>,
    max_depth: u32,
}

impl FrameTree {
    pub fn new(max_depth: u32) -> Self {
        Self {
            frames: HashMap::new(),
            max_depth,
        }
    }

    pub fn open_root(&mut self, session_cancel: &CancellationToken) -> RecursionFrame {
        let frame = RecursionFrame {
            id: Uuid::new_v4().to_string(),
            parent: None,
            depth: 0,
            tier: None,
            created_at: Utc::now(),
            returned_at: None,
            children: Vec::new(),
            cancel: session_cancel.child_token(),
        };
        self.frames.insert(frame.id.clone(), frame.clone());
        frame
    }

    /// Open a child of `parent_id` one level deeper, refusing frames past the
    /// depth bound.
    pub fn open_child(&mut self, parent_id: &str) -> Result<RecursionFrame> {
        let parent = self
            .frames
            .get_mut(parent_id)
            .ok_or_else(|| RlmError::Internal(anyhow!("unknown frame {parent_id}")))?;
        let depth = parent.depth + 1;
        if depth > self.max_depth {
            return Err(RlmError::RecursionDepthExceeded {
                depth,
                max_depth: self.max_depth,
                correlation_id: parent_id.to_string(),
            });
        }
        let frame = RecursionFrame {
            id: Uuid::new_v4().to_string(),
            parent: Some(parent_id.to_string()),
            depth,
            tier: None,
            created_at: Utc::now(),
            returned_at: None,
            children: Vec::new(),
            cancel: parent.cancel.child_token(),
        };
        parent.children.push(frame.id.clone());
        self.frames.insert(frame.id.clone(), frame.clone());
        debug!(correlation_id = %frame.id, parent_id, depth, "frame opened");
        Ok(frame)
    }

    pub fn get(&self, id: &str) -> Option<&RecursionFrame> {
        self.frames.get(id)
    }

    pub fn set_tier(&mut self, id: &str, tier: Tier) {
        if let Some(frame) = self.frames.get_mut(id) {
            frame.tier = Some(tier);
        }
    }

    /// Remove `id` and every descendant, cancelling the descendants.
    pub fn close(&mut self, id: &str) -> Option<RecursionFrame> {
        let mut frame = self.frames.remove(id)?;
        frame.returned_at = Some(Utc::now());
        for child in std::mem::take(&mut frame.children) {
            if let Some(child) = self.close(&child) {
                child.cancel.cancel();
            }
        }
        if let Some(parent) = frame.parent.as_deref().and_then(|p| self.frames.get_mut(p)) {
            parent.children.retain(|c| c != id);
        }
        let lifetime_ms = (Utc::now() - frame.created_at).num_milliseconds();
        debug!(correlation_id = %frame.id, depth = frame.depth, lifetime_ms, "frame closed");
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    /// Ran out of turns without a final answer.
    TurnLimit,
    TimedOut,
    Cancelled,
    BudgetExceeded,
    TierExhausted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Completed => "completed",
            SessionStatus::TurnLimit => "turn_limit",
            SessionStatus::TimedOut => "timed_out",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::BudgetExceeded => "budget_exceeded",
            SessionStatus::TierExhausted => "tier_exhausted",
        }
    }

    /// Process exit code for the CLI. Configuration errors (2) never get
    /// this far.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionStatus::Completed => 0,
            SessionStatus::BudgetExceeded => 3,
            SessionStatus::TierExhausted => 4,
            SessionStatus::TimedOut => 5,
            SessionStatus::TurnLimit | SessionStatus::Cancelled => 1,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionResult {
    pub correlation_id: String,
    pub status: SessionStatus,
    pub answer: Option<String>,
    /// Latest root reply when there is no answer.
    pub partial: Option<String>,
    pub error: Option<String>,
    pub turns: u32,
    pub budget: BudgetState,
    pub cost: CostReport,
    pub ledger_entries: u64,
    pub decisions: Vec<Decision>,
}

/// Entry point: one configured engine that can run queries.
pub struct RlmSession {
    config: Arc<SessionConfig>,
    provider: Arc<dyn ModelProvider>,
    retrieval: Arc<dyn RetrievalIndex>,
    ledger: LedgerHandle,
    sandbox: Arc<SandboxExecutor>,
    schema: OutputSchema,
    cancel: CancellationToken,
}

impl RlmSession {
    /// Fails before any provider call if the configuration is unusable.
    pub fn new(
        config: SessionConfig,
        provider: Arc<dyn ModelProvider>,
        ledger: LedgerHandle,
    ) -> Result<Self> {
        config.check_pricing()?;
        let sandbox = SandboxExecutor::new(&config.sandbox)?;
        Ok(Self {
            config: Arc::new(config),
            provider,
            retrieval: Arc::new(NoRetrieval),
            ledger,
            sandbox: Arc::new(sandbox),
            schema: OutputSchema::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_retrieval(mut self, retrieval: Arc<dyn RetrievalIndex>) -> Self {
        self.retrieval = retrieval;
        self
    }

    /// Keys a JSON final answer must carry.
    pub fn with_output_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Cancels the running query and everything below it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Answer `query` over `context`.
    ///
    /// Budget exhaustion, tier exhaustion, timeouts and cancellation come back
    /// as a [`SessionResult`] status. `Err` is reserved for configuration,
    /// ledger and internal failures.
    pub async fn run(&self, query: &str, context: &str) -> Result<SessionResult> {
        let run = Arc::new(SessionRun::new(self));
        let root = run.lock_frames()?.open_root(&self.cancel);
        let correlation_id = root.id.clone();
        let timeout = Duration::from_secs(self.config.session.session_timeout_seconds);
        info!(
            correlation_id = %correlation_id,
            context_chars = context.chars().count(),
            "session started"
        );

        let drive = Arc::clone(&run).drive_frame(root.clone(), query.to_string(), context.to_string());
        let outcome = tokio::select! {
            outcome = drive => Some(outcome),
            _ = tokio::time::sleep(timeout) => None,
            _ = self.cancel.cancelled() => None,
        };
        root.cancel.cancel();
        run.lock_frames()?.close(&root.id);

        let (status, answer, error) = match outcome {
            Some(Ok(FrameOutcome::Answered(answer))) => (SessionStatus::Completed, Some(answer), None),
            Some(Ok(FrameOutcome::TurnLimit(_))) => (
                SessionStatus::TurnLimit,
                None,
                Some(format!(
                    "no final answer after {} turns",
                    self.config.session.max_turns
                )),
            ),
            Some(Err(err)) => {
                let status = match &err {
                    RlmError::BudgetExceeded { .. } => SessionStatus::BudgetExceeded,
                    RlmError::TierExhausted { .. } => SessionStatus::TierExhausted,
                    RlmError::Cancelled { .. } => SessionStatus::Cancelled,
                    _ => return Err(err),
                };
                (status, None, Some(describe(&err)))
            }
            None if self.cancel.is_cancelled() => (
                SessionStatus::Cancelled,
                None,
                Some(format!("cancelled [correlation_id={correlation_id}]")),
            ),
            None => (
                SessionStatus::TimedOut,
                None,
                Some(format!(
                    "session exceeded {}s [correlation_id={correlation_id}]",
                    timeout.as_secs()
                )),
            ),
        };

        self.ledger.flush().await?;
        let budget = run.governor.status()?;
        let cost = run.costs.report(&budget);
        let partial = match answer {
            Some(_) => None,
            None => run.progress.lock().ok().and_then(|last| last.clone()),
        };
        let decisions = run
            .decisions
            .lock()
            .map(|decisions| decisions.clone())
            .unwrap_or_default();

        match status {
            SessionStatus::Completed => info!(
                correlation_id = %correlation_id,
                spent_usd = budget.spent_usd,
                tokens_used = budget.tokens_used,
                "session completed"
            ),
            _ => error!(
                correlation_id = %correlation_id,
                %status,
                error = error.as_deref().unwrap_or_default(),
                "session ended without an answer"
            ),
        }

        Ok(SessionResult {
            correlation_id,
            status,
            answer,
            partial,
            error,
            turns: run.root_turns.load(Ordering::SeqCst),
            budget,
            cost,
            ledger_entries: run.ledger_entries.load(Ordering::SeqCst),
            decisions,
        })
    }
}

fn describe(err: &RlmError) -> String {
    match err.correlation_id() {
        Some(id) => format!("{err} [correlation_id={id}]"),
        None => err.to_string(),
    }
}

enum FrameOutcome {
    Answered(String),
    TurnLimit(Option<String>),
}

impl FrameOutcome {
    fn into_observation(self) -> String {
        match self {
            FrameOutcome::Answered(answer) => answer,
            FrameOutcome::TurnLimit(Some(last)) => format!("(no final answer; last reply)\n{last}"),
            FrameOutcome::TurnLimit(None) => "(no final answer)".to_string(),
        }
    }
}

/// A usable reply to one unit of work.
struct ResolvedUnit {
    tier: Tier,
    text: String,
    reply: ModelReply,
}

/// What one attempt contributes to its ledger entry.
struct AttemptRecord<'a> {
    model: &'a str,
    usage: TokenUsage,
    /// Books as left by this attempt's commit; `None` reads the governor.
    committed: Option<BudgetState>,
    result: &'a str,
    detail: String,
    wall_ms: u64,
}

/// State of one `run` call.
struct SessionRun {
    config: Arc<SessionConfig>,
    provider: Arc<dyn ModelProvider>,
    retrieval: Arc<dyn RetrievalIndex>,
    ledger: LedgerHandle,
    sandbox: Arc<SandboxExecutor>,
    schema: OutputSchema,
    governor: BudgetGovernor,
    costs: CostTracker,
    router: TieredRouter,
    frames: StdMutex<FrameTree>,
    policy_summary: String,
    decisions: StdMutex<Vec<Decision>>,
    ledger_entries: AtomicU64,
    root_turns: AtomicU32,
    progress: StdMutex<Option<String>>,
}

impl SessionRun {
    fn new(session: &RlmSession) -> Self {
        let config = Arc::clone(&session.config);
        let policy_summary = config
            .sandbox
            .policy
            .summary(config.sandbox.code_timeout_seconds, config.sandbox.max_output_chars)
            .render();
        Self {
            governor: BudgetGovernor::new(config.budget_limits(), config.pricing.clone()),
            costs: CostTracker::new(config.pricing.clone()),
            router: TieredRouter::new(config.routing),
            frames: StdMutex::new(FrameTree::new(config.budget.max_subcall_depth)),
            provider: Arc::clone(&session.provider),
            retrieval: Arc::clone(&session.retrieval),
            ledger: session.ledger.clone(),
            sandbox: Arc::clone(&session.sandbox),
            schema: session.schema.clone(),
            policy_summary,
            decisions: StdMutex::new(Vec::new()),
            ledger_entries: AtomicU64::new(0),
            root_turns: AtomicU32::new(0),
            progress: StdMutex::new(None),
            config,
        }
    }

    fn lock_frames(&self) -> Result<MutexGuard<'_, FrameTree>> {
        self.frames
            .lock()
            .map_err(|_| RlmError::Internal(anyhow!("frame tree lock poisoned")))
    }

    fn cancelled(frame: &RecursionFrame) -> RlmError {
        RlmError::Cancelled {
            correlation_id: frame.id.clone(),
        }
    }

    fn drive_frame(
        self: Arc<Self>,
        frame: RecursionFrame,
        task: String,
        context: String,
    ) -> BoxFuture<'static, Result<FrameOutcome>> {
        async move {
            let retrieval = self.retrieval.retrieve(&task).await;
            let subject = if context.is_empty() { task.as_str() } else { context.as_str() };
            let max_tokens = self.config.models.max_tokens_for(frame.depth);
            let structure =
                RouteSignals::measure(subject, &self.config.token_estimate, u64::from(max_tokens))
                    .with_retrieval(retrieval);
            let shown_context = if context.is_empty() { "(none)" } else { context.as_str() };
            let mut variables = BTreeMap::new();
            variables.insert("context".to_string(), context.clone());
            let mode = self.config.sandbox.policy.mode;
            let code_timeout = Duration::from_secs(self.config.sandbox.code_timeout_seconds);

            let mut transcript = String::new();
            let mut last_reply = None;
            for turn in 1..=self.config.session.max_turns {
                if frame.cancel.is_cancelled() {
                    return Err(Self::cancelled(&frame));
                }
                if frame.depth == 0 {
                    self.root_turns.store(turn, Ordering::SeqCst);
                }
                let budget_summary = self.governor.status()?.summary();
                let mut prompt = self.config.prompt.render(
                    &task,
                    shown_context,
                    &self.policy_summary,
                    &budget_summary,
                );
                if !transcript.is_empty() {
                    prompt.push_str("\n\n");
                    prompt.push_str(&transcript);
                }

                let unit = self.resolve_unit(&frame, &prompt, &structure).await?;
                debug!(
                    correlation_id = %frame.id,
                    turn,
                    code_blocks = unit.reply.code_blocks.len(),
                    subcalls = unit.reply.subcalls.len(),
                    "turn resolved"
                );
                transcript.push_str(&format!("[turn {turn}, {} tier]\n{}\n", unit.tier, unit.text));
                if frame.depth == 0
                    && let Ok(mut progress) = self.progress.lock()
                {
                    *progress = Some(unit.text.clone());
                }
                if let Some(answer) = &unit.reply.final_answer {
                    return Ok(FrameOutcome::Answered(answer.render()));
                }

                for code in &unit.reply.code_blocks {
                    let execution = self
                        .sandbox
                        .execute_with_variables(code, mode, code_timeout, &frame.cancel, &variables)
                        .await;
                    self.ledger
                        .trace(&frame.id, TraceKind::Stdout, Some(unit.tier), &execution.stdout)?;
                    transcript.push_str(&execution.observation());
                    transcript.push('\n');
                }

                if !unit.reply.subcalls.is_empty() {
                    let answers = Arc::clone(&self)
                        .fan_out(&frame, unit.reply.subcalls.clone())
                        .await?;
                    for (prompt, answer) in answers {
                        transcript.push_str(&format!("[sub-call: {prompt}]\n{answer}\n"));
                    }
                }
                last_reply = Some(unit.text);
            }
            warn!(correlation_id = %frame.id, depth = frame.depth, "turn limit reached");
            Ok(FrameOutcome::TurnLimit(last_reply))
        }
        .boxed()
    }

    /// Run every sub-call of one reply, at most `max_concurrent_subcalls` at a
    /// time. Answers come back in request order.
    async fn fan_out(
        self: Arc<Self>,
        parent: &RecursionFrame,
        prompts: Vec<String>,
    ) -> Result<Vec<(String, String)>> {
        let slots = Arc::new(Semaphore::new(self.config.session.max_concurrent_subcalls));
        let calls = prompts.into_iter().map(|prompt| {
            Arc::clone(&self).run_subcall(parent.id.clone(), prompt, Arc::clone(&slots))
        });
        futures::future::join_all(calls)
            .await
            .into_iter()
            .collect()
    }

    async fn run_subcall(
        self: Arc<Self>,
        parent_id: String,
        prompt: String,
        slots: Arc<Semaphore>,
    ) -> Result<(String, String)> {
        let opened = self
            .lock_frames()
            .and_then(|mut frames| frames.open_child(&parent_id));
        let child = match opened {
            Ok(child) => child,
            Err(err @ RlmError::RecursionDepthExceeded { .. }) => {
                warn!(parent_id, "sub-call refused: {err}");
                return Ok((prompt, format!("[sub-call refused: {err}]")));
            }
            Err(err) => return Err(err),
        };
        let _guard = FrameGuard {
            run: Arc::clone(&self),
            id: child.id.clone(),
        };
        let _permit = tokio::select! {
            permit = slots.acquire() => permit.map_err(|_| Self::cancelled(&child))?,
            _ = child.cancel.cancelled() => return Err(Self::cancelled(&child)),
        };
        let outcome = Arc::clone(&self)
            .drive_frame(child, prompt.clone(), String::new())
            .await?;
        Ok((prompt, outcome.into_observation()))
    }

    /// Route one prompt through the tiers until a reply is usable.
    ///
    /// `structure` describes the frame's unit of work; only its input token
    /// count is taken from `prompt`.
    async fn resolve_unit(
        &self,
        frame: &RecursionFrame,
        prompt: &str,
        structure: &RouteSignals,
    ) -> Result<ResolvedUnit> {
        let estimator = self.config.token_estimate;
        let max_tokens = self.config.models.max_tokens_for(frame.depth);
        let signals = structure
            .clone()
            .with_prompt_tokens(estimator.estimate(prompt));
        let (start, reason) = self.router.choose_start_tier(&signals);
        info!(
            correlation_id = %frame.id,
            depth = frame.depth,
            tier = %start,
            reason = %reason.describe(),
            "start tier chosen"
        );
        let mut machine = PromotionMachine::start(start, reason);

        loop {
            if frame.cancel.is_cancelled() {
                return Err(Self::cancelled(frame));
            }
            machine.begin_attempt();
            let tier = machine.tier();
            self.lock_frames()?.set_tier(&frame.id, tier);
            let model = self.config.models.model_for(tier, frame.depth).to_string();
            debug!(
                correlation_id = %frame.id,
                %tier,
                attempt = machine.attempt(),
                model = %model,
                "attempt starting"
            );
            let started = Instant::now();

            let estimate = estimator.estimate_call(prompt, max_tokens);
            let reservation = match self.governor.propose_charge(estimate, &model, &frame.id) {
                Ok(reservation) => reservation,
                Err(err) => {
                    self.record_attempt(frame, &machine, &signals, AttemptRecord {
                        model: &model,
                        usage: TokenUsage::default(),
                        committed: None,
                        result: "budget_exceeded",
                        detail: err.to_string(),
                        wall_ms: elapsed_ms(started),
                    })?;
                    self.finish_unit(machine);
                    return Err(err);
                }
            };

            self.ledger.trace(&frame.id, TraceKind::Prompt, Some(tier), prompt)?;
            let request = ProviderRequest {
                model: model.clone(),
                prompt: prompt.to_string(),
                temperature: self.config.models.temperature_for(frame.depth),
                max_tokens,
                tier,
                correlation_id: frame.id.clone(),
            };
            let sent = tokio::select! {
                sent = self.provider.send(request) => sent,
                _ = frame.cancel.cancelled() => return Err(Self::cancelled(frame)),
            };

            let mut usage = TokenUsage::default();
            let mut committed = None;
            let (failure, detail, resolved) = match sent {
                Err(err) => {
                    drop(reservation);
                    let err = RlmError::ProviderTransport {
                        message: err.to_string(),
                        model: Some(model.clone()),
                    };
                    warn!(correlation_id = %frame.id, %tier, "{err}");
                    (Some(FailureKind::Transport), err.to_string(), None)
                }
                Ok(response) => {
                    usage = TokenUsage::new(response.tokens_in, response.tokens_out);
                    let receipt = match reservation.commit(usage) {
                        Ok(receipt) => receipt,
                        Err(err) => {
                            self.record_attempt(frame, &machine, &signals, AttemptRecord {
                                model: &model,
                                usage,
                                committed: None,
                                result: "budget_exceeded",
                                detail: err.to_string(),
                                wall_ms: elapsed_ms(started),
                            })?;
                            self.finish_unit(machine);
                            return Err(err);
                        }
                    };
                    self.costs.record_call(&model, usage, receipt.cost_micros);
                    committed = Some(receipt.state);
                    self.ledger
                        .trace(&frame.id, TraceKind::Response, Some(tier), &response.text)?;
                    if response.truncated {
                        (
                            Some(FailureKind::Truncation),
                            format!("output reached {max_tokens} tokens"),
                            None,
                        )
                    } else {
                        match parse_reply(tier, &response.text, &self.schema) {
                            Ok(reply) => (None, String::new(), Some((response.text, reply))),
                            Err(detail) => (Some(FailureKind::Validation), detail, None),
                        }
                    }
                }
            };

            self.record_attempt(frame, &machine, &signals, AttemptRecord {
                model: &model,
                usage,
                committed,
                result: failure.map_or("ok", |f| f.as_str()),
                detail: detail.clone(),
                wall_ms: elapsed_ms(started),
            })?;

            let Some(failure) = failure else {
                self.finish_unit(machine);
                let (text, reply) = resolved.ok_or_else(|| {
                    RlmError::Internal(anyhow!("successful attempt without a reply"))
                })?;
                return Ok(ResolvedUnit { tier, text, reply });
            };

            match machine.on_failure(failure) {
                Transition::Retry(_) => {
                    info!(correlation_id = %frame.id, %tier, failure = failure.as_str(), "retrying on the same tier");
                }
                Transition::Promote(to) => {
                    warn!(correlation_id = %frame.id, from = %tier, to = %to, failure = failure.as_str(), "promoting");
                }
                Transition::Terminal => {
                    self.record_attempt(frame, &machine, &signals, AttemptRecord {
                        model: &model,
                        usage: TokenUsage::default(),
                        committed: None,
                        result: "tier_exhausted",
                        detail,
                        wall_ms: 0,
                    })?;
                    error!(correlation_id = %frame.id, %tier, failure = failure.as_str(), "highest tier failed");
                    let history = machine.decisions().to_vec();
                    self.finish_unit(machine);
                    return Err(RlmError::TierExhausted {
                        correlation_id: frame.id.clone(),
                        history,
                    });
                }
            }
        }
    }

    /// Write the ledger entry of the machine's latest decision.
    fn record_attempt(
        &self,
        frame: &RecursionFrame,
        machine: &PromotionMachine,
        signals: &RouteSignals,
        attempt: AttemptRecord<'_>,
    ) -> Result<()> {
        let Some(decision) = machine.last_decision() else {
            return Ok(());
        };
        let state = match attempt.committed {
            Some(state) => state,
            None => self.governor.status()?,
        };
        let reason = if attempt.detail.is_empty() {
            decision.reason()
        } else {
            format!("{}: {}", decision.reason(), attempt.detail)
        };
        self.ledger.record(LedgerEntry {
            timestamp: timestamp(),
            task_id: frame.id.clone(),
            parent_id: frame.parent.clone(),
            depth: frame.depth,
            tier_used: decision.tier(),
            model: attempt.model.to_string(),
            promo: decision.label(),
            line_count: signals.line_count,
            nesting_depth: signals.nesting_depth,
            tokens_in: attempt.usage.input_tokens,
            tokens_out: attempt.usage.output_tokens,
            k: signals.retrieval.map(|r| r.k),
            avg_score: signals.retrieval.map(|r| r.avg_score),
            result: attempt.result.to_string(),
            reason,
            wall_ms: attempt.wall_ms,
            spent_usd: state.spent_usd,
            tokens_used: state.tokens_used,
        })?;
        self.ledger_entries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn finish_unit(&self, machine: PromotionMachine) {
        if let Ok(mut decisions) = self.decisions.lock() {
            decisions.extend(machine.into_history());
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Closes a frame however its future ends.
struct FrameGuard {
    run: Arc<SessionRun>,
    id: String,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if let Ok(mut frames) = self.run.frames.lock() {
            frames.close(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn child_frames_track_depth_and_refuse_past_the_bound() {
        let session_cancel = CancellationToken::new();
        let mut tree = FrameTree::new(2);
        let root = tree.open_root(&session_cancel);
        let child = tree.open_child(&root.id).unwrap();
        let grandchild = tree.open_child(&child.id).unwrap();
        assert_eq!((root.depth, child.depth, grandchild.depth), (0, 1, 2));
        assert_eq!(grandchild.parent.as_deref(), Some(child.id.as_str()));

        let err = tree.open_child(&grandchild.id).unwrap_err();
        assert!(matches!(
            err,
            RlmError::RecursionDepthExceeded {
                depth: 3,
                max_depth: 2,
                ..
            }
        ));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn closing_a_frame_removes_and_cancels_its_subtree() {
        let session_cancel = CancellationToken::new();
        let mut tree = FrameTree::new(5);
        let root = tree.open_root(&session_cancel);
        let child = tree.open_child(&root.id).unwrap();
        let grandchild = tree.open_child(&child.id).unwrap();
        let sibling = tree.open_child(&root.id).unwrap();

        let closed = tree.close(&child.id).unwrap();
        assert!(closed.returned_at.is_some());
        assert!(tree.get(&grandchild.id).is_none());
        assert!(grandchild.cancel.is_cancelled());
        assert!(!sibling.cancel.is_cancelled());
        assert_eq!(
            tree.get(&root.id).map(|r| r.children.clone()),
            Some(vec![sibling.id.clone()])
        );
    }

    #[test]
    fn session_cancel_reaches_every_frame() {
        let session_cancel = CancellationToken::new();
        let mut tree = FrameTree::new(5);
        let root = tree.open_root(&session_cancel);
        let child = tree.open_child(&root.id).unwrap();
        session_cancel.cancel();
        assert!(root.cancel.is_cancelled());
        assert!(child.cancel.is_cancelled());
    }

    #[test]
    fn exit_codes_follow_the_cli_contract() {
        assert_eq!(SessionStatus::Completed.exit_code(), 0);
        assert_eq!(SessionStatus::BudgetExceeded.exit_code(), 3);
        assert_eq!(SessionStatus::TierExhausted.exit_code(), 4);
        assert_eq!(SessionStatus::TimedOut.exit_code(), 5);
        assert_eq!(SessionStatus::TurnLimit.exit_code(), 1);
    }
}

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rlm_engine::Decision;
use rlm_engine::LedgerHandle;
use rlm_engine::LedgerWriter;
use rlm_engine::RlmError;
use rlm_engine::RlmSession;
use rlm_engine::ScriptedProvider;
use rlm_engine::ScriptedResponse;
use rlm_engine::SessionConfig;
use rlm_engine::SessionStatus;
use rlm_engine::Tier;
use rlm_engine::TraceConfig;
use rlm_engine::config::DEFAULT_HIGH_MODEL;
use rlm_engine::config::DEFAULT_LOW_MODEL;
use rlm_engine::config::DEFAULT_MID_MODEL;
use rlm_engine::ledger::read_ledger;
use rlm_engine::provider::StaticRetrieval;
use rlm_engine::routing::PreFlightCause;
use rlm_engine::routing::RetrievalSignals;
use rlm_engine::routing::StartReason;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success())
}

async fn ledger_in(dir: &Path) -> (LedgerHandle, std::path::PathBuf) {
    let path = dir.join("ledger.jsonl");
    let trace = TraceConfig {
        ledger_path: path.clone(),
        trace_path: Some(dir.join("trace.jsonl")),
        ..TraceConfig::default()
    };
    (LedgerWriter::spawn(&trace).await.unwrap(), path)
}

fn session(
    config: SessionConfig,
    provider: &Arc<ScriptedProvider>,
    ledger: LedgerHandle,
) -> RlmSession {
    RlmSession::new(config, provider.clone(), ledger).unwrap()
}

#[tokio::test]
async fn low_tier_answer_completes_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let (ledger, path) = ledger_in(dir.path()).await;
    let provider = Arc::new(
        ScriptedProvider::new().on_model(DEFAULT_LOW_MODEL, [ScriptedResponse::reply("FINAL: 42")]),
    );

    let result = session(SessionConfig::default(), &provider, ledger.clone())
        .run("What is the answer?", "The answer is 42.")
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.answer.as_deref(), Some("42"));
    assert_eq!(result.turns, 1);
    assert_eq!(result.ledger_entries, 1);
    assert!(result.budget.tokens_used > 0);
    assert_eq!(result.budget.spent_usd, 0.0);

    let summary = ledger.close().await.unwrap();
    assert_eq!(summary.entries_written, 1);
    assert!(summary.trace_events_written >= 2);
    let entries = read_ledger(&path).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].tier_used, Tier::Low);
    assert_eq!(entries[0].promo, "start");
    assert_eq!(entries[0].result, "ok");
    assert_eq!(entries[0].depth, 0);
    assert_eq!(entries[0].task_id, result.correlation_id);
    assert_eq!(entries[0].k, None);
}

#[tokio::test]
async fn truncated_low_reply_goes_straight_to_high() {
    let dir = tempfile::tempdir().unwrap();
    let (ledger, path) = ledger_in(dir.path()).await;
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_model(DEFAULT_LOW_MODEL, [ScriptedResponse::truncated("FINAL: half an ans")])
            .on_model(DEFAULT_HIGH_MODEL, [ScriptedResponse::reply("FINAL: full answer")]),
    );

    let result = session(SessionConfig::default(), &provider, ledger.clone())
        .run("Summarize.", "Some text.")
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.answer.as_deref(), Some("full answer"));
    let models: Vec<String> = provider.calls().into_iter().map(|call| call.model).collect();
    assert_eq!(models, vec![DEFAULT_LOW_MODEL.to_string(), DEFAULT_HIGH_MODEL.to_string()]);
    assert!(matches!(result.decisions[1], Decision::Promote {
        from: Tier::Low,
        to: Tier::High,
        ..
    }));
    assert!(result.budget.spent_usd > 0.0);

    ledger.close().await.unwrap();
    let entries = read_ledger(&path).await.unwrap();
    assert_eq!(entries.len(), result.decisions.len());
    let columns: Vec<(&str, &str)> = entries
        .iter()
        .map(|entry| (entry.promo.as_str(), entry.result.as_str()))
        .collect();
    assert_eq!(columns, vec![("start", "truncation"), ("low->high", "ok")]);
    assert_eq!(entries[1].model, DEFAULT_HIGH_MODEL);
}

#[tokio::test]
async fn failing_mid_and_high_exhaust_the_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let (ledger, path) = ledger_in(dir.path()).await;
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_model(DEFAULT_MID_MODEL, [ScriptedResponse::reply("I am not sure.")])
            .on_model(DEFAULT_HIGH_MODEL, [ScriptedResponse::reply("Still not sure.")]),
    );
    let weak = StaticRetrieval(RetrievalSignals {
        k: 0,
        avg_score: 0.0,
    });

    let result = session(SessionConfig::default(), &provider, ledger.clone())
        .with_retrieval(Arc::new(weak))
        .run("Explain the parser.", "fn parse() {}")
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::TierExhausted);
    assert_eq!(result.status.exit_code(), 4);
    assert_eq!(result.answer, None);
    assert!(result.error.as_deref().unwrap().contains(&result.correlation_id));
    assert_eq!(provider.call_count(), 2);
    assert!(matches!(result.decisions.last(), Some(Decision::Terminal {
        tier: Tier::High,
        ..
    })));

    ledger.close().await.unwrap();
    let entries = read_ledger(&path).await.unwrap();
    assert_eq!(entries.len(), result.decisions.len());
    let columns: Vec<(&str, &str)> = entries
        .iter()
        .map(|entry| (entry.promo.as_str(), entry.result.as_str()))
        .collect();
    assert_eq!(
        columns,
        vec![
            ("start", "validation"),
            ("mid->high", "validation"),
            ("terminal", "tier_exhausted"),
        ]
    );
    assert_eq!(entries[0].k, Some(0));
    assert!(entries[0].reason.starts_with("weak_retrieval"));
}

#[tokio::test]
async fn transport_failure_retries_once_on_the_same_tier() {
    let provider = Arc::new(ScriptedProvider::new().on_model(DEFAULT_LOW_MODEL, [
        ScriptedResponse::transport_error("connection reset"),
        ScriptedResponse::reply("FINAL: recovered"),
    ]));

    let result = session(SessionConfig::default(), &provider, LedgerHandle::disabled())
        .run("Ping?", "")
        .await
        .unwrap();

    assert_eq!(result.answer.as_deref(), Some("recovered"));
    assert!(matches!(result.decisions[1], Decision::Retry { tier: Tier::Low, .. }));
    assert_eq!(result.ledger_entries, 2);
}

#[tokio::test]
async fn sub_calls_past_the_depth_bound_never_reach_the_provider() {
    let dir = tempfile::tempdir().unwrap();
    let (ledger, path) = ledger_in(dir.path()).await;
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_prompt("[sub-call: look deeper]", [ScriptedResponse::reply("FINAL: root done")])
            .on_prompt("[sub-call refused", [ScriptedResponse::reply("FINAL: child done")])
            .on_prompt("Question: look deeper", [ScriptedResponse::reply("SUBCALL: even deeper")])
            .on_prompt("Question: top question", [ScriptedResponse::reply("SUBCALL: look deeper")]),
    );
    let mut config = SessionConfig::default();
    config.budget.max_subcall_depth = 1;

    let result = session(config, &provider, ledger.clone())
        .run("top question", "")
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.answer.as_deref(), Some("root done"));
    assert_eq!(result.turns, 2);
    assert_eq!(provider.call_count(), 4);
    assert!(
        provider
            .calls()
            .iter()
            .all(|call| !call.prompt.contains("Question: even deeper"))
    );

    ledger.close().await.unwrap();
    let entries = read_ledger(&path).await.unwrap();
    let mut depths: Vec<u32> = entries.iter().map(|entry| entry.depth).collect();
    depths.sort_unstable();
    assert_eq!(depths, vec![0, 0, 1, 1]);
    let child = entries.iter().find(|entry| entry.depth == 1).unwrap();
    assert_eq!(child.parent_id.as_deref(), Some(result.correlation_id.as_str()));
}

#[tokio::test]
async fn sub_calls_fan_out_and_answer_in_order() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_prompt("[sub-call: part two]", [ScriptedResponse::reply("FINAL: both done")])
            .on_prompt("Question: part one", [ScriptedResponse::reply("FINAL: one")])
            .on_prompt("Question: part two", [ScriptedResponse::reply("FINAL: two")])
            .on_prompt("Question: split it", [ScriptedResponse::reply(
                "SUBCALL: part one\nSUBCALL: part two",
            )]),
    );

    let result = session(SessionConfig::default(), &provider, LedgerHandle::disabled())
        .run("split it", "")
        .await
        .unwrap();

    assert_eq!(result.answer.as_deref(), Some("both done"));
    let last = provider.calls().pop().unwrap();
    let one = last.prompt.find("[sub-call: part one]\none").unwrap();
    let two = last.prompt.find("[sub-call: part two]\ntwo").unwrap();
    assert!(one < two);
}

#[tokio::test]
async fn concurrent_sub_calls_write_one_entry_per_decision() {
    let dir = tempfile::tempdir().unwrap();
    let (ledger, path) = ledger_in(dir.path()).await;
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_prompt("[sub-call: part three]", [ScriptedResponse::reply("FINAL: all done")])
            .on_prompt("Question: part one", [ScriptedResponse::reply("FINAL: one")])
            .on_prompt("Question: part two", [ScriptedResponse::reply("FINAL: two")])
            .on_prompt("Question: part three", [ScriptedResponse::reply("FINAL: three")])
            .on_prompt("Question: split it", [ScriptedResponse::reply(
                "SUBCALL: part one\nSUBCALL: part two\nSUBCALL: part three",
            )])
            .with_latency(Duration::from_millis(50)),
    );

    let result = session(SessionConfig::default(), &provider, ledger.clone())
        .run("split it", "")
        .await
        .unwrap();

    assert_eq!(result.answer.as_deref(), Some("all done"));
    assert_eq!(provider.call_count(), 5);
    assert_eq!(result.decisions.len(), 5);
    assert_eq!(result.ledger_entries, 5);

    let summary = ledger.close().await.unwrap();
    assert_eq!(summary.entries_written, 5);
    let entries = read_ledger(&path).await.unwrap();
    assert_eq!(entries.len(), result.decisions.len());
    // Each entry carries the books as its own commit left them.
    let mut tokens_used: Vec<u64> = entries.iter().map(|entry| entry.tokens_used).collect();
    tokens_used.sort_unstable();
    tokens_used.dedup();
    assert_eq!(tokens_used.len(), 5);
    assert_eq!(tokens_used.last().copied(), Some(result.budget.tokens_used));
    let children: Vec<_> = entries.iter().filter(|entry| entry.depth == 1).collect();
    assert_eq!(children.len(), 3);
    assert!(
        children
            .iter()
            .all(|entry| entry.parent_id.as_deref() == Some(result.correlation_id.as_str()))
    );
}

#[tokio::test]
async fn large_json_context_starts_on_the_high_tier() {
    let dir = tempfile::tempdir().unwrap();
    let (ledger, path) = ledger_in(dir.path()).await;
    let provider = Arc::new(
        ScriptedProvider::new().on_model(DEFAULT_HIGH_MODEL, [ScriptedResponse::reply("FINAL: 17997000")]),
    );
    let numbers: Vec<String> = (0..6000).map(|n| n.to_string()).collect();
    let context = format!("[{}]", numbers.join(","));

    let result = session(SessionConfig::default(), &provider, ledger.clone())
        .run("Sum the array", &context)
        .await
        .unwrap();

    assert_eq!(result.answer.as_deref(), Some("17997000"));
    let models: Vec<String> = provider.calls().into_iter().map(|call| call.model).collect();
    assert_eq!(models, vec![DEFAULT_HIGH_MODEL.to_string()]);
    assert_eq!(result.decisions, vec![Decision::Start {
        tier: Tier::High,
        reason: StartReason::PreFlight(PreFlightCause::NodeLimit),
    }]);

    ledger.close().await.unwrap();
    let entries = read_ledger(&path).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].line_count, 1);
    assert_eq!(entries[0].reason, "pre_flight:node_limit");
}

#[tokio::test]
async fn wide_csv_context_starts_on_the_high_tier() {
    let provider = Arc::new(
        ScriptedProvider::new().on_model(DEFAULT_HIGH_MODEL, [ScriptedResponse::reply("FINAL: 70")]),
    );
    let header: Vec<String> = (0..70).map(|n| format!("col{n}")).collect();
    let row: Vec<String> = (0..70).map(|n| n.to_string()).collect();
    let context = format!("{}\n{}\n{}\n", header.join(","), row.join(","), row.join(","));

    let result = session(SessionConfig::default(), &provider, LedgerHandle::disabled())
        .run("How many columns?", &context)
        .await
        .unwrap();

    assert_eq!(result.answer.as_deref(), Some("70"));
    assert_eq!(result.decisions, vec![Decision::Start {
        tier: Tier::High,
        reason: StartReason::PreFlight(PreFlightCause::CsvColumnLimit),
    }]);
}

#[tokio::test]
async fn exhausted_token_budget_stops_before_any_call() {
    let dir = tempfile::tempdir().unwrap();
    let (ledger, path) = ledger_in(dir.path()).await;
    let provider = Arc::new(ScriptedProvider::new());
    let mut config = SessionConfig::default();
    config.budget.max_tokens_per_session = 100;

    let result = session(config, &provider, ledger.clone())
        .run("Anything?", "")
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::BudgetExceeded);
    assert_eq!(result.status.exit_code(), 3);
    assert_eq!(provider.call_count(), 0);
    assert_eq!(result.budget.tokens_used, 0);

    ledger.close().await.unwrap();
    let entries = read_ledger(&path).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].result, "budget_exceeded");
}

#[tokio::test]
async fn missing_pricing_fails_before_any_call() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut config = SessionConfig::default();
    config.models.high_model = "mystery-model".to_string();

    let err = RlmSession::new(config, provider.clone(), LedgerHandle::disabled())
        .err()
        .unwrap();
    assert!(matches!(err, RlmError::ConfigValidation { .. }));
    assert!(err.to_string().contains("mystery-model"));
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn slow_provider_hits_the_session_timeout() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_model(DEFAULT_LOW_MODEL, [ScriptedResponse::reply("FINAL: late")])
            .with_latency(Duration::from_secs(30)),
    );
    let mut config = SessionConfig::default();
    config.session.session_timeout_seconds = 1;

    let result = session(config, &provider, LedgerHandle::disabled())
        .run("Hurry?", "")
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::TimedOut);
    assert_eq!(result.status.exit_code(), 5);
    assert_eq!(result.answer, None);
    // The in-flight reservation is released, nothing was committed.
    assert_eq!(result.budget.tokens_used, 0);
}

#[tokio::test]
async fn cancelling_the_session_reports_cancelled() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_model(DEFAULT_LOW_MODEL, [ScriptedResponse::reply("FINAL: late")])
            .with_latency(Duration::from_secs(30)),
    );
    let rlm = session(SessionConfig::default(), &provider, LedgerHandle::disabled());
    let cancel = rlm.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let result = rlm.run("Wait?", "").await.unwrap();
    assert_eq!(result.status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn turn_limit_keeps_the_last_reply_as_partial() {
    let provider = Arc::new(ScriptedProvider::new().on_model(DEFAULT_LOW_MODEL, [
        ScriptedResponse::reply("SUBCALL: think"),
        ScriptedResponse::reply("FINAL: sub answer"),
    ]));
    let mut config = SessionConfig::default();
    config.session.max_turns = 1;

    let result = session(config, &provider, LedgerHandle::disabled())
        .run("Loop?", "")
        .await
        .unwrap();

    assert_eq!(result.status, SessionStatus::TurnLimit);
    assert_eq!(result.partial.as_deref(), Some("SUBCALL: think"));
}

#[tokio::test]
async fn code_output_is_fed_back_to_the_model() {
    if !python_available() {
        return;
    }
    let provider = Arc::new(
        ScriptedProvider::new()
            .on_prompt("stdout:\n6", [ScriptedResponse::reply("FINAL: six characters")])
            .on_model(DEFAULT_LOW_MODEL, [ScriptedResponse::reply(
                "```python\nprint(len(context))\n```",
            )]),
    );

    let result = session(SessionConfig::default(), &provider, LedgerHandle::disabled())
        .run("How long is the context?", "abcdef")
        .await
        .unwrap();

    assert_eq!(result.answer.as_deref(), Some("six characters"));
    assert_eq!(result.turns, 2);
}

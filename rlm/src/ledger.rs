//! Append-only ledger of routing decisions, plus optional previews trace.
//!
//! Producers never touch the files. They hand records to one writer task over
//! a channel; [`LedgerHandle::flush`] is a barrier that resolves only after
//! every record sent before it is on disk.

use std::path::Path;
use std::sync::Arc;

use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;

use crate::config::TraceConfig;
use crate::error::Result;
use crate::error::RlmError;
use crate::routing::Tier;

/// One resolved routing decision.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub timestamp: String,
    pub task_id: String,
    pub parent_id: Option<String>,
    pub depth: u32,
    pub tier_used: Tier,
    pub model: String,
    /// `start`, `retry`, `low->high`, `terminal`, ...
    pub promo: String,
    pub line_count: u64,
    pub nesting_depth: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub k: Option<u32>,
    pub avg_score: Option<f64>,
    pub result: String,
    pub reason: String,
    pub wall_ms: u64,
    pub spent_usd: f64,
    pub tokens_used: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Prompt,
    Response,
    Stdout,
}

/// A truncated preview of something the session saw.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceEvent {
    pub timestamp: String,
    pub task_id: String,
    pub kind: TraceKind,
    pub tier: Option<Tier>,
    pub preview: String,
    pub total_chars: usize,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerSummary {
    pub entries_written: u64,
    pub trace_events_written: u64,
}

pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

enum LedgerCommand {
    Entry(Box<LedgerEntry>),
    Trace(TraceEvent),
    Flush(oneshot::Sender<std::result::Result<(), String>>),
    Close(oneshot::Sender<std::result::Result<LedgerSummary, String>>),
}

#[derive(Clone, Copy, Debug)]
struct PreviewLimits {
    prompt: usize,
    response: usize,
    stdout: usize,
}

struct HandleInner {
    tx: mpsc::UnboundedSender<LedgerCommand>,
    previews: PreviewLimits,
    tracing: bool,
}

/// Cloneable producer side of the ledger. A disabled handle drops everything.
#[derive(Clone)]
pub struct LedgerHandle {
    inner: Option<Arc<HandleInner>>,
}

impl LedgerHandle {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn record(&self, entry: LedgerEntry) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        inner
            .tx
            .send(LedgerCommand::Entry(Box::new(entry)))
            .map_err(|_| closed())
    }

    /// Record a preview of `text`. A no-op unless a trace path is configured.
    pub fn trace(&self, task_id: &str, kind: TraceKind, tier: Option<Tier>, text: &str) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        if !inner.tracing {
            return Ok(());
        }
        let limit = match kind {
            TraceKind::Prompt => inner.previews.prompt,
            TraceKind::Response => inner.previews.response,
            TraceKind::Stdout => inner.previews.stdout,
        };
        let event = TraceEvent {
            timestamp: timestamp(),
            task_id: task_id.to_string(),
            kind,
            tier,
            preview: text.chars().take(limit).collect(),
            total_chars: text.chars().count(),
        };
        inner.tx.send(LedgerCommand::Trace(event)).map_err(|_| closed())
    }

    /// Wait until everything recorded so far is written and flushed.
    pub async fn flush(&self) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        inner.tx.send(LedgerCommand::Flush(ack_tx)).map_err(|_| closed())?;
        ack_rx
            .await
            .map_err(|_| closed())?
            .map_err(|message| RlmError::Ledger { message })
    }

    /// Flush, stop the writer and report what it wrote.
    pub async fn close(&self) -> Result<LedgerSummary> {
        let Some(inner) = &self.inner else {
            return Ok(LedgerSummary::default());
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        inner.tx.send(LedgerCommand::Close(ack_tx)).map_err(|_| closed())?;
        ack_rx
            .await
            .map_err(|_| closed())?
            .map_err(|message| RlmError::Ledger { message })
    }
}

fn closed() -> RlmError {
    RlmError::Ledger {
        message: "ledger writer is closed".to_string(),
    }
}

pub struct LedgerWriter;

impl LedgerWriter {
    /// Open the ledger (and trace) files for appending and start the writer.
    pub async fn spawn(config: &TraceConfig) -> Result<LedgerHandle> {
        if !config.enabled {
            debug!("ledger disabled");
            return Ok(LedgerHandle::disabled());
        }
        let ledger = open_append(&config.ledger_path).await?;
        let trace = match &config.trace_path {
            Some(path) => Some(open_append(path).await?),
            None => None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = HandleInner {
            tx,
            previews: PreviewLimits {
                prompt: config.prompt_preview_chars,
                response: config.response_preview_chars,
                stdout: config.stdout_preview_chars,
            },
            tracing: trace.is_some(),
        };
        debug!(path = %config.ledger_path.display(), "ledger writer started");
        tokio::spawn(run_writer(rx, ledger, trace));
        Ok(LedgerHandle {
            inner: Some(Arc::new(inner)),
        })
    }
}

async fn open_append(path: &Path) -> Result<BufWriter<tokio::fs::File>> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| io_error(parent, err))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|err| io_error(path, err))?;
    Ok(BufWriter::new(file))
}

fn io_error(path: &Path, err: std::io::Error) -> RlmError {
    RlmError::Ledger {
        message: format!("{}: {err}", path.display()),
    }
}

struct Sink {
    out: BufWriter<tokio::fs::File>,
    written: u64,
}

impl Sink {
    async fn write_line<T: Serialize>(&mut self, record: &T) -> std::result::Result<(), String> {
        let mut line = serde_json::to_vec(record).map_err(|err| err.to_string())?;
        line.push(b'\n');
        self.out.write_all(&line).await.map_err(|err| err.to_string())?;
        self.written += 1;
        Ok(())
    }

    async fn flush(&mut self) -> std::result::Result<(), String> {
        self.out.flush().await.map_err(|err| err.to_string())
    }
}

async fn run_writer(
    mut rx: mpsc::UnboundedReceiver<LedgerCommand>,
    ledger: BufWriter<tokio::fs::File>,
    trace: Option<BufWriter<tokio::fs::File>>,
) {
    let mut ledger = Sink {
        out: ledger,
        written: 0,
    };
    let mut trace = trace.map(|out| Sink { out, written: 0 });
    // First write failure; reported to every later flush.
    let mut failure: Option<String> = None;

    while let Some(command) = rx.recv().await {
        match command {
            LedgerCommand::Entry(entry) => {
                if let Err(err) = ledger.write_line(&entry).await {
                    error!("ledger write failed: {err}");
                    failure.get_or_insert(err);
                }
            }
            LedgerCommand::Trace(event) => {
                if let Some(trace) = trace.as_mut()
                    && let Err(err) = trace.write_line(&event).await
                {
                    error!("trace write failed: {err}");
                    failure.get_or_insert(err);
                }
            }
            LedgerCommand::Flush(ack) => {
                let result = flush_all(&mut ledger, trace.as_mut()).await;
                let _ = ack.send(failure.clone().map_or(result, Err));
            }
            LedgerCommand::Close(ack) => {
                rx.close();
                let result = flush_all(&mut ledger, trace.as_mut()).await;
                let summary = LedgerSummary {
                    entries_written: ledger.written,
                    trace_events_written: trace.as_ref().map_or(0, |t| t.written),
                };
                debug!(
                    entries = summary.entries_written,
                    trace_events = summary.trace_events_written,
                    "ledger writer closed"
                );
                let _ = ack.send(failure.map_or(result.map(|()| summary), Err));
                return;
            }
        }
    }
    if let Err(err) = flush_all(&mut ledger, trace.as_mut()).await {
        error!("ledger flush on shutdown failed: {err}");
    }
}

async fn flush_all(
    ledger: &mut Sink,
    trace: Option<&mut Sink>,
) -> std::result::Result<(), String> {
    ledger.flush().await?;
    if let Some(trace) = trace {
        trace.flush().await?;
    }
    Ok(())
}

/// Read every entry of a ledger file.
pub async fn read_ledger(path: &Path) -> Result<Vec<LedgerEntry>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| io_error(path, err))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|err| RlmError::Ledger {
                message: format!("{}: bad ledger line: {err}", path.display()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(task_id: &str, promo: &str) -> LedgerEntry {
        LedgerEntry {
            timestamp: timestamp(),
            task_id: task_id.to_string(),
            parent_id: None,
            depth: 0,
            tier_used: Tier::Low,
            model: "qwen2.5-coder:7b".to_string(),
            promo: promo.to_string(),
            line_count: 42,
            nesting_depth: 2,
            tokens_in: 100,
            tokens_out: 20,
            k: None,
            avg_score: None,
            result: "ok".to_string(),
            reason: "structural".to_string(),
            wall_ms: 5,
            spent_usd: 0.0,
            tokens_used: 120,
        }
    }

    fn trace_config(dir: &Path) -> TraceConfig {
        TraceConfig {
            ledger_path: dir.join("ledger.jsonl"),
            trace_path: Some(dir.join("trace.jsonl")),
            prompt_preview_chars: 5,
            ..TraceConfig::default()
        }
    }

    #[tokio::test]
    async fn flush_is_a_completion_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let config = trace_config(dir.path());
        let handle = LedgerWriter::spawn(&config).await.unwrap();

        handle.record(entry("a", "start")).unwrap();
        handle.record(entry("a", "low->high")).unwrap();
        handle.flush().await.unwrap();

        let entries = read_ledger(&config.ledger_path).await.unwrap();
        assert_eq!(
            entries.iter().map(|e| e.promo.as_str()).collect::<Vec<_>>(),
            vec!["start", "low->high"]
        );
        let summary = handle.close().await.unwrap();
        assert_eq!(summary.entries_written, 2);
    }

    #[tokio::test]
    async fn concurrent_producers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = trace_config(dir.path());
        let handle = LedgerWriter::spawn(&config).await.unwrap();

        let mut tasks = Vec::new();
        for producer in 0..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                for n in 0..25 {
                    handle.record(entry(&format!("p{producer}-{n}"), "start")).unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let summary = handle.close().await.unwrap();
        assert_eq!(summary.entries_written, 200);

        let entries = read_ledger(&config.ledger_path).await.unwrap();
        assert_eq!(entries.len(), 200);
        let mut ids: Vec<_> = entries.iter().map(|e| e.task_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }

    #[tokio::test]
    async fn trace_previews_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let config = trace_config(dir.path());
        let handle = LedgerWriter::spawn(&config).await.unwrap();

        handle
            .trace("a", TraceKind::Prompt, Some(Tier::Mid), "abcdefghij")
            .unwrap();
        let summary = handle.close().await.unwrap();
        assert_eq!(summary.trace_events_written, 1);

        let content = std::fs::read_to_string(dir.path().join("trace.jsonl")).unwrap();
        let event: TraceEvent = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(event.preview, "abcde");
        assert_eq!(event.total_chars, 10);
        assert_eq!(event.tier, Some(Tier::Mid));
    }

    #[tokio::test]
    async fn disabled_ledger_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = TraceConfig {
            enabled: false,
            ..trace_config(dir.path())
        };
        let handle = LedgerWriter::spawn(&config).await.unwrap();
        assert!(!handle.is_enabled());
        handle.record(entry("a", "start")).unwrap();
        handle.flush().await.unwrap();
        assert_eq!(handle.close().await.unwrap(), LedgerSummary::default());
        assert!(!config.ledger_path.exists());
    }

    #[tokio::test]
    async fn records_after_close_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = trace_config(dir.path());
        let handle = LedgerWriter::spawn(&config).await.unwrap();
        handle.close().await.unwrap();
        // The writer closed its receiver before acknowledging.
        let err = handle.record(entry("late", "start")).unwrap_err();
        assert!(matches!(err, RlmError::Ledger { .. }));
    }
}

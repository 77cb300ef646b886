//! Sandbox executor for model-emitted Python.
//!
//! Code is checked twice. A static scan rejects disallowed imports and calls
//! to blocked builtins before any interpreter is started; whatever slips past
//! it runs in a fresh `python3 -I` child whose builtins have the blocked names
//! replaced by stubs and whose `import` statement enforces the allowlist.
//! In restrictive mode an import hands back a view of the module holding only
//! its public attributes, minus any submodule outside the allowlist.
//! This is a policy filter, not an isolation boundary: pair it with OS-level
//! isolation when the code is hostile.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStderr;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::error::RlmError;
use crate::policy::BlockedBuiltin;
use crate::policy::PolicyViolation;
use crate::policy::PolicyViolationType;
use crate::policy::SandboxPolicy;
use crate::policy::SecurityMode;

/// Bytes of interpreter stderr kept; the status line is always at the end.
const STDERR_TAIL_BYTES: usize = 64 * 1024;

const HARNESS: &str = r#"
import builtins
import json
import sys
import traceback
import types

_config = json.loads(sys.stdin.readline())
_source = sys.stdin.read()
_status_stream = sys.__stderr__
_tag = _config["nonce"]
_restrictive = _config["mode"] == "restrictive"
_allowed = frozenset(_config["allowed_modules"])
_blocked = frozenset(_config["blocked_builtins"])
_variables = _config.get("variables") or {}
_violations = []
del _config


class _Violation(BaseException):
    def __init__(self, status, name):
        super().__init__(f"{name} is not available in this sandbox")
        self.status = status
        self.name = name


def _raise_violation(status, name):
    violation = _Violation(status, name)
    _violations.append(violation)
    raise violation


def _report(status, error=None, name=None):
    try:
        sys.stdout.flush()
    except Exception:
        pass
    payload = json.dumps({"status": status, "error": error, "name": name})
    _status_stream.write("\n" + _tag + payload + "\n")
    _status_stream.flush()


def _stub(name):
    def _blocked_builtin(*args, **kwargs):
        _raise_violation("blocked_builtin", name)

    _blocked_builtin.__name__ = name
    return _blocked_builtin


_real_import = builtins.__import__
_safe_builtins = {
    key: (_stub(key) if key in _blocked and key != "__import__" else value)
    for key, value in builtins.__dict__.items()
}
_builtins_view = types.ModuleType("builtins")


def _module_view(module, seen):
    name = getattr(module, "__name__", "")
    if name == "builtins":
        return _builtins_view
    view = seen.get(name)
    if view is not None:
        return view
    view = types.ModuleType(name, getattr(module, "__doc__", None))
    seen[name] = view
    for key, value in list(vars(module).items()):
        if key.startswith("_"):
            continue
        if isinstance(value, types.ModuleType):
            if str(getattr(value, "__name__", "")).split(".")[0] not in _allowed:
                continue
            value = _module_view(value, seen)
        setattr(view, key, value)
    return view


def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level == 0:
        if _restrictive and name.split(".")[0] not in _allowed:
            _raise_violation("blocked_import", name)
        if name == "builtins":
            return _builtins_view
    module = _real_import(name, globals, locals, fromlist, level)
    if _restrictive:
        return _module_view(module, {})
    return module


_safe_builtins["__import__"] = _guarded_import
_builtins_view.__dict__.update(_safe_builtins)


def _describe(exc):
    line = None
    tb = exc.__traceback__
    while tb is not None:
        if tb.tb_frame.f_code.co_filename == "<sandbox>":
            line = tb.tb_lineno
        tb = tb.tb_next
    text = "".join(traceback.format_exception_only(type(exc), exc)).strip()
    return f"line {line}: {text}" if line else text


sys.stderr = sys.stdout
_namespace = dict(_variables)
_namespace.update({"__builtins__": _safe_builtins, "__name__": "__sandbox__"})
del _variables
_failure = None
try:
    exec(compile(_source, "<sandbox>", "exec"), _namespace)
except _Violation:
    pass
except SystemExit as exc:
    _failure = f"SystemExit: {exc.code}"
except BaseException as exc:
    _failure = _describe(exc)

if _violations:
    _report(_violations[0].status, str(_violations[0]), _violations[0].name)
elif _failure is not None:
    _report("runtime_error", _failure)
else:
    _report("completed")
"#;

/// Terminal status of one execution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Timeout,
    BlockedImport,
    BlockedBuiltin,
    RuntimeError,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::BlockedImport => "blocked_import",
            ExecutionStatus::BlockedBuiltin => "blocked_builtin",
            ExecutionStatus::RuntimeError => "runtime_error",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxPhase {
    Pending,
    Running,
    Finished(ExecutionStatus),
}

/// Record of one execution.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxExecution {
    pub code: String,
    pub mode: SecurityMode,
    pub timeout_seconds: u64,
    /// Captured output, at most `max_output_chars` characters.
    pub stdout: String,
    pub truncated: bool,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    /// Module or builtin that was refused.
    pub violation: Option<String>,
    pub duration_ms: u64,
}

impl SandboxExecution {
    /// Text fed back to the model for its next turn.
    pub fn observation(&self) -> String {
        let mut text = format!("[sandbox: {}]", self.status);
        if let Some(violation) = &self.violation {
            text.push_str(&format!(" refused `{violation}`"));
        }
        if let Some(error) = &self.error {
            text.push_str(&format!("\nerror: {error}"));
        }
        if !self.stdout.is_empty() {
            text.push_str("\nstdout:\n");
            text.push_str(&self.stdout);
        }
        if self.truncated {
            text.push_str("\n[output truncated]");
        }
        text
    }
}

/// Stdout capture that stops storing once the character limit is certainly
/// exceeded but keeps counting.
struct BoundedOutput {
    raw: Vec<u8>,
    max_chars: usize,
    overflowed: bool,
}

impl BoundedOutput {
    fn new(max_chars: usize) -> Self {
        Self {
            raw: Vec::new(),
            max_chars,
            overflowed: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        // A char is at most four bytes; past that many bytes the limit is hit.
        let cap = self.max_chars.saturating_mul(4).saturating_add(4);
        let room = cap.saturating_sub(self.raw.len());
        if bytes.len() > room {
            self.overflowed = true;
        }
        self.raw.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn finish(self) -> (String, bool) {
        let text = String::from_utf8_lossy(&self.raw);
        let mut truncated = self.overflowed;
        let mut out = String::new();
        for (count, c) in text.chars().enumerate() {
            if count == self.max_chars {
                truncated = true;
                break;
            }
            out.push(c);
        }
        (out, truncated)
    }
}

#[derive(Debug, Deserialize)]
struct HarnessStatus {
    status: ExecutionStatus,
    error: Option<String>,
    name: Option<String>,
}

/// Static checks run before an interpreter is started.
struct Prescan {
    import_stmt: Regex,
    from_import: Regex,
    builtin_call: Regex,
    def_prefix: Regex,
    escape_attr: Regex,
}

/// Attributes that lead from an allowed object back to real builtins or
/// interpreter internals.
const ESCAPE_ATTRIBUTES: [&str; 6] = [
    "builtins",
    "__builtins__",
    "__subclasses__",
    "__globals__",
    "__bases__",
    "__mro__",
];

/// Modules commonly re-exported as attributes of allowed modules.
const MODULE_ATTRIBUTES: [&str; 4] = ["sys", "os", "importlib", "subprocess"];

impl Prescan {
    fn new() -> Result<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern).map_err(|err| RlmError::Internal(anyhow::Error::new(err)))
        };
        Ok(Self {
            import_stmt: build(r"^\s*import\s+(.+)$")?,
            from_import: build(r"^\s*from\s+(\.*)([A-Za-z_][\w.]*)?\s+import\b")?,
            builtin_call: build(r"\b([A-Za-z_]\w*)\s*\(")?,
            def_prefix: build(r"\b(def|class)\s+$")?,
            escape_attr: build(r"(\.\s*)?\b([A-Za-z_]\w*)\b")?,
        })
    }

    /// First violation in source order, if any.
    fn check(&self, code: &str, policy: &SandboxPolicy) -> Option<PolicyViolation> {
        let blanked = blank_strings_and_comments(code);
        for line in blanked.lines() {
            for statement in line.split(';') {
                if let Some(violation) = self.check_statement(statement, policy) {
                    return Some(violation);
                }
            }
        }
        None
    }

    fn check_statement(&self, statement: &str, policy: &SandboxPolicy) -> Option<PolicyViolation> {
        if let Some(caps) = self.import_stmt.captures(statement) {
            let names = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            for name in names.split(',') {
                let module = name.split_whitespace().next().unwrap_or_default();
                if module.is_empty() {
                    continue;
                }
                if let Err(violation) = policy.check_import(module) {
                    return Some(violation);
                }
            }
        }
        if let Some(caps) = self.from_import.captures(statement) {
            let relative = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
            if let Some(module) = caps.get(2)
                && !relative
                && let Err(violation) = policy.check_import(module.as_str())
            {
                return Some(violation);
            }
        }
        if let Some(violation) = self.check_attributes(statement, policy) {
            return Some(violation);
        }
        for caps in self.builtin_call.captures_iter(statement) {
            let Some(name) = caps.get(1) else {
                continue;
            };
            let prefix = &statement[..name.start()];
            if self.def_prefix.is_match(prefix) {
                continue;
            }
            let name = match name.as_str() {
                "import_module" => BlockedBuiltin::DynamicImport.python_name(),
                // Methods such as `re.compile` are not the builtin.
                other if prefix.trim_end().ends_with('.') && !other.starts_with("__") => continue,
                other => other,
            };
            if let Err(violation) = policy.check_builtin(name) {
                return Some(violation);
            }
        }
        None
    }

    fn check_attributes(&self, statement: &str, policy: &SandboxPolicy) -> Option<PolicyViolation> {
        for caps in self.escape_attr.captures_iter(statement) {
            let Some(name) = caps.get(2).map(|m| m.as_str()) else {
                continue;
            };
            let dotted = caps.get(1).is_some();
            if ESCAPE_ATTRIBUTES.contains(&name) && (dotted || name.starts_with("__")) {
                return Some(PolicyViolation {
                    violation_type: PolicyViolationType::DisallowedBuiltin,
                    name: name.to_string(),
                });
            }
            if dotted
                && MODULE_ATTRIBUTES.contains(&name)
                && let Err(violation) = policy.check_import(name)
            {
                return Some(violation);
            }
        }
        None
    }
}

/// Replace the contents of string literals and comments with spaces,
/// keeping line structure.
fn blank_strings_and_comments(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    let mut out = String::with_capacity(code.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                out.push(' ');
                i += 1;
            }
            continue;
        }
        if c == '"' || c == '\'' {
            let triple = i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c;
            let quote_len = if triple { 3 } else { 1 };
            for _ in 0..quote_len {
                out.push(c);
            }
            i += quote_len;
            while i < chars.len() {
                let d = chars[i];
                if d == '\\' && i + 1 < chars.len() {
                    out.push(' ');
                    out.push(if chars[i + 1] == '\n' { '\n' } else { ' ' });
                    i += 2;
                    continue;
                }
                let closes = if triple {
                    d == c && i + 2 < chars.len() && chars[i + 1] == c && chars[i + 2] == c
                } else {
                    d == c || d == '\n'
                };
                if closes {
                    if d == '\n' {
                        break;
                    }
                    for _ in 0..quote_len {
                        out.push(c);
                    }
                    i += quote_len;
                    break;
                }
                out.push(if d == '\n' { '\n' } else { ' ' });
                i += 1;
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Runs code under a [`SandboxPolicy`].
pub struct SandboxExecutor {
    policy: SandboxPolicy,
    python_command: String,
    max_output_chars: usize,
    prescan: Prescan,
}

impl SandboxExecutor {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        Ok(Self {
            policy: config.policy.clone(),
            python_command: config.python_command.clone(),
            max_output_chars: config.max_output_chars,
            prescan: Prescan::new()?,
        })
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Execute `code` under `mode`. Never fails: every outcome is a status.
    pub async fn execute(
        &self,
        code: &str,
        mode: SecurityMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> SandboxExecution {
        self.execute_with_variables(code, mode, timeout, cancel, &BTreeMap::new())
            .await
    }

    /// Like [`Self::execute`], with `variables` bound as string globals.
    pub async fn execute_with_variables(
        &self,
        code: &str,
        mode: SecurityMode,
        timeout: Duration,
        cancel: &CancellationToken,
        variables: &BTreeMap<String, String>,
    ) -> SandboxExecution {
        let started = Instant::now();
        let policy = SandboxPolicy::new(
            mode,
            self.policy.allowed_modules.clone(),
            self.policy.blocked_builtins(),
        );
        let mut execution = SandboxExecution {
            code: code.to_string(),
            mode,
            timeout_seconds: timeout.as_secs(),
            stdout: String::new(),
            truncated: false,
            status: ExecutionStatus::RuntimeError,
            error: None,
            violation: None,
            duration_ms: 0,
        };
        debug!(phase = ?SandboxPhase::Pending, %mode, "sandbox execution queued");

        if let Some(violation) = self.prescan.check(code, &policy) {
            execution.status = match violation.violation_type {
                PolicyViolationType::DisallowedImport => ExecutionStatus::BlockedImport,
                PolicyViolationType::DisallowedBuiltin => ExecutionStatus::BlockedBuiltin,
            };
            execution.error = Some(format!("{} is not available in this sandbox", violation.name));
            execution.violation = Some(violation.name);
            return self.finish(execution, started);
        }

        if cancel.is_cancelled() {
            execution.status = ExecutionStatus::Timeout;
            execution.error = Some("cancelled before start".to_string());
            return self.finish(execution, started);
        }

        let nonce = Uuid::new_v4().simple().to_string();
        let header = serde_json::json!({
            "nonce": nonce,
            "mode": mode.as_str(),
            "allowed_modules": policy.allowed_modules.iter().collect::<Vec<_>>(),
            "blocked_builtins": policy
                .blocked_builtins()
                .map(|b| b.python_name())
                .collect::<Vec<_>>(),
            "variables": variables,
        });
        let mut input = header.to_string().into_bytes();
        input.push(b'\n');
        input.extend_from_slice(code.as_bytes());

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(err) => {
                execution.error = Some(format!(
                    "failed to start `{}`: {err}",
                    self.python_command
                ));
                return self.finish(execution, started);
            }
        };
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            execution.error = Some("failed to capture interpreter pipes".to_string());
            return self.finish(execution, started);
        };
        debug!(phase = ?SandboxPhase::Running, "sandbox interpreter started");

        let mut captured = BoundedOutput::new(self.max_output_chars);
        let mut stderr_tail = Vec::new();
        let outcome = {
            let run = drive(
                &mut child,
                stdin,
                stdout,
                stderr,
                input,
                &mut captured,
                &mut stderr_tail,
            );
            tokio::select! {
                result = run => Outcome::Exited(result),
                _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
                _ = cancel.cancelled() => Outcome::Cancelled,
            }
        };

        match outcome {
            Outcome::Exited(Ok(exit_status)) => {
                match parse_status(&stderr_tail, &nonce) {
                    Some(status) => {
                        execution.status = status.status;
                        execution.error = status.error;
                        execution.violation = status.name;
                    }
                    None => {
                        let tail = String::from_utf8_lossy(&stderr_tail);
                        let tail = tail.trim();
                        execution.error = Some(if tail.is_empty() {
                            format!("interpreter exited ({exit_status}) without reporting a result")
                        } else {
                            format!("interpreter exited ({exit_status}): {tail}")
                        });
                    }
                }
            }
            Outcome::Exited(Err(err)) => {
                execution.error = Some(format!("interpreter i/o failed: {err}"));
            }
            Outcome::TimedOut => {
                kill(&mut child).await;
                execution.status = ExecutionStatus::Timeout;
                execution.error = Some(format!(
                    "exceeded {}s wall-clock limit",
                    timeout.as_secs_f64()
                ));
            }
            Outcome::Cancelled => {
                kill(&mut child).await;
                execution.status = ExecutionStatus::Timeout;
                execution.error = Some("cancelled".to_string());
            }
        }

        let (stdout, truncated) = captured.finish();
        execution.stdout = stdout;
        execution.truncated = truncated;
        self.finish(execution, started)
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.python_command)
            .arg("-I")
            .arg("-u")
            .arg("-c")
            .arg(HARNESS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    fn finish(&self, mut execution: SandboxExecution, started: Instant) -> SandboxExecution {
        execution.duration_ms = started.elapsed().as_millis() as u64;
        match execution.status {
            ExecutionStatus::Completed => {}
            ExecutionStatus::BlockedImport | ExecutionStatus::BlockedBuiltin => warn!(
                status = %execution.status,
                violation = execution.violation.as_deref().unwrap_or_default(),
                "sandbox refused code"
            ),
            ExecutionStatus::Timeout | ExecutionStatus::RuntimeError => debug!(
                status = %execution.status,
                error = execution.error.as_deref().unwrap_or_default(),
                "sandbox execution failed"
            ),
        }
        debug!(
            phase = ?SandboxPhase::Finished(execution.status),
            duration_ms = execution.duration_ms,
            "sandbox execution finished"
        );
        execution
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn kill(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!("sandbox interpreter already gone: {err}");
    }
    let _ = child.wait().await;
}

async fn drive(
    child: &mut Child,
    mut stdin: ChildStdin,
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    input: Vec<u8>,
    captured: &mut BoundedOutput,
    stderr_tail: &mut Vec<u8>,
) -> std::io::Result<std::process::ExitStatus> {
    let write = async move {
        // The interpreter may exit before reading everything; that is reported
        // through its status, not here.
        let _ = stdin.write_all(&input).await;
        let _ = stdin.shutdown().await;
    };
    let read_stdout = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = stdout.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), std::io::Error>(());
            }
            captured.push(&buf[..n]);
        }
    };
    let read_stderr = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = stderr.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), std::io::Error>(());
            }
            stderr_tail.extend_from_slice(&buf[..n]);
            if stderr_tail.len() > STDERR_TAIL_BYTES * 2 {
                let excess = stderr_tail.len() - STDERR_TAIL_BYTES;
                stderr_tail.drain(..excess);
            }
        }
    };
    let ((), out, err) = tokio::join!(write, read_stdout, read_stderr);
    out?;
    err?;
    child.wait().await
}

/// Last status line carrying `nonce`.
fn parse_status(stderr: &[u8], nonce: &str) -> Option<HarnessStatus> {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .rev()
        .find_map(|line| line.strip_prefix(nonce))
        .and_then(|payload| serde_json::from_str(payload).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::ModuleAllowlist;
    use pretty_assertions::assert_eq;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|output| output.status.success())
    }

    fn executor(python_command: &str, max_output_chars: usize) -> SandboxExecutor {
        let config = SandboxConfig {
            policy: SandboxPolicy::new(SecurityMode::Permissive, ModuleAllowlist::default(), []),
            code_timeout_seconds: 5,
            max_output_chars,
            python_command: python_command.to_string(),
        };
        SandboxExecutor::new(&config).unwrap()
    }

    async fn run(executor: &SandboxExecutor, code: &str, mode: SecurityMode) -> SandboxExecution {
        executor
            .execute(code, mode, Duration::from_secs(5), &CancellationToken::new())
            .await
    }

    #[test]
    fn blanks_strings_and_comments() {
        let code = "x = \"import os\"  # open(\ny = '''\nexec(1)\n'''\nz = 1";
        let blanked = blank_strings_and_comments(code);
        assert_eq!(blanked.lines().count(), code.lines().count());
        assert!(!blanked.contains("import"));
        assert!(!blanked.contains("open"));
        assert!(!blanked.contains("exec"));
        assert!(blanked.contains("z = 1"));
    }

    #[test]
    fn prescan_finds_imports_and_builtin_calls() {
        let prescan = Prescan::new().unwrap();
        let restrictive =
            SandboxPolicy::new(SecurityMode::Restrictive, ModuleAllowlist::default(), []);
        let permissive = SandboxPolicy::new(SecurityMode::Permissive, ModuleAllowlist::default(), []);

        let found = |code: &str, policy: &SandboxPolicy| {
            prescan.check(code, policy).map(|v| (v.violation_type, v.name))
        };

        assert_eq!(
            found("import json, socket as s", &restrictive),
            Some((PolicyViolationType::DisallowedImport, "socket".to_string()))
        );
        assert_eq!(
            found("from os.path import join", &restrictive),
            Some((PolicyViolationType::DisallowedImport, "os.path".to_string()))
        );
        assert_eq!(found("from . import sibling", &restrictive), None);
        assert_eq!(found("import json; import re", &restrictive), None);
        assert_eq!(found("import socket", &permissive), None);
        assert_eq!(
            found("x = 1; data = open('f').read()", &permissive),
            Some((PolicyViolationType::DisallowedBuiltin, "open".to_string()))
        );
        assert_eq!(
            found("m = __import__('os')", &permissive),
            Some((PolicyViolationType::DisallowedBuiltin, "__import__".to_string()))
        );
        assert_eq!(
            found("importlib.import_module('os')", &permissive),
            Some((PolicyViolationType::DisallowedBuiltin, "__import__".to_string()))
        );
        assert_eq!(found("pattern = re.compile('a+')", &permissive), None);
        assert_eq!(found("def open(self):\n    pass", &permissive), None);
        assert_eq!(found("print('open(x)')  # eval(y)", &permissive), None);
    }

    #[test]
    fn prescan_rejects_attribute_escapes() {
        let prescan = Prescan::new().unwrap();
        let restrictive =
            SandboxPolicy::new(SecurityMode::Restrictive, ModuleAllowlist::default(), []);
        let permissive = SandboxPolicy::new(SecurityMode::Permissive, ModuleAllowlist::default(), []);

        let found = |code: &str, policy: &SandboxPolicy| {
            prescan.check(code, policy).map(|v| (v.violation_type, v.name))
        };

        assert_eq!(
            found("import dataclasses; b = dataclasses.builtins", &restrictive),
            Some((PolicyViolationType::DisallowedBuiltin, "builtins".to_string()))
        );
        assert_eq!(
            found("b = dataclasses.builtins", &permissive),
            Some((PolicyViolationType::DisallowedBuiltin, "builtins".to_string()))
        );
        assert_eq!(
            found("mods = dataclasses.sys.modules", &restrictive),
            Some((PolicyViolationType::DisallowedImport, "sys".to_string()))
        );
        assert_eq!(found("mods = dataclasses.sys.modules", &permissive), None);
        assert_eq!(
            found("classes = object.__subclasses__()", &permissive),
            Some((PolicyViolationType::DisallowedBuiltin, "__subclasses__".to_string()))
        );
        assert_eq!(
            found("g = dataclasses.fields.__globals__", &permissive),
            Some((PolicyViolationType::DisallowedBuiltin, "__globals__".to_string()))
        );
        assert_eq!(
            found("b = __builtins__", &permissive),
            Some((PolicyViolationType::DisallowedBuiltin, "__builtins__".to_string()))
        );
        assert_eq!(
            found("m = helper.__import__('os')", &permissive),
            Some((PolicyViolationType::DisallowedBuiltin, "__import__".to_string()))
        );
        assert_eq!(found("import builtins", &permissive), None);
        assert_eq!(found("print(hasattr(dataclasses, 'sys'))", &restrictive), None);
    }

    #[tokio::test]
    async fn allowlisted_module_cannot_reach_real_builtins() {
        let executor = executor("/nonexistent/python", 1_000);
        let code = "import dataclasses\nb = dataclasses.builtins\nprint(b.open('/etc/hostname').read())";
        let execution = run(&executor, code, SecurityMode::Restrictive).await;
        assert_eq!(execution.status, ExecutionStatus::BlockedBuiltin);
        assert_eq!(execution.violation.as_deref(), Some("builtins"));
    }

    #[tokio::test]
    async fn restrictive_imports_hide_module_internals() {
        if !python_available() {
            return;
        }
        let executor = executor("python3", 1_000);
        let code = "import dataclasses\n\
                    print(hasattr(dataclasses, 'builtins'), hasattr(dataclasses, 'sys'), hasattr(dataclasses, 'dataclass'))\n\
                    from collections import abc\n\
                    print(abc.Mapping.__name__)\n";
        let execution = run(&executor, code, SecurityMode::Restrictive).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stdout, "False False True\nMapping\n");
    }

    #[tokio::test]
    async fn restrictive_import_is_blocked_without_an_interpreter() {
        let executor = executor("/nonexistent/python", 100);
        let execution = run(&executor, "import socket\nprint(1)", SecurityMode::Restrictive).await;
        assert_eq!(execution.status, ExecutionStatus::BlockedImport);
        assert_eq!(execution.violation.as_deref(), Some("socket"));
        assert!(execution.observation().contains("blocked_import"));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_runtime_error() {
        let executor = executor("/nonexistent/python", 100);
        let execution = run(&executor, "print(1)", SecurityMode::Permissive).await;
        assert_eq!(execution.status, ExecutionStatus::RuntimeError);
        assert!(execution.error.unwrap_or_default().contains("failed to start"));
    }

    #[tokio::test]
    async fn permissive_import_runs_but_builtins_stay_blocked() {
        if !python_available() {
            return;
        }
        let executor = executor("python3", 1_000);
        let execution = run(
            &executor,
            "import socket\nprint('imported', socket.__name__)",
            SecurityMode::Permissive,
        )
        .await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stdout, "imported socket\n");

        // Reaches `open` without a direct call, so only the runtime stub sees it.
        let execution = run(
            &executor,
            "print('before')\nfns = [open]\nfns[0]('/etc/hostname')\nprint('after')",
            SecurityMode::Permissive,
        )
        .await;
        assert_eq!(execution.status, ExecutionStatus::BlockedBuiltin);
        assert_eq!(execution.violation.as_deref(), Some("open"));
        assert_eq!(execution.stdout, "before\n");
    }

    #[tokio::test]
    async fn swallowed_violation_is_still_reported() {
        if !python_available() {
            return;
        }
        let executor = executor("python3", 1_000);
        let code = "try:\n    fns = [exit]\n    fns[0]()\nexcept BaseException:\n    print('caught')\n";
        let execution = run(&executor, code, SecurityMode::Permissive).await;
        assert_eq!(execution.status, ExecutionStatus::BlockedBuiltin);
        assert_eq!(execution.violation.as_deref(), Some("exit"));
    }

    #[tokio::test]
    async fn restrictive_mode_allows_allowlisted_modules() {
        if !python_available() {
            return;
        }
        let executor = executor("python3", 1_000);
        let execution = run(
            &executor,
            "import json\nprint(json.dumps({'a': 1}))",
            SecurityMode::Restrictive,
        )
        .await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stdout, "{\"a\": 1}\n");
    }

    #[tokio::test]
    async fn variables_are_bound_as_globals() {
        if !python_available() {
            return;
        }
        let executor = executor("python3", 1_000);
        let mut variables = BTreeMap::new();
        variables.insert("context".to_string(), "line one\nline two".to_string());
        let execution = executor
            .execute_with_variables(
                "print(len(context.splitlines()))",
                SecurityMode::Restrictive,
                Duration::from_secs(5),
                &CancellationToken::new(),
                &variables,
            )
            .await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.stdout, "2\n");
    }

    #[tokio::test]
    async fn runtime_errors_are_results() {
        if !python_available() {
            return;
        }
        let executor = executor("python3", 1_000);
        let execution = run(&executor, "print('x')\n1 / 0\n", SecurityMode::Permissive).await;
        assert_eq!(execution.status, ExecutionStatus::RuntimeError);
        let error = execution.error.unwrap_or_default();
        assert!(error.contains("ZeroDivisionError"), "{error}");
        assert!(error.starts_with("line 2"), "{error}");
        assert_eq!(execution.stdout, "x\n");
    }

    #[tokio::test]
    async fn output_is_truncated_to_limit() {
        if !python_available() {
            return;
        }
        let executor = executor("python3", 100);
        let execution = run(&executor, "print('y' * 50000)", SecurityMode::Permissive).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(execution.truncated);
        assert_eq!(execution.stdout.chars().count(), 100);
    }

    #[tokio::test]
    async fn timeout_kills_and_keeps_partial_output() {
        if !python_available() {
            return;
        }
        let executor = executor("python3", 1_000);
        let execution = executor
            .execute(
                "print('started')\nwhile True:\n    pass\n",
                SecurityMode::Permissive,
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(execution.status, ExecutionStatus::Timeout);
        assert_eq!(execution.stdout, "started\n");
        assert!(execution.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn cancellation_stops_execution() {
        if !python_available() {
            return;
        }
        let executor = executor("python3", 1_000);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });
        let execution = executor
            .execute(
                "while True:\n    pass\n",
                SecurityMode::Permissive,
                Duration::from_secs(30),
                &cancel,
            )
            .await;
        assert_eq!(execution.status, ExecutionStatus::Timeout);
        assert_eq!(execution.error.as_deref(), Some("cancelled"));
    }

    #[test]
    fn bounded_output_counts_chars() {
        let mut output = BoundedOutput::new(3);
        output.push("héllo".as_bytes());
        let (text, truncated) = output.finish();
        assert_eq!(text, "hél");
        assert!(truncated);

        let mut output = BoundedOutput::new(10);
        output.push(b"ok");
        assert_eq!(output.finish(), ("ok".to_string(), false));
    }
}

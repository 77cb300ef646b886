//! Model reply protocol.
//!
//! A reply may contain fenced ```python blocks to run, `SUBCALL: <prompt>`
//! lines asking for recursive sub-calls, and a final answer given either as a
//! `FINAL: <text>` line (everything after the marker) or a fenced ```json block.

use serde_json::Value;

use crate::routing::OutputSchema;
use crate::routing::Tier;
use crate::routing::validate_extraction;

const SUBCALL_MARKER: &str = "SUBCALL:";
const FINAL_MARKER: &str = "FINAL:";

#[derive(Clone, Debug, PartialEq)]
pub enum FinalAnswer {
    Text(String),
    /// Validated and snippet-clipped extraction.
    Json(Value),
}

impl FinalAnswer {
    pub fn render(&self) -> String {
        match self {
            FinalAnswer::Text(text) => text.clone(),
            FinalAnswer::Json(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

/// What a model asked for in one reply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModelReply {
    pub code_blocks: Vec<String>,
    pub subcalls: Vec<String>,
    pub final_answer: Option<FinalAnswer>,
}

impl ModelReply {
    pub fn is_actionable(&self) -> bool {
        self.final_answer.is_some() || !self.code_blocks.is_empty() || !self.subcalls.is_empty()
    }
}

#[derive(Default)]
struct Sections {
    python: Vec<String>,
    json: Vec<String>,
    subcalls: Vec<String>,
    final_text: Option<String>,
}

fn split_sections(text: &str) -> Sections {
    let mut sections = Sections::default();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if let Some(info) = trimmed.strip_prefix("```") {
            let language = info.trim().to_ascii_lowercase();
            let mut body = Vec::new();
            for inner in lines.by_ref() {
                if inner.trim() == "```" {
                    break;
                }
                body.push(inner);
            }
            let body = body.join("\n");
            match language.as_str() {
                "python" | "py" => sections.python.push(body),
                "json" => sections.json.push(body),
                _ => {}
            }
            continue;
        }
        if let Some(prompt) = trimmed.strip_prefix(SUBCALL_MARKER) {
            let prompt = prompt.trim();
            if !prompt.is_empty() {
                sections.subcalls.push(prompt.to_string());
            }
            continue;
        }
        if sections.final_text.is_none()
            && let Some(rest) = trimmed.strip_prefix(FINAL_MARKER)
        {
            let mut answer = vec![rest.trim()];
            answer.extend(lines.by_ref());
            sections.final_text = Some(answer.join("\n").trim().to_string());
        }
    }
    sections
}

/// Parse a reply and validate any JSON answer against `schema`.
///
/// An `Err` means the reply cannot be used as-is and counts as a validation
/// failure of the tier that produced it.
pub fn parse_reply(
    tier: Tier,
    text: &str,
    schema: &OutputSchema,
) -> std::result::Result<ModelReply, String> {
    let sections = split_sections(text);
    let final_answer = match (sections.final_text, sections.json.last()) {
        (Some(text), _) if !text.is_empty() => Some(FinalAnswer::Text(text)),
        (Some(_), None) => return Err("empty FINAL answer".to_string()),
        (_, Some(raw)) => Some(FinalAnswer::Json(validate_extraction(tier, raw, schema)?)),
        (None, None) => None,
    };
    let reply = ModelReply {
        code_blocks: sections
            .python
            .into_iter()
            .filter(|code| !code.trim().is_empty())
            .collect(),
        subcalls: sections.subcalls,
        final_answer,
    };
    if !reply.is_actionable() {
        return Err("reply has no code, sub-call or final answer".to_string());
    }
    Ok(reply)
}

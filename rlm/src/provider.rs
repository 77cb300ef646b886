//! Seams to the outside world: model providers and the retrieval index.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::routing::RetrievalSignals;
use crate::routing::Tier;

#[derive(Clone, Debug, PartialEq)]
pub struct ProviderRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub tier: Tier,
    pub correlation_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// The provider stopped at the output cap.
    pub truncated: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

/// Sends one prompt to one model.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Code/doc graph index consulted for routing.
#[async_trait]
pub trait RetrievalIndex: Send + Sync {
    /// `None` when the index has nothing to say about `query`.
    async fn retrieve(&self, query: &str) -> Option<RetrievalSignals>;
}

/// No index configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRetrieval;

#[async_trait]
impl RetrievalIndex for NoRetrieval {
    async fn retrieve(&self, _query: &str) -> Option<RetrievalSignals> {
        None
    }
}

/// Fixed signals for every query.
#[derive(Clone, Copy, Debug)]
pub struct StaticRetrieval(pub RetrievalSignals);

#[async_trait]
impl RetrievalIndex for StaticRetrieval {
    async fn retrieve(&self, _query: &str) -> Option<RetrievalSignals> {
        Some(self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptedResponse {
    Reply(String),
    /// Reply cut off at the output cap.
    Truncated(String),
    Fail(ProviderError),
}

impl ScriptedResponse {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }

    pub fn truncated(text: impl Into<String>) -> Self {
        Self::Truncated(text.into())
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        Self::Fail(ProviderError::Transport(message.into()))
    }
}

struct ScriptRule {
    model: Option<String>,
    prompt_contains: Option<String>,
    responses: VecDeque<ScriptedResponse>,
}

impl ScriptRule {
    fn matches(&self, request: &ProviderRequest) -> bool {
        !self.responses.is_empty()
            && self.model.as_deref().is_none_or(|model| model == request.model)
            && self
                .prompt_contains
                .as_deref()
                .is_none_or(|needle| request.prompt.contains(needle))
    }
}

/// Offline provider that replays canned responses.
///
/// Rules are tried in the order they were added; the first rule whose filters
/// match and which still has responses answers the call. Token counts are a
/// quarter of the character counts, rounded up.
#[derive(Default)]
pub struct ScriptedProvider {
    rules: StdMutex<Vec<ScriptRule>>,
    calls: StdMutex<Vec<ProviderRequest>>,
    latency: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Responses for any prompt sent to `model`.
    pub fn on_model<I>(self, model: impl Into<String>, responses: I) -> Self
    where
        I: IntoIterator<Item = ScriptedResponse>,
    {
        self.rule(Some(model.into()), None, responses)
    }

    /// Responses for prompts containing `needle`, on any model.
    pub fn on_prompt<I>(self, needle: impl Into<String>, responses: I) -> Self
    where
        I: IntoIterator<Item = ScriptedResponse>,
    {
        self.rule(None, Some(needle.into()), responses)
    }

    /// Delay every call, for timeout tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn rule<I>(self, model: Option<String>, prompt_contains: Option<String>, responses: I) -> Self
    where
        I: IntoIterator<Item = ScriptedResponse>,
    {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(ScriptRule {
                model,
                prompt_contains,
                responses: responses.into_iter().collect(),
            });
        }
        self
    }

    pub fn calls(&self) -> Vec<ProviderRequest> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }

    fn next_response(&self, request: &ProviderRequest) -> ScriptedResponse {
        let Ok(mut rules) = self.rules.lock() else {
            return ScriptedResponse::transport_error("script lock poisoned");
        };
        rules
            .iter_mut()
            .find(|rule| rule.matches(request))
            .and_then(|rule| rule.responses.pop_front())
            .unwrap_or_else(|| {
                ScriptedResponse::transport_error(format!(
                    "no scripted response left for {}",
                    request.model
                ))
            })
    }
}

fn approx_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4).max(1)
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let response = self.next_response(&request);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let (text, truncated) = match response {
            ScriptedResponse::Reply(text) => (text, false),
            ScriptedResponse::Truncated(text) => (text, true),
            ScriptedResponse::Fail(err) => return Err(err),
        };
        Ok(ProviderResponse {
            tokens_in: approx_tokens(&request.prompt),
            tokens_out: approx_tokens(&text),
            text,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(model: &str, prompt: &str) -> ProviderRequest {
        ProviderRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            temperature: 0.1,
            max_tokens: 100,
            tier: Tier::Low,
            correlation_id: "c".to_string(),
        }
    }

    #[tokio::test]
    async fn rules_match_in_order_and_drain() {
        let provider = ScriptedProvider::new()
            .on_prompt("part two", [ScriptedResponse::reply("FINAL: two")])
            .on_model("small", [
                ScriptedResponse::reply("FINAL: first"),
                ScriptedResponse::truncated("FINAL: cut"),
            ]);

        let two = provider.send(request("small", "do part two")).await.unwrap();
        assert_eq!(two.text, "FINAL: two");
        let first = provider.send(request("small", "do part two")).await.unwrap();
        assert_eq!(first.text, "FINAL: first");
        let cut = provider.send(request("small", "x")).await.unwrap();
        assert!(cut.truncated);

        let exhausted = provider.send(request("small", "x")).await.unwrap_err();
        assert!(matches!(exhausted, ProviderError::Transport(_)));
        assert_eq!(provider.call_count(), 4);
    }

    #[tokio::test]
    async fn token_counts_follow_text_length() {
        let provider =
            ScriptedProvider::new().on_model("m", [ScriptedResponse::reply("12345678")]);
        let response = provider.send(request("m", "abcde")).await.unwrap();
        assert_eq!((response.tokens_in, response.tokens_out), (2, 2));
    }

    #[tokio::test]
    async fn no_retrieval_has_no_signals() {
        assert_eq!(NoRetrieval.retrieve("anything").await, None);
        let signals = RetrievalSignals {
            k: 3,
            avg_score: 0.5,
        };
        assert_eq!(StaticRetrieval(signals).retrieve("q").await, Some(signals));
    }
}

//! OpenAI-compatible chat completions over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use rlm_engine::GatewayConfig;
use rlm_engine::ModelProvider;
use rlm_engine::ProviderError;
use rlm_engine::ProviderRequest;
use rlm_engine::ProviderResponse;
use rlm_engine::Tier;
use rlm_engine::TokenEstimator;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReplyMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatReplyMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Local gateway for the low and mid tiers, remote endpoint for the high tier.
#[derive(Clone)]
pub struct OpenAiChatProvider {
    http: reqwest::Client,
    local_endpoint: String,
    remote_endpoint: String,
    api_key: Option<String>,
    estimator: TokenEstimator,
}

impl OpenAiChatProvider {
    pub fn new(gateway: &GatewayConfig, estimator: TokenEstimator) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(gateway.request_timeout_seconds))
            .build()
            .map_err(|err| ProviderError::Transport(err.to_string()))?;
        let api_key = std::env::var(&gateway.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        Ok(Self {
            http,
            local_endpoint: completions_url(&gateway.local_base_url),
            remote_endpoint: completions_url(&gateway.remote_base_url),
            api_key,
            estimator,
        })
    }

    fn endpoint_for(&self, tier: Tier) -> (&str, Option<&str>) {
        match tier {
            Tier::High => (&self.remote_endpoint, self.api_key.as_deref()),
            Tier::Low | Tier::Mid => (&self.local_endpoint, None),
        }
    }
}

fn completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

/// Gateways that omit `usage` are charged the estimator's count, never zero.
fn into_response(
    body: ChatResponse,
    prompt: &str,
    estimator: &TokenEstimator,
) -> Result<ProviderResponse, ProviderError> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Malformed("response has no choices".to_string()))?;
    let text = choice.message.content.unwrap_or_default();
    let (tokens_in, tokens_out) = match body.usage {
        Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
        None => {
            warn!("response carried no usage, charging estimated tokens");
            (estimator.estimate(prompt), estimator.estimate(&text))
        }
    };
    Ok(ProviderResponse {
        text,
        tokens_in,
        tokens_out,
        truncated: choice.finish_reason.as_deref() == Some("length"),
    })
}

#[async_trait]
impl ModelProvider for OpenAiChatProvider {
    async fn send(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let (endpoint, api_key) = self.endpoint_for(request.tier);
        let body = ChatRequest {
            model: &request.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        debug!(
            correlation_id = %request.correlation_id,
            endpoint,
            model = %request.model,
            "sending chat completion"
        );

        let mut builder = self.http.post(endpoint).json(&body);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Malformed(err.to_string()))?;
        into_response(parsed, &request.prompt, &self.estimator)
    }
}

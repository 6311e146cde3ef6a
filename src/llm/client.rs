// =============================================================================
// LLM Client (C7) — chat-completion call with retry and a per-call timeout
// =============================================================================
//
// Client construction follows the same `reqwest-middleware` +
// `reqwest-retry` `ExponentialBackoff` pattern as `exchange/binance.rs`
// (itself grounded on Zuytan-rustrade's `http_client_factory.rs`); the
// OpenAI-compatible chat-completions request/response shape is new, since
// the teacher never called an LLM.
// =============================================================================

use std::time::Duration;

use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::LlmError;
use crate::models::Provider;

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    /// Best-effort token usage from the provider; `0` when it doesn't report one.
    pub tokens: u64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

/// Talks to any OpenAI-compatible `/chat/completions` endpoint. One client
/// is shared process-wide; provider identity (base URL, key, model name) is
/// passed per call since a single model's provider can change at runtime.
pub struct LlmClient {
    client: ClientWithMiddleware,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(timeout: Duration) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let inner = reqwest::Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self { client, timeout }
    }

    #[instrument(skip(self, provider, system_message, user_message), name = "llm::invoke")]
    pub async fn invoke(
        &self,
        provider: &Provider,
        model_ident: &str,
        system_message: &str,
        user_message: &str,
        token_budget: u32,
    ) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", provider.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: model_ident,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_message,
                },
                ChatMessage {
                    role: "user",
                    content: user_message,
                },
            ],
            max_tokens: token_budget,
        };

        let result = tokio::time::timeout(
            self.timeout,
            self.client
                .post(&url)
                .bearer_auth(&provider.secret_key)
                .json(&body)
                .send(),
        )
        .await;

        let resp = match result {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Err(LlmError::RequestFailed(e.to_string())),
            Err(_) => return Err(LlmError::Timeout),
        };

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(LlmError::RequestFailed(format!(
                "{status} (retries exhausted): {text}"
            )));
        }
        if !status.is_success() {
            return Err(LlmError::RequestFailed(format!("{status}: {text}")));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::RequestFailed(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::RequestFailed("empty choices array".to_string()))?;
        let tokens = parsed.usage.map(|u| u.total_tokens).unwrap_or(0);

        debug!(tokens, "llm call completed");
        Ok(LlmResponse { content, tokens })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_sane_timeout() {
        let client = LlmClient::new(Duration::from_secs(60));
        assert_eq!(client.timeout, Duration::from_secs(60));
    }
}

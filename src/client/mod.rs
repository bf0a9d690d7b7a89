//! Model client for OpenAI-compatible chat-completions endpoints
//!
//! Every model role (council members, chairman, formatter, tool-calling,
//! classification, confidence) is queried through this client. Connection
//! parameters come from the config catalog; retry handles only timeouts.

mod stream;

pub use stream::StreamEvent;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{CouncilError, CouncilResult};

/// A chat message in the OpenAI wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// A completed (non-streaming) model response.
///
/// `content` already includes the reasoning-channel fallback: when a thinking
/// model emits only into `reasoning_content`, that text is promoted.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: String,
    pub reasoning_content: String,
    pub reasoning_details: Option<Value>,
}

/// Options for a single query.
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    pub timeout: Option<Duration>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Options for a retried query. The profile flags pick the timeout default.
#[derive(Debug, Clone, Default)]
pub struct RetryOpts {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub for_title: bool,
    pub for_evaluation: bool,
    pub temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize, Default)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning_details: Option<Value>,
}

/// Shared HTTP client over all configured model endpoints.
pub struct ModelClient {
    http: reqwest::Client,
    config: Arc<Config>,
}

impl ModelClient {
    pub fn new(config: Arc<Config>) -> Self {
        let connect = Duration::from_secs(config.timeout_config.connection_timeout);
        let http = reqwest::Client::builder()
            .connect_timeout(connect)
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Query a single model, returning both content channels.
    pub async fn query(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: QueryOpts,
    ) -> CouncilResult<ModelResponse> {
        let info = self.config.connection_info(model);
        let timeout = opts
            .timeout
            .unwrap_or(Duration::from_secs(self.config.timeout_config.default_timeout));

        let request = ChatRequest {
            model,
            messages,
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
            stream: None,
        };

        let mut builder = self
            .http
            .post(&info.api_endpoint)
            .timeout(timeout)
            .json(&request);
        if !info.api_key.is_empty() {
            builder = builder.bearer_auth(&info.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CouncilError::from_reqwest(&info.api_endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CouncilError::transport(
                &info.api_endpoint,
                format!("HTTP {status}: {body}"),
            ));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CouncilError::Parse(format!("chat completion body: {e}")))?;

        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| CouncilError::Parse("response had no choices".into()))?;

        let reasoning_content = message.reasoning_content.unwrap_or_default();
        let mut content = message.content.unwrap_or_default();

        // Thinking models sometimes emit only into the reasoning channel.
        if content.is_empty() && !reasoning_content.is_empty() {
            content = reasoning_content.clone();
        }

        Ok(ModelResponse {
            content,
            reasoning_content,
            reasoning_details: message.reasoning_details,
        })
    }

    /// Query with retry. Retries only on timeouts, with `factor^attempt`
    /// seconds of backoff between attempts; other errors fail immediately.
    pub async fn query_with_retry(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: RetryOpts,
    ) -> CouncilResult<ModelResponse> {
        let timeouts = &self.config.timeout_config;

        let timeout = opts.timeout.unwrap_or_else(|| {
            let secs = if opts.for_evaluation {
                timeouts.evaluation_timeout
            } else if opts.for_title {
                timeouts.title_generation_timeout
            } else {
                timeouts.default_timeout
            };
            Duration::from_secs(secs)
        });
        let max_retries = opts.max_retries.unwrap_or(timeouts.max_retries);
        let backoff = timeouts.retry_backoff_factor;

        let mut last_err = None;
        for attempt in 0..=max_retries {
            let result = self
                .query(
                    model,
                    messages,
                    QueryOpts {
                        timeout: Some(timeout),
                        max_tokens: None,
                        temperature: opts.temperature,
                    },
                )
                .await;

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retriable() && attempt < max_retries => {
                    let wait = backoff.saturating_pow(attempt);
                    warn!(model, attempt = attempt + 1, wait_secs = wait, "timeout, retrying");
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    last_err = Some(e);
                }
                Err(e) => {
                    debug!(model, error = %e, "query failed without retry");
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CouncilError::Unavailable(model.to_string())))
    }

    /// Fire the same messages at many models concurrently. A failing model
    /// maps to `None`; one failure never kills the batch.
    pub async fn query_models_parallel(
        &self,
        models: &[String],
        messages: &[ChatMessage],
        timeout: Option<Duration>,
    ) -> HashMap<String, Option<ModelResponse>> {
        let futures: Vec<_> = models
            .iter()
            .map(|model| {
                let messages = messages.to_vec();
                async move {
                    let result = self
                        .query_with_retry(
                            model,
                            &messages,
                            RetryOpts {
                                timeout,
                                ..Default::default()
                            },
                        )
                        .await;
                    (model.clone(), result)
                }
            })
            .collect();

        let mut out = HashMap::new();
        for (model, result) in join_all(futures).await {
            match result {
                Ok(response) => {
                    out.insert(model, Some(response));
                }
                Err(e) => {
                    warn!(model, error = %e, "model dropped from parallel batch");
                    out.insert(model, None);
                }
            }
        }
        out
    }
}

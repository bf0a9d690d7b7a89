//! SSE parsing for streamed chat completions
//!
//! The upstream endpoint emits line-delimited `data: <json>` records and a
//! final `data: [DONE]`. The read deadline is per chunk, not total, so a
//! reasoning model may think for minutes between chunks without tripping it.
//! Malformed records are skipped silently.

use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::Deserialize;

use super::{ChatMessage, ModelClient};

/// An event from a streaming model query. `content` fields are cumulative.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Thinking {
        delta: String,
        content: String,
    },
    Token {
        delta: String,
        content: String,
    },
    Complete {
        content: String,
        reasoning_content: String,
    },
    Error {
        error: String,
        content: String,
        reasoning_content: String,
    },
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl ModelClient {
    /// Stream a model response. The returned sequence is finite and not
    /// restartable: it ends with either `Complete` or `Error`.
    pub fn query_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let info = self.config().connection_info(model);
        let chunk_timeout =
            Duration::from_secs(self.config().timeout_config.streaming_chunk_timeout);
        let http = self.http_clone();
        let model = model.to_string();
        let messages = messages.to_vec();

        stream! {
            let mut content = String::new();
            let mut reasoning = String::new();

            let mut body = serde_json::json!({
                "model": model,
                "messages": messages,
                "stream": true,
            });
            if let Some(limit) = max_tokens {
                body["max_tokens"] = serde_json::json!(limit);
            }

            let mut builder = http.post(&info.api_endpoint).json(&body);
            if !info.api_key.is_empty() {
                builder = builder.bearer_auth(&info.api_key);
            }

            let response = match builder.send().await {
                Ok(r) => r,
                Err(e) => {
                    yield StreamEvent::Error {
                        error: e.to_string(),
                        content,
                        reasoning_content: reasoning,
                    };
                    return;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                yield StreamEvent::Error {
                    error: format!("HTTP {status}: {body}"),
                    content,
                    reasoning_content: reasoning,
                };
                return;
            }

            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();

            'outer: loop {
                let chunk = match tokio::time::timeout(chunk_timeout, bytes.next()).await {
                    Ok(Some(Ok(chunk))) => chunk,
                    Ok(Some(Err(e))) => {
                        yield StreamEvent::Error {
                            error: e.to_string(),
                            content,
                            reasoning_content: reasoning,
                        };
                        return;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        yield StreamEvent::Error {
                            error: format!(
                                "no chunk within {}s",
                                chunk_timeout.as_secs()
                            ),
                            content,
                            reasoning_content: reasoning,
                        };
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);

                    if line.is_empty() {
                        continue;
                    }
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'outer;
                    }

                    // Individual records that fail to decode are skipped.
                    let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) else {
                        continue;
                    };

                    for choice in parsed.choices {
                        if let Some(delta) = choice.delta.reasoning_content {
                            if !delta.is_empty() {
                                reasoning.push_str(&delta);
                                yield StreamEvent::Thinking {
                                    delta,
                                    content: reasoning.clone(),
                                };
                            }
                        }
                        if let Some(delta) = choice.delta.content {
                            if !delta.is_empty() {
                                content.push_str(&delta);
                                yield StreamEvent::Token {
                                    delta,
                                    content: content.clone(),
                                };
                            }
                        }
                    }
                }
            }

            yield StreamEvent::Complete {
                content,
                reasoning_content: reasoning,
            };
        }
    }

    pub(super) fn http_clone(&self) -> reqwest::Client {
        self.http.clone()
    }
}

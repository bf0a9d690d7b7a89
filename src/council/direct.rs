//! Direct response path
//!
//! Factual and chat queries skip the council: the chairman streams an answer
//! directly, with tool output injected when a tool fired. A refusal detector
//! guards the tool-augmented case; an optional formatter pass reformats the
//! markdown when a distinct formatter model is configured.

use serde_json::json;
use tracing::{info, warn};

use crate::client::{ChatMessage, RetryOpts, StreamEvent};
use crate::events::{Event, EventSender};
use crate::mcp::ToolOutcome;
use crate::postprocess::is_refusal;
use crate::prompts::{
    ANTI_REFUSAL_BANNER, ANTI_REFUSAL_BANNER_ESCALATED, format_tool_result_for_prompt,
};
use crate::tracker::Timing;

use super::{ALL_MODELS_FAILED, Council, STAGE_RETRIES, Stage3Result, drain_model_stream};

/// Refusal regenerations after the first accepted stream.
const REFUSAL_RETRIES: u32 = 2;

impl Council {
    pub async fn direct_response(
        &self,
        query: &str,
        tool_result: Option<&ToolOutcome>,
        identity_context: &str,
        events: &EventSender,
    ) -> Stage3Result {
        let chairman = self.config.chairman_model();
        let max_tokens = self.config.response_config.max_tokens.stage3;
        let tool_succeeded = tool_result.map(|t| !t.is_failed()).unwrap_or(false);

        let mut empty_retries = 0u32;
        let mut refusal_retries = 0u32;
        let mut escalated = false;

        loop {
            let messages = self.build_direct_messages(query, tool_result, identity_context, escalated);
            let mut last_timing = Timing::default();

            let streamed = drain_model_stream(
                &self.client,
                &chairman,
                &messages,
                max_tokens,
                |event, tracker| {
                    last_timing = tracker.timing();
                    match event {
                        StreamEvent::Token { delta, content } => {
                            events.send(Event::DirectResponseToken {
                                model: chairman.clone(),
                                delta: delta.clone(),
                                content: content.clone(),
                                timing: last_timing,
                            })
                        }
                        StreamEvent::Thinking { delta, content } => {
                            events.send(Event::DirectResponseThinking {
                                model: chairman.clone(),
                                delta: delta.clone(),
                                content: content.clone(),
                                timing: last_timing,
                            })
                        }
                        _ => {}
                    }
                },
            )
            .await;

            let content = streamed.effective_content();

            if content.trim().is_empty() {
                if empty_retries < STAGE_RETRIES {
                    empty_retries += 1;
                    let reason = streamed
                        .error
                        .clone()
                        .unwrap_or_else(|| "empty response".to_string());
                    warn!(model = chairman, reason, "retrying direct response");
                    events.send(Event::DirectResponseRetry {
                        model: chairman.clone(),
                        attempt: empty_retries,
                        reason,
                    });
                    continue;
                }

                events.send(Event::DirectResponseError {
                    model: chairman.clone(),
                    error: streamed
                        .error
                        .unwrap_or_else(|| "no content after retries".to_string()),
                });
                return Stage3Result {
                    model: chairman,
                    response: ALL_MODELS_FAILED.to_string(),
                };
            }

            // The refusal check only applies when live tool data was
            // available; the last attempt is accepted verbatim.
            if tool_succeeded && is_refusal(&content) && refusal_retries < REFUSAL_RETRIES {
                refusal_retries += 1;
                escalated = true;
                info!(attempt = refusal_retries, "refusal detected, regenerating");
                events.send(Event::DirectResponseRetry {
                    model: chairman.clone(),
                    attempt: refusal_retries,
                    reason: "refusal phrase detected".to_string(),
                });
                continue;
            }

            let result = self.maybe_reformat(&chairman, content).await;

            events.send(Event::DirectResponseComplete {
                data: json!({"model": result.model, "response": result.response}),
                timing: last_timing,
            });

            return result;
        }
    }

    fn build_direct_messages(
        &self,
        query: &str,
        tool_result: Option<&ToolOutcome>,
        identity_context: &str,
        escalated: bool,
    ) -> Vec<ChatMessage> {
        let mut system = String::new();
        if !identity_context.is_empty() {
            system.push_str(identity_context);
            system.push_str("\n\n");
        }
        system.push_str("You are a helpful assistant. Answer clearly and concisely.");

        let user = match tool_result {
            Some(outcome) => {
                if !outcome.is_failed() {
                    system.push_str("\n\n");
                    system.push_str(if escalated {
                        ANTI_REFUSAL_BANNER_ESCALATED
                    } else {
                        ANTI_REFUSAL_BANNER
                    });
                }
                format!(
                    "{}\n\n{}",
                    format_tool_result_for_prompt(outcome),
                    query
                )
            }
            None => query.to_string(),
        };

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    /// Run the formatter pass when a distinct formatter model is configured.
    /// Failures keep the chairman's text.
    async fn maybe_reformat(&self, chairman: &str, content: String) -> Stage3Result {
        let formatter = self.config.formatter_model();
        if formatter == chairman {
            return Stage3Result {
                model: chairman.to_string(),
                response: content,
            };
        }

        let prompt = format!(
            "Reformat the following answer into clean, well-structured markdown. Preserve its \
             meaning and facts exactly. Do not add image references.\n\n{content}"
        );

        match self
            .client
            .query_with_retry(
                &formatter,
                &[ChatMessage::user(prompt)],
                RetryOpts {
                    max_retries: Some(1),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(response) if !response.content.trim().is_empty() => Stage3Result {
                model: formatter,
                response: response.content,
            },
            _ => Stage3Result {
                model: chairman.to_string(),
                response: content,
            },
        }
    }
}

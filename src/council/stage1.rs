//! Stage 1: parallel streamed answers
//!
//! Every council model answers the query concurrently. A model retries on
//! empty output or stream error up to the stage budget, falls back to its
//! reasoning channel, and is silently dropped if it still produces nothing.
//! Each successful answer kicks off a fire-and-forget peer evaluation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tracing::{debug, warn};

use crate::client::{ChatMessage, ModelClient, RetryOpts, StreamEvent};
use crate::events::{Event, EventSender};
use crate::mcp::ToolOutcome;
use crate::metrics::{EvalScores, MetricsStore};
use crate::prompts::{ANTI_REFUSAL_BANNER, extract_json_block, format_tool_result_for_prompt};
use crate::tracker::Timing;

use super::{Council, STAGE_RETRIES, Stage1Entry, drain_model_stream};

impl Council {
    pub async fn stage1_collect_responses(
        &self,
        query: &str,
        tool_result: Option<&ToolOutcome>,
        identity_context: &str,
        events: &EventSender,
    ) -> Vec<Stage1Entry> {
        let models = self.config.council_models();
        let max_tokens = self.config.response_config.max_tokens.stage1;
        let messages = self.build_stage1_messages(query, tool_result, identity_context);

        let tasks: Vec<_> = models
            .iter()
            .map(|model| {
                let messages = messages.clone();
                let events = events.clone();
                async move {
                    self.stage1_single_model(model, &messages, max_tokens, &events)
                        .await
                }
            })
            .collect();

        let results = join_all(tasks).await;

        let entries: Vec<Stage1Entry> = results.into_iter().flatten().collect();

        // Fire-and-forget peer evaluation; owned copies only, the request
        // context may be gone before these finish.
        for entry in &entries {
            spawn_evaluation(
                self.client.clone(),
                self.metrics.clone(),
                entry.model.clone(),
                query.to_string(),
                entry.response.clone(),
            );
        }

        entries
    }

    async fn stage1_single_model(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
        events: &EventSender,
    ) -> Option<Stage1Entry> {
        let mut attempts = 0u32;
        let mut retried = false;

        loop {
            let mut last_timing = Timing::default();
            let mut token_count = 0u64;

            let streamed = drain_model_stream(
                &self.client,
                model,
                messages,
                max_tokens,
                |event, tracker| {
                    last_timing = tracker.timing();
                    match event {
                        StreamEvent::Token { delta, content } => {
                            token_count += 1;
                            events.send(Event::Stage1Token {
                                model: model.to_string(),
                                delta: delta.clone(),
                                content: content.clone(),
                                timing: last_timing,
                            });
                        }
                        StreamEvent::Thinking { delta, content } => {
                            token_count += 1;
                            events.send(Event::Stage1Thinking {
                                model: model.to_string(),
                                delta: delta.clone(),
                                content: content.clone(),
                                timing: last_timing,
                            });
                        }
                        _ => {}
                    }
                },
            )
            .await;

            let content = streamed.effective_content();

            if content.trim().is_empty() {
                if attempts < STAGE_RETRIES {
                    attempts += 1;
                    retried = true;
                    let reason = streamed
                        .error
                        .clone()
                        .unwrap_or_else(|| "empty response".to_string());
                    warn!(model, attempt = attempts, reason, "stage1 retry");
                    events.send(Event::Stage1ModelRetry {
                        model: model.to_string(),
                        attempt: attempts,
                        reason,
                    });
                    continue;
                }

                // Non-responders are dropped; the stage tolerates partial
                // results as long as one model answers.
                events.send(Event::Stage1ModelError {
                    model: model.to_string(),
                    error: streamed
                        .error
                        .unwrap_or_else(|| "no content after retries".to_string()),
                });
                self.metrics
                    .record_query_result(model, false, 0, 0.0, retried);
                return None;
            }

            events.send(Event::Stage1ModelComplete {
                model: model.to_string(),
                response: content.clone(),
                timing: last_timing,
            });
            self.metrics.record_query_result(
                model,
                true,
                token_count,
                last_timing.elapsed_seconds * 1000.0,
                retried,
            );

            return Some(Stage1Entry {
                model: model.to_string(),
                response: content,
            });
        }
    }

    fn build_stage1_messages(
        &self,
        query: &str,
        tool_result: Option<&ToolOutcome>,
        identity_context: &str,
    ) -> Vec<ChatMessage> {
        let mut system = String::new();
        if !identity_context.is_empty() {
            system.push_str(identity_context);
            system.push_str("\n\n");
        }
        system.push_str(
            "You are one of several expert advisors answering the same question \
             independently. Give your own best, complete answer.",
        );
        if self.config.response_config.response_style == "concise" {
            system.push_str(" Be concise: make every sentence carry weight.");
        }

        let user = match tool_result {
            Some(outcome) => {
                if !outcome.is_failed() {
                    system.push_str("\n\n");
                    system.push_str(ANTI_REFUSAL_BANNER);
                }
                format!("{}\n\n{}", format_tool_result_for_prompt(outcome), query)
            }
            None => query.to_string(),
        };

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}

/// Evaluate a stage-1 response with a peer model in the background and
/// record the scores. Never blocks or fails the request.
fn spawn_evaluation(
    client: Arc<ModelClient>,
    metrics: Arc<MetricsStore>,
    model: String,
    query: String,
    response: String,
) {
    tokio::spawn(async move {
        let Some(evaluator) = metrics.evaluator_for(&model) else {
            debug!(model, "no evaluator available");
            return;
        };

        let prompt = format!(
            "Rate this answer to the user's question on a 1-5 scale for each category.\n\n\
             QUESTION: {query}\n\n\
             ANSWER:\n{response}\n\n\
             Respond with ONLY a JSON object:\n\
             {{\"verbosity\": N, \"expertise\": N, \"adherence\": N, \"clarity\": N, \
             \"overall\": N}}"
        );

        let result = client
            .query_with_retry(
                &evaluator,
                &[ChatMessage::user(prompt)],
                RetryOpts {
                    timeout: Some(Duration::from_secs(60)),
                    max_retries: Some(0),
                    for_evaluation: true,
                    ..Default::default()
                },
            )
            .await;

        let Ok(eval_response) = result else {
            debug!(model, evaluator, "evaluation call failed");
            return;
        };

        let Ok(parsed) =
            serde_json::from_str::<serde_json::Value>(&extract_json_block(&eval_response.content))
        else {
            return;
        };

        let score = |key: &str| -> u8 {
            parsed
                .get(key)
                .and_then(|v| v.as_u64())
                .unwrap_or(3)
                .clamp(1, 5) as u8
        };

        metrics.record_evaluation(
            &model,
            EvalScores {
                verbosity: score("verbosity"),
                expertise: score("expertise"),
                adherence: score("adherence"),
                clarity: score("clarity"),
                overall: score("overall"),
            },
        );
        debug!(model, evaluator, scores = %parsed, "evaluation recorded");
    });
}

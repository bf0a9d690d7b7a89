//! Stage 3: synthesis
//!
//! The formatter model (the chairman unless configured separately) sees the
//! original query, every stage-1 answer attributed by model, and every
//! stage-2 ranking text, and streams one final markdown answer. Placeholder
//! images are stripped from the result.

use tracing::warn;

use crate::client::{ChatMessage, StreamEvent};
use crate::events::{Event, EventSender};
use crate::mcp::ToolOutcome;
use crate::postprocess::strip_fake_images;
use crate::prompts::format_tool_result_for_prompt;

use super::{Council, SYNTHESIS_FALLBACK, Stage1Entry, Stage2Entry, Stage3Result,
    drain_model_stream};

impl Council {
    pub async fn stage3_synthesize(
        &self,
        query: &str,
        stage1: &[Stage1Entry],
        stage2: &[Stage2Entry],
        tool_context: &[ToolOutcome],
        identity_context: &str,
        events: &EventSender,
    ) -> Stage3Result {
        let formatter = self.config.formatter_model();
        let max_tokens = self.config.response_config.max_tokens.stage3;

        let mut system = String::new();
        if !identity_context.is_empty() {
            system.push_str(identity_context);
            system.push_str("\n\n");
        }
        system.push_str(
            "You are the chairman of a council of models. Synthesize their answers and peer \
             rankings into one final, authoritative response. Use rich markdown formatting: \
             headers, tables, lists, and code blocks where they help. Never include image \
             references of any kind.",
        );

        let messages = vec![
            ChatMessage::system(system),
            ChatMessage::user(build_synthesis_prompt(query, stage1, stage2, tool_context)),
        ];

        let streamed = drain_model_stream(
            &self.client,
            &formatter,
            &messages,
            max_tokens,
            |event, tracker| match event {
                StreamEvent::Token { delta, content } => events.send(Event::Stage3Token {
                    model: formatter.clone(),
                    delta: delta.clone(),
                    content: content.clone(),
                    timing: tracker.timing(),
                }),
                StreamEvent::Thinking { delta, content } => events.send(Event::Stage3Thinking {
                    model: formatter.clone(),
                    delta: delta.clone(),
                    content: content.clone(),
                    timing: tracker.timing(),
                }),
                _ => {}
            },
        )
        .await;

        let content = streamed.effective_content();

        if content.trim().is_empty() {
            warn!(model = formatter, "synthesis produced no content");
            events.send(Event::Stage3Error {
                error: streamed
                    .error
                    .unwrap_or_else(|| "empty synthesis".to_string()),
            });
            return Stage3Result {
                model: formatter,
                response: SYNTHESIS_FALLBACK.to_string(),
            };
        }

        Stage3Result {
            model: formatter,
            response: strip_fake_images(&content),
        }
    }
}

fn build_synthesis_prompt(
    query: &str,
    stage1: &[Stage1Entry],
    stage2: &[Stage2Entry],
    tool_context: &[ToolOutcome],
) -> String {
    let mut prompt = format!("## Original Question\n{query}\n\n## Council Responses\n\n");

    for entry in stage1 {
        prompt.push_str(&format!("### {}\n{}\n\n", entry.model, entry.response));
    }

    if !stage2.is_empty() {
        prompt.push_str("## Peer Rankings\n\n");
        for entry in stage2 {
            prompt.push_str(&format!(
                "### {} (round {})\n{}\n\n",
                entry.model, entry.round, entry.ranking_text
            ));
        }
    }

    if !tool_context.is_empty() {
        prompt.push_str("## Live Tool Data\n\n");
        for outcome in tool_context {
            prompt.push_str(&format_tool_result_for_prompt(outcome));
            prompt.push_str("\n\n");
        }
    }

    prompt.push_str(
        "## Task\nWrite the final answer. Weigh the responses by how the council ranked them, \
         resolve disagreements explicitly, and present the result as polished markdown. No \
         images.",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_synthesis_prompt_names_models() {
        let stage1 = vec![
            Stage1Entry {
                model: "model-a".into(),
                response: "Answer from A".into(),
            },
            Stage1Entry {
                model: "model-b".into(),
                response: "Answer from B".into(),
            },
        ];
        let stage2 = vec![Stage2Entry {
            model: "model-a".into(),
            ranking_text: "FINAL RANKING:\n1. Response B (5/5)".into(),
            parsed_ranking: vec!["Response B".into()],
            quality_ratings: HashMap::new(),
            round: 1,
        }];

        let prompt = build_synthesis_prompt("the question", &stage1, &stage2, &[]);
        assert!(prompt.contains("### model-a\nAnswer from A"));
        assert!(prompt.contains("### model-b\nAnswer from B"));
        assert!(prompt.contains("(round 1)"));
        assert!(prompt.contains("No images"));
    }
}

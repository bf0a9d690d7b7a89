//! Mid-deliberation tool assessment
//!
//! After Stage 1 and again after Stage 2 the orchestrator may decide the
//! council's responses are missing current information. The assessment sees
//! a summary of the stage output, the tool catalog, and prior tool results,
//! and must not re-request data that already appears in those results.

use serde_json::Value;
use tracing::debug;

use crate::client::{ChatMessage, ModelClient, RetryOpts};
use crate::mcp::ToolOutcome;
use crate::prompts::extract_json_block;

#[derive(Debug, Clone, Default)]
pub struct MidDeliberationAssessment {
    pub needs_tool: bool,
    pub tool_name: String,
    pub reasoning: String,
}

/// Only a web search may run mid-deliberation; everything else belongs in
/// the upfront tool check. The match is a loose substring on the
/// recommended tool name, which can mis-fire for unrelated tools whose name
/// contains "search" (kept intentionally, see DESIGN.md).
pub fn is_websearch_tool(tool_name: &str) -> bool {
    let lower = tool_name.to_lowercase();
    lower.contains("websearch") || lower.contains("search")
}

pub async fn assess_tool_needs(
    client: &ModelClient,
    query: &str,
    stage: &str,
    stage_summary: &str,
    available_tools: &str,
    previous_tools: &[ToolOutcome],
) -> Option<MidDeliberationAssessment> {
    if available_tools.is_empty() {
        return None;
    }

    let previous = if previous_tools.is_empty() {
        "None".to_string()
    } else {
        previous_tools
            .iter()
            .map(|t| {
                format!(
                    "- {} (success: {}): {}",
                    t.full_name(),
                    t.success,
                    truncate(&t.extracted_output().to_string(), 300),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let prompt = format!(
        "The council is mid-deliberation on a user query. Judge whether the responses so far \
         are missing current information that a tool could supply.\n\n\
         USER QUERY: \"{query}\"\n\n\
         {stage_upper} OUTPUT SUMMARY:\n{stage_summary}\n\n\
         {available_tools}\n\n\
         TOOL RESULTS ALREADY AVAILABLE:\n{previous}\n\n\
         Do NOT request a tool whose data already appears in the results above.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"needs_tool\": true or false, \"tool_name\": \"server.tool or empty\", \
         \"reasoning\": \"one sentence\"}}",
        stage_upper = stage.to_uppercase(),
    );

    let model = client.config().tool_calling_model();
    let response = client
        .query_with_retry(
            &model,
            &[ChatMessage::user(prompt)],
            RetryOpts {
                timeout: Some(std::time::Duration::from_secs(30)),
                max_retries: Some(1),
                temperature: Some(0.0),
                ..Default::default()
            },
        )
        .await
        .ok()?;

    let parsed: Value = serde_json::from_str(&extract_json_block(&response.content)).ok()?;

    let assessment = MidDeliberationAssessment {
        needs_tool: parsed
            .get("needs_tool")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        tool_name: parsed
            .get("tool_name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        reasoning: parsed
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
    };

    debug!(
        stage,
        needs_tool = assessment.needs_tool,
        tool = assessment.tool_name,
        "mid-deliberation assessment"
    );

    Some(assessment)
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websearch_substring_match() {
        assert!(is_websearch_tool("websearch.search"));
        assert!(is_websearch_tool("brave.web_search"));
        // The documented mis-fire case: any name containing "search".
        assert!(is_websearch_tool("graphiti.search_nodes"));
        assert!(!is_websearch_tool("calculator.add"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }
}

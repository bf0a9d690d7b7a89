//! Shared prompt fragments
//!
//! The recurring blocks (date context, anti-refusal banner, tool-output
//! instructions, final-ranking format) live here as named builders so the
//! rules move in lockstep across every call site.

use chrono::{Datelike, Days, NaiveDate};

use crate::mcp::ToolOutcome;

/// Concrete date context for tool-argument generation. Prevents
/// year-off-by-one hallucinations when models fill in date parameters.
pub fn date_context_block(today: NaiveDate) -> String {
    let weekday = today.weekday();
    let week_start = today - Days::new(weekday.num_days_from_monday() as u64);
    let week_end = week_start + Days::new(6);

    format!(
        "CURRENT DATE CONTEXT:\n\
         - Today is {} ({})\n\
         - This week runs {} to {}\n\
         - This month is {}\n\
         Use these exact dates; never guess the year.",
        today.format("%Y-%m-%d"),
        weekday,
        week_start.format("%Y-%m-%d"),
        week_end.format("%Y-%m-%d"),
        today.format("%Y-%m"),
    )
}

/// System-message banner for responses that must use tool output.
pub const ANTI_REFUSAL_BANNER: &str = "You have been given live data retrieved by an external \
    tool. That data is current and authoritative. Use it directly to answer. Never claim you \
    cannot access real-time information, never mention a training cutoff, and never answer from \
    memory when the tool output covers the question.";

/// Escalated variant used after a detected refusal.
pub const ANTI_REFUSAL_BANNER_ESCALATED: &str = "CRITICAL INSTRUCTION: the tool output below is \
    real, current data fetched seconds ago. Your previous answer wrongly claimed you lack access \
    to current information. That claim is false. Answer the question strictly from the tool \
    output. Do not mention training data, cutoffs, or real-time access limitations in any form.";

/// Render a tool outcome as a prompt block. Failures get an explicit banner
/// instructing the model to be honest and not fabricate.
pub fn format_tool_result_for_prompt(outcome: &ToolOutcome) -> String {
    if outcome.is_failed() {
        let error = outcome
            .error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        return format!(
            "TOOL EXECUTION FAILED\n\
             Tool: {}\n\
             Error: {}\n\
             The lookup did not produce data. Tell the user plainly that the lookup failed and \
             suggest retrying later. Do not invent results, dates, or facts the tool did not \
             return.",
            outcome.full_name(),
            error,
        );
    }

    let output = outcome.extracted_output();
    let rendered = match &output {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_default(),
    };

    format!(
        "TOOL RESULT ({} in {:.2}s)\n\
         Input: {}\n\
         Output:\n{}",
        outcome.full_name(),
        outcome.execution_time_seconds,
        outcome.input,
        rendered,
    )
}

/// The required `FINAL RANKING:` block format for Stage-2 prompts.
pub fn final_ranking_format_block(labels: &[String]) -> String {
    let example: Vec<String> = labels
        .iter()
        .enumerate()
        .map(|(i, label)| format!("{}. {} ({}/5) - one sentence of reasoning", i + 1, label, 5 - i.min(4)))
        .collect();

    format!(
        "End your evaluation with a block in EXACTLY this format:\n\n\
         FINAL RANKING:\n{}\n\n\
         One line per response, best first, each with a rating out of 5.",
        example.join("\n"),
    )
}

/// Pull a JSON object out of a model response, tolerating markdown fences
/// and surrounding prose.
pub fn extract_json_block(text: &str) -> String {
    if let Some(start) = text.find("```json") {
        let start = start + 7;
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim().to_string();
        }
    }

    if let Some(start) = text.find("```") {
        let start = start + 3;
        if let Some(end) = text[start..].find("```") {
            let content = text[start..start + end].trim();
            if content.starts_with('{') || content.starts_with('[') {
                return content.to_string();
            }
        }
    }

    if let Some(start) = text.find('{') {
        if let Some(end) = text.rfind('}') {
            if end > start {
                return text[start..=end].to_string();
            }
        }
    }

    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_date_context_block() {
        let today = NaiveDate::from_ymd_opt(2026, 7, 29).unwrap();
        let block = date_context_block(today);
        assert!(block.contains("2026-07-29"));
        assert!(block.contains("2026-07-27 to 2026-08-02"));
        assert!(block.contains("2026-07"));
    }

    #[test]
    fn test_failed_tool_block_forbids_fabrication() {
        let outcome = ToolOutcome::failure("websearch", "search", json!({}), "network", 0.2);
        let block = format_tool_result_for_prompt(&outcome);
        assert!(block.contains("TOOL EXECUTION FAILED"));
        assert!(block.contains("network"));
        assert!(block.contains("Do not invent"));
    }

    #[test]
    fn test_successful_tool_block() {
        let outcome = ToolOutcome {
            success: true,
            server: "calculator".into(),
            tool: "add".into(),
            input: json!({"a": 5, "b": 3}),
            output: Some(json!({"content": [{"type": "text", "text": "{\"result\": 8}"}]})),
            execution_time_seconds: 0.01,
            error: None,
        };
        let block = format_tool_result_for_prompt(&outcome);
        assert!(block.contains("calculator.add"));
        assert!(block.contains("\"result\": 8"));
    }

    #[test]
    fn test_extract_json_from_fence() {
        let text = "Sure, here it is:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json_block(text), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_json_raw() {
        let text = "thinking... {\"type\": \"factual\"} trailing";
        assert_eq!(extract_json_block(text), "{\"type\": \"factual\"}");
    }

    #[test]
    fn test_final_ranking_block_lists_labels() {
        let labels = vec!["Response A".to_string(), "Response B".to_string()];
        let block = final_ranking_format_block(&labels);
        assert!(block.contains("FINAL RANKING:"));
        assert!(block.contains("1. Response A"));
        assert!(block.contains("2. Response B"));
    }
}

//! Deep research: search, pick sources, scrape, concatenate
//!
//! For ranked / "top N" / comparison queries a single search snippet is not
//! enough; this path scrapes the most relevant result pages and hands the
//! council the combined text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::client::{ChatMessage, ModelClient, RetryOpts};
use crate::events::{Event, EventSender, new_call_id};
use crate::mcp::{McpRegistry, ToolOutcome};
use crate::prompts::extract_json_block;

/// At most this many pages are scraped per research run.
const MAX_SOURCES: usize = 3;
/// Each scraped page is truncated to this many characters.
const MAX_SOURCE_CHARS: usize = 5_000;

static TOP_N_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\btop\s+\d+\b").expect("top-n regex"));
static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"https?://[^\s"'<>\)\]]+"#).expect("url regex"));

/// True for queries that ask for a ranking, a "top N" list, or a comparison.
pub fn is_deep_research_query(query: &str) -> bool {
    let lower = query.to_lowercase();
    TOP_N_RE.is_match(query)
        || lower.contains("ranked")
        || lower.contains("ranking")
        || lower.contains("compare")
        || lower.contains("comparison")
        || lower.contains(" vs ")
        || lower.contains("versus")
}

/// Ask the tool-calling model to pick the most relevant URLs out of the
/// search output; fall back to the first URLs found in the raw text.
async fn pick_urls(client: &ModelClient, query: &str, search_text: &str) -> Vec<String> {
    let prompt = format!(
        "Pick the {MAX_SOURCES} most relevant URLs from these search results for answering the \
         query. Prefer primary sources over aggregators.\n\n\
         QUERY: \"{query}\"\n\n\
         SEARCH RESULTS:\n{search_text}\n\n\
         Respond with ONLY a JSON object: {{\"urls\": [\"...\"]}}"
    );

    let model = client.config().tool_calling_model();
    let picked = match client
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
    {
        Ok(response) => serde_json::from_str::<Value>(&extract_json_block(&response.content))
            .ok()
            .and_then(|v| {
                v.get("urls").and_then(|u| u.as_array()).map(|arr| {
                    arr.iter()
                        .filter_map(|u| u.as_str().map(String::from))
                        .collect::<Vec<_>>()
                })
            })
            .unwrap_or_default(),
        Err(_) => vec![],
    };

    let urls = if picked.is_empty() {
        URL_RE
            .find_iter(search_text)
            .map(|m| m.as_str().to_string())
            .collect()
    } else {
        picked
    };

    let mut seen = std::collections::HashSet::new();
    urls.into_iter()
        .filter(|u| seen.insert(u.clone()))
        .take(MAX_SOURCES)
        .collect()
}

/// Run the deep-research workflow. Requires both a search tool and a scrape
/// tool; returns `None` when either is missing so the caller can fall back.
pub async fn deep_research(
    client: &ModelClient,
    registry: &McpRegistry,
    query: &str,
    events: &EventSender,
) -> Option<ToolOutcome> {
    let search_tool = registry.find_tool_by_fragment("search")?;
    let scrape_tool = registry
        .find_tool_by_fragment("scrape")
        .or_else(|| registry.find_tool_by_fragment("fetch"))?;

    debug!(search = search_tool, scrape = scrape_tool, "deep research start");

    let call_id = new_call_id();
    events.send(Event::ToolCallStart {
        tool: search_tool.clone(),
        arguments: json!({"query": query}),
        call_id: call_id.clone(),
        step: None,
        description: Some("deep research: initial search".into()),
    });

    let search_outcome = registry
        .call_tool(&search_tool, json!({"query": query}))
        .await;

    events.send(Event::ToolCallComplete {
        tool: search_tool.clone(),
        call_id,
        success: search_outcome.success,
        result: Some(serde_json::to_value(&search_outcome).unwrap_or_default()),
        step: None,
    });

    if search_outcome.is_failed() {
        // Surface the honest failure; downstream prompts will say so.
        return Some(search_outcome);
    }

    let search_text = match search_outcome.extracted_output() {
        Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_default(),
    };

    let urls = pick_urls(client, query, &search_text).await;
    if urls.is_empty() {
        warn!("deep research found no usable urls, returning search output");
        return Some(search_outcome);
    }

    let mut sections = vec![format!("# Research: {query}\n")];
    let mut scraped = 0usize;

    for (index, url) in urls.iter().enumerate() {
        let call_id = new_call_id();
        events.send(Event::ToolCallStart {
            tool: scrape_tool.clone(),
            arguments: json!({"url": url}),
            call_id: call_id.clone(),
            step: None,
            description: Some(format!("deep research: scrape source {}", index + 1)),
        });

        let outcome = registry.call_tool(&scrape_tool, json!({"url": url})).await;

        events.send(Event::ToolCallComplete {
            tool: scrape_tool.clone(),
            call_id,
            success: outcome.success,
            result: None,
            step: None,
        });

        if outcome.is_failed() {
            continue;
        }

        let text = match outcome.extracted_output() {
            Value::String(s) => s,
            other => serde_json::to_string_pretty(&other).unwrap_or_default(),
        };
        let truncated: String = text.chars().take(MAX_SOURCE_CHARS).collect();
        sections.push(format!("## Source {}: {url}\n\n{truncated}", index + 1));
        scraped += 1;
    }

    if scraped == 0 {
        return Some(search_outcome);
    }

    Some(ToolOutcome {
        success: true,
        server: "research".into(),
        tool: "deep_research".into(),
        input: json!({"query": query, "sources": urls}),
        output: Some(json!({"combined": sections.join("\n\n"), "sources_scraped": scraped})),
        execution_time_seconds: search_outcome.execution_time_seconds,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_research_trigger() {
        assert!(is_deep_research_query("What are the top 5 Rust web frameworks?"));
        assert!(is_deep_research_query("Compare Postgres and MySQL"));
        assert!(is_deep_research_query("Python vs JavaScript for beginners"));
        assert!(is_deep_research_query("ranked list of chess engines"));
    }

    #[test]
    fn test_plain_queries_do_not_trigger() {
        assert!(!is_deep_research_query("What's the capital of France?"));
        assert!(!is_deep_research_query("Explain borrow checking"));
    }

    #[test]
    fn test_url_regex_extraction() {
        let text = "See https://example.org/a and (https://other.net/b) for details.";
        let urls: Vec<_> = URL_RE.find_iter(text).map(|m| m.as_str()).collect();
        assert_eq!(urls, vec!["https://example.org/a", "https://other.net/b"]);
    }
}

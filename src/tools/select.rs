//! Two-phase single-tool selection
//!
//! Phase 1 asks the tool-calling model what kinds of data the query needs
//! and maps those through a deterministic confidence table. Phase 2 asks the
//! model to produce arguments for the winning tool, except for the
//! calculator, which is parsed directly from the query text.

use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::client::{ChatMessage, ModelClient, RetryOpts};
use crate::mcp::McpRegistry;
use crate::prompts::{date_context_block, extract_json_block};

/// Normalized data-type vocabulary from expectation analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    CurrentTime,
    Location,
    News,
    Weather,
    Calculation,
    WebContent,
}

impl DataType {
    /// Normalize the model's free-form type names.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_lowercase();
        match raw.as_str() {
            "current_time" | "time" | "date" | "datetime" => Some(Self::CurrentTime),
            "location" | "geolocation" | "position" => Some(Self::Location),
            "news" | "current_events" | "headlines" => Some(Self::News),
            "weather" | "forecast" | "temperature" => Some(Self::Weather),
            "calculation" | "math" | "arithmetic" => Some(Self::Calculation),
            "web_content" | "web" | "search" | "internet" => Some(Self::WebContent),
            _ => None,
        }
    }

    /// The deterministic confidence mapping: data type to (server, tool,
    /// confidence). Selection fires iff the best confidence is >= 0.5.
    pub fn mapping(&self) -> (&'static str, &'static str, f64) {
        match self {
            Self::CurrentTime => ("location-time", "get-current-time", 0.9),
            Self::Location => ("system-geo-location", "get-system-geo-location", 0.9),
            Self::News => ("websearch", "search", 0.85),
            Self::Weather => ("location-time", "get-weather-for-location-and-date", 0.85),
            Self::Calculation => ("calculator", "add", 0.95),
            Self::WebContent => ("websearch", "search", 0.7),
        }
    }
}

/// Confidence below which no tool fires.
pub const SELECTION_THRESHOLD: f64 = 0.5;

/// Phase-1 result.
#[derive(Debug, Clone, Default)]
pub struct Expectation {
    pub needs_external_data: bool,
    pub data_types: Vec<DataType>,
    pub reasoning: String,
}

/// Outcome of the two-phase selection.
#[derive(Debug, Clone)]
pub enum ToolDecision {
    NoTool { reason: String },
    Selected { full_name: String, arguments: Value },
}

/// Phase 1: expectation analysis. Any parse failure collapses to "no
/// external data needed" — the safe branch.
pub async fn analyze_expectations(client: &ModelClient, query: &str) -> Expectation {
    let prompt = format!(
        "Analyze what external data this user query needs, if any.\n\n\
         USER QUERY: \"{query}\"\n\n\
         Data types you may name: current_time, location, news, weather, calculation, \
         web_content.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\n\
           \"needs_external_data\": true or false,\n\
           \"data_types\": [\"...\"],\n\
           \"reasoning\": \"one sentence\"\n\
         }}\n\n\
         Queries answerable from general knowledge need no external data."
    );

    let model = client.config().tool_calling_model();
    let result = client
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
        .await;

    let Ok(response) = result else {
        return Expectation::default();
    };

    let Ok(parsed) = serde_json::from_str::<Value>(&extract_json_block(&response.content)) else {
        return Expectation::default();
    };

    let needs = parsed
        .get("needs_external_data")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let data_types = parsed
        .get("data_types")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter_map(DataType::parse)
                .collect()
        })
        .unwrap_or_default();
    let reasoning = parsed
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    Expectation {
        needs_external_data: needs,
        data_types,
        reasoning,
    }
}

/// Map the analyzed data types through the confidence table and pick the
/// highest-confidence tool that is actually registered.
pub fn pick_tool(registry: &McpRegistry, expectation: &Expectation) -> Option<(String, f64)> {
    let mut best: Option<(String, f64)> = None;

    for data_type in &expectation.data_types {
        let (server, tool, confidence) = data_type.mapping();
        let exact = format!("{server}.{tool}");

        let resolved = if registry.get_tool(&exact).is_some() {
            Some(exact)
        } else {
            // Server catalogs vary; fall back to a name-fragment match.
            registry.find_tool_by_fragment(tool)
        };

        if let Some(full_name) = resolved {
            let better = match &best {
                Some((_, best_conf)) => confidence > *best_conf,
                None => true,
            };
            if better {
                best = Some((full_name, confidence));
            }
        }
    }

    best
}

static NUMBER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("number regex"));

/// Calculator fast path: two numbers and an operator keyword, no LLM.
pub fn calculator_fast_path(query: &str) -> Option<(String, Value)> {
    let lower = query.to_lowercase();

    let operation = if lower.contains("plus") || lower.contains(" add") || lower.contains(" + ") {
        "add"
    } else if lower.contains("minus") || lower.contains("subtract") {
        "subtract"
    } else if lower.contains("times") || lower.contains("multipl") || lower.contains(" * ") {
        "multiply"
    } else if lower.contains("divided") || lower.contains("divide") || lower.contains(" / ") {
        "divide"
    } else {
        return None;
    };

    let numbers: Vec<f64> = NUMBER_RE
        .find_iter(query)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    if numbers.len() < 2 {
        return None;
    }

    let to_value = |n: f64| {
        if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
            json!(n as i64)
        } else {
            json!(n)
        }
    };

    Some((
        operation.to_string(),
        json!({"a": to_value(numbers[0]), "b": to_value(numbers[1])}),
    ))
}

/// Phase 2: argument generation for the selected tool.
async fn generate_arguments(
    client: &ModelClient,
    registry: &McpRegistry,
    full_name: &str,
    query: &str,
) -> Option<Value> {
    let tool = registry.get_tool(full_name)?;

    // Calculator never needs the LLM: parse the expression directly.
    if tool.server_name == "calculator" {
        if let Some((operation, arguments)) = calculator_fast_path(query) {
            let resolved = registry
                .find_tool_by_fragment(&format!("calculator.{operation}"))
                .unwrap_or_else(|| full_name.to_string());
            return Some(json!({"tool": resolved, "arguments": arguments}));
        }
    }

    let today = Local::now().date_naive();
    let prompt = format!(
        "{date_context}\n\n\
         Produce the arguments for a tool call answering this query.\n\n\
         USER QUERY: \"{query}\"\n\n\
         TOOL: {full_name}\n\
         DESCRIPTION: {description}\n\
         INPUT SCHEMA: {schema}\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"tool\": \"{full_name}\", \"arguments\": {{...}}}}",
        date_context = date_context_block(today),
        description = tool.description,
        schema = tool.input_schema,
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

    serde_json::from_str(&extract_json_block(&response.content)).ok()
}

/// The full two-phase selection.
pub async fn select_tool(
    client: &ModelClient,
    registry: &McpRegistry,
    query: &str,
) -> ToolDecision {
    let expectation = analyze_expectations(client, query).await;

    if !expectation.needs_external_data {
        return ToolDecision::NoTool {
            reason: if expectation.reasoning.is_empty() {
                "query needs no external data".to_string()
            } else {
                expectation.reasoning
            },
        };
    }

    let Some((full_name, confidence)) = pick_tool(registry, &expectation) else {
        return ToolDecision::NoTool {
            reason: "no registered tool covers the needed data".to_string(),
        };
    };

    // Threshold is inclusive: exactly 0.5 still fires.
    if confidence < SELECTION_THRESHOLD {
        return ToolDecision::NoTool {
            reason: format!("best tool confidence {confidence:.2} below threshold"),
        };
    }

    debug!(tool = full_name, confidence, "tool selected");

    let Some(call) = generate_arguments(client, registry, &full_name, query).await else {
        return ToolDecision::NoTool {
            reason: "argument generation failed".to_string(),
        };
    };

    let tool = call
        .get("tool")
        .and_then(|t| t.as_str())
        .unwrap_or(&full_name)
        .to_string();
    let arguments = call.get("arguments").cloned().unwrap_or_else(|| json!({}));

    ToolDecision::Selected {
        full_name: tool,
        arguments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_normalization() {
        assert_eq!(DataType::parse("weather"), Some(DataType::Weather));
        assert_eq!(DataType::parse("FORECAST"), Some(DataType::Weather));
        assert_eq!(DataType::parse("math"), Some(DataType::Calculation));
        assert_eq!(DataType::parse("none"), None);
        assert_eq!(DataType::parse("poetry"), None);
    }

    #[test]
    fn test_calculator_fast_path_add() {
        let (op, args) = calculator_fast_path("What is 5 plus 3?").unwrap();
        assert_eq!(op, "add");
        assert_eq!(args, json!({"a": 5, "b": 3}));
    }

    #[test]
    fn test_calculator_fast_path_divide_floats() {
        let (op, args) = calculator_fast_path("what's 7.5 divided by 2.5").unwrap();
        assert_eq!(op, "divide");
        assert_eq!(args, json!({"a": 7.5, "b": 2.5}));
    }

    #[test]
    fn test_calculator_fast_path_needs_two_numbers() {
        assert!(calculator_fast_path("what is 5 plus five").is_none());
        assert!(calculator_fast_path("tell me about addition").is_none());
    }

    #[test]
    fn test_confidence_ordering() {
        // Calculation outranks web content in the table.
        let (_, _, calc) = DataType::Calculation.mapping();
        let (_, _, web) = DataType::WebContent.mapping();
        assert!(calc > web);
        assert!(web >= SELECTION_THRESHOLD);
    }
}

//! Multi-step tool orchestration
//!
//! For queries that need several tool calls with data flowing between them
//! (relative dates plus weather, location plus time plus forecast), an LLM
//! produces an execution plan whose steps may reference earlier outputs via
//! `$step_N.field` and carry symbolic date tokens resolved at execution time.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::client::{ChatMessage, ModelClient, RetryOpts};
use crate::events::{Event, EventSender, new_call_id};
use crate::mcp::{McpRegistry, ToolOutcome};
use crate::prompts::extract_json_block;

use super::dates::{is_date_reference, resolve_date_reference};

const MAX_PLAN_TOOLS_IN_PROMPT: usize = 15;

/// One step of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_number: u32,
    #[serde(default)]
    pub description: String,
    pub tool: String,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanStatus {
    #[serde(rename = "WORKING")]
    Working,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "ERROR")]
    Error,
}

/// State threaded through a multi-step run.
#[derive(Debug)]
pub struct ResearchState {
    pub user_query: String,
    pub steps: Vec<PlanStep>,
    pub step_results: HashMap<u32, Value>,
    pub current_round: u32,
    pub max_rounds: u32,
    pub status: PlanStatus,
}

impl ResearchState {
    pub fn new(user_query: &str, steps: Vec<PlanStep>) -> Self {
        Self {
            user_query: user_query.to_string(),
            max_rounds: steps.len().max(1) as u32,
            steps,
            step_results: HashMap::new(),
            current_round: 0,
            status: PlanStatus::Working,
        }
    }
}

const DAY_NAMES: &[&str] = &[
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

/// Pattern check for queries that need multi-step execution: a time-relative
/// reference combined with a data need, or location + time + weather.
pub fn needs_multi_tool_orchestration(query: &str) -> bool {
    let lower = query.to_lowercase();

    let weather_words = ["weather", "forecast", "temperature", "rain"];
    for day in DAY_NAMES {
        if lower.contains(&format!("last {day}"))
            || lower.contains(&format!("next {day}"))
            || lower.contains(&format!("this {day}"))
        {
            if weather_words.iter().any(|w| lower.contains(w)) {
                return true;
            }
        }
    }

    let time_relative: &[(&str, &[&str])] = &[
        ("yesterday", &["weather", "news", "events", "happened"]),
        ("last week", &["weather", "news", "events", "happened"]),
        ("tomorrow", &["weather", "forecast"]),
        ("next week", &["weather", "forecast"]),
        ("last month", &["weather", "news", "events"]),
    ];
    for (time_pattern, context_words) in time_relative {
        if lower.contains(time_pattern) && context_words.iter().any(|w| lower.contains(w)) {
            return true;
        }
    }

    let multi_context = [("weather", "here"), ("weather", "now"), ("weather", "in"), ("time", "in")];
    multi_context
        .iter()
        .any(|(a, b)| lower.contains(a) && lower.contains(b))
}

/// Ask the chairman model for an execution plan. An unparseable answer means
/// no plan; the caller falls through to the simpler selection paths.
pub async fn plan_tool_execution(
    client: &ModelClient,
    registry: &McpRegistry,
    query: &str,
) -> Vec<PlanStep> {
    let mut tool_lines = vec![];
    let mut names: Vec<_> = registry.all_tools().keys().collect();
    names.sort();
    for full_name in names.into_iter().take(MAX_PLAN_TOOLS_IN_PROMPT) {
        let tool = &registry.all_tools()[full_name];
        let params: Vec<&String> = tool
            .input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| props.keys().take(5).collect())
            .unwrap_or_default();
        tool_lines.push(format!(
            "- {full_name}: {} (params: {})",
            tool.description,
            params
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        ));
    }

    let prompt = format!(
        r#"You are a tool orchestration planner. Given a user query and available tools, create an execution plan.

USER QUERY: "{query}"

AVAILABLE TOOLS:
{tools}

Create a JSON execution plan with steps to answer the query. Each step uses one tool.

Rules:
1. Use the minimum number of steps necessary
2. A step can reference results from previous steps with $step_N.field syntax
3. Include every required parameter for each tool call
4. When a specific location is named, call a location-aware tool directly; only look up the
   system location when no location is given

Date reference keywords (resolved automatically at execution time):
- YESTERDAY, TODAY, TOMORROW
- LAST WEEK, NEXT WEEK
- LAST MONDAY ... LAST SUNDAY (most recent past occurrence)
- THIS MONDAY ... THIS SUNDAY (this week's occurrence)
- NEXT MONDAY ... NEXT SUNDAY (next week's occurrence)

Output ONLY valid JSON in this format:
{{
  "steps": [
    {{
      "step_number": 1,
      "description": "What this step does",
      "tool": "server.tool",
      "depends_on": [],
      "parameters": {{"param": "value"}}
    }},
    {{
      "step_number": 2,
      "description": "Use result from step 1",
      "tool": "another.tool",
      "depends_on": [1],
      "parameters": {{"input": "$step_1.result", "date": "LAST TUESDAY"}}
    }}
  ]
}}

Now create the plan for: "{query}""#,
        tools = tool_lines.join("\n"),
    );

    let model = client.config().chairman_model();
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
        return vec![];
    };

    let Ok(parsed) = serde_json::from_str::<Value>(&extract_json_block(&response.content)) else {
        warn!("plan response was not valid JSON");
        return vec![];
    };

    parsed
        .get("steps")
        .and_then(|s| serde_json::from_value(s.clone()).ok())
        .unwrap_or_default()
}

/// Resolve `$step_N.field` references against recorded step outputs and
/// symbolic date tokens against `today`. Unresolvable references pass
/// through unchanged.
pub fn resolve_step_references(
    parameters: &Map<String, Value>,
    step_results: &HashMap<u32, Value>,
    today: NaiveDate,
) -> Map<String, Value> {
    let mut resolved = Map::new();

    for (key, value) in parameters {
        let Value::String(s) = value else {
            resolved.insert(key.clone(), value.clone());
            continue;
        };

        if let Some(reference) = s.strip_prefix("$step_") {
            let mut parts = reference.split('.');
            let step_num: Option<u32> = parts.next().and_then(|n| n.parse().ok());

            match step_num.and_then(|n| step_results.get(&n)) {
                Some(mut current) => {
                    for field in parts {
                        if let Some(next) = current.get(field) {
                            current = next;
                        }
                    }
                    resolved.insert(key.clone(), current.clone());
                }
                None => {
                    debug!(reference = s, "unresolvable step reference");
                    resolved.insert(key.clone(), value.clone());
                }
            }
        } else if is_date_reference(s) {
            let date = resolve_date_reference(s, today);
            debug!(token = s, resolved = date, "date reference resolved");
            resolved.insert(key.clone(), Value::String(date));
        } else {
            resolved.insert(key.clone(), value.clone());
        }
    }

    resolved
}

/// Execute a full multi-step orchestration. Returns the combined outcome, or
/// `None` when no plan could be produced.
pub async fn execute_orchestrated_tools(
    client: &ModelClient,
    registry: &McpRegistry,
    query: &str,
    events: &EventSender,
) -> Option<ToolOutcome> {
    if registry.all_tools().is_empty() {
        return None;
    }

    events.send(Event::OrchestrationStart {
        query: query.to_string(),
    });

    let steps = plan_tool_execution(client, registry, query).await;
    if steps.is_empty() {
        debug!("no execution plan produced");
        return None;
    }

    events.send(Event::OrchestrationPlan {
        steps: serde_json::to_value(&steps).unwrap_or_default(),
    });

    let mut state = ResearchState::new(query, steps.clone());
    let today = Local::now().date_naive();
    let started = Instant::now();
    let mut all_outputs = vec![];

    for step in &steps {
        state.current_round += 1;

        for dep in &step.depends_on {
            if !state.step_results.contains_key(dep) {
                warn!(step = step.step_number, missing = dep, "missing dependency");
            }
        }

        let resolved = resolve_step_references(&step.parameters, &state.step_results, today);
        let call_id = new_call_id();

        events.send(Event::ToolCallStart {
            tool: step.tool.clone(),
            arguments: Value::Object(resolved.clone()),
            call_id: call_id.clone(),
            step: Some(step.step_number),
            description: Some(step.description.clone()),
        });

        let outcome = registry
            .call_tool(&step.tool, Value::Object(resolved))
            .await;
        let extracted = if outcome.success {
            outcome.extracted_output()
        } else {
            json!({"error": outcome.error.clone().unwrap_or_default()})
        };
        state.step_results.insert(step.step_number, extracted.clone());

        events.send(Event::ToolCallComplete {
            tool: step.tool.clone(),
            call_id,
            success: outcome.success,
            result: Some(serde_json::to_value(&outcome).unwrap_or_default()),
            step: Some(step.step_number),
        });

        if outcome.success {
            all_outputs.push(json!({
                "step": step.step_number,
                "description": step.description,
                "tool": step.tool,
                "output": extracted,
            }));
        }
    }

    state.status = PlanStatus::Finished;

    let final_step = steps.len() as u32;
    let final_data = state
        .step_results
        .get(&final_step)
        .cloned()
        .or_else(|| {
            state
                .step_results
                .keys()
                .max()
                .and_then(|k| state.step_results.get(k))
                .cloned()
        })
        .unwrap_or(Value::Null);

    events.send(Event::OrchestrationComplete {
        steps: all_outputs.len(),
        success: true,
    });

    Some(ToolOutcome {
        success: true,
        server: "orchestration".into(),
        tool: "orchestration".into(),
        input: json!({"query": query}),
        output: Some(json!({
            "query": query,
            "steps_executed": all_outputs.len(),
            "results": all_outputs,
            "final_data": final_data,
        })),
        execution_time_seconds: (started.elapsed().as_secs_f64() * 1000.0).round() / 1000.0,
        error: None,
    })
}

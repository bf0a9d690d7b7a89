//! Tool orchestration
//!
//! Four ways a query can reach a tool, tried in order: multi-step plan
//! execution, deep research, two-phase single-tool selection, and (between
//! deliberation stages) the websearch-only mid-deliberation assessment.

pub mod assess;
pub mod dates;
pub mod plan;
pub mod research;
pub mod select;

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::client::ModelClient;
use crate::events::{Event, EventSender, new_call_id};
use crate::mcp::{McpRegistry, ToolOutcome};

pub use assess::{MidDeliberationAssessment, assess_tool_needs, is_websearch_tool};
pub use select::ToolDecision;

pub struct ToolOrchestrator {
    client: Arc<ModelClient>,
    registry: Arc<McpRegistry>,
}

impl ToolOrchestrator {
    pub fn new(client: Arc<ModelClient>, registry: Arc<McpRegistry>) -> Self {
        Self { client, registry }
    }

    pub fn registry(&self) -> &Arc<McpRegistry> {
        &self.registry
    }

    /// Decide whether a tool should run for this query and execute it.
    ///
    /// Returns `None` when no tool applies; a failed execution still returns
    /// `Some` so downstream prompts can present the failure honestly.
    pub async fn check_and_execute_tools(
        &self,
        query: &str,
        events: &EventSender,
    ) -> Option<ToolOutcome> {
        if !self.registry.should_use_tools() {
            return None;
        }

        if plan::needs_multi_tool_orchestration(query) {
            info!("query matches multi-step orchestration patterns");
            if let Some(outcome) =
                plan::execute_orchestrated_tools(&self.client, &self.registry, query, events).await
            {
                return Some(outcome);
            }
            // Planner produced nothing; fall through to the simpler paths.
        }

        if research::is_deep_research_query(query) {
            if let Some(outcome) =
                research::deep_research(&self.client, &self.registry, query, events).await
            {
                info!(tool = outcome.full_name(), "deep research completed");
                return Some(outcome);
            }
        }

        match select::select_tool(&self.client, &self.registry, query).await {
            ToolDecision::NoTool { reason } => {
                debug!(reason, "no tool selected");
                None
            }
            ToolDecision::Selected {
                full_name,
                arguments,
            } => {
                let call_id = new_call_id();
                events.send(Event::ToolCallStart {
                    tool: full_name.clone(),
                    arguments: arguments.clone(),
                    call_id: call_id.clone(),
                    step: None,
                    description: None,
                });

                let outcome = self.registry.call_tool(&full_name, arguments).await;

                events.send(Event::ToolCallComplete {
                    tool: full_name,
                    call_id,
                    success: outcome.success,
                    result: Some(serde_json::to_value(&outcome).unwrap_or_default()),
                    step: None,
                });

                Some(outcome)
            }
        }
    }

    /// Execute the mid-deliberation websearch when the assessment asks for
    /// it. Only a search tool may run here.
    pub async fn execute_mid_deliberation_search(
        &self,
        query: &str,
        stage: &str,
        tool_name: &str,
        events: &EventSender,
    ) -> Option<ToolOutcome> {
        if !is_websearch_tool(tool_name) {
            return None;
        }

        let search = self
            .registry
            .find_tool_by_fragment("websearch.search")
            .or_else(|| self.registry.find_tool_by_fragment("search"))?;

        events.send(Event::MidDeliberationToolStart {
            stage: stage.to_string(),
            tool: tool_name.to_string(),
        });
        let outcome = self.registry.call_tool(&search, json!({"query": query})).await;

        events.send(Event::MidDeliberationToolComplete {
            stage: stage.to_string(),
            tool: tool_name.to_string(),
            success: outcome.success,
            error: outcome.error.clone(),
        });

        if outcome.success { Some(outcome) } else { None }
    }
}

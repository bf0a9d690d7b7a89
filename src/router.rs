//! Query router
//!
//! Ordered gates for every user turn: memory, classification, tool check,
//! then dispatch to the direct path or the full deliberation pipeline. The
//! streaming entry point emits the complete SSE event sequence and appends
//! exactly one assistant message when it finishes, success or not.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::council::{
    ALL_MODELS_FAILED, Stage1Entry, Stage2Entry, Stage3Result, calculate_aggregate_rankings,
};
use crate::events::{Event, EventSender};
use crate::mcp::ToolOutcome;
use crate::prompts::format_tool_result_for_prompt;
use crate::state::AppState;
use crate::tools::assess_tool_needs;

/// Body of the message endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    /// Cut messages to this index before re-running.
    pub truncate_at: Option<usize>,
    /// Re-run without appending a new user turn.
    #[serde(default)]
    pub skip_user_message: bool,
    /// Force title regeneration (edits).
    #[serde(default)]
    pub regenerate_title: bool,
}

/// Run one user turn end to end, streaming events into `events`.
///
/// Content errors never propagate out of here; every path ends in a stored
/// assistant message and a terminal `complete` event. Only a missing
/// conversation aborts with a terminal `error`.
pub async fn run_query_stream(
    state: Arc<AppState>,
    conversation_id: String,
    request: SendMessageRequest,
    events: EventSender,
) {
    let query = request.content.clone();

    if let Some(index) = request.truncate_at {
        if let Err(e) = state.storage.truncate_messages(&conversation_id, index) {
            warn!(error = %e, "truncate failed");
        }
    }

    let Some(conversation) = state.storage.get(&conversation_id) else {
        events.send(Event::Error {
            message: format!("Conversation {conversation_id} not found"),
        });
        return;
    };

    let needs_title = conversation.title.trim().is_empty()
        || conversation.title.starts_with("Conversation ")
        || request.regenerate_title;

    if !request.skip_user_message {
        if let Err(e) = state.storage.add_user_message(&conversation_id, &query) {
            events.send(Event::Error {
                message: e.to_string(),
            });
            return;
        }
    }

    // Title generation runs before deliberation so the client can show it
    // while tokens stream.
    if needs_title {
        events.send(Event::TitleGenerationStart);
        let title = state.titles.generate_title(&query).await;
        match state.storage.update_title(&conversation_id, &title) {
            Ok(()) => events.send(Event::TitleComplete { title }),
            Err(e) => events.send(Event::TitleError {
                error: e.to_string(),
            }),
        }
    }

    // ===== Gate 1: memory =====
    if state.memory.is_available() {
        events.send(Event::MemoryCheckStart);

        if let Some(memory_response) = state.memory.get_memory_response(&query, &events).await {
            events.send(Event::MemoryResponseStart {
                confidence: memory_response.confidence,
            });

            let direct_result = json!({
                "model": "memory",
                "response": memory_response.response,
                "type": "memory",
                "confidence": memory_response.confidence,
                "memories_used": memory_response.memories_used,
            });

            events.send(Event::MemoryResponseComplete {
                data: direct_result.clone(),
            });

            store_assistant_message(&state, &conversation_id, vec![], vec![], direct_result, None);
            events.send(Event::Complete {
                response_type: "memory".to_string(),
            });
            return;
        }

        // Record the user turn regardless of whether memory answered.
        if state.config.memory.record_user_messages {
            let memory = state.memory.clone();
            let content = query.clone();
            let conv_id = conversation_id.clone();
            tokio::spawn(async move {
                memory.record_user_message(&content, &conv_id).await;
            });
        }
    }

    // ===== Gate 2: classification =====
    events.send(Event::ClassificationStart);
    let classification = state.council.classify_message(&query).await;
    events.send(Event::ClassificationComplete {
        classification: serde_json::to_value(&classification).unwrap_or_default(),
    });

    // ===== Gate 3: tool check =====
    events.send(Event::ToolCheckStart);
    let tool_result = state.tools.check_and_execute_tools(&query, &events).await;

    if let Some(outcome) = &tool_result {
        if outcome.success {
            events.send(Event::ToolResult {
                tool: outcome.full_name(),
                input: outcome.input.clone(),
                output: outcome.output.clone().unwrap_or(Value::Null),
                formatted: format_tool_result_for_prompt(outcome),
            });
        }
    }

    let identity_context = state.memory.identity_context().await;

    // ===== Gate 4: dispatch =====
    if classification.is_direct() {
        events.send(Event::DirectResponseStart {
            reason: classification.reasoning.clone(),
        });

        let direct = state
            .council
            .direct_response(&query, tool_result.as_ref(), &identity_context, &events)
            .await;

        let stage3 = json!({"model": direct.model, "response": direct.response});
        store_assistant_message(
            &state,
            &conversation_id,
            vec![],
            vec![],
            stage3,
            tool_result,
        );
        save_markdown(&state, &conversation_id, &direct.response);
        record_synthesis_to_memory(&state, &conversation_id, &query, &direct, true);

        events.send(Event::Complete {
            response_type: "direct".to_string(),
        });
        return;
    }

    // ===== Deliberation path =====
    events.send(Event::DeliberationStart {
        reason: classification.reasoning.clone(),
    });

    events.send(Event::Stage1Start);
    let stage1 = state
        .council
        .stage1_collect_responses(&query, tool_result.as_ref(), &identity_context, &events)
        .await;
    events.send(Event::Stage1Complete {
        data: serde_json::to_value(&stage1).unwrap_or_default(),
    });

    if stage1.is_empty() {
        error!("no council model responded");
        let stage3 = json!({"model": "council", "response": ALL_MODELS_FAILED});
        store_assistant_message(
            &state,
            &conversation_id,
            vec![],
            vec![],
            stage3,
            tool_result,
        );
        events.send(Event::Complete {
            response_type: "deliberation".to_string(),
        });
        return;
    }

    let mut supplemental_tools: Vec<ToolOutcome> = vec![];
    let upfront_tools: Vec<ToolOutcome> = tool_result
        .iter()
        .filter(|t| t.success)
        .cloned()
        .collect();

    // Mid-deliberation check after Stage 1.
    let stage1_summary: String = stage1
        .iter()
        .map(|entry| {
            let snippet: String = entry.response.chars().take(200).collect();
            format!("- {}: {snippet}...", entry.model)
        })
        .collect::<Vec<_>>()
        .join("\n");
    run_mid_deliberation_check(
        &state,
        &query,
        "stage1",
        &stage1_summary,
        &upfront_tools,
        &mut supplemental_tools,
        &events,
    )
    .await;

    events.send(Event::Stage2Start);
    let (stage2, label_to_model, deliberation_metadata) = state
        .council
        .stage2_collect_rankings(&query, &stage1, &events)
        .await;

    let final_round = deliberation_metadata
        .get("rounds_completed")
        .and_then(|v| v.as_u64())
        .unwrap_or(1) as u8;
    let final_round_entries: Vec<Stage2Entry> = stage2
        .iter()
        .filter(|entry| entry.round == final_round)
        .cloned()
        .collect();
    let aggregate_rankings = calculate_aggregate_rankings(&final_round_entries, &label_to_model);

    events.send(Event::Stage2Complete {
        data: serde_json::to_value(&stage2).unwrap_or_default(),
        metadata: json!({
            "label_to_model": label_to_model
                .iter()
                .cloned()
                .collect::<std::collections::HashMap<String, String>>(),
            "aggregate_rankings": aggregate_rankings,
            "deliberation": deliberation_metadata,
        }),
    });

    // Mid-deliberation check after Stage 2, seeing all prior tool data.
    let stage2_summary: String = stage2
        .iter()
        .take(3)
        .map(|entry| format!("- {}: ranked responses", entry.model))
        .collect::<Vec<_>>()
        .join("\n");
    let mut all_prior: Vec<ToolOutcome> = upfront_tools.clone();
    all_prior.extend(supplemental_tools.iter().cloned());
    run_mid_deliberation_check(
        &state,
        &query,
        "stage2",
        &stage2_summary,
        &all_prior,
        &mut supplemental_tools,
        &events,
    )
    .await;

    events.send(Event::Stage3Start);
    let stage3 = state
        .council
        .stage3_synthesize(
            &query,
            &stage1,
            &stage2,
            &supplemental_tools,
            &identity_context,
            &events,
        )
        .await;
    events.send(Event::Stage3Complete {
        data: serde_json::to_value(&stage3).unwrap_or_default(),
    });

    let stage3_value = json!({"model": stage3.model, "response": stage3.response});
    store_assistant_message(
        &state,
        &conversation_id,
        stage1.clone(),
        stage2,
        stage3_value,
        tool_result,
    );
    save_markdown(&state, &conversation_id, &stage3.response);

    // Background memory recording with owned copies.
    if state.memory.is_available() && state.config.memory.record_council_responses {
        for entry in &stage1 {
            let memory = state.memory.clone();
            let response = entry.response.clone();
            let model = entry.model.clone();
            let conv_id = conversation_id.clone();
            tokio::spawn(async move {
                memory.record_council_response(&response, &model, 1, &conv_id).await;
            });
        }
    }
    record_synthesis_to_memory(&state, &conversation_id, &query, &stage3, false);

    info!(conversation = conversation_id, "deliberation finished");
    events.send(Event::Complete {
        response_type: "deliberation".to_string(),
    });
}

/// Non-streaming variant used by the plain message endpoint. Same routing,
/// events discarded, returns the response document.
pub async fn run_query_blocking(
    state: Arc<AppState>,
    conversation_id: String,
    request: SendMessageRequest,
) -> Value {
    let query = request.content.clone();
    let events = EventSender::noop();

    if state.storage.get(&conversation_id).is_none() {
        return json!({"error": "Conversation not found"});
    }
    if !request.skip_user_message {
        let _ = state.storage.add_user_message(&conversation_id, &query);
    }

    let classification = state.council.classify_message(&query).await;
    let tool_result = state.tools.check_and_execute_tools(&query, &events).await;
    let identity_context = state.memory.identity_context().await;

    if classification.is_direct() {
        let direct = state
            .council
            .direct_response(&query, tool_result.as_ref(), &identity_context, &events)
            .await;
        let stage3 = json!({"model": direct.model, "response": direct.response});
        store_assistant_message(
            &state,
            &conversation_id,
            vec![],
            vec![],
            stage3.clone(),
            tool_result.clone(),
        );
        return json!({
            "type": "direct",
            "stage1": [],
            "stage2": [],
            "stage3": stage3,
            "direct_response": {"model": direct.model, "response": direct.response},
            "tool_result": tool_result,
            "classification": classification,
            "metadata": {"response_type": "direct"},
        });
    }

    let stage1 = state
        .council
        .stage1_collect_responses(&query, tool_result.as_ref(), &identity_context, &events)
        .await;

    if stage1.is_empty() {
        let stage3 = json!({"model": "council", "response": ALL_MODELS_FAILED});
        store_assistant_message(
            &state,
            &conversation_id,
            vec![],
            vec![],
            stage3.clone(),
            tool_result.clone(),
        );
        return json!({
            "type": "deliberation",
            "stage1": [],
            "stage2": [],
            "stage3": stage3,
            "tool_result": tool_result,
            "classification": classification,
            "metadata": {"error": "no council responses"},
        });
    }

    let (stage2, label_to_model, deliberation_metadata) = state
        .council
        .stage2_collect_rankings(&query, &stage1, &events)
        .await;
    let final_round = deliberation_metadata
        .get("rounds_completed")
        .and_then(|v| v.as_u64())
        .unwrap_or(1) as u8;
    let final_entries: Vec<Stage2Entry> = stage2
        .iter()
        .filter(|e| e.round == final_round)
        .cloned()
        .collect();
    let aggregate_rankings = calculate_aggregate_rankings(&final_entries, &label_to_model);

    let stage3 = state
        .council
        .stage3_synthesize(&query, &stage1, &stage2, &[], &identity_context, &events)
        .await;
    let stage3_value = json!({"model": stage3.model, "response": stage3.response});

    store_assistant_message(
        &state,
        &conversation_id,
        stage1.clone(),
        stage2.clone(),
        stage3_value.clone(),
        tool_result.clone(),
    );

    json!({
        "type": "deliberation",
        "stage1": stage1,
        "stage2": stage2,
        "stage3": stage3_value,
        "tool_result": tool_result,
        "classification": classification,
        "metadata": {
            "label_to_model": label_to_model
                .iter()
                .cloned()
                .collect::<std::collections::HashMap<String, String>>(),
            "aggregate_rankings": aggregate_rankings,
            "deliberation": deliberation_metadata,
        },
    })
}

async fn run_mid_deliberation_check(
    state: &Arc<AppState>,
    query: &str,
    stage: &str,
    stage_summary: &str,
    previous_tools: &[ToolOutcome],
    supplemental: &mut Vec<ToolOutcome>,
    events: &EventSender,
) {
    let available_tools = state.registry.get_detailed_tool_info();
    if available_tools.is_empty() {
        return;
    }

    let assessment = assess_tool_needs(
        &state.client,
        query,
        stage,
        stage_summary,
        &available_tools,
        previous_tools,
    )
    .await;

    if let Some(assessment) = assessment {
        if assessment.needs_tool {
            if let Some(outcome) = state
                .tools
                .execute_mid_deliberation_search(query, stage, &assessment.tool_name, events)
                .await
            {
                supplemental.push(outcome);
            }
        }
    }
}

fn store_assistant_message(
    state: &Arc<AppState>,
    conversation_id: &str,
    stage1: Vec<Stage1Entry>,
    stage2: Vec<Stage2Entry>,
    stage3: Value,
    tool_result: Option<ToolOutcome>,
) {
    if let Err(e) = state.storage.add_assistant_message(
        conversation_id,
        stage1,
        stage2,
        stage3,
        tool_result,
    ) {
        error!(error = %e, "failed to store assistant message");
    }
}

fn save_markdown(state: &Arc<AppState>, conversation_id: &str, response: &str) {
    if response.trim().is_empty() {
        return;
    }
    if let Err(e) = state
        .storage
        .save_final_answer_markdown(conversation_id, response)
    {
        warn!(error = %e, "failed to save final answer markdown");
    }
}

fn record_synthesis_to_memory(
    state: &Arc<AppState>,
    conversation_id: &str,
    query: &str,
    result: &Stage3Result,
    direct: bool,
) {
    if !state.memory.is_available() || !state.config.memory.record_chairman_synthesis {
        return;
    }

    let memory = state.memory.clone();
    let conv_id = conversation_id.to_string();
    let query = query.to_string();
    let model = result.model.clone();
    let response = result.response.clone();
    tokio::spawn(async move {
        if direct {
            memory
                .record_direct_response(&query, &response, &model, &conv_id)
                .await;
        } else {
            memory
                .record_chairman_synthesis(&response, &model, &conv_id)
                .await;
        }
    });
}

//! The council stage engine
//!
//! Stage 1 collects parallel streamed answers from every council model,
//! Stage 2 runs anonymized ranking rounds with quality-threshold-driven
//! refinement, and Stage 3 synthesizes the final markdown answer. The
//! direct path and the classifier also live here, sharing the same client.

pub mod classify;
pub mod direct;
pub mod ranking;
pub mod stage1;
pub mod stage2;
pub mod stage3;

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::pin_mut;
use serde::{Deserialize, Serialize};

use crate::client::{ChatMessage, ModelClient, StreamEvent};
use crate::config::Config;
use crate::metrics::MetricsStore;
use crate::tracker::TokenTracker;

pub use classify::Classification;
pub use ranking::{AggregateRank, calculate_aggregate_rankings};

/// Canonical text when no council model produced an answer.
pub const ALL_MODELS_FAILED: &str = "All models failed to respond. Please try again.";

/// Canonical fallback when the synthesis stream produced nothing.
pub const SYNTHESIS_FALLBACK: &str = "Error: Unable to generate final synthesis.";

/// Per-model retry budget for empty output or stream errors.
pub const STAGE_RETRIES: u32 = 2;

/// One council member's Stage-1 answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage1Entry {
    pub model: String,
    pub response: String,
}

/// One ranker's output for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2Entry {
    pub model: String,
    pub ranking_text: String,
    pub parsed_ranking: Vec<String>,
    pub quality_ratings: HashMap<String, f64>,
    pub round: u8,
}

/// The synthesized final answer. `model` names whichever model actually
/// produced the text (formatter when distinct from the chairman).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage3Result {
    pub model: String,
    pub response: String,
}

/// Stage engine entry point, shared across requests.
pub struct Council {
    pub(crate) client: Arc<ModelClient>,
    pub(crate) metrics: Arc<MetricsStore>,
    pub(crate) config: Arc<Config>,
}

impl Council {
    pub fn new(client: Arc<ModelClient>, metrics: Arc<MetricsStore>, config: Arc<Config>) -> Self {
        Self {
            client,
            metrics,
            config,
        }
    }
}

/// Outcome of draining one model stream to completion.
#[derive(Debug, Default)]
pub(crate) struct StreamedText {
    pub content: String,
    pub reasoning: String,
    pub error: Option<String>,
}

impl StreamedText {
    /// Content with the reasoning-channel fallback applied.
    pub fn effective_content(&self) -> String {
        if !self.content.trim().is_empty() {
            self.content.clone()
        } else {
            self.reasoning.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.effective_content().trim().is_empty()
    }
}

/// Drain one model stream, invoking `on_event` for every thinking/token
/// event with an up-to-date tracker. Stream errors end the drain but keep
/// whatever content accumulated.
pub(crate) async fn drain_model_stream<F>(
    client: &ModelClient,
    model: &str,
    messages: &[ChatMessage],
    max_tokens: Option<u32>,
    mut on_event: F,
) -> StreamedText
where
    F: FnMut(&StreamEvent, &TokenTracker),
{
    let mut tracker = TokenTracker::start();
    let mut result = StreamedText::default();

    let stream = client.query_stream(model, messages, max_tokens);
    pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match &event {
            StreamEvent::Thinking { content, .. } => {
                tracker.record_thinking();
                result.reasoning = content.clone();
                on_event(&event, &tracker);
            }
            StreamEvent::Token { content, .. } => {
                tracker.record_token();
                result.content = content.clone();
                on_event(&event, &tracker);
            }
            StreamEvent::Complete {
                content,
                reasoning_content,
            } => {
                result.content = content.clone();
                result.reasoning = reasoning_content.clone();
            }
            StreamEvent::Error {
                error,
                content,
                reasoning_content,
            } => {
                result.content = content.clone();
                result.reasoning = reasoning_content.clone();
                result.error = Some(error.clone());
            }
        }
    }

    // A stream that ends without a complete event keeps its accumulated
    // content; the caller retries only when nothing arrived at all.
    result
}

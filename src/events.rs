//! SSE event vocabulary and the per-request fan-out queue
//!
//! Every request owns one unbounded FIFO. Producers inside stage and tool
//! tasks push events; a single consumer drains them to the client as
//! `data: <json>\n\n` frames. Enqueue order is delivery order; there is no
//! per-model fairness.

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::tracker::Timing;

/// The full event vocabulary streamed to the client. Payloads tag with
/// `model` where relevant; token events carry cumulative `content` and the
/// timing snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Pre-flight title generation
    TitleGenerationStart,
    TitleComplete {
        title: String,
    },
    TitleError {
        error: String,
    },

    // Memory gate
    MemoryCheckStart,
    MemorySearchComplete {
        found_memories: usize,
        sample: Vec<String>,
    },
    MemoryConfidenceCalculated {
        confidence: f64,
        threshold: f64,
        reasoning: String,
    },
    MemoryCheckComplete {
        using_memory: bool,
        confidence: f64,
    },
    MemoryResponseStart {
        confidence: f64,
    },
    MemoryResponseComplete {
        data: Value,
    },

    // Classification
    ClassificationStart,
    ClassificationComplete {
        classification: Value,
    },

    // Tool orchestration
    ToolCheckStart,
    ToolCallStart {
        tool: String,
        arguments: Value,
        call_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    ToolCallComplete {
        tool: String,
        call_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<u32>,
    },
    ToolResult {
        tool: String,
        input: Value,
        output: Value,
        formatted: String,
    },
    OrchestrationStart {
        query: String,
    },
    OrchestrationPlan {
        steps: Value,
    },
    OrchestrationComplete {
        steps: usize,
        success: bool,
    },
    MidDeliberationToolStart {
        stage: String,
        tool: String,
    },
    MidDeliberationToolComplete {
        stage: String,
        tool: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // Direct path
    DirectResponseStart {
        reason: String,
    },
    DirectResponseToken {
        model: String,
        delta: String,
        content: String,
        #[serde(flatten)]
        timing: Timing,
    },
    DirectResponseThinking {
        model: String,
        delta: String,
        content: String,
        #[serde(flatten)]
        timing: Timing,
    },
    DirectResponseComplete {
        data: Value,
        #[serde(flatten)]
        timing: Timing,
    },
    DirectResponseRetry {
        model: String,
        attempt: u32,
        reason: String,
    },
    DirectResponseError {
        model: String,
        error: String,
    },

    // Deliberation stage 1
    DeliberationStart {
        reason: String,
    },
    Stage1Start,
    Stage1Token {
        model: String,
        delta: String,
        content: String,
        #[serde(flatten)]
        timing: Timing,
    },
    Stage1Thinking {
        model: String,
        delta: String,
        content: String,
        #[serde(flatten)]
        timing: Timing,
    },
    Stage1ModelComplete {
        model: String,
        response: String,
        #[serde(flatten)]
        timing: Timing,
    },
    Stage1ModelRetry {
        model: String,
        attempt: u32,
        reason: String,
    },
    Stage1ModelError {
        model: String,
        error: String,
    },
    Stage1Complete {
        data: Value,
    },

    // Deliberation stage 2 (rounds + refinement)
    Stage2Start,
    RoundStart {
        round: u8,
        max_rounds: u8,
    },
    RoundComplete {
        round: u8,
        refined: usize,
    },
    Stage2Token {
        model: String,
        delta: String,
        content: String,
        round: u8,
        #[serde(flatten)]
        timing: Timing,
    },
    Stage2Thinking {
        model: String,
        delta: String,
        content: String,
        round: u8,
        #[serde(flatten)]
        timing: Timing,
    },
    Stage2ModelComplete {
        model: String,
        round: u8,
        #[serde(flatten)]
        timing: Timing,
    },
    RefinementStart {
        model: String,
        label: String,
        round: u8,
    },
    RefinementToken {
        model: String,
        delta: String,
        content: String,
        #[serde(flatten)]
        timing: Timing,
    },
    RefinementComplete {
        model: String,
        label: String,
        round: u8,
    },
    Stage2Complete {
        data: Value,
        metadata: Value,
    },

    // Deliberation stage 3
    Stage3Start,
    Stage3Token {
        model: String,
        delta: String,
        content: String,
        #[serde(flatten)]
        timing: Timing,
    },
    Stage3Thinking {
        model: String,
        delta: String,
        content: String,
        #[serde(flatten)]
        timing: Timing,
    },
    Stage3Complete {
        data: Value,
    },
    Stage3Error {
        error: String,
    },

    // Terminal
    Complete {
        response_type: String,
    },
    Error {
        message: String,
    },
}

impl Event {
    /// Serialize into an SSE frame.
    pub fn to_sse_frame(&self) -> String {
        let json = serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"error","message":"serialization failed"}"#.into());
        format!("data: {json}\n\n")
    }
}

/// Producer half of the per-request event queue. Cloned into every stage and
/// tool task; sends to a disconnected client are silently dropped.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// A sender whose events go nowhere; used by the non-streaming endpoint.
    pub fn noop() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// 8-char random id pairing `tool_call_start` with `tool_call_complete`.
pub fn new_call_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::Stage1Start;
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("data: "));
        assert!(frame.contains(r#""type":"stage1_start""#));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn test_timing_is_flattened() {
        let event = Event::Stage1Token {
            model: "m".into(),
            delta: "x".into(),
            content: "x".into(),
            timing: Timing {
                tokens_per_sec: 10.0,
                elapsed_seconds: 1.0,
                thinking_seconds: 0.5,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stage1_token");
        assert_eq!(json["tokens_per_sec"], 10.0);
        assert_eq!(json["thinking_seconds"], 0.5);
    }

    #[test]
    fn test_call_id_is_eight_chars() {
        let id = new_call_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_queue_preserves_enqueue_order() {
        let (sender, mut rx) = EventSender::channel();
        sender.send(Event::Stage1Start);
        sender.send(Event::Stage2Start);
        sender.send(Event::Stage3Start);

        let mut types = vec![];
        while let Ok(event) = rx.try_recv() {
            types.push(serde_json::to_value(&event).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string());
        }
        assert_eq!(types, vec!["stage1_start", "stage2_start", "stage3_start"]);
    }
}

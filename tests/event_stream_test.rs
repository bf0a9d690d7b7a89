// Streaming fan-out contract: FIFO delivery order, SSE frame shape, busy
// flag restoration across failed calls, and call-id pairing.

use serde_json::{Value, json};

use conclave::events::{Event, EventSender, new_call_id};
use conclave::mcp::McpRegistry;
use conclave::tracker::Timing;

fn event_type(event: &Event) -> String {
    serde_json::to_value(event).unwrap()["type"]
        .as_str()
        .unwrap()
        .to_string()
}

#[test]
fn events_drain_in_enqueue_order_across_producers() {
    let (sender, mut rx) = EventSender::channel();

    // Two "producers" interleaving writes on one queue.
    let a = sender.clone();
    let b = sender.clone();
    a.send(Event::Stage1Start);
    b.send(Event::Stage1Token {
        model: "m2".into(),
        delta: "x".into(),
        content: "x".into(),
        timing: Timing::default(),
    });
    a.send(Event::Stage1Token {
        model: "m1".into(),
        delta: "y".into(),
        content: "y".into(),
        timing: Timing::default(),
    });
    a.send(Event::Stage1Complete { data: json!([]) });

    let mut types = vec![];
    while let Ok(event) = rx.try_recv() {
        types.push(event_type(&event));
    }
    assert_eq!(
        types,
        vec![
            "stage1_start",
            "stage1_token",
            "stage1_token",
            "stage1_complete"
        ]
    );
}

#[test]
fn sse_frames_are_data_prefixed_json() {
    let event = Event::Complete {
        response_type: "deliberation".into(),
    };
    let frame = event.to_sse_frame();
    assert!(frame.starts_with("data: {"));
    assert!(frame.ends_with("\n\n"));

    let json_part = frame.strip_prefix("data: ").unwrap().trim_end();
    let parsed: Value = serde_json::from_str(json_part).unwrap();
    assert_eq!(parsed["type"], "complete");
    assert_eq!(parsed["response_type"], "deliberation");
}

#[test]
fn tool_call_events_pair_by_call_id() {
    let (sender, mut rx) = EventSender::channel();
    let call_id = new_call_id();

    sender.send(Event::ToolCallStart {
        tool: "websearch.search".into(),
        arguments: json!({"query": "news"}),
        call_id: call_id.clone(),
        step: None,
        description: None,
    });
    sender.send(Event::ToolCallComplete {
        tool: "websearch.search".into(),
        call_id: call_id.clone(),
        success: true,
        result: None,
        step: None,
    });

    let start = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
    let complete = serde_json::to_value(rx.try_recv().unwrap()).unwrap();
    assert_eq!(start["type"], "tool_call_start");
    assert_eq!(complete["type"], "tool_call_complete");
    assert_eq!(start["call_id"], complete["call_id"]);
    assert_eq!(start["call_id"].as_str().unwrap().len(), 8);
}

#[tokio::test]
async fn registry_busy_set_is_restored_after_failed_calls() {
    let registry = McpRegistry::disabled();
    let before = registry.tools_in_use();

    // Unknown tools fail deterministically and leave no busy residue.
    let outcome = registry.call_tool("ghost.tool", json!({})).await;
    assert!(!outcome.success);

    let after = registry.tools_in_use();
    assert_eq!(before, after);
    assert!(after.is_empty());
}

#[test]
fn timing_fields_flatten_into_token_events() {
    let event = Event::Stage3Token {
        model: "formatter".into(),
        delta: "#".into(),
        content: "#".into(),
        timing: Timing {
            tokens_per_sec: 42.0,
            elapsed_seconds: 2.0,
            thinking_seconds: 1.0,
        },
    };
    let value = serde_json::to_value(&event).unwrap();
    // Flattened, not nested under a "timing" key.
    assert!(value.get("timing").is_none());
    assert_eq!(value["tokens_per_sec"], 42.0);
    assert!(value["thinking_seconds"].as_f64().unwrap() <= value["elapsed_seconds"].as_f64().unwrap());
}

#[test]
fn dropped_receiver_does_not_panic_senders() {
    let (sender, rx) = EventSender::channel();
    drop(rx);
    // Sends to a disconnected client are silently dropped.
    sender.send(Event::Stage1Start);
    sender.send(Event::Error {
        message: "late".into(),
    });
}

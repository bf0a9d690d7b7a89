// Tool orchestration seams that run without a network: trigger patterns,
// the confidence table, the calculator fast path, and outcome envelopes.

use serde_json::json;

use conclave::mcp::ToolOutcome;
use conclave::tools::plan::needs_multi_tool_orchestration;
use conclave::tools::research::is_deep_research_query;
use conclave::tools::select::{
    DataType, SELECTION_THRESHOLD, calculator_fast_path,
};

#[test]
fn calculator_fast_path_covers_spoken_operators() {
    let cases = [
        ("What is 5 plus 3?", "add", json!({"a": 5, "b": 3})),
        ("what's 10 minus 4", "subtract", json!({"a": 10, "b": 4})),
        ("compute 6 times 7 please", "multiply", json!({"a": 6, "b": 7})),
        ("100 divided by 25?", "divide", json!({"a": 100, "b": 25})),
    ];

    for (query, expected_op, expected_args) in cases {
        let (op, args) = calculator_fast_path(query).unwrap_or_else(|| panic!("no parse: {query}"));
        assert_eq!(op, expected_op, "query: {query}");
        assert_eq!(args, expected_args, "query: {query}");
    }
}

#[test]
fn calculator_fast_path_rejects_non_arithmetic() {
    assert!(calculator_fast_path("what's the weather today").is_none());
    assert!(calculator_fast_path("add some salt to taste").is_none());
}

#[test]
fn every_mapped_confidence_meets_threshold() {
    // The deterministic table never maps a type below the firing threshold,
    // so "type detected but tool skipped" can only come from an unregistered
    // tool, not the table itself.
    let types = [
        DataType::CurrentTime,
        DataType::Location,
        DataType::News,
        DataType::Weather,
        DataType::Calculation,
        DataType::WebContent,
    ];
    for data_type in types {
        let (server, tool, confidence) = data_type.mapping();
        assert!(!server.is_empty());
        assert!(!tool.is_empty());
        assert!(confidence >= SELECTION_THRESHOLD, "{data_type:?}");
    }
}

#[test]
fn threshold_comparison_is_inclusive() {
    // A tool at exactly 0.5 confidence fires.
    assert!(SELECTION_THRESHOLD >= 0.5 && SELECTION_THRESHOLD <= 0.5);
    let at_threshold = 0.5_f64;
    assert!(at_threshold >= SELECTION_THRESHOLD);
}

#[test]
fn multi_step_triggers_on_relative_date_plus_weather() {
    assert!(needs_multi_tool_orchestration("What was the weather like last Tuesday?"));
    assert!(needs_multi_tool_orchestration("what happened in the news yesterday"));
    assert!(!needs_multi_tool_orchestration("Which is better, Python or JavaScript?"));
}

#[test]
fn deep_research_triggers_on_ranked_and_comparison_queries() {
    assert!(is_deep_research_query("top 10 programming languages in 2026"));
    assert!(is_deep_research_query("Compare Rust and Go for backend work"));
    assert!(!is_deep_research_query("what time is it"));
}

#[test]
fn failed_outcome_is_failed_in_both_envelopes() {
    // Outer failure.
    let outer = ToolOutcome::failure("websearch", "search", json!({"query": "x"}), "network", 0.1);
    assert!(outer.is_failed());

    // Inner failure: outer success, inner JSON says success=false.
    let inner = ToolOutcome {
        success: true,
        server: "websearch".into(),
        tool: "search".into(),
        input: json!({"query": "x"}),
        output: Some(json!({
            "content": [{"type": "text", "text": "{\"success\": false, \"error\": \"network\"}"}]
        })),
        execution_time_seconds: 0.1,
        error: None,
    };
    assert!(inner.is_failed());

    // Clean success is not failed.
    let ok = ToolOutcome {
        success: true,
        server: "calculator".into(),
        tool: "add".into(),
        input: json!({"a": 5, "b": 3}),
        output: Some(json!({"content": [{"type": "text", "text": "{\"result\": 8}"}]})),
        execution_time_seconds: 0.01,
        error: None,
    };
    assert!(!ok.is_failed());
    assert_eq!(ok.extracted_output()["result"], 8);
}

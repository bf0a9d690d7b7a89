// Conversation storage lifecycle: append-consistency, soft-delete flow,
// tag extraction, and the persisted message shapes.

use serde_json::json;
use tempfile::TempDir;

use conclave::council::{Stage1Entry, Stage2Entry};
use conclave::mcp::ToolOutcome;
use conclave::storage::{Message, Storage};

#[test]
fn full_deliberation_turn_roundtrips() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path());
    let conversation = storage.create_conversation().unwrap();

    storage
        .add_user_message(&conversation.id, "Which is better, Python or JavaScript?")
        .unwrap();

    let stage1 = vec![
        Stage1Entry {
            model: "model-a".into(),
            response: "Python for data work.".into(),
        },
        Stage1Entry {
            model: "model-b".into(),
            response: "JavaScript for the web.".into(),
        },
    ];
    let stage2 = vec![Stage2Entry {
        model: "model-a".into(),
        ranking_text: "FINAL RANKING:\n1. Response B (4/5)\n2. Response A (3/5)".into(),
        parsed_ranking: vec!["Response B".into(), "Response A".into()],
        quality_ratings: [("Response B".to_string(), 4.0), ("Response A".to_string(), 3.0)]
            .into_iter()
            .collect(),
        round: 1,
    }];
    let tool_result = ToolOutcome {
        success: true,
        server: "websearch".into(),
        tool: "search".into(),
        input: json!({"query": "python vs javascript"}),
        output: Some(json!({"content": [{"type": "text", "text": "results"}]})),
        execution_time_seconds: 1.2,
        error: None,
    };

    storage
        .add_assistant_message(
            &conversation.id,
            stage1,
            stage2,
            json!({"model": "chairman", "response": "# Verdict\n\nIt depends."}),
            Some(tool_result),
        )
        .unwrap();

    let loaded = storage.get(&conversation.id).unwrap();
    assert_eq!(loaded.messages.len(), 2);

    match &loaded.messages[0] {
        Message::User { content } => assert!(content.contains("Python or JavaScript")),
        _ => panic!("first message should be the user turn"),
    }

    match &loaded.messages[1] {
        Message::Assistant {
            stage1,
            stage2,
            stage3,
            tool_result,
        } => {
            assert_eq!(stage1.len(), 2);
            assert_eq!(stage2[0].round, 1);
            assert_eq!(stage3["model"], "chairman");
            assert_eq!(tool_result.as_ref().unwrap().tool, "search");
        }
        _ => panic!("second message should be the assistant turn"),
    }
}

#[test]
fn assistant_invariant_follows_user_message() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path());
    let conversation = storage.create_conversation().unwrap();

    storage.add_user_message(&conversation.id, "hi").unwrap();
    storage
        .add_assistant_message(
            &conversation.id,
            vec![],
            vec![],
            json!({"model": "chairman", "response": "hello"}),
            None,
        )
        .unwrap();

    let loaded = storage.get(&conversation.id).unwrap();
    let roles: Vec<&str> = loaded
        .messages
        .iter()
        .map(|m| match m {
            Message::User { .. } => "user",
            Message::Assistant { .. } => "assistant",
        })
        .collect();
    assert_eq!(roles, vec!["user", "assistant"]);
}

#[test]
fn deleted_conversations_keep_their_documents() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path());
    let conversation = storage.create_conversation().unwrap();

    storage.soft_delete(&conversation.id).unwrap();
    let listed = storage.list();
    assert!(listed[0].deleted);
    assert!(listed[0].deleted_at.is_some());

    // Permanent delete actually removes the file.
    assert!(storage.delete_permanent(&conversation.id));
    assert!(storage.get(&conversation.id).is_none());
    assert!(!storage.delete_permanent(&conversation.id));
}

#[test]
fn tags_only_come_from_first_user_message() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path());
    let conversation = storage.create_conversation().unwrap();

    storage
        .add_user_message(&conversation.id, "plain question, no tags")
        .unwrap();
    storage
        .add_user_message(&conversation.id, "<!-- tags: #late --> follow-up")
        .unwrap();

    let listed = storage.list();
    assert!(listed[0].tags.is_empty());
}

#[test]
fn memory_response_stored_as_stage3() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path());
    let conversation = storage.create_conversation().unwrap();

    storage
        .add_user_message(&conversation.id, "What's my name?")
        .unwrap();
    storage
        .add_assistant_message(
            &conversation.id,
            vec![],
            vec![],
            json!({
                "model": "memory",
                "response": "Your name is Mark.",
                "type": "memory",
                "confidence": 0.92,
                "memories_used": 4,
            }),
            None,
        )
        .unwrap();

    let loaded = storage.get(&conversation.id).unwrap();
    match &loaded.messages[1] {
        Message::Assistant { stage3, .. } => {
            assert_eq!(stage3["type"], "memory");
            assert_eq!(stage3["confidence"], 0.92);
        }
        _ => panic!("expected assistant message"),
    }
}

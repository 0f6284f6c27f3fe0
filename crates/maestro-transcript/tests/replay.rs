//! Replays a recorded prompt/response cycle from an OpenCode server.

use maestro_transcript::{Applied, MessageRole, PartContent, ToolStatus, Transcript};
use serde_json::{json, Value};

const SESSION: &str = "ses_7f3a";

fn recorded_turn() -> Vec<Value> {
    vec![
        json!({"type": "server.connected", "properties": {}}),
        json!({"type": "message.updated", "properties": {"info": {
            "id": "msg_u1", "sessionID": SESSION, "role": "user", "time": {"created": 1000}
        }}}),
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_u1", "messageID": "msg_u1", "sessionID": SESSION,
            "type": "text", "text": "list the files"
        }}}),
        json!({"type": "session.status", "properties": {"sessionID": SESSION, "status": {"type": "busy"}}}),
        // Part for the assistant message arrives before the message itself.
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_a0", "messageID": "msg_a1", "sessionID": SESSION, "type": "step-start"
        }}}),
        json!({"type": "message.updated", "properties": {"info": {
            "id": "msg_a1", "sessionID": SESSION, "role": "assistant",
            "time": {"created": 1010}, "modelID": "claude-sonnet-4", "providerID": "anthropic"
        }}}),
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_a1", "messageID": "msg_a1", "sessionID": SESSION,
            "type": "text", "text": "Let me"
        }, "delta": "Let me"}}),
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_a1", "messageID": "msg_a1", "sessionID": SESSION,
            "type": "text", "text": "Let me look."
        }, "delta": " look."}}),
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_a2", "messageID": "msg_a1", "sessionID": SESSION,
            "type": "tool", "tool": "bash", "callID": "call_1",
            "state": {"status": "pending", "input": {}}
        }}}),
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_a2", "messageID": "msg_a1", "sessionID": SESSION,
            "type": "tool", "tool": "bash", "callID": "call_1",
            "state": {"status": "running", "input": {"command": "ls"}}
        }}}),
        // Duplicate delivery.
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_a2", "messageID": "msg_a1", "sessionID": SESSION,
            "type": "tool", "tool": "bash", "callID": "call_1",
            "state": {"status": "running", "input": {"command": "ls"}}
        }}}),
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_a2", "messageID": "msg_a1", "sessionID": SESSION,
            "type": "tool", "tool": "bash", "callID": "call_1",
            "state": {"status": "completed", "input": {"command": "ls"}, "output": "Cargo.toml\nsrc\n", "title": "ls"}
        }}}),
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_a3", "messageID": "msg_a1", "sessionID": SESSION,
            "type": "step-finish", "tokens": {"input": 12, "output": 40}
        }}}),
        json!({"type": "message.part.updated", "properties": {"part": {
            "id": "prt_b1", "messageID": "msg_other", "sessionID": "ses_other",
            "type": "text", "text": "not ours"
        }}}),
        json!({"type": "message.updated", "properties": {"info": {
            "id": "msg_a1", "sessionID": SESSION, "role": "assistant",
            "time": {"created": 1010, "completed": 1500}
        }}}),
        json!({"type": "session.idle", "properties": {"sessionID": SESSION}}),
        json!({"type": "message.part.updated", "properties": {"part": {"id": "broken"}}}),
    ]
}

#[test]
fn optimistic_prompt_then_streamed_reply() {
    let mut transcript = Transcript::new(SESSION);
    let temp_id = transcript.insert_temporary_user_message("list the files");

    let mut outcomes = Vec::new();
    let mut was_streaming = false;
    for event in recorded_turn() {
        outcomes.push(transcript.apply_value(&event));
        was_streaming |= transcript.is_streaming();
    }

    assert!(was_streaming);
    assert!(!transcript.is_streaming());
    assert!(outcomes.contains(&Applied::TemporaryReplaced {
        temporary_id: temp_id.clone()
    }));
    assert_eq!(outcomes.last(), Some(&Applied::Dropped));

    let messages = transcript.messages();
    assert_eq!(messages.len(), 2);

    let user = &messages[0];
    assert_eq!(user.id(), "msg_u1");
    assert_eq!(user.role(), MessageRole::User);
    assert!(!user.temporary);
    assert_eq!(user.parts.len(), 1);
    assert_eq!(user.parts[0].id, "prt_u1");
    assert_eq!(user.text(), "list the files");

    let assistant = &messages[1];
    assert_eq!(assistant.id(), "msg_a1");
    assert_eq!(assistant.info.model_id.as_deref(), Some("claude-sonnet-4"));
    assert_eq!(assistant.info.time.completed, Some(1500));
    let ids: Vec<&str> = assistant.parts.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["prt_a1", "prt_a2"]);
    assert_eq!(assistant.text(), "Let me look.");
    match &assistant.parts[1].content {
        PartContent::Tool { tool, state, .. } => {
            assert_eq!(tool, "bash");
            assert_eq!(state.status, ToolStatus::Completed);
            assert_eq!(state.output.as_deref(), Some("Cargo.toml\nsrc\n"));
        }
        other => panic!("expected tool part, got {other:?}"),
    }
}

#[test]
fn replay_is_idempotent() {
    let mut once = Transcript::new(SESSION);
    let mut twice = Transcript::new(SESSION);
    for event in recorded_turn() {
        once.apply_value(&event);
        twice.apply_value(&event);
        twice.apply_value(&event);
    }

    assert_eq!(once.messages(), twice.messages());
}

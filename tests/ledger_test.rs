//! Ledger streaming, history, and lifecycle tests.

use tokio::sync::mpsc;
use wave_core::ledger::{Ledger, LedgerEvent};
use wave_core::types::*;

fn collect(rx: &mut mpsc::UnboundedReceiver<LedgerEvent>) -> Vec<LedgerEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

#[test]
fn streaming_emits_chunks_that_concatenate_to_the_accumulated_content() {
    let mut ledger = Ledger::new("/tmp/ws");
    ledger.add_assistant_message();

    let mut rx = ledger.subscribe();
    for accumulated in ["He", "Hello", "Hello world"] {
        ledger.update_assistant_content(accumulated);
    }

    let events = collect(&mut rx);
    let chunks: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            LedgerEvent::AssistantContentUpdated { chunk, .. } => Some(chunk.clone()),
            _ => None,
        })
        .collect();
    let changed = events
        .iter()
        .filter(|e| matches!(e, LedgerEvent::MessagesChanged))
        .count();

    assert_eq!(chunks, vec!["He", "llo", " world"]);
    assert_eq!(changed, 3);
    assert_eq!(chunks.concat(), "Hello world");
    assert_eq!(ledger.messages().last().unwrap().text(), "Hello world");
}

#[test]
fn streaming_prepends_a_text_block_when_tool_blocks_arrived_first() {
    let mut ledger = Ledger::new("/tmp/ws");
    ledger.add_assistant_message();
    ledger.update_tool_block(wave_core::ledger::ToolBlockUpdate {
        id: "t1".into(),
        name: Some("Read".into()),
        stage: Some(ToolStage::Start),
        ..Default::default()
    });
    ledger.update_assistant_content("after the tool");

    let blocks = &ledger.messages().last().unwrap().blocks;
    assert!(matches!(blocks[0], Block::Text { .. }));
    assert!(matches!(blocks[1], Block::Tool { .. }));
}

#[test]
fn at_most_one_text_block_per_assistant_message() {
    let mut ledger = Ledger::new("/tmp/ws");
    ledger.add_assistant_message();
    for accumulated in ["a", "ab", "abc"] {
        ledger.update_assistant_content(accumulated);
    }
    let text_blocks = ledger
        .messages()
        .last()
        .unwrap()
        .blocks
        .iter()
        .filter(|b| matches!(b, Block::Text { .. }))
        .count();
    assert_eq!(text_blocks, 1);
}

// ---------------------------------------------------------------------------
// User messages & history
// ---------------------------------------------------------------------------

#[test]
fn user_messages_carry_source_and_command() {
    let mut ledger = Ledger::new("/tmp/ws");
    ledger.add_user_message("run the tests", Some("/test".into()), MessageSource::Command);
    let message = ledger.messages().last().unwrap();
    assert_eq!(message.source, Some(MessageSource::Command));
    assert_eq!(message.command.as_deref(), Some("/test"));
}

#[test]
fn hook_messages_do_not_enter_input_history() {
    let mut ledger = Ledger::new("/tmp/ws");
    ledger.add_user_message("real input", None, MessageSource::User);
    ledger.add_user_message("injected by hook", None, MessageSource::Hook);
    assert_eq!(ledger.input_history(), ["real input"]);
}

#[test]
fn input_history_collapses_adjacent_duplicates_and_caps_at_100() {
    let mut ledger = Ledger::new("/tmp/ws");
    ledger.add_to_input_history("ls");
    ledger.add_to_input_history("ls");
    ledger.add_to_input_history("pwd");
    ledger.add_to_input_history("ls");
    assert_eq!(ledger.input_history(), ["ls", "pwd", "ls"]);

    for i in 0..150 {
        ledger.add_to_input_history(&format!("cmd-{i}"));
    }
    assert_eq!(ledger.input_history().len(), 100);
    assert_eq!(ledger.input_history()[99], "cmd-149");
}

// ---------------------------------------------------------------------------
// Command output lifecycle
// ---------------------------------------------------------------------------

#[test]
fn command_output_lifecycle_matches_by_command_string() {
    let mut ledger = Ledger::new("/tmp/ws");
    let mut rx = ledger.subscribe();

    ledger.add_command_output_message("cargo build");
    ledger.update_command_output_message("cargo build", "Compiling...\n");
    ledger.update_command_output_message("cargo build", "Compiling...\nFinished\n");
    ledger.complete_command_message("cargo build", 0);

    let events = collect(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        LedgerEvent::CommandOutputCompleted { exit_code: 0, .. }
    )));

    match &ledger.messages().last().unwrap().blocks[0] {
        Block::CommandOutput {
            output,
            exit_code,
            state,
            ..
        } => {
            assert_eq!(output, "Compiling...\nFinished\n");
            assert_eq!(*exit_code, Some(0));
            assert_eq!(*state, CommandState::Done);
        }
        other => panic!("expected command output block, got {other:?}"),
    }
}

#[test]
fn completing_an_unknown_command_is_a_no_op() {
    let mut ledger = Ledger::new("/tmp/ws");
    ledger.complete_command_message("never started", 0);
    assert!(ledger.messages().is_empty());
}

// ---------------------------------------------------------------------------
// Subagent blocks
// ---------------------------------------------------------------------------

#[test]
fn subagent_block_updates_status_and_messages_together() {
    let mut ledger = Ledger::new("/tmp/ws");
    ledger.add_assistant_message();
    ledger.add_subagent_block("sa-1", "researcher");
    ledger.update_subagent_block(
        "sa-1",
        SubagentStatus::Completed,
        Some(vec![Message::user("done")]),
    );

    match &ledger.messages().last().unwrap().blocks[0] {
        Block::Subagent {
            status, messages, ..
        } => {
            assert_eq!(*status, SubagentStatus::Completed);
            assert_eq!(messages.len(), 1);
        }
        other => panic!("expected subagent block, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Compression
// ---------------------------------------------------------------------------

#[test]
fn negative_compression_index_counts_from_the_tail() {
    let mut ledger = Ledger::new("/tmp/ws");
    for i in 0..5 {
        ledger.add_user_message(format!("m{i}"), None, MessageSource::User);
    }
    ledger.compress_messages(-2, "what came before");
    // Five messages: first three replaced by the summary, last two kept.
    assert_eq!(ledger.messages().len(), 3);
    assert!(matches!(
        ledger.messages()[0].blocks[0],
        Block::Compress { .. }
    ));
    assert_eq!(ledger.messages()[1].text(), "m3");
    assert_eq!(ledger.messages()[2].text(), "m4");
}

#[test]
fn compression_regenerates_the_session_id() {
    let mut ledger = Ledger::new("/tmp/ws");
    ledger.add_user_message("a", None, MessageSource::User);
    ledger.add_user_message("b", None, MessageSource::User);
    let before = ledger.session_id().to_string();
    ledger.compress_messages(1, "summary");
    assert_ne!(ledger.session_id(), before);
}

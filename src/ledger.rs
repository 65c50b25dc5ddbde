//! The conversation ledger — single source of truth for the in-memory
//! transcript, with streaming mutators and a change-notification stream.
//!
//! Mutations happen on the session's logical event loop; observers (the UI,
//! the subagent supervisor's forwarders) subscribe with [`Ledger::subscribe`]
//! and receive a [`LedgerEvent`] per mutation. Every mutation additionally
//! emits [`LedgerEvent::MessagesChanged`] so coarse-grained observers can
//! redraw without matching on the typed events.

use crate::types::*;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Cap on the recallable user-input history.
const INPUT_HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum LedgerEvent {
    UserMessageAdded { message: Message },
    AssistantMessageAdded,
    AssistantContentUpdated { chunk: String, accumulated: String },
    /// Fired with the merged view after a tool-block upsert.
    ToolBlockUpdated { block: Block },
    DiffAdded { path: String },
    ErrorAdded { message: String },
    MemoryAdded { storage_path: String, success: bool },
    CommandOutputStarted { command: String },
    CommandOutputUpdated { command: String },
    CommandOutputCompleted { command: String, exit_code: i32 },
    SubagentBlockUpdated { subagent_id: String, status: SubagentStatus },
    MessagesCompressed { replaced: usize },
    MessagesChanged,
}

/// Partial tool-block state to merge by tool call id. `None` fields keep the
/// existing value.
#[derive(Debug, Clone, Default)]
pub struct ToolBlockUpdate {
    pub id: String,
    pub name: Option<String>,
    pub parameters: Option<String>,
    pub partial: Option<String>,
    pub result: Option<String>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub stage: Option<ToolStage>,
}

impl ToolBlockUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct Ledger {
    session_id: String,
    workdir: PathBuf,
    started_at: u64,
    latest_total_tokens: u64,
    messages: Vec<Message>,
    input_history: Vec<String>,
    subscribers: Vec<mpsc::UnboundedSender<LedgerEvent>>,
}

impl Ledger {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            workdir: workdir.into(),
            started_at: now_ms(),
            latest_total_tokens: 0,
            messages: Vec::new(),
            input_history: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    // -- State access --

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn latest_total_tokens(&self) -> u64 {
        self.latest_total_tokens
    }

    pub fn set_latest_total_tokens(&mut self, tokens: u64) {
        self.latest_total_tokens = tokens;
    }

    pub fn input_history(&self) -> &[String] {
        &self.input_history
    }

    /// Subscribe to change notifications. Closed receivers are pruned on the
    /// next emit.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<LedgerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn emit(&mut self, event: LedgerEvent) {
        let follow_up = !matches!(event, LedgerEvent::MessagesChanged);
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        if follow_up {
            self.subscribers
                .retain(|tx| tx.send(LedgerEvent::MessagesChanged).is_ok());
        }
    }

    // -- Appending messages --

    pub fn add_user_message(
        &mut self,
        content: impl Into<String>,
        command: Option<String>,
        source: MessageSource,
    ) {
        let content = content.into();
        if source == MessageSource::User && !content.is_empty() {
            self.add_to_input_history(&content);
        }
        let message = Message {
            id: Some(Uuid::new_v4().to_string()),
            role: Role::User,
            blocks: vec![Block::Text { content }],
            source: Some(source),
            command,
            timestamp: now_ms(),
        };
        self.messages.push(message.clone());
        self.emit(LedgerEvent::UserMessageAdded { message });
    }

    /// Create an empty assistant message for the streaming writer.
    pub fn add_assistant_message(&mut self) {
        let mut message = Message::assistant();
        message.id = Some(Uuid::new_v4().to_string());
        self.messages.push(message);
        self.emit(LedgerEvent::AssistantMessageAdded);
    }

    /// Pop the last message iff it is a user message. Used by hook vetoes.
    pub fn remove_last_user_message(&mut self) -> bool {
        if self.messages.last().is_some_and(|m| m.is_user()) {
            self.messages.pop();
            self.emit(LedgerEvent::MessagesChanged);
            true
        } else {
            false
        }
    }

    // -- Streaming assistant content --

    /// Rewrite the current assistant `text` block with the accumulated
    /// content and emit the chunk that was appended since the last call.
    ///
    /// Invariant: the concatenation of emitted chunks over a message equals
    /// the final accumulated content.
    pub fn update_assistant_content(&mut self, accumulated: &str) {
        let message = self.current_assistant_mut();
        let existing = message.blocks.iter_mut().find_map(|b| match b {
            Block::Text { content } => Some(content),
            _ => None,
        });
        let chunk = match existing {
            Some(content) => {
                let chunk = accumulated
                    .get(content.len()..)
                    .unwrap_or(accumulated)
                    .to_string();
                *content = accumulated.to_string();
                chunk
            }
            None => {
                // No text block yet: prepend one so text renders before tool
                // blocks that may already be streaming.
                message.blocks.insert(
                    0,
                    Block::Text {
                        content: accumulated.to_string(),
                    },
                );
                accumulated.to_string()
            }
        };
        self.emit(LedgerEvent::AssistantContentUpdated {
            chunk,
            accumulated: accumulated.to_string(),
        });
    }

    // -- Tool blocks --

    /// Upsert a tool block by call id into the last assistant message.
    /// Provided fields overwrite; the merged view is emitted.
    pub fn update_tool_block(&mut self, update: ToolBlockUpdate) {
        let message = self.current_assistant_mut();
        let index = message.blocks.iter().position(
            |b| matches!(b, Block::Tool { id, .. } if *id == update.id),
        );
        let index = match index {
            Some(i) => i,
            None => {
                message.blocks.push(Block::Tool {
                    id: update.id.clone(),
                    name: String::new(),
                    parameters: String::new(),
                    partial: None,
                    result: None,
                    success: None,
                    error: None,
                    stage: ToolStage::Start,
                });
                message.blocks.len() - 1
            }
        };
        let merged = match &mut message.blocks[index] {
            Block::Tool {
                name,
                parameters,
                partial,
                result,
                success,
                error,
                stage,
                ..
            } => {
                if let Some(n) = update.name {
                    *name = n;
                }
                if let Some(p) = update.parameters {
                    *parameters = p;
                }
                if update.partial.is_some() {
                    *partial = update.partial;
                }
                if update.result.is_some() {
                    *result = update.result;
                }
                if update.success.is_some() {
                    *success = update.success;
                }
                if update.error.is_some() {
                    *error = update.error;
                }
                if let Some(s) = update.stage {
                    *stage = s;
                }
                Block::Tool {
                    id: update.id,
                    name: name.clone(),
                    parameters: parameters.clone(),
                    partial: partial.clone(),
                    result: result.clone(),
                    success: *success,
                    error: error.clone(),
                    stage: *stage,
                }
            }
            _ => unreachable!("index points at a tool block"),
        };
        self.emit(LedgerEvent::ToolBlockUpdated { block: merged });
    }

    // -- Typed block appends --

    pub fn add_diff_block(&mut self, path: impl Into<String>, edits: impl Into<String>) {
        let path = path.into();
        self.current_assistant_mut().blocks.push(Block::Diff {
            path: path.clone(),
            edits: edits.into(),
        });
        self.emit(LedgerEvent::DiffAdded { path });
    }

    pub fn add_error_block(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.current_assistant_mut().blocks.push(Block::Error {
            message: message.clone(),
        });
        self.emit(LedgerEvent::ErrorAdded { message });
    }

    pub fn add_memory_block(
        &mut self,
        content: impl Into<String>,
        memory_type: MemoryType,
        storage_path: impl Into<String>,
        success: bool,
    ) {
        let storage_path = storage_path.into();
        self.current_assistant_mut().blocks.push(Block::Memory {
            content: content.into(),
            memory_type,
            storage_path: storage_path.clone(),
            success,
        });
        self.emit(LedgerEvent::MemoryAdded {
            storage_path,
            success,
        });
    }

    /// Attach committed snapshots to the message with the given id (or, when
    /// absent, the last assistant message).
    pub fn attach_file_history(&mut self, message_id: Option<&str>, snapshots: Vec<FileSnapshot>) {
        if snapshots.is_empty() {
            return;
        }
        let message = match message_id {
            Some(id) => self
                .messages
                .iter_mut()
                .rfind(|m| m.id.as_deref() == Some(id)),
            None => self.messages.iter_mut().rfind(|m| m.is_assistant()),
        };
        if let Some(message) = message {
            let existing = message
                .blocks
                .iter_mut()
                .find(|b| matches!(b, Block::FileHistory { .. }));
            match existing {
                Some(Block::FileHistory {
                    snapshots: existing,
                }) => existing.extend(snapshots),
                _ => message.blocks.push(Block::FileHistory { snapshots }),
            }
            self.emit(LedgerEvent::MessagesChanged);
        }
    }

    // -- Command output lifecycle --

    /// Open a new message holding a running command-output block.
    pub fn add_command_output_message(&mut self, command: impl Into<String>) {
        let command = command.into();
        let message = Message {
            id: Some(Uuid::new_v4().to_string()),
            role: Role::User,
            blocks: vec![Block::CommandOutput {
                command: command.clone(),
                output: String::new(),
                exit_code: None,
                state: CommandState::Running,
            }],
            source: Some(MessageSource::Command),
            command: Some(command.clone()),
            timestamp: now_ms(),
        };
        self.messages.push(message);
        self.emit(LedgerEvent::CommandOutputStarted { command });
    }

    /// Replace the accumulated output of the most recent open block for this
    /// command.
    pub fn update_command_output_message(&mut self, command: &str, output: impl Into<String>) {
        if let Some(Block::CommandOutput { output: acc, .. }) = self.open_command_block(command) {
            *acc = output.into();
            self.emit(LedgerEvent::CommandOutputUpdated {
                command: command.to_string(),
            });
        }
    }

    /// Mark the most recent open block for this command as done.
    pub fn complete_command_message(&mut self, command: &str, exit_code: i32) {
        if let Some(Block::CommandOutput {
            exit_code: code,
            state,
            ..
        }) = self.open_command_block(command)
        {
            *code = Some(exit_code);
            *state = CommandState::Done;
            self.emit(LedgerEvent::CommandOutputCompleted {
                command: command.to_string(),
                exit_code,
            });
        }
    }

    fn open_command_block(&mut self, command: &str) -> Option<&mut Block> {
        self.messages.iter_mut().rev().find_map(|m| {
            m.blocks.iter_mut().rev().find(|b| {
                matches!(
                    b,
                    Block::CommandOutput { command: c, state: CommandState::Running, .. }
                        if c == command
                )
            })
        })
    }

    // -- Subagent blocks --

    /// Add a subagent block to the last assistant message.
    pub fn add_subagent_block(&mut self, subagent_id: impl Into<String>, name: impl Into<String>) {
        let subagent_id = subagent_id.into();
        self.current_assistant_mut().blocks.push(Block::Subagent {
            subagent_id: subagent_id.clone(),
            name: name.into(),
            status: SubagentStatus::Active,
            messages: Vec::new(),
        });
        self.emit(LedgerEvent::SubagentBlockUpdated {
            subagent_id,
            status: SubagentStatus::Active,
        });
    }

    /// Update status and embedded messages of a subagent block in one step.
    pub fn update_subagent_block(
        &mut self,
        subagent_id: &str,
        status: SubagentStatus,
        messages: Option<Vec<Message>>,
    ) {
        let found = self.messages.iter_mut().rev().find_map(|m| {
            m.blocks.iter_mut().find(|b| {
                matches!(b, Block::Subagent { subagent_id: id, .. } if id == subagent_id)
            })
        });
        if let Some(Block::Subagent {
            status: s,
            messages: embedded,
            ..
        }) = found
        {
            *s = status;
            if let Some(messages) = messages {
                *embedded = messages;
            }
            self.emit(LedgerEvent::SubagentBlockUpdated {
                subagent_id: subagent_id.to_string(),
                status,
            });
        }
    }

    // -- Compression --

    /// Replace messages `[0, actual_index)` with a single compacted summary
    /// and regenerate the session id. Negative indices count from the tail.
    /// Old session files on disk are not rewritten.
    pub fn compress_messages(&mut self, insert_index: i64, content: impl Into<String>) {
        let len = self.messages.len() as i64;
        let actual = if insert_index < 0 {
            (len + insert_index).max(0)
        } else {
            insert_index.min(len)
        } as usize;
        if actual == 0 {
            return;
        }
        let summary = Message {
            id: Some(Uuid::new_v4().to_string()),
            role: Role::Assistant,
            blocks: vec![Block::Compress {
                content: content.into(),
            }],
            source: None,
            command: None,
            timestamp: now_ms(),
        };
        self.messages.splice(0..actual, [summary]);
        self.session_id = Uuid::new_v4().to_string();
        self.emit(LedgerEvent::MessagesCompressed { replaced: actual });
    }

    // -- Input history --

    /// Record a user input. Adjacent duplicates collapse; the history is
    /// capped at the most recent 100 entries.
    pub fn add_to_input_history(&mut self, entry: &str) {
        if self.input_history.last().is_some_and(|last| last == entry) {
            return;
        }
        self.input_history.push(entry.to_string());
        if self.input_history.len() > INPUT_HISTORY_LIMIT {
            let excess = self.input_history.len() - INPUT_HISTORY_LIMIT;
            self.input_history.drain(..excess);
        }
    }

    // -- Session restoration support --

    /// Replace the in-memory state with a restored session and recompute the
    /// input history from its user messages.
    pub(crate) fn restore(
        &mut self,
        session_id: String,
        workdir: PathBuf,
        started_at: u64,
        latest_total_tokens: u64,
        messages: Vec<Message>,
    ) {
        self.session_id = session_id;
        self.workdir = workdir;
        self.started_at = started_at;
        self.latest_total_tokens = latest_total_tokens;
        self.messages = messages;
        self.input_history.clear();
        let inputs: Vec<String> = self
            .messages
            .iter()
            .filter(|m| m.is_user() && m.source.unwrap_or_default() == MessageSource::User)
            .map(|m| m.text())
            .filter(|t| !t.is_empty())
            .collect();
        for input in inputs {
            self.add_to_input_history(&input);
        }
        self.emit(LedgerEvent::MessagesChanged);
    }

    // -- Internal --

    /// The last assistant message in the transcript — it need not be the
    /// final message (hook-injected user messages may trail it). An empty
    /// shell is appended when no assistant message exists at all.
    fn current_assistant_mut(&mut self) -> &mut Message {
        if !self.messages.iter().any(|m| m.is_assistant()) {
            let mut message = Message::assistant();
            message.id = Some(Uuid::new_v4().to_string());
            self.messages.push(message);
        }
        self.messages
            .iter_mut()
            .rfind(|m| m.is_assistant())
            .expect("assistant message just ensured")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(rx: &mut mpsc::UnboundedReceiver<LedgerEvent>) -> Vec<LedgerEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[test]
    fn streaming_chunks_concatenate() {
        let mut ledger = Ledger::new("/tmp");
        ledger.add_assistant_message();
        let mut chunks = Vec::new();
        for acc in ["He", "Hello", "Hello world"] {
            let mut rx = ledger.subscribe();
            ledger.update_assistant_content(acc);
            for e in collect(&mut rx) {
                if let LedgerEvent::AssistantContentUpdated { chunk, .. } = e {
                    chunks.push(chunk);
                }
            }
        }
        assert_eq!(chunks, vec!["He", "llo", " world"]);
        assert_eq!(ledger.messages().last().unwrap().text(), "Hello world");
    }

    #[test]
    fn tool_block_upsert_merges_fields() {
        let mut ledger = Ledger::new("/tmp");
        ledger.add_assistant_message();
        ledger.update_tool_block(ToolBlockUpdate {
            id: "t1".into(),
            name: Some("Edit".into()),
            parameters: Some("{}".into()),
            stage: Some(ToolStage::Start),
            ..Default::default()
        });
        ledger.update_tool_block(ToolBlockUpdate {
            id: "t1".into(),
            result: Some("done".into()),
            success: Some(true),
            stage: Some(ToolStage::End),
            ..Default::default()
        });
        let last = ledger.messages().last().unwrap();
        match &last.blocks[0] {
            Block::Tool {
                name,
                result,
                success,
                stage,
                ..
            } => {
                assert_eq!(name, "Edit");
                assert_eq!(result.as_deref(), Some("done"));
                assert_eq!(*success, Some(true));
                assert_eq!(*stage, ToolStage::End);
            }
            other => panic!("expected tool block, got {other:?}"),
        }
        assert_eq!(last.blocks.len(), 1);
    }

    #[test]
    fn command_output_matches_most_recent_open_block() {
        let mut ledger = Ledger::new("/tmp");
        ledger.add_command_output_message("make");
        ledger.complete_command_message("make", 0);
        ledger.add_command_output_message("make");
        ledger.update_command_output_message("make", "second run");
        ledger.complete_command_message("make", 2);

        let outputs: Vec<(String, Option<i32>)> = ledger
            .messages()
            .iter()
            .flat_map(|m| &m.blocks)
            .filter_map(|b| match b {
                Block::CommandOutput {
                    output, exit_code, ..
                } => Some((output.clone(), *exit_code)),
                _ => None,
            })
            .collect();
        assert_eq!(outputs[0], (String::new(), Some(0)));
        assert_eq!(outputs[1], ("second run".into(), Some(2)));
    }

    #[test]
    fn compress_replaces_prefix_and_rotates_session() {
        let mut ledger = Ledger::new("/tmp");
        for i in 0..4 {
            ledger.add_user_message(format!("msg {i}"), None, MessageSource::User);
        }
        let old_session = ledger.session_id().to_string();
        ledger.compress_messages(-1, "summary");
        assert_eq!(ledger.messages().len(), 2);
        assert!(matches!(
            ledger.messages()[0].blocks[0],
            Block::Compress { .. }
        ));
        assert_eq!(ledger.messages()[1].text(), "msg 3");
        assert_ne!(ledger.session_id(), old_session);
    }

    #[test]
    fn remove_last_user_only_pops_user_messages() {
        let mut ledger = Ledger::new("/tmp");
        ledger.add_user_message("hi", None, MessageSource::User);
        ledger.add_assistant_message();
        assert!(!ledger.remove_last_user_message());
        assert_eq!(ledger.messages().len(), 2);
        let mut ledger = Ledger::new("/tmp");
        ledger.add_user_message("hi", None, MessageSource::User);
        assert!(ledger.remove_last_user_message());
        assert!(ledger.messages().is_empty());
    }

    #[test]
    fn input_history_dedups_and_caps() {
        let mut ledger = Ledger::new("/tmp");
        for _ in 0..3 {
            ledger.add_to_input_history("same");
        }
        assert_eq!(ledger.input_history().len(), 1);
        for i in 0..250 {
            ledger.add_to_input_history(&format!("cmd {i}"));
        }
        assert_eq!(ledger.input_history().len(), 100);
        assert_eq!(ledger.input_history().last().unwrap(), "cmd 249");
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Roles & sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Where a user message came from. Hook-injected messages are tagged so the
/// UI can render them differently and so hooks never re-trigger on them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    #[default]
    User,
    Hook,
    Command,
}

// ---------------------------------------------------------------------------
// Blocks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolStage {
    Start,
    Delta,
    End,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Project,
    User,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Running,
    Done,
}

/// A typed unit within a message.
///
/// Persisted sessions round-trip through this enum; an unknown `type` tag is
/// a deserialization error, never silently dropped data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Block {
    #[serde(rename = "text")]
    Text { content: String },
    #[serde(rename = "tool")]
    Tool {
        id: String,
        name: String,
        /// Raw parameters JSON as streamed from the model.
        parameters: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        partial: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        success: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        stage: ToolStage,
    },
    #[serde(rename = "diff")]
    Diff { path: String, edits: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "compress")]
    Compress { content: String },
    #[serde(rename = "memory")]
    Memory {
        content: String,
        #[serde(rename = "memoryType")]
        memory_type: MemoryType,
        #[serde(rename = "storagePath")]
        storage_path: String,
        success: bool,
    },
    #[serde(rename = "commandOutput")]
    CommandOutput {
        command: String,
        output: String,
        #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        state: CommandState,
    },
    #[serde(rename = "subagent")]
    Subagent {
        #[serde(rename = "subagentId")]
        subagent_id: String,
        name: String,
        status: SubagentStatus,
        messages: Vec<Message>,
    },
    #[serde(rename = "fileHistory")]
    FileHistory { snapshots: Vec<FileSnapshot> },
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One entry in the conversation transcript: an ordered sequence of blocks
/// under a role.
///
/// Invariant: at most one `Text` block per assistant message; streaming
/// appends to its `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub blocks: Vec<Block>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<MessageSource>,
    /// Custom (slash) command payload carried by user messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub timestamp: u64,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: None,
            role: Role::User,
            blocks: vec![Block::Text {
                content: text.into(),
            }],
            source: Some(MessageSource::User),
            command: None,
            timestamp: now_ms(),
        }
    }

    /// An empty assistant shell for the streaming writer to fill in.
    pub fn assistant() -> Self {
        Self {
            id: None,
            role: Role::Assistant,
            blocks: Vec::new(),
            source: None,
            command: None,
            timestamp: now_ms(),
        }
    }

    /// Concatenation of all `Text` block contents.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

// ---------------------------------------------------------------------------
// File snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOperation {
    Create,
    Modify,
    Delete,
}

/// A record of a file's prior state, buffered by the reversion log until it
/// is committed and attached to the originating message's `fileHistory`
/// block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "filePath")]
    pub file_path: PathBuf,
    pub operation: SnapshotOperation,
    pub timestamp: u64,
    /// File content before the mutation; `None` when the file did not exist
    /// (the expected case for `Create`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "snapshotPath", skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

impl FileSnapshot {
    pub fn snapshot_id(&self) -> String {
        format!(
            "{}-{}-{}",
            self.message_id,
            self.file_path.display(),
            self.timestamp
        )
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Background task status. Transitions are monotonic; terminal states are
/// final.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Subagent lifecycle status, shared by supervisor instances and the
/// `subagent` blocks that embed them in the transcript.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubagentStatus {
    Initializing,
    Active,
    Completed,
    Error,
    Aborted,
}

impl SubagentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

impl fmt::Display for SubagentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

//! Seam between the kernel and the model-facing loop.
//!
//! The streaming client itself lives outside the core; the supervisor only
//! needs something it can point at a ledger and cancel. [`MockDriver`]
//! scripts deterministic turns for tests.

use crate::ledger::Ledger;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// The tool that spawns subagents; stripped from every subagent's allow-list
/// to keep recursion impossible.
pub const TASK_TOOL: &str = "Task";

#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub system_prompt: String,
    pub model: String,
    /// Names of the tools the loop may call.
    pub tools: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("model loop failed: {0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
}

/// Drives one model loop to completion against an isolated ledger.
/// Implementations append assistant messages and blocks as they stream.
#[async_trait]
pub trait LoopDriver: Send + Sync {
    async fn run(
        &self,
        ledger: Arc<Mutex<Ledger>>,
        config: DriveConfig,
        cancel: CancellationToken,
    ) -> Result<(), DriveError>;
}

// ---------------------------------------------------------------------------
// Tool registry
// ---------------------------------------------------------------------------

/// Names of the tools registered with the parent agent. Shared by reference
/// with subagents, read-only.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    names: Vec<String>,
}

impl ToolRegistry {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Effective tool list for a subagent: the allow-list (or, absent one,
    /// every registered tool) with `Task` always removed.
    pub fn subagent_tools(&self, allowed: Option<&[String]>) -> Vec<String> {
        let source: &[String] = allowed.unwrap_or(&self.names);
        source
            .iter()
            .filter(|name| name.as_str() != TASK_TOOL)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Mock driver
// ---------------------------------------------------------------------------

/// A scripted turn for [`MockDriver`].
#[derive(Debug, Clone)]
pub enum MockTurn {
    /// Append an assistant message with this text.
    Text(String),
    /// Append an assistant message and stream it as accumulated updates.
    Chunks(Vec<String>),
    /// Produce no assistant message at all.
    Silence,
    /// Fail the loop.
    Fail(String),
    /// Park until the cancellation token fires, then report cancellation.
    BlockUntilCancelled,
}

/// Mock model loop for tests. Supply a sequence of turns; each `run`
/// consumes the next one and records its configuration for assertions.
pub struct MockDriver {
    turns: Mutex<Vec<MockTurn>>,
    runs: Mutex<Vec<DriveConfig>>,
}

impl MockDriver {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: driver that always answers with the same text.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![MockTurn::Text(text.into())])
    }

    /// Configurations observed by each run, in order.
    pub fn runs(&self) -> Vec<DriveConfig> {
        self.runs.lock().unwrap().clone()
    }

    /// Tool lists observed by each run, in order.
    pub fn seen_tools(&self) -> Vec<Vec<String>> {
        self.runs().into_iter().map(|c| c.tools).collect()
    }
}

#[async_trait]
impl LoopDriver for MockDriver {
    async fn run(
        &self,
        ledger: Arc<Mutex<Ledger>>,
        config: DriveConfig,
        cancel: CancellationToken,
    ) -> Result<(), DriveError> {
        self.runs.lock().unwrap().push(config);
        let turn = {
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                MockTurn::Text("(no more scripted turns)".into())
            } else {
                turns.remove(0)
            }
        };
        if cancel.is_cancelled() {
            return Err(DriveError::Cancelled);
        }
        match turn {
            MockTurn::Text(text) => {
                let mut ledger = ledger.lock().unwrap();
                ledger.add_assistant_message();
                ledger.update_assistant_content(&text);
                Ok(())
            }
            MockTurn::Chunks(accumulated) => {
                ledger.lock().unwrap().add_assistant_message();
                for acc in &accumulated {
                    ledger.lock().unwrap().update_assistant_content(acc);
                }
                Ok(())
            }
            MockTurn::Silence => Ok(()),
            MockTurn::Fail(message) => Err(DriveError::Failed(message)),
            MockTurn::BlockUntilCancelled => {
                cancel.cancelled().await;
                Err(DriveError::Cancelled)
            }
        }
    }
}

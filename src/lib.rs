pub mod cancel;
pub mod commands;
pub mod drive;
pub mod hooks;
pub mod ledger;
pub mod lsp;
pub mod paths;
pub mod process;
pub mod revert;
pub mod session;
pub mod subagent;
pub mod tasks;
pub mod types;

pub use cancel::AbortScope;
pub use drive::{DriveConfig, DriveError, LoopDriver, MockDriver, MockTurn, ToolRegistry};
pub use hooks::{HookConfig, HookContext, HookDecision, HookDispatcher, HookEvent};
pub use ledger::{Ledger, LedgerEvent, ToolBlockUpdate};
pub use lsp::{LspConfigSet, LspManager, LspOutcome, LspRequest};
pub use paths::WaveDirs;
pub use revert::ReversionLog;
pub use session::{Restore, SessionStore};
pub use subagent::{SubagentConfig, SubagentEvent, SubagentManager, SubagentOutcome};
pub use tasks::{BackgroundTasks, TaskSnapshot};
pub use types::*;

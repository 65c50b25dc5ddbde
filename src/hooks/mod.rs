//! Hook dispatcher — runs user-configured commands at lifecycle events and
//! translates their exit codes into control-flow decisions.
//!
//! Exit code 2 is the blocking sentinel: the first result carrying it wins
//! and the remaining results are ignored. Everything else is advisory and
//! handled in a second pass. Blocking results are control decisions, not
//! errors.

pub mod config;

pub use config::{
    is_command_safe, matcher_applies, HookCommand, HookConfig, HookEntry, HookError, HookEvent,
};

use crate::ledger::{Ledger, ToolBlockUpdate};
use crate::process::{self, Signal};
use crate::types::{MessageSource, ToolStage};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The blocking sentinel exit code.
const BLOCKING_EXIT_CODE: i32 = 2;

/// Context handed to every hook command for one dispatch.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub event: HookEvent,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub prompt: Option<String>,
    pub workdir: PathBuf,
}

impl HookContext {
    pub fn for_event(event: HookEvent, workdir: impl Into<PathBuf>) -> Self {
        Self {
            event,
            tool_name: None,
            tool_call_id: None,
            prompt: None,
            workdir: workdir.into(),
        }
    }

    pub fn for_tool(
        event: HookEvent,
        workdir: impl Into<PathBuf>,
        tool_name: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            event,
            tool_name: Some(tool_name.into()),
            tool_call_id: Some(tool_call_id.into()),
            prompt: None,
            workdir: workdir.into(),
        }
    }

    /// Context for a `UserPromptSubmit` dispatch, carrying the submitted
    /// prompt so hooks can inspect it through `WAVE_USER_PROMPT`.
    pub fn for_prompt(workdir: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            event: HookEvent::UserPromptSubmit,
            tool_name: None,
            tool_call_id: None,
            prompt: Some(prompt.into()),
            workdir: workdir.into(),
        }
    }
}

/// One executed command's observable result.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

/// The dispatcher's verdict, returned to the agent loop.
#[derive(Debug, Clone, Default)]
pub struct HookDecision {
    pub should_block: bool,
    pub error_message: Option<String>,
}

/// Executes a single hook command. The shell implementation is the default;
/// tests substitute scripted outcomes.
#[async_trait]
pub trait HookExecutor: Send + Sync {
    async fn run(&self, command: &str, context: &HookContext) -> std::io::Result<HookOutcome>;
}

/// Runs hook commands under `bash -c` in the session workdir with the
/// context exposed through `WAVE_*` environment variables.
pub struct ShellHookExecutor {
    pub timeout: Duration,
}

impl Default for ShellHookExecutor {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl HookExecutor for ShellHookExecutor {
    async fn run(&self, command: &str, context: &HookContext) -> std::io::Result<HookOutcome> {
        let mut env = vec![(
            "WAVE_HOOK_EVENT".to_string(),
            context.event.name().to_string(),
        )];
        if let Some(tool) = &context.tool_name {
            env.push(("WAVE_TOOL_NAME".to_string(), tool.clone()));
        }
        if let Some(id) = &context.tool_call_id {
            env.push(("WAVE_TOOL_CALL_ID".to_string(), id.clone()));
        }
        if let Some(prompt) = &context.prompt {
            env.push(("WAVE_USER_PROMPT".to_string(), prompt.clone()));
        }

        let start = Instant::now();
        let child = process::spawn_shell(command, Some(&context.workdir), &env)?;
        let pid = child.id();

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(HookOutcome {
                    success: output.status.success(),
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: false,
                })
            }
            Err(_) => {
                if let Some(pid) = pid {
                    let _ = process::kill_group(pid, Signal::Kill);
                }
                Ok(HookOutcome {
                    success: false,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("hook timed out after {:?}", self.timeout),
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: true,
                })
            }
        }
    }
}

pub struct HookDispatcher {
    config: HookConfig,
    executor: Arc<dyn HookExecutor>,
}

impl HookDispatcher {
    pub fn new(config: HookConfig, executor: Arc<dyn HookExecutor>) -> Self {
        Self { config, executor }
    }

    pub fn config(&self) -> &HookConfig {
        &self.config
    }

    /// Run every applicable command for the event in declaration order,
    /// then interpret the collected results against the ledger.
    pub async fn dispatch(&self, context: &HookContext, ledger: &mut Ledger) -> HookDecision {
        let results = self.run_commands(context).await;
        if results.is_empty() {
            return HookDecision::default();
        }
        interpret(context, &results, ledger)
    }

    async fn run_commands(&self, context: &HookContext) -> Vec<HookOutcome> {
        let mut results = Vec::new();
        for entry in self.config.entries(context.event) {
            if context.event.is_tool_event() {
                let tool = context.tool_name.as_deref().unwrap_or("");
                if !matcher_applies(entry.matcher.as_deref(), tool) {
                    continue;
                }
            }
            for hook in &entry.hooks {
                debug!(event = context.event.name(), command = %hook.command, "running hook");
                // Sequential by contract; a failing command does not
                // short-circuit the rest.
                let outcome = match self.executor.run(&hook.command, context).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!("hook executor failed for {:?}: {e}", hook.command);
                        HookOutcome {
                            success: false,
                            stderr: e.to_string(),
                            ..Default::default()
                        }
                    }
                };
                results.push(outcome);
            }
        }
        results
    }
}

fn interpret(context: &HookContext, results: &[HookOutcome], ledger: &mut Ledger) -> HookDecision {
    // Blocking pass: the first exit-code-2 result wins outright.
    if let Some(blocking) = results
        .iter()
        .find(|r| r.exit_code == Some(BLOCKING_EXIT_CODE))
    {
        let stderr = blocking.stderr.clone();
        return match context.event {
            HookEvent::UserPromptSubmit => {
                ledger.add_error_block(&stderr);
                ledger.remove_last_user_message();
                HookDecision {
                    should_block: true,
                    error_message: Some(stderr),
                }
            }
            HookEvent::PreToolUse => {
                let mut update =
                    ToolBlockUpdate::new(context.tool_call_id.clone().unwrap_or_default());
                update.success = Some(false);
                update.error = Some("Hook blocked tool execution".to_string());
                update.result = Some(stderr.clone());
                update.stage = Some(ToolStage::End);
                ledger.update_tool_block(update);
                HookDecision {
                    should_block: true,
                    error_message: Some(stderr),
                }
            }
            HookEvent::PostToolUse => {
                ledger.add_user_message(&stderr, None, MessageSource::Hook);
                HookDecision {
                    should_block: false,
                    error_message: Some(stderr),
                }
            }
            // Blocking a Stop event prevents termination.
            HookEvent::Stop | HookEvent::SubagentStop => {
                ledger.add_user_message(&stderr, None, MessageSource::Hook);
                HookDecision {
                    should_block: true,
                    error_message: Some(stderr),
                }
            }
            HookEvent::Notification => {
                ledger.add_error_block(&stderr);
                HookDecision {
                    should_block: false,
                    error_message: Some(stderr),
                }
            }
        };
    }

    // Non-blocking pass over every result that produced an exit code.
    for result in results {
        let Some(code) = result.exit_code else {
            continue;
        };
        if code == 0 {
            if context.event == HookEvent::UserPromptSubmit && !result.stdout.is_empty() {
                ledger.add_user_message(&result.stdout, None, MessageSource::Hook);
            }
        } else {
            let message = if result.stderr.is_empty() {
                "Hook execution failed"
            } else {
                &result.stderr
            };
            ledger.add_error_block(message);
        }
    }

    HookDecision::default()
}

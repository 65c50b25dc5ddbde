//! Custom (slash) command execution — streams a shell child's output
//! through the ledger's command-output lifecycle.
//!
//! Plugin-defined commands get `WAVE_PLUGIN_ROOT` set in the child's
//! environment only; the parent process environment is never mutated.

use crate::ledger::Ledger;
use crate::process;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};

pub const PLUGIN_ROOT_ENV: &str = "WAVE_PLUGIN_ROOT";

/// Run `command` under a shell in `workdir`, appending output to the
/// ledger's open command block as it arrives. Returns the exit code.
pub async fn run_custom_command(
    ledger: &Arc<Mutex<Ledger>>,
    command: &str,
    workdir: &Path,
    plugin_root: Option<&Path>,
) -> std::io::Result<i32> {
    ledger.lock().unwrap().add_command_output_message(command);

    let mut env = Vec::new();
    if let Some(root) = plugin_root {
        env.push((PLUGIN_ROOT_ENV.to_string(), root.display().to_string()));
    }

    let mut child = match process::spawn_shell(command, Some(workdir), &env) {
        Ok(child) => child,
        Err(e) => {
            let mut ledger = ledger.lock().unwrap();
            ledger.update_command_output_message(command, format!("spawn error: {e}\n"));
            ledger.complete_command_message(command, 1);
            return Err(e);
        }
    };

    let mut out_lines = child.stdout.take().map(|s| BufReader::new(s).lines());
    let mut err_lines = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut accumulated = String::new();

    loop {
        let line = tokio::select! {
            line = next(&mut out_lines), if out_lines.is_some() => {
                if line.is_none() { out_lines = None; continue; }
                line
            }
            line = next(&mut err_lines), if err_lines.is_some() => {
                if line.is_none() { err_lines = None; continue; }
                line
            }
            else => break,
        };
        if let Some(line) = line {
            accumulated.push_str(&process::strip_ansi(&line));
            accumulated.push('\n');
            ledger
                .lock()
                .unwrap()
                .update_command_output_message(command, accumulated.clone());
        }
    }

    let status = child.wait().await?;
    let exit_code = status.code().unwrap_or(-1);
    ledger
        .lock()
        .unwrap()
        .complete_command_message(command, exit_code);
    Ok(exit_code)
}

async fn next(
    lines: &mut Option<tokio::io::Lines<BufReader<impl tokio::io::AsyncRead + Unpin>>>,
) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

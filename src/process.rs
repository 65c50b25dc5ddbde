//! Child-process plumbing shared by the task registry, hooks, and custom
//! commands: shell spawning in a dedicated process group, group-wide
//! signalling, and ANSI stripping for captured output.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::{Child, Command};

/// Signals used for the two-phase stop: TERM first, KILL after the grace
/// period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
impl Signal {
    fn raw(self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Spawn `bash -c <command>` with piped stdout/stderr and the environment
/// inherited from the parent, plus an optional overlay that is scoped to the
/// child only.
///
/// On unix the child gets its own process group so that [`kill_group`]
/// reaches every descendant spawned under the same shell.
pub fn spawn_shell(
    command: &str,
    workdir: Option<&Path>,
    env_overlay: &[(String, String)],
) -> io::Result<Child> {
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(command);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    if let Some(dir) = workdir {
        cmd.current_dir(dir);
    }
    for (key, value) in env_overlay {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);
    cmd.spawn()
}

/// Signal the whole process group of `pid` (negative pid). Falls back to the
/// direct pid when the group is already gone.
#[cfg(unix)]
pub fn kill_group(pid: u32, signal: Signal) -> io::Result<()> {
    let rc = unsafe { libc::kill(-(pid as i32), signal.raw()) };
    if rc == 0 {
        return Ok(());
    }
    kill_pid(pid, signal)
}

/// Signal a single process by pid.
#[cfg(unix)]
pub fn kill_pid(pid: u32, signal: Signal) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as i32, signal.raw()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process-group signalling is unix-only",
    ))
}

#[cfg(not(unix))]
pub fn kill_pid(_pid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signalling is unix-only",
    ))
}

/// Remove ANSI escape sequences (CSI and OSC) from captured output.
pub fn strip_ansi(input: &str) -> String {
    static ANSI: OnceLock<regex::Regex> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        regex::Regex::new(r"\x1b(?:\[[0-9;?]*[@-~]|\][^\x07\x1b]*(?:\x07|\x1b\\))").unwrap()
    });
    re.replace_all(input, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_codes() {
        let colored = "\x1b[31mred\x1b[0m plain";
        assert_eq!(strip_ansi(colored), "red plain");
    }

    #[test]
    fn strips_cursor_and_osc_sequences() {
        let s = "\x1b[2K\x1b]0;title\x07line";
        assert_eq!(strip_ansi(s), "line");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(strip_ansi("no escapes here"), "no escapes here");
    }

    #[tokio::test]
    async fn spawn_shell_captures_output() {
        let mut child = spawn_shell("echo hi", None, &[]).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn env_overlay_reaches_child_only() {
        let overlay = vec![("WAVE_PLUGIN_ROOT".to_string(), "/plug".to_string())];
        let mut child = spawn_shell("test \"$WAVE_PLUGIN_ROOT\" = /plug", None, &overlay).unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
        assert!(std::env::var("WAVE_PLUGIN_ROOT").is_err());
    }
}

//! Background task registry — shell processes and detached subagents with
//! uniform output capture and forced-stop semantics.
//!
//! Shell children run in their own process group so a stop reaches every
//! descendant: TERM to the negated pid first, KILL after a 1 s grace period.
//! The grace timer is a single scheduled action cancelled by observed exit,
//! so it can never fire after the exit handler ran.

use crate::process::{self, Signal};
use crate::types::{now_ms, TaskStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Grace period between TERM and KILL.
const KILL_GRACE: Duration = Duration::from_millis(1000);

/// Cooperative stop callback registered by detached subagents.
pub type StopFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Shell,
    Subagent,
}

enum TaskKind {
    Shell {
        command: String,
        pid: Option<u32>,
        /// Direct-kill fallback consumed by the waiter when group
        /// signalling is unavailable.
        force_kill: Option<mpsc::UnboundedSender<()>>,
    },
    Subagent {
        on_stop: StopFn,
    },
}

struct TaskEntry {
    kind: TaskKind,
    status: TaskStatus,
    start_time: u64,
    end_time: Option<u64>,
    runtime_ms: Option<u64>,
    stdout: String,
    stderr: String,
    description: Option<String>,
    exit_code: Option<i32>,
    /// Set by `stop` before signalling so the exit handler records `Killed`
    /// rather than `Completed`/`Failed`.
    kill_requested: bool,
    exited: Option<watch::Receiver<bool>>,
}

impl TaskEntry {
    fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        let end = now_ms();
        self.end_time = Some(end);
        self.runtime_ms = Some(end.saturating_sub(self.start_time));
    }
}

/// Read-only view of a task record.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub runtime_ms: Option<u64>,
    pub stdout: String,
    pub stderr: String,
    pub description: Option<String>,
    pub command: Option<String>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: TaskStatus,
}

struct Inner {
    tasks: Mutex<HashMap<String, TaskEntry>>,
    next_id: AtomicU64,
    workdir: PathBuf,
}

/// The shared registry. Cheap to clone; all clones observe the same tasks.
#[derive(Clone)]
pub struct BackgroundTasks {
    inner: Arc<Inner>,
}

impl BackgroundTasks {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                workdir: workdir.into(),
            }),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{n}")
    }

    // -- Shell tasks --

    /// Spawn a shell command in the session workdir with inherited
    /// environment. Returns the task id immediately; output accumulates as
    /// the process runs. With a timeout, the task is stopped once the
    /// timeout elapses while still running.
    pub fn start_shell(
        &self,
        command: impl Into<String>,
        timeout: Option<Duration>,
        description: Option<String>,
    ) -> String {
        let command = command.into();
        let id = self.next_id("bash");
        let (exited_tx, exited_rx) = watch::channel(false);

        let child = process::spawn_shell(&command, Some(&self.inner.workdir), &[]);
        let mut entry = TaskEntry {
            kind: TaskKind::Shell {
                command: command.clone(),
                pid: None,
                force_kill: None,
            },
            status: TaskStatus::Running,
            start_time: now_ms(),
            end_time: None,
            runtime_ms: None,
            stdout: String::new(),
            stderr: String::new(),
            description,
            exit_code: None,
            kill_requested: false,
            exited: Some(exited_rx.clone()),
        };

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                entry.stderr.push_str(&format!("spawn error: {e}\n"));
                entry.exit_code = Some(1);
                entry.finish(TaskStatus::Failed);
                entry.exited = None;
                self.inner.tasks.lock().unwrap().insert(id.clone(), entry);
                let _ = exited_tx.send(true);
                return id;
            }
        };

        let (force_tx, mut force_rx) = mpsc::unbounded_channel();
        if let TaskKind::Shell {
            pid, force_kill, ..
        } = &mut entry.kind
        {
            *pid = child.id();
            *force_kill = Some(force_tx);
        }
        self.inner.tasks.lock().unwrap().insert(id.clone(), entry);

        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(id.clone(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(id.clone(), stderr, true);
        }

        // Waiter: owns the child, observes exit, performs the single
        // terminal transition, and honors direct-kill fallback requests.
        let registry = self.clone();
        let waiter_id = id.clone();
        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    Some(()) = force_rx.recv() => {
                        let _ = child.start_kill();
                    }
                }
            };
            let mut tasks = registry.inner.tasks.lock().unwrap();
            if let Some(entry) = tasks.get_mut(&waiter_id) {
                if entry.status == TaskStatus::Running {
                    let exit_code = status.as_ref().ok().and_then(|s| s.code());
                    entry.exit_code = exit_code;
                    let terminal = if entry.kill_requested {
                        TaskStatus::Killed
                    } else if status.map(|s| s.success()).unwrap_or(false) {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                    entry.finish(terminal);
                    debug!(task = %waiter_id, status = %terminal, "shell task exited");
                }
            }
            drop(tasks);
            let _ = exited_tx.send(true);
        });

        if let Some(timeout) = timeout {
            let registry = self.clone();
            let timeout_id = id.clone();
            let mut exited = exited_rx;
            tokio::spawn(async move {
                let wait_exited = async {
                    let _ = exited.wait_for(|done| *done).await;
                };
                tokio::select! {
                    _ = wait_exited => {}
                    _ = tokio::time::sleep(timeout) => {
                        debug!(task = %timeout_id, "timeout elapsed, stopping");
                        registry.stop(&timeout_id).await;
                    }
                }
            });
        }

        id
    }

    fn spawn_reader(&self, id: String, stream: impl AsyncRead + Unpin + Send + 'static, err: bool) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let clean = process::strip_ansi(&line);
                let mut tasks = registry.inner.tasks.lock().unwrap();
                if let Some(entry) = tasks.get_mut(&id) {
                    let buf = if err { &mut entry.stderr } else { &mut entry.stdout };
                    buf.push_str(&clean);
                    buf.push('\n');
                }
            }
        });
    }

    // -- Subagent tasks --

    /// Register a detached subagent run. `on_stop` is invoked for
    /// cooperative cancellation when the task is stopped.
    pub fn start_subagent(&self, description: impl Into<String>, on_stop: StopFn) -> String {
        let id = self.next_id("task");
        let entry = TaskEntry {
            kind: TaskKind::Subagent { on_stop },
            status: TaskStatus::Running,
            start_time: now_ms(),
            end_time: None,
            runtime_ms: None,
            stdout: String::new(),
            stderr: String::new(),
            description: Some(description.into()),
            exit_code: None,
            kill_requested: false,
            exited: None,
        };
        self.inner.tasks.lock().unwrap().insert(id.clone(), entry);
        id
    }

    /// Record the outcome of a detached subagent run. Output is appended
    /// unconditionally; the status only transitions when the task is still
    /// running (a stop that already marked it `Killed` wins).
    pub fn finish_subagent(&self, id: &str, success: bool, stdout: &str, stderr: &str) {
        let mut tasks = self.inner.tasks.lock().unwrap();
        if let Some(entry) = tasks.get_mut(id) {
            entry.stdout.push_str(stdout);
            entry.stderr.push_str(stderr);
            if entry.status == TaskStatus::Running {
                entry.finish(if success {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                });
            }
        }
    }

    // -- Inspection --

    pub fn get(&self, id: &str) -> Option<TaskSnapshot> {
        let tasks = self.inner.tasks.lock().unwrap();
        tasks.get(id).map(|entry| snapshot(id, entry))
    }

    pub fn list(&self) -> Vec<TaskSnapshot> {
        let tasks = self.inner.tasks.lock().unwrap();
        let mut all: Vec<TaskSnapshot> = tasks.iter().map(|(id, e)| snapshot(id, e)).collect();
        all.sort_by_key(|t| t.start_time);
        all
    }

    /// Current output, optionally line-filtered by a regex. An invalid
    /// pattern skips filtering and returns everything.
    pub fn output(&self, id: &str, filter: Option<&str>) -> Option<TaskOutput> {
        let tasks = self.inner.tasks.lock().unwrap();
        let entry = tasks.get(id)?;
        let (stdout, stderr) = match filter {
            Some(pattern) => match regex::Regex::new(pattern) {
                Ok(re) => (filter_lines(&entry.stdout, &re), filter_lines(&entry.stderr, &re)),
                Err(e) => {
                    warn!("invalid output filter {pattern:?}: {e}");
                    (entry.stdout.clone(), entry.stderr.clone())
                }
            },
            None => (entry.stdout.clone(), entry.stderr.clone()),
        };
        Some(TaskOutput {
            stdout,
            stderr,
            status: entry.status,
        })
    }

    // -- Stopping --

    /// Force-stop a running task. Shell tasks get TERM to the process group,
    /// then KILL after the grace period; subagent tasks get their `on_stop`
    /// callback. Returns false when the task is unknown or already terminal.
    pub async fn stop(&self, id: &str) -> bool {
        enum Plan {
            Shell {
                pid: Option<u32>,
                force_kill: Option<mpsc::UnboundedSender<()>>,
                exited: Option<watch::Receiver<bool>>,
            },
            Subagent {
                on_stop: StopFn,
            },
        }

        let plan = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            let Some(entry) = tasks.get_mut(id) else {
                return false;
            };
            if entry.status != TaskStatus::Running || entry.kill_requested {
                return false;
            }
            let plan = match &entry.kind {
                TaskKind::Shell {
                    pid, force_kill, ..
                } => Plan::Shell {
                    pid: *pid,
                    force_kill: force_kill.clone(),
                    exited: entry.exited.clone(),
                },
                TaskKind::Subagent { on_stop } => Plan::Subagent {
                    on_stop: Arc::clone(on_stop),
                },
            };
            match &plan {
                // The waiter observes the flag and records `Killed` as the
                // single terminal transition.
                Plan::Shell { .. } => entry.kill_requested = true,
                Plan::Subagent { .. } => entry.finish(TaskStatus::Killed),
            }
            plan
        };

        match plan {
            Plan::Subagent { on_stop } => {
                on_stop();
                true
            }
            Plan::Shell {
                pid,
                force_kill,
                exited,
            } => {
                self.stop_shell(id, pid, force_kill, exited).await;
                true
            }
        }
    }

    async fn stop_shell(
        &self,
        id: &str,
        pid: Option<u32>,
        force_kill: Option<mpsc::UnboundedSender<()>>,
        exited: Option<watch::Receiver<bool>>,
    ) {
        let signal = |sig: Signal| -> bool {
            match pid {
                Some(pid) => process::kill_group(pid, sig).is_ok(),
                None => false,
            }
        };

        if !signal(Signal::Term) {
            // Group signalling unavailable: fall back to killing the direct
            // process via the waiter.
            if let Some(force) = &force_kill {
                let _ = force.send(());
            }
        }

        let Some(mut exited) = exited else { return };
        let killed_in_time = tokio::time::timeout(KILL_GRACE, exited.wait_for(|done| *done))
            .await
            .is_ok();
        if !killed_in_time {
            debug!(task = %id, "grace period elapsed, sending KILL");
            if !signal(Signal::Kill) {
                if let Some(force) = &force_kill {
                    let _ = force.send(());
                }
            }
            let _ = exited.wait_for(|done| *done).await;
        }
    }

    /// Stop every running task and clear the registry.
    pub async fn cleanup(&self) {
        let running: Vec<String> = {
            let tasks = self.inner.tasks.lock().unwrap();
            tasks
                .iter()
                .filter(|(_, e)| e.status == TaskStatus::Running)
                .map(|(id, _)| id.clone())
                .collect()
        };
        futures::future::join_all(running.iter().map(|id| self.stop(id))).await;
        self.inner.tasks.lock().unwrap().clear();
    }
}

fn snapshot(id: &str, entry: &TaskEntry) -> TaskSnapshot {
    let (task_type, command) = match &entry.kind {
        TaskKind::Shell { command, .. } => (TaskType::Shell, Some(command.clone())),
        TaskKind::Subagent { .. } => (TaskType::Subagent, None),
    };
    TaskSnapshot {
        id: id.to_string(),
        task_type,
        status: entry.status,
        start_time: entry.start_time,
        end_time: entry.end_time,
        runtime_ms: entry.runtime_ms,
        stdout: entry.stdout.clone(),
        stderr: entry.stderr.clone(),
        description: entry.description.clone(),
        command,
        exit_code: entry.exit_code,
    }
}

fn filter_lines(text: &str, re: &regex::Regex) -> String {
    text.lines()
        .filter(|line| re.is_match(line))
        .map(|line| format!("{line}\n"))
        .collect()
}

//! Background task registry: output capture, timeouts, the TERM→KILL
//! two-phase stop, and terminal-state invariants.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wave_core::tasks::{BackgroundTasks, TaskType};
use wave_core::types::TaskStatus;

/// Poll until the task leaves `Running` or the deadline passes.
async fn wait_terminal(tasks: &BackgroundTasks, id: &str, deadline: Duration) -> TaskStatus {
    let start = tokio::time::Instant::now();
    loop {
        let status = tasks.get(id).expect("task exists").status;
        if status.is_terminal() {
            return status;
        }
        assert!(
            start.elapsed() < deadline,
            "task {id} still running after {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn registry() -> BackgroundTasks {
    BackgroundTasks::new(std::env::temp_dir())
}

// ---------------------------------------------------------------------------
// Shell basics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shell_output_is_captured_and_zero_exit_completes() {
    let tasks = registry();
    let id = tasks.start_shell("echo hello; echo oops >&2", None, None);
    assert!(id.starts_with("bash_"));

    let status = wait_terminal(&tasks, &id, Duration::from_secs(5)).await;
    assert_eq!(status, TaskStatus::Completed);

    // Readers may still be draining right at exit; give them a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let output = tasks.output(&id, None).unwrap();
    assert_eq!(output.stdout, "hello\n");
    assert_eq!(output.stderr, "oops\n");

    let snapshot = tasks.get(&id).unwrap();
    assert_eq!(snapshot.exit_code, Some(0));
    assert_eq!(snapshot.task_type, TaskType::Shell);
    assert!(snapshot.runtime_ms.is_some());
}

#[tokio::test]
async fn non_zero_exit_is_failed() {
    let tasks = registry();
    let id = tasks.start_shell("exit 3", None, None);
    let status = wait_terminal(&tasks, &id, Duration::from_secs(5)).await;
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(tasks.get(&id).unwrap().exit_code, Some(3));
}

#[tokio::test]
async fn spawn_error_is_failed_with_stderr() {
    let tasks = BackgroundTasks::new("/definitely/not/a/real/workdir");
    let id = tasks.start_shell("echo unreachable", None, None);
    let snapshot = tasks.get(&id).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.exit_code, Some(1));
    assert!(snapshot.stderr.contains("spawn error"));
}

#[tokio::test]
async fn ansi_escapes_are_stripped_from_output() {
    let tasks = registry();
    let id = tasks.start_shell(r"printf '\033[31mred\033[0m\n'", None, None);
    wait_terminal(&tasks, &id, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(tasks.output(&id, None).unwrap().stdout, "red\n");
}

#[tokio::test]
async fn output_filter_keeps_matching_lines_only() {
    let tasks = registry();
    let id = tasks.start_shell("printf 'alpha\\nbeta\\nalpine\\n'", None, None);
    wait_terminal(&tasks, &id, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let filtered = tasks.output(&id, Some("^al")).unwrap();
    assert_eq!(filtered.stdout, "alpha\nalpine\n");

    // Invalid regex: skip the filter, return everything.
    let unfiltered = tasks.output(&id, Some("[broken")).unwrap();
    assert_eq!(unfiltered.stdout, "alpha\nbeta\nalpine\n");
}

// ---------------------------------------------------------------------------
// Stop semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_stops_the_task_with_killed_status() {
    let tasks = registry();
    let id = tasks.start_shell("sleep 10", Some(Duration::from_millis(500)), None);

    let status = wait_terminal(&tasks, &id, Duration::from_secs(5)).await;
    assert_eq!(status, TaskStatus::Killed);
    assert!(tasks.get(&id).unwrap().runtime_ms.unwrap() >= 500);
}

#[tokio::test]
async fn term_immune_child_is_force_killed_after_grace() {
    let tasks = registry();
    // bash ignores the TERM sent to its group; only KILL ends it.
    let id = tasks.start_shell("trap '' TERM; while true; do sleep 0.1; done", None, None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = tokio::time::Instant::now();
    assert!(tasks.stop(&id).await);
    assert!(
        start.elapsed() >= Duration::from_millis(900),
        "KILL must wait out the grace period"
    );
    assert_eq!(tasks.get(&id).unwrap().status, TaskStatus::Killed);
}

#[tokio::test]
async fn stop_is_idempotent_and_false_on_terminal_tasks() {
    let tasks = registry();
    let id = tasks.start_shell("true", None, None);
    wait_terminal(&tasks, &id, Duration::from_secs(5)).await;

    let before = tasks.get(&id).unwrap();
    assert!(!tasks.stop(&id).await);
    let after = tasks.get(&id).unwrap();
    assert_eq!(before.status, after.status);
    assert_eq!(before.end_time, after.end_time);

    assert!(!tasks.stop("bash_999").await);
}

#[tokio::test]
async fn timeout_is_cancelled_by_normal_exit() {
    let tasks = registry();
    let id = tasks.start_shell("true", Some(Duration::from_millis(200)), None);
    let status = wait_terminal(&tasks, &id, Duration::from_secs(5)).await;
    assert_eq!(status, TaskStatus::Completed);
    // Past the timeout, the completed status must not flip to killed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(tasks.get(&id).unwrap().status, TaskStatus::Completed);
}

// ---------------------------------------------------------------------------
// Subagent tasks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subagent_stop_invokes_the_callback_once() {
    let tasks = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let id = tasks.start_subagent(
        "subagent researcher",
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert!(id.starts_with("task_"));

    assert!(tasks.stop(&id).await);
    assert!(!tasks.stop(&id).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(tasks.get(&id).unwrap().status, TaskStatus::Killed);
}

#[tokio::test]
async fn finish_does_not_overwrite_a_killed_task() {
    let tasks = registry();
    let id = tasks.start_subagent("subagent worker", Arc::new(|| {}));
    tasks.stop(&id).await;
    tasks.finish_subagent(&id, true, "late result", "");

    let snapshot = tasks.get(&id).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Killed);
    // Output still lands even after the terminal transition.
    assert_eq!(snapshot.stdout, "late result");
}

#[tokio::test]
async fn cleanup_stops_everything_and_clears_the_registry() {
    let tasks = registry();
    let long = tasks.start_shell("sleep 10", None, None);
    let quick = tasks.start_shell("true", None, None);
    wait_terminal(&tasks, &quick, Duration::from_secs(5)).await;

    tasks.cleanup().await;
    assert!(tasks.get(&long).is_none());
    assert!(tasks.get(&quick).is_none());
    assert!(tasks.list().is_empty());
}

//! Integration tests for external tool lifecycle
//!
//! These tests verify that:
//! 1. A timed-out tool is killed together with everything it spawned
//! 2. A cancelled run leaves a tool running instead of killing it
//! 3. Apply-style tools write to their log file and survive as their own session

use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use imageprep::cancel::CancelToken;
use imageprep::command_runner::{
    CommandSpec, NoHooks, ProcessRequest, ProcessRunner, RunHooks, SystemProcessRunner,
};
use imageprep::process_guard::is_process_alive;

/// Helper: Wait for a process to die with timeout
fn wait_for_process_death(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

/// Helper: Wait for a file to hold a PID
fn wait_for_pid_file(path: &std::path::Path, timeout: Duration) -> Option<u32> {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if let Some(pid) = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            return Some(pid);
        }
        thread::sleep(Duration::from_millis(20));
    }
    None
}

fn sh(script: &str, timeout: Duration) -> ProcessRequest {
    CommandSpec::new("sh", &["-c", script]).to_request(timeout)
}

// =============================================================================
// Timeout kills the whole tree
// =============================================================================

#[test]
fn timeout_kills_grandchildren() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pid_file = dir.path().join("grandchild.pid");
    let script = format!(
        "sleep 1000 </dev/null >/dev/null 2>&1 & echo $! > '{}'; wait",
        pid_file.display()
    );

    let output = SystemProcessRunner::new()
        .run(
            &sh(&script, Duration::from_millis(500)),
            &CancelToken::new(),
            &mut NoHooks,
        )
        .expect("run");

    assert!(output.timed_out);
    assert_eq!(output.exit_code, None);
    let grandchild = wait_for_pid_file(&pid_file, Duration::from_secs(2)).expect("grandchild pid");
    assert!(
        wait_for_process_death(grandchild, Duration::from_secs(5)),
        "grandchild {} should die with its process group",
        grandchild
    );
}

// =============================================================================
// Cancellation releases, it does not kill
// =============================================================================

struct SpawnRecorder(Option<u32>);

impl RunHooks for SpawnRecorder {
    fn on_spawn(&mut self, pid: u32) {
        self.0 = Some(pid);
    }
}

#[test]
fn cancelled_tool_keeps_running() {
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        remote.cancel();
    });

    let mut hooks = SpawnRecorder(None);
    let request = CommandSpec::new("sleep", &["3"]).to_request(Duration::from_secs(60));
    let output = SystemProcessRunner::new()
        .run(&request, &cancel, &mut hooks)
        .expect("run");
    canceller.join().expect("canceller");

    assert!(output.cancelled);
    let pid = hooks.0.expect("spawned");
    assert!(is_process_alive(pid), "released tool keeps running");
    assert!(wait_for_process_death(pid, Duration::from_secs(10)));
}

// =============================================================================
// Log-file tools
// =============================================================================

#[test]
fn surviving_tool_writes_log_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log = dir.path().join("apply.log");
    let request = sh(
        "echo 'Installed: BIOS 1.2.3'; echo 'warning on stderr' >&2",
        Duration::from_secs(10),
    )
    .with_log_file(&log)
    .surviving_parent();

    let output = SystemProcessRunner::new()
        .run(&request, &CancelToken::new(), &mut NoHooks)
        .expect("run");

    assert_eq!(output.exit_code, Some(0));
    let content = fs::read_to_string(&log).expect("log");
    assert!(content.contains("Installed: BIOS 1.2.3"));
    assert!(content.contains("warning on stderr"));
    assert!(output.stdout.contains("Installed: BIOS 1.2.3"));
}

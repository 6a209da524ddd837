//! Vendor driver and firmware update
//!
//! The longest task of a run, in three phases recorded in the persisted
//! [`DriverUpdateState`]:
//!
//! ```text
//! Scanning ──(no-op code)──────────────────────────────► Done
//!    │
//!    └─(updates listed)─► Applying ─► (apply exits) ────► Done
//!                            │
//!                   interrupted run, next process:
//!                            │
//!                            ├─ apply PID still alive ─► follow its log until it exits
//!                            └─ apply PID gone ─────────┐
//!                                                       ▼
//!                                                   Verifying (confirming scan) ─► Done
//! ```
//!
//! The apply process is started detached with its output in a log file, so
//! it keeps running if we are killed and a later run can reattach to it.
//! Installed units are counted from `installed_line_prefix` lines in that log.

use super::{TaskContext, TaskHandler};
use crate::command_runner::RunHooks;
use crate::config::DriverUpdateConfig;
use crate::execution_state::{DriverPhase, DriverUpdateState, RunJournal};
use crate::outcome::{SubTaskOutcome, TaskOutcome};
use crate::process_guard::is_process_alive;
use crate::progress::{ProgressEvent, ProgressSpan};
use crate::retry::ProcessOperation;
use crate::types::{ExitClass, TaskId, TaskStatus};
use anyhow::Context;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Poll interval while following an apply process we did not spawn
const FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

// Task-local progress bands
const SCAN_DONE: u8 = 10;
const APPLY_DONE: u8 = 95;

pub struct DriverUpdateTask;

impl TaskHandler for DriverUpdateTask {
    fn id(&self) -> TaskId {
        TaskId::DriverUpdate
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<TaskOutcome> {
        if ctx.recovering {
            let previous = ctx.journal.state().driver_update.clone();
            if matches!(previous.phase, DriverPhase::Applying | DriverPhase::Verifying) {
                return resume(ctx, previous);
            }
        }
        fresh(ctx)
    }
}

/// Scan, then apply whatever the scan listed
fn fresh(ctx: &mut TaskContext<'_>) -> anyhow::Result<TaskOutcome> {
    let config = ctx.config;
    let settings = &config.driver_update;
    let outcome = TaskOutcome::begin(TaskId::DriverUpdate);

    set_phase(ctx.journal, DriverPhase::Scanning);
    ctx.report("Scanning for driver and firmware updates", 0);
    let scan = ctx.run_with_retry(
        TaskId::DriverUpdate,
        "Driver scan",
        settings.scan.to_request(settings.scan_retry.timeout),
        &settings.scan_table(),
        &settings.scan_retry,
    );
    let mut attempts = scan.outcome.attempts;
    if scan.outcome.status != TaskStatus::Success {
        return Ok(scan.outcome);
    }

    let stdout = scan.output.as_ref().map(|o| o.stdout.as_str()).unwrap_or("");
    let units = parse_prefixed(stdout, &settings.update_line_prefix);
    if scan.class == Some(ExitClass::NoOpSuccess) || units.is_empty() {
        set_phase(ctx.journal, DriverPhase::Done);
        ctx.report("No updates available", 100);
        let message = if scan.class == Some(ExitClass::NoOpSuccess) {
            "System is up to date"
        } else {
            "Scan found no applicable updates"
        };
        return Ok(outcome
            .success(message)
            .with_exit_code(scan.outcome.exit_code)
            .with_attempts(attempts));
    }

    // Apply
    let log_path = config.apply_log_path();
    fs::create_dir_all(&config.cache_root)
        .with_context(|| format!("Failed to create {:?} for the apply log", config.cache_root))?;
    {
        let state = &mut ctx.journal.state_mut().driver_update;
        state.phase = DriverPhase::Applying;
        state.total_units = units.len() as u32;
        state.apply_log = Some(log_path.clone());
    }
    ctx.log(format!("{} updates pending: {}", units.len(), units.join(", ")));
    ctx.journal.save();
    ctx.report(format!("Applying {} updates", units.len()), SCAN_DONE);

    let request = settings
        .apply
        .to_request(settings.apply_retry.timeout)
        .with_log_file(&log_path)
        .surviving_parent();
    let runner = ctx.runner;
    let cancel = ctx.cancel;
    let engine = ctx.engine;
    let apply_table = settings.apply_table();
    let report = {
        let mut hooks = ApplyHooks {
            journal: &mut *ctx.journal,
            progress: &mut *ctx.progress,
            span: ctx.span,
            follower: LogFollower::new(&log_path, &settings.installed_line_prefix),
        };
        let report = {
            let mut operation = ProcessOperation::new("Driver apply", runner, request, &mut hooks);
            engine.execute_with_report(
                TaskId::DriverUpdate,
                &mut operation,
                &apply_table,
                &settings.apply_retry,
                cancel,
            )
        };
        // Lines written between the last tick and exit
        hooks.absorb();
        report
    };
    attempts += report.outcome.attempts;

    let applied = report.outcome.status == TaskStatus::Success;
    if applied {
        let state = &mut ctx.journal.state_mut().driver_update;
        state.phase = DriverPhase::Done;
        state.apply_pid = None;
    }
    ctx.journal.save();
    ctx.report("Driver update finished", 100);

    let state = ctx.journal.state().driver_update.clone();
    let sub_tasks = unit_outcomes(&units, &state, applied);
    let outcome = if !applied {
        outcome.error(report.outcome.message.clone())
    } else if report.class == Some(ExitClass::NoOpSuccess) {
        outcome.success("Apply reported nothing left to install")
    } else if state.completed_units < state.total_units {
        outcome.warning(format!(
            "Applied updates, but only {} of {} were confirmed in the apply log",
            state.completed_units, state.total_units
        ))
    } else {
        outcome.success(format!("Applied {} updates", state.total_units))
    };

    Ok(outcome
        .with_exit_code(report.outcome.exit_code)
        .with_restart(report.outcome.requires_restart)
        .with_attempts(attempts)
        .with_sub_tasks(sub_tasks))
}

/// Pick up an apply that an interrupted run started
fn resume(ctx: &mut TaskContext<'_>, previous: DriverUpdateState) -> anyhow::Result<TaskOutcome> {
    let config = ctx.config;
    let settings = &config.driver_update;
    let outcome = TaskOutcome::begin(TaskId::DriverUpdate);
    let log_path = previous
        .apply_log
        .clone()
        .unwrap_or_else(|| config.apply_log_path());
    let mut follower = LogFollower::new(&log_path, &settings.installed_line_prefix);

    let live_pid = previous
        .apply_pid
        .filter(|&pid| previous.phase == DriverPhase::Applying && is_apply_process(pid, settings));
    match live_pid {
        Some(pid) => {
            ctx.log(format!("Reattaching to driver apply process PID {}", pid));
            match follow(ctx, pid, &mut follower, settings.apply_retry.timeout) {
                FollowEnd::Exited => ctx.log(format!("Apply process PID {} has exited", pid)),
                FollowEnd::Cancelled => return Ok(outcome.error("cancelled")),
                FollowEnd::TimedOut => {
                    return Ok(outcome.error(format!(
                        "Apply process PID {} still running after {}s",
                        pid,
                        settings.apply_retry.timeout.as_secs()
                    )));
                }
            }
        }
        None => {
            ctx.log("Apply from the interrupted run is no longer running; verifying");
            absorb_log(ctx.journal, ctx.progress, ctx.span, &mut follower);
        }
    }

    {
        let state = &mut ctx.journal.state_mut().driver_update;
        state.phase = DriverPhase::Verifying;
        state.apply_pid = None;
    }
    ctx.journal.save();
    ctx.report("Verifying installed updates", APPLY_DONE);

    let scan = ctx.run_with_retry(
        TaskId::DriverUpdate,
        "Driver verification scan",
        settings.scan.to_request(settings.scan_retry.timeout),
        &settings.scan_table(),
        &settings.scan_retry,
    );
    if scan.outcome.status != TaskStatus::Success {
        return Ok(outcome
            .error(format!("Verification failed: {}", scan.outcome.message))
            .with_exit_code(scan.outcome.exit_code)
            .with_attempts(scan.outcome.attempts));
    }

    let stdout = scan.output.as_ref().map(|o| o.stdout.as_str()).unwrap_or("");
    let pending = if scan.class == Some(ExitClass::NoOpSuccess) {
        Vec::new()
    } else {
        parse_prefixed(stdout, &settings.update_line_prefix)
    };

    set_phase_keeping_units(ctx.journal, DriverPhase::Done);
    ctx.report("Driver update verified", 100);
    let state = ctx.journal.state().driver_update.clone();

    let outcome = if pending.is_empty() {
        outcome.success(format!(
            "Updates from the interrupted run are installed ({} confirmed in the apply log)",
            state.completed_units
        ))
    } else {
        outcome.warning(format!(
            "{} updates still pending after the interrupted apply: {}",
            pending.len(),
            pending.join(", ")
        ))
    };
    Ok(outcome
        .with_exit_code(scan.outcome.exit_code)
        .with_attempts(scan.outcome.attempts))
}

enum FollowEnd {
    Exited,
    Cancelled,
    TimedOut,
}

/// Wait for a process we did not spawn, absorbing its log as it grows
fn follow(
    ctx: &mut TaskContext<'_>,
    pid: u32,
    follower: &mut LogFollower,
    timeout: Duration,
) -> FollowEnd {
    let start = Instant::now();
    loop {
        absorb_log(ctx.journal, ctx.progress, ctx.span, follower);
        ctx.journal.heartbeat();

        if !is_process_alive(pid) {
            absorb_log(ctx.journal, ctx.progress, ctx.span, follower);
            return FollowEnd::Exited;
        }
        if start.elapsed() >= timeout {
            return FollowEnd::TimedOut;
        }
        if !ctx.cancel.sleep(FOLLOW_INTERVAL) {
            return FollowEnd::Cancelled;
        }
    }
}

/// Recorded PID is alive and still runs the configured apply program.
///
/// A PID recorded before a reboot may have been reused by something else.
fn is_apply_process(pid: u32, settings: &DriverUpdateConfig) -> bool {
    if !is_process_alive(pid) {
        return false;
    }
    let Some(program) = Path::new(&settings.apply.program).file_name() else {
        return false;
    };
    match fs::read(format!("/proc/{}/cmdline", pid)) {
        Ok(cmdline) => cmdline
            .split(|b| *b == 0)
            .filter_map(|arg| std::str::from_utf8(arg).ok())
            .any(|arg| Path::new(arg).file_name() == Some(program)),
        Err(e) => {
            debug!("Cannot read cmdline of PID {}: {}", pid, e);
            false
        }
    }
}

/// Enter `phase` with fresh counters
fn set_phase(journal: &mut RunJournal, phase: DriverPhase) {
    journal.state_mut().driver_update = DriverUpdateState {
        phase,
        ..DriverUpdateState::default()
    };
    journal.save();
}

fn set_phase_keeping_units(journal: &mut RunJournal, phase: DriverPhase) {
    journal.state_mut().driver_update.phase = phase;
    journal.save();
}

/// Task-local percentage during the apply phase
fn apply_percent(state: &DriverUpdateState) -> u8 {
    let span = u32::from(APPLY_DONE - SCAN_DONE);
    SCAN_DONE + (u32::from(state.percent()) * span / 100) as u8
}

/// Record newly installed units from the apply log
fn absorb_log(
    journal: &mut RunJournal,
    progress: &mut dyn FnMut(ProgressEvent),
    span: ProgressSpan,
    follower: &mut LogFollower,
) {
    for name in follower.poll() {
        let state = &mut journal.state_mut().driver_update;
        state.complete_unit(&name);
        let message = if state.total_units > 0 {
            format!(
                "Installed {} ({}/{})",
                name, state.completed_units, state.total_units
            )
        } else {
            format!("Installed {}", name)
        };
        let percentage = span.overall(apply_percent(state));
        journal.log(message.clone());
        progress(ProgressEvent::Progress {
            message,
            percentage,
        });
    }
}

/// Hooks for the apply process: record its PID, follow its log, heartbeat.
struct ApplyHooks<'a> {
    journal: &'a mut RunJournal,
    progress: &'a mut dyn FnMut(ProgressEvent),
    span: ProgressSpan,
    follower: LogFollower,
}

impl ApplyHooks<'_> {
    fn absorb(&mut self) {
        absorb_log(self.journal, self.progress, self.span, &mut self.follower);
    }
}

impl RunHooks for ApplyHooks<'_> {
    fn on_spawn(&mut self, pid: u32) {
        self.journal.state_mut().driver_update.apply_pid = Some(pid);
        self.journal
            .log(format!("Driver apply running as PID {}", pid));
        // Persist right away so a crash now can still reattach
        self.journal.save();
    }

    fn on_tick(&mut self) {
        self.absorb();
        self.journal.heartbeat();
    }
}

/// Incremental reader of a growing log file.
///
/// Yields the unit named on each complete new line that starts with the
/// prefix. A file that shrank was rewritten and is read from the start.
/// Bytes after the last newline stay undecoded until their line completes.
#[derive(Debug)]
struct LogFollower {
    path: PathBuf,
    prefix: String,
    offset: u64,
    partial: Vec<u8>,
}

impl LogFollower {
    fn new(path: &Path, prefix: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            prefix: prefix.to_string(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    fn poll(&mut self) -> Vec<String> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(_) => return Vec::new(),
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len < self.offset {
            warn!("{:?} was truncated, reading from the start", self.path);
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Vec::new();
        }

        let mut buf = Vec::new();
        if file.seek(SeekFrom::Start(self.offset)).is_err() || file.read_to_end(&mut buf).is_err()
        {
            return Vec::new();
        }
        self.offset += buf.len() as u64;
        self.partial.extend_from_slice(&buf);

        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();
        parse_prefixed(&String::from_utf8_lossy(&complete), &self.prefix)
    }
}

/// Names following `prefix` on each line, in order, without duplicates
fn parse_prefixed(text: &str, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in text.lines() {
        let Some(name) = line.trim().strip_prefix(prefix) else {
            continue;
        };
        let name = name.trim();
        if !name.is_empty() && !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn unit_outcomes(units: &[String], state: &DriverUpdateState, applied: bool) -> Vec<SubTaskOutcome> {
    units
        .iter()
        .map(|unit| {
            if state.completed_names.iter().any(|n| n == unit) {
                SubTaskOutcome::new(unit, TaskStatus::Success, "installed")
            } else if applied {
                SubTaskOutcome::new(unit, TaskStatus::Warning, "not confirmed in the apply log")
            } else {
                SubTaskOutcome::new(unit, TaskStatus::Error, "not installed")
            }
        })
        .collect()
}

//! External process invocation
//!
//! This module is the only place imageprep starts wrapped tools. Every
//! invocation goes through a [`ProcessRunner`], which gives the rest of the
//! crate one seam for:
//!
//! - Process group isolation (see [`crate::process_guard`])
//! - Per-invocation timeouts, enforced by killing the process group
//! - Cancellation: the run stops awaiting the tool but leaves it to finish
//! - Heartbeat hooks, fired on the driving thread while a tool runs
//!
//! Tests substitute scripted runners; production uses [`SystemProcessRunner`].

use crate::cancel::CancelToken;
use crate::error::{ImagePrepError, Result};
use crate::process_guard::{release_child, terminate_child, CommandProcessGroup};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A configured external command: program plus argument template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; inherited when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            work_dir: None,
        }
    }

    /// Substitute `{name}` placeholders in the arguments
    pub fn render(&self, vars: &[(&str, &str)]) -> Self {
        let args = self
            .args
            .iter()
            .map(|arg| {
                vars.iter().fold(arg.clone(), |acc, (name, value)| {
                    acc.replace(&format!("{{{}}}", name), value)
                })
            })
            .collect();
        Self {
            program: self.program.clone(),
            args,
            work_dir: self.work_dir.clone(),
        }
    }

    /// Build a request with the given timeout and default options
    pub fn to_request(&self, timeout: Duration) -> ProcessRequest {
        ProcessRequest {
            program: self.program.clone(),
            args: self.args.clone(),
            work_dir: self.work_dir.clone(),
            timeout,
            log_file: None,
            survive_parent: false,
        }
    }
}

/// Everything needed to run one external process once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    pub timeout: Duration,
    /// Send stdout and stderr to this file instead of pipes. Required for
    /// processes that may outlive us: a pipe would break when we exit.
    pub log_file: Option<PathBuf>,
    /// Start without a parent-death signal so the process can finish after we exit
    pub survive_parent: bool,
}

impl ProcessRequest {
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn surviving_parent(mut self) -> Self {
        self.survive_parent = true;
        self
    }

    /// Command line for log output
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code (None if killed by a signal, timed out or abandoned)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    /// We stopped awaiting the process because the run was cancelled
    pub cancelled: bool,
}

impl ProcessOutput {
    /// A completed invocation with the given exit code
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn timed_out() -> Self {
        Self {
            timed_out: true,
            ..Self::default()
        }
    }

    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }
}

/// Callbacks fired on the driving thread while a process runs.
pub trait RunHooks {
    /// The process was spawned with this PID
    fn on_spawn(&mut self, _pid: u32) {}

    /// Fired on every poll while waiting for the process
    fn on_tick(&mut self) {}
}

/// Hooks that do nothing
pub struct NoHooks;

impl RunHooks for NoHooks {}

/// Runs external processes.
pub trait ProcessRunner {
    /// Run `request` to completion, timeout or cancellation.
    ///
    /// Returns `Err` only when the process could not be started or awaited.
    fn run(
        &self,
        request: &ProcessRequest,
        cancel: &CancelToken,
        hooks: &mut dyn RunHooks,
    ) -> Result<ProcessOutput>;
}

/// Production runner backed by `std::process`.
#[derive(Debug, Clone)]
pub struct SystemProcessRunner {
    dry_run: bool,
    poll_interval: Duration,
    kill_grace: Duration,
}

impl Default for SystemProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self {
            dry_run: false,
            poll_interval: Duration::from_millis(100),
            kill_grace: Duration::from_secs(5),
        }
    }

    /// Log commands instead of running them; every command "exits" 0
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

impl ProcessRunner for SystemProcessRunner {
    fn run(
        &self,
        request: &ProcessRequest,
        cancel: &CancelToken,
        hooks: &mut dyn RunHooks,
    ) -> Result<ProcessOutput> {
        if self.dry_run {
            info!("[dry-run] would execute: {}", request.display());
            return Ok(ProcessOutput::exited(0));
        }

        info!(
            "Executing: {} (timeout {}s)",
            request.display(),
            request.timeout.as_secs()
        );

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args).stdin(Stdio::null());
        if let Some(dir) = &request.work_dir {
            cmd.current_dir(dir);
        }

        match &request.log_file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)?;
                let err_file = file.try_clone()?;
                cmd.stdout(file).stderr(err_file);
            }
            None => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        if request.survive_parent {
            cmd.detached();
        } else {
            cmd.in_new_process_group();
        }

        let mut child = cmd.spawn().map_err(|e| {
            ImagePrepError::process(format!("Failed to spawn {}: {}", request.program, e))
        })?;
        let pid = child.id();
        debug!("Spawned {} as PID {}", request.program, pid);
        hooks.on_spawn(pid);

        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let start = Instant::now();
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }

            hooks.on_tick();

            if cancel.is_cancelled() {
                warn!(
                    "Cancellation requested; leaving PID {} ({}) to finish on its own",
                    pid, request.program
                );
                release_child(child);
                return Ok(ProcessOutput::cancelled());
            }

            if start.elapsed() >= request.timeout {
                warn!(
                    "{} exceeded its {}s timeout, terminating",
                    request.program,
                    request.timeout.as_secs()
                );
                terminate_child(&mut child, self.kill_grace);
                timed_out = true;
                break None;
            }

            std::thread::sleep(self.poll_interval);
        };

        let mut stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);
        if let Some(path) = &request.log_file {
            stdout = std::fs::read(path)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
        }

        let exit_code = status.and_then(|s| s.code());
        info!(
            "{} finished: exit_code={:?} timed_out={} after {}s",
            request.program,
            exit_code,
            timed_out,
            start.elapsed().as_secs()
        );

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
            cancelled: false,
        })
    }
}

//! Retry Policy Engine
//!
//! Wraps one external operation with a timeout, exit-code classification and
//! bounded exponential backoff. One algorithm serves every tool; tools differ
//! only in their [`RetryPolicy`] and [`ExitCodeTable`]:
//!
//! | Policy           | Retries | Backoff        | Timeout |
//! |------------------|---------|----------------|---------|
//! | `policy_refresh` | 2       | 5s → 30s       | 2 min   |
//! | `driver_scan`    | 3       | 30s → 5 min    | 15 min  |
//! | `driver_apply`   | 0       | n/a            | 4 h     |
//!
//! # Algorithm
//!
//! ```text
//! attempt = 1, delay = initial_delay
//! loop:
//!   invoke(timeout) → classify
//!     Success / SuccessRebootRequired / NoOpSuccess → return Success
//!     Retryable (or timeout) → attempt <= max_retries ? wait delay, grow delay, retry
//!                                                   : Error "failed after N attempts"
//!     Fatal / unmapped → return Error
//! ```
//!
//! Cancellation, whether observed during the operation or the backoff wait,
//! ends the loop at once with Error "cancelled".

use crate::cancel::CancelToken;
use crate::command_runner::{ProcessOutput, ProcessRequest, ProcessRunner, RunHooks};
use crate::error::Result;
use crate::exit_codes::ExitCodeTable;
use crate::outcome::TaskOutcome;
use crate::types::{ExitClass, TaskId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

/// Serialize durations as (fractional) seconds in config files
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {}",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Retry configuration attached to one external operation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Per-attempt limit
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Quick, idempotent refresh
    pub fn policy_refresh() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(120),
        }
    }

    /// Scan-style probe of the vendor update tool
    pub fn driver_scan() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(300),
            timeout: Duration::from_secs(15 * 60),
        }
    }

    /// Apply-style operation: too long to ever retry
    pub fn driver_apply() -> Self {
        Self::single_attempt(Duration::from_secs(4 * 60 * 60))
    }

    /// One attempt, no backoff
    pub fn single_attempt(timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
            timeout,
        }
    }

    /// Delay that follows `current`, capped at `max_delay`
    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.backoff_multiplier.max(1.0))
            .min(self.max_delay)
    }

    /// The waits before retries 1..=max_retries
    pub fn delay_schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.max_retries as usize);
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 0..self.max_retries {
            delays.push(delay);
            delay = self.next_delay(delay);
        }
        delays
    }

    /// Check the policy is usable
    pub fn validate(&self, name: &str) -> std::result::Result<(), String> {
        if self.timeout.is_zero() {
            return Err(format!("{}: timeout must be greater than zero", name));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "{}: backoff_multiplier must be >= 1.0 (got {})",
                name, self.backoff_multiplier
            ));
        }
        if self.initial_delay > self.max_delay && self.max_retries > 0 {
            return Err(format!("{}: initial_delay exceeds max_delay", name));
        }
        Ok(())
    }
}

/// One invocable external operation.
pub trait Operation {
    /// Name for log lines and messages
    fn name(&self) -> &str;

    /// Run once. `Err` means the operation could not be started at all.
    fn invoke(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<ProcessOutput>;
}

/// An external process run through a [`ProcessRunner`].
pub struct ProcessOperation<'a> {
    name: String,
    runner: &'a dyn ProcessRunner,
    request: ProcessRequest,
    hooks: &'a mut dyn RunHooks,
}

impl<'a> ProcessOperation<'a> {
    pub fn new(
        name: impl Into<String>,
        runner: &'a dyn ProcessRunner,
        request: ProcessRequest,
        hooks: &'a mut dyn RunHooks,
    ) -> Self {
        Self {
            name: name.into(),
            runner,
            request,
            hooks,
        }
    }
}

impl Operation for ProcessOperation<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<ProcessOutput> {
        let mut request = self.request.clone();
        request.timeout = timeout;
        self.runner.run(&request, cancel, &mut *self.hooks)
    }
}

/// Everything the engine learned while executing an operation.
#[derive(Debug, Clone)]
pub struct RetryReport {
    pub outcome: TaskOutcome,
    /// Classification of the final attempt, if it produced one
    pub class: Option<ExitClass>,
    /// Backoff waits actually taken, in order
    pub delays: Vec<Duration>,
    /// Output of the final attempt
    pub output: Option<ProcessOutput>,
}

/// Executes operations under a policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryEngine;

impl RetryEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run `operation` under `policy`, returning only the outcome
    pub fn execute(
        &self,
        task_id: TaskId,
        operation: &mut dyn Operation,
        table: &ExitCodeTable,
        policy: &RetryPolicy,
        cancel: &CancelToken,
    ) -> TaskOutcome {
        self.execute_with_report(task_id, operation, table, policy, cancel)
            .outcome
    }

    /// Run `operation` under `policy`, keeping the retry trace and last output
    pub fn execute_with_report(
        &self,
        task_id: TaskId,
        operation: &mut dyn Operation,
        table: &ExitCodeTable,
        policy: &RetryPolicy,
        cancel: &CancelToken,
    ) -> RetryReport {
        let outcome = TaskOutcome::begin(task_id);
        let mut delays = Vec::new();
        let mut attempt: u32 = 1;
        let mut delay = policy.initial_delay.min(policy.max_delay);
        let name = operation.name().to_string();

        loop {
            if cancel.is_cancelled() {
                return RetryReport {
                    outcome: outcome.error("cancelled").with_attempts(attempt - 1),
                    class: None,
                    delays,
                    output: None,
                };
            }

            info!("{}: attempt {}/{}", name, attempt, policy.max_retries + 1);
            let output = match operation.invoke(policy.timeout, cancel) {
                Ok(output) => output,
                Err(e) => {
                    warn!("{}: could not start: {}", name, e);
                    return RetryReport {
                        outcome: outcome
                            .error(format!("{} could not be started: {}", name, e))
                            .with_attempts(attempt),
                        class: Some(ExitClass::Fatal),
                        delays,
                        output: None,
                    };
                }
            };

            if output.cancelled {
                return RetryReport {
                    outcome: outcome.error("cancelled").with_attempts(attempt),
                    class: None,
                    delays,
                    output: Some(output),
                };
            }

            let class = if output.timed_out {
                ExitClass::Retryable
            } else {
                match output.exit_code {
                    Some(code) => table.classify(code),
                    None => ExitClass::Fatal,
                }
            };

            let outcome = match class {
                ExitClass::Success => outcome.success(format!("{} completed", name)),
                ExitClass::SuccessRebootRequired => outcome
                    .success(format!("{} completed; restart required", name))
                    .with_restart(true),
                ExitClass::NoOpSuccess => {
                    outcome.success(format!("{} reported nothing to do", name))
                }
                ExitClass::Retryable if attempt <= policy.max_retries => {
                    warn!(
                        "{}: transient failure ({}), retrying in {:?}",
                        name,
                        describe(&output),
                        delay
                    );
                    if !cancel.sleep(delay) {
                        return RetryReport {
                            outcome: outcome.error("cancelled").with_attempts(attempt),
                            class: Some(class),
                            delays,
                            output: Some(output),
                        };
                    }
                    delays.push(delay);
                    delay = policy.next_delay(delay);
                    attempt += 1;
                    continue;
                }
                ExitClass::Retryable => outcome.error(format!(
                    "{} failed after {} attempts ({})",
                    name,
                    attempt,
                    describe(&output)
                )),
                ExitClass::Fatal => {
                    outcome.error(format!("{} failed ({})", name, describe(&output)))
                }
            };

            let outcome = outcome
                .with_exit_code(output.exit_code)
                .with_attempts(attempt);
            info!("{}: {} after {} attempt(s)", name, outcome.status, attempt);
            return RetryReport {
                outcome,
                class: Some(class),
                delays,
                output: Some(output),
            };
        }
    }
}

/// Short description of a failed attempt
fn describe(output: &ProcessOutput) -> String {
    let base = if output.timed_out {
        "timed out".to_string()
    } else {
        match output.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    };
    match output.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(line) => format!("{}: {}", base, line.trim()),
        None => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use std::collections::VecDeque;

    /// Operation that replays scripted results
    struct Scripted {
        results: VecDeque<ProcessOutput>,
        calls: u32,
    }

    impl Scripted {
        fn codes(codes: &[i32]) -> Self {
            Self {
                results: codes.iter().map(|&c| ProcessOutput::exited(c)).collect(),
                calls: 0,
            }
        }
    }

    impl Operation for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn invoke(&mut self, _timeout: Duration, _cancel: &CancelToken) -> Result<ProcessOutput> {
            self.calls += 1;
            Ok(self
                .results
                .pop_front()
                .unwrap_or_else(|| ProcessOutput::exited(0)))
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_delay_schedule_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        };
        let secs: Vec<u64> = policy.delay_schedule().iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![5, 10, 20, 30, 30]);
    }

    #[test]
    fn test_reboot_required_sets_flag() {
        let table = ExitCodeTable::driver_apply(500);
        let mut op = Scripted::codes(&[1]);
        let outcome = RetryEngine::new().execute(
            TaskId::DriverUpdate,
            &mut op,
            &table,
            &fast_policy(0),
            &CancelToken::new(),
        );
        assert_eq!(outcome.status, TaskStatus::Success);
        assert!(outcome.requires_restart);
    }

    #[test]
    fn test_no_op_does_not_retry() {
        let table = ExitCodeTable::driver_scan(500);
        let mut op = Scripted::codes(&[500]);
        let report = RetryEngine::new().execute_with_report(
            TaskId::DriverUpdate,
            &mut op,
            &table,
            &fast_policy(3),
            &CancelToken::new(),
        );
        assert_eq!(report.outcome.status, TaskStatus::Success);
        assert_eq!(report.class, Some(ExitClass::NoOpSuccess));
        assert_eq!(op.calls, 1);
        assert!(report.outcome.message.contains("nothing to do"));
    }

    #[test]
    fn test_retries_exhausted() {
        let table = ExitCodeTable::policy_refresh();
        let mut op = Scripted::codes(&[1, 1, 1, 1]);
        let report = RetryEngine::new().execute_with_report(
            TaskId::PolicyRefresh,
            &mut op,
            &table,
            &fast_policy(2),
            &CancelToken::new(),
        );
        assert_eq!(report.outcome.status, TaskStatus::Error);
        assert_eq!(op.calls, 3);
        assert_eq!(report.delays.len(), 2);
        assert!(report.outcome.message.contains("failed after 3 attempts"));
    }

    #[test]
    fn test_timeout_counts_as_retryable() {
        let table = ExitCodeTable::policy_refresh();
        let mut op = Scripted {
            results: VecDeque::from(vec![ProcessOutput::timed_out(), ProcessOutput::exited(0)]),
            calls: 0,
        };
        let outcome = RetryEngine::new().execute(
            TaskId::PolicyRefresh,
            &mut op,
            &table,
            &fast_policy(1),
            &CancelToken::new(),
        );
        assert_eq!(outcome.status, TaskStatus::Success);
        assert_eq!(outcome.attempts, 2);
    }

    #[test]
    fn test_cancelled_operation_is_not_retried() {
        let table = ExitCodeTable::policy_refresh();
        let mut op = Scripted {
            results: VecDeque::from(vec![ProcessOutput::cancelled()]),
            calls: 0,
        };
        let outcome = RetryEngine::new().execute(
            TaskId::PolicyRefresh,
            &mut op,
            &table,
            &fast_policy(5),
            &CancelToken::new(),
        );
        assert_eq!(outcome.status, TaskStatus::Error);
        assert_eq!(outcome.message, "cancelled");
        assert_eq!(op.calls, 1);
    }

    #[test]
    fn test_already_cancelled_never_invokes() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut op = Scripted::codes(&[0]);
        let outcome = RetryEngine::new().execute(
            TaskId::PolicyRefresh,
            &mut op,
            &ExitCodeTable::policy_refresh(),
            &fast_policy(2),
            &cancel,
        );
        assert_eq!(outcome.status, TaskStatus::Error);
        assert_eq!(op.calls, 0);
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::policy_refresh().validate("policy_refresh").is_ok());
        assert!(RetryPolicy::driver_apply().validate("driver_apply").is_ok());

        let mut bad = RetryPolicy::driver_scan();
        bad.backoff_multiplier = 0.5;
        assert!(bad.validate("driver_scan").is_err());

        let mut bad = RetryPolicy::driver_scan();
        bad.timeout = Duration::ZERO;
        assert!(bad.validate("driver_scan").is_err());
    }

    #[test]
    fn test_policy_json_uses_seconds() {
        let json = serde_json::to_value(RetryPolicy::policy_refresh()).expect("serialize");
        assert_eq!(json["initial_delay"], 5.0);
        assert_eq!(json["timeout"], 120.0);
        let back: RetryPolicy = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, RetryPolicy::policy_refresh());
    }
}

//! Task and run results
//!
//! A [`TaskOutcome`] starts when its task begins and is finalized exactly once
//! when the task ends. The orchestrator owns every outcome of a run and only
//! hands them out read-only through [`RunSummary`].

use crate::types::{TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Result of one sub-action of a composite task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskOutcome {
    pub name: String,
    pub status: TaskStatus,
    pub message: String,
    pub exit_code: Option<i32>,
}

impl SubTaskOutcome {
    pub fn new(name: impl Into<String>, status: TaskStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
            exit_code: None,
        }
    }

    /// Summarize a finished outcome as a sub-action of a larger task
    pub fn from_outcome(name: impl Into<String>, outcome: &TaskOutcome) -> Self {
        Self {
            name: name.into(),
            status: outcome.status,
            message: outcome.message.clone(),
            exit_code: outcome.exit_code,
        }
    }
}

/// Result of one pipeline task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub message: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub requires_restart: bool,
    /// Number of external invocations made
    pub attempts: u32,
    pub sub_tasks: Vec<SubTaskOutcome>,
}

impl TaskOutcome {
    /// Start an outcome for a task that is beginning now
    pub fn begin(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Running,
            message: String::new(),
            start_time: Utc::now(),
            end_time: None,
            exit_code: None,
            requires_restart: false,
            attempts: 0,
            sub_tasks: Vec::new(),
        }
    }

    /// Finalize with a status and message, stamping the end time.
    ///
    /// Finalizing an already-final outcome keeps the first result.
    pub fn finish(mut self, status: TaskStatus, message: impl Into<String>) -> Self {
        if self.is_final() {
            return self;
        }
        self.status = status;
        self.message = message.into();
        self.end_time = Some(Utc::now());
        self
    }

    pub fn success(self, message: impl Into<String>) -> Self {
        self.finish(TaskStatus::Success, message)
    }

    pub fn warning(self, message: impl Into<String>) -> Self {
        self.finish(TaskStatus::Warning, message)
    }

    pub fn error(self, message: impl Into<String>) -> Self {
        self.finish(TaskStatus::Error, message)
    }

    pub fn skipped(self, message: impl Into<String>) -> Self {
        self.finish(TaskStatus::Skipped, message)
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_restart(mut self, requires_restart: bool) -> Self {
        self.requires_restart = requires_restart;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_sub_tasks(mut self, sub_tasks: Vec<SubTaskOutcome>) -> Self {
        self.sub_tasks = sub_tasks;
        self
    }

    /// Same result, reported under a different task id
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = task_id;
        self
    }

    pub fn is_final(&self) -> bool {
        self.status.is_final()
    }

    /// Wall-clock duration, zero until finalized
    pub fn duration(&self) -> Duration {
        self.end_time
            .and_then(|end| (end - self.start_time).to_std().ok())
            .unwrap_or_default()
    }
}

/// How the run ended overall, for the final notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryVerdict {
    AllSucceeded,
    CompletedWithIssues,
}

/// Aggregate result of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    outcomes: Vec<TaskOutcome>,
    pub overall_success: bool,
    pub requires_restart: bool,
    pub cancelled: bool,
}

impl RunSummary {
    /// Aggregate finished outcomes
    pub fn from_outcomes(outcomes: Vec<TaskOutcome>, cancelled: bool) -> Self {
        let overall_success = !outcomes.iter().any(|o| o.status == TaskStatus::Error);
        let requires_restart = outcomes.iter().any(|o| o.requires_restart);
        Self {
            outcomes,
            overall_success,
            requires_restart,
            cancelled,
        }
    }

    pub fn outcomes(&self) -> &[TaskOutcome] {
        &self.outcomes
    }

    pub fn outcome(&self, task_id: TaskId) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.task_id == task_id)
    }

    pub fn verdict(&self) -> SummaryVerdict {
        let clean = self
            .outcomes
            .iter()
            .all(|o| matches!(o.status, TaskStatus::Success | TaskStatus::Skipped));
        if clean && !self.cancelled {
            SummaryVerdict::AllSucceeded
        } else {
            SummaryVerdict::CompletedWithIssues
        }
    }

    /// Process exit code for the CLI.
    ///
    /// Cancelled (130) over task errors (1) over restart required (3). The
    /// restart notice still heads the printed summary when errors win.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            130
        } else if !self.overall_success {
            1
        } else if self.requires_restart {
            3
        } else {
            0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.requires_restart {
            writeln!(f, "*** RESTART REQUIRED to finish applying changes ***")?;
        }
        match self.verdict() {
            SummaryVerdict::AllSucceeded => writeln!(f, "All tasks succeeded")?,
            SummaryVerdict::CompletedWithIssues if self.cancelled => {
                writeln!(f, "Run cancelled before all tasks finished")?
            }
            SummaryVerdict::CompletedWithIssues => {
                writeln!(f, "Completed with warnings or errors")?
            }
        }
        for outcome in &self.outcomes {
            writeln!(
                f,
                "  [{:<7}] {:<28} {} ({}s)",
                outcome.status,
                outcome.task_id.description(),
                outcome.message,
                outcome.duration().as_secs()
            )?;
            for sub in &outcome.sub_tasks {
                writeln!(f, "      - [{}] {}: {}", sub.status, sub.name, sub.message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_is_once() {
        let outcome = TaskOutcome::begin(TaskId::PolicyRefresh).success("done");
        let again = outcome.clone().error("late failure");
        assert_eq!(again.status, TaskStatus::Success);
        assert_eq!(again.message, "done");
        assert!(again.end_time.is_some());
    }

    #[test]
    fn test_summary_aggregation() {
        let summary = RunSummary::from_outcomes(
            vec![
                TaskOutcome::begin(TaskId::BaselineInventory).success("ok"),
                TaskOutcome::begin(TaskId::DriverUpdate)
                    .success("applied")
                    .with_restart(true),
                TaskOutcome::begin(TaskId::ComplianceVerification).warning("pending reboot"),
            ],
            false,
        );
        assert!(summary.overall_success);
        assert!(summary.requires_restart);
        assert_eq!(summary.verdict(), SummaryVerdict::CompletedWithIssues);
        assert_eq!(summary.exit_code(), 3);
    }

    #[test]
    fn test_summary_error_fails_run() {
        let summary = RunSummary::from_outcomes(
            vec![
                TaskOutcome::begin(TaskId::PolicyRefresh).error("boom"),
                TaskOutcome::begin(TaskId::AgentActions).success("ok"),
            ],
            false,
        );
        assert!(!summary.overall_success);
        assert!(!summary.requires_restart);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_errors_outrank_restart_in_exit_code() {
        let summary = RunSummary::from_outcomes(
            vec![
                TaskOutcome::begin(TaskId::PolicyRefresh).error("boom"),
                TaskOutcome::begin(TaskId::DriverUpdate)
                    .success("applied")
                    .with_restart(true),
            ],
            false,
        );
        assert!(summary.requires_restart);
        assert_eq!(summary.exit_code(), 1);
        assert!(summary.to_string().starts_with("*** RESTART REQUIRED"));
    }

    #[test]
    fn test_display_puts_restart_notice_first() {
        let summary = RunSummary::from_outcomes(
            vec![TaskOutcome::begin(TaskId::DriverUpdate)
                .success("applied")
                .with_restart(true)],
            false,
        );
        let text = summary.to_string();
        assert!(text.starts_with("*** RESTART REQUIRED"));
        assert!(text.contains("All tasks succeeded"));
    }
}

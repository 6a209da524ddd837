//! Progress events emitted during a run.
//!
//! Delivered synchronously, on the driving thread, to the callback passed to
//! [`crate::orchestrator::Orchestrator::run_all`].

use crate::types::{TaskId, TaskStatus};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Overall run progress, 0-100
    Progress { message: String, percentage: u8 },
    /// Free-form status line
    Status(String),
    /// A task changed status
    Task {
        task_id: TaskId,
        status: TaskStatus,
        message: String,
        duration: Duration,
    },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Progress {
                message,
                percentage,
            } => write!(f, "[{:>3}%] {}", percentage, message),
            Self::Status(text) => write!(f, "{}", text),
            Self::Task {
                task_id,
                status,
                message,
                duration,
            } => {
                write!(f, "{}: {}", task_id.description(), status)?;
                if !message.is_empty() {
                    write!(f, " - {}", message)?;
                }
                if !duration.is_zero() {
                    write!(f, " ({}s)", duration.as_secs())?;
                }
                Ok(())
            }
        }
    }
}

/// Maps a task's own 0-100 progress into its slice of the whole run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSpan {
    start: f64,
    width: f64,
}

impl ProgressSpan {
    /// Slice `[start, start + width]` of the run, both in percent
    pub fn new(start: f64, width: f64) -> Self {
        Self {
            start: start.clamp(0.0, 100.0),
            width: width.clamp(0.0, 100.0),
        }
    }

    /// The whole run
    pub fn full() -> Self {
        Self::new(0.0, 100.0)
    }

    /// Overall percentage for a task-local percentage
    pub fn overall(&self, task_percent: u8) -> u8 {
        let local = f64::from(task_percent.min(100)) / 100.0;
        (self.start + self.width * local).round().clamp(0.0, 100.0) as u8
    }
}

//! Run State Machine
//!
//! Authoritative, in-process record of where a run is. Transitions are
//! validated so the orchestrator cannot skip backwards, restart a finished run
//! or move a task out of a final status.
//!
//! # Run phases
//!
//! ```text
//! NotStarted
//!     ↓
//! Running(0) → Running(1) → … → Running(n-1)
//!     ↓                              ↓
//! Aborted (cancelled)            Completed
//! ```
//!
//! # Task statuses
//!
//! ```text
//! Pending → Running → {Success | Warning | Error | Skipped}
//! Pending → Skipped   (completed earlier, cancelled, or disabled)
//! ```

use crate::types::TaskStatus;
use std::fmt;
use thiserror::Error;

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    NotStarted,
    /// Executing the task at this position of the selected pipeline
    Running(usize),
    Completed,
    Aborted,
}

impl RunPhase {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "Not started"),
            Self::Running(index) => write!(f, "Running task #{}", index + 1),
            Self::Completed => write!(f, "Completed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunTransitionError {
    #[error("Cannot transition from terminal phase {from}")]
    FromTerminalPhase { from: RunPhase },

    #[error("Cannot move from {from} to task #{} (tasks run strictly in order)", .to + 1)]
    OutOfOrder { from: RunPhase, to: usize },

    #[error("Task index {index} is outside a pipeline of {len} tasks")]
    OutOfRange { index: usize, len: usize },

    #[error("Cannot complete from {from} (tasks remain)")]
    Incomplete { from: RunPhase },

    #[error("Invalid task transition {from} → {to}")]
    InvalidTaskTransition { from: TaskStatus, to: TaskStatus },
}

/// Validate one task status transition
pub fn check_task_transition(from: TaskStatus, to: TaskStatus) -> Result<(), RunTransitionError> {
    let valid = match from {
        TaskStatus::Pending => matches!(to, TaskStatus::Running | TaskStatus::Skipped),
        TaskStatus::Running => to.is_final(),
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(RunTransitionError::InvalidTaskTransition { from, to })
    }
}

/// Tracks the run phase over a pipeline of `len` selected tasks.
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    phase: RunPhase,
    len: usize,
}

impl RunStateMachine {
    pub fn new(len: usize) -> Self {
        Self {
            phase: RunPhase::NotStarted,
            len,
        }
    }

    #[inline]
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Enter the task at `index`; must be the next one in order
    pub fn start_task(&mut self, index: usize) -> Result<RunPhase, RunTransitionError> {
        if self.phase.is_terminal() {
            return Err(RunTransitionError::FromTerminalPhase { from: self.phase });
        }
        if index >= self.len {
            return Err(RunTransitionError::OutOfRange {
                index,
                len: self.len,
            });
        }
        let expected = match self.phase {
            RunPhase::NotStarted => 0,
            RunPhase::Running(current) => current + 1,
            RunPhase::Completed | RunPhase::Aborted => unreachable!("terminal phases return early"),
        };
        if index != expected {
            return Err(RunTransitionError::OutOfOrder {
                from: self.phase,
                to: index,
            });
        }
        self.phase = RunPhase::Running(index);
        Ok(self.phase)
    }

    /// Finish after the last task (or immediately for an empty pipeline)
    pub fn complete(&mut self) -> Result<RunPhase, RunTransitionError> {
        let done = match self.phase {
            RunPhase::NotStarted => self.len == 0,
            RunPhase::Running(index) => index + 1 == self.len,
            terminal => return Err(RunTransitionError::FromTerminalPhase { from: terminal }),
        };
        if !done {
            return Err(RunTransitionError::Incomplete { from: self.phase });
        }
        self.phase = RunPhase::Completed;
        Ok(self.phase)
    }

    /// Stop early (cancellation). Allowed from any non-terminal phase.
    pub fn abort(&mut self) -> Result<RunPhase, RunTransitionError> {
        if self.phase.is_terminal() {
            return Err(RunTransitionError::FromTerminalPhase { from: self.phase });
        }
        self.phase = RunPhase::Aborted;
        Ok(self.phase)
    }
}

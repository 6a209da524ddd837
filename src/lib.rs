//! imageprep Library
//!
//! Post-imaging workstation setup: policy refresh, management agent actions,
//! vendor driver updates and compliance verification, with per-tool exit-code
//! classification, retry with backoff, persisted recovery and relocation off
//! unstable storage.

pub mod agent;
pub mod cancel;
pub mod command_runner;
pub mod config;
pub mod error;
pub mod execution_state;
pub mod exit_codes;
pub mod inventory;
pub mod orchestrator;
pub mod outcome;
pub mod process_guard;
pub mod progress;
pub mod resilience;
pub mod retry;
pub mod run_state;
pub mod sleep_guard;
pub mod tasks;
pub mod types;

// Re-export main types for convenience
pub use cancel::CancelToken;
pub use command_runner::{CommandSpec, ProcessOutput, ProcessRequest, ProcessRunner, RunHooks};
pub use config::RunConfig;
pub use error::{ImagePrepError, Result};
pub use execution_state::{ExecutionState, RunJournal, StateStore};
pub use exit_codes::ExitCodeTable;
pub use orchestrator::{Orchestrator, RecoveryPlan, RunContext, Services};
pub use outcome::{RunSummary, SubTaskOutcome, TaskOutcome};
pub use progress::ProgressEvent;
pub use retry::{RetryEngine, RetryPolicy};
pub use run_state::{RunPhase, RunStateMachine, RunTransitionError};
pub use sleep_guard::{SleepGuard, SleepInhibitor};
pub use tasks::{TaskContext, TaskHandler};
pub use types::{ExitClass, TaskId, TaskSelection, TaskStatus};

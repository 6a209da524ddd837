//! Pipeline task handlers
//!
//! Each pipeline step is a [`TaskHandler`]. Handlers receive a [`TaskContext`]
//! holding configuration, collaborators, the run journal and the progress
//! callback, and return `anyhow::Result<TaskOutcome>`. Errors and panics are
//! turned into `Error` outcomes by the orchestrator, so handlers use `?`
//! freely for anything that is not an expected tool failure.

pub mod agent_actions;
pub mod compliance;
pub mod driver_update;
pub mod inventory;
pub mod policy_refresh;

use crate::agent::AgentActionTrigger;
use crate::cancel::CancelToken;
use crate::command_runner::{ProcessRequest, ProcessRunner, RunHooks};
use crate::config::RunConfig;
use crate::execution_state::RunJournal;
use crate::exit_codes::ExitCodeTable;
use crate::inventory::{InventoryProvider, ProbeTargets};
use crate::outcome::TaskOutcome;
use crate::progress::{ProgressEvent, ProgressSpan};
use crate::retry::{ProcessOperation, RetryEngine, RetryPolicy, RetryReport};
use crate::types::TaskId;
use tracing::info;

pub use agent_actions::AgentActionsTask;
pub use compliance::ComplianceTask;
pub use driver_update::DriverUpdateTask;
pub use inventory::BaselineInventoryTask;
pub use policy_refresh::PolicyRefreshTask;

/// One step of the pipeline.
pub trait TaskHandler {
    fn id(&self) -> TaskId;

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<TaskOutcome>;
}

/// The production handler for every task, in pipeline order
pub fn default_handlers() -> Vec<Box<dyn TaskHandler>> {
    vec![
        Box::new(BaselineInventoryTask),
        Box::new(PolicyRefreshTask),
        Box::new(AgentActionsTask),
        Box::new(DriverUpdateTask),
        Box::new(ComplianceTask),
    ]
}

/// Everything a handler may use while it runs.
pub struct TaskContext<'a> {
    pub config: &'a RunConfig,
    pub runner: &'a dyn ProcessRunner,
    pub inventory: &'a dyn InventoryProvider,
    pub agent: &'a dyn AgentActionTrigger,
    pub cancel: &'a CancelToken,
    /// This run resumes an interrupted one
    pub recovering: bool,
    pub journal: &'a mut RunJournal,
    pub progress: &'a mut dyn FnMut(ProgressEvent),
    /// This task's share of overall progress
    pub span: ProgressSpan,
    pub engine: RetryEngine,
}

impl TaskContext<'_> {
    /// Report task-local progress (0-100)
    pub fn report(&mut self, message: impl Into<String>, task_percent: u8) {
        let percentage = self.span.overall(task_percent);
        (self.progress)(ProgressEvent::Progress {
            message: message.into(),
            percentage,
        });
    }

    pub fn status(&mut self, text: impl Into<String>) {
        (self.progress)(ProgressEvent::Status(text.into()));
    }

    /// Log a message and keep it in the persisted rolling log
    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.journal.log(message);
    }

    /// Run one external command under the retry engine, saving state on the
    /// heartbeat while it runs
    pub fn run_with_retry(
        &mut self,
        task_id: TaskId,
        name: &str,
        request: ProcessRequest,
        table: &ExitCodeTable,
        policy: &RetryPolicy,
    ) -> RetryReport {
        let runner = self.runner;
        let cancel = self.cancel;
        let mut hooks = HeartbeatHooks::new(self.journal);
        let mut operation = ProcessOperation::new(name, runner, request, &mut hooks);
        self.engine
            .execute_with_report(task_id, &mut operation, table, policy, cancel)
    }

    /// Inventory probe targets from the compliance settings
    pub fn probe_targets(&self) -> ProbeTargets {
        ProbeTargets::from_compliance(&self.config.compliance)
    }
}

/// Saves the run journal on its heartbeat while a process runs.
pub struct HeartbeatHooks<'j> {
    journal: &'j mut RunJournal,
}

impl<'j> HeartbeatHooks<'j> {
    pub fn new(journal: &'j mut RunJournal) -> Self {
        Self { journal }
    }
}

impl RunHooks for HeartbeatHooks<'_> {
    fn on_tick(&mut self) {
        self.journal.heartbeat();
    }
}

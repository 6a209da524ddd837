//! Task Orchestrator
//!
//! Sequences the fixed pipeline, isolates task failures, persists progress
//! and resumes interrupted runs.
//!
//! # Run lifecycle
//!
//! ```text
//! RecoveryPlan::detect ──► Orchestrator::new(context, plan)
//!                               │
//!                           run_all ──► acquire sleep guard
//!                               │        for each selected task, in pipeline order:
//!                               │          cancelled?            → Skipped "cancelled before start"
//!                               │          completed pre-restart → Skipped "completed before restart"
//!                               │          otherwise run handler (Err/panic → Error outcome)
//!                               │          save state
//!                               ▼
//!                           clear state, release guard, RunSummary
//! ```
//!
//! A task failure never stops later tasks. Only cancellation does. A cancelled
//! run is abandoned, except when it released a driver apply that keeps
//! running: its state then stays recoverable so the next run reattaches.

use crate::agent::{AgentActionTrigger, CommandAgentTrigger};
use crate::cancel::CancelToken;
use crate::command_runner::{ProcessRunner, SystemProcessRunner};
use crate::config::RunConfig;
use crate::execution_state::{ExecutionState, RunJournal, StateStore};
use crate::inventory::{InventoryProvider, SystemInventory};
use crate::outcome::{RunSummary, SummaryVerdict, TaskOutcome};
use crate::progress::{ProgressEvent, ProgressSpan};
use crate::retry::RetryEngine;
use crate::run_state::{check_task_transition, RunStateMachine};
use crate::sleep_guard::{NoopInhibitor, SleepGuard, SleepInhibitor, SystemdInhibitor};
use crate::tasks::{default_handlers, TaskContext, TaskHandler};
use crate::types::{TaskId, TaskSelection, TaskStatus};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// External collaborators of a run.
pub struct Services {
    pub runner: Arc<dyn ProcessRunner>,
    pub inventory: Box<dyn InventoryProvider>,
    pub agent: Box<dyn AgentActionTrigger>,
    pub inhibitor: Box<dyn SleepInhibitor>,
}

impl Services {
    /// Production collaborators for `config`
    pub fn system(config: &RunConfig, dry_run: bool) -> Self {
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner::new().dry_run(dry_run));
        let inventory = SystemInventory::new(
            config.inventory.activation_probe.clone(),
            config.inventory.domain_probe.clone(),
            Duration::from_secs(config.inventory.probe_timeout_secs),
        );
        let agent = CommandAgentTrigger::new(config.agent.command.clone(), Arc::clone(&runner));
        let inhibitor: Box<dyn SleepInhibitor> = if config.sleep.enabled && !dry_run {
            Box::new(SystemdInhibitor::new("Post-imaging setup in progress"))
        } else {
            Box::new(NoopInhibitor::default())
        };

        Self {
            runner,
            inventory: Box::new(inventory),
            agent: Box::new(agent),
            inhibitor,
        }
    }
}

/// Configuration, state store and collaborators of one run.
pub struct RunContext {
    pub config: RunConfig,
    pub store: StateStore,
    pub services: Services,
}

impl RunContext {
    /// Context whose state store lives in the configured cache root
    pub fn new(config: RunConfig, services: Services) -> Self {
        let store = StateStore::new(&config.cache_root);
        Self {
            config,
            store,
            services,
        }
    }
}

/// Whether this process starts fresh or resumes an interrupted run.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryPlan {
    Fresh,
    Resume(Box<ExecutionState>),
}

impl RecoveryPlan {
    /// Inspect persisted state once, at process entry.
    ///
    /// An active state updated within `window` is resumed. Anything else
    /// persisted (stale, finished or stopped) is cleared.
    pub fn detect(store: &StateStore, window: Duration, now: DateTime<Utc>) -> Self {
        let Some(state) = store.load() else {
            debug!("No persisted run state");
            return Self::Fresh;
        };

        if state.is_recoverable(now, window) {
            info!(
                "Found interrupted run from {} (last update {}), resuming",
                state.start_time, state.last_update_time
            );
            return Self::Resume(Box::new(state));
        }

        if state.is_active() {
            warn!(
                "Discarding stale run state (last update {}, window {}s)",
                state.last_update_time,
                window.as_secs()
            );
        } else {
            debug!("Removing leftover state of a finished run");
        }
        store.clear();
        Self::Fresh
    }

    pub fn is_recovering(&self) -> bool {
        matches!(self, Self::Resume(_))
    }
}

/// Runs the pipeline.
pub struct Orchestrator {
    context: RunContext,
    recovery: RecoveryPlan,
    handlers: Vec<Box<dyn TaskHandler>>,
}

impl Orchestrator {
    pub fn new(context: RunContext, recovery: RecoveryPlan) -> Self {
        Self {
            context,
            recovery,
            handlers: default_handlers(),
        }
    }

    /// Replace the handler registered for `handler.id()`
    pub fn with_handler(mut self, handler: Box<dyn TaskHandler>) -> Self {
        self.handlers.retain(|h| h.id() != handler.id());
        self.handlers.push(handler);
        self
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery.is_recovering()
    }

    /// Run every selected task in pipeline order.
    ///
    /// A resumed run uses the selection recorded by the interrupted run.
    pub fn run_all(
        &mut self,
        selection: &TaskSelection,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> RunSummary {
        let recovered = match std::mem::replace(&mut self.recovery, RecoveryPlan::Fresh) {
            RecoveryPlan::Resume(state) => Some(*state),
            RecoveryPlan::Fresh => None,
        };
        let recovering = recovered.is_some();

        let state = match recovered {
            Some(mut state) => {
                if state.selection() != *selection {
                    info!(
                        "Resuming with the interrupted run's selection ({}) instead of ({})",
                        state.selection(),
                        selection
                    );
                }
                state.is_running = true;
                state.error_message = None;
                state
            }
            None => ExecutionState::new(selection),
        };
        let pipeline: Vec<TaskId> = state.selection().iter().collect();

        let mut journal = RunJournal::new(
            self.context.store.clone(),
            state,
            self.context.config.heartbeat_interval(),
        );
        let opening = if recovering {
            format!("Resuming interrupted run: {}", journal.state().selection())
        } else {
            format!("Starting run: {}", journal.state().selection())
        };
        info!("{}", opening);
        journal.log(opening.clone());
        journal.save();
        progress(ProgressEvent::Status(opening));

        let guard = SleepGuard::acquire(self.context.services.inhibitor.as_mut());

        let mut machine = RunStateMachine::new(pipeline.len());
        let total_weight: u32 = pipeline.iter().map(|t| t.weight()).sum::<u32>().max(1);
        let percent = |weight: u32| f64::from(weight) * 100.0 / f64::from(total_weight);
        let mut done_weight = 0u32;
        let mut outcomes: Vec<TaskOutcome> = Vec::with_capacity(pipeline.len());
        let mut cancelled = false;

        for (index, &task) in pipeline.iter().enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                warn!("Cancellation requested; {} task(s) will not start", pipeline.len() - index);
                for &remaining in &pipeline[index..] {
                    let outcome = TaskOutcome::begin(remaining).skipped("cancelled before start");
                    emit_task(progress, &outcome);
                    outcomes.push(outcome);
                }
                break;
            }

            if let Err(e) = machine.start_task(index) {
                error!("Run state machine rejected {}: {}", task, e);
            }

            if recovering && journal.state().is_task_completed(task) {
                let outcome = TaskOutcome::begin(task).skipped("completed before restart");
                journal.log(format!("{}: completed before restart", task));
                done_weight += task.weight();
                emit_task(progress, &outcome);
                outcomes.push(outcome);
                continue;
            }

            info!("Starting task {} ({}/{})", task, index + 1, pipeline.len());
            progress(ProgressEvent::Task {
                task_id: task,
                status: TaskStatus::Running,
                message: task.description().to_string(),
                duration: Duration::ZERO,
            });
            journal.log(format!("Starting {}", task));
            journal.save();

            let span = ProgressSpan::new(percent(done_weight), percent(task.weight()));
            let outcome = match self.handlers.iter_mut().find(|h| h.id() == task) {
                Some(handler) => {
                    // Field-level borrows: the sleep guard holds the inhibitor
                    let mut ctx = TaskContext {
                        config: &self.context.config,
                        runner: self.context.services.runner.as_ref(),
                        inventory: self.context.services.inventory.as_ref(),
                        agent: self.context.services.agent.as_ref(),
                        cancel,
                        recovering,
                        journal: &mut journal,
                        progress: &mut *progress,
                        span,
                        engine: RetryEngine::new(),
                    };
                    run_isolated(handler.as_mut(), task, &mut ctx)
                }
                None => TaskOutcome::begin(task).error("no handler registered for this task"),
            };

            if outcome.status.is_completed() {
                journal.state_mut().mark_task_completed(task);
            }
            if outcome.requires_restart {
                journal.state_mut().requires_restart = true;
            }
            journal.log(format!("{}: {} - {}", task, outcome.status, outcome.message));
            journal.save();

            done_weight += task.weight();
            emit_task(progress, &outcome);
            progress(ProgressEvent::Progress {
                message: format!("{} finished", task.description()),
                percentage: percent(done_weight).round().min(100.0) as u8,
            });
            outcomes.push(outcome);
        }

        // Cancelled while the last task was running
        cancelled |= cancel.is_cancelled();

        let ended = if cancelled {
            machine.abort()
        } else {
            machine.complete()
        };
        match ended {
            Ok(phase) => info!("Run {}", phase),
            Err(e) => error!("Run state machine: {}", e),
        }

        // Includes restarts requested before an interruption
        let restart_pending = journal.state().requires_restart;
        let apply_released = cancelled && journal.state().driver_update.has_released_apply();
        if apply_released {
            let message = "cancelled while the driver apply kept running";
            warn!("Run {}; keeping state so the next run reattaches", message);
            journal.state_mut().error_message = Some(message.to_string());
            journal.log(format!("Run {}", message));
            journal.save();
        } else {
            if cancelled {
                journal.state_mut().mark_stopped("cancelled by operator");
                journal.log("Run cancelled; persisted state abandoned");
            } else {
                journal.state_mut().mark_complete();
            }
            journal.clear();
        }
        drop(guard);

        let mut summary = RunSummary::from_outcomes(outcomes, cancelled);
        summary.requires_restart |= restart_pending;
        let verdict = match summary.verdict() {
            SummaryVerdict::AllSucceeded => "All tasks succeeded",
            SummaryVerdict::CompletedWithIssues if apply_released => {
                "Run cancelled; run again to resume the driver update"
            }
            SummaryVerdict::CompletedWithIssues if cancelled => "Run cancelled",
            SummaryVerdict::CompletedWithIssues => "Completed with warnings or errors",
        };
        progress(ProgressEvent::Status(verdict.to_string()));
        summary
    }
}

fn emit_task(progress: &mut dyn FnMut(ProgressEvent), outcome: &TaskOutcome) {
    progress(ProgressEvent::Task {
        task_id: outcome.task_id,
        status: outcome.status,
        message: outcome.message.clone(),
        duration: outcome.duration(),
    });
}

/// Run one handler, turning errors and panics into an `Error` outcome
fn run_isolated(
    handler: &mut dyn TaskHandler,
    task: TaskId,
    ctx: &mut TaskContext<'_>,
) -> TaskOutcome {
    let started = TaskOutcome::begin(task);
    match panic::catch_unwind(AssertUnwindSafe(|| handler.run(ctx))) {
        Ok(Ok(outcome)) => {
            let outcome = outcome.for_task(task);
            match check_task_transition(TaskStatus::Running, outcome.status) {
                Ok(()) => outcome,
                Err(e) => {
                    error!("{} returned an unfinished outcome: {}", task, e);
                    started.error(format!("task ended without a result ({})", outcome.status))
                }
            }
        }
        Ok(Err(e)) => {
            error!("{} failed: {:#}", task, e);
            started.error(format!("{:#}", e))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("{} panicked: {}", task, message);
            started.error(format!("task panicked: {}", message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

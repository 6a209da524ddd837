//! Management agent actions: a composite task with one sub-outcome per action.
//!
//! Actions run in configured order with a cool-down between them. Each action
//! is a single attempt; its result is recorded and the next action runs
//! regardless. The task is Success when every action succeeded, Error when
//! none did and Warning otherwise.

use super::{HeartbeatHooks, TaskContext, TaskHandler};
use crate::agent::AgentActionOperation;
use crate::outcome::{SubTaskOutcome, TaskOutcome};
use crate::retry::RetryPolicy;
use crate::types::{TaskId, TaskStatus};

pub struct AgentActionsTask;

impl TaskHandler for AgentActionsTask {
    fn id(&self) -> TaskId {
        TaskId::AgentActions
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<TaskOutcome> {
        let config = ctx.config;
        let settings = &config.agent;
        let outcome = TaskOutcome::begin(self.id());

        if settings.actions.is_empty() {
            return Ok(outcome.skipped("no agent actions configured"));
        }

        let total = settings.actions.len();
        let policy = RetryPolicy::single_attempt(settings.timeout());
        let mut sub_tasks = Vec::with_capacity(total);
        let mut attempts = 0;

        for (index, action) in settings.actions.iter().enumerate() {
            if index > 0 && !settings.cooldown().is_zero() {
                ctx.status(format!(
                    "Waiting {}s before the next agent action",
                    settings.cooldown_secs
                ));
                if !ctx.cancel.sleep(settings.cooldown()) {
                    break;
                }
            }
            if ctx.cancel.is_cancelled() {
                break;
            }

            ctx.report(
                format!("Triggering {} ({}/{})", action.name, index + 1, total),
                (index * 100 / total) as u8,
            );

            let agent = ctx.agent;
            let cancel = ctx.cancel;
            let mut hooks = HeartbeatHooks::new(ctx.journal);
            let mut operation = AgentActionOperation::new(agent, action, &mut hooks);
            let result =
                ctx.engine
                    .execute(self.id(), &mut operation, &settings.exit_codes, &policy, cancel);

            attempts += result.attempts;
            ctx.log(format!("Agent action {}: {} ({})", action.id, result.status, result.message));
            sub_tasks.push(SubTaskOutcome::from_outcome(&action.name, &result));
        }

        for action in settings.actions.iter().skip(sub_tasks.len()) {
            sub_tasks.push(SubTaskOutcome::new(
                &action.name,
                TaskStatus::Skipped,
                "cancelled before start",
            ));
        }

        let succeeded = sub_tasks
            .iter()
            .filter(|s| s.status == TaskStatus::Success)
            .count();
        ctx.report("Agent actions finished", 100);

        let outcome = if succeeded == total {
            outcome.success(format!("All {} agent actions triggered", total))
        } else if succeeded == 0 {
            outcome.error(format!("None of {} agent actions succeeded", total))
        } else {
            outcome.warning(format!(
                "{} of {} agent actions succeeded",
                succeeded, total
            ))
        };
        Ok(outcome.with_attempts(attempts).with_sub_tasks(sub_tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::tasks::testing::*;
    use std::time::Duration;

    fn run_with_codes(codes: &[i32]) -> TaskOutcome {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = fast_config(dir.path());
        let mut journal = journal(dir.path());
        let agent = ScriptedAgent::default();
        agent.codes.borrow_mut().extend(codes.iter().copied());
        let (result, _) = run_handler(
            &mut AgentActionsTask,
            &config,
            &ScriptedRunner::default(),
            &FixedInventory::compliant(),
            &agent,
            &mut journal,
            &CancelToken::new(),
            false,
        );
        assert_eq!(agent.triggered.borrow().len(), config.agent.actions.len());
        result.expect("agent actions")
    }

    #[test]
    fn test_all_actions_succeed() {
        let outcome = run_with_codes(&[0, 0, 0, 0]);
        assert_eq!(outcome.status, TaskStatus::Success);
        assert_eq!(outcome.sub_tasks.len(), 4);
        assert_eq!(outcome.attempts, 4);
    }

    #[test]
    fn test_partial_failure_is_warning() {
        let outcome = run_with_codes(&[0, 1, 0, 0]);
        assert_eq!(outcome.status, TaskStatus::Warning);
        assert_eq!(outcome.sub_tasks[1].status, TaskStatus::Error);
        assert_eq!(outcome.sub_tasks[1].exit_code, Some(1));
        assert!(outcome.message.contains("3 of 4"));
    }

    #[test]
    fn test_all_failures_is_error() {
        let outcome = run_with_codes(&[2, 2, 2, 2]);
        assert_eq!(outcome.status, TaskStatus::Error);
    }

    #[test]
    fn test_cancel_during_cooldown_skips_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = fast_config(dir.path());
        config.agent.cooldown_secs = 30;
        let mut journal = journal(dir.path());
        let agent = ScriptedAgent::default();
        let cancel = CancelToken::new();

        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });
        let (result, _) = run_handler(
            &mut AgentActionsTask,
            &config,
            &ScriptedRunner::default(),
            &FixedInventory::compliant(),
            &agent,
            &mut journal,
            &cancel,
            false,
        );
        canceller.join().expect("canceller");

        let outcome = result.expect("agent actions");
        assert_eq!(agent.triggered.borrow().len(), 1);
        assert_eq!(outcome.status, TaskStatus::Warning);
        assert_eq!(outcome.sub_tasks.len(), 4);
        assert!(outcome.sub_tasks[1..]
            .iter()
            .all(|s| s.status == TaskStatus::Skipped));
    }

    #[test]
    fn test_no_actions_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = fast_config(dir.path());
        config.agent.actions.clear();
        let mut journal = journal(dir.path());
        let (result, _) = run_handler(
            &mut AgentActionsTask,
            &config,
            &ScriptedRunner::default(),
            &FixedInventory::compliant(),
            &ScriptedAgent::default(),
            &mut journal,
            &CancelToken::new(),
            false,
        );
        assert_eq!(result.expect("agent actions").status, TaskStatus::Skipped);
    }
}

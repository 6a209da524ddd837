//! Management agent action triggers
//!
//! The agent exposes named actions (policy retrieval, inventory cycles, ...)
//! that are fired one at a time. The trigger is a seam so runs can be tested
//! without an agent installed.

use crate::cancel::CancelToken;
use crate::command_runner::{CommandSpec, ProcessOutput, ProcessRunner, RunHooks};
use crate::config::AgentAction;
use crate::error::Result;
use crate::retry::Operation;
use std::sync::Arc;
use std::time::Duration;

/// Fires one agent action and reports how it ended.
pub trait AgentActionTrigger {
    fn trigger(
        &self,
        action_id: &str,
        timeout: Duration,
        cancel: &CancelToken,
        hooks: &mut dyn RunHooks,
    ) -> Result<ProcessOutput>;
}

/// Triggers actions by running a configured command with `{action}` filled in.
pub struct CommandAgentTrigger {
    command: CommandSpec,
    runner: Arc<dyn ProcessRunner>,
}

impl CommandAgentTrigger {
    pub fn new(command: CommandSpec, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { command, runner }
    }

    /// Command line for `action_id`
    pub fn command_for(&self, action_id: &str) -> CommandSpec {
        self.command.render(&[("action", action_id)])
    }
}

impl AgentActionTrigger for CommandAgentTrigger {
    fn trigger(
        &self,
        action_id: &str,
        timeout: Duration,
        cancel: &CancelToken,
        hooks: &mut dyn RunHooks,
    ) -> Result<ProcessOutput> {
        let request = self.command_for(action_id).to_request(timeout);
        self.runner.run(&request, cancel, hooks)
    }
}

/// Adapts one agent action to the retry engine.
pub struct AgentActionOperation<'a> {
    trigger: &'a dyn AgentActionTrigger,
    action: &'a AgentAction,
    hooks: &'a mut dyn RunHooks,
}

impl<'a> AgentActionOperation<'a> {
    pub fn new(
        trigger: &'a dyn AgentActionTrigger,
        action: &'a AgentAction,
        hooks: &'a mut dyn RunHooks,
    ) -> Self {
        Self {
            trigger,
            action,
            hooks,
        }
    }
}

impl Operation for AgentActionOperation<'_> {
    fn name(&self) -> &str {
        &self.action.name
    }

    fn invoke(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<ProcessOutput> {
        self.trigger
            .trigger(&self.action.id, timeout, cancel, &mut *self.hooks)
    }
}

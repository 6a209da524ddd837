//! Policy refresh: one retried invocation of the configured refresh tool.

use super::{TaskContext, TaskHandler};
use crate::outcome::TaskOutcome;
use crate::types::TaskId;

pub struct PolicyRefreshTask;

impl TaskHandler for PolicyRefreshTask {
    fn id(&self) -> TaskId {
        TaskId::PolicyRefresh
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<TaskOutcome> {
        let config = ctx.config;
        let settings = &config.policy_refresh;
        let request = settings.command.to_request(settings.retry.timeout);
        ctx.report("Refreshing machine policy", 0);

        let report = ctx.run_with_retry(
            self.id(),
            "Policy refresh",
            request,
            &settings.exit_codes,
            &settings.retry,
        );
        ctx.log(format!(
            "Policy refresh: {} ({})",
            report.outcome.status, report.outcome.message
        ));
        ctx.report("Policy refresh finished", 100);
        Ok(report.outcome)
    }
}

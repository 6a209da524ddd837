//! Baseline inventory: record what the machine looked like before setup.

use super::{TaskContext, TaskHandler};
use crate::outcome::TaskOutcome;
use crate::types::TaskId;

pub struct BaselineInventoryTask;

impl TaskHandler for BaselineInventoryTask {
    fn id(&self) -> TaskId {
        TaskId::BaselineInventory
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<TaskOutcome> {
        let outcome = TaskOutcome::begin(self.id());
        ctx.report("Collecting hardware and OS facts", 0);

        let targets = ctx.probe_targets();
        let snapshot = ctx.inventory.snapshot(&targets, ctx.cancel);
        for line in snapshot.to_string().lines() {
            ctx.log(format!("inventory: {}", line.trim()));
        }
        ctx.report("Inventory collected", 100);

        let summary = match snapshot.joined_domain() {
            Some(domain) => format!("{}, joined to {}", snapshot.hardware, domain),
            None => snapshot.hardware.to_string(),
        };

        if snapshot.problems.is_empty() {
            Ok(outcome.success(summary))
        } else {
            Ok(outcome.warning(format!(
                "{}; incomplete: {}",
                summary,
                snapshot.problems.join("; ")
            )))
        }
    }
}

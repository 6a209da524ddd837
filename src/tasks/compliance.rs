//! Compliance verification: the machine meets the baseline after setup.
//!
//! Each enabled check becomes a sub-outcome. A failed required check makes
//! the task Error; a pending reboot alone makes it Warning and asks for a
//! restart.

use super::{TaskContext, TaskHandler};
use crate::config::ComplianceConfig;
use crate::inventory::InventorySnapshot;
use crate::outcome::{SubTaskOutcome, TaskOutcome};
use crate::types::{TaskId, TaskStatus};

pub struct ComplianceTask;

impl TaskHandler for ComplianceTask {
    fn id(&self) -> TaskId {
        TaskId::ComplianceVerification
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> anyhow::Result<TaskOutcome> {
        let outcome = TaskOutcome::begin(self.id());
        ctx.report("Verifying compliance baseline", 0);

        let targets = ctx.probe_targets();
        let snapshot = ctx.inventory.snapshot(&targets, ctx.cancel);
        let checks = evaluate(&ctx.config.compliance, &snapshot);
        for check in &checks {
            ctx.log(format!("compliance: {} {} ({})", check.name, check.status, check.message));
        }
        ctx.report("Compliance checks finished", 100);

        let failed: Vec<&str> = checks
            .iter()
            .filter(|c| c.status == TaskStatus::Error)
            .map(|c| c.name.as_str())
            .collect();

        let outcome = if !failed.is_empty() {
            outcome.error(format!(
                "{} of {} checks failed: {}",
                failed.len(),
                checks.len(),
                failed.join(", ")
            ))
        } else if snapshot.pending_reboot {
            outcome
                .warning("Baseline met; a reboot is pending")
                .with_restart(true)
        } else {
            outcome.success(format!("All {} checks passed", checks.len()))
        };
        Ok(outcome.with_sub_tasks(checks))
    }
}

/// Judge a snapshot against the configured baseline
pub fn evaluate(config: &ComplianceConfig, snapshot: &InventorySnapshot) -> Vec<SubTaskOutcome> {
    let mut checks = Vec::new();

    if config.require_activation {
        checks.push(match snapshot.os_activated {
            Some(true) => SubTaskOutcome::new("OS activation", TaskStatus::Success, "activated"),
            Some(false) => SubTaskOutcome::new("OS activation", TaskStatus::Error, "not activated"),
            None => SubTaskOutcome::new("OS activation", TaskStatus::Error, "could not be determined"),
        });
    }

    if config.require_domain {
        checks.push(match &snapshot.domain {
            Some(Some(name)) => {
                SubTaskOutcome::new("Domain membership", TaskStatus::Success, format!("joined to {}", name))
            }
            Some(None) => SubTaskOutcome::new("Domain membership", TaskStatus::Error, "not joined"),
            None => {
                SubTaskOutcome::new("Domain membership", TaskStatus::Error, "could not be determined")
            }
        });
    }

    checks.push(match snapshot.free_disk_gb() {
        Some(gb) if gb >= config.min_free_disk_gb => {
            SubTaskOutcome::new("Free disk space", TaskStatus::Success, format!("{} GB free", gb))
        }
        Some(gb) => SubTaskOutcome::new(
            "Free disk space",
            TaskStatus::Error,
            format!("{} GB free, {} GB required", gb, config.min_free_disk_gb),
        ),
        None => SubTaskOutcome::new("Free disk space", TaskStatus::Error, "could not be determined"),
    });

    if config.require_network {
        checks.push(if snapshot.network_reachable {
            SubTaskOutcome::new("Network", TaskStatus::Success, format!("{} reachable", config.reachability_host))
        } else {
            SubTaskOutcome::new("Network", TaskStatus::Error, format!("{} unreachable", config.reachability_host))
        });
    }

    checks.push(if snapshot.pending_reboot {
        SubTaskOutcome::new("Pending reboot", TaskStatus::Warning, "reboot required")
    } else {
        SubTaskOutcome::new("Pending reboot", TaskStatus::Success, "none")
    });

    checks
}

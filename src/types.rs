//! Core enums shared across the pipeline
//!
//! Task identifiers, task statuses and exit-code classes are proper Rust enums
//! so the pipeline order and classification tables are checked exhaustively.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use strum::{Display, EnumIter, EnumString};

/// One discrete unit of the fixed setup pipeline.
///
/// Declaration order IS pipeline order: later tasks rely on the side effects
/// of earlier ones (the driver update expects refreshed policy, verification
/// expects everything else to have run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskId {
    /// Collect hardware/OS/domain facts before changing anything
    BaselineInventory,
    /// Refresh machine policy
    PolicyRefresh,
    /// Trigger management-agent actions (composite)
    AgentActions,
    /// Scan for and apply vendor driver/firmware updates (long-running)
    DriverUpdate,
    /// Verify the machine meets the compliance baseline
    ComplianceVerification,
}

impl TaskId {
    /// All tasks in pipeline order
    pub const fn pipeline() -> &'static [Self] {
        &[
            Self::BaselineInventory,
            Self::PolicyRefresh,
            Self::AgentActions,
            Self::DriverUpdate,
            Self::ComplianceVerification,
        ]
    }

    /// Human-readable name for progress output
    pub const fn description(self) -> &'static str {
        match self {
            Self::BaselineInventory => "Baseline inventory",
            Self::PolicyRefresh => "Policy refresh",
            Self::AgentActions => "Management agent actions",
            Self::DriverUpdate => "Driver and firmware update",
            Self::ComplianceVerification => "Compliance verification",
        }
    }

    /// Relative share of overall progress this task represents
    pub const fn weight(self) -> u32 {
        match self {
            Self::BaselineInventory => 5,
            Self::PolicyRefresh => 10,
            Self::AgentActions => 20,
            Self::DriverUpdate => 55,
            Self::ComplianceVerification => 10,
        }
    }
}

/// Lifecycle of one task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[derive(Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Success,
    Warning,
    Error,
    Skipped,
}

impl TaskStatus {
    /// Returns true once the task can no longer change
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Warning | Self::Error | Self::Skipped
        )
    }

    /// Returns true if the task did its work (possibly with warnings)
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Success | Self::Warning)
    }
}

/// How a tool's exit code is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExitClass {
    Success,
    SuccessRebootRequired,
    /// Tool ran and had nothing to do
    NoOpSuccess,
    Retryable,
    Fatal,
}

/// Which tasks a run includes. Iteration is always in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskSelection(BTreeSet<TaskId>);

impl TaskSelection {
    /// Every task in the pipeline
    pub fn all() -> Self {
        Self(TaskId::pipeline().iter().copied().collect())
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn only(tasks: &[TaskId]) -> Self {
        Self(tasks.iter().copied().collect())
    }

    /// Parse a comma-separated list such as `policy_refresh,driver_update`
    pub fn parse_list(list: &str) -> Result<Self, String> {
        let mut selection = Self::none();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let task: TaskId = name
                .parse()
                .map_err(|_| format!("unknown task '{}'", name))?;
            selection.insert(task);
        }
        if selection.is_empty() {
            return Err("no tasks selected".to_string());
        }
        Ok(selection)
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.0.contains(&task)
    }

    pub fn insert(&mut self, task: TaskId) {
        self.0.insert(task);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Selected tasks in pipeline order
    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for TaskSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|t| t.to_string()).collect();
        write!(f, "{}", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_pipeline_matches_declaration_order() {
        let declared: Vec<TaskId> = TaskId::iter().collect();
        assert_eq!(declared.as_slice(), TaskId::pipeline());

        let mut sorted = declared.clone();
        sorted.sort();
        assert_eq!(sorted, declared);
    }

    #[test]
    fn test_task_id_string_roundtrip() {
        for task in TaskId::iter() {
            let parsed: TaskId = task.to_string().parse().expect("should parse");
            assert_eq!(parsed, task);
        }
        assert_eq!(TaskId::DriverUpdate.to_string(), "driver_update");
    }

    #[test]
    fn test_weights_sum_to_hundred() {
        let total: u32 = TaskId::iter().map(TaskId::weight).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_final_statuses() {
        assert!(!TaskStatus::Pending.is_final());
        assert!(!TaskStatus::Running.is_final());
        assert!(TaskStatus::Skipped.is_final());
        assert!(TaskStatus::Warning.is_completed());
        assert!(!TaskStatus::Error.is_completed());
    }

    #[test]
    fn test_selection_parse_and_order() {
        let selection =
            TaskSelection::parse_list("compliance_verification, policy_refresh").expect("parse");
        let order: Vec<TaskId> = selection.iter().collect();
        assert_eq!(
            order,
            vec![TaskId::PolicyRefresh, TaskId::ComplianceVerification]
        );
        assert_eq!(selection.to_string(), "policy_refresh,compliance_verification");
        assert!(TaskSelection::parse_list("reboot_now").is_err());
        assert!(TaskSelection::parse_list(" , ").is_err());
        assert_eq!(TaskSelection::all().len(), 5);
    }
}

//! Per-tool exit code classification
//!
//! Every wrapped tool has its own table. Codes missing from a table are
//! `Fatal`, so a tool upgrade that introduces new codes fails loudly instead
//! of being retried or reported as success.

use crate::types::ExitClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mapping from exit code to [`ExitClass`] for one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCodeTable {
    /// Tool name, used in log lines only
    pub tool: String,
    /// Explicitly classified codes
    #[serde(default)]
    pub codes: BTreeMap<i32, ExitClass>,
}

impl ExitCodeTable {
    /// Create an empty table (everything but explicit entries is fatal)
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            codes: BTreeMap::new(),
        }
    }

    /// Classify a single code
    pub fn with(mut self, code: i32, class: ExitClass) -> Self {
        self.codes.insert(code, class);
        self
    }

    /// Classify several codes the same way
    pub fn with_all(mut self, codes: &[i32], class: ExitClass) -> Self {
        for &code in codes {
            self.codes.insert(code, class);
        }
        self
    }

    /// Classify an exit code. Unmapped codes are `Fatal`.
    pub fn classify(&self, code: i32) -> ExitClass {
        self.codes.get(&code).copied().unwrap_or(ExitClass::Fatal)
    }

    /// Codes classified as retryable, in ascending order
    pub fn retryable_codes(&self) -> Vec<i32> {
        self.codes
            .iter()
            .filter(|(_, class)| **class == ExitClass::Retryable)
            .map(|(code, _)| *code)
            .collect()
    }

    /// Policy refresh tool: 0 ok, 1 transient failure (backend unreachable)
    pub fn policy_refresh() -> Self {
        Self::new("policy-refresh")
            .with(0, ExitClass::Success)
            .with(1, ExitClass::Retryable)
    }

    /// Vendor update tool in scan mode.
    ///
    /// `no_op_code` is the "no updates available" code for the installed
    /// tool version.
    pub fn driver_scan(no_op_code: i32) -> Self {
        Self::new("driver-scan")
            .with(0, ExitClass::Success)
            .with_all(&[5, 7, 8], ExitClass::Retryable)
            .with(no_op_code, ExitClass::NoOpSuccess)
    }

    /// Vendor update tool in apply mode
    pub fn driver_apply(no_op_code: i32) -> Self {
        Self::new("driver-apply")
            .with(0, ExitClass::Success)
            .with_all(&[1, 5], ExitClass::SuccessRebootRequired)
            .with(no_op_code, ExitClass::NoOpSuccess)
    }

    /// Management agent action trigger: only 0 is accepted
    pub fn agent_action() -> Self {
        Self::new("agent-action").with(0, ExitClass::Success)
    }
}

//! Property-Based Tests for imageprep
//!
//! These tests verify:
//! - Every exit code classifies to exactly one class; unmapped codes are Fatal
//! - Backoff delays never decrease and never exceed the cap
//! - Retry attempts never exceed max_retries + 1
//! - Task selections round-trip through their text form

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use imageprep::cancel::CancelToken;
use imageprep::command_runner::ProcessOutput;
use imageprep::exit_codes::ExitCodeTable;
use imageprep::retry::{Operation, RetryEngine, RetryPolicy};
use imageprep::types::{ExitClass, TaskId, TaskSelection, TaskStatus};

// =============================================================================
// Exit Code Classification
// =============================================================================

fn exit_class_strategy() -> impl Strategy<Value = ExitClass> {
    prop_oneof![
        Just(ExitClass::Success),
        Just(ExitClass::SuccessRebootRequired),
        Just(ExitClass::NoOpSuccess),
        Just(ExitClass::Retryable),
        Just(ExitClass::Fatal),
    ]
}

fn table_strategy() -> impl Strategy<Value = BTreeMap<i32, ExitClass>> {
    prop::collection::btree_map(-5i32..600, exit_class_strategy(), 0..20)
}

proptest! {
    /// Mapped codes classify exactly as configured
    #[test]
    fn mapped_codes_classify_as_configured(mapping in table_strategy()) {
        let table = mapping
            .iter()
            .fold(ExitCodeTable::new("tool"), |t, (code, class)| t.with(*code, *class));
        for (code, class) in &mapping {
            prop_assert_eq!(table.classify(*code), *class);
        }
    }

    /// Codes absent from the table are Fatal
    #[test]
    fn unmapped_codes_are_fatal(mapping in table_strategy(), code in any::<i32>()) {
        prop_assume!(!mapping.contains_key(&code));
        let table = mapping
            .iter()
            .fold(ExitCodeTable::new("tool"), |t, (code, class)| t.with(*code, *class));
        prop_assert_eq!(table.classify(code), ExitClass::Fatal);
    }

    /// The retryable listing matches what classify says
    #[test]
    fn retryable_codes_agree_with_classify(mapping in table_strategy()) {
        let table = mapping
            .iter()
            .fold(ExitCodeTable::new("tool"), |t, (code, class)| t.with(*code, *class));
        for code in table.retryable_codes() {
            prop_assert_eq!(table.classify(code), ExitClass::Retryable);
        }
    }
}

// =============================================================================
// Backoff
// =============================================================================

fn policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (0u32..12, 0u64..5_000, 1.0f64..4.0, 0u64..60_000).prop_map(
        |(max_retries, initial_ms, multiplier, max_ms)| RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(initial_ms),
            backoff_multiplier: multiplier,
            max_delay: Duration::from_millis(max_ms),
            timeout: Duration::from_secs(60),
        },
    )
}

proptest! {
    /// Delays are non-decreasing and capped at max_delay
    #[test]
    fn backoff_is_monotonic_and_capped(policy in policy_strategy()) {
        let schedule = policy.delay_schedule();
        prop_assert_eq!(schedule.len(), policy.max_retries as usize);
        for delay in &schedule {
            prop_assert!(*delay <= policy.max_delay);
        }
        for pair in schedule.windows(2) {
            prop_assert!(pair[0] <= pair[1]);
        }
    }

    /// next_delay never shrinks a delay that is already within the cap
    #[test]
    fn next_delay_never_shrinks(policy in policy_strategy(), current_ms in 0u64..60_000) {
        let current = Duration::from_millis(current_ms).min(policy.max_delay);
        let next = policy.next_delay(current);
        prop_assert!(next >= current);
        prop_assert!(next <= policy.max_delay);
    }
}

// =============================================================================
// Retry Engine bounds
// =============================================================================

struct AlwaysExits(i32, u32);

impl Operation for AlwaysExits {
    fn name(&self) -> &str {
        "always"
    }

    fn invoke(&mut self, _timeout: Duration, _cancel: &CancelToken) -> imageprep::Result<ProcessOutput> {
        self.1 += 1;
        Ok(ProcessOutput::exited(self.0))
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Attempts stay within 1..=max_retries+1 and match invocations
    #[test]
    fn attempts_are_bounded(
        max_retries in 0u32..5,
        class in exit_class_strategy(),
    ) {
        let table = ExitCodeTable::new("tool").with(4, class);
        let policy = RetryPolicy {
            max_retries,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
            timeout: Duration::from_secs(1),
        };
        let mut operation = AlwaysExits(4, 0);
        let outcome = RetryEngine::new().execute(
            TaskId::PolicyRefresh,
            &mut operation,
            &table,
            &policy,
            &CancelToken::new(),
        );

        prop_assert_eq!(outcome.attempts, operation.1);
        prop_assert!(outcome.attempts >= 1);
        prop_assert!(outcome.attempts <= max_retries + 1);
        let expected = match class {
            ExitClass::Retryable | ExitClass::Fatal => TaskStatus::Error,
            _ => TaskStatus::Success,
        };
        prop_assert_eq!(outcome.status, expected);
    }
}

// =============================================================================
// Task selection
// =============================================================================

/// Non-empty subsets of the pipeline
fn selection_strategy() -> impl Strategy<Value = BTreeSet<TaskId>> {
    prop::sample::subsequence(TaskId::pipeline().to_vec(), 1..=TaskId::pipeline().len())
        .prop_map(|tasks| tasks.into_iter().collect())
}

proptest! {
    /// Display then parse_list yields the same selection
    #[test]
    fn selection_roundtrip(tasks in selection_strategy()) {
        let tasks: Vec<TaskId> = tasks.into_iter().collect();
        let selection = TaskSelection::only(&tasks);
        let parsed = TaskSelection::parse_list(&selection.to_string()).expect("parse");
        prop_assert_eq!(parsed, selection);
    }

    /// Iteration always follows pipeline order
    #[test]
    fn selection_iterates_in_pipeline_order(tasks in selection_strategy()) {
        let tasks: Vec<TaskId> = tasks.into_iter().rev().collect();
        let ordered: Vec<TaskId> = TaskSelection::only(&tasks).iter().collect();
        let expected: Vec<TaskId> = TaskId::pipeline()
            .iter()
            .copied()
            .filter(|t| tasks.contains(t))
            .collect();
        prop_assert_eq!(ordered, expected);
    }
}

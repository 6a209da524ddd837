//! Execution State Store integration tests
//!
//! - Save/load round trip through the JSON document
//! - Missing, truncated and corrupt documents load as `None`
//! - Recoverability depends on the freshness window
//! - Recovery detection clears what it will not resume

use std::fs;
use std::time::Duration;

use chrono::Utc;
use imageprep::execution_state::{DriverPhase, ExecutionState, StateStore, STATE_FILE_NAME};
use imageprep::orchestrator::RecoveryPlan;
use imageprep::types::{TaskId, TaskSelection};

const WINDOW: Duration = Duration::from_secs(30 * 60);

fn sample_state() -> ExecutionState {
    let selection = TaskSelection::only(&[TaskId::PolicyRefresh, TaskId::DriverUpdate]);
    let mut state = ExecutionState::new(&selection);
    state.mark_task_completed(TaskId::PolicyRefresh);
    state.driver_update.phase = DriverPhase::Applying;
    state.driver_update.total_units = 3;
    state.driver_update.complete_unit("BIOS 1.2.3");
    state.driver_update.apply_pid = Some(4321);
    state.requires_restart = true;
    state.push_log("policy refresh done");
    state
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn saved_state_loads_back_equal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StateStore::new(dir.path());
    let mut state = sample_state();

    store.save(&mut state);
    let loaded = store.load().expect("state should load");

    assert_eq!(loaded, state);
    assert_eq!(loaded.selection(), state.selection());
    assert!(loaded.is_task_completed(TaskId::PolicyRefresh));
    assert!(!loaded.is_task_completed(TaskId::DriverUpdate));
    assert_eq!(loaded.driver_update.completed_names, vec!["BIOS 1.2.3"]);
}

#[test]
fn save_advances_update_time() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StateStore::new(dir.path());
    let mut state = sample_state();

    store.save(&mut state);
    let first = store.load().expect("load").last_update_time;
    store.save(&mut state);
    let second = store.load().expect("load").last_update_time;
    assert!(second > first);
}

#[test]
fn missing_document_is_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(StateStore::new(dir.path()).load().is_none());
    assert!(StateStore::new(dir.path().join("never-created")).load().is_none());
}

#[test]
fn corrupt_document_is_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StateStore::new(dir.path());
    for content in ["", "{", "not json at all", "{\"start_time\": 5}", "[]"] {
        fs::write(dir.path().join(STATE_FILE_NAME), content).expect("write");
        assert!(store.load().is_none(), "content {:?} should not load", content);
    }
}

#[test]
fn truncated_document_is_none() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StateStore::new(dir.path());
    let mut state = sample_state();
    store.save(&mut state);

    let full = fs::read_to_string(store.path()).expect("read");
    fs::write(store.path(), &full[..full.len() / 2]).expect("write");
    assert!(store.load().is_none());
}

#[test]
fn clear_removes_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StateStore::new(dir.path());
    let mut state = sample_state();
    store.save(&mut state);
    assert!(store.has_active_run());

    store.clear();
    assert!(!store.path().exists());
    assert!(!store.has_active_run());
}

// =============================================================================
// Freshness window
// =============================================================================

#[test]
fn recent_active_state_is_recoverable() {
    let mut state = sample_state();
    let now = Utc::now();
    state.last_update_time = now - chrono::Duration::minutes(10);
    assert!(state.is_recoverable(now, WINDOW));
}

#[test]
fn stale_state_is_not_recoverable() {
    let mut state = sample_state();
    let now = Utc::now();
    state.last_update_time = now - chrono::Duration::minutes(45);
    assert!(!state.is_recoverable(now, WINDOW));
}

#[test]
fn completed_state_is_not_recoverable() {
    let mut state = sample_state();
    state.mark_complete();
    assert!(!state.is_recoverable(Utc::now(), WINDOW));
}

#[test]
fn detection_resumes_only_fresh_runs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StateStore::new(dir.path());
    let mut state = sample_state();
    store.save(&mut state);
    let saved_at = store.load().expect("load").last_update_time;

    let plan = RecoveryPlan::detect(&store, WINDOW, saved_at + chrono::Duration::minutes(10));
    match plan {
        RecoveryPlan::Resume(recovered) => {
            assert!(recovered.is_task_completed(TaskId::PolicyRefresh));
            assert_eq!(recovered.driver_update.phase, DriverPhase::Applying);
        }
        RecoveryPlan::Fresh => panic!("expected a resumable run"),
    }
    assert!(store.load().is_some(), "a resumable run is kept");

    let plan = RecoveryPlan::detect(&store, WINDOW, saved_at + chrono::Duration::minutes(45));
    assert_eq!(plan, RecoveryPlan::Fresh);
    assert!(store.load().is_none(), "a stale run is cleared");
}

#[test]
fn detection_clears_finished_run() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = StateStore::new(dir.path());
    let mut state = sample_state();
    state.mark_complete();
    store.save(&mut state);

    let plan = RecoveryPlan::detect(&store, WINDOW, Utc::now());
    assert!(!plan.is_recovering());
    assert!(store.load().is_none());
}

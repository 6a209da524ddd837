//! Execution State Store
//!
//! Persists a snapshot of the in-progress run so that an interrupted run
//! (crash, forced reboot, lost network share) can be recognized and partially
//! resumed by the next process.
//!
//! # Persistence rules
//!
//! - **Best effort**: `save` never fails the caller; errors are logged
//! - **Atomic replace**: written to a sibling temp file, then renamed
//! - **Tolerant reads**: missing, torn or corrupt documents load as `None`
//! - **Single run**: one document per machine, at a fixed path
//!
//! ```text
//! <cache_root>/execution_state.json   snapshot
//! <cache_root>/run.marker             PID of the process that owns the run
//! ```

use crate::process_guard::is_process_alive;
use crate::types::{TaskId, TaskSelection};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// File name of the state document inside the cache root
pub const STATE_FILE_NAME: &str = "execution_state.json";
/// Auxiliary marker written next to the state document
pub const RUN_MARKER_NAME: &str = "run.marker";
/// Program name an owning process must carry in its command line
const OWNER_PROGRAM: &str = "imageprep";
/// Messages kept in the rolling log buffer
pub const LOG_BUFFER_CAPACITY: usize = 100;

/// Phase of the long-running driver update task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverPhase {
    #[default]
    NotStarted,
    Scanning,
    Applying,
    Verifying,
    Done,
}

/// Sub-state of the driver update task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DriverUpdateState {
    pub phase: DriverPhase,
    pub total_units: u32,
    pub completed_units: u32,
    pub completed_names: Vec<String>,
    /// PID of a dispatched apply process that may outlive this run
    #[serde(default)]
    pub apply_pid: Option<u32>,
    /// Log file that apply process writes to
    #[serde(default)]
    pub apply_log: Option<PathBuf>,
}

impl DriverUpdateState {
    /// An apply was dispatched and not seen to finish; it may still be running
    pub fn has_released_apply(&self) -> bool {
        self.phase == DriverPhase::Applying && self.apply_pid.is_some()
    }

    /// Record a unit as done; repeated names are counted once
    pub fn complete_unit(&mut self, name: &str) {
        if !self.completed_names.iter().any(|n| n == name) {
            self.completed_names.push(name.to_string());
            self.completed_units = self.completed_names.len() as u32;
        }
    }

    /// Percent of units done, 0 when the total is unknown
    pub fn percent(&self) -> u8 {
        if self.total_units == 0 {
            return 0;
        }
        ((self.completed_units.min(self.total_units) * 100) / self.total_units) as u8
    }
}

/// Snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub is_running: bool,
    pub is_complete: bool,
    pub selected: BTreeMap<TaskId, bool>,
    pub completed: BTreeMap<TaskId, bool>,
    #[serde(default)]
    pub driver_update: DriverUpdateState,
    #[serde(default)]
    pub log: VecDeque<String>,
    #[serde(default)]
    pub requires_restart: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ExecutionState {
    /// Fresh state for a run starting now
    pub fn new(selection: &TaskSelection) -> Self {
        let now = Utc::now();
        Self {
            start_time: now,
            last_update_time: now,
            is_running: true,
            is_complete: false,
            selected: TaskId::pipeline()
                .iter()
                .map(|&t| (t, selection.contains(t)))
                .collect(),
            completed: TaskId::pipeline().iter().map(|&t| (t, false)).collect(),
            driver_update: DriverUpdateState::default(),
            log: VecDeque::with_capacity(LOG_BUFFER_CAPACITY),
            requires_restart: false,
            error_message: None,
        }
    }

    /// The task selection recorded for this run
    pub fn selection(&self) -> TaskSelection {
        let tasks: Vec<TaskId> = self
            .selected
            .iter()
            .filter(|(_, selected)| **selected)
            .map(|(task, _)| *task)
            .collect();
        TaskSelection::only(&tasks)
    }

    pub fn is_task_completed(&self, task: TaskId) -> bool {
        self.completed.get(&task).copied().unwrap_or(false)
    }

    pub fn mark_task_completed(&mut self, task: TaskId) {
        self.completed.insert(task, true);
    }

    /// Append to the rolling log, evicting the oldest entry when full
    pub fn push_log(&mut self, message: impl Into<String>) {
        if self.log.len() >= LOG_BUFFER_CAPACITY {
            self.log.pop_front();
        }
        self.log.push_back(message.into());
    }

    /// A run that started and has not finished
    pub fn is_active(&self) -> bool {
        self.is_running && !self.is_complete
    }

    /// Active and updated within `window` of `now`
    pub fn is_recoverable(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if !self.is_active() {
            return false;
        }
        let Ok(window) = ChronoDuration::from_std(window) else {
            return false;
        };
        let age = now - self.last_update_time;
        age >= ChronoDuration::zero() - ChronoDuration::minutes(1) && age <= window
    }

    /// Mark the run finished. Keeps `is_complete ⇒ !is_running`.
    pub fn mark_complete(&mut self) {
        self.is_complete = true;
        self.is_running = false;
    }

    /// Mark the run stopped without completing
    pub fn mark_stopped(&mut self, reason: impl Into<String>) {
        self.is_running = false;
        self.error_message = Some(reason.into());
    }

    /// Advance `last_update_time`, strictly increasing even if the clock stalls
    pub fn touch(&mut self) {
        let now = Utc::now();
        let floor = self.last_update_time + ChronoDuration::milliseconds(1);
        self.last_update_time = if now > floor { now } else { floor };
    }

    /// Structural invariants a loaded document must satisfy
    fn is_consistent(&self) -> bool {
        !(self.is_complete && self.is_running) && self.last_update_time >= self.start_time
    }
}

/// Owns the on-disk state document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    marker: PathBuf,
}

impl StateStore {
    /// Store rooted in `dir` (normally the cache root)
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            path: dir.join(STATE_FILE_NAME),
            marker: dir.join(RUN_MARKER_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `state`, advancing its update time. Never fails the caller.
    pub fn save(&self, state: &mut ExecutionState) {
        state.touch();
        if let Err(e) = self.try_save(state) {
            warn!("Failed to persist execution state to {:?}: {}", self.path, e);
        }
    }

    fn try_save(&self, state: &ExecutionState) -> crate::error::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        if state.is_running && self.owner_pid() != Some(std::process::id()) {
            fs::write(&self.marker, std::process::id().to_string())?;
        }
        debug!("Execution state saved to {:?}", self.path);
        Ok(())
    }

    /// Load the persisted state; `None` if absent, unreadable or inconsistent
    pub fn load(&self) -> Option<ExecutionState> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read execution state {:?}: {}", self.path, e);
                return None;
            }
        };

        let state: ExecutionState = match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!("Ignoring unreadable execution state {:?}: {}", self.path, e);
                return None;
            }
        };

        if !state.is_consistent() {
            warn!("Ignoring inconsistent execution state {:?}", self.path);
            return None;
        }

        Some(state)
    }

    /// Delete the document and marker. Idempotent.
    pub fn clear(&self) {
        for path in [&self.path, &self.marker, &self.path.with_extension("json.tmp")] {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {:?}: {}", path, e),
            }
        }
    }

    /// PID recorded in the run marker by the process that last saved a running state
    pub fn owner_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.marker)
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    /// A run is persisted as started and not finished
    pub fn has_active_run(&self) -> bool {
        self.load().is_some_and(|state| state.is_active())
    }

    /// PID of another live imageprep process that owns the active run.
    ///
    /// A recorded PID may have been reused after a reboot, so the owner must
    /// still be alive and still be an imageprep process.
    pub fn foreign_owner(&self) -> Option<u32> {
        let owner = self.owner_pid()?;
        if owner == std::process::id() || !is_process_alive(owner) || !self.has_active_run() {
            return None;
        }
        let cmdline = fs::read(format!("/proc/{}/cmdline", owner)).unwrap_or_default();
        String::from_utf8_lossy(&cmdline)
            .contains(OWNER_PROGRAM)
            .then_some(owner)
    }
}

/// The live state of a run plus its store, saved on a heartbeat.
#[derive(Debug)]
pub struct RunJournal {
    store: StateStore,
    state: ExecutionState,
    heartbeat: Duration,
    last_save: Option<Instant>,
}

impl RunJournal {
    pub fn new(store: StateStore, state: ExecutionState, heartbeat: Duration) -> Self {
        Self {
            store,
            state,
            heartbeat,
            last_save: None,
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ExecutionState {
        &mut self.state
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Save immediately (task transitions)
    pub fn save(&mut self) {
        self.store.save(&mut self.state);
        self.last_save = Some(Instant::now());
    }

    /// Save if the heartbeat interval has elapsed; returns whether it saved
    pub fn heartbeat(&mut self) -> bool {
        let due = self
            .last_save
            .is_none_or(|last| last.elapsed() >= self.heartbeat);
        if due {
            self.save();
        }
        due
    }

    /// Record a message in the rolling log
    pub fn log(&mut self, message: impl Into<String>) {
        self.state.push_log(message);
    }

    /// Remove the persisted document (run finished or abandoned)
    pub fn clear(&self) {
        self.store.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_active() {
        let state = ExecutionState::new(&TaskSelection::all());
        assert!(state.is_active());
        assert_eq!(state.selection(), TaskSelection::all());
        assert!(!state.is_task_completed(TaskId::PolicyRefresh));
    }

    #[test]
    fn test_mark_complete_keeps_invariant() {
        let mut state = ExecutionState::new(&TaskSelection::all());
        state.mark_complete();
        assert!(state.is_complete);
        assert!(!state.is_running);
        assert!(!state.is_active());
    }

    #[test]
    fn test_touch_is_strictly_increasing() {
        let mut state = ExecutionState::new(&TaskSelection::all());
        let mut last = state.last_update_time;
        for _ in 0..50 {
            state.touch();
            assert!(state.last_update_time > last);
            last = state.last_update_time;
        }
    }

    #[test]
    fn test_log_buffer_is_bounded() {
        let mut state = ExecutionState::new(&TaskSelection::all());
        for i in 0..(LOG_BUFFER_CAPACITY + 25) {
            state.push_log(format!("message {}", i));
        }
        assert_eq!(state.log.len(), LOG_BUFFER_CAPACITY);
        assert_eq!(state.log.front().map(String::as_str), Some("message 25"));
    }

    #[test]
    fn test_driver_units_count_once() {
        let mut driver = DriverUpdateState {
            total_units: 4,
            ..DriverUpdateState::default()
        };
        driver.complete_unit("BIOS");
        driver.complete_unit("BIOS");
        driver.complete_unit("NIC");
        assert_eq!(driver.completed_units, 2);
        assert_eq!(driver.percent(), 50);
    }

    #[test]
    fn test_foreign_owner_requires_live_imageprep_process() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path());
        let mut state = ExecutionState::new(&TaskSelection::all());
        store.save(&mut state);
        assert_eq!(store.foreign_owner(), None, "our own run is not foreign");

        let mut owner = std::process::Command::new("sh")
            .args(["-c", "sleep 30; :", "imageprep"])
            .spawn()
            .expect("spawn");
        fs::write(dir.path().join(RUN_MARKER_NAME), owner.id().to_string()).expect("marker");
        assert_eq!(store.foreign_owner(), Some(owner.id()));

        owner.kill().expect("kill");
        owner.wait().expect("wait");
        assert_eq!(store.foreign_owner(), None, "an exited owner releases the run");
    }

    #[test]
    fn test_stopped_state_is_not_recoverable() {
        let mut state = ExecutionState::new(&TaskSelection::all());
        state.mark_stopped("cancelled");
        assert!(!state.is_recoverable(Utc::now(), Duration::from_secs(1800)));
    }

    #[test]
    fn test_store_clear_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path());
        let mut state = ExecutionState::new(&TaskSelection::all());
        store.save(&mut state);
        assert_eq!(store.owner_pid(), Some(std::process::id()));

        store.clear();
        store.clear();
        assert!(store.load().is_none());
        assert!(!dir.path().join(RUN_MARKER_NAME).exists());
        assert_eq!(store.owner_pid(), None);
    }

    #[test]
    fn test_resuming_process_takes_over_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path());
        fs::write(dir.path().join(RUN_MARKER_NAME), "999999").expect("write");
        let mut state = ExecutionState::new(&TaskSelection::all());
        store.save(&mut state);
        assert_eq!(store.owner_pid(), Some(std::process::id()));
    }

    #[test]
    fn test_save_into_unwritable_location_is_swallowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file").expect("write");
        let store = StateStore::new(blocker.join("nested"));
        let mut state = ExecutionState::new(&TaskSelection::all());
        store.save(&mut state);
        assert!(store.load().is_none());
    }

    #[test]
    fn test_inconsistent_document_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path());
        let mut state = ExecutionState::new(&TaskSelection::all());
        state.is_complete = true;
        state.is_running = true;
        fs::write(store.path(), serde_json::to_string(&state).expect("json")).expect("write");
        assert!(store.load().is_none());
    }

    #[test]
    fn test_journal_heartbeat_respects_interval() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path());
        let mut journal = RunJournal::new(
            store,
            ExecutionState::new(&TaskSelection::all()),
            Duration::from_secs(3600),
        );
        assert!(journal.heartbeat());
        assert!(!journal.heartbeat());
        assert!(journal.store().has_active_run());
    }
}

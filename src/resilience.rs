//! Resilience Manager
//!
//! Imaging often starts the tool from a network share or a USB stick that can
//! vanish mid-run. Before anything else runs, the application directory is
//! copied to the local cache and the process replaces itself with the copy.
//! On exit, a detached helper removes the copy once this process is gone.
//!
//! ```text
//! <cache_root>/app/           local copy of the application directory
//! <cache_root>/app/.origin    JSON: where the copy came from and when
//! ```
//!
//! Every failure here is logged and execution continues from where it is.

use crate::config::ResilienceConfig;
use crate::error::{ImagePrepError, Result};
use crate::execution_state::StateStore;
use crate::process_guard::CommandProcessGroup;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Set in the environment of the relaunched copy; at most one relaunch per lineage
pub const RELAUNCH_ENV: &str = "IMAGEPREP_RELAUNCHED";
/// Directory inside the cache root holding the local copy
pub const APP_DIR_NAME: &str = "app";
/// Origin marker written into the local copy
pub const ORIGIN_MARKER_NAME: &str = ".origin";

/// Filesystem types whose backing store can disappear under us
const NETWORK_FILESYSTEMS: &[&str] = &[
    "nfs",
    "nfs4",
    "cifs",
    "smb3",
    "smbfs",
    "sshfs",
    "fuse.sshfs",
    "9p",
    "afs",
    "ceph",
    "glusterfs",
    "fuse.glusterfs",
    "davfs",
    "fuse.davfs2",
    "lustre",
];

/// Where a path physically lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StorageKind {
    Local,
    Network,
    Removable,
}

impl StorageKind {
    pub fn is_unstable(self) -> bool {
        !matches!(self, StorageKind::Local)
    }
}

/// One line of `/proc/self/mountinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub major: u32,
    pub minor: u32,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

/// Parse mountinfo content, skipping malformed lines.
///
/// Format: `id parent major:minor root mount_point options [optional...] - fstype source super_options`
pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content.lines().filter_map(parse_mountinfo_line).collect()
}

fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let separator = fields.iter().position(|f| *f == "-")?;
    if separator < 6 || fields.len() < separator + 3 {
        return None;
    }

    let (major, minor) = fields[2].split_once(':')?;
    Some(MountEntry {
        major: major.parse().ok()?,
        minor: minor.parse().ok()?,
        mount_point: PathBuf::from(unescape_octal(fields[4])),
        fs_type: fields[separator + 1].to_string(),
        source: unescape_octal(fields[separator + 2]),
    })
}

/// Undo the kernel's `\ooo` escaping of spaces, tabs, newlines and backslashes
fn unescape_octal(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(value) = digits.and_then(|d| u8::from_str_radix(d, 8).ok()) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The mount containing `path`: longest matching mount point, last one wins on ties
pub fn find_mount<'a>(entries: &'a [MountEntry], path: &Path) -> Option<&'a MountEntry> {
    let mut best: Option<&MountEntry> = None;
    for entry in entries.iter().filter(|e| path.starts_with(&e.mount_point)) {
        let longer = best.is_none_or(|b| {
            entry.mount_point.as_os_str().len() >= b.mount_point.as_os_str().len()
        });
        if longer {
            best = Some(entry);
        }
    }
    best
}

/// Classifies paths using mountinfo and sysfs.
#[derive(Debug, Clone)]
pub struct StorageProbe {
    mountinfo: PathBuf,
    sysfs_root: PathBuf,
}

impl StorageProbe {
    pub fn system() -> Self {
        Self::with_roots("/proc/self/mountinfo", "/sys")
    }

    /// Probe against alternate mountinfo and sysfs locations
    pub fn with_roots(mountinfo: impl Into<PathBuf>, sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: mountinfo.into(),
            sysfs_root: sysfs_root.into(),
        }
    }

    /// Storage kind of `path`; `Local` when it cannot be determined
    pub fn classify(&self, path: &Path) -> StorageKind {
        let content = match fs::read_to_string(&self.mountinfo) {
            Ok(content) => content,
            Err(e) => {
                warn!("Cannot read {:?}: {}", self.mountinfo, e);
                return StorageKind::Local;
            }
        };
        let entries = parse_mountinfo(&content);
        let Some(mount) = find_mount(&entries, path) else {
            debug!("No mount found for {:?}", path);
            return StorageKind::Local;
        };

        debug!(
            "{:?} is on {} ({}) at {:?}",
            path, mount.source, mount.fs_type, mount.mount_point
        );
        if NETWORK_FILESYSTEMS.contains(&mount.fs_type.as_str()) {
            StorageKind::Network
        } else if self.is_removable(mount.major, mount.minor) {
            StorageKind::Removable
        } else {
            StorageKind::Local
        }
    }

    /// Partitions carry no `removable` flag of their own; their parent disk does
    fn is_removable(&self, major: u32, minor: u32) -> bool {
        let device = self
            .sysfs_root
            .join("dev/block")
            .join(format!("{}:{}", major, minor));
        [device.join("removable"), device.join("../removable")]
            .iter()
            .find_map(|flag| fs::read_to_string(flag).ok())
            .is_some_and(|value| value.trim() == "1")
    }
}

/// Result of copying the application directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub files_copied: usize,
    pub dirs_created: usize,
    /// Entries that could not be read or written
    pub skipped: Vec<PathBuf>,
}

/// Recursively copy `source` into `dest`.
///
/// Hidden directories are left out unless named in `allowed_hidden`. Entries
/// that cannot be read (locked, vanished, permission denied) are recorded in
/// the report and skipped. Only failing to create `dest` itself is an error.
pub fn copy_tree(source: &Path, dest: &Path, allowed_hidden: &[String]) -> Result<CopyReport> {
    fs::create_dir_all(dest)?;
    let mut report = CopyReport::default();

    let walker = WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || entry.path().starts_with(dest) {
                return entry.depth() == 0;
            }
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir()
                && name.starts_with('.')
                && !allowed_hidden.iter().any(|allowed| *allowed == name))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                if let Some(path) = e.path() {
                    report.skipped.push(path.to_path_buf());
                }
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        let file_type = entry.file_type();

        let copied = if file_type.is_dir() {
            fs::create_dir_all(&target).map(|_| report.dirs_created += 1)
        } else if file_type.is_symlink() {
            fs::read_link(entry.path())
                .and_then(|link| std::os::unix::fs::symlink(link, &target))
                .map(|_| report.files_copied += 1)
        } else {
            fs::copy(entry.path(), &target).map(|_| report.files_copied += 1)
        };

        if let Err(e) = copied {
            warn!("Skipping {:?}: {}", entry.path(), e);
            report.skipped.push(entry.path().to_path_buf());
        }
    }

    Ok(report)
}

/// Contents of the `.origin` marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginMarker {
    pub original_path: PathBuf,
    pub copied_at: DateTime<Utc>,
}

pub fn write_origin_marker(app_dir: &Path, original: &Path) -> Result<()> {
    let marker = OriginMarker {
        original_path: original.to_path_buf(),
        copied_at: Utc::now(),
    };
    fs::write(
        app_dir.join(ORIGIN_MARKER_NAME),
        serde_json::to_vec_pretty(&marker)?,
    )?;
    Ok(())
}

pub fn read_origin_marker(app_dir: &Path) -> Option<OriginMarker> {
    let content = fs::read_to_string(app_dir.join(ORIGIN_MARKER_NAME)).ok()?;
    serde_json::from_str(&content).ok()
}

/// How this process was launched, as seen by the bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchContext {
    pub executable: PathBuf,
    pub storage: StorageKind,
    pub running_from_cache: bool,
    pub relaunched: bool,
}

impl LaunchContext {
    /// Inspect the running executable; does not copy or relaunch
    pub fn detect(cache_root: &Path, probe: &StorageProbe) -> Self {
        let executable = env::current_exe().unwrap_or_else(|e| {
            warn!("Cannot resolve current executable: {}", e);
            PathBuf::new()
        });
        let app_dir = cache_root.join(APP_DIR_NAME);
        Self {
            storage: probe.classify(&executable),
            running_from_cache: !executable.as_os_str().is_empty()
                && executable.starts_with(&app_dir),
            relaunched: env::var_os(RELAUNCH_ENV).is_some(),
            executable,
        }
    }

    /// Unstable storage, not yet moved and not relaunched before
    pub fn needs_relocation(&self) -> bool {
        self.storage.is_unstable()
            && !self.running_from_cache
            && !self.relaunched
            && !self.executable.as_os_str().is_empty()
    }
}

/// First bootstrap phase: relocate to the local cache if needed.
///
/// On a successful relaunch this never returns (the process image is
/// replaced). Otherwise it returns the context the rest of the run uses.
pub fn bootstrap(
    settings: &ResilienceConfig,
    cache_root: &Path,
    store: &StateStore,
) -> LaunchContext {
    let launch = LaunchContext::detect(cache_root, &StorageProbe::system());
    info!(
        "Running {:?} from {} storage{}",
        launch.executable,
        launch.storage,
        if launch.running_from_cache { " (local cache)" } else { "" }
    );

    if let Some(local) = prepare_relaunch(&launch, settings, cache_root, store) {
        let e = relaunch(&local);
        error!("{}; continuing from original location", e);
    }
    launch
}

/// Copy the application into the cache when `launch` should move there.
///
/// Returns the local executable to relaunch. The cache copy of a run that
/// another live process owns is left in place.
fn prepare_relaunch(
    launch: &LaunchContext,
    settings: &ResilienceConfig,
    cache_root: &Path,
    store: &StateStore,
) -> Option<PathBuf> {
    if !settings.enabled {
        debug!("Relocation disabled");
        return None;
    }
    if !launch.needs_relocation() {
        return None;
    }
    if let Some(owner) = store.foreign_owner() {
        warn!("Not relocating: the local copy belongs to the run in PID {}", owner);
        return None;
    }

    let app_dir = cache_root.join(APP_DIR_NAME);
    match relocate(&launch.executable, &app_dir, &settings.allowed_hidden_dirs) {
        Ok(local) => Some(local),
        Err(e) => {
            warn!("Could not copy to local cache: {}; continuing from original location", e);
            None
        }
    }
}

/// Copy the executable's directory into `app_dir`, returning the local executable
pub fn relocate(executable: &Path, app_dir: &Path, allowed_hidden: &[String]) -> Result<PathBuf> {
    let (Some(source), Some(name)) = (executable.parent(), executable.file_name()) else {
        return Err(ImagePrepError::relaunch(format!(
            "executable path {:?} has no parent directory",
            executable
        )));
    };

    if app_dir.exists() {
        debug!("Replacing previous local copy at {:?}", app_dir);
        fs::remove_dir_all(app_dir)?;
    }

    let report = copy_tree(source, app_dir, allowed_hidden)?;
    info!(
        "Copied {} files and {} directories to {:?} ({} skipped)",
        report.files_copied,
        report.dirs_created,
        app_dir,
        report.skipped.len()
    );
    write_origin_marker(app_dir, source)?;

    let local = app_dir.join(name);
    if !local.is_file() {
        return Err(ImagePrepError::relaunch(format!(
            "executable was not copied to {:?}",
            local
        )));
    }
    Ok(local)
}

/// Replace this process with `local`, same arguments, marker set.
///
/// Only returns on failure.
fn relaunch(local: &Path) -> ImagePrepError {
    use std::os::unix::process::CommandExt;

    info!("Relaunching from {:?}", local);
    let e = Command::new(local)
        .args(env::args_os().skip(1))
        .env(RELAUNCH_ENV, "1")
        .exec();
    ImagePrepError::relaunch(format!("exec {:?} failed: {}", local, e))
}

/// Schedule removal of the local copy after this process exits.
///
/// Returns whether a helper was started. Skipped when not running from the
/// cache or when the store still holds an active run to resume.
pub fn schedule_cleanup(
    launch: &LaunchContext,
    cache_root: &Path,
    store: &StateStore,
) -> Result<bool> {
    if !launch.running_from_cache {
        return Ok(false);
    }
    if store.has_active_run() {
        info!("Keeping local copy: an interrupted run is pending");
        return Ok(false);
    }

    let pid = std::process::id();
    let script_path = env::temp_dir().join(format!("imageprep-cleanup-{}.sh", pid));
    let script = cleanup_script(pid, &cache_root.join(APP_DIR_NAME), cache_root);
    fs::write(&script_path, script)?;

    Command::new("sh")
        .arg(&script_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .detached()
        .spawn()
        .map_err(|e| ImagePrepError::process(format!("cleanup helper: {}", e)))?;
    info!("Scheduled removal of {:?} after exit", cache_root.join(APP_DIR_NAME));
    Ok(true)
}

/// Schedules the cache cleanup when dropped, on every way out of a run.
pub struct CleanupGuard {
    launch: LaunchContext,
    cache_root: PathBuf,
    store: StateStore,
}

impl CleanupGuard {
    pub fn new(launch: LaunchContext, cache_root: impl Into<PathBuf>, store: StateStore) -> Self {
        Self {
            launch,
            cache_root: cache_root.into(),
            store,
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Err(e) = schedule_cleanup(&self.launch, &self.cache_root, &self.store) {
            warn!("Failed to schedule cache cleanup: {}", e);
        }
    }
}

/// Shell helper: wait for `pid`, delete `app_dir` with backoff, drop an empty
/// `cache_root`, then delete itself.
pub fn cleanup_script(pid: u32, app_dir: &Path, cache_root: &Path) -> String {
    let app = shell_quote(app_dir);
    let root = shell_quote(cache_root);
    format!(
        r#"#!/bin/sh
while kill -0 {pid} 2>/dev/null; do sleep 1; done
delay=1
attempt=1
while [ -e {app} ] && [ $attempt -le 6 ]; do
    rm -rf {app} 2>/dev/null
    [ -e {app} ] || break
    sleep $delay
    delay=$((delay * 2))
    [ $delay -gt 16 ] && delay=16
    attempt=$((attempt + 1))
done
rmdir {root} 2>/dev/null
rm -f "$0"
"#
    )
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

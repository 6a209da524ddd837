//! Sleep Prevention Guard
//!
//! Keeps the machine awake for the duration of a run. A multi-hour driver
//! update that gets interrupted by idle suspend is the most common way a run
//! ends up needing recovery.
//!
//! The guard is RAII: [`SleepGuard::acquire`] at run start, release on drop.
//! Inhibitors must tolerate `acquire` and `release` being called repeatedly.

use crate::process_guard::{terminate_child, CommandProcessGroup};
use anyhow::{Context, Result};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Something that can keep the machine from sleeping.
pub trait SleepInhibitor: Send {
    /// Start inhibiting. A no-op if already inhibiting.
    fn acquire(&mut self) -> Result<()>;

    /// Stop inhibiting. A no-op if not inhibiting.
    fn release(&mut self);

    fn is_held(&self) -> bool;
}

/// Holds a `systemd-inhibit` child for as long as sleep is blocked.
///
/// logind keeps the inhibitor lock while the wrapped command runs, so the
/// lock dies with the process group on release, or with us if we crash.
#[derive(Debug)]
pub struct SystemdInhibitor {
    who: String,
    why: String,
    child: Option<Child>,
}

impl SystemdInhibitor {
    pub fn new(why: impl Into<String>) -> Self {
        Self {
            who: "imageprep".to_string(),
            why: why.into(),
            child: None,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("systemd-inhibit");
        cmd.arg("--what=sleep:idle")
            .arg(format!("--who={}", self.who))
            .arg(format!("--why={}", self.why))
            .arg("--mode=block")
            .args(["sleep", "infinity"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

impl SleepInhibitor for SystemdInhibitor {
    fn acquire(&mut self) -> Result<()> {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                // Lock holder died underneath us; take a fresh one
                _ => self.child = None,
            }
        }

        let child = self
            .command()
            .in_new_process_group()
            .spawn()
            .context("Failed to start systemd-inhibit")?;
        info!("Sleep inhibited (systemd-inhibit PID {})", child.id());
        self.child = Some(child);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("Releasing sleep inhibitor PID {}", child.id());
            terminate_child(&mut child, Duration::from_secs(2));
            info!("Sleep inhibition released");
        }
    }

    fn is_held(&self) -> bool {
        self.child.is_some()
    }
}

impl Drop for SystemdInhibitor {
    fn drop(&mut self) {
        self.release();
    }
}

/// Inhibitor that does nothing (sleep prevention disabled, dry runs)
#[derive(Debug, Default)]
pub struct NoopInhibitor {
    held: bool,
}

impl SleepInhibitor for NoopInhibitor {
    fn acquire(&mut self) -> Result<()> {
        self.held = true;
        Ok(())
    }

    fn release(&mut self) {
        self.held = false;
    }

    fn is_held(&self) -> bool {
        self.held
    }
}

/// Scoped sleep prevention. Dropping the guard releases the inhibitor.
pub struct SleepGuard<'a> {
    inhibitor: &'a mut dyn SleepInhibitor,
}

impl<'a> SleepGuard<'a> {
    /// Acquire the inhibitor. Failure is logged and the run continues unguarded.
    pub fn acquire(inhibitor: &'a mut dyn SleepInhibitor) -> Self {
        if let Err(e) = inhibitor.acquire() {
            warn!("Could not prevent sleep for this run: {:#}", e);
        }
        Self { inhibitor }
    }

    pub fn is_held(&self) -> bool {
        self.inhibitor.is_held()
    }
}

impl Drop for SleepGuard<'_> {
    fn drop(&mut self) {
        self.inhibitor.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl SleepInhibitor for Failing {
        fn acquire(&mut self) -> Result<()> {
            anyhow::bail!("no logind on this machine")
        }

        fn release(&mut self) {}

        fn is_held(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let mut inhibitor = NoopInhibitor::default();
        {
            let guard = SleepGuard::acquire(&mut inhibitor);
            assert!(guard.is_held());
        }
        assert!(!inhibitor.is_held());
    }

    #[test]
    fn test_acquire_and_release_are_idempotent() {
        let mut inhibitor = NoopInhibitor::default();
        inhibitor.acquire().expect("acquire");
        inhibitor.acquire().expect("acquire again");
        assert!(inhibitor.is_held());
        inhibitor.release();
        inhibitor.release();
        assert!(!inhibitor.is_held());
    }

    #[test]
    fn test_failed_acquire_is_not_fatal() {
        let mut inhibitor = Failing;
        let guard = SleepGuard::acquire(&mut inhibitor);
        assert!(!guard.is_held());
    }

    #[test]
    fn test_systemd_command_line() {
        let inhibitor = SystemdInhibitor::new("driver update");
        let cmd = inhibitor.command();
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.get_program(), "systemd-inhibit");
        assert!(args.contains(&"--what=sleep:idle".to_string()));
        assert!(args.contains(&"--why=driver update".to_string()));
        assert!(!inhibitor.is_held());
    }
}

//! Process lifecycle management for external tools
//!
//! # Problem Solved
//! Wrapped tools (policy refresh, vendor updaters, agent triggers) may spawn
//! their own children. A timed-out tool has to be killed as a whole tree, and
//! a short probe must not outlive imageprep if imageprep crashes.
//!
//! # Solution
//! - Spawn every tool in its own process group so one signal reaches the tree
//! - Short-lived tools get a parent-death signal (`PR_SET_PDEATHSIG`)
//! - Long apply-style tools and the cleanup helper start in a fresh session
//!   without a death signal so they can outlive the run
//! - Timeouts send SIGTERM to the group, wait a grace period, then SIGKILL
//!
//! Signals to imageprep itself do not kill children: the first SIGINT/SIGTERM
//! only raises the run's cancellation flag, a second one exits immediately.

use crate::cancel::CancelToken;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Child;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Exit status used when a second termination signal forces an exit
pub const FORCED_EXIT_CODE: i32 = 130;

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the command in its own process group and kill it when we die
    fn in_new_process_group(&mut self) -> &mut Self;

    /// Run the command in a new session with no tie to our lifetime
    fn detached(&mut self) -> &mut Self;
}

impl CommandProcessGroup for std::process::Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                // PGID = child PID, so the group can be signalled as a whole
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(std::io::Error::other)?;

                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }

                Ok(())
            });
        }
        self
    }

    fn detached(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        unsafe {
            self.pre_exec(|| {
                // New session: new process group, no controlling terminal, so
                // neither our exit nor a terminal hangup reaches it
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }
        self
    }
}

/// Send a signal to an entire process group
fn send_signal_to_group(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(-(pgid as i32)), signal)
}

/// Check if a process is still alive (not dead or zombie).
///
/// Works for processes that are not our children, which is how a recovered
/// run follows an apply process started by a previous imageprep.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || signal::kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    // Field 3 of /proc/pid/stat is the state: R=running, S=sleeping, Z=zombie
    if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // The command name (field 2) may contain spaces; the state follows the last ')'
        if let Some(rest) = stat.rsplit_once(')').map(|(_, rest)| rest) {
            if let Some(state) = rest.split_whitespace().next() {
                return !matches!(state, "Z" | "X");
            }
        }
    }

    true
}

/// Terminate a spawned child and its whole process group.
///
/// SIGTERM first, up to `grace` to exit, then SIGKILL. The child is always
/// reaped before returning.
pub fn terminate_child(child: &mut Child, grace: Duration) {
    let pid = child.id();

    if let Err(e) = send_signal_to_group(pid, Signal::SIGTERM) {
        warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
        let _ = child.kill();
    }

    let start = Instant::now();
    while start.elapsed() < grace {
        match child.try_wait() {
            Ok(Some(_)) => {
                debug!("Process group {} terminated gracefully", pid);
                return;
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(100)),
            Err(e) => {
                warn!("Failed to poll PID {}: {}", pid, e);
                break;
            }
        }
    }

    warn!("Process group {} did not terminate, sending SIGKILL", pid);
    if send_signal_to_group(pid, Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// Stop awaiting a child without killing it.
///
/// The child keeps running; a background thread reaps it so it never lingers
/// as a zombie.
pub fn release_child(mut child: Child) {
    let pid = child.id();
    debug!("Releasing PID {} to finish on its own", pid);
    std::thread::spawn(move || {
        let _ = child.wait();
    });
}

/// Route SIGINT, SIGTERM, SIGQUIT and SIGHUP into the cancellation token.
///
/// The first signal raises the flag; a second one, arriving while the flag is
/// already set, exits with [`FORCED_EXIT_CODE`]. Call this once at program start.
pub fn init_signal_handlers(cancel: &CancelToken) -> Result<(), std::io::Error> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
    use signal_hook::flag;

    for sig in [SIGINT, SIGTERM, SIGQUIT, SIGHUP] {
        // Order matters: the shutdown check must see the flag before this
        // signal sets it
        flag::register_conditional_shutdown(sig, FORCED_EXIT_CODE, cancel.flag())?;
        flag::register(sig, cancel.flag())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(999_999));
        assert!(!is_process_alive(0));
    }

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_terminate_child_kills_process_group() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60"])
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn sleep process");

        let pid = child.id();
        assert!(is_process_alive(pid));

        terminate_child(&mut child, Duration::from_millis(500));

        assert!(!is_process_alive(pid), "Process should be dead and reaped");
    }

    #[test]
    fn test_sigterm_before_sigkill() {
        let mut child = Command::new("sh")
            .args(["-c", "trap 'exit 0' TERM; sleep 60 & wait"])
            .in_new_process_group()
            .spawn()
            .expect("Failed to spawn sh with trap");

        std::thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        terminate_child(&mut child, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_detached_child_runs() {
        let mut child = Command::new("sh")
            .args(["-c", "exit 3"])
            .detached()
            .spawn()
            .expect("Failed to spawn detached sh");
        let status = child.wait().expect("wait");
        assert_eq!(status.code(), Some(3));
    }
}

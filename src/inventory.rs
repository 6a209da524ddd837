//! Machine inventory and compliance facts
//!
//! Reads the facts the baseline inventory and compliance verification tasks
//! report on. Probes are read-only and never fail the caller: a probe that
//! cannot answer yields `None` plus a problem note in the snapshot.
//!
//! # Sources
//!
//! | Fact              | Source                                      |
//! |-------------------|---------------------------------------------|
//! | Hardware identity | `/sys/class/dmi/id/*`                       |
//! | OS activation     | configured probe command (exit code 0)      |
//! | Domain membership | configured probe command (first output line)|
//! | Free disk space   | `statvfs`                                   |
//! | Network           | `TcpStream::connect_timeout`                |
//! | Pending reboot    | `/run/reboot-required`                      |

use crate::cancel::CancelToken;
use crate::command_runner::{CommandSpec, NoHooks, ProcessRunner, SystemProcessRunner};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const DMI_ROOT: &str = "/sys/class/dmi/id";
const REBOOT_MARKERS: [&str; 2] = ["/run/reboot-required", "/var/run/reboot-required"];

/// DMI identity of the machine. Fields the kernel does not expose (or that
/// need privileges we lack) are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareIdentity {
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub bios_version: Option<String>,
}

impl fmt::Display for HardwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.vendor.as_deref().unwrap_or("Unknown vendor"),
            self.product.as_deref().unwrap_or("unknown model")
        )?;
        if let Some(serial) = &self.serial {
            write!(f, " (SN {})", serial)?;
        }
        if let Some(bios) = &self.bios_version {
            write!(f, ", BIOS {}", bios)?;
        }
        Ok(())
    }
}

/// What to probe against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTargets {
    pub disk_path: PathBuf,
    pub reachability_host: String,
    pub network_timeout: Duration,
}

impl ProbeTargets {
    /// Targets named by the compliance baseline
    pub fn from_compliance(compliance: &crate::config::ComplianceConfig) -> Self {
        Self {
            disk_path: compliance.disk_path.clone(),
            reachability_host: compliance.reachability_host.clone(),
            network_timeout: Duration::from_secs(compliance.network_timeout_secs),
        }
    }
}

/// One collection of every inventory fact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub hardware: HardwareIdentity,
    pub os_activated: Option<bool>,
    /// `Some(None)`: probe ran, machine is not joined
    pub domain: Option<Option<String>>,
    pub free_disk_bytes: Option<u64>,
    pub network_reachable: bool,
    pub pending_reboot: bool,
    /// Probes that could not answer
    pub problems: Vec<String>,
}

impl InventorySnapshot {
    pub fn joined_domain(&self) -> Option<&str> {
        self.domain.as_ref().and_then(|d| d.as_deref())
    }

    pub fn free_disk_gb(&self) -> Option<u64> {
        self.free_disk_bytes.map(|b| b / 1_000_000_000)
    }
}

impl fmt::Display for InventorySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hardware:       {}", self.hardware)?;
        let activated = match self.os_activated {
            Some(true) => "yes",
            Some(false) => "no",
            None => "unknown",
        };
        writeln!(f, "OS activated:   {}", activated)?;
        let domain = match &self.domain {
            Some(Some(name)) => name.as_str(),
            Some(None) => "not joined",
            None => "unknown",
        };
        writeln!(f, "Domain:         {}", domain)?;
        match self.free_disk_gb() {
            Some(gb) => writeln!(f, "Free disk:      {} GB", gb)?,
            None => writeln!(f, "Free disk:      unknown")?,
        }
        writeln!(
            f,
            "Network:        {}",
            if self.network_reachable { "reachable" } else { "unreachable" }
        )?;
        write!(
            f,
            "Pending reboot: {}",
            if self.pending_reboot { "yes" } else { "no" }
        )?;
        for problem in &self.problems {
            write!(f, "\n  ! {}", problem)?;
        }
        Ok(())
    }
}

/// Source of machine facts.
pub trait InventoryProvider {
    fn hardware_identity(&self) -> HardwareIdentity;

    fn os_activated(&self, cancel: &CancelToken) -> Result<bool>;

    /// Joined domain name, `None` when not joined
    fn domain_membership(&self, cancel: &CancelToken) -> Result<Option<String>>;

    fn free_disk_bytes(&self, path: &Path) -> Result<u64>;

    fn network_reachable(&self, host: &str, timeout: Duration) -> bool;

    fn pending_reboot(&self) -> bool;

    /// Collect every fact, recording failed probes as problems
    fn snapshot(&self, targets: &ProbeTargets, cancel: &CancelToken) -> InventorySnapshot {
        let mut problems = Vec::new();

        let os_activated = self
            .os_activated(cancel)
            .map_err(|e| problems.push(format!("activation probe: {:#}", e)))
            .ok();
        let domain = self
            .domain_membership(cancel)
            .map_err(|e| problems.push(format!("domain probe: {:#}", e)))
            .ok();
        let free_disk_bytes = self
            .free_disk_bytes(&targets.disk_path)
            .map_err(|e| problems.push(format!("disk space: {:#}", e)))
            .ok();

        InventorySnapshot {
            hardware: self.hardware_identity(),
            os_activated,
            domain,
            free_disk_bytes,
            network_reachable: self
                .network_reachable(&targets.reachability_host, targets.network_timeout),
            pending_reboot: self.pending_reboot(),
            problems,
        }
    }
}

/// Inventory backed by sysfs, `statvfs`, TCP and probe commands.
#[derive(Debug, Clone)]
pub struct SystemInventory {
    runner: SystemProcessRunner,
    activation_probe: Option<CommandSpec>,
    domain_probe: Option<CommandSpec>,
    probe_timeout: Duration,
    dmi_root: PathBuf,
    reboot_markers: Vec<PathBuf>,
}

impl SystemInventory {
    pub fn new(
        activation_probe: Option<CommandSpec>,
        domain_probe: Option<CommandSpec>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            // Probes are read-only, so they run even in dry-run mode
            runner: SystemProcessRunner::new(),
            activation_probe,
            domain_probe,
            probe_timeout,
            dmi_root: PathBuf::from(DMI_ROOT),
            reboot_markers: REBOOT_MARKERS.iter().map(PathBuf::from).collect(),
        }
    }

    /// Read DMI attributes and reboot markers below other roots (tests)
    pub fn with_roots(
        mut self,
        dmi_root: impl Into<PathBuf>,
        reboot_markers: Vec<PathBuf>,
    ) -> Self {
        self.dmi_root = dmi_root.into();
        self.reboot_markers = reboot_markers;
        self
    }

    fn read_dmi(&self, attribute: &str) -> Option<String> {
        let path = self.dmi_root.join(attribute);
        match fs::read_to_string(&path) {
            Ok(value) => {
                let value = value.trim();
                // Vendors ship placeholder strings instead of leaving fields empty
                let placeholder = value.is_empty()
                    || value.eq_ignore_ascii_case("to be filled by o.e.m.")
                    || value.eq_ignore_ascii_case("default string");
                (!placeholder).then(|| value.to_string())
            }
            Err(e) => {
                debug!("DMI attribute {:?} unavailable: {}", path, e);
                None
            }
        }
    }

    fn run_probe(&self, probe: &CommandSpec, cancel: &CancelToken) -> Result<(i32, String)> {
        let request = probe.to_request(self.probe_timeout);
        let output = self
            .runner
            .run(&request, cancel, &mut NoHooks)
            .with_context(|| format!("failed to run {}", request.display()))?;
        if output.timed_out {
            anyhow::bail!("{} timed out", request.display());
        }
        if output.cancelled {
            anyhow::bail!("cancelled");
        }
        let code = output
            .exit_code
            .with_context(|| format!("{} was killed by a signal", request.display()))?;
        Ok((code, output.stdout))
    }
}

impl InventoryProvider for SystemInventory {
    fn hardware_identity(&self) -> HardwareIdentity {
        HardwareIdentity {
            vendor: self.read_dmi("sys_vendor"),
            product: self.read_dmi("product_name"),
            serial: self.read_dmi("product_serial"),
            bios_version: self.read_dmi("bios_version"),
        }
    }

    fn os_activated(&self, cancel: &CancelToken) -> Result<bool> {
        let probe = self
            .activation_probe
            .as_ref()
            .context("no activation probe configured")?;
        let (code, _) = self.run_probe(probe, cancel)?;
        Ok(code == 0)
    }

    fn domain_membership(&self, cancel: &CancelToken) -> Result<Option<String>> {
        let probe = self
            .domain_probe
            .as_ref()
            .context("no domain probe configured")?;
        let (code, stdout) = self.run_probe(probe, cancel)?;
        if code != 0 {
            anyhow::bail!("domain probe exited with code {}", code);
        }
        Ok(first_line(&stdout))
    }

    fn free_disk_bytes(&self, path: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path)
            .with_context(|| format!("statvfs {:?}", path))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    fn network_reachable(&self, host: &str, timeout: Duration) -> bool {
        let addrs = match host.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("Cannot resolve {}: {}", host, e);
                return false;
            }
        };

        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(_stream) => {
                    info!("Network connectivity confirmed (TCP to {})", addr);
                    return true;
                }
                Err(e) => debug!("TCP connect to {} failed: {}", addr, e),
            }
        }
        warn!("Network connectivity check to {} failed", host);
        false
    }

    fn pending_reboot(&self) -> bool {
        self.reboot_markers.iter().any(|path| path.exists())
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

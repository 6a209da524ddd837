//! Run configuration file handling.
//!
//! Wrapped tools, exit-code tables, retry policies and compliance thresholds
//! all live in one JSON document. Every field has a default, so a missing
//! file or a partial document is valid and only overrides what it names.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command_runner::CommandSpec;
use crate::exit_codes::ExitCodeTable;
use crate::retry::RetryPolicy;
use crate::types::{ExitClass, TaskId, TaskSelection};

/// Location read when no `--config` is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/imageprep/config.json";
/// Cache root used when the config does not name one
pub const DEFAULT_CACHE_ROOT: &str = "/var/cache/imageprep";
/// "No updates available" code of current vendor tool releases
pub const DEFAULT_NO_OP_CODE: i32 = 500;

/// Top-level configuration of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Holds the state document, the relocated app copy and apply logs
    pub cache_root: PathBuf,
    /// A persisted run older than this is stale and never resumed
    pub freshness_window_secs: u64,
    /// Minimum spacing of state saves while a tool runs
    pub heartbeat_interval_secs: u64,
    /// Tasks run when `--tasks` is not given
    pub default_tasks: Vec<TaskId>,
    pub policy_refresh: PolicyRefreshConfig,
    pub agent: AgentConfig,
    pub driver_update: DriverUpdateConfig,
    pub compliance: ComplianceConfig,
    pub inventory: InventoryConfig,
    pub sleep: SleepConfig,
    pub resilience: ResilienceConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from(DEFAULT_CACHE_ROOT),
            freshness_window_secs: 30 * 60,
            heartbeat_interval_secs: 5,
            default_tasks: TaskId::pipeline().to_vec(),
            policy_refresh: PolicyRefreshConfig::default(),
            agent: AgentConfig::default(),
            driver_update: DriverUpdateConfig::default(),
            compliance: ComplianceConfig::default(),
            inventory: InventoryConfig::default(),
            sleep: SleepConfig::default(),
            resilience: ResilienceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRefreshConfig {
    pub command: CommandSpec,
    pub exit_codes: ExitCodeTable,
    pub retry: RetryPolicy,
}

impl Default for PolicyRefreshConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::new("samba-gpupdate", &["--force"]),
            exit_codes: ExitCodeTable::policy_refresh(),
            retry: RetryPolicy::policy_refresh(),
        }
    }
}

/// One management-agent action to trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAction {
    /// Identifier substituted for `{action}` in the trigger command
    pub id: String,
    /// Display name
    pub name: String,
}

impl AgentAction {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Trigger command; `{action}` is replaced by the action id
    pub command: CommandSpec,
    pub actions: Vec<AgentAction>,
    pub timeout_secs: u64,
    /// Pause between consecutive actions so the agent can process each one
    pub cooldown_secs: u64,
    pub exit_codes: ExitCodeTable,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: CommandSpec::new("mgmt-agent", &["trigger", "{action}"]),
            actions: vec![
                AgentAction::new("machine-policy", "Machine policy retrieval"),
                AgentAction::new("hardware-inventory", "Hardware inventory cycle"),
                AgentAction::new("software-update-scan", "Software update scan"),
                AgentAction::new("application-deployment", "Application deployment evaluation"),
            ],
            timeout_secs: 5 * 60,
            cooldown_secs: 30,
            exit_codes: ExitCodeTable::agent_action(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverUpdateConfig {
    pub scan: CommandSpec,
    pub apply: CommandSpec,
    /// Selects the entry of `no_op_codes` that applies to the installed tool
    pub tool_version: String,
    /// "Nothing to do" exit code per vendor tool version
    pub no_op_codes: BTreeMap<String, i32>,
    /// Scan output lines with this prefix name one pending update each
    pub update_line_prefix: String,
    /// Apply log lines with this prefix name one installed update each
    pub installed_line_prefix: String,
    pub scan_retry: RetryPolicy,
    pub apply_retry: RetryPolicy,
    pub scan_exit_codes: ExitCodeTable,
    pub apply_exit_codes: ExitCodeTable,
}

impl Default for DriverUpdateConfig {
    fn default() -> Self {
        Self {
            scan: CommandSpec::new("vendor-update", &["scan", "--silent"]),
            apply: CommandSpec::new("vendor-update", &["apply", "--silent", "--reboot=disable"]),
            tool_version: "current".to_string(),
            no_op_codes: BTreeMap::from([
                ("legacy".to_string(), 3),
                ("current".to_string(), DEFAULT_NO_OP_CODE),
            ]),
            update_line_prefix: "Update:".to_string(),
            installed_line_prefix: "Installed:".to_string(),
            scan_retry: RetryPolicy::driver_scan(),
            apply_retry: RetryPolicy::driver_apply(),
            scan_exit_codes: ExitCodeTable::driver_scan(DEFAULT_NO_OP_CODE),
            apply_exit_codes: ExitCodeTable::driver_apply(DEFAULT_NO_OP_CODE),
        }
    }
}

impl DriverUpdateConfig {
    /// No-op code of the configured tool version
    pub fn no_op_code(&self) -> i32 {
        self.no_op_codes
            .get(&self.tool_version)
            .copied()
            .unwrap_or(DEFAULT_NO_OP_CODE)
    }

    /// Scan table with exactly one no-op code: the configured version's
    pub fn scan_table(&self) -> ExitCodeTable {
        with_no_op(&self.scan_exit_codes, self.no_op_code())
    }

    /// Apply table with exactly one no-op code: the configured version's
    pub fn apply_table(&self) -> ExitCodeTable {
        with_no_op(&self.apply_exit_codes, self.no_op_code())
    }
}

fn with_no_op(table: &ExitCodeTable, no_op: i32) -> ExitCodeTable {
    let mut table = table.clone();
    table.codes.retain(|_, class| *class != ExitClass::NoOpSuccess);
    table.with(no_op, ExitClass::NoOpSuccess)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub require_domain: bool,
    pub require_activation: bool,
    pub min_free_disk_gb: u64,
    /// Filesystem checked for free space
    pub disk_path: PathBuf,
    pub require_network: bool,
    /// `host:port` that must accept a TCP connection
    pub reachability_host: String,
    pub network_timeout_secs: u64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            require_domain: true,
            require_activation: true,
            min_free_disk_gb: 20,
            disk_path: PathBuf::from("/"),
            require_network: true,
            reachability_host: "1.1.1.1:443".to_string(),
            network_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Exit code 0 means the OS is activated/registered
    pub activation_probe: Option<CommandSpec>,
    /// Prints the joined domain name; empty output means not joined
    pub domain_probe: Option<CommandSpec>,
    pub probe_timeout_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            activation_probe: Some(CommandSpec::new("subscription-manager", &["status"])),
            domain_probe: Some(CommandSpec::new("realm", &["list", "--name-only"])),
            probe_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SleepConfig {
    pub enabled: bool,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub enabled: bool,
    /// Hidden directories copied along with the application anyway
    pub allowed_hidden_dirs: Vec<String>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_hidden_dirs: vec![".runtime".to_string()],
        }
    }
}

impl RunConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Load `path` if given, else the default location if it exists, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load_from_file(DEFAULT_CONFIG_PATH)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Selection used when none is given on the command line
    pub fn default_selection(&self) -> TaskSelection {
        TaskSelection::only(&self.default_tasks)
    }

    /// Where the driver apply process writes its log
    pub fn apply_log_path(&self) -> PathBuf {
        self.cache_root.join("driver-apply.log")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache_root.as_os_str().is_empty() {
            anyhow::bail!("cache_root must be specified");
        }

        if self.freshness_window_secs == 0 {
            anyhow::bail!("freshness_window_secs must be greater than zero");
        }
        if self.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be greater than zero");
        }
        // A heartbeat slower than the window would make a live run look stale
        if self.heartbeat_interval_secs >= self.freshness_window_secs {
            anyhow::bail!(
                "heartbeat_interval_secs ({}) must be shorter than freshness_window_secs ({})",
                self.heartbeat_interval_secs,
                self.freshness_window_secs
            );
        }

        if self.default_tasks.is_empty() {
            anyhow::bail!("default_tasks must name at least one task");
        }

        // Commands
        let commands = [
            ("policy_refresh.command", &self.policy_refresh.command),
            ("agent.command", &self.agent.command),
            ("driver_update.scan", &self.driver_update.scan),
            ("driver_update.apply", &self.driver_update.apply),
        ];
        for (name, command) in commands {
            if command.program.trim().is_empty() {
                anyhow::bail!("{} must name a program", name);
            }
        }
        if !self.agent.command.args.iter().any(|a| a.contains("{action}")) {
            anyhow::bail!("agent.command must contain an {{action}} placeholder");
        }
        for probe in [&self.inventory.activation_probe, &self.inventory.domain_probe]
            .into_iter()
            .flatten()
        {
            if probe.program.trim().is_empty() {
                anyhow::bail!("inventory probes must name a program");
            }
        }

        // Retry policies
        let policies = [
            ("policy_refresh.retry", &self.policy_refresh.retry),
            ("driver_update.scan_retry", &self.driver_update.scan_retry),
            ("driver_update.apply_retry", &self.driver_update.apply_retry),
        ];
        for (name, policy) in policies {
            policy.validate(name).map_err(anyhow::Error::msg)?;
        }

        if self.agent.timeout_secs == 0 {
            anyhow::bail!("agent.timeout_secs must be greater than zero");
        }
        for action in &self.agent.actions {
            if action.id.trim().is_empty() {
                anyhow::bail!("agent actions must have an id");
            }
        }

        if !self
            .driver_update
            .no_op_codes
            .contains_key(&self.driver_update.tool_version)
        {
            anyhow::bail!(
                "driver_update.tool_version '{}' has no entry in no_op_codes",
                self.driver_update.tool_version
            );
        }
        if self.driver_update.update_line_prefix.trim().is_empty()
            || self.driver_update.installed_line_prefix.trim().is_empty()
        {
            anyhow::bail!("driver_update line prefixes must not be empty");
        }

        if self.compliance.require_network {
            let host = self.compliance.reachability_host.trim();
            let valid = host
                .rsplit_once(':')
                .is_some_and(|(h, port)| !h.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                anyhow::bail!(
                    "compliance.reachability_host must be host:port (got '{}')",
                    host
                );
            }
        }

        Ok(())
    }
}

//! Daemon configuration, loaded from TOML. Every section has serde
//! defaults so a missing config file yields a runnable daemon.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub requests: RequestBudgets,
    #[serde(default)]
    pub triage: TriageConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Where persisted rows, the secret database and its key live.
    #[serde(default = "d_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { dir: d_state_dir() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter packages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptersConfig {
    /// Directories scanned for adapter packages (one `adapter.json` per
    /// package directory).
    #[serde(default = "d_package_dirs")]
    pub package_dirs: Vec<PathBuf>,
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            package_dirs: d_package_dirs(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor timings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "d_30")]
    pub ping_interval_secs: u64,
    /// Consecutive ping failures before the handle is recycled.
    #[serde(default = "d_3")]
    pub ping_failure_limit: u32,
    #[serde(default = "d_2")]
    pub backoff_floor_secs: u64,
    #[serde(default = "d_60")]
    pub backoff_ceiling_secs: u64,
    /// Budget for spawn + init + ready.
    #[serde(default = "d_15")]
    pub start_timeout_secs: u64,
    #[serde(default = "d_500")]
    pub log_ring_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            ping_failure_limit: 3,
            backoff_floor_secs: 2,
            backoff_ceiling_secs: 60,
            start_timeout_secs: 15,
            log_ring_capacity: 500,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-operation request budgets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBudgets {
    #[serde(default = "d_10")]
    pub observe_timeout_secs: u64,
    #[serde(default = "d_10")]
    pub execute_timeout_secs: u64,
    #[serde(default = "d_30")]
    pub query_timeout_secs: u64,
    #[serde(default = "d_30")]
    pub discover_timeout_secs: u64,
    #[serde(default = "d_60")]
    pub pair_timeout_secs: u64,
    #[serde(default = "d_5")]
    pub ping_timeout_secs: u64,
}

impl Default for RequestBudgets {
    fn default() -> Self {
        Self {
            observe_timeout_secs: 10,
            execute_timeout_secs: 10,
            query_timeout_secs: 30,
            discover_timeout_secs: 30,
            pair_timeout_secs: 60,
            ping_timeout_secs: 5,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Triage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageConfig {
    /// Grace period during which a state change matching a just-issued
    /// command is treated as self-caused.
    #[serde(default = "d_5")]
    pub echo_window_secs: u64,
    /// How long a device's batched events are held before draining.
    #[serde(default = "d_30")]
    pub batch_hold_secs: u64,
    /// Cadence of the drain tick.
    #[serde(default = "d_30")]
    pub batch_tick_secs: u64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            echo_window_secs: 5,
            batch_hold_secs: 30,
            batch_tick_secs: 30,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Config {
    /// Check the config for mistakes that would make the daemon misbehave.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.supervisor.backoff_floor_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "supervisor.backoff_floor_secs must be at least 1".into(),
            });
        }
        if self.supervisor.backoff_ceiling_secs < self.supervisor.backoff_floor_secs {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "supervisor.backoff_ceiling_secs is below the floor".into(),
            });
        }
        if self.supervisor.ping_failure_limit == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "supervisor.ping_failure_limit must be at least 1".into(),
            });
        }
        if self.supervisor.log_ring_capacity == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "supervisor.log_ring_capacity is 0, child logs will be dropped".into(),
            });
        }
        if self.adapters.package_dirs.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "adapters.package_dirs is empty, no adapter types will resolve".into(),
            });
        }
        if self.triage.echo_window_secs == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "triage.echo_window_secs is 0, command echoes will not be suppressed"
                    .into(),
            });
        }

        issues
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn d_package_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("adapters")]
}

fn d_2() -> u64 {
    2
}

fn d_3() -> u32 {
    3
}

fn d_5() -> u64 {
    5
}

fn d_10() -> u64 {
    10
}

fn d_15() -> u64 {
    15
}

fn d_30() -> u64 {
    30
}

fn d_60() -> u64 {
    60
}

fn d_500() -> usize {
    500
}

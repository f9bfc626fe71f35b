//! Process configuration
//!
//! All configuration is environment-sourced and loaded once at startup.
//! Anything invalid here is a fatal configuration error: the daemon must
//! not come up half-configured.

use std::time::Duration;

use ipnet::IpNet;

use crate::error::{Result, RoutesyncError};
use crate::types::TableId;

/// Name of the variable selecting the managed routing table.
pub const ENV_TARGET_TABLE: &str = "TARGET_TABLE";
/// Substring marking variables that contribute protected subnets.
pub const ENV_PROTECTED_SUBNET_MARKER: &str = "PROTECTED_SUBNET_";
/// Name of the variable carrying the local node identity.
pub const ENV_NODE_HOSTNAME: &str = "NODE_HOSTNAME";
/// Reconciliation tick interval override, in seconds.
pub const ENV_RECONCILE_INTERVAL: &str = "RECONCILE_INTERVAL_SECS";
/// Kernel operation timeout override, in milliseconds.
pub const ENV_KERNEL_TIMEOUT: &str = "KERNEL_TIMEOUT_MS";
/// Intent redelivery delay override, in seconds.
pub const ENV_REQUEUE_DELAY: &str = "REQUEUE_DELAY_SECS";

const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_KERNEL_TIMEOUT: Duration = Duration::from_millis(2000);
const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(5);

/// Bounded backoff policy for transient kernel failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per command, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given retry (0-based), doubling and capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let doubled = self
            .initial_backoff
            .saturating_mul(1u32 << retry.min(16));
        doubled.min(self.max_backoff)
    }
}

/// Daemon configuration, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct Config {
    /// Kernel routing table exclusively managed by this instance.
    pub table: TableId,
    /// Identity used to scope which intents apply locally.
    pub node_hostname: String,
    /// Administrator-protected networks, never valid destinations.
    pub protected_subnets: Vec<IpNet>,
    /// Interval between drift-healing reconciliation ticks.
    pub reconcile_interval: Duration,
    /// Upper bound on any single kernel query or mutation.
    pub kernel_timeout: Duration,
    /// Delay before a transiently failed intent event is redelivered.
    pub requeue_delay: Duration,
    pub retry: RetryPolicy,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Loads configuration from an explicit variable set (testable form).
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let vars: Vec<(String, String)> = vars.into_iter().collect();
        let get = |name: &str| {
            vars.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        let table = match get(ENV_TARGET_TABLE) {
            None | Some("") => TableId::MAIN,
            Some(raw) => {
                let parsed: i64 = raw.trim().parse().map_err(|_| {
                    RoutesyncError::Config(format!(
                        "unable to parse {ENV_TARGET_TABLE}={raw} as an integer"
                    ))
                })?;
                TableId::new(parsed)?
            }
        };

        let node_hostname = get(ENV_NODE_HOSTNAME)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                RoutesyncError::Config(format!("missing environment variable: {ENV_NODE_HOSTNAME}"))
            })?
            .to_string();

        let protected_subnets = collect_protected_subnets(&vars)?;

        let reconcile_interval = match get(ENV_RECONCILE_INTERVAL) {
            None | Some("") => DEFAULT_RECONCILE_INTERVAL,
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    RoutesyncError::Config(format!(
                        "unable to parse {ENV_RECONCILE_INTERVAL}={raw} as seconds"
                    ))
                })?;
                if secs == 0 {
                    return Err(RoutesyncError::Config(format!(
                        "{ENV_RECONCILE_INTERVAL} must be at least 1"
                    )));
                }
                Duration::from_secs(secs)
            }
        };

        let kernel_timeout = match get(ENV_KERNEL_TIMEOUT) {
            None | Some("") => DEFAULT_KERNEL_TIMEOUT,
            Some(raw) => {
                let millis: u64 = raw.trim().parse().map_err(|_| {
                    RoutesyncError::Config(format!(
                        "unable to parse {ENV_KERNEL_TIMEOUT}={raw} as milliseconds"
                    ))
                })?;
                if millis == 0 {
                    return Err(RoutesyncError::Config(format!(
                        "{ENV_KERNEL_TIMEOUT} must be at least 1"
                    )));
                }
                Duration::from_millis(millis)
            }
        };

        let requeue_delay = match get(ENV_REQUEUE_DELAY) {
            None | Some("") => DEFAULT_REQUEUE_DELAY,
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| {
                    RoutesyncError::Config(format!(
                        "unable to parse {ENV_REQUEUE_DELAY}={raw} as seconds"
                    ))
                })?;
                if secs == 0 {
                    return Err(RoutesyncError::Config(format!(
                        "{ENV_REQUEUE_DELAY} must be at least 1"
                    )));
                }
                Duration::from_secs(secs)
            }
        };

        Ok(Self {
            table,
            node_hostname,
            protected_subnets,
            reconcile_interval,
            kernel_timeout,
            requeue_delay,
            retry: RetryPolicy::default(),
        })
    }
}

/// Collects CIDR blocks from every variable whose name contains the
/// protected-subnet marker. Each variable holds a comma-separated list.
fn collect_protected_subnets(vars: &[(String, String)]) -> Result<Vec<IpNet>> {
    let mut subnets = Vec::new();
    for (key, value) in vars {
        if !key.contains(ENV_PROTECTED_SUBNET_MARKER) {
            continue;
        }
        for entry in value.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let subnet: IpNet = entry.parse().map_err(|_| {
                RoutesyncError::Config(format!("unable to parse protected subnet {key}={entry}"))
            })?;
            subnets.push(subnet);
        }
    }
    Ok(subnets)
}

//! Application configuration.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides: variables prefixed with `AUTOHEAL_` override YAML values, with
//! double underscores for nesting (`AUTOHEAL_POLICY__MAX_ATTEMPTS=5` sets
//! `policy.max_attempts`).
//!
//! Reloads go through [`ConfigHandle`]: the new tree is validated first and
//! swapped in atomically, so a reload either applies fully or not at all, and
//! ticks already in flight keep the snapshot they started with.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{AutohealError, Result};
use crate::types::{Device, DeviceClass, IssueKind, PriorityTier};

/// Scheduling, timeout, and concurrency settings for the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Base interval between polls of a single device.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound of the random delay added to each poll to avoid
    /// thundering-herd polling across the fleet.
    #[serde(with = "humantime_serde")]
    pub poll_jitter: Duration,

    /// Deadline for one telemetry fetch. Expiry counts as an unreachable
    /// reading, not a tick failure.
    #[serde(with = "humantime_serde")]
    pub telemetry_timeout: Duration,

    /// Deadline for one remediation action (reboots can take minutes).
    #[serde(with = "humantime_serde")]
    pub action_timeout: Duration,

    /// Fleet-wide cap on outstanding telemetry/executor calls.
    pub max_concurrent_calls: usize,

    /// Pause before the single retry of an errored collaborator call.
    #[serde(with = "humantime_serde")]
    pub collaborator_retry_delay: Duration,

    /// Consecutive collaborator failures (across the whole fleet) before a
    /// system-level degraded-mode alert fires.
    pub degraded_mode_threshold: usize,

    /// Interval for logging orchestrator status (calls in flight).
    /// `None` disables periodic status logging.
    #[serde(with = "humantime_serde")]
    pub status_log_interval: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            poll_jitter: Duration::from_secs(5),
            telemetry_timeout: Duration::from_secs(10),
            action_timeout: Duration::from_secs(120),
            max_concurrent_calls: 20,
            collaborator_retry_delay: Duration::from_secs(2),
            degraded_mode_threshold: 5,
            status_log_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Classifier thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Thresholds {
    /// Utilization above this on two consecutive readings is degraded.
    pub cpu_degraded: f64,
    /// Utilization above this on two consecutive readings is critical.
    pub cpu_critical: f64,
    pub memory_degraded: f64,
    pub memory_critical: f64,

    /// Interface name prefixes treated as trunk/uplink ports; a down uplink
    /// is critical rather than degraded.
    pub uplink_prefixes: Vec<String>,

    /// Minimum readings required before the classifier renders a verdict.
    pub min_readings: usize,

    /// Readings retained per device for trend evaluation.
    pub window: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_degraded: 80.0,
            cpu_critical: 95.0,
            memory_degraded: 85.0,
            memory_critical: 95.0,
            uplink_prefixes: vec!["uplink".to_string(), "trunk".to_string()],
            min_readings: 1,
            window: 5,
        }
    }
}

/// Policy rules and retry/backoff bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Global kill-switch: when false no remediation is ever dispatched.
    pub remediation_enabled: bool,

    /// Global kill-switch for the notifier path. Alert events are still
    /// broadcast to in-process subscribers.
    pub alerts_enabled: bool,

    /// Remediation attempts per issue episode before escalation.
    pub max_attempts: u32,

    /// Cooldown after attempt n is `min(cap, base * 2^(n-1))`.
    #[serde(with = "humantime_serde")]
    pub cooldown_base: Duration,

    #[serde(with = "humantime_serde")]
    pub cooldown_cap: Duration,

    /// Priority tiers whose devices need manual approval before remediation.
    pub approval_tiers: BTreeSet<PriorityTier>,

    /// Issue kinds never auto-remediated for a given device class.
    pub class_disabled: BTreeMap<DeviceClass, BTreeSet<IssueKind>>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            remediation_enabled: true,
            alerts_enabled: true,
            max_attempts: 3,
            cooldown_base: Duration::from_secs(30),
            cooldown_cap: Duration::from_secs(600),
            approval_tiers: BTreeSet::new(),
            class_disabled: BTreeMap::new(),
        }
    }
}

/// Root configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub thresholds: Thresholds,
    pub policy: PolicyConfig,
    pub devices: Vec<Device>,
}

impl Config {
    /// Load configuration from a YAML file merged with `AUTOHEAL_`-prefixed
    /// environment variables, then validate it.
    pub fn load(path: &str) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("AUTOHEAL_").split("__"))
            .extract()
            .map_err(|e| AutohealError::ConfigInvalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the whole tree. A config that fails here is never applied.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if s.poll_interval.is_zero() {
            return Err(invalid("scheduler.poll_interval must be non-zero"));
        }
        if s.max_concurrent_calls == 0 {
            return Err(invalid("scheduler.max_concurrent_calls must be at least 1"));
        }
        if s.telemetry_timeout.is_zero() || s.action_timeout.is_zero() {
            return Err(invalid("scheduler timeouts must be non-zero"));
        }
        if s.degraded_mode_threshold == 0 {
            return Err(invalid("scheduler.degraded_mode_threshold must be at least 1"));
        }

        let t = &self.thresholds;
        for (name, value) in [
            ("cpu_degraded", t.cpu_degraded),
            ("cpu_critical", t.cpu_critical),
            ("memory_degraded", t.memory_degraded),
            ("memory_critical", t.memory_critical),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(invalid(&format!(
                    "thresholds.{name} must be within 0..=100, got {value}"
                )));
            }
        }
        if t.cpu_critical < t.cpu_degraded {
            return Err(invalid("thresholds.cpu_critical must be >= cpu_degraded"));
        }
        if t.memory_critical < t.memory_degraded {
            return Err(invalid(
                "thresholds.memory_critical must be >= memory_degraded",
            ));
        }
        if t.min_readings == 0 {
            return Err(invalid("thresholds.min_readings must be at least 1"));
        }
        if t.window < t.min_readings {
            return Err(invalid("thresholds.window must be >= min_readings"));
        }

        let p = &self.policy;
        if p.max_attempts == 0 {
            return Err(invalid("policy.max_attempts must be at least 1"));
        }
        if p.cooldown_cap < p.cooldown_base {
            return Err(invalid("policy.cooldown_cap must be >= cooldown_base"));
        }

        let mut seen = BTreeSet::new();
        for device in &self.devices {
            if device.address.is_empty() {
                return Err(invalid("device address must be non-empty"));
            }
            if !seen.insert(device.address.as_str()) {
                return Err(invalid(&format!(
                    "duplicate device address: {}",
                    device.address
                )));
            }
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> AutohealError {
    AutohealError::ConfigInvalid(msg.to_string())
}

/// Shared handle to the active configuration.
///
/// Readers take an `Arc` snapshot per tick; a reload swaps the `Arc` so
/// in-flight ticks finish under the configuration they started with.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// The configuration active right now.
    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.read().clone()
    }

    /// Validate and atomically install a new configuration.
    ///
    /// On validation failure the previous configuration stays active and the
    /// error is returned to the caller.
    pub fn swap(&self, config: Config) -> Result<()> {
        config.validate()?;
        *self.inner.write() = Arc::new(config);
        Ok(())
    }
}

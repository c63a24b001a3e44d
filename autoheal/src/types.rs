//! Core domain types for the autoheal system.
//!
//! Everything here is plain data: devices and their static attributes, polled
//! health readings, classifier verdicts, the closed remediation action
//! catalog, and the immutable attempt records kept per device.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Devices are keyed by their network address (the registry's map key).
pub type DeviceId = String;

/// Unique identifier for a remediation attempt.
pub type AttemptId = Uuid;

/// Operator-assigned priority tier, used by policy for approval gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Critical,
    High,
    Medium,
}

/// Coarse device category; policy can disable remediation kinds per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceClass {
    Switch,
    Router,
    AccessPoint,
    Firewall,
    Other,
}

/// Per-device policy overrides from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemediationOverrides {
    /// Issue kinds that must not be auto-remediated on this device.
    pub disabled: BTreeSet<IssueKind>,
    /// Overrides the tier-based manual-approval requirement when set.
    pub require_approval: Option<bool>,
}

/// A monitored network device.
///
/// Immutable except via configuration reload; the registry owns exactly one
/// [`crate::device::DeviceRecord`] per device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Device {
    /// Network address used for all collaborator calls (registry key).
    pub address: String,
    pub hostname: String,
    pub class: DeviceClass,
    pub tier: PriorityTier,
    #[serde(default)]
    pub overrides: RemediationOverrides,
}

/// Operational and administrative status of a single interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStatus {
    pub oper_up: bool,
    pub admin_up: bool,
}

/// One polled health snapshot for a device.
///
/// Readings are consumed into a bounded per-device window and never retained
/// beyond what trend evaluation needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReading {
    pub at: DateTime<Utc>,
    pub reachable: bool,
    pub interfaces: BTreeMap<String, InterfaceStatus>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
}

impl HealthReading {
    /// Reading synthesized when the telemetry collaborator times out or
    /// repeatedly errors: the device counts as unreachable for that poll.
    pub fn unreachable(at: DateTime<Utc>) -> Self {
        Self {
            at,
            reachable: false,
            interfaces: BTreeMap::new(),
            cpu_percent: None,
            memory_percent: None,
        }
    }
}

/// The kind of problem a verdict identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    InterfaceDown,
    HighCpu,
    HighMemory,
    Unreachable,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssueKind::InterfaceDown => "interface-down",
            IssueKind::HighCpu => "high-cpu",
            IssueKind::HighMemory => "high-memory",
            IssueKind::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// Severity tag attached to a non-healthy verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Degraded,
    Critical,
    Unresponsive,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Degraded => "degraded",
            Severity::Critical => "critical",
            Severity::Unresponsive => "unresponsive",
        };
        f.write_str(s)
    }
}

/// Evidence supporting a verdict's issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Evidence {
    Interface { name: String, uplink: bool },
    Utilization { percent: f64 },
    Unreachable { consecutive_misses: u32 },
}

/// A concrete problem on a device: what kind, and why we think so.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub evidence: Evidence,
}

/// The classifier's discrete health judgment for one device at one poll.
///
/// Recomputed every cycle from the reading window; never stored beyond the
/// `last_verdict` field on the device record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthVerdict {
    /// Fewer readings than the classifier needs; the orchestrator treats this
    /// as a no-op (no state transition).
    Unknown,
    Healthy,
    Unhealthy { severity: Severity, issue: Issue },
}

impl HealthVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthVerdict::Healthy)
    }

    pub fn issue_kind(&self) -> Option<IssueKind> {
        match self {
            HealthVerdict::Unhealthy { issue, .. } => Some(issue.kind),
            _ => None,
        }
    }
}

/// The closed catalog of remediation actions.
///
/// New actions are added by extending this catalog and the policy table, not
/// by plugging in new executor implementations per action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionSpec {
    InterfaceRecovery { interface: String },
    DeviceReboot,
    ProcessRestart,
    CacheClear,
}

impl ActionSpec {
    /// Default action for an issue, mirroring the remediation table the
    /// system ships with.
    pub fn for_issue(issue: &Issue) -> Self {
        match issue.kind {
            IssueKind::InterfaceDown => {
                let interface = match &issue.evidence {
                    Evidence::Interface { name, .. } => name.clone(),
                    _ => String::new(),
                };
                ActionSpec::InterfaceRecovery { interface }
            }
            IssueKind::Unreachable => ActionSpec::DeviceReboot,
            IssueKind::HighCpu => ActionSpec::ProcessRestart,
            IssueKind::HighMemory => ActionSpec::CacheClear,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActionSpec::InterfaceRecovery { .. } => "interface-recovery",
            ActionSpec::DeviceReboot => "device-reboot",
            ActionSpec::ProcessRestart => "process-restart",
            ActionSpec::CacheClear => "cache-clear",
        }
    }
}

impl fmt::Display for ActionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a closed remediation attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
    Timeout,
}

/// Result of the mandatory post-action health re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verification {
    /// Follow-up verdict was healthy.
    Confirmed,
    /// Action reported success but the same issue persisted.
    Mismatch,
    /// A different issue appeared before verification completed.
    Superseded,
    /// Attempt failed or timed out, so no verification was performed.
    NotRequired,
}

/// Immutable record of one closed remediation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: AttemptId,
    pub issue: IssueKind,
    pub action: ActionSpec,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub message: String,
    pub verification: Verification,
}

/// Category of an operator-facing alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    /// Policy requires a human to approve remediation for this device.
    ApprovalRequired,
    /// The retry budget for an issue episode is exhausted.
    Escalated,
    /// Collaborator calls are failing fleet-wide, not just for one device.
    SystemDegraded,
}

/// Event delivered to the notifier collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertKind,
    /// `None` for system-level alerts.
    pub device: Option<DeviceId>,
    pub hostname: Option<String>,
    pub severity: Severity,
    pub issue: Option<IssueKind>,
    pub message: String,
    pub requires_approval: bool,
    pub at: DateTime<Utc>,
}

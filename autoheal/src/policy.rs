//! Remediation policy.
//!
//! [`evaluate`] decides whether a remediation may be dispatched for a
//! device+issue combination. It is a pure function of its inputs (device,
//! issue kind, episode bookkeeping, configuration, and the caller-supplied
//! clock value), so policy can be tested independently of timing and device
//! state. Rules apply in order; the first match wins.

use chrono::{DateTime, Utc};

use crate::config::PolicyConfig;
use crate::types::{Device, IssueKind};

/// Inputs to one policy evaluation.
#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub device: &'a Device,
    pub issue: IssueKind,
    /// Attempts already consumed in the current issue episode.
    pub attempt_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// True once an operator has approved remediation for this episode.
    pub approved: bool,
    pub now: DateTime<Utc>,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(DenyReason),
    NeedsApproval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The global remediation kill-switch is off.
    AutomationDisabled,
    /// This issue kind is disabled for the device or its class.
    ActionDisabled,
    /// The episode cooldown has not elapsed yet.
    CoolingDown { until: DateTime<Utc> },
    /// The episode has already consumed its attempt budget.
    RetryBudgetExhausted,
}

/// Evaluate whether remediation is permitted right now.
pub fn evaluate(input: &PolicyInput<'_>, config: &PolicyConfig) -> PolicyDecision {
    if !config.remediation_enabled {
        return PolicyDecision::Deny(DenyReason::AutomationDisabled);
    }

    let device = input.device;
    let class_disabled = config
        .class_disabled
        .get(&device.class)
        .is_some_and(|kinds| kinds.contains(&input.issue));
    if device.overrides.disabled.contains(&input.issue) || class_disabled {
        return PolicyDecision::Deny(DenyReason::ActionDisabled);
    }

    let needs_approval = device
        .overrides
        .require_approval
        .unwrap_or_else(|| config.approval_tiers.contains(&device.tier));
    if needs_approval && !input.approved {
        return PolicyDecision::NeedsApproval;
    }

    if let Some(until) = input.cooldown_until {
        if until > input.now {
            return PolicyDecision::Deny(DenyReason::CoolingDown { until });
        }
    }

    if input.attempt_count >= config.max_attempts {
        return PolicyDecision::Deny(DenyReason::RetryBudgetExhausted);
    }

    PolicyDecision::Allow
}

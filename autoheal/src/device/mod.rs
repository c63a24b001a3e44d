//! Per-device state machine.
//!
//! One [`DeviceRecord`] exists per monitored device, exclusively owned and
//! mutated by the orchestrator on that device's behalf. The enumerated
//! [`DeviceState`] makes illegal combinations unrepresentable: a device in
//! `Remediating` carries exactly one in-flight attempt, and there is no way
//! to start a second one without first recording an outcome.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::PolicyConfig;
use crate::types::{
    ActionSpec, AttemptId, AttemptRecord, Device, HealthReading, HealthVerdict, Issue, IssueKind,
    Severity,
};

mod transitions;

pub use transitions::MachineEvent;

/// Closed attempt records kept per device for audit and snapshots.
const ATTEMPT_HISTORY_LIMIT: usize = 32;

/// The remediation attempt currently in flight (or awaiting verification).
#[derive(Debug, Clone, Serialize)]
pub struct InFlightAttempt {
    pub id: AttemptId,
    pub action: ActionSpec,
    pub started_at: DateTime<Utc>,
    /// 1-based attempt number within the episode.
    pub number: u32,
}

/// A successful attempt waiting for its follow-up health check.
///
/// The attempt record is only appended to history once verification closes
/// it, so history entries stay immutable.
#[derive(Debug, Clone, Serialize)]
pub struct PendingVerification {
    pub attempt: InFlightAttempt,
    pub finished_at: DateTime<Utc>,
    pub message: String,
}

/// Current position of a device in its health lifecycle.
#[derive(Debug, Clone, Serialize)]
pub enum DeviceState {
    Healthy,
    Degraded {
        issue: Issue,
        severity: Severity,
        since: DateTime<Utc>,
    },
    Remediating {
        issue: Issue,
        severity: Severity,
        attempt: InFlightAttempt,
    },
    Verifying {
        issue: Issue,
        severity: Severity,
        pending: PendingVerification,
    },
    /// Terminal until an external reset or a fresh healthy verdict.
    Escalated {
        issue: Issue,
        since: DateTime<Utc>,
    },
}

/// Discriminant of [`DeviceState`], used in snapshots and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Healthy,
    Degraded,
    Remediating,
    Verifying,
    Escalated,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StateKind::Healthy => "healthy",
            StateKind::Degraded => "degraded",
            StateKind::Remediating => "remediating",
            StateKind::Verifying => "verifying",
            StateKind::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

impl DeviceState {
    pub fn kind(&self) -> StateKind {
        match self {
            DeviceState::Healthy => StateKind::Healthy,
            DeviceState::Degraded { .. } => StateKind::Degraded,
            DeviceState::Remediating { .. } => StateKind::Remediating,
            DeviceState::Verifying { .. } => StateKind::Verifying,
            DeviceState::Escalated { .. } => StateKind::Escalated,
        }
    }

    pub fn issue(&self) -> Option<&Issue> {
        match self {
            DeviceState::Healthy => None,
            DeviceState::Degraded { issue, .. }
            | DeviceState::Remediating { issue, .. }
            | DeviceState::Verifying { issue, .. }
            | DeviceState::Escalated { issue, .. } => Some(issue),
        }
    }

    pub fn severity(&self) -> Option<Severity> {
        match self {
            DeviceState::Healthy => None,
            DeviceState::Degraded { severity, .. }
            | DeviceState::Remediating { severity, .. }
            | DeviceState::Verifying { severity, .. } => Some(*severity),
            DeviceState::Escalated { .. } => Some(Severity::Critical),
        }
    }
}

/// Read-only copy of a device's live state, taken under the registry lock
/// and handed out by value so no reader ever blocks a device loop.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device: Device,
    pub state: StateKind,
    pub issue: Option<IssueKind>,
    pub severity: Option<Severity>,
    pub attempt_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_verdict: Option<HealthVerdict>,
    pub awaiting_approval: bool,
    pub recent_attempts: Vec<AttemptRecord>,
    pub taken_at: DateTime<Utc>,
}

/// Live state-machine instance for one device.
pub struct DeviceRecord {
    pub device: Device,
    pub state: DeviceState,
    /// Attempts consumed in the current issue episode.
    pub attempt_count: u32,
    /// No remediation may be dispatched before this instant.
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Consecutive healthy verdicts, for self-resolution short-circuiting.
    pub healthy_streak: u32,
    pub last_verdict: Option<HealthVerdict>,
    /// Operator approval for the current episode.
    pub approved: bool,
    /// Whether the outstanding approval request has been surfaced already.
    pub approval_notified: bool,
    /// Operator-chosen action overriding the default for the next dispatch.
    pub forced_action: Option<ActionSpec>,
    /// Manual-action request accepted but not yet folded in. Drained at the
    /// start of a tick once the state can accept it, so it never interleaves
    /// with an in-flight attempt.
    pub pending_manual: Option<ActionSpec>,
    history: VecDeque<AttemptRecord>,
    readings: Vec<HealthReading>,
}

impl DeviceRecord {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            state: DeviceState::Healthy,
            attempt_count: 0,
            cooldown_until: None,
            healthy_streak: 0,
            last_verdict: None,
            approved: false,
            approval_notified: false,
            forced_action: None,
            pending_manual: None,
            history: VecDeque::new(),
            readings: Vec::new(),
        }
    }

    /// Append a reading to the bounded trend window.
    pub fn push_reading(&mut self, reading: HealthReading, window: usize) {
        if window == 0 {
            return;
        }
        while self.readings.len() >= window {
            self.readings.remove(0);
        }
        self.readings.push(reading);
    }

    pub fn readings(&self) -> &[HealthReading] {
        &self.readings
    }

    pub fn history(&self) -> impl Iterator<Item = &AttemptRecord> {
        self.history.iter()
    }

    /// Start remediation for the current degraded issue.
    ///
    /// Returns `None` unless the device is in `Degraded`; callers cannot
    /// double-dispatch because the transition to `Remediating` happens here,
    /// under the same registry lock as the check.
    pub fn begin_remediation(&mut self, now: DateTime<Utc>) -> Option<InFlightAttempt> {
        let DeviceState::Degraded { issue, severity, .. } = &self.state else {
            return None;
        };
        let issue = issue.clone();
        let severity = *severity;
        let action = self
            .forced_action
            .take()
            .unwrap_or_else(|| ActionSpec::for_issue(&issue));
        let attempt = InFlightAttempt {
            id: Uuid::new_v4(),
            action,
            started_at: now,
            number: self.attempt_count + 1,
        };
        tracing::info!(
            device = %self.device.address,
            issue = %issue.kind,
            action = %attempt.action,
            attempt = attempt.number,
            "Dispatching remediation"
        );
        self.state = DeviceState::Remediating {
            issue,
            severity,
            attempt: attempt.clone(),
        };
        Some(attempt)
    }

    /// Take the queued operator request if the current state can accept it.
    ///
    /// While an attempt is in flight or awaiting verification the request
    /// stays queued and is retried on a later tick once the device settles
    /// back into `Degraded` or `Escalated`.
    pub fn take_pending_manual(&mut self) -> Option<ActionSpec> {
        match self.state.kind() {
            StateKind::Degraded | StateKind::Escalated => self.pending_manual.take(),
            _ => None,
        }
    }

    /// Apply an externally submitted manual action request.
    ///
    /// For a parked `Degraded` device this satisfies the approval gate; for
    /// an `Escalated` device it acts as the external reset, returning it to
    /// `Degraded` with a fresh attempt budget. Cooldowns stay in force.
    pub fn apply_manual_action(&mut self, action: ActionSpec, now: DateTime<Utc>) {
        match &self.state {
            DeviceState::Degraded { .. } => {
                self.approved = true;
                self.forced_action = Some(action);
            }
            DeviceState::Escalated { issue, .. } => {
                let issue = issue.clone();
                self.attempt_count = 0;
                self.approved = true;
                self.approval_notified = false;
                self.forced_action = Some(action);
                self.state = DeviceState::Degraded {
                    issue,
                    severity: Severity::Critical,
                    since: now,
                };
            }
            other => {
                tracing::warn!(
                    device = %self.device.address,
                    state = %other.kind(),
                    "Manual action ignored: device is not awaiting intervention"
                );
            }
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device: self.device.clone(),
            state: self.state.kind(),
            issue: self.state.issue().map(|i| i.kind),
            severity: self.state.severity(),
            attempt_count: self.attempt_count,
            cooldown_until: self.cooldown_until,
            last_verdict: self.last_verdict.clone(),
            awaiting_approval: self.approval_notified && !self.approved,
            recent_attempts: self.history.iter().cloned().collect(),
            taken_at: Utc::now(),
        }
    }

    fn push_history(&mut self, record: AttemptRecord) {
        while self.history.len() >= ATTEMPT_HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(record);
    }

    /// Clear episode bookkeeping on resolution or when a new issue begins.
    fn reset_episode(&mut self) {
        self.attempt_count = 0;
        self.cooldown_until = None;
        self.approved = false;
        self.approval_notified = false;
        self.forced_action = None;
        if self.pending_manual.take().is_some() {
            tracing::info!(
                device = %self.device.address,
                "Discarding queued manual action, the episode it targeted is over"
            );
        }
    }

    fn set_cooldown(&mut self, now: DateTime<Utc>, policy: &PolicyConfig) {
        let cooldown = cooldown_after(policy, self.attempt_count);
        let delta = chrono::Duration::from_std(cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        self.cooldown_until = Some(
            now.checked_add_signed(delta)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
    }
}

/// Cooldown enforced after attempt `n`: `min(cap, base * 2^(n-1))`.
pub fn cooldown_after(policy: &PolicyConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    policy
        .cooldown_base
        .checked_mul(1u32 << shift)
        .map_or(policy.cooldown_cap, |d| d.min(policy.cooldown_cap))
}

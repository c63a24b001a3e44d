//! State transitions driven by verdicts and attempt outcomes.
//!
//! Transitions are synchronous and infallible: they take the current state by
//! value (`mem::replace`), compute the successor, and report what happened as
//! [`MachineEvent`]s. The orchestrator owns all I/O and alerting; nothing in
//! here awaits or calls a collaborator.

use std::mem;

use chrono::{DateTime, Utc};

use crate::config::PolicyConfig;
use crate::types::{
    AttemptOutcome, AttemptRecord, HealthVerdict, Issue, Severity, Verification,
};

use super::{DeviceRecord, DeviceState, PendingVerification};

/// Verdicts a device must produce in a row before a degraded episode is
/// considered self-resolved.
const SELF_RESOLVE_STREAK: u32 = 2;

/// What a transition did, for the orchestrator to log and alert on.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    /// A healthy device became unhealthy.
    IssueDetected { issue: Issue, severity: Severity },
    /// The active issue was replaced by a different one; the attempt budget
    /// and approval state start over.
    NewEpisode { issue: Issue },
    /// The issue cleared on its own without remediation help.
    SelfResolved,
    /// An attempt reported success; the next verdict decides whether it took.
    AwaitingVerification,
    /// The follow-up verdict confirmed the fix.
    VerificationConfirmed,
    /// The action reported success but the issue persisted.
    VerificationMismatch,
    /// An attempt ended in failure or timeout.
    AttemptFailed {
        outcome: AttemptOutcome,
        attempt: u32,
        will_retry: bool,
    },
    /// The attempt budget is exhausted; a human has to take over.
    Escalated { issue: Issue },
    /// An escalated device came back healthy without intervention.
    EscalationCleared,
}

impl DeviceRecord {
    /// Fold a fresh classifier verdict into the state machine.
    ///
    /// `Unknown` never transitions. While an attempt is in flight the verdict
    /// is recorded but the state is left alone; the outcome lands first.
    pub fn apply_verdict(
        &mut self,
        verdict: &HealthVerdict,
        now: DateTime<Utc>,
        policy: &PolicyConfig,
    ) -> Vec<MachineEvent> {
        match verdict {
            HealthVerdict::Unknown => return Vec::new(),
            HealthVerdict::Healthy => self.healthy_streak += 1,
            HealthVerdict::Unhealthy { .. } => self.healthy_streak = 0,
        }
        self.last_verdict = Some(verdict.clone());

        let mut events = Vec::new();
        let state = mem::replace(&mut self.state, DeviceState::Healthy);
        self.state = match (state, verdict) {
            (DeviceState::Healthy, HealthVerdict::Healthy) => DeviceState::Healthy,
            (DeviceState::Healthy, HealthVerdict::Unhealthy { severity, issue }) => {
                tracing::warn!(
                    device = %self.device.address,
                    issue = %issue.kind,
                    severity = %severity,
                    "Issue detected"
                );
                events.push(MachineEvent::IssueDetected {
                    issue: issue.clone(),
                    severity: *severity,
                });
                DeviceState::Degraded {
                    issue: issue.clone(),
                    severity: *severity,
                    since: now,
                }
            }

            (DeviceState::Degraded { issue, severity, since }, HealthVerdict::Healthy) => {
                if self.healthy_streak >= SELF_RESOLVE_STREAK {
                    tracing::info!(device = %self.device.address, issue = %issue.kind, "Issue self-resolved");
                    self.reset_episode();
                    events.push(MachineEvent::SelfResolved);
                    DeviceState::Healthy
                } else {
                    DeviceState::Degraded { issue, severity, since }
                }
            }
            (
                DeviceState::Degraded { issue, since, .. },
                HealthVerdict::Unhealthy {
                    severity: new_severity,
                    issue: new_issue,
                },
            ) => {
                if new_issue.kind == issue.kind {
                    // Same episode; refresh the evidence and severity.
                    DeviceState::Degraded {
                        issue: new_issue.clone(),
                        severity: *new_severity,
                        since,
                    }
                } else {
                    self.reset_episode();
                    events.push(MachineEvent::NewEpisode {
                        issue: new_issue.clone(),
                    });
                    DeviceState::Degraded {
                        issue: new_issue.clone(),
                        severity: *new_severity,
                        since: now,
                    }
                }
            }

            // One attempt in flight; verdicts wait for the outcome.
            (state @ DeviceState::Remediating { .. }, _) => state,

            (DeviceState::Verifying { issue, pending, .. }, HealthVerdict::Healthy) => {
                self.close_pending(issue.kind, pending, Verification::Confirmed);
                tracing::info!(
                    device = %self.device.address,
                    issue = %issue.kind,
                    "Remediation verified"
                );
                self.reset_episode();
                events.push(MachineEvent::VerificationConfirmed);
                DeviceState::Healthy
            }
            (
                DeviceState::Verifying { issue, pending, .. },
                HealthVerdict::Unhealthy {
                    severity: new_severity,
                    issue: new_issue,
                },
            ) => {
                if new_issue.kind == issue.kind {
                    self.close_pending(issue.kind, pending, Verification::Mismatch);
                    tracing::warn!(
                        device = %self.device.address,
                        issue = %issue.kind,
                        attempt = self.attempt_count,
                        "Action reported success but issue persists"
                    );
                    events.push(MachineEvent::VerificationMismatch);
                    if self.attempt_count >= policy.max_attempts {
                        events.push(MachineEvent::Escalated {
                            issue: new_issue.clone(),
                        });
                        DeviceState::Escalated {
                            issue: new_issue.clone(),
                            since: now,
                        }
                    } else {
                        self.set_cooldown(now, policy);
                        DeviceState::Degraded {
                            issue: new_issue.clone(),
                            severity: *new_severity,
                            since: now,
                        }
                    }
                } else {
                    self.close_pending(issue.kind, pending, Verification::Superseded);
                    self.reset_episode();
                    events.push(MachineEvent::NewEpisode {
                        issue: new_issue.clone(),
                    });
                    DeviceState::Degraded {
                        issue: new_issue.clone(),
                        severity: *new_severity,
                        since: now,
                    }
                }
            }

            (DeviceState::Escalated { issue, .. }, HealthVerdict::Healthy) => {
                tracing::info!(
                    device = %self.device.address,
                    issue = %issue.kind,
                    "Escalated device recovered"
                );
                self.reset_episode();
                events.push(MachineEvent::EscalationCleared);
                DeviceState::Healthy
            }
            (state @ DeviceState::Escalated { .. }, HealthVerdict::Unhealthy { .. }) => state,

            // Unknown was handled above.
            (state, HealthVerdict::Unknown) => state,
        };
        events
    }

    /// Record the outcome of the in-flight attempt.
    ///
    /// Success holds the attempt open for verification by the next verdict;
    /// failure and timeout close it immediately, backing off or escalating.
    pub fn apply_outcome(
        &mut self,
        outcome: AttemptOutcome,
        message: String,
        now: DateTime<Utc>,
        policy: &PolicyConfig,
    ) -> Vec<MachineEvent> {
        let state = mem::replace(&mut self.state, DeviceState::Healthy);
        let DeviceState::Remediating { issue, severity, attempt } = state else {
            tracing::error!(
                device = %self.device.address,
                "Attempt outcome arrived with no attempt in flight"
            );
            self.state = state;
            return Vec::new();
        };

        self.attempt_count += 1;
        let mut events = Vec::new();
        self.state = match outcome {
            AttemptOutcome::Success => {
                tracing::info!(
                    device = %self.device.address,
                    action = %attempt.action,
                    attempt = attempt.number,
                    "Action succeeded, awaiting verification"
                );
                events.push(MachineEvent::AwaitingVerification);
                DeviceState::Verifying {
                    issue,
                    severity,
                    pending: PendingVerification {
                        attempt,
                        finished_at: now,
                        message,
                    },
                }
            }
            AttemptOutcome::Failure | AttemptOutcome::Timeout => {
                self.push_history(AttemptRecord {
                    id: attempt.id,
                    issue: issue.kind,
                    action: attempt.action.clone(),
                    started_at: attempt.started_at,
                    finished_at: now,
                    outcome,
                    message: message.clone(),
                    verification: Verification::NotRequired,
                });
                let will_retry = self.attempt_count < policy.max_attempts;
                tracing::warn!(
                    device = %self.device.address,
                    action = %attempt.action,
                    attempt = attempt.number,
                    outcome = ?outcome,
                    will_retry,
                    %message,
                    "Action did not succeed"
                );
                events.push(MachineEvent::AttemptFailed {
                    outcome,
                    attempt: attempt.number,
                    will_retry,
                });
                if will_retry {
                    self.set_cooldown(now, policy);
                    DeviceState::Degraded {
                        issue,
                        severity,
                        since: now,
                    }
                } else {
                    events.push(MachineEvent::Escalated {
                        issue: issue.clone(),
                    });
                    DeviceState::Escalated { issue, since: now }
                }
            }
        };
        events
    }

    fn close_pending(
        &mut self,
        issue: crate::types::IssueKind,
        pending: PendingVerification,
        verification: Verification,
    ) {
        self.push_history(AttemptRecord {
            id: pending.attempt.id,
            issue,
            action: pending.attempt.action,
            started_at: pending.attempt.started_at,
            finished_at: pending.finished_at,
            outcome: AttemptOutcome::Success,
            message: pending.message,
            verification,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::cooldown_after;
    use crate::types::{
        ActionSpec, Device, DeviceClass, Evidence, IssueKind, PriorityTier, RemediationOverrides,
    };
    use std::time::Duration;

    fn device() -> Device {
        Device {
            address: "10.0.0.1".to_string(),
            hostname: "sw-01".to_string(),
            class: DeviceClass::Switch,
            tier: PriorityTier::Medium,
            overrides: RemediationOverrides::default(),
        }
    }

    fn issue(kind: IssueKind) -> Issue {
        Issue {
            kind,
            evidence: match kind {
                IssueKind::InterfaceDown => Evidence::Interface {
                    name: "eth1".to_string(),
                    uplink: false,
                },
                IssueKind::Unreachable => Evidence::Unreachable {
                    consecutive_misses: 2,
                },
                _ => Evidence::Utilization { percent: 90.0 },
            },
        }
    }

    fn unhealthy(kind: IssueKind) -> HealthVerdict {
        HealthVerdict::Unhealthy {
            severity: Severity::Degraded,
            issue: issue(kind),
        }
    }

    /// Drive a record from Healthy into Remediating for the given issue.
    fn degraded_record(kind: IssueKind) -> DeviceRecord {
        let mut record = DeviceRecord::new(device());
        let events = record.apply_verdict(&unhealthy(kind), Utc::now(), &PolicyConfig::default());
        assert!(matches!(events[0], MachineEvent::IssueDetected { .. }));
        record
    }

    #[test]
    fn unknown_verdict_never_transitions() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let events = record.apply_verdict(
            &HealthVerdict::Unknown,
            Utc::now(),
            &PolicyConfig::default(),
        );
        assert!(events.is_empty());
        assert_eq!(record.state.kind(), super::super::StateKind::Degraded);
    }

    #[test]
    fn self_resolution_requires_two_consecutive_healthy() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let policy = PolicyConfig::default();

        let events = record.apply_verdict(&HealthVerdict::Healthy, Utc::now(), &policy);
        assert!(events.is_empty());
        assert_eq!(record.state.kind(), super::super::StateKind::Degraded);

        let events = record.apply_verdict(&HealthVerdict::Healthy, Utc::now(), &policy);
        assert_eq!(events, vec![MachineEvent::SelfResolved]);
        assert_eq!(record.state.kind(), super::super::StateKind::Healthy);
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn unhealthy_verdict_resets_healthy_streak() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let policy = PolicyConfig::default();

        record.apply_verdict(&HealthVerdict::Healthy, Utc::now(), &policy);
        record.apply_verdict(&unhealthy(IssueKind::HighCpu), Utc::now(), &policy);
        let events = record.apply_verdict(&HealthVerdict::Healthy, Utc::now(), &policy);

        // The streak restarted, so one healthy verdict is not enough.
        assert!(events.is_empty());
        assert_eq!(record.state.kind(), super::super::StateKind::Degraded);
    }

    #[test]
    fn different_issue_starts_new_episode() {
        let mut record = degraded_record(IssueKind::HighCpu);
        record.attempt_count = 2;
        record.approved = true;

        let events = record.apply_verdict(
            &unhealthy(IssueKind::InterfaceDown),
            Utc::now(),
            &PolicyConfig::default(),
        );
        assert!(matches!(events[0], MachineEvent::NewEpisode { .. }));
        assert_eq!(record.attempt_count, 0);
        assert!(!record.approved);
        assert_eq!(
            record.state.issue().map(|i| i.kind),
            Some(IssueKind::InterfaceDown)
        );
    }

    #[test]
    fn begin_remediation_requires_degraded() {
        let mut record = DeviceRecord::new(device());
        assert!(record.begin_remediation(Utc::now()).is_none());

        let mut record = degraded_record(IssueKind::HighMemory);
        let attempt = record.begin_remediation(Utc::now()).unwrap();
        assert_eq!(attempt.action, ActionSpec::CacheClear);
        assert_eq!(attempt.number, 1);
        assert_eq!(record.state.kind(), super::super::StateKind::Remediating);

        // Already in flight; a second dispatch is impossible.
        assert!(record.begin_remediation(Utc::now()).is_none());
    }

    #[test]
    fn verdicts_are_recorded_but_ignored_while_remediating() {
        let mut record = degraded_record(IssueKind::HighCpu);
        record.begin_remediation(Utc::now()).unwrap();

        let events =
            record.apply_verdict(&HealthVerdict::Healthy, Utc::now(), &PolicyConfig::default());
        assert!(events.is_empty());
        assert_eq!(record.state.kind(), super::super::StateKind::Remediating);
    }

    #[test]
    fn success_then_healthy_confirms_and_closes_episode() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let policy = PolicyConfig::default();
        record.begin_remediation(Utc::now()).unwrap();

        let events =
            record.apply_outcome(AttemptOutcome::Success, "restarted".to_string(), Utc::now(), &policy);
        assert_eq!(events, vec![MachineEvent::AwaitingVerification]);
        assert_eq!(record.state.kind(), super::super::StateKind::Verifying);
        // Not in history yet; the attempt is still open.
        assert_eq!(record.history().count(), 0);

        let events = record.apply_verdict(&HealthVerdict::Healthy, Utc::now(), &policy);
        assert_eq!(events, vec![MachineEvent::VerificationConfirmed]);
        assert_eq!(record.state.kind(), super::super::StateKind::Healthy);
        assert_eq!(record.attempt_count, 0);

        let closed: Vec<_> = record.history().collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].outcome, AttemptOutcome::Success);
        assert_eq!(closed[0].verification, Verification::Confirmed);
    }

    #[test]
    fn verification_mismatch_backs_off_and_retries() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let policy = PolicyConfig::default();
        let now = Utc::now();
        record.begin_remediation(now).unwrap();
        record.apply_outcome(AttemptOutcome::Success, String::new(), now, &policy);

        let events = record.apply_verdict(&unhealthy(IssueKind::HighCpu), now, &policy);
        assert_eq!(events, vec![MachineEvent::VerificationMismatch]);
        assert_eq!(record.state.kind(), super::super::StateKind::Degraded);
        assert_eq!(record.attempt_count, 1);

        let closed: Vec<_> = record.history().collect();
        assert_eq!(closed[0].verification, Verification::Mismatch);

        // First attempt consumed, so the cooldown is the base value.
        let until = record.cooldown_until.unwrap();
        let expected = now + chrono::Duration::from_std(policy.cooldown_base).unwrap();
        assert_eq!(until, expected);
    }

    #[test]
    fn superseding_issue_closes_attempt_and_resets_budget() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let policy = PolicyConfig::default();
        record.begin_remediation(Utc::now()).unwrap();
        record.apply_outcome(AttemptOutcome::Success, String::new(), Utc::now(), &policy);

        let events = record.apply_verdict(&unhealthy(IssueKind::InterfaceDown), Utc::now(), &policy);
        assert!(matches!(events[0], MachineEvent::NewEpisode { .. }));
        assert_eq!(record.attempt_count, 0);
        assert_eq!(
            record.history().next().unwrap().verification,
            Verification::Superseded
        );
    }

    #[test]
    fn failure_backs_off_exponentially() {
        let mut record = degraded_record(IssueKind::Unreachable);
        let policy = PolicyConfig::default();

        let now = Utc::now();
        record.begin_remediation(now).unwrap();
        record.apply_outcome(AttemptOutcome::Failure, "ssh refused".to_string(), now, &policy);
        let first = record.cooldown_until.unwrap() - now;

        record.cooldown_until = None;
        record.begin_remediation(now).unwrap();
        record.apply_outcome(AttemptOutcome::Failure, "ssh refused".to_string(), now, &policy);
        let second = record.cooldown_until.unwrap() - now;

        assert_eq!(second, first * 2);
    }

    #[test]
    fn third_failure_escalates() {
        let mut record = degraded_record(IssueKind::Unreachable);
        let policy = PolicyConfig::default();

        for attempt in 1..=3u32 {
            record.cooldown_until = None;
            let in_flight = record.begin_remediation(Utc::now()).unwrap();
            assert_eq!(in_flight.number, attempt);
            let events = record.apply_outcome(
                AttemptOutcome::Failure,
                "no route".to_string(),
                Utc::now(),
                &policy,
            );
            if attempt < 3 {
                assert_eq!(
                    events,
                    vec![MachineEvent::AttemptFailed {
                        outcome: AttemptOutcome::Failure,
                        attempt,
                        will_retry: true,
                    }]
                );
            } else {
                assert!(matches!(events[1], MachineEvent::Escalated { .. }));
            }
        }

        assert_eq!(record.state.kind(), super::super::StateKind::Escalated);
        assert_eq!(record.history().count(), 3);
        // Escalated is terminal for dispatch purposes.
        assert!(record.begin_remediation(Utc::now()).is_none());
    }

    #[test]
    fn timeout_counts_against_the_budget() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let policy = PolicyConfig::default();
        record.begin_remediation(Utc::now()).unwrap();

        record.apply_outcome(AttemptOutcome::Timeout, "deadline".to_string(), Utc::now(), &policy);
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.history().next().unwrap().outcome, AttemptOutcome::Timeout);
    }

    #[test]
    fn mismatch_on_final_attempt_escalates() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let policy = PolicyConfig::default();
        record.attempt_count = 2;
        record.begin_remediation(Utc::now()).unwrap();
        record.apply_outcome(AttemptOutcome::Success, String::new(), Utc::now(), &policy);

        let events = record.apply_verdict(&unhealthy(IssueKind::HighCpu), Utc::now(), &policy);
        assert_eq!(events[0], MachineEvent::VerificationMismatch);
        assert!(matches!(events[1], MachineEvent::Escalated { .. }));
        assert_eq!(record.state.kind(), super::super::StateKind::Escalated);
    }

    #[test]
    fn escalation_clears_on_fresh_healthy_verdict() {
        let mut record = degraded_record(IssueKind::Unreachable);
        let policy = PolicyConfig::default();
        record.attempt_count = 2;
        record.begin_remediation(Utc::now()).unwrap();
        record.apply_outcome(AttemptOutcome::Failure, String::new(), Utc::now(), &policy);
        assert_eq!(record.state.kind(), super::super::StateKind::Escalated);

        let events = record.apply_verdict(&HealthVerdict::Healthy, Utc::now(), &policy);
        assert_eq!(events, vec![MachineEvent::EscalationCleared]);
        assert_eq!(record.state.kind(), super::super::StateKind::Healthy);
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn manual_action_resets_escalated_but_keeps_cooldown() {
        let mut record = degraded_record(IssueKind::Unreachable);
        let policy = PolicyConfig::default();
        record.attempt_count = 2;
        record.begin_remediation(Utc::now()).unwrap();
        record.apply_outcome(AttemptOutcome::Failure, String::new(), Utc::now(), &policy);
        let until = Utc::now() + chrono::Duration::seconds(60);
        record.cooldown_until = Some(until);

        record.apply_manual_action(ActionSpec::DeviceReboot, Utc::now());
        assert_eq!(record.state.kind(), super::super::StateKind::Degraded);
        assert_eq!(record.attempt_count, 0);
        assert!(record.approved);
        assert_eq!(record.forced_action, Some(ActionSpec::DeviceReboot));
        assert_eq!(record.cooldown_until, Some(until));
    }

    #[test]
    fn manual_action_on_degraded_approves_and_forces_action() {
        let mut record = degraded_record(IssueKind::HighCpu);
        record.apply_manual_action(ActionSpec::DeviceReboot, Utc::now());
        assert!(record.approved);

        let attempt = record.begin_remediation(Utc::now()).unwrap();
        assert_eq!(attempt.action, ActionSpec::DeviceReboot);
        // The override is consumed; the next dispatch uses the default again.
        assert!(record.forced_action.is_none());
    }

    #[test]
    fn queued_manual_action_waits_out_verification() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let policy = PolicyConfig::default();
        record.begin_remediation(Utc::now()).unwrap();
        record.apply_outcome(AttemptOutcome::Success, String::new(), Utc::now(), &policy);
        record.pending_manual = Some(ActionSpec::DeviceReboot);

        // Verifying cannot accept the request yet; it stays queued.
        assert!(record.take_pending_manual().is_none());
        assert_eq!(record.pending_manual, Some(ActionSpec::DeviceReboot));

        record.apply_verdict(&unhealthy(IssueKind::HighCpu), Utc::now(), &policy);
        assert_eq!(record.state.kind(), super::super::StateKind::Degraded);
        assert_eq!(record.take_pending_manual(), Some(ActionSpec::DeviceReboot));
    }

    #[test]
    fn closing_the_episode_discards_the_queued_manual_action() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let policy = PolicyConfig::default();
        record.pending_manual = Some(ActionSpec::DeviceReboot);

        record.apply_verdict(&HealthVerdict::Healthy, Utc::now(), &policy);
        record.apply_verdict(&HealthVerdict::Healthy, Utc::now(), &policy);
        assert_eq!(record.state.kind(), super::super::StateKind::Healthy);
        assert!(record.pending_manual.is_none());
    }

    #[test]
    fn manual_action_on_healthy_is_ignored() {
        let mut record = DeviceRecord::new(device());
        record.apply_manual_action(ActionSpec::DeviceReboot, Utc::now());
        assert_eq!(record.state.kind(), super::super::StateKind::Healthy);
        assert!(!record.approved);
    }

    #[test]
    fn cooldown_schedule_doubles_up_to_the_cap() {
        let policy = PolicyConfig {
            cooldown_base: Duration::from_secs(30),
            cooldown_cap: Duration::from_secs(600),
            ..PolicyConfig::default()
        };
        assert_eq!(cooldown_after(&policy, 1), Duration::from_secs(30));
        assert_eq!(cooldown_after(&policy, 2), Duration::from_secs(60));
        assert_eq!(cooldown_after(&policy, 3), Duration::from_secs(120));
        assert_eq!(cooldown_after(&policy, 6), Duration::from_secs(600));
        assert_eq!(cooldown_after(&policy, 40), Duration::from_secs(600));
    }

    #[test]
    fn history_is_bounded() {
        let mut record = degraded_record(IssueKind::HighCpu);
        let policy = PolicyConfig {
            max_attempts: u32::MAX,
            ..PolicyConfig::default()
        };
        for _ in 0..64 {
            record.cooldown_until = None;
            record.begin_remediation(Utc::now()).unwrap();
            record.apply_outcome(AttemptOutcome::Failure, String::new(), Utc::now(), &policy);
        }
        assert_eq!(record.history().count(), 32);
    }
}

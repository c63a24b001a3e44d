//! Health classification.
//!
//! [`classify`] turns a device's recent reading window into a discrete
//! verdict. It is a pure function of its inputs: no clock reads, no state,
//! no side effects, so every rule is unit-testable in isolation.
//!
//! Rule order (first match wins): unreachable, interface down, sustained
//! CPU, sustained memory. Utilization rules require two consecutive readings
//! over threshold so a single transient spike never triggers remediation.

use crate::config::Thresholds;
use crate::types::{Evidence, HealthReading, HealthVerdict, Issue, IssueKind, Severity};

/// Classify one device's recent readings.
///
/// Returns [`HealthVerdict::Unknown`] when there is not enough data to
/// judge; the orchestrator treats that as a no-op.
pub fn classify(window: &[HealthReading], thresholds: &Thresholds) -> HealthVerdict {
    if window.len() < thresholds.min_readings {
        return HealthVerdict::Unknown;
    }
    let Some(latest) = window.last() else {
        return HealthVerdict::Unknown;
    };

    let consecutive_misses = window.iter().rev().take_while(|r| !r.reachable).count();
    if consecutive_misses >= 2 {
        return HealthVerdict::Unhealthy {
            severity: Severity::Unresponsive,
            issue: Issue {
                kind: IssueKind::Unreachable,
                evidence: Evidence::Unreachable {
                    consecutive_misses: consecutive_misses as u32,
                },
            },
        };
    }
    if consecutive_misses == 1 {
        // A single missed poll is tolerated silently; the reading carries no
        // other evidence to judge on.
        return HealthVerdict::Unknown;
    }

    for (name, status) in &latest.interfaces {
        if status.admin_up && !status.oper_up {
            let uplink = is_uplink(name, thresholds);
            return HealthVerdict::Unhealthy {
                severity: if uplink {
                    Severity::Critical
                } else {
                    Severity::Degraded
                },
                issue: Issue {
                    kind: IssueKind::InterfaceDown,
                    evidence: Evidence::Interface {
                        name: name.clone(),
                        uplink,
                    },
                },
            };
        }
    }

    if window.len() >= 2 {
        let previous = &window[window.len() - 2];

        if let Some(verdict) = sustained_utilization(
            previous.cpu_percent,
            latest.cpu_percent,
            thresholds.cpu_degraded,
            thresholds.cpu_critical,
            IssueKind::HighCpu,
        ) {
            return verdict;
        }
        if let Some(verdict) = sustained_utilization(
            previous.memory_percent,
            latest.memory_percent,
            thresholds.memory_degraded,
            thresholds.memory_critical,
            IssueKind::HighMemory,
        ) {
            return verdict;
        }
    }

    HealthVerdict::Healthy
}

fn is_uplink(name: &str, thresholds: &Thresholds) -> bool {
    let lower = name.to_ascii_lowercase();
    thresholds
        .uplink_prefixes
        .iter()
        .any(|prefix| lower.starts_with(&prefix.to_ascii_lowercase()))
}

fn sustained_utilization(
    previous: Option<f64>,
    latest: Option<f64>,
    degraded: f64,
    critical: f64,
    kind: IssueKind,
) -> Option<HealthVerdict> {
    let (previous, latest) = (previous?, latest?);
    if previous <= degraded || latest <= degraded {
        return None;
    }
    let severity = if previous > critical && latest > critical {
        Severity::Critical
    } else {
        Severity::Degraded
    };
    Some(HealthVerdict::Unhealthy {
        severity,
        issue: Issue {
            kind,
            evidence: Evidence::Utilization { percent: latest },
        },
    })
}

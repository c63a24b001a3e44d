//! Fleet registry.
//!
//! Owns one [`DeviceRecord`] per device, keyed by address. All mutation goes
//! through [`Registry::with_record_mut`], which runs a closure under the
//! shard lock; callers never hold a guard across an await point. Reads hand
//! out owned [`DeviceSnapshot`]s.

use dashmap::DashMap;
use serde::Serialize;

use crate::device::{DeviceRecord, DeviceSnapshot, StateKind};
use crate::types::{Device, DeviceId};

#[derive(Default)]
pub struct Registry {
    records: DashMap<DeviceId, DeviceRecord>,
}

/// Fleet-wide state counts for status logging and introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub remediating: usize,
    pub verifying: usize,
    pub escalated: usize,
    pub awaiting_approval: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the registry against the configured device list.
    ///
    /// New devices get fresh records, devices no longer configured are
    /// dropped, and existing records keep their state and history so a
    /// reload never forgets an in-progress episode. Static attributes
    /// (hostname, class, tier, overrides) are refreshed in place.
    pub fn sync(&self, devices: &[Device]) {
        for device in devices {
            match self.records.get_mut(&device.address) {
                Some(mut record) => record.device = device.clone(),
                None => {
                    tracing::info!(device = %device.address, hostname = %device.hostname, "Tracking device");
                    self.records
                        .insert(device.address.clone(), DeviceRecord::new(device.clone()));
                }
            }
        }
        self.records.retain(|address, _| {
            let keep = devices.iter().any(|d| &d.address == address);
            if !keep {
                tracing::info!(device = %address, "Dropping device no longer configured");
            }
            keep
        });
    }

    /// Run `f` on a device's record under the shard lock.
    ///
    /// The closure must not await; all collaborator I/O happens outside and
    /// is stitched back in with a second call.
    pub fn with_record_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut DeviceRecord) -> R,
    ) -> Option<R> {
        self.records.get_mut(id).map(|mut record| f(&mut record))
    }

    pub fn snapshot(&self, id: &str) -> Option<DeviceSnapshot> {
        self.records.get(id).map(|record| record.snapshot())
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.records.iter().map(|r| r.snapshot()).collect()
    }

    /// Devices whose retry budget is exhausted and need a human.
    pub fn list_escalated(&self) -> Vec<DeviceSnapshot> {
        self.records
            .iter()
            .filter(|r| r.state.kind() == StateKind::Escalated)
            .map(|r| r.snapshot())
            .collect()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn summary(&self) -> FleetSummary {
        let mut summary = FleetSummary::default();
        for record in self.records.iter() {
            summary.total += 1;
            match record.state.kind() {
                StateKind::Healthy => summary.healthy += 1,
                StateKind::Degraded => summary.degraded += 1,
                StateKind::Remediating => summary.remediating += 1,
                StateKind::Verifying => summary.verifying += 1,
                StateKind::Escalated => summary.escalated += 1,
            }
            if record.approval_notified && !record.approved {
                summary.awaiting_approval += 1;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::types::{
        DeviceClass, Evidence, HealthVerdict, Issue, IssueKind, PriorityTier,
        RemediationOverrides, Severity,
    };
    use chrono::Utc;

    fn device(address: &str) -> Device {
        Device {
            address: address.to_string(),
            hostname: format!("host-{address}"),
            class: DeviceClass::Switch,
            tier: PriorityTier::Medium,
            overrides: RemediationOverrides::default(),
        }
    }

    fn degrade(registry: &Registry, id: &str) {
        let verdict = HealthVerdict::Unhealthy {
            severity: Severity::Degraded,
            issue: Issue {
                kind: IssueKind::HighCpu,
                evidence: Evidence::Utilization { percent: 90.0 },
            },
        };
        registry
            .with_record_mut(id, |record| {
                record.apply_verdict(&verdict, Utc::now(), &PolicyConfig::default())
            })
            .unwrap();
    }

    #[test]
    fn sync_adds_and_removes_devices() {
        let registry = Registry::new();
        registry.sync(&[device("10.0.0.1"), device("10.0.0.2")]);
        assert_eq!(registry.len(), 2);

        registry.sync(&[device("10.0.0.2"), device("10.0.0.3")]);
        assert!(!registry.contains("10.0.0.1"));
        assert!(registry.contains("10.0.0.3"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn sync_preserves_state_and_refreshes_attributes() {
        let registry = Registry::new();
        registry.sync(&[device("10.0.0.1")]);
        degrade(&registry, "10.0.0.1");

        let mut updated = device("10.0.0.1");
        updated.tier = PriorityTier::Critical;
        registry.sync(&[updated]);

        let snapshot = registry.snapshot("10.0.0.1").unwrap();
        assert_eq!(snapshot.state, StateKind::Degraded);
        assert_eq!(snapshot.device.tier, PriorityTier::Critical);
    }

    #[test]
    fn summary_counts_states() {
        let registry = Registry::new();
        registry.sync(&[device("10.0.0.1"), device("10.0.0.2"), device("10.0.0.3")]);
        degrade(&registry, "10.0.0.2");

        let summary = registry.summary();
        assert_eq!(
            summary,
            FleetSummary {
                total: 3,
                healthy: 2,
                degraded: 1,
                ..FleetSummary::default()
            }
        );
    }

    #[test]
    fn with_record_mut_on_unknown_device_is_none() {
        let registry = Registry::new();
        assert!(registry.with_record_mut("nope", |_| ()).is_none());
    }
}

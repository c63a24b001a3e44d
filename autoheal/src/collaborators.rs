//! External collaborator traits and test doubles.
//!
//! The orchestrator talks to the outside world through three trait objects:
//! a [`TelemetrySource`] for health polls, an [`ActionExecutor`] for
//! remediation actions, and a [`Notifier`] for operator alerts. Production
//! implementations live outside this crate; the mocks here drive the
//! orchestrator tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{AutohealError, Result};
use crate::types::{ActionSpec, AlertEvent, Device, DeviceId, HealthReading};

/// Fetches one health reading for one device.
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    async fn fetch_health(&self, device: &Device) -> Result<HealthReading>;
}

/// Executes one remediation action against one device.
///
/// Returns a human-readable completion message on success. Implementations
/// do not retry internally; retries and timeouts belong to the orchestrator.
#[async_trait]
pub trait ActionExecutor: Send + Sync + 'static {
    async fn execute(&self, device: &Device, action: &ActionSpec) -> Result<String>;
}

/// Delivers operator-facing alerts.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, alert: &AlertEvent) -> Result<()>;
}

/// Notifier that writes alerts to the log and nowhere else.
///
/// Useful as a stand-in before a real pager/webhook integration is wired up.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, alert: &AlertEvent) -> Result<()> {
        tracing::warn!(
            kind = ?alert.kind,
            device = alert.device.as_deref().unwrap_or("-"),
            severity = %alert.severity,
            message = %alert.message,
            "ALERT"
        );
        Ok(())
    }
}

type Scripted<T> = Mutex<HashMap<DeviceId, VecDeque<std::result::Result<T, String>>>>;

fn next_scripted<T: Clone>(
    scripted: &Scripted<T>,
    device: &DeviceId,
) -> Option<std::result::Result<T, String>> {
    let mut map = scripted.lock();
    let queue = map.get_mut(device)?;
    // The last scripted response is sticky: it keeps being returned so tests
    // do not have to count polls exactly.
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Scripted [`TelemetrySource`] for tests.
///
/// Responses are queued per device; the last queued response repeats forever.
/// Devices with no script get a healthy reading.
#[derive(Default)]
pub struct MockTelemetry {
    responses: Scripted<HealthReading>,
    latency: Mutex<HashMap<DeviceId, Duration>>,
    calls: Mutex<Vec<DeviceId>>,
}

impl MockTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_reading(&self, device: &str, reading: HealthReading) {
        self.responses
            .lock()
            .entry(device.to_string())
            .or_default()
            .push_back(Ok(reading));
    }

    pub fn push_error(&self, device: &str, reason: &str) {
        self.responses
            .lock()
            .entry(device.to_string())
            .or_default()
            .push_back(Err(reason.to_string()));
    }

    /// Delay every fetch for the device, for exercising timeouts.
    pub fn set_latency(&self, device: &str, latency: Duration) {
        self.latency.lock().insert(device.to_string(), latency);
    }

    pub fn call_count(&self, device: &str) -> usize {
        self.calls.lock().iter().filter(|d| *d == device).count()
    }
}

#[async_trait]
impl TelemetrySource for MockTelemetry {
    async fn fetch_health(&self, device: &Device) -> Result<HealthReading> {
        self.calls.lock().push(device.address.clone());
        let latency = self.latency.lock().get(&device.address).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match next_scripted(&self.responses, &device.address) {
            Some(Ok(reading)) => Ok(HealthReading {
                at: Utc::now(),
                ..reading
            }),
            Some(Err(reason)) => Err(AutohealError::TelemetryUnavailable {
                device: device.address.clone(),
                reason,
            }),
            None => Ok(HealthReading {
                at: Utc::now(),
                reachable: true,
                interfaces: Default::default(),
                cpu_percent: Some(10.0),
                memory_percent: Some(20.0),
            }),
        }
    }
}

/// Scripted [`ActionExecutor`] for tests; records every dispatched action.
#[derive(Default)]
pub struct MockExecutor {
    responses: Scripted<String>,
    latency: Mutex<HashMap<DeviceId, Duration>>,
    calls: Mutex<Vec<(DeviceId, ActionSpec)>>,
}

impl MockExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_success(&self, device: &str, message: &str) {
        self.responses
            .lock()
            .entry(device.to_string())
            .or_default()
            .push_back(Ok(message.to_string()));
    }

    pub fn push_failure(&self, device: &str, reason: &str) {
        self.responses
            .lock()
            .entry(device.to_string())
            .or_default()
            .push_back(Err(reason.to_string()));
    }

    pub fn set_latency(&self, device: &str, latency: Duration) {
        self.latency.lock().insert(device.to_string(), latency);
    }

    /// Every `(device, action)` pair executed so far, in dispatch order.
    pub fn calls(&self) -> Vec<(DeviceId, ActionSpec)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, device: &str) -> usize {
        self.calls.lock().iter().filter(|(d, _)| d == device).count()
    }
}

#[async_trait]
impl ActionExecutor for MockExecutor {
    async fn execute(&self, device: &Device, action: &ActionSpec) -> Result<String> {
        self.calls
            .lock()
            .push((device.address.clone(), action.clone()));
        let latency = self.latency.lock().get(&device.address).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match next_scripted(&self.responses, &device.address) {
            Some(Ok(message)) => Ok(message),
            Some(Err(reason)) => Err(AutohealError::ActionFailed {
                device: device.address.clone(),
                reason,
            }),
            None => Ok("done".to_string()),
        }
    }
}

/// Recording [`Notifier`] for tests.
#[derive(Default)]
pub struct MockNotifier {
    alerts: Mutex<Vec<AlertEvent>>,
    fail: Mutex<bool>,
}

impl MockNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts.lock().clone()
    }

    /// Make every subsequent delivery fail.
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, alert: &AlertEvent) -> Result<()> {
        if *self.fail.lock() {
            return Err(AutohealError::Internal(anyhow::anyhow!(
                "notifier unavailable"
            )));
        }
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceClass, PriorityTier, RemediationOverrides};

    fn device() -> Device {
        Device {
            address: "10.0.0.9".to_string(),
            hostname: "ap-09".to_string(),
            class: DeviceClass::AccessPoint,
            tier: PriorityTier::Medium,
            overrides: RemediationOverrides::default(),
        }
    }

    #[tokio::test]
    async fn telemetry_scripts_are_consumed_in_order_and_last_sticks() {
        let telemetry = MockTelemetry::new();
        telemetry.push_reading("10.0.0.9", HealthReading::unreachable(Utc::now()));
        telemetry.push_error("10.0.0.9", "snmp timeout");

        let device = device();
        assert!(!telemetry.fetch_health(&device).await.unwrap().reachable);
        assert!(telemetry.fetch_health(&device).await.is_err());
        // Sticky last response.
        assert!(telemetry.fetch_health(&device).await.is_err());
        assert_eq!(telemetry.call_count("10.0.0.9"), 3);
    }

    #[tokio::test]
    async fn unscripted_device_reads_healthy() {
        let telemetry = MockTelemetry::new();
        let reading = telemetry.fetch_health(&device()).await.unwrap();
        assert!(reading.reachable);
    }

    #[tokio::test]
    async fn executor_records_dispatches() {
        let executor = MockExecutor::new();
        executor.push_failure("10.0.0.9", "ssh refused");

        let device = device();
        let err = executor
            .execute(&device, &ActionSpec::DeviceReboot)
            .await
            .unwrap_err();
        assert!(matches!(err, AutohealError::ActionFailed { .. }));
        assert_eq!(
            executor.calls(),
            vec![("10.0.0.9".to_string(), ActionSpec::DeviceReboot)]
        );
    }
}

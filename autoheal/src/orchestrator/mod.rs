//! The remediation orchestrator.
//!
//! One [`Orchestrator`] supervises the whole fleet. It runs an independent
//! poll loop per device so a slow device never delays the rest, while a
//! fleet-wide semaphore caps outstanding collaborator calls. Each tick is a
//! strict pipeline: fetch telemetry, classify, fold the verdict into the
//! device's state machine, then act on whatever the machine asked for.
//!
//! Locking discipline: registry shard locks are only held inside synchronous
//! closures. Collaborator I/O happens between two lock acquisitions, which is
//! safe because the `Remediating` state itself marks the device as busy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::classifier::classify;
use crate::collaborators::{ActionExecutor, Notifier, TelemetrySource};
use crate::config::{Config, ConfigHandle};
use crate::device::{DeviceSnapshot, InFlightAttempt, MachineEvent, StateKind};
use crate::error::{AutohealError, Result};
use crate::policy::{self, PolicyDecision, PolicyInput};
use crate::registry::{FleetSummary, Registry};
use crate::types::{
    ActionSpec, AlertEvent, AlertKind, AttemptOutcome, Device, DeviceId, HealthReading, Issue,
    Severity,
};

/// Capacity of the in-process alert broadcast channel.
const ALERT_CHANNEL_CAPACITY: usize = 256;

/// What one observation pass decided, computed under the registry lock.
struct Observation {
    alerts: Vec<AlertEvent>,
    dispatch: Option<(Device, InFlightAttempt)>,
}

pub struct Orchestrator<T, E, N> {
    telemetry: Arc<T>,
    executor: Arc<E>,
    notifier: Arc<N>,
    config: ConfigHandle,
    registry: Arc<Registry>,
    /// Fleet-wide cap on outstanding collaborator calls. Sized at startup;
    /// reloads do not resize it.
    call_permits: Arc<Semaphore>,
    calls_in_flight: Arc<AtomicUsize>,
    /// Consecutive collaborator failures across the whole fleet.
    consecutive_failures: AtomicUsize,
    /// Latched once per outage so the system-degraded alert fires once.
    degraded_mode: AtomicBool,
    alert_tx: broadcast::Sender<AlertEvent>,
    cancel: CancellationToken,
}

impl<T, E, N> Orchestrator<T, E, N>
where
    T: TelemetrySource,
    E: ActionExecutor,
    N: Notifier,
{
    pub fn new(
        config: ConfigHandle,
        telemetry: Arc<T>,
        executor: Arc<E>,
        notifier: Arc<N>,
    ) -> Self {
        let snapshot = config.snapshot();
        let registry = Arc::new(Registry::new());
        registry.sync(&snapshot.devices);
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            telemetry,
            executor,
            notifier,
            config,
            registry,
            call_permits: Arc::new(Semaphore::new(snapshot.scheduler.max_concurrent_calls)),
            calls_in_flight: Arc::new(AtomicUsize::new(0)),
            consecutive_failures: AtomicUsize::new(0),
            degraded_mode: AtomicBool::new(false),
            alert_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to alert events. Every alert is broadcast here regardless of
    /// the notifier kill-switch.
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_tx.subscribe()
    }

    pub fn snapshot(&self, device: &str) -> Option<DeviceSnapshot> {
        self.registry.snapshot(device)
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.registry.snapshots()
    }

    pub fn summary(&self) -> FleetSummary {
        self.registry.summary()
    }

    pub fn list_escalated(&self) -> Vec<DeviceSnapshot> {
        self.registry.list_escalated()
    }

    /// Validate and install a new configuration, then reconcile the fleet.
    ///
    /// On validation failure nothing changes and the error is returned.
    pub fn reload_config(&self, new: Config) -> Result<()> {
        self.config.swap(new)?;
        let snapshot = self.config.snapshot();
        self.registry.sync(&snapshot.devices);
        tracing::info!(devices = snapshot.devices.len(), "Configuration reloaded");
        Ok(())
    }

    /// Record an operator's remediation request for a device.
    ///
    /// The request is queued and folded in at the start of the first tick
    /// that finds the device in `Degraded` or `Escalated`, never
    /// interleaving with an in-flight attempt. It satisfies the approval
    /// gate, and on an escalated device additionally resets the attempt
    /// budget. Cooldowns stay in force.
    pub fn submit_manual_action(&self, device: &str, action: ActionSpec) -> Result<()> {
        let cfg = self.config.snapshot();
        if !cfg.policy.remediation_enabled {
            return Err(AutohealError::PolicyDenied(
                "remediation is disabled".to_string(),
            ));
        }
        let accepted = self
            .registry
            .with_record_mut(device, |record| match record.state.kind() {
                StateKind::Healthy => false,
                _ => {
                    tracing::info!(
                        device = %record.device.address,
                        action = %action,
                        "Manual action accepted"
                    );
                    record.pending_manual = Some(action);
                    true
                }
            })
            .ok_or_else(|| AutohealError::DeviceNotFound(device.to_string()))?;
        if accepted {
            Ok(())
        } else {
            Err(AutohealError::ManualActionRejected(format!(
                "{device} is healthy, nothing to remediate"
            )))
        }
    }

    /// Request shutdown. [`run`](Self::run) drains in-flight ticks and
    /// returns.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run poll loops for every registered device until shutdown.
    ///
    /// Devices added by a reload are picked up on the next reconciliation
    /// pass; loops for removed devices exit on their own.
    pub async fn run(self: Arc<Self>) {
        let snapshot = self.config.snapshot();
        tracing::info!(
            devices = self.registry.len(),
            poll_interval = ?snapshot.scheduler.poll_interval,
            "Orchestrator starting"
        );

        let mut loops: JoinSet<DeviceId> = JoinSet::new();
        let mut running: HashSet<DeviceId> = HashSet::new();
        let mut status_interval = snapshot.scheduler.status_log_interval;
        let mut status_ticker = new_status_ticker(status_interval);

        loop {
            // Reloads can change or disable the status cadence.
            let live_interval = self.config.snapshot().scheduler.status_log_interval;
            if live_interval != status_interval {
                status_interval = live_interval;
                status_ticker = new_status_ticker(status_interval);
            }

            for id in self.registry.device_ids() {
                if running.insert(id.clone()) {
                    let orchestrator = self.clone();
                    loops.spawn(async move { orchestrator.device_loop(id).await });
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = status_ticker.tick() => {
                    if status_interval.is_some() {
                        self.log_status();
                    }
                }
                Some(finished) = loops.join_next(), if !loops.is_empty() => {
                    if let Ok(id) = finished {
                        running.remove(&id);
                    }
                }
            }
        }

        // Drain: let in-flight ticks finish their current await.
        loops.shutdown().await;
        tracing::info!("Orchestrator stopped");
    }

    fn log_status(&self) {
        let summary = self.registry.summary();
        tracing::info!(
            calls_in_flight = self.calls_in_flight.load(Ordering::Relaxed),
            total = summary.total,
            healthy = summary.healthy,
            degraded = summary.degraded,
            remediating = summary.remediating,
            escalated = summary.escalated,
            awaiting_approval = summary.awaiting_approval,
            "Fleet status"
        );
    }

    /// Sequential poll loop for one device. At most one tick, and therefore
    /// at most one remediation attempt, is ever in flight per device.
    async fn device_loop(self: Arc<Self>, id: DeviceId) -> DeviceId {
        loop {
            let cfg = self.config.snapshot();
            let mut delay = cfg.scheduler.poll_interval;
            let jitter_ms = cfg.scheduler.poll_jitter.as_millis() as u64;
            if jitter_ms > 0 {
                delay += Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return id,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.registry.contains(&id) {
                return id;
            }
            self.tick(&id).await;
        }
    }

    /// One observe/decide/act cycle for one device.
    #[tracing::instrument(skip(self))]
    async fn tick(&self, id: &str) {
        // Queued operator requests are folded in before anything else. A
        // request the current state cannot accept stays queued for a later
        // tick rather than being dropped.
        let now = Utc::now();
        self.registry.with_record_mut(id, |record| {
            if let Some(action) = record.take_pending_manual() {
                record.apply_manual_action(action, now);
            }
        });

        let Some(observation) = self.observe(id, true).await else {
            return;
        };
        self.deliver(&observation.alerts).await;

        let Some((device, attempt)) = observation.dispatch else {
            return;
        };

        let (outcome, message) = self.execute_action(&device, &attempt).await;
        let cfg = self.config.snapshot();
        let now = Utc::now();
        let Some((events, alerts)) = self.registry.with_record_mut(id, |record| {
            let events = record.apply_outcome(outcome, message, now, &cfg.policy);
            let alerts = self.alerts_for_events(record.snapshot(), &events);
            (events, alerts)
        }) else {
            return;
        };
        self.deliver(&alerts).await;

        // A successful action is verified by an immediate re-poll; the fresh
        // verdict closes the pending attempt one way or the other. Dispatch
        // is withheld here: a new episode revealed by the re-poll waits in
        // `Degraded` for the device's next scheduled tick.
        if events.contains(&MachineEvent::AwaitingVerification) {
            if let Some(observation) = self.observe(id, false).await {
                self.deliver(&observation.alerts).await;
            }
        }
    }

    /// Fetch telemetry, classify, and fold the verdict into the record.
    ///
    /// With `dispatch_allowed` false (the verification re-poll) the verdict
    /// still closes the pending attempt, but no new attempt is started, so
    /// each tick dispatches at most once.
    ///
    /// Returns `None` when the device vanished from the registry mid-tick.
    async fn observe(&self, id: &str, dispatch_allowed: bool) -> Option<Observation> {
        let cfg = self.config.snapshot();
        let device = self.registry.snapshot(id)?.device;
        let reading = self.fetch_reading(&cfg, &device).await;
        let now = Utc::now();

        self.registry.with_record_mut(id, |record| {
            record.push_reading(reading, cfg.thresholds.window);
            let verdict = classify(record.readings(), &cfg.thresholds);
            let events = record.apply_verdict(&verdict, now, &cfg.policy);
            let mut alerts = self.alerts_for_events(record.snapshot(), &events);

            let mut dispatch = None;
            if dispatch_allowed && matches!(record.state.kind(), StateKind::Degraded) {
                let issue = record
                    .state
                    .issue()
                    .map(|i| i.kind)
                    .unwrap_or(crate::types::IssueKind::Unreachable);
                let input = PolicyInput {
                    device: &record.device,
                    issue,
                    attempt_count: record.attempt_count,
                    cooldown_until: record.cooldown_until,
                    approved: record.approved,
                    now,
                };
                match policy::evaluate(&input, &cfg.policy) {
                    PolicyDecision::Allow => {
                        if let Some(attempt) = record.begin_remediation(now) {
                            dispatch = Some((record.device.clone(), attempt));
                        }
                    }
                    PolicyDecision::NeedsApproval => {
                        if !record.approval_notified {
                            record.approval_notified = true;
                            alerts.push(approval_alert(record.device.clone(), &record.state));
                        }
                    }
                    PolicyDecision::Deny(reason) => {
                        tracing::debug!(
                            device = %record.device.address,
                            issue = %issue,
                            ?reason,
                            "Remediation withheld"
                        );
                    }
                }
            }

            Observation { alerts, dispatch }
        })
    }

    /// Turn state-machine events into operator alerts.
    ///
    /// Only escalations reach the notifier; detections, retries, and
    /// recoveries are log-only.
    fn alerts_for_events(
        &self,
        snapshot: DeviceSnapshot,
        events: &[MachineEvent],
    ) -> Vec<AlertEvent> {
        events
            .iter()
            .filter_map(|event| match event {
                MachineEvent::Escalated { issue } => {
                    Some(escalation_alert(snapshot.device.clone(), issue))
                }
                _ => None,
            })
            .collect()
    }

    async fn deliver(&self, alerts: &[AlertEvent]) {
        let cfg = self.config.snapshot();
        for alert in alerts {
            // Broadcast always; subscriber lag just drops the oldest events.
            let _ = self.alert_tx.send(alert.clone());
            if !cfg.policy.alerts_enabled {
                continue;
            }
            if let Err(error) = self.notifier.notify(alert).await {
                tracing::error!(%error, kind = ?alert.kind, "Alert delivery failed");
            }
        }
    }

    /// Fetch one health reading, with a deadline and a single retry for
    /// transient errors. A poll that cannot complete yields an unreachable
    /// reading rather than a skipped tick, so persistent collaborator
    /// trouble surfaces as device unreachability.
    async fn fetch_reading(&self, cfg: &Config, device: &Device) -> HealthReading {
        let Ok(_permit) = self.call_permits.acquire().await else {
            return HealthReading::unreachable(Utc::now());
        };
        self.calls_in_flight.fetch_add(1, Ordering::Relaxed);
        let _guard = scopeguard::guard(self.calls_in_flight.clone(), |count| {
            count.fetch_sub(1, Ordering::Relaxed);
        });

        let deadline = cfg.scheduler.telemetry_timeout;
        match timeout(deadline, self.telemetry.fetch_health(device)).await {
            Ok(Ok(reading)) => {
                self.record_call_success();
                reading
            }
            Ok(Err(error)) => {
                tracing::warn!(device = %device.address, %error, "Telemetry fetch failed, retrying once");
                tokio::time::sleep(cfg.scheduler.collaborator_retry_delay).await;
                match timeout(deadline, self.telemetry.fetch_health(device)).await {
                    Ok(Ok(reading)) => {
                        self.record_call_success();
                        reading
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(device = %device.address, %error, "Telemetry retry failed");
                        self.record_call_failure(cfg).await;
                        HealthReading::unreachable(Utc::now())
                    }
                    Err(_) => {
                        tracing::warn!(device = %device.address, "Telemetry retry timed out");
                        self.record_call_failure(cfg).await;
                        HealthReading::unreachable(Utc::now())
                    }
                }
            }
            Err(_) => {
                tracing::warn!(device = %device.address, ?deadline, "Telemetry fetch timed out");
                self.record_call_failure(cfg).await;
                HealthReading::unreachable(Utc::now())
            }
        }
    }

    /// Run one remediation action with a deadline.
    ///
    /// Errors are not retried here; the attempt budget and cooldown schedule
    /// are the retry mechanism for actions.
    async fn execute_action(
        &self,
        device: &Device,
        attempt: &InFlightAttempt,
    ) -> (AttemptOutcome, String) {
        let cfg = self.config.snapshot();
        let Ok(_permit) = self.call_permits.acquire().await else {
            return (AttemptOutcome::Failure, "shutting down".to_string());
        };
        self.calls_in_flight.fetch_add(1, Ordering::Relaxed);
        let _guard = scopeguard::guard(self.calls_in_flight.clone(), |count| {
            count.fetch_sub(1, Ordering::Relaxed);
        });

        let deadline = cfg.scheduler.action_timeout;
        match timeout(deadline, self.executor.execute(device, &attempt.action)).await {
            Ok(Ok(message)) => {
                self.record_call_success();
                (AttemptOutcome::Success, message)
            }
            Ok(Err(error)) => {
                self.record_call_failure(&cfg).await;
                (AttemptOutcome::Failure, error.to_string())
            }
            Err(_) => {
                self.record_call_failure(&cfg).await;
                let error = AutohealError::ActionTimeout {
                    device: device.address.clone(),
                    timeout: deadline,
                };
                (AttemptOutcome::Timeout, error.to_string())
            }
        }
    }

    fn record_call_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.degraded_mode.swap(false, Ordering::Relaxed) {
            tracing::info!("Collaborator calls recovered, leaving degraded mode");
        }
    }

    async fn record_call_failure(&self, cfg: &Config) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= cfg.scheduler.degraded_mode_threshold
            && !self.degraded_mode.swap(true, Ordering::Relaxed)
        {
            tracing::error!(
                failures,
                "Consecutive collaborator failures crossed the threshold, entering degraded mode"
            );
            self.deliver(&[AlertEvent {
                kind: AlertKind::SystemDegraded,
                device: None,
                hostname: None,
                severity: Severity::Critical,
                issue: None,
                message: format!("{failures} consecutive collaborator call failures"),
                requires_approval: false,
                at: Utc::now(),
            }])
            .await;
        }
    }
}

/// Status logging runs off its own ticker. With no interval configured a
/// slow placeholder keeps the select arm alive; its ticks are ignored.
fn new_status_ticker(interval: Option<Duration>) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(interval.unwrap_or(Duration::from_secs(3600)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.reset();
    ticker
}

fn escalation_alert(device: Device, issue: &Issue) -> AlertEvent {
    AlertEvent {
        kind: AlertKind::Escalated,
        message: format!(
            "{} ({}): {} remains after exhausting the remediation budget",
            device.hostname, device.address, issue.kind
        ),
        device: Some(device.address),
        hostname: Some(device.hostname),
        severity: Severity::Critical,
        issue: Some(issue.kind),
        requires_approval: false,
        at: Utc::now(),
    }
}

fn approval_alert(device: Device, state: &crate::device::DeviceState) -> AlertEvent {
    let issue = state.issue().map(|i| i.kind);
    let severity = state.severity().unwrap_or(Severity::Degraded);
    AlertEvent {
        kind: AlertKind::ApprovalRequired,
        message: format!(
            "{} ({}) needs operator approval before remediation",
            device.hostname, device.address
        ),
        device: Some(device.address),
        hostname: Some(device.hostname),
        severity,
        issue,
        requires_approval: true,
        at: Utc::now(),
    }
}

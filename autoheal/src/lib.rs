//! Self-healing fleet monitoring for network devices.
//!
//! This crate watches a fleet of devices and repairs common failures without
//! a human in the loop:
//! - Polls device telemetry on a jittered per-device schedule
//! - Classifies readings into health verdicts with trend-based rules
//! - Drives a per-device state machine through detection, remediation,
//!   verification, and escalation
//! - Bounds automation with retry budgets, exponential cooldowns, manual
//!   approval gates, and kill-switches
//! - Alerts operators on escalations and fleet-wide collaborator outages
//!
//! # Example
//! ```ignore
//! use autoheal::{Config, ConfigHandle, Orchestrator, TracingNotifier};
//!
//! let config = ConfigHandle::new(Config::load("autoheal.yaml")?)?;
//! let orchestrator = Arc::new(Orchestrator::new(
//!     config,
//!     Arc::new(SnmpTelemetry::new()),
//!     Arc::new(SshExecutor::new()),
//!     Arc::new(TracingNotifier),
//! ));
//!
//! // Run until shutdown is requested
//! orchestrator.run().await;
//! ```

pub mod classifier;
pub mod collaborators;
pub mod config;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use classifier::classify;
pub use collaborators::{
    ActionExecutor, MockExecutor, MockNotifier, MockTelemetry, Notifier, TelemetrySource,
    TracingNotifier,
};
pub use config::{Config, ConfigHandle, PolicyConfig, SchedulerConfig, Thresholds};
pub use device::{DeviceSnapshot, DeviceState, MachineEvent, StateKind};
pub use error::{AutohealError, Result};
pub use orchestrator::Orchestrator;
pub use policy::{evaluate, DenyReason, PolicyDecision, PolicyInput};
pub use registry::{FleetSummary, Registry};
pub use types::*;

use thiserror::Error;

/// Result type for autoheal operations.
pub type Result<T> = std::result::Result<T, AutohealError>;

/// Errors that can occur in the autoheal system.
///
/// Per-attempt failures are absorbed by the device state machine's
/// retry/backoff logic and only surface to operators once the retry budget
/// is exhausted.
#[derive(Debug, Error)]
pub enum AutohealError {
    /// The telemetry collaborator could not produce a reading
    #[error("telemetry unavailable for {device}: {reason}")]
    TelemetryUnavailable { device: String, reason: String },

    /// The action executor reported a failure
    #[error("remediation action failed on {device}: {reason}")]
    ActionFailed { device: String, reason: String },

    /// The action executor did not respond within the deadline
    #[error("remediation action timed out on {device} after {timeout:?}")]
    ActionTimeout {
        device: String,
        timeout: std::time::Duration,
    },

    /// An action reported success but the follow-up health check disagreed
    #[error("action reported success but {device} still has issue {issue}")]
    VerificationMismatch {
        device: String,
        issue: crate::types::IssueKind,
    },

    /// Policy forbids the requested remediation
    #[error("policy denied remediation: {0}")]
    PolicyDenied(String),

    /// Configuration failed validation; the previous configuration stays active
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Device is not in the registry
    #[error("unknown device: {0}")]
    DeviceNotFound(String),

    /// A manual action request was not accepted
    #[error("manual action rejected: {0}")]
    ManualActionRejected(String),

    /// Internal error
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

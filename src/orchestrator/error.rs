//! Error types for integration process orchestration.

use std::time::Duration;

use thiserror::Error;

use crate::integration::IntegrationType;
use crate::orchestrator::state::LifecycleState;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur while orchestrating integration processes.
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    /// Customer is not in the catalog.
    #[error("Customer '{name}' not found")]
    UnknownCustomer {
        /// Requested customer name.
        name: String,
    },

    /// Customer's catalog entry does not list the integration.
    #[error("Customer '{customer}' has no '{integration}' integration configured")]
    UnknownIntegration {
        customer: String,
        integration: IntegrationType,
    },

    /// No free host port left in the configured range.
    #[error("No free ports left in range {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    /// The runtime refused or failed to launch the process.
    #[error("Failed to launch '{name}': {reason}")]
    LaunchFailed {
        /// Process/container name.
        name: String,
        /// Reason for failure.
        reason: String,
    },

    /// The launch call did not return within the bound.
    #[error("Launching '{name}' did not complete within {timeout:?}")]
    LaunchTimeout { name: String, timeout: Duration },

    /// Process never answered its health endpoint in time.
    #[error("'{name}' failed health check within {timeout:?}: {reason}")]
    HealthCheckFailed {
        name: String,
        timeout: Duration,
        reason: String,
    },

    /// The runtime could not stop the process.
    #[error("Failed to terminate '{process_id}': {reason}")]
    TerminateFailed { process_id: String, reason: String },

    /// The runtime backend itself is unreachable.
    #[error("Process runtime not available: {reason}")]
    RuntimeUnavailable { reason: String },

    /// Attempted a transition outside the lifecycle graph.
    #[error("Invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    /// A concurrent start attempt on the same key ended in failure.
    #[error("Start of {customer}/{integration} failed: {reason}")]
    StartAttemptFailed {
        customer: String,
        integration: IntegrationType,
        reason: String,
    },
}

impl OrchestratorError {
    /// Configuration errors are never retried and surface verbatim.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownCustomer { .. } | Self::UnknownIntegration { .. }
        )
    }

    /// Transient errors may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PortsExhausted { .. }
                | Self::LaunchTimeout { .. }
                | Self::HealthCheckFailed { .. }
                | Self::RuntimeUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let unknown = OrchestratorError::UnknownIntegration {
            customer: "Acme".to_string(),
            integration: IntegrationType::Telephony,
        };
        assert!(unknown.is_config_error());
        assert!(!unknown.is_transient());

        let exhausted = OrchestratorError::PortsExhausted {
            start: 9100,
            end: 9101,
        };
        assert!(exhausted.is_transient());
        assert!(!exhausted.is_config_error());
        assert_eq!(exhausted.to_string(), "No free ports left in range 9100-9101");
    }
}

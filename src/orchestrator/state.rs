//! Lifecycle states, the transition graph, and per-key records.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::integration::IntegrationType;
use crate::orchestrator::error::{OrchestratorError, Result};

/// Lifecycle of one (customer, integration) process.
///
/// ```text
/// ABSENT -> STARTING -> HEALTHY <-> UNHEALTHY -> STOPPING -> ABSENT
///              |            \________________________^
///              v
///           FAILED -> STARTING
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Absent,
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
    Failed,
}

impl LifecycleState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::{Absent, Failed, Healthy, Starting, Stopping, Unhealthy};

        matches!(
            (self, next),
            (Absent, Starting)
                | (Failed, Starting)
                | (Starting, Healthy)
                | (Starting, Failed)
                | (Healthy, Unhealthy)
                | (Unhealthy, Healthy)
                | (Healthy, Stopping)
                | (Unhealthy, Stopping)
                | (Stopping, Absent)
        )
    }

    /// Checked transition.
    pub fn transition(self, next: LifecycleState) -> Result<LifecycleState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// `ABSENT` and `FAILED` only allow a new start.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Absent | Self::Failed)
    }

    /// A process exists and holds its port.
    pub fn is_resident(self) -> bool {
        matches!(self, Self::Healthy | Self::Unhealthy)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "ABSENT",
            Self::Starting => "STARTING",
            Self::Healthy => "HEALTHY",
            Self::Unhealthy => "UNHEALTHY",
            Self::Stopping => "STOPPING",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Key of a lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub customer: String,
    pub integration: IntegrationType,
}

impl RecordKey {
    pub fn new(customer: impl Into<String>, integration: IntegrationType) -> Self {
        Self {
            customer: customer.into(),
            integration,
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.customer, self.integration)
    }
}

/// One running process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub customer: String,
    pub integration: IntegrationType,
    pub port: u16,
    /// Runtime identifier (container id).
    pub process_id: String,
    pub endpoint_url: String,
    pub launched_at: DateTime<Utc>,
}

/// Snapshot of the lifecycle of one key.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleRecord {
    pub customer: String,
    pub integration: IntegrationType,
    pub state: LifecycleState,
    pub handle: Option<ProcessHandle>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Why the last start failed, kept for diagnostics.
    pub last_error: Option<String>,
    /// Start attempts made on this record.
    pub attempts: u64,
}

impl LifecycleRecord {
    pub(crate) fn absent(key: &RecordKey) -> Self {
        Self {
            customer: key.customer.clone(),
            integration: key.integration,
            state: LifecycleState::Absent,
            handle: None,
            last_health_check: None,
            consecutive_failures: 0,
            last_error: None,
            attempts: 0,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.customer.clone(), self.integration)
    }

    pub fn endpoint_url(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.endpoint_url.as_str())
    }

    /// Move along one edge of the lifecycle graph.
    pub(crate) fn advance(&mut self, next: LifecycleState) -> Result<()> {
        self.state = self.state.transition(next)?;
        Ok(())
    }
}

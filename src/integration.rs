//! Integration types and the transport each one speaks.

use serde::{Deserialize, Serialize};

/// Header a session-oriented client echoes after the initialize handshake.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// One category of backend tool provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationType {
    /// Metrics dashboarding (Grafana).
    #[serde(alias = "grafana")]
    Metrics,
    /// Alert management (Alertmanager).
    #[serde(alias = "alertmanager")]
    Alerting,
    /// Contact-center telephony (Genesys Cloud).
    #[serde(alias = "genesys")]
    Telephony,
}

/// How a client talks to a running tool provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TransportMode {
    /// One HTTP request per tool call.
    Stateless,
    /// Initialize first, then echo the returned session id in `header`.
    SessionOriented { header: &'static str },
}

impl IntegrationType {
    pub const ALL: [IntegrationType; 3] = [Self::Metrics, Self::Alerting, Self::Telephony];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Alerting => "alerting",
            Self::Telephony => "telephony",
        }
    }

    /// Prefix for per-integration environment overrides (`METRICS_IMAGE`, ...).
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Self::Metrics => "METRICS",
            Self::Alerting => "ALERTING",
            Self::Telephony => "TELEPHONY",
        }
    }

    pub fn transport(&self) -> TransportMode {
        match self {
            Self::Metrics => TransportMode::Stateless,
            Self::Alerting | Self::Telephony => TransportMode::SessionOriented {
                header: SESSION_HEADER,
            },
        }
    }

    /// Path the agent's tool client connects to.
    pub fn endpoint_path(&self) -> &'static str {
        match self.transport() {
            TransportMode::Stateless => "/mcp",
            TransportMode::SessionOriented { .. } => "/sse",
        }
    }

    pub fn health_path(&self) -> &'static str {
        "/health"
    }

    /// Port the provider listens on inside its container.
    pub fn internal_port(&self) -> u16 {
        match self {
            Self::Metrics => 8000,
            Self::Alerting | Self::Telephony => 8080,
        }
    }

    pub fn default_image(&self) -> &'static str {
        match self {
            Self::Metrics => "grafana/mcp-grafana:latest",
            Self::Alerting => "toolfleet/alertmanager-mcp:latest",
            Self::Telephony => "toolfleet/genesys-mcp:latest",
        }
    }
}

impl std::fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntegrationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "metrics" | "grafana" => Ok(Self::Metrics),
            "alerting" | "alertmanager" => Ok(Self::Alerting),
            "telephony" | "genesys" => Ok(Self::Telephony),
            _ => Err(format!(
                "unknown integration type '{}', expected 'metrics', 'alerting' or 'telephony'",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("grafana".parse::<IntegrationType>(), Ok(IntegrationType::Metrics));
        assert_eq!("Alerting".parse::<IntegrationType>(), Ok(IntegrationType::Alerting));
        assert_eq!("genesys".parse::<IntegrationType>(), Ok(IntegrationType::Telephony));
        assert!("ssh".parse::<IntegrationType>().is_err());
    }

    #[test]
    fn test_serde_alias() {
        let ty: IntegrationType = serde_json::from_str("\"alertmanager\"").unwrap();
        assert_eq!(ty, IntegrationType::Alerting);
        assert_eq!(serde_json::to_string(&ty).unwrap(), "\"alerting\"");
    }

    #[test]
    fn test_transport_shapes() {
        assert_eq!(IntegrationType::Metrics.transport(), TransportMode::Stateless);
        assert_eq!(IntegrationType::Metrics.endpoint_path(), "/mcp");
        assert!(matches!(
            IntegrationType::Telephony.transport(),
            TransportMode::SessionOriented { header: SESSION_HEADER }
        ));
        assert_eq!(IntegrationType::Alerting.endpoint_path(), "/sse");
    }
}

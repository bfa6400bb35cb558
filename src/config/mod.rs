//! Process-wide settings, resolved once from the environment at startup.

mod health;
pub(crate) mod helpers;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub use health::{HealthSettings, HealthSettingsTable};

use crate::catalog::default_catalog_path;
use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;
use crate::integration::IntegrationType;

/// Inclusive range of host ports handed out to integration processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, ConfigError> {
        if start == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TOOLFLEET_PORT_RANGE_START".to_string(),
                message: "port 0 cannot be allocated".to_string(),
            });
        }
        if end < start {
            return Err(ConfigError::InvalidValue {
                key: "TOOLFLEET_PORT_RANGE_END".to_string(),
                message: format!("end {} is below start {}", end, start),
            });
        }
        Ok(Self { start, end })
    }

    /// Number of ports in the range.
    pub fn size(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 9100,
            end: 9399,
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of customers with resident processes.
    pub max_warm: usize,
    pub port_range: PortRange,
    /// Docker network the integration containers join.
    pub network: String,
    /// Host used when building endpoint and health URLs.
    pub endpoint_host: String,
    /// Bound on a single launch call against the runtime.
    pub launch_timeout: Duration,
    pub health: HealthSettingsTable,
    /// Image per integration type.
    pub images: Vec<(IntegrationType, String)>,
    /// Pull images missing locally before launching.
    pub auto_pull: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_warm: 3,
            port_range: PortRange::default(),
            network: "toolfleet-net".to_string(),
            endpoint_host: "127.0.0.1".to_string(),
            launch_timeout: Duration::from_secs(60),
            health: HealthSettingsTable::default(),
            images: IntegrationType::ALL
                .iter()
                .map(|ty| (*ty, ty.default_image().to_string()))
                .collect(),
            auto_pull: true,
        }
    }
}

impl OrchestratorConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_warm = parse_optional_env("TOOLFLEET_MAX_WARM", defaults.max_warm)?;
        if max_warm == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TOOLFLEET_MAX_WARM".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let port_range = PortRange::new(
            parse_optional_env("TOOLFLEET_PORT_RANGE_START", defaults.port_range.start)?,
            parse_optional_env("TOOLFLEET_PORT_RANGE_END", defaults.port_range.end)?,
        )?;
        let needed = max_warm * IntegrationType::ALL.len();
        if port_range.size() < needed {
            tracing::warn!(
                ports = port_range.size(),
                needed,
                "Port range cannot hold every integration of {} warm customers",
                max_warm
            );
        }

        let mut images = Vec::with_capacity(defaults.images.len());
        for (ty, default_image) in defaults.images {
            let key = format!("{}_IMAGE", ty.env_prefix());
            images.push((ty, optional_env(&key)?.unwrap_or(default_image)));
        }

        Ok(Self {
            max_warm,
            port_range,
            network: optional_env("TOOLFLEET_NETWORK")?.unwrap_or(defaults.network),
            endpoint_host: optional_env("TOOLFLEET_ENDPOINT_HOST")?
                .unwrap_or(defaults.endpoint_host),
            launch_timeout: Duration::from_secs(parse_optional_env(
                "TOOLFLEET_LAUNCH_TIMEOUT_SECS",
                defaults.launch_timeout.as_secs(),
            )?),
            health: HealthSettingsTable::resolve()?,
            images,
            auto_pull: parse_optional_env("TOOLFLEET_AUTO_PULL", defaults.auto_pull)?,
        })
    }

    pub fn image(&self, ty: IntegrationType) -> &str {
        self.images
            .iter()
            .find(|(t, _)| *t == ty)
            .map(|(_, image)| image.as_str())
            .unwrap_or_else(|| ty.default_image())
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub catalog_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    /// Load configuration from environment variables (after `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr = optional_env("TOOLFLEET_BIND_ADDR")?
            .unwrap_or_else(|| "127.0.0.1:8400".to_string());
        let bind_addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "TOOLFLEET_BIND_ADDR".to_string(),
                message: format!("'{}' is not a socket address: {e}", bind_addr),
            })?;

        Ok(Self {
            catalog_path: optional_env("TOOLFLEET_CATALOG")?
                .map(PathBuf::from)
                .unwrap_or_else(default_catalog_path),
            bind_addr,
            orchestrator: OrchestratorConfig::resolve()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bad_key(result: Result<PortRange, ConfigError>) -> String {
        match result {
            Err(ConfigError::InvalidValue { key, .. }) => key,
            other => panic!("expected invalid value, got {:?}", other),
        }
    }

    #[test]
    fn test_port_range_validation() {
        assert_eq!(
            bad_key(PortRange::new(9000, 8999)),
            "TOOLFLEET_PORT_RANGE_END"
        );
        assert_eq!(bad_key(PortRange::new(0, 10)), "TOOLFLEET_PORT_RANGE_START");
        assert_eq!(PortRange::new(9000, 9000).unwrap().size(), 1);
        assert_eq!(PortRange::default().size(), 300);
    }

    #[test]
    fn test_default_images() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_warm, 3);
        assert_eq!(
            config.image(IntegrationType::Metrics),
            "grafana/mcp-grafana:latest"
        );
    }
}

use std::time::Duration;

use crate::config::helpers::{parse_env_override, parse_optional_env};
use crate::error::ConfigError;
use crate::integration::IntegrationType;

/// Health-check policy for one integration type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    /// Delay between probes, both while starting and once healthy.
    pub interval: Duration,
    /// Bound on the STARTING -> HEALTHY wait.
    pub startup_timeout: Duration,
    /// Bound on a single probe request.
    pub probe_timeout: Duration,
    /// Consecutive failed probes before a healthy record turns unhealthy.
    pub unhealthy_threshold: u32,
    /// Consecutive failed probes before operators are alerted. Never tears
    /// the process down.
    pub escalate_after: Option<u32>,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            startup_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            escalate_after: Some(10),
        }
    }
}

/// Default health settings plus per-integration overrides.
#[derive(Debug, Clone, Default)]
pub struct HealthSettingsTable {
    pub default: HealthSettings,
    pub overrides: Vec<(IntegrationType, HealthSettings)>,
}

impl HealthSettingsTable {
    pub fn uniform(settings: HealthSettings) -> Self {
        Self {
            default: settings,
            overrides: Vec::new(),
        }
    }

    pub fn with_override(mut self, ty: IntegrationType, settings: HealthSettings) -> Self {
        self.overrides.retain(|(t, _)| *t != ty);
        self.overrides.push((ty, settings));
        self
    }

    pub fn for_integration(&self, ty: IntegrationType) -> HealthSettings {
        self.overrides
            .iter()
            .find(|(t, _)| *t == ty)
            .map(|(_, s)| *s)
            .unwrap_or(self.default)
    }

    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = HealthSettings::default();

        let unhealthy_threshold =
            parse_optional_env("HEALTH_UNHEALTHY_THRESHOLD", defaults.unhealthy_threshold)?;
        if unhealthy_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                key: "HEALTH_UNHEALTHY_THRESHOLD".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        // 0 disables escalation
        let escalate_after = parse_optional_env(
            "HEALTH_ESCALATE_AFTER",
            defaults.escalate_after.unwrap_or(0),
        )?;

        let default = HealthSettings {
            interval: Duration::from_millis(parse_optional_env(
                "HEALTH_INTERVAL_MS",
                defaults.interval.as_millis() as u64,
            )?),
            startup_timeout: Duration::from_secs(parse_optional_env(
                "HEALTH_STARTUP_TIMEOUT_SECS",
                defaults.startup_timeout.as_secs(),
            )?),
            probe_timeout: Duration::from_millis(parse_optional_env(
                "HEALTH_PROBE_TIMEOUT_MS",
                defaults.probe_timeout.as_millis() as u64,
            )?),
            unhealthy_threshold,
            escalate_after: (escalate_after > 0).then_some(escalate_after),
        };

        let mut table = Self::uniform(default);
        for ty in IntegrationType::ALL {
            let prefix = ty.env_prefix();
            let interval: Option<u64> =
                parse_env_override(&format!("{prefix}_HEALTH_INTERVAL_MS"))?;
            let startup: Option<u64> =
                parse_env_override(&format!("{prefix}_HEALTH_STARTUP_TIMEOUT_SECS"))?;

            if interval.is_none() && startup.is_none() {
                continue;
            }

            let mut settings = default;
            if let Some(ms) = interval {
                settings.interval = Duration::from_millis(ms);
            }
            if let Some(secs) = startup {
                settings.startup_timeout = Duration::from_secs(secs);
            }
            table = table.with_override(ty, settings);
        }

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_lookup() {
        let slow = HealthSettings {
            startup_timeout: Duration::from_secs(120),
            ..Default::default()
        };
        let table = HealthSettingsTable::default().with_override(IntegrationType::Telephony, slow);

        assert_eq!(
            table.for_integration(IntegrationType::Telephony).startup_timeout,
            Duration::from_secs(120)
        );
        assert_eq!(
            table.for_integration(IntegrationType::Metrics),
            HealthSettings::default()
        );
    }

    #[test]
    fn test_defaults_never_tear_down() {
        let settings = HealthSettings::default();
        assert_eq!(settings.unhealthy_threshold, 3);
        assert_eq!(settings.escalate_after, Some(10));
    }
}

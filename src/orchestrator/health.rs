//! Health probing for integration workers.
//!
//! Every worker exposes `GET /health`. Only a success status counts as
//! healthy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::HealthSettings;
use crate::orchestrator::error::{OrchestratorError, Result};
use crate::orchestrator::state::LifecycleState;

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

/// One health request against a worker.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeOutcome;
}

/// HTTP `GET` probe.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        match self.client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Healthy,
            Ok(resp) => ProbeOutcome::Unhealthy(format!("status {}", resp.status())),
            // Connection refused is expected while a worker boots
            Err(e) if e.is_connect() => ProbeOutcome::Unhealthy("connection refused".to_string()),
            Err(e) if e.is_timeout() => ProbeOutcome::Unhealthy("probe timed out".to_string()),
            Err(e) => ProbeOutcome::Unhealthy(e.to_string()),
        }
    }
}

/// Polls worker health endpoints.
#[derive(Clone)]
pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
}

impl HealthChecker {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self { probe }
    }

    /// HTTP checker with the given per-probe timeout.
    pub fn http(probe_timeout: Duration) -> Self {
        Self::new(Arc::new(HttpHealthProbe::new(probe_timeout)))
    }

    /// One probe, bounded by `settings.probe_timeout`.
    pub async fn check(&self, url: &str, settings: &HealthSettings) -> ProbeOutcome {
        match tokio::time::timeout(settings.probe_timeout, self.probe.probe(url)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Unhealthy(format!(
                "no answer within {:?}",
                settings.probe_timeout
            )),
        }
    }

    /// Poll until the first healthy probe or until `settings.startup_timeout` passes.
    pub async fn wait_until_healthy(
        &self,
        name: &str,
        url: &str,
        settings: &HealthSettings,
    ) -> Result<()> {
        let start = tokio::time::Instant::now();
        let deadline = start + settings.startup_timeout;
        let mut last_failure = "no probe completed".to_string();

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            let probe_settings = HealthSettings {
                probe_timeout: settings.probe_timeout.min(remaining),
                ..*settings
            };
            match self.check(url, &probe_settings).await {
                ProbeOutcome::Healthy => {
                    tracing::debug!(
                        name,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Worker answered health check"
                    );
                    return Ok(());
                }
                ProbeOutcome::Unhealthy(reason) => {
                    tracing::trace!(name, "Health check failed: {}", reason);
                    last_failure = reason;
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(settings.interval.min(remaining)).await;
        }

        Err(OrchestratorError::HealthCheckFailed {
            name: name.to_string(),
            timeout: settings.startup_timeout,
            reason: last_failure,
        })
    }
}

/// What a steady-state probe result means for a resident record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthVerdict {
    pub state: LifecycleState,
    pub consecutive_failures: u32,
    /// The failure count just reached the escalation threshold.
    pub escalate: bool,
}

/// Apply one probe outcome to a HEALTHY or UNHEALTHY record.
///
/// Health failures never lead to teardown: the worst outcome is UNHEALTHY.
pub fn assess(
    current: LifecycleState,
    consecutive_failures: u32,
    outcome: &ProbeOutcome,
    settings: &HealthSettings,
) -> HealthVerdict {
    if outcome.is_healthy() {
        return HealthVerdict {
            state: LifecycleState::Healthy,
            consecutive_failures: 0,
            escalate: false,
        };
    }

    let failures = consecutive_failures.saturating_add(1);
    let state = if failures >= settings.unhealthy_threshold {
        LifecycleState::Unhealthy
    } else {
        current
    };

    HealthVerdict {
        state,
        consecutive_failures: failures,
        escalate: settings.escalate_after == Some(failures),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FlakyProbe {
        healthy_after: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        async fn probe(&self, _url: &str) -> ProbeOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.healthy_after {
                ProbeOutcome::Healthy
            } else {
                ProbeOutcome::Unhealthy("connection refused".to_string())
            }
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self, _url: &str) -> ProbeOutcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ProbeOutcome::Healthy
        }
    }

    fn fast_settings() -> HealthSettings {
        HealthSettings {
            interval: Duration::from_millis(5),
            startup_timeout: Duration::from_millis(300),
            probe_timeout: Duration::from_millis(50),
            unhealthy_threshold: 3,
            escalate_after: Some(5),
        }
    }

    #[tokio::test]
    async fn test_wait_until_healthy_after_retries() {
        let probe = Arc::new(FlakyProbe {
            healthy_after: 3,
            calls: AtomicU32::new(0),
        });
        let checker = HealthChecker::new(probe.clone());

        checker
            .wait_until_healthy("w", "http://127.0.0.1:1/health", &fast_settings())
            .await
            .unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_wait_until_healthy_times_out() {
        let checker = HealthChecker::new(Arc::new(FlakyProbe {
            healthy_after: u32::MAX,
            calls: AtomicU32::new(0),
        }));

        let err = checker
            .wait_until_healthy("w", "http://127.0.0.1:1/health", &fast_settings())
            .await
            .unwrap_err();
        match err {
            OrchestratorError::HealthCheckFailed { reason, .. } => {
                assert_eq!(reason, "connection refused")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_hanging_probe_is_bounded() {
        let checker = HealthChecker::new(Arc::new(HangingProbe));
        let started = std::time::Instant::now();

        let outcome = checker.check("http://x/health", &fast_settings()).await;
        assert!(!outcome.is_healthy());
        assert!(started.elapsed() < Duration::from_secs(5));

        let result = checker
            .wait_until_healthy("w", "http://x/health", &fast_settings())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        // Nothing listens on port 1.
        let probe = HttpHealthProbe::new(Duration::from_millis(500));
        let outcome = probe.probe("http://127.0.0.1:1/health").await;
        assert!(!outcome.is_healthy());
    }

    #[test]
    fn test_assess_three_strikes() {
        let settings = fast_settings();
        let fail = ProbeOutcome::Unhealthy("boom".to_string());

        let v1 = assess(LifecycleState::Healthy, 0, &fail, &settings);
        assert_eq!(v1.state, LifecycleState::Healthy);
        let v2 = assess(v1.state, v1.consecutive_failures, &fail, &settings);
        assert_eq!(v2.state, LifecycleState::Healthy);
        let v3 = assess(v2.state, v2.consecutive_failures, &fail, &settings);
        assert_eq!(v3.state, LifecycleState::Unhealthy);
        assert_eq!(v3.consecutive_failures, 3);
        assert!(!v3.escalate);

        let recovered = assess(v3.state, v3.consecutive_failures, &ProbeOutcome::Healthy, &settings);
        assert_eq!(recovered.state, LifecycleState::Healthy);
        assert_eq!(recovered.consecutive_failures, 0);
    }

    #[test]
    fn test_assess_escalates_once() {
        let settings = fast_settings();
        let fail = ProbeOutcome::Unhealthy("boom".to_string());

        assert!(assess(LifecycleState::Unhealthy, 4, &fail, &settings).escalate);
        assert!(!assess(LifecycleState::Unhealthy, 5, &fail, &settings).escalate);

        let never = HealthSettings {
            escalate_after: None,
            ..settings
        };
        let verdict = assess(LifecycleState::Unhealthy, 100, &fail, &never);
        assert!(!verdict.escalate);
        assert_eq!(verdict.state, LifecycleState::Unhealthy);
    }
}

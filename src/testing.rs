//! Test harness for driving the orchestrator without Docker or HTTP.
//!
//! Provides:
//! - [`StubRuntime`]: an in-memory process runtime with launch counters and
//!   failure toggles
//! - [`StubProbe`]: a health probe that answers from the stub runtime's
//!   process table
//! - [`TestHarnessBuilder`]: wires catalog, allocator, manager, warm pool
//!   and coordinator with fast timings
//!
//! # Usage
//!
//! ```rust,no_run
//! use toolfleet::testing::TestHarnessBuilder;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let harness = TestHarnessBuilder::new().with_max_warm(2).build();
//!     let report = harness.coordinator.switch_to("acme").await.unwrap();
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::catalog::{CustomerSpec, IntegrationCatalog, IntegrationParams};
use crate::config::{HealthSettings, HealthSettingsTable, OrchestratorConfig, PortRange};
use crate::integration::IntegrationType;
use crate::orchestrator::{
    ContainerLifecycleManager, CustomerSwitchCoordinator, HealthChecker, HealthProbe,
    OrchestratorError, PortAllocator, ProbeOutcome, ProcessRuntime, ProcessSpec,
    ProcessSpecBuilder, WarmPool,
};

/// A process the stub runtime considers running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubProcess {
    pub id: String,
    pub customer: String,
    pub integration: IntegrationType,
    pub port: u16,
}

#[derive(Default)]
struct StubState {
    running: HashMap<String, StubProcess>,
    orphans: HashSet<String>,
    failing: HashSet<IntegrationType>,
    launches: HashMap<IntegrationType, u32>,
    peak_customers: usize,
}

/// In-memory [`ProcessRuntime`].
///
/// Supports:
/// - Launch counting per integration via [`launches()`](Self::launches)
/// - Per-integration launch failures via [`set_launch_failing()`](Self::set_launch_failing)
/// - An artificial launch delay, to overlap concurrent callers
/// - Terminate failures via [`set_terminate_failing()`](Self::set_terminate_failing)
///   and a terminate delay, to hold evictions open
/// - Pre-existing unmanaged processes via [`add_orphan()`](Self::add_orphan)
pub struct StubRuntime {
    state: Mutex<StubState>,
    next_id: AtomicU32,
    terminate_count: AtomicU32,
    launch_delay_ms: AtomicU64,
    terminate_delay_ms: AtomicU64,
    terminate_failing: AtomicBool,
}

impl StubRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState::default()),
            next_id: AtomicU32::new(1),
            terminate_count: AtomicU32::new(0),
            launch_delay_ms: AtomicU64::new(0),
            terminate_delay_ms: AtomicU64::new(0),
            terminate_failing: AtomicBool::new(false),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch calls made for `ty`, failed ones included.
    pub fn launches(&self, ty: IntegrationType) -> u32 {
        self.state().launches.get(&ty).copied().unwrap_or(0)
    }

    pub fn total_launches(&self) -> u32 {
        self.state().launches.values().sum()
    }

    pub fn terminations(&self) -> u32 {
        self.terminate_count.load(Ordering::Relaxed)
    }

    /// Toggle whether launches of `ty` fail.
    pub fn set_launch_failing(&self, ty: IntegrationType, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing.insert(ty);
        } else {
            state.failing.remove(&ty);
        }
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        self.launch_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_terminate_delay(&self, delay: Duration) {
        self.terminate_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_terminate_failing(&self, fail: bool) {
        self.terminate_failing.store(fail, Ordering::Relaxed);
    }

    /// Register a managed process no record knows about.
    pub fn add_orphan(&self, id: impl Into<String>) {
        self.state().orphans.insert(id.into());
    }

    /// Tracked running processes, orphans excluded, ordered by port.
    pub fn running(&self) -> Vec<StubProcess> {
        let mut running: Vec<_> = self.state().running.values().cloned().collect();
        running.sort_by_key(|p| p.port);
        running
    }

    pub fn process_on_port(&self, port: u16) -> Option<StubProcess> {
        self.state()
            .running
            .values()
            .find(|p| p.port == port)
            .cloned()
    }

    /// Most distinct customers ever running at the same time.
    pub fn peak_customers(&self) -> usize {
        self.state().peak_customers
    }
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRuntime for StubRuntime {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn launch(&self, spec: &ProcessSpec) -> Result<String, OrchestratorError> {
        {
            let mut state = self.state();
            *state.launches.entry(spec.integration).or_insert(0) += 1;
        }

        let delay = self.launch_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut state = self.state();
        if state.failing.contains(&spec.integration) {
            return Err(OrchestratorError::LaunchFailed {
                name: spec.name.clone(),
                reason: "stub launch failure".to_string(),
            });
        }
        if state.running.values().any(|p| p.port == spec.port) {
            return Err(OrchestratorError::LaunchFailed {
                name: spec.name.clone(),
                reason: format!("port {} already bound", spec.port),
            });
        }

        let id = format!(
            "stub-{}-{}",
            spec.name,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        state.running.insert(
            id.clone(),
            StubProcess {
                id: id.clone(),
                customer: spec.customer.clone(),
                integration: spec.integration,
                port: spec.port,
            },
        );

        let customers: HashSet<_> = state.running.values().map(|p| &p.customer).collect();
        let count = customers.len();
        state.peak_customers = state.peak_customers.max(count);
        Ok(id)
    }

    async fn terminate(&self, process_id: &str) -> Result<(), OrchestratorError> {
        self.terminate_count.fetch_add(1, Ordering::Relaxed);
        let delay = self.terminate_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.terminate_failing.load(Ordering::Relaxed) {
            return Err(OrchestratorError::TerminateFailed {
                process_id: process_id.to_string(),
                reason: "stub terminate failure".to_string(),
            });
        }

        let mut state = self.state();
        state.running.remove(process_id);
        state.orphans.remove(process_id);
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<String>, OrchestratorError> {
        let state = self.state();
        Ok(state
            .running
            .keys()
            .chain(state.orphans.iter())
            .cloned()
            .collect())
    }
}

/// Health probe backed by a [`StubRuntime`].
///
/// A URL is healthy when a stub process is bound to its port and its
/// integration has not been marked unhealthy.
pub struct StubProbe {
    runtime: Arc<StubRuntime>,
    unhealthy: Mutex<HashSet<IntegrationType>>,
    probe_count: AtomicU32,
}

impl StubProbe {
    pub fn new(runtime: Arc<StubRuntime>) -> Self {
        Self {
            runtime,
            unhealthy: Mutex::new(HashSet::new()),
            probe_count: AtomicU32::new(0),
        }
    }

    /// Toggle whether processes of `ty` fail their health checks.
    pub fn set_unhealthy(&self, ty: IntegrationType, unhealthy: bool) {
        let mut set = self.unhealthy.lock().unwrap_or_else(|e| e.into_inner());
        if unhealthy {
            set.insert(ty);
        } else {
            set.remove(&ty);
        }
    }

    pub fn probes(&self) -> u32 {
        self.probe_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HealthProbe for StubProbe {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        self.probe_count.fetch_add(1, Ordering::Relaxed);

        let port = url::Url::parse(url).ok().and_then(|u| u.port());
        let Some(process) = port.and_then(|p| self.runtime.process_on_port(p)) else {
            return ProbeOutcome::Unhealthy("connection refused".to_string());
        };

        let unhealthy = self.unhealthy.lock().unwrap_or_else(|e| e.into_inner());
        if unhealthy.contains(&process.integration) {
            ProbeOutcome::Unhealthy("status 503 Service Unavailable".to_string())
        } else {
            ProbeOutcome::Healthy
        }
    }
}

/// Health timings short enough for tests.
pub fn fast_health_settings() -> HealthSettings {
    HealthSettings {
        interval: Duration::from_millis(10),
        startup_timeout: Duration::from_millis(200),
        probe_timeout: Duration::from_millis(50),
        unhealthy_threshold: 3,
        escalate_after: Some(10),
    }
}

/// Customer requiring `integrations`, with placeholder parameters.
pub fn customer_with(name: &str, integrations: &[IntegrationType]) -> CustomerSpec {
    integrations
        .iter()
        .fold(CustomerSpec::new(name), |spec, ty| {
            let params = match ty {
                IntegrationType::Metrics => IntegrationParams::default()
                    .with_target_url(format!("https://grafana.{}.example", name))
                    .with_credential("token", "test-token"),
                IntegrationType::Alerting => IntegrationParams::default()
                    .with_target_url(format!("https://alertmanager.{}.example", name)),
                IntegrationType::Telephony => IntegrationParams::default()
                    .with_region("mypurecloud.de")
                    .with_credential("client_id", "test-client")
                    .with_credential("client_secret", "test-secret"),
            };
            spec.with_integration(*ty, params)
        })
}

/// Default catalog: `acme` needs all three integrations, `globex` only
/// metrics, `initech` metrics and alerting.
pub fn test_catalog() -> IntegrationCatalog {
    IntegrationCatalog::from_customers([
        customer_with("acme", &IntegrationType::ALL),
        customer_with("globex", &[IntegrationType::Metrics]),
        customer_with(
            "initech",
            &[IntegrationType::Metrics, IntegrationType::Alerting],
        ),
    ])
}

/// Assembled test components.
pub struct TestHarness {
    pub catalog: Arc<IntegrationCatalog>,
    pub runtime: Arc<StubRuntime>,
    pub probe: Arc<StubProbe>,
    pub manager: ContainerLifecycleManager,
    pub coordinator: Arc<CustomerSwitchCoordinator>,
}

/// Builder for constructing a [`TestHarness`] with sensible defaults.
///
/// All defaults work without any external services:
/// - Catalog: [`test_catalog()`]
/// - Runtime: [`StubRuntime`], no delay, nothing failing
/// - Health: [`StubProbe`] with [`fast_health_settings()`]
/// - Warm pool: 3 customers, ports 9100-9199
pub struct TestHarnessBuilder {
    catalog: Option<IntegrationCatalog>,
    max_warm: usize,
    port_range: (u16, u16),
    launch_delay: Duration,
    launch_timeout: Duration,
    health: HealthSettings,
}

impl TestHarnessBuilder {
    pub fn new() -> Self {
        Self {
            catalog: None,
            max_warm: 3,
            port_range: (9100, 9199),
            launch_delay: Duration::ZERO,
            launch_timeout: Duration::from_secs(2),
            health: fast_health_settings(),
        }
    }

    /// Replace the catalog with these customers.
    pub fn with_customers(mut self, customers: impl IntoIterator<Item = CustomerSpec>) -> Self {
        self.catalog = Some(IntegrationCatalog::from_customers(customers));
        self
    }

    pub fn with_max_warm(mut self, max_warm: usize) -> Self {
        self.max_warm = max_warm;
        self
    }

    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = (start, end);
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    pub fn with_health(mut self, health: HealthSettings) -> Self {
        self.health = health;
        self
    }

    pub fn build(self) -> TestHarness {
        let catalog = Arc::new(self.catalog.unwrap_or_else(test_catalog));
        let (start, end) = self.port_range;
        let config = Arc::new(OrchestratorConfig {
            max_warm: self.max_warm,
            port_range: PortRange::new(start, end).expect("invalid test port range"),
            launch_timeout: self.launch_timeout,
            health: HealthSettingsTable::uniform(self.health),
            ..OrchestratorConfig::default()
        });

        let runtime = Arc::new(StubRuntime::new());
        runtime.set_launch_delay(self.launch_delay);
        let probe = Arc::new(StubProbe::new(Arc::clone(&runtime)));

        let manager = ContainerLifecycleManager::new(
            ProcessSpecBuilder::new(Arc::clone(&catalog), Arc::clone(&config)),
            Arc::new(PortAllocator::new(config.port_range)),
            Arc::clone(&runtime) as Arc<dyn ProcessRuntime>,
            HealthChecker::new(Arc::clone(&probe) as Arc<dyn HealthProbe>),
            config.health.clone(),
            config.launch_timeout,
        );
        let coordinator = Arc::new(CustomerSwitchCoordinator::new(
            Arc::clone(&catalog),
            manager.clone(),
            Arc::new(WarmPool::new(config.max_warm)),
        ));

        TestHarness {
            catalog,
            runtime,
            probe,
            manager,
            coordinator,
        }
    }
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-customer integration process orchestration.
//!
//! Each customer needs a set of integration workers (metrics, alerting,
//! telephony), each a long-running process on its own host port. Only a
//! bounded number of customers stay warm at once; switching to a new
//! customer evicts the least recently used one.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                      CustomerSwitchCoordinator                            │
//! │                                                                           │
//! │   switch_to(customer)                                                     │
//! │         │                                                                 │
//! │         ▼                                                                 │
//! │   ┌──────────────┐  victim   ┌───────────────────────────────┐            │
//! │   │ WarmPool     │──────────▶│ stop victim's integrations    │            │
//! │   │ touch (LRU)  │           │ (awaited before any start)    │            │
//! │   └──────────────┘           └───────────────────────────────┘            │
//! │         │                                                                 │
//! │         ▼  one start per integration, concurrently                        │
//! │   ┌──────────────────────────────────────────────────────────────────┐    │
//! │   │ ContainerLifecycleManager (per-key lock)                         │    │
//! │   │                                                                  │    │
//! │   │  PortAllocator ─▶ ProcessSpecBuilder ─▶ ProcessRuntime.launch    │    │
//! │   │                                              │                   │    │
//! │   │                                              ▼                   │    │
//! │   │                        HealthChecker.wait_until_healthy          │    │
//! │   │                           │ ok                 │ timeout         │    │
//! │   │                           ▼                    ▼                 │    │
//! │   │                  HEALTHY + monitor      FAILED, port freed       │    │
//! │   └──────────────────────────────────────────────────────────────────┘    │
//! │         │                                                                 │
//! │         ▼                                                                 │
//! │   SwitchReport { integration -> healthy, endpoint_url }                   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A health failure after startup only marks the record UNHEALTHY; the
//! process keeps its port and stays resident until stopped or evicted.

pub mod error;
pub mod health;
pub mod lifecycle;
pub mod ports;
pub mod runtime;
pub mod spec;
pub mod state;
pub mod switch;
pub mod warm_pool;

pub use error::OrchestratorError;
pub use health::{HealthChecker, HealthProbe, HttpHealthProbe, ProbeOutcome};
pub use lifecycle::ContainerLifecycleManager;
pub use ports::PortAllocator;
pub use runtime::{DockerRuntime, ProcessRuntime};
pub use spec::{ProcessSpec, ProcessSpecBuilder};
pub use state::{LifecycleRecord, LifecycleState, ProcessHandle, RecordKey};
pub use switch::{CustomerSwitchCoordinator, IntegrationOutcome, OrchestratorStatus, SwitchReport};
pub use warm_pool::{Admission, PoolEntry, WarmPool};

use std::sync::Arc;

use crate::catalog::IntegrationCatalog;
use crate::config::OrchestratorConfig;

/// Wire allocator, manager, pool and coordinator over a runtime.
pub fn build_coordinator(
    catalog: Arc<IntegrationCatalog>,
    config: Arc<OrchestratorConfig>,
    runtime: Arc<dyn ProcessRuntime>,
) -> CustomerSwitchCoordinator {
    // Per-integration bounds are enforced per probe; the client uses the widest.
    let probe_timeout = config
        .health
        .overrides
        .iter()
        .map(|(_, settings)| settings.probe_timeout)
        .fold(config.health.default.probe_timeout, std::cmp::max);
    let checker = HealthChecker::http(probe_timeout);
    let manager = ContainerLifecycleManager::new(
        ProcessSpecBuilder::new(Arc::clone(&catalog), Arc::clone(&config)),
        Arc::new(PortAllocator::new(config.port_range)),
        runtime,
        checker,
        config.health.clone(),
        config.launch_timeout,
    );
    CustomerSwitchCoordinator::new(catalog, manager, Arc::new(WarmPool::new(config.max_warm)))
}

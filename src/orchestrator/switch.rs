//! Customer switching: warm-pool accounting, eviction and concurrent starts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Notify;

use crate::catalog::IntegrationCatalog;
use crate::integration::{IntegrationType, TransportMode};
use crate::orchestrator::error::{OrchestratorError, Result};
use crate::orchestrator::lifecycle::ContainerLifecycleManager;
use crate::orchestrator::state::{LifecycleRecord, LifecycleState};
use crate::orchestrator::warm_pool::{Admission, PoolEntry, WarmPool};

/// Result of one integration within a switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrationOutcome {
    pub state: LifecycleState,
    pub healthy: bool,
    /// Present while the process is resident, even if unhealthy.
    pub endpoint_url: Option<String>,
    pub transport: TransportMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-integration outcome of a customer switch.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchReport {
    pub customer: String,
    pub integrations: BTreeMap<IntegrationType, IntegrationOutcome>,
    /// Customer evicted from the warm pool to make room.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evicted: Option<String>,
}

impl SwitchReport {
    pub fn get(&self, ty: IntegrationType) -> Option<&IntegrationOutcome> {
        self.integrations.get(&ty)
    }

    /// Integrations ready for tool calls.
    pub fn available(&self) -> Vec<IntegrationType> {
        self.integrations
            .iter()
            .filter(|(_, outcome)| outcome.healthy)
            .map(|(ty, _)| *ty)
            .collect()
    }

    pub fn failed(&self) -> Vec<IntegrationType> {
        self.integrations
            .iter()
            .filter(|(_, outcome)| !outcome.healthy)
            .map(|(ty, _)| *ty)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.integrations.values().all(|outcome| outcome.healthy)
    }

    /// One line for the agent layer, e.g.
    /// `2 of 3 integrations available; failed: telephony`.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} of {} integrations available",
            self.available().len(),
            self.integrations.len()
        );
        let failed = self.failed();
        if !failed.is_empty() {
            let names: Vec<_> = failed.iter().map(|ty| ty.as_str()).collect();
            line.push_str("; failed: ");
            line.push_str(&names.join(", "));
        }
        line
    }
}

/// Snapshot for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub max_warm: usize,
    /// Most recently used first.
    pub pool: Vec<PoolEntry>,
    pub records: Vec<LifecycleRecord>,
    pub ports_in_use: usize,
    pub ports_available: usize,
}

/// Entry point for switching the active customer.
pub struct CustomerSwitchCoordinator {
    catalog: Arc<IntegrationCatalog>,
    manager: ContainerLifecycleManager,
    pool: Arc<WarmPool>,
    /// Customers with a switch in flight, by number of concurrent switches.
    busy: Mutex<HashMap<String, usize>>,
    /// Signalled whenever a switch or a drain ends.
    settled: Arc<Notify>,
}

/// Marks a customer busy for the lifetime of a switch.
struct BusyGuard<'a> {
    coordinator: &'a CustomerSwitchCoordinator,
    customer: String,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        {
            let mut busy = self
                .coordinator
                .busy
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(count) = busy.get_mut(&self.customer) {
                *count -= 1;
                if *count == 0 {
                    busy.remove(&self.customer);
                }
            }
        }
        self.coordinator.settled.notify_waiters();
    }
}

impl CustomerSwitchCoordinator {
    pub fn new(
        catalog: Arc<IntegrationCatalog>,
        manager: ContainerLifecycleManager,
        pool: Arc<WarmPool>,
    ) -> Self {
        Self {
            catalog,
            manager,
            pool,
            busy: Mutex::new(HashMap::new()),
            settled: Arc::new(Notify::new()),
        }
    }

    pub fn catalog(&self) -> &IntegrationCatalog {
        &self.catalog
    }

    pub fn manager(&self) -> &ContainerLifecycleManager {
        &self.manager
    }

    pub fn pool(&self) -> &WarmPool {
        &self.pool
    }

    /// Make `customer` active and bring up every integration it requires.
    ///
    /// Only an unknown customer is an error; per-integration failures are
    /// reported in the [`SwitchReport`].
    pub async fn switch_to(&self, customer: &str) -> Result<SwitchReport> {
        let spec = self
            .catalog
            .customer(customer)
            .ok_or_else(|| OrchestratorError::UnknownCustomer {
                name: customer.to_string(),
            })?;
        let _busy = self.mark_busy(customer);

        let evicted = self.claim_pool_slot(customer).await;
        if let Some(victim) = &evicted {
            self.evict(victim).await;
        }

        let required = spec.required_integrations();
        tracing::info!(
            customer,
            integrations = required.len(),
            "Switching customer"
        );

        let results = join_all(
            required
                .iter()
                .map(|ty| self.manager.start(customer, *ty)),
        )
        .await;

        let mut integrations = BTreeMap::new();
        for (ty, result) in required.into_iter().zip(results) {
            let outcome = match result {
                Ok(record) => IntegrationOutcome {
                    state: record.state,
                    healthy: record.state == LifecycleState::Healthy,
                    endpoint_url: record.endpoint_url().map(str::to_string),
                    transport: ty.transport(),
                    error: None,
                },
                Err(e) => IntegrationOutcome {
                    state: self.manager.status(customer, ty),
                    healthy: false,
                    endpoint_url: None,
                    transport: ty.transport(),
                    error: Some(e.to_string()),
                },
            };
            integrations.insert(ty, outcome);
        }

        let report = SwitchReport {
            customer: customer.to_string(),
            integrations,
            evicted,
        };
        if report.is_complete() {
            tracing::info!(customer, "{}", report.summary());
        } else {
            tracing::warn!(customer, "{}", report.summary());
        }
        Ok(report)
    }

    /// Operator reclaim: drop the pool entry and stop every process of
    /// `customer`, regardless of LRU order.
    ///
    /// Waits for in-flight switches to `customer` to finish first, so a
    /// switch never starts processes for a customer already drained.
    pub async fn cleanup(&self, customer: &str) -> Result<()> {
        if self.catalog.customer(customer).is_none() {
            return Err(OrchestratorError::UnknownCustomer {
                name: customer.to_string(),
            });
        }

        self.begin_drain_when_idle(customer).await;
        let result = self.drain(customer).await;
        tracing::info!(customer, "Customer cleaned up");
        result
    }

    /// Endpoints of the customer's HEALTHY integrations.
    pub fn endpoint_urls(&self, customer: &str) -> BTreeMap<IntegrationType, String> {
        self.manager
            .customer_records(customer)
            .into_iter()
            .filter(|record| record.state == LifecycleState::Healthy)
            .filter_map(|record| {
                let url = record.endpoint_url()?.to_string();
                Some((record.integration, url))
            })
            .collect()
    }

    /// Warm customers, most recently used first.
    pub fn active_customers(&self) -> Vec<String> {
        self.pool
            .entries()
            .into_iter()
            .map(|entry| entry.customer)
            .collect()
    }

    pub fn status(&self) -> OrchestratorStatus {
        let ports = self.manager.ports();
        OrchestratorStatus {
            max_warm: self.pool.max_warm(),
            pool: self.pool.entries(),
            records: self.manager.records(),
            ports_in_use: ports.in_use(),
            ports_available: ports.available(),
        }
    }

    /// Terminate managed processes that no record owns, e.g. leftovers of a
    /// previous run. Returns how many were removed.
    ///
    /// Skipped while any start is in flight, since a freshly launched
    /// process has no handle yet.
    pub async fn cleanup_orphans(&self) -> Result<usize> {
        let runtime = self.manager.runtime();
        let managed = runtime.list_managed().await?;

        let records = self.manager.records();
        if records
            .iter()
            .any(|record| record.state == LifecycleState::Starting)
        {
            tracing::debug!("Start in flight, skipping orphan cleanup");
            return Ok(0);
        }
        let tracked = self.manager.tracked_process_ids();

        let mut removed = 0;
        for process_id in managed.iter().filter(|id| !tracked.contains(*id)) {
            match runtime.terminate(process_id).await {
                Ok(()) => {
                    tracing::info!(process_id = %process_id, "Removed orphaned process");
                    removed += 1;
                }
                Err(e) => tracing::warn!("Could not remove orphaned process: {}", e),
            }
        }
        Ok(removed)
    }

    /// Stop everything and empty the pool.
    pub async fn shutdown(&self) -> Result<()> {
        let customers = self.pool.clear();
        tracing::info!(customers = customers.len(), "Stopping all integrations");
        let result = self.manager.stop_all().await;
        self.settled.notify_waiters();
        result
    }

    fn mark_busy(&self, customer: &str) -> BusyGuard<'_> {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        *busy.entry(customer.to_string()).or_insert(0) += 1;
        BusyGuard {
            coordinator: self,
            customer: customer.to_string(),
        }
    }

    /// Move `customer` to draining once no switch to it is in flight.
    ///
    /// The busy check and the pool update happen under the busy lock; a
    /// switch marks itself busy before touching the pool, so it either
    /// holds off this drain or finds the customer draining.
    async fn begin_drain_when_idle(&self, customer: &str) {
        loop {
            let settled = self.settled.notified();
            {
                let busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
                if !busy.contains_key(customer) {
                    self.pool.begin_drain(customer);
                    return;
                }
            }
            tracing::debug!(customer, "Waiting for switch to finish before cleanup");
            settled.await;
        }
    }

    fn busy_customers(&self) -> HashSet<String> {
        let busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        busy.keys().cloned().collect()
    }

    /// Touch the pool, waiting while it is saturated or while `customer`
    /// is still draining. Returns the evicted customer, if any.
    async fn claim_pool_slot(&self, customer: &str) -> Option<String> {
        loop {
            // Registered before the check so a wakeup in between is not lost.
            let settled = self.settled.notified();

            let mut busy = self.busy_customers();
            busy.remove(customer);
            match self.pool.touch(customer, &busy) {
                Admission::Resident | Admission::Admitted => return None,
                Admission::Evicted(victim) => return Some(victim),
                Admission::Saturated => {
                    tracing::info!(
                        customer,
                        max_warm = self.pool.max_warm(),
                        "Warm pool saturated, waiting for a switch to finish"
                    );
                    settled.await;
                }
                Admission::Draining => {
                    tracing::debug!(customer, "Waiting for previous eviction to finish");
                    settled.await;
                }
            }
        }
    }

    async fn evict(&self, victim: &str) {
        match self.drain(victim).await {
            Ok(()) => tracing::info!(customer = victim, "Evicted customer"),
            Err(e) => tracing::warn!(customer = victim, "Eviction stop failed: {}", e),
        }
    }

    /// Stop every process of a draining customer, then report the drain to
    /// the pool. Runs on its own task so the pool always settles.
    async fn drain(&self, customer: &str) -> Result<()> {
        let manager = self.manager.clone();
        let pool = Arc::clone(&self.pool);
        let settled = Arc::clone(&self.settled);
        let name = customer.to_string();

        tokio::spawn(async move {
            let result = manager.stop_customer(&name).await;
            pool.finish_drain(&name);
            settled.notify_waiters();
            result
        })
        .await
        .unwrap_or_else(|e| {
            Err(OrchestratorError::TerminateFailed {
                process_id: customer.to_string(),
                reason: format!("drain task aborted: {}", e),
            })
        })
    }
}

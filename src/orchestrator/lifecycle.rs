//! Per-key lifecycle of integration processes.
//!
//! Every (customer, integration) key owns a slot: an operation lock that
//! serializes start/stop on that key, and a watch channel carrying the
//! current [`LifecycleRecord`] so status reads never wait on the lock.
//! The slot table itself sits behind one short-lived mutex used only for
//! insert, lookup and delete.
//!
//! Start and stop run on spawned tasks that own the slot's lock, so a
//! caller that goes away never leaves a key half-started.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{HealthSettings, HealthSettingsTable};
use crate::integration::IntegrationType;
use crate::orchestrator::error::{OrchestratorError, Result};
use crate::orchestrator::health::{HealthChecker, assess};
use crate::orchestrator::ports::PortAllocator;
use crate::orchestrator::runtime::ProcessRuntime;
use crate::orchestrator::spec::{ProcessSpec, ProcessSpecBuilder};
use crate::orchestrator::state::{LifecycleRecord, LifecycleState, ProcessHandle, RecordKey};

/// State guarded by the per-key operation lock.
#[derive(Default)]
struct SlotGuard {
    /// Slot was removed from the table; callers must look up a fresh one.
    retired: bool,
    monitor: Option<JoinHandle<()>>,
}

struct Slot {
    op: Arc<AsyncMutex<SlotGuard>>,
    record: watch::Sender<LifecycleRecord>,
}

impl Slot {
    fn new(key: &RecordKey) -> Self {
        let (record, _) = watch::channel(LifecycleRecord::absent(key));
        Self {
            op: Arc::new(AsyncMutex::new(SlotGuard::default())),
            record,
        }
    }

    fn snapshot(&self) -> LifecycleRecord {
        self.record.borrow().clone()
    }
}

struct Inner {
    builder: ProcessSpecBuilder,
    ports: Arc<PortAllocator>,
    runtime: Arc<dyn ProcessRuntime>,
    checker: HealthChecker,
    health: HealthSettingsTable,
    launch_timeout: Duration,
    slots: Mutex<HashMap<RecordKey, Arc<Slot>>>,
}

/// Owns every lifecycle record and drives its transitions.
#[derive(Clone)]
pub struct ContainerLifecycleManager {
    inner: Arc<Inner>,
}

impl ContainerLifecycleManager {
    pub fn new(
        builder: ProcessSpecBuilder,
        ports: Arc<PortAllocator>,
        runtime: Arc<dyn ProcessRuntime>,
        checker: HealthChecker,
        health: HealthSettingsTable,
        launch_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                builder,
                ports,
                runtime,
                checker,
                health,
                launch_timeout,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.inner.ports
    }

    pub fn runtime(&self) -> &Arc<dyn ProcessRuntime> {
        &self.inner.runtime
    }

    /// Bring a key to HEALTHY.
    ///
    /// A resident record is returned as is. Concurrent callers on the same
    /// key share one launch: whoever queued behind an in-flight attempt gets
    /// that attempt's outcome.
    pub async fn start(&self, customer: &str, ty: IntegrationType) -> Result<LifecycleRecord> {
        // Configuration errors never touch the record.
        self.inner.builder.params(customer, ty)?;

        let key = RecordKey::new(customer, ty);
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        tokio::spawn(async move { inner.start_key(task_key).await })
            .await
            .unwrap_or_else(|e| {
                Err(OrchestratorError::StartAttemptFailed {
                    customer: key.customer,
                    integration: key.integration,
                    reason: format!("start task aborted: {}", e),
                })
            })
    }

    /// Terminate the process, release its port and delete the record.
    ///
    /// No-op on an absent key. A failed record is discarded.
    pub async fn stop(&self, customer: &str, ty: IntegrationType) -> Result<()> {
        let key = RecordKey::new(customer, ty);
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        tokio::spawn(async move { inner.stop_key(task_key).await })
            .await
            .unwrap_or_else(|e| {
                Err(OrchestratorError::TerminateFailed {
                    process_id: key.to_string(),
                    reason: format!("stop task aborted: {}", e),
                })
            })
    }

    /// Current state; never waits on an in-flight operation.
    pub fn status(&self, customer: &str, ty: IntegrationType) -> LifecycleState {
        self.inner
            .slot(&RecordKey::new(customer, ty))
            .map(|slot| slot.record.borrow().state)
            .unwrap_or(LifecycleState::Absent)
    }

    pub fn record(&self, customer: &str, ty: IntegrationType) -> Option<LifecycleRecord> {
        self.inner
            .slot(&RecordKey::new(customer, ty))
            .map(|slot| slot.snapshot())
            .filter(|record| record.state != LifecycleState::Absent)
    }

    /// Follow a key's record as it changes.
    pub fn subscribe(
        &self,
        customer: &str,
        ty: IntegrationType,
    ) -> Option<watch::Receiver<LifecycleRecord>> {
        self.inner
            .slot(&RecordKey::new(customer, ty))
            .map(|slot| slot.record.subscribe())
    }

    /// Every record that is not ABSENT, ordered by key.
    pub fn records(&self) -> Vec<LifecycleRecord> {
        let mut records: Vec<_> = self
            .inner
            .all_slots()
            .into_iter()
            .map(|(_, slot)| slot.snapshot())
            .filter(|record| record.state != LifecycleState::Absent)
            .collect();
        records.sort_by(|a, b| {
            (a.customer.as_str(), a.integration).cmp(&(b.customer.as_str(), b.integration))
        });
        records
    }

    pub fn customer_records(&self, customer: &str) -> Vec<LifecycleRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.customer == customer)
            .collect()
    }

    /// Customers with at least one non-ABSENT record.
    pub fn resident_customers(&self) -> BTreeSet<String> {
        self.records()
            .into_iter()
            .map(|record| record.customer)
            .collect()
    }

    /// Process ids of every tracked process.
    pub fn tracked_process_ids(&self) -> HashSet<String> {
        self.records()
            .into_iter()
            .filter_map(|record| record.handle.map(|h| h.process_id))
            .collect()
    }

    /// Stop every record of `customer` concurrently.
    ///
    /// Failures are logged; the first one is returned after all stops finish.
    pub async fn stop_customer(&self, customer: &str) -> Result<()> {
        let keys: Vec<_> = self
            .inner
            .all_slots()
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.customer == customer)
            .collect();
        self.stop_keys(keys).await
    }

    /// Stop every record concurrently.
    pub async fn stop_all(&self) -> Result<()> {
        let keys = self
            .inner
            .all_slots()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        self.stop_keys(keys).await
    }

    async fn stop_keys(&self, keys: Vec<RecordKey>) -> Result<()> {
        let results = join_all(
            keys.iter()
                .map(|key| self.stop(&key.customer, key.integration)),
        )
        .await;

        let mut first_error = None;
        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(key = %key, "Stop failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Inner {
    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<RecordKey, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, key: &RecordKey) -> Option<Arc<Slot>> {
        self.table().get(key).cloned()
    }

    fn slot_or_insert(&self, key: &RecordKey) -> Arc<Slot> {
        Arc::clone(
            self.table()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new(key))),
        )
    }

    fn all_slots(&self) -> Vec<(RecordKey, Arc<Slot>)> {
        self.table()
            .iter()
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Remove the slot for `key` if it is still `slot`.
    fn remove_slot(&self, key: &RecordKey, slot: &Arc<Slot>) {
        let mut table = self.table();
        if table.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            table.remove(key);
        }
    }

    async fn start_key(&self, key: RecordKey) -> Result<LifecycleRecord> {
        loop {
            let slot = self.slot_or_insert(&key);
            let seen = slot.snapshot();
            let mut guard = Arc::clone(&slot.op).lock_owned().await;
            if guard.retired {
                continue;
            }

            let current = slot.snapshot();
            // Queued behind another caller's attempt: share its outcome.
            if seen.state == LifecycleState::Starting || current.attempts != seen.attempts {
                return match current.state {
                    LifecycleState::Healthy | LifecycleState::Unhealthy => Ok(current),
                    LifecycleState::Failed => Err(OrchestratorError::StartAttemptFailed {
                        customer: key.customer.clone(),
                        integration: key.integration,
                        reason: current
                            .last_error
                            .unwrap_or_else(|| "unknown error".to_string()),
                    }),
                    _ => continue,
                };
            }

            match current.state {
                LifecycleState::Healthy | LifecycleState::Unhealthy => return Ok(current),
                LifecycleState::Absent | LifecycleState::Failed => {}
                other => {
                    return Err(OrchestratorError::InvalidTransition {
                        from: other,
                        to: LifecycleState::Starting,
                    });
                }
            }

            let mut record = current;
            record.advance(LifecycleState::Starting)?;
            record.attempts += 1;
            record.handle = None;
            record.last_error = None;
            record.consecutive_failures = 0;
            slot.record.send_replace(record.clone());
            tracing::info!(
                customer = %key.customer,
                integration = %key.integration,
                attempt = record.attempts,
                runtime = self.runtime.name(),
                "Starting integration"
            );

            let settings = self.health.for_integration(key.integration);
            return match self.launch(&key, &settings).await {
                Ok((handle, health_url)) => {
                    record.advance(LifecycleState::Healthy)?;
                    record.last_health_check = Some(Utc::now());
                    let port = handle.port;
                    record.handle = Some(handle);
                    slot.record.send_replace(record.clone());

                    guard.monitor = Some(spawn_monitor(
                        Arc::downgrade(&slot),
                        self.checker.clone(),
                        settings,
                        health_url,
                        record.attempts,
                    ));
                    tracing::info!(
                        customer = %key.customer,
                        integration = %key.integration,
                        port,
                        "Integration healthy"
                    );
                    Ok(record)
                }
                Err(e) => {
                    record.advance(LifecycleState::Failed)?;
                    record.last_error = Some(e.to_string());
                    slot.record.send_replace(record);
                    tracing::warn!(
                        customer = %key.customer,
                        integration = %key.integration,
                        "Integration failed to start: {}",
                        e
                    );
                    Err(e)
                }
            };
        }
    }

    /// Allocate, build, launch and wait for the first healthy probe.
    ///
    /// On any failure the port is back in the free set before returning.
    async fn launch(
        &self,
        key: &RecordKey,
        settings: &HealthSettings,
    ) -> Result<(ProcessHandle, String)> {
        let port = self.ports.allocate()?;

        let spec = match self.builder.build(&key.customer, key.integration, port) {
            Ok(spec) => spec,
            Err(e) => {
                self.ports.release(port);
                return Err(e);
            }
        };

        let process_id =
            match tokio::time::timeout(self.launch_timeout, self.runtime.launch(&spec)).await {
                Ok(Ok(id)) => id,
                Ok(Err(e)) => {
                    self.ports.release(port);
                    return Err(e);
                }
                Err(_) => {
                    // The runtime may still bring it up; it is known by name only.
                    self.discard(&spec, &spec.name).await;
                    return Err(OrchestratorError::LaunchTimeout {
                        name: spec.name.clone(),
                        timeout: self.launch_timeout,
                    });
                }
            };

        if let Err(e) = self
            .checker
            .wait_until_healthy(&spec.name, &spec.health_url, settings)
            .await
        {
            self.discard(&spec, &process_id).await;
            return Err(e);
        }

        let handle = ProcessHandle {
            customer: key.customer.clone(),
            integration: key.integration,
            port,
            process_id,
            endpoint_url: spec.endpoint_url.clone(),
            launched_at: Utc::now(),
        };
        Ok((handle, spec.health_url))
    }

    /// Best-effort teardown of a process that never became healthy.
    async fn discard(&self, spec: &ProcessSpec, process_id: &str) {
        if let Err(e) = self.runtime.terminate(process_id).await {
            tracing::warn!(
                name = %spec.name,
                "Could not remove process after failed start: {}",
                e
            );
        }
        self.ports.release(spec.port);
    }

    async fn stop_key(&self, key: RecordKey) -> Result<()> {
        loop {
            let Some(slot) = self.slot(&key) else {
                return Ok(());
            };
            let mut guard = Arc::clone(&slot.op).lock_owned().await;
            if guard.retired {
                continue;
            }

            let current = slot.snapshot();
            let result = match current.state {
                LifecycleState::Absent | LifecycleState::Failed => Ok(()),
                LifecycleState::Healthy | LifecycleState::Unhealthy => {
                    if let Some(monitor) = guard.monitor.take() {
                        monitor.abort();
                    }
                    self.terminate_resident(&key, &slot).await
                }
                other => Err(OrchestratorError::InvalidTransition {
                    from: other,
                    to: LifecycleState::Stopping,
                }),
            };
            if let Err(OrchestratorError::InvalidTransition { .. }) = result {
                return result;
            }

            guard.retired = true;
            self.remove_slot(&key, &slot);
            return result;
        }
    }

    /// HEALTHY/UNHEALTHY -> STOPPING -> ABSENT.
    ///
    /// The record is deleted even when terminate fails; the port is then
    /// withheld since the process may still hold it.
    async fn terminate_resident(&self, key: &RecordKey, slot: &Slot) -> Result<()> {
        let mut transition = Ok(());
        slot.record.send_modify(|record| {
            transition = record.advance(LifecycleState::Stopping);
        });
        transition?;

        let handle = slot.snapshot().handle;
        let terminated = match &handle {
            Some(handle) => self.runtime.terminate(&handle.process_id).await,
            None => Ok(()),
        };

        match (&terminated, &handle) {
            (Ok(()), Some(handle)) => self.ports.release(handle.port),
            (Err(e), Some(handle)) => tracing::error!(
                key = %key,
                port = handle.port,
                "Terminate failed, withholding port: {}",
                e
            ),
            _ => {}
        }

        slot.record.send_modify(|record| {
            // STOPPING -> ABSENT is always a legal edge.
            let _ = record.advance(LifecycleState::Absent);
            record.handle = None;
            record.consecutive_failures = 0;
        });
        tracing::info!(key = %key, "Integration stopped");
        terminated
    }
}

/// Poll a resident record's health until the record goes away.
///
/// The task holds only a weak reference; once the slot is dropped, or
/// another start attempt replaced the record, it exits on its next tick.
fn spawn_monitor(
    slot: Weak<Slot>,
    checker: HealthChecker,
    settings: HealthSettings,
    health_url: String,
    attempt: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately and the startup probe just passed.
        interval.tick().await;

        loop {
            interval.tick().await;

            let outcome = checker.check(&health_url, &settings).await;

            let Some(slot) = slot.upgrade() else {
                return;
            };

            let mut finished = false;
            let mut change = None;
            slot.record.send_if_modified(|record| {
                if record.attempts != attempt || !record.state.is_resident() {
                    finished = true;
                    return false;
                }

                let before = record.state;
                let verdict = assess(before, record.consecutive_failures, &outcome, &settings);
                if verdict.state != before && record.advance(verdict.state).is_err() {
                    finished = true;
                    return false;
                }
                record.consecutive_failures = verdict.consecutive_failures;
                record.last_health_check = Some(Utc::now());
                change = Some((before, verdict));
                true
            });
            if finished {
                return;
            }

            let record = slot.snapshot();
            if let Some((before, verdict)) = change {
                if verdict.state != before {
                    match verdict.state {
                        LifecycleState::Unhealthy => tracing::warn!(
                            customer = %record.customer,
                            integration = %record.integration,
                            failures = verdict.consecutive_failures,
                            "Integration unhealthy"
                        ),
                        _ => tracing::info!(
                            customer = %record.customer,
                            integration = %record.integration,
                            "Integration recovered"
                        ),
                    }
                }
                if verdict.escalate {
                    tracing::error!(
                        customer = %record.customer,
                        integration = %record.integration,
                        failures = verdict.consecutive_failures,
                        "Integration still failing health checks, needs operator attention"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::TestHarnessBuilder;

    #[tokio::test]
    async fn test_start_then_stop_releases_port() {
        let harness = TestHarnessBuilder::new().build();
        let manager = &harness.manager;

        let record = manager.start("acme", IntegrationType::Metrics).await.unwrap();
        assert_eq!(record.state, LifecycleState::Healthy);
        let port = record.handle.as_ref().unwrap().port;
        assert!(manager.ports().is_allocated(port));
        assert_eq!(
            record.endpoint_url(),
            Some(format!("http://127.0.0.1:{}/mcp", port).as_str())
        );

        manager.stop("acme", IntegrationType::Metrics).await.unwrap();
        assert_eq!(
            manager.status("acme", IntegrationType::Metrics),
            LifecycleState::Absent
        );
        assert!(!manager.ports().is_allocated(port));
        assert!(manager.records().is_empty());
        assert_eq!(harness.runtime.terminations(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let harness = TestHarnessBuilder::new().build();
        let manager = &harness.manager;

        let first = manager.start("acme", IntegrationType::Metrics).await.unwrap();
        let second = manager.start("acme", IntegrationType::Metrics).await.unwrap();

        assert_eq!(first.handle, second.handle);
        assert_eq!(harness.runtime.launches(IntegrationType::Metrics), 1);
    }

    #[tokio::test]
    async fn test_stop_absent_is_noop() {
        let harness = TestHarnessBuilder::new().build();
        harness
            .manager
            .stop("acme", IntegrationType::Alerting)
            .await
            .unwrap();
        assert_eq!(harness.runtime.terminations(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_starts_launch_once() {
        let harness = TestHarnessBuilder::new()
            .with_launch_delay(Duration::from_millis(50))
            .build();

        let starts = (0..8).map(|_| harness.manager.start("acme", IntegrationType::Telephony));
        let results = join_all(starts).await;

        assert_eq!(harness.runtime.launches(IntegrationType::Telephony), 1);
        let handles: HashSet<_> = results
            .into_iter()
            .map(|r| r.unwrap().handle.unwrap().process_id)
            .collect();
        assert_eq!(handles.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_failure() {
        let harness = TestHarnessBuilder::new()
            .with_launch_delay(Duration::from_millis(50))
            .build();
        harness
            .runtime
            .set_launch_failing(IntegrationType::Telephony, true);

        let results = join_all(
            (0..4).map(|_| harness.manager.start("acme", IntegrationType::Telephony)),
        )
        .await;

        assert_eq!(harness.runtime.launches(IntegrationType::Telephony), 1);
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(harness.manager.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn test_unknown_integration_leaves_no_record() {
        let harness = TestHarnessBuilder::new().build();

        let err = harness
            .manager
            .start("globex", IntegrationType::Telephony)
            .await
            .unwrap_err();
        assert!(err.is_config_error());
        assert!(harness.manager.records().is_empty());
        assert_eq!(harness.runtime.total_launches(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_marks_failed_and_frees_port() {
        let harness = TestHarnessBuilder::new().build();
        harness
            .runtime
            .set_launch_failing(IntegrationType::Alerting, true);

        let err = harness
            .manager
            .start("acme", IntegrationType::Alerting)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::LaunchFailed { .. }));

        let record = harness
            .manager
            .record("acme", IntegrationType::Alerting)
            .unwrap();
        assert_eq!(record.state, LifecycleState::Failed);
        assert!(record.last_error.is_some());
        assert!(record.handle.is_none());
        assert_eq!(harness.manager.ports().in_use(), 0);

        // FAILED -> STARTING on retry
        harness
            .runtime
            .set_launch_failing(IntegrationType::Alerting, false);
        let record = harness
            .manager
            .start("acme", IntegrationType::Alerting)
            .await
            .unwrap();
        assert_eq!(record.state, LifecycleState::Healthy);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn test_health_timeout_terminates_and_frees_port() {
        let harness = TestHarnessBuilder::new().build();
        harness.probe.set_unhealthy(IntegrationType::Telephony, true);

        let err = harness
            .manager
            .start("acme", IntegrationType::Telephony)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::HealthCheckFailed { .. }));
        assert_eq!(
            harness.manager.status("acme", IntegrationType::Telephony),
            LifecycleState::Failed
        );
        assert_eq!(harness.manager.ports().in_use(), 0);
        assert_eq!(harness.runtime.running().len(), 0);

        // Discarding a failed record does not touch the runtime again.
        let terminations = harness.runtime.terminations();
        harness
            .manager
            .stop("acme", IntegrationType::Telephony)
            .await
            .unwrap();
        assert_eq!(harness.runtime.terminations(), terminations);
        assert!(harness.manager.record("acme", IntegrationType::Telephony).is_none());
    }

    #[tokio::test]
    async fn test_launch_timeout() {
        let harness = TestHarnessBuilder::new()
            .with_launch_delay(Duration::from_millis(500))
            .with_launch_timeout(Duration::from_millis(20))
            .build();

        let err = harness
            .manager
            .start("acme", IntegrationType::Metrics)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::LaunchTimeout { .. }));
        assert_eq!(harness.manager.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn test_ports_exhausted_is_reported() {
        let harness = TestHarnessBuilder::new().with_port_range(9100, 9100).build();

        harness
            .manager
            .start("acme", IntegrationType::Metrics)
            .await
            .unwrap();
        let err = harness
            .manager
            .start("acme", IntegrationType::Alerting)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::PortsExhausted { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_health_flap_keeps_record_and_port() {
        let harness = TestHarnessBuilder::new().build();
        let manager = &harness.manager;

        let record = manager.start("acme", IntegrationType::Metrics).await.unwrap();
        let port = record.handle.unwrap().port;
        let mut rx = manager.subscribe("acme", IntegrationType::Metrics).unwrap();

        harness.probe.set_unhealthy(IntegrationType::Metrics, true);
        let unhealthy = rx
            .wait_for(|r| r.state == LifecycleState::Unhealthy)
            .await
            .unwrap()
            .clone();
        assert!(unhealthy.consecutive_failures >= 3);
        assert!(manager.ports().is_allocated(port));
        assert!(manager.record("acme", IntegrationType::Metrics).is_some());

        // Resident unhealthy record is returned without relaunch.
        let again = manager.start("acme", IntegrationType::Metrics).await.unwrap();
        assert_eq!(again.handle.unwrap().port, port);
        assert_eq!(harness.runtime.launches(IntegrationType::Metrics), 1);

        harness.probe.set_unhealthy(IntegrationType::Metrics, false);
        rx.wait_for(|r| r.state == LifecycleState::Healthy)
            .await
            .unwrap();
        assert_eq!(manager.status("acme", IntegrationType::Metrics), LifecycleState::Healthy);
    }

    #[tokio::test]
    async fn test_terminate_failure_withholds_port() {
        let harness = TestHarnessBuilder::new().build();
        let record = harness
            .manager
            .start("acme", IntegrationType::Metrics)
            .await
            .unwrap();
        let port = record.handle.unwrap().port;

        harness.runtime.set_terminate_failing(true);
        let err = harness
            .manager
            .stop("acme", IntegrationType::Metrics)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TerminateFailed { .. }));
        assert_eq!(
            harness.manager.status("acme", IntegrationType::Metrics),
            LifecycleState::Absent
        );
        assert!(harness.manager.ports().is_allocated(port));
    }

    #[tokio::test]
    async fn test_stop_all() {
        let harness = TestHarnessBuilder::new().build();
        for ty in [IntegrationType::Metrics, IntegrationType::Alerting] {
            harness.manager.start("acme", ty).await.unwrap();
        }
        harness
            .manager
            .start("globex", IntegrationType::Metrics)
            .await
            .unwrap();
        assert_eq!(harness.manager.resident_customers().len(), 2);

        harness.manager.stop_all().await.unwrap();
        assert!(harness.manager.records().is_empty());
        assert_eq!(harness.manager.ports().in_use(), 0);
        assert_eq!(harness.runtime.running().len(), 0);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_start() {
        let harness = TestHarnessBuilder::new()
            .with_launch_delay(Duration::from_millis(100))
            .build();
        let manager = harness.manager.clone();

        let start = tokio::spawn({
            let manager = manager.clone();
            async move { manager.start("globex", IntegrationType::Metrics).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            manager.status("globex", IntegrationType::Metrics),
            LifecycleState::Starting
        );

        manager.stop_customer("globex").await.unwrap();

        // the start settled first, then the stop tore it down
        let record = start.await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Healthy);
        let port = record.handle.as_ref().unwrap().port;
        assert_eq!(
            manager.status("globex", IntegrationType::Metrics),
            LifecycleState::Absent
        );
        assert!(!manager.ports().is_allocated(port));
        assert_eq!(harness.runtime.terminations(), 1);
        assert!(harness.runtime.running().is_empty());
    }
}

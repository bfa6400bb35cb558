//! Post-startup health monitoring, observed through the coordinator.
//!
//! A failing probe marks an integration UNHEALTHY but never tears it down;
//! recovery flips it back without a relaunch.

use std::time::Duration;

use pretty_assertions::assert_eq;

use toolfleet::config::HealthSettings;
use toolfleet::integration::IntegrationType;
use toolfleet::orchestrator::{LifecycleRecord, LifecycleState};
use toolfleet::testing::{TestHarness, TestHarnessBuilder, fast_health_settings};

async fn wait_for_state(
    harness: &TestHarness,
    customer: &str,
    ty: IntegrationType,
    state: LifecycleState,
) -> LifecycleRecord {
    let mut rx = harness
        .manager
        .subscribe(customer, ty)
        .expect("record should exist");
    let record = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|r| r.state == state))
        .await
        .expect("state change timed out")
        .expect("record dropped")
        .clone();
    record
}

#[tokio::test]
async fn test_flap_keeps_process_and_port() {
    let harness = TestHarnessBuilder::new().build();
    harness.coordinator.switch_to("acme").await.unwrap();
    let before = harness
        .manager
        .record("acme", IntegrationType::Metrics)
        .unwrap();
    let port = before.handle.as_ref().unwrap().port;

    harness.probe.set_unhealthy(IntegrationType::Metrics, true);
    let unhealthy = wait_for_state(
        &harness,
        "acme",
        IntegrationType::Metrics,
        LifecycleState::Unhealthy,
    )
    .await;

    assert!(unhealthy.consecutive_failures >= 3);
    assert!(harness.manager.ports().is_allocated(port));
    assert!(harness.runtime.process_on_port(port).is_some());
    assert_eq!(harness.runtime.terminations(), 0);
    // unhealthy integrations are not offered as endpoints
    let urls = harness.coordinator.endpoint_urls("acme");
    assert!(!urls.contains_key(&IntegrationType::Metrics));
    assert!(urls.contains_key(&IntegrationType::Alerting));

    harness.probe.set_unhealthy(IntegrationType::Metrics, false);
    let recovered = wait_for_state(
        &harness,
        "acme",
        IntegrationType::Metrics,
        LifecycleState::Healthy,
    )
    .await;

    assert_eq!(recovered.consecutive_failures, 0);
    assert_eq!(recovered.handle, before.handle);
    assert_eq!(harness.runtime.launches(IntegrationType::Metrics), 1);
}

#[tokio::test]
async fn test_switch_to_unhealthy_customer_reports_it() {
    let harness = TestHarnessBuilder::new().build();
    harness.coordinator.switch_to("globex").await.unwrap();

    harness.probe.set_unhealthy(IntegrationType::Metrics, true);
    wait_for_state(
        &harness,
        "globex",
        IntegrationType::Metrics,
        LifecycleState::Unhealthy,
    )
    .await;

    let report = harness.coordinator.switch_to("globex").await.unwrap();
    let outcome = report.get(IntegrationType::Metrics).unwrap();
    assert_eq!(outcome.state, LifecycleState::Unhealthy);
    assert!(!outcome.healthy);
    assert_eq!(harness.runtime.launches(IntegrationType::Metrics), 1);
}

#[tokio::test]
async fn test_escalation_does_not_tear_down() {
    let harness = TestHarnessBuilder::new()
        .with_health(HealthSettings {
            unhealthy_threshold: 1,
            escalate_after: Some(2),
            ..fast_health_settings()
        })
        .build();
    harness.coordinator.switch_to("globex").await.unwrap();

    harness.probe.set_unhealthy(IntegrationType::Metrics, true);
    let mut rx = harness
        .manager
        .subscribe("globex", IntegrationType::Metrics)
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|r| r.consecutive_failures >= 5),
    )
    .await
    .expect("failures not counted")
    .unwrap();

    assert_eq!(
        harness.manager.status("globex", IntegrationType::Metrics),
        LifecycleState::Unhealthy
    );
    assert_eq!(harness.runtime.terminations(), 0);
    assert_eq!(harness.runtime.running().len(), 1);
}

#[tokio::test]
async fn test_stop_ends_monitoring() {
    let harness = TestHarnessBuilder::new().build();
    harness.coordinator.switch_to("globex").await.unwrap();
    harness.coordinator.cleanup("globex").await.unwrap();

    let probes = harness.probe.probes();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(harness.probe.probes(), probes);
    assert_eq!(
        harness.manager.status("globex", IntegrationType::Metrics),
        LifecycleState::Absent
    );
}

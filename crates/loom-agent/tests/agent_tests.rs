//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provisioner coordination and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::anyhow;
use axum::http::Method;
use loom_agent::{
    AgentError, AgentSignal, DeleteOutcome, ProvisionerAgent, ServingActivity, ShutdownState,
};

use common::{
    agent_state, eventually, fast_settings, idle_api, identity, FakeControlPlane, FakeTenant,
};

#[tokio::test(flavor = "multi_thread")]
async fn idle_tenant_appears_in_snapshot() {
    let state = agent_state();
    let (tenant, _) = FakeTenant::new("t1", 0);
    state.add_or_update(tenant).unwrap();

    let snapshot = state.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.get("t1"), Some(0));
}

#[tokio::test(flavor = "multi_thread")]
async fn busy_tenant_stays_registered_until_reaped() {
    let state = agent_state();
    let (tenant, probe) = FakeTenant::new("t1", 0);
    state.add_or_update(tenant).unwrap();
    probe.set_workers(3);

    assert_eq!(state.delete("t1").unwrap(), DeleteOutcome::Terminating);
    assert!(state.contains("t1"));
    assert_eq!(state.snapshot().get("t1"), Some(3));
    assert_eq!(state.terminating_ids(), vec!["t1".to_string()]);

    assert!(state.verify().is_empty());
    probe.set_workers(0);
    assert_eq!(state.verify(), vec!["t1".to_string()]);
    assert!(!state.contains("t1"));
    assert!(!state.is_terminating("t1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_delete_never_enters_terminating_set() {
    let state = agent_state();
    let (tenant, probe) = FakeTenant::new("t1", 0);
    state.add_or_update(tenant).unwrap();

    assert_eq!(state.delete("t1").unwrap(), DeleteOutcome::Removed);
    assert!(!state.contains("t1"));
    assert!(state.terminating_ids().is_empty());
    assert_eq!(probe.deletes(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn reapplying_same_id_edits_in_place() {
    let state = agent_state();
    let (first, probe) = FakeTenant::new("t1", 1);
    state.add_or_update(first).unwrap();
    let (second, _) = FakeTenant::new("t1", 4);
    state.add_or_update(second).unwrap();

    assert_eq!(state.tenant_count(), 1);
    assert_eq!(probe.updates(), 1);
    assert_eq!(state.snapshot().get("t1"), Some(4));
}

#[tokio::test(flavor = "multi_thread")]
async fn terminate_drains_tenants_before_unregistering() {
    let plane = FakeControlPlane::start().await;
    let state = agent_state();
    let (idle, idle_probe) = FakeTenant::new("idle", 0);
    let (busy, busy_probe) = FakeTenant::new("busy", 3);
    state.add_or_update(idle).unwrap();
    state.add_or_update(busy).unwrap();

    let settings = fast_settings();
    let agent = ProvisionerAgent::new(
        Arc::clone(&state),
        Arc::new(plane.client(&identity())),
        &settings,
    )
    .without_os_signals();
    let signals = agent.signals();
    let running = tokio::spawn(agent.run(idle_api));

    assert!(eventually(|| !plane.calls_with(Method::PUT).is_empty()).await);
    assert!(signals.send(AgentSignal::Terminate));

    assert!(eventually(|| busy_probe.deletes() == 1).await);
    assert_eq!(state.shutdown_state(), ShutdownState::ShuttingDown);
    assert_eq!(idle_probe.deletes(), 1);
    assert!(matches!(
        state.add_or_update(FakeTenant::new("late", 0).0),
        Err(AgentError::NotRunning(ShutdownState::ShuttingDown))
    ));
    assert!(plane.calls_with(Method::DELETE).is_empty());

    // A second request while shutting down changes nothing.
    assert!(signals.send(AgentSignal::Interrupt));
    busy_probe.set_workers(0);

    let report = running.await.unwrap().unwrap();
    assert_eq!(report.tenants_drained, 2);
    assert!(!report.reap_timed_out);
    assert!(report.unregistered);
    assert_eq!(busy_probe.deletes(), 1);
    assert_eq!(idle_probe.deletes(), 1);
    assert_eq!(state.shutdown_state(), ShutdownState::Terminated);

    let unregistrations = plane.calls_with(Method::DELETE);
    assert_eq!(unregistrations.len(), 1);
    assert_eq!(unregistrations[0].path, "/v1/provisioners/test-host.4242");
    assert_eq!(unregistrations[0].user.as_deref(), Some("admin"));
}

#[tokio::test(flavor = "multi_thread")]
async fn child_exit_signal_purges_reaped_tenants() {
    let plane = FakeControlPlane::start().await;
    let state = agent_state();
    let (tenant, probe) = FakeTenant::new("t1", 2);
    state.add_or_update(tenant).unwrap();
    state.delete("t1").unwrap();

    let agent = ProvisionerAgent::new(
        Arc::clone(&state),
        Arc::new(plane.client(&identity())),
        &fast_settings(),
    )
    .without_os_signals();
    let signals = agent.signals();
    let running = tokio::spawn(agent.run(idle_api));

    probe.set_workers(0);
    assert!(signals.send(AgentSignal::ChildExited));
    assert!(eventually(|| !state.contains("t1")).await);
    assert_eq!(state.shutdown_state(), ShutdownState::Running);

    signals.send(AgentSignal::Terminate);
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.tenants_drained, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn api_startup_failure_is_fatal() {
    let plane = FakeControlPlane::start().await;
    let agent = ProvisionerAgent::new(
        agent_state(),
        Arc::new(plane.client(&identity())),
        &fast_settings(),
    )
    .without_os_signals();

    let err = agent
        .run(|_| Err(anyhow!("address in use")))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("address in use"));
    assert!(plane.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn api_exiting_before_ready_is_fatal() {
    let plane = FakeControlPlane::start().await;
    let agent = ProvisionerAgent::new(
        agent_state(),
        Arc::new(plane.client(&identity())),
        &fast_settings(),
    )
    .without_os_signals();

    let err = agent
        .run(|_| {
            let task = tokio::spawn(async { Err::<(), _>(anyhow!("listener closed")) });
            Ok(ServingActivity::new(Arc::new(AtomicBool::new(false)), task))
        })
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("listener closed"));
}

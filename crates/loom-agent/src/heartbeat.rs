//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control plane registration and heartbeat transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::control_plane::{ControlPlaneClient, ControlPlaneError, HeartbeatPayload};
use crate::state::AgentState;
use crate::tenant::TenantManager;

/// Shortest period the heartbeat loop will tick at.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a single heartbeat attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Delivered,
    /// Control plane answered 404; registration was re-issued instead.
    Reregistered,
    Rejected(StatusCode),
    TransportFailed,
}

impl HeartbeatOutcome {
    fn label(&self) -> &'static str {
        match self {
            HeartbeatOutcome::Delivered => "ok",
            HeartbeatOutcome::Reregistered => "not_found",
            HeartbeatOutcome::Rejected(_) => "rejected",
            HeartbeatOutcome::TransportFailed => "transport_error",
        }
    }
}

/// Periodic usage reporter. Registers once up front, then sends one
/// heartbeat per interval; no failure is ever fatal.
#[derive(Debug)]
pub struct HeartbeatService<M> {
    state: Arc<AgentState<M>>,
    client: Arc<ControlPlaneClient>,
    interval: Duration,
}

impl<M: TenantManager> HeartbeatService<M> {
    pub fn new(
        state: Arc<AgentState<M>>,
        client: Arc<ControlPlaneClient>,
        interval: Duration,
    ) -> Self {
        if interval < MIN_HEARTBEAT_INTERVAL {
            warn!(
                requested_ms = interval.as_millis() as u64,
                minimum_ms = MIN_HEARTBEAT_INTERVAL.as_millis() as u64,
                "heartbeat interval too short; using the minimum"
            );
        }
        Self {
            state,
            client,
            interval: interval.max(MIN_HEARTBEAT_INTERVAL),
        }
    }

    /// Run until the owning task is cancelled.
    pub async fn run(self) {
        info!(interval_ms = self.interval.as_millis() as u64, "starting heartbeat loop");
        self.client.register_best_effort().await;

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.beat().await;
        }
    }

    /// Send one heartbeat built from the current registry snapshot.
    pub async fn beat(&self) -> HeartbeatOutcome {
        let payload = HeartbeatPayload::from(self.state.snapshot());
        let uri = self.client.heartbeat_url();
        debug!(%uri, tenants = payload.usage.len(), "sending heartbeat");

        let outcome = match self.client.heartbeat(&payload).await {
            Ok(()) => {
                debug!("successfully sent heartbeat");
                HeartbeatOutcome::Delivered
            }
            Err(ControlPlaneError::NotFound) => {
                warn!(%uri, "heartbeat returned 404; re-registering provisioner");
                self.client.register_best_effort().await;
                HeartbeatOutcome::Reregistered
            }
            Err(ControlPlaneError::Rejected { status, body }) => {
                warn!(%uri, %status, %body, "heartbeat rejected by control plane");
                HeartbeatOutcome::Rejected(status)
            }
            Err(err) => {
                error!(%uri, error = %err, "failed to send heartbeat");
                HeartbeatOutcome::TransportFailed
            }
        };
        if let Some(metrics) = self.state.metrics() {
            metrics.record_heartbeat(outcome.label());
        }
        outcome
    }
}

//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provisioner coordination and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Signal-driven state machine moving the agent from `Running` through
//! `ShuttingDown` to `Terminated`.

use std::sync::Arc;
use std::time::Duration;

use loom_common::AgentSettings;
use serde::Serialize;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::control_plane::ControlPlaneClient;
use crate::signals::{AgentSignal, SignalQueue};
use crate::state::AgentState;
use crate::tenant::TenantManager;

/// Bounds on how long shutdown waits for workers to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl ReapPolicy {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            timeout: settings.reap_timeout,
            poll_interval: settings.reap_poll_interval,
        }
    }
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self::from_settings(&AgentSettings::default())
    }
}

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("{remaining} worker(s) still alive after waiting {waited:?}")]
    ReapTimeout { remaining: usize, waited: Duration },
}

/// Outcome of the shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub tenants_drained: usize,
    pub reap_timed_out: bool,
    pub unregistered: bool,
}

/// Consumes the signal queue and owns the one shutdown sequence.
#[derive(Debug)]
pub struct LifecycleController<M> {
    state: Arc<AgentState<M>>,
    client: Arc<ControlPlaneClient>,
    signals: SignalQueue,
    reap: ReapPolicy,
}

impl<M: TenantManager> LifecycleController<M> {
    pub fn new(
        state: Arc<AgentState<M>>,
        client: Arc<ControlPlaneClient>,
        signals: SignalQueue,
        reap: ReapPolicy,
    ) -> Self {
        Self {
            state,
            client,
            signals,
            reap,
        }
    }

    /// Process signals until the agent reaches `Terminated`.
    ///
    /// A closed queue means no further termination request can arrive, so it
    /// is treated like one.
    pub async fn run(mut self) -> ShutdownReport {
        info!(agent = %self.state.identity(), "lifecycle controller running");
        loop {
            let Some(signal) = self.signals.next().await else {
                warn!("signal queue closed; shutting down");
                return self.shutdown(None).await;
            };
            self.record(signal);
            match signal {
                AgentSignal::ChildExited => self.reap_children(),
                AgentSignal::Terminate | AgentSignal::Interrupt => {
                    if self.state.begin_shutdown() {
                        return self.shutdown(Some(signal)).await;
                    }
                    debug!(%signal, state = %self.state.shutdown_state(), "termination already in progress");
                }
            }
        }
    }

    fn reap_children(&self) {
        let purged = self.state.verify();
        if !purged.is_empty() {
            debug!(tenants = ?purged, "removed fully reaped tenants");
        }
    }

    async fn shutdown(&mut self, trigger: Option<AgentSignal>) -> ShutdownReport {
        self.state.begin_shutdown();
        match trigger {
            Some(signal) => info!(%signal, "shutting down provisioner"),
            None => info!("shutting down provisioner"),
        }

        let tenants_drained = self.state.drain();
        info!(tenants = tenants_drained, "asked tenants to stop their workers");

        let reap_timed_out = match self.wait_for_reap().await {
            Ok(waited) => {
                info!(waited_ms = waited.as_millis() as u64, "all workers reaped");
                false
            }
            Err(err) => {
                error!(error = %err, "workers did not exit in time; proceeding with unregistration");
                true
            }
        };

        let unregistered = self.client.unregister_best_effort().await;
        self.state.mark_terminated();
        ShutdownReport {
            tenants_drained,
            reap_timed_out,
            unregistered,
        }
    }

    /// Poll the registry until no worker is alive, consuming signals that
    /// arrive meanwhile.
    async fn wait_for_reap(&mut self) -> Result<Duration, ShutdownError> {
        let started = Instant::now();
        let deadline = started + self.reap.timeout;
        loop {
            self.state.verify();
            let remaining = self.state.live_workers();
            if remaining == 0 {
                return Ok(started.elapsed());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ShutdownError::ReapTimeout {
                    remaining,
                    waited: started.elapsed(),
                });
            }
            let nap = self.reap.poll_interval.min(deadline - now);
            debug!(remaining, "waiting for workers to exit");

            tokio::select! {
                received = self.signals.next() => match received {
                    Some(signal) => {
                        self.record(signal);
                        if signal.is_termination() {
                            debug!(%signal, "already shutting down; ignoring");
                        }
                    }
                    None => sleep(nap).await,
                },
                _ = sleep(nap) => {}
            }
        }
    }

    fn record(&self, signal: AgentSignal) {
        debug!(%signal, "processing signal");
        if let Some(metrics) = self.state.metrics() {
            metrics.record_signal(signal.as_str());
        }
    }
}

//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provisioner coordination and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Top-level coordinator: starts the API binding, the heartbeat activity and
//! the lifecycle controller, then tears the background activities down once
//! the controller terminates.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use loom_common::AgentSettings;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::control_plane::ControlPlaneClient;
use crate::heartbeat::HeartbeatService;
use crate::lifecycle::{LifecycleController, ReapPolicy, ShutdownReport};
use crate::signals::{install_os_hooks, signal_queue, SignalQueue, SignalSender};
use crate::state::AgentState;
use crate::tenant::TenantManager;

/// Readiness contract of the API binding, polled during startup.
pub trait ReadinessProbe: Send + Sync {
    fn is_ready(&self) -> bool;
}

impl ReadinessProbe for AtomicBool {
    fn is_ready(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// A started API binding: its readiness probe and its serving task.
pub struct ServingActivity {
    probe: Arc<dyn ReadinessProbe>,
    task: JoinHandle<Result<()>>,
}

impl fmt::Debug for ServingActivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServingActivity")
            .field("ready", &self.is_ready())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl ServingActivity {
    pub fn new(probe: Arc<dyn ReadinessProbe>, task: JoinHandle<Result<()>>) -> Self {
        Self { probe, task }
    }

    pub fn is_ready(&self) -> bool {
        self.probe.is_ready()
    }

    /// Block until the probe reports ready. The activity ending first is an
    /// error.
    async fn wait_ready(&mut self, poll: Duration) -> Result<()> {
        loop {
            if self.is_ready() {
                return Ok(());
            }
            if self.task.is_finished() {
                let err = match (&mut self.task).await {
                    Ok(Ok(())) => anyhow!("api binding stopped before becoming ready"),
                    Ok(Err(err)) => err.context("api binding failed during startup"),
                    Err(join) => anyhow::Error::new(join).context("api binding task aborted"),
                };
                return Err(err);
            }
            debug!("waiting for api binding to become ready");
            sleep(poll).await;
        }
    }
}

/// Owns the agent's activities for the lifetime of the process.
#[derive(Debug)]
pub struct ProvisionerAgent<M> {
    state: Arc<AgentState<M>>,
    client: Arc<ControlPlaneClient>,
    heartbeat_interval: Duration,
    readiness_poll: Duration,
    reap: ReapPolicy,
    signal_tx: SignalSender,
    signal_rx: SignalQueue,
    os_signals: bool,
}

impl<M: TenantManager> ProvisionerAgent<M> {
    pub fn new(
        state: Arc<AgentState<M>>,
        client: Arc<ControlPlaneClient>,
        settings: &AgentSettings,
    ) -> Self {
        let (signal_tx, signal_rx) = signal_queue();
        Self {
            state,
            client,
            heartbeat_interval: settings.heartbeat_interval,
            readiness_poll: settings.readiness_poll_interval,
            reap: ReapPolicy::from_settings(settings),
            signal_tx,
            signal_rx,
            os_signals: true,
        }
    }

    /// Do not listen for OS signals; only senders from [`Self::signals`]
    /// feed the lifecycle controller.
    pub fn without_os_signals(mut self) -> Self {
        self.os_signals = false;
        self
    }

    /// Handle for injecting signals into the lifecycle controller.
    pub fn signals(&self) -> SignalSender {
        self.signal_tx.clone()
    }

    pub fn state(&self) -> &Arc<AgentState<M>> {
        &self.state
    }

    /// Start every activity and wait for the lifecycle controller to
    /// terminate. A failure to bring up the API binding aborts the agent.
    pub async fn run<F>(self, start_api: F) -> Result<ShutdownReport>
    where
        F: FnOnce(Arc<AgentState<M>>) -> Result<ServingActivity>,
    {
        let Self {
            state,
            client,
            heartbeat_interval,
            readiness_poll,
            reap,
            signal_tx,
            signal_rx,
            os_signals,
        } = self;
        let agent = state.identity().clone();
        info!(%agent, "starting provisioner");

        let mut api = start_api(Arc::clone(&state)).context("failed to start api binding")?;
        api.wait_ready(readiness_poll).await?;
        info!(%agent, "api binding ready");

        let hooks = if os_signals {
            Some(install_os_hooks(signal_tx).context("failed to install signal handlers")?)
        } else {
            drop(signal_tx);
            None
        };

        let heartbeat = tokio::spawn(
            HeartbeatService::new(Arc::clone(&state), Arc::clone(&client), heartbeat_interval)
                .run(),
        );
        let controller =
            tokio::spawn(LifecycleController::new(Arc::clone(&state), client, signal_rx, reap).run());

        let report = controller.await.context("lifecycle controller panicked")?;

        heartbeat.abort();
        api.task.abort();
        if let Some(hooks) = &hooks {
            hooks.abort();
        }
        if let Err(err) = heartbeat.await {
            if !err.is_cancelled() {
                warn!(error = %err, "heartbeat task ended abnormally");
            }
        }
        match api.task.await {
            Ok(Err(err)) => warn!(error = %err, "api binding exited with error"),
            Err(err) if !err.is_cancelled() => warn!(error = %err, "api binding ended abnormally"),
            _ => {}
        }
        drop(hooks);

        info!(
            %agent,
            tenants_drained = report.tenants_drained,
            reap_timed_out = report.reap_timed_out,
            unregistered = report.unregistered,
            "provisioner gracefully shut down"
        );
        Ok(report)
    }
}

//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::error;

/// Shared registry type used across the agent.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every family in the registry using the Prometheus text format.
///
/// Returns the content type alongside the body so HTTP bindings can set the
/// header without depending on `prometheus` directly.
pub fn render(registry: &Registry) -> Option<(&'static str, String)> {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => Some((prometheus::TEXT_FORMAT, body)),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            None
        }
    }
}

/// Metrics recorded by the coordination layer.
#[derive(Clone, Debug)]
pub struct AgentMetrics {
    registry: SharedRegistry,
    heartbeats: IntCounterVec,
    registrations: IntCounterVec,
    signals: IntCounterVec,
    tenants: IntGauge,
    terminating: IntGauge,
    workers: IntGauge,
}

impl AgentMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let heartbeats = IntCounterVec::new(
            Opts::new(
                "loom_provisioner_heartbeats_total",
                "Heartbeats sent to the control plane by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(heartbeats.clone()))?;

        let registrations = IntCounterVec::new(
            Opts::new(
                "loom_provisioner_registrations_total",
                "Register and unregister calls issued by kind and outcome",
            ),
            &["kind", "outcome"],
        )?;
        registry.register(Box::new(registrations.clone()))?;

        let signals = IntCounterVec::new(
            Opts::new(
                "loom_provisioner_signals_total",
                "Process signals consumed by the lifecycle controller",
            ),
            &["signal"],
        )?;
        registry.register(Box::new(signals.clone()))?;

        let tenants = IntGauge::with_opts(Opts::new(
            "loom_provisioner_tenants",
            "Tenants currently registered on this host",
        ))?;
        registry.register(Box::new(tenants.clone()))?;

        let terminating = IntGauge::with_opts(Opts::new(
            "loom_provisioner_tenants_terminating",
            "Tenants asked to delete whose workers have not all exited",
        ))?;
        registry.register(Box::new(terminating.clone()))?;

        let workers = IntGauge::with_opts(Opts::new(
            "loom_provisioner_workers",
            "Live worker processes across all tenants",
        ))?;
        registry.register(Box::new(workers.clone()))?;

        Ok(Self {
            registry,
            heartbeats,
            registrations,
            signals,
            tenants,
            terminating,
            workers,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_heartbeat(&self, outcome: &str) {
        self.heartbeats.with_label_values(&[outcome]).inc();
    }

    pub fn record_registration(&self, kind: &str, outcome: &str) {
        self.registrations.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_signal(&self, signal: &str) {
        self.signals.with_label_values(&[signal]).inc();
    }

    pub fn set_population(&self, tenants: usize, terminating: usize, workers: usize) {
        self.tenants.set(to_gauge(tenants));
        self.terminating.set(to_gauge(terminating));
        self.workers.set(to_gauge(workers));
    }
}

fn to_gauge(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

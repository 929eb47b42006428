//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provisioner coordination and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Contract between the registry and the owners of per-tenant worker processes.

mod process;

use loom_common::{AgentIdentity, WorkerConfig};
use serde::{Deserialize, Serialize};

use crate::error::TenantError;

pub use process::ProcessTenantManager;

/// Agent-wide values stamped onto every manager before it is spawned or
/// merged into an existing one.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub agent: AgentIdentity,
    pub workers: WorkerConfig,
}

/// Requested shape of a tenant as received from the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub workers: u32,
}

/// Owns the worker processes of one tenant.
///
/// The registry never touches OS process APIs itself; `spawn` and `delete`
/// are the only points where workers are created or asked to stop.
pub trait TenantManager: Send + 'static {
    /// Immutable tenant identifier. Empty ids are rejected by the registry.
    fn id(&self) -> &str;

    /// Stamp the agent identity and agent-wide options onto the manager.
    fn attach(&mut self, context: &TenantContext);

    /// Start the tenant's workers.
    fn spawn(&mut self) -> Result<(), TenantError>;

    /// Apply configuration changes carried by `other`, a manager for the same id.
    fn update(&mut self, other: Self) -> Result<(), TenantError>
    where
        Self: Sized;

    /// Ask every worker to wind down. Must not block on their exit.
    fn delete(&mut self);

    /// Reconcile the live worker count against OS process state. Idempotent.
    fn verify_workers(&mut self);

    fn num_workers(&self) -> usize;
}

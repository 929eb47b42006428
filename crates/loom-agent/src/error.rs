//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provisioner coordination and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

use crate::state::ShutdownState;

/// Failures surfaced synchronously to callers of the tenant registry.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("tenant {0} is not registered")]
    TenantNotFound(String),
    #[error("agent is {0}; tenant changes are rejected")]
    NotRunning(ShutdownState),
    #[error("failed to spawn workers for tenant {tenant}: {source}")]
    SpawnFailed {
        tenant: String,
        #[source]
        source: TenantError,
    },
    #[error("failed to update tenant {tenant}: {source}")]
    UpdateFailed {
        tenant: String,
        #[source]
        source: TenantError,
    },
}

/// Failures reported by a [`TenantManager`](crate::tenant::TenantManager).
#[derive(Debug, Error)]
pub enum TenantError {
    #[error("worker launch failed: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("unable to signal worker: {0}")]
    Signal(String),
    #[error("tenant misconfigured: {0}")]
    Configuration(String),
}

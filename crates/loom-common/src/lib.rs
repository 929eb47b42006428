//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the provisioner runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the Loom provisioner workspace.
//! This crate exposes configuration loading, logging bootstrap, and the
//! agent identity consumed across the workspace.

pub mod config;
pub mod identity;
pub mod logging;

pub use config::{
    AgentConfig, AgentSettings, ControlPlaneConfig, LoadedAgentConfig, LoggingConfig,
    WorkerConfig,
};
pub use identity::AgentIdentity;
pub use logging::{init_tracing, LogFormat};

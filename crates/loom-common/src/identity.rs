//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the provisioner runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};

/// Identifier the control plane uses to address this agent, `<host>.<pid>`.
///
/// Formed once at startup and never regenerated; clones share the same
/// allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentIdentity(Arc<str>);

impl AgentIdentity {
    /// Derive the identity from the lowercased host name and the current process id.
    pub fn detect() -> Result<Self> {
        let host = hostname::get().context("unable to resolve host name")?;
        let host = host.to_string_lossy();
        Ok(Self::from_parts(&host, std::process::id()))
    }

    pub fn from_parts(host: &str, pid: u32) -> Self {
        Self(Arc::from(format!("{}.{}", host.trim().to_lowercase(), pid)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AgentIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provisioner coordination and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Coordination layer of the Loom provisioner: the tenant registry shared by
//! the API binding and the lifecycle controller, the heartbeat protocol
//! spoken with the control plane, and the signal-driven shutdown sequence.

pub mod agent;
pub mod control_plane;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod signals;
pub mod state;
pub mod tenant;

pub use agent::{ProvisionerAgent, ReadinessProbe, ServingActivity};
pub use control_plane::{ControlPlaneClient, ControlPlaneError, HeartbeatPayload, Registration};
pub use error::{AgentError, TenantError};
pub use heartbeat::{HeartbeatOutcome, HeartbeatService};
pub use lifecycle::{LifecycleController, ReapPolicy, ShutdownError, ShutdownReport};
pub use signals::{signal_queue, AgentSignal, SignalHooks, SignalQueue, SignalSender};
pub use state::{AgentState, DeleteOutcome, HeartbeatSnapshot, ShutdownState, TenantChange};
pub use tenant::{ProcessTenantManager, TenantContext, TenantManager, TenantSpec};

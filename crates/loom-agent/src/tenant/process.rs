//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provisioner coordination and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io;
use std::process::{Child, Command, Stdio};

use tracing::{debug, info, warn};

use super::{TenantContext, TenantManager, TenantSpec};
use crate::error::TenantError;

pub const ENV_PROVISIONER_ID: &str = "LOOM_PROVISIONER_ID";
pub const ENV_TENANT_ID: &str = "LOOM_TENANT_ID";

/// Tenant manager backed by plain OS child processes, one per worker.
///
/// Workers that were asked to stop stay in `retiring` until they are reaped,
/// so `num_workers` always reflects every process still alive.
#[derive(Debug)]
pub struct ProcessTenantManager {
    id: String,
    target: u32,
    context: Option<TenantContext>,
    active: Vec<Child>,
    retiring: Vec<Child>,
    deleting: bool,
}

impl From<TenantSpec> for ProcessTenantManager {
    fn from(spec: TenantSpec) -> Self {
        Self {
            id: spec.id,
            target: spec.workers,
            context: None,
            active: Vec::new(),
            retiring: Vec::new(),
            deleting: false,
        }
    }
}

impl ProcessTenantManager {
    /// Process ids of every worker that has not been reaped yet.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.active
            .iter()
            .chain(self.retiring.iter())
            .map(Child::id)
            .collect()
    }

    fn launch(&mut self, count: usize) -> Result<(), TenantError> {
        let context = self.context.as_ref().ok_or_else(|| {
            TenantError::Configuration(format!("tenant {} has not been attached", self.id))
        })?;
        let id = self.id.as_str();
        let started = start_batch(id, count, || worker_command(context, id).spawn())?;
        self.active.extend(started);
        Ok(())
    }

    fn retire(&mut self, count: usize) {
        let keep = self.active.len().saturating_sub(count);
        let excess: Vec<Child> = self.active.drain(keep..).collect();
        for mut child in excess {
            if let Err(err) = terminate(&mut child) {
                warn!(tenant = %self.id, pid = child.id(), error = %err, "failed to signal worker");
            }
            self.retiring.push(child);
        }
    }

    fn reconcile(&mut self) -> Result<(), TenantError> {
        let target = usize::try_from(self.target).unwrap_or(usize::MAX);
        let live = self.active.len();
        if target > live {
            self.launch(target - live)
        } else {
            self.retire(live - target);
            Ok(())
        }
    }
}

impl TenantManager for ProcessTenantManager {
    fn id(&self) -> &str {
        &self.id
    }

    fn attach(&mut self, context: &TenantContext) {
        self.context = Some(context.clone());
    }

    fn spawn(&mut self) -> Result<(), TenantError> {
        info!(tenant = %self.id, workers = self.target, "spawning tenant workers");
        self.reconcile()
    }

    fn update(&mut self, mut other: Self) -> Result<(), TenantError> {
        if let Some(context) = other.context.take() {
            self.context = Some(context);
        }
        if self.deleting {
            debug!(tenant = %self.id, "ignoring update for tenant being deleted");
            return Ok(());
        }
        info!(tenant = %self.id, from = self.target, to = other.target, "updating tenant workers");
        self.target = other.target;
        self.reconcile()
    }

    fn delete(&mut self) {
        self.deleting = true;
        self.target = 0;
        let live = self.active.len();
        self.retire(live);
    }

    fn verify_workers(&mut self) {
        let tenant = self.id.clone();
        let mut reap = |child: &mut Child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(tenant = %tenant, pid = child.id(), %status, "worker reaped");
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(tenant = %tenant, pid = child.id(), error = %err, "unable to query worker; dropping it");
                false
            }
        };
        self.active.retain_mut(&mut reap);
        self.retiring.retain_mut(&mut reap);
    }

    fn num_workers(&self) -> usize {
        self.active.len() + self.retiring.len()
    }
}

/// Workers still running when the manager goes away are killed and reaped.
impl Drop for ProcessTenantManager {
    fn drop(&mut self) {
        for mut child in self.active.drain(..).chain(self.retiring.drain(..)) {
            if let Ok(None) = child.try_wait() {
                warn!(tenant = %self.id, pid = child.id(), "stopping worker of discarded tenant");
                discard(&self.id, &mut child);
            }
        }
    }
}

fn worker_command(context: &TenantContext, tenant: &str) -> Command {
    let mut command = Command::new(&context.workers.command);
    command
        .args(&context.workers.args)
        .envs(&context.workers.env)
        .env(ENV_PROVISIONER_ID, context.agent.as_str())
        .env(ENV_TENANT_ID, tenant)
        .stdin(Stdio::null());
    command
}

/// Start `count` workers with `start`. Either all of them come up or none
/// are left running: on the first failure every worker of the batch is
/// killed and reaped before the error is returned.
fn start_batch<F>(tenant: &str, count: usize, mut start: F) -> Result<Vec<Child>, TenantError>
where
    F: FnMut() -> io::Result<Child>,
{
    let mut started = Vec::new();
    for _ in 0..count {
        match start() {
            Ok(child) => {
                debug!(tenant = %tenant, pid = child.id(), "worker launched");
                started.push(child);
            }
            Err(err) => {
                warn!(
                    tenant = %tenant,
                    started = started.len(),
                    requested = count,
                    error = %err,
                    "worker launch failed; stopping the rest of the batch"
                );
                for child in &mut started {
                    discard(tenant, child);
                }
                return Err(err.into());
            }
        }
    }
    Ok(started)
}

fn discard(tenant: &str, child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(tenant = %tenant, pid = child.id(), error = %err, "kill failed");
    }
    if let Err(err) = child.wait() {
        warn!(tenant = %tenant, pid = child.id(), error = %err, "unable to reap worker");
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> Result<(), TenantError> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(child.id())
        .map_err(|_| TenantError::Signal(format!("pid {} out of range", child.id())))?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(TenantError::Signal(err.to_string())),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> Result<(), TenantError> {
    child
        .kill()
        .map_err(|err| TenantError::Signal(err.to_string()))
}

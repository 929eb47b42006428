//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provisioner coordination and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Translation of platform signal delivery into an ordered queue of
//! [`AgentSignal`]s consumed by the lifecycle controller.
//!
//! ## Unix
//! `SIGCHLD`, `SIGTERM` and `SIGINT` map to `ChildExited`, `Terminate` and
//! `Interrupt`.
//!
//! ## Other platforms
//! Only Ctrl-C is observed, as `Interrupt`.

use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Abstract process notifications the agent reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentSignal {
    ChildExited,
    Terminate,
    Interrupt,
}

impl AgentSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentSignal::ChildExited => "child_exited",
            AgentSignal::Terminate => "terminate",
            AgentSignal::Interrupt => "interrupt",
        }
    }

    pub fn is_termination(&self) -> bool {
        matches!(self, AgentSignal::Terminate | AgentSignal::Interrupt)
    }
}

impl fmt::Display for AgentSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer side of the signal queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SignalSender(mpsc::UnboundedSender<AgentSignal>);

impl SignalSender {
    /// Enqueue a signal. Returns `false` once the consumer is gone.
    pub fn send(&self, signal: AgentSignal) -> bool {
        self.0.send(signal).is_ok()
    }
}

/// FIFO of received signals with a single consumer.
#[derive(Debug)]
pub struct SignalQueue(mpsc::UnboundedReceiver<AgentSignal>);

impl SignalQueue {
    /// Wait for the next signal. `None` once every sender has been dropped.
    pub async fn next(&mut self) -> Option<AgentSignal> {
        self.0.recv().await
    }
}

pub fn signal_queue() -> (SignalSender, SignalQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender(tx), SignalQueue(rx))
}

/// Running OS signal listener. Aborted when dropped.
#[derive(Debug)]
pub struct SignalHooks {
    task: JoinHandle<()>,
}

impl SignalHooks {
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for SignalHooks {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Install listeners that forward OS signals into `sender`.
///
/// Registration happens before this returns, so signals delivered afterwards
/// are never lost. Must be called from within a Tokio runtime.
#[cfg(unix)]
pub fn install_os_hooks(sender: SignalSender) -> std::io::Result<SignalHooks> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut child = signal(SignalKind::child())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    let task = tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = child.recv() => AgentSignal::ChildExited,
                Some(()) = term.recv() => AgentSignal::Terminate,
                Some(()) = int.recv() => AgentSignal::Interrupt,
                else => break,
            };
            debug!(signal = %received, "os signal captured");
            if !sender.send(received) {
                break;
            }
        }
    });
    info!("installed signal handlers for SIGCHLD, SIGTERM and SIGINT");
    Ok(SignalHooks { task })
}

#[cfg(not(unix))]
pub fn install_os_hooks(sender: SignalSender) -> std::io::Result<SignalHooks> {
    let task = tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !sender.send(AgentSignal::Interrupt) {
                break;
            }
        }
    });
    info!("installed Ctrl-C handler");
    Ok(SignalHooks { task })
}

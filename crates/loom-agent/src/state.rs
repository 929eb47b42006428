//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provisioner coordination and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use loom_common::AgentIdentity;
use loom_metrics::AgentMetrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::tenant::{TenantContext, TenantManager};

/// Agent shutdown progression. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ShutdownState::Running => "running",
            ShutdownState::ShuttingDown => "shutting down",
            ShutdownState::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// Point-in-time tenant id to worker count mapping used for heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeartbeatSnapshot(BTreeMap<String, usize>);

impl HeartbeatSnapshot {
    pub fn get(&self, tenant: &str) -> Option<usize> {
        self.0.get(tenant).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total_workers(&self) -> usize {
        self.0.values().sum()
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for HeartbeatSnapshot {
    fn from_iter<I: IntoIterator<Item = (S, usize)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(id, count)| (id.into(), count)).collect())
    }
}

/// Result of [`AgentState::add_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantChange {
    Added,
    Updated,
}

/// Result of [`AgentState::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// No workers were running; the tenant is gone.
    Removed,
    /// Workers were asked to stop; removal happens once they are reaped.
    Terminating,
}

#[derive(Debug)]
struct StateInner<M> {
    tenants: HashMap<String, M>,
    terminating: HashSet<String>,
    shutdown: ShutdownState,
}

/// Tenant registry and shutdown flag shared by the API binding, the heartbeat
/// client and the lifecycle controller. Every mutation goes through the
/// internal mutex.
#[derive(Debug)]
pub struct AgentState<M> {
    context: TenantContext,
    inner: Mutex<StateInner<M>>,
    metrics: Option<AgentMetrics>,
}

impl<M: TenantManager> AgentState<M> {
    pub fn new(context: TenantContext) -> Self {
        Self {
            context,
            inner: Mutex::new(StateInner {
                tenants: HashMap::new(),
                terminating: HashSet::new(),
                shutdown: ShutdownState::Running,
            }),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.context.agent
    }

    pub fn metrics(&self) -> Option<&AgentMetrics> {
        self.metrics.as_ref()
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.inner.lock().shutdown
    }

    /// Register a new tenant or edit an existing one in place.
    ///
    /// New managers are stamped with the agent context and spawned before
    /// insertion; a spawn failure leaves the registry untouched. Spawning runs
    /// without the registry lock held, so heartbeats and reaping carry on while
    /// a large tenant starts. A tenant whose workers come up after shutdown
    /// began is registered as terminating so the drain waits for it.
    pub fn add_or_update(&self, mut manager: M) -> Result<TenantChange, AgentError> {
        let id = manager.id().to_owned();
        if id.trim().is_empty() {
            return Err(AgentError::InvalidArgument(
                "cannot add a tenant manager without an id".into(),
            ));
        }
        manager.attach(&self.context);

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.shutdown != ShutdownState::Running {
                warn!(tenant = %id, state = %inner.shutdown, "rejecting tenant change");
                return Err(AgentError::NotRunning(inner.shutdown));
            }
            if let Some(existing) = inner.tenants.get_mut(&id) {
                debug!(tenant = %id, "editing tenant");
                existing
                    .update(manager)
                    .map_err(|source| AgentError::UpdateFailed {
                        tenant: id.clone(),
                        source,
                    })?;
                self.publish(inner);
                info!(tenant = %id, change = ?TenantChange::Updated, "tenant applied");
                return Ok(TenantChange::Updated);
            }
        }

        debug!(tenant = %id, "adding new tenant");
        manager.spawn().map_err(|source| AgentError::SpawnFailed {
            tenant: id.clone(),
            source,
        })?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.shutdown != ShutdownState::Running {
            warn!(
                tenant = %id,
                state = %inner.shutdown,
                "shutdown began while tenant was starting; draining it"
            );
            manager.delete();
            if let Entry::Vacant(slot) = inner.tenants.entry(id.clone()) {
                slot.insert(manager);
                inner.terminating.insert(id.clone());
            }
            self.publish(inner);
            return Err(AgentError::NotRunning(inner.shutdown));
        }
        let change = match inner.tenants.get_mut(&id) {
            Some(existing) => {
                debug!(tenant = %id, "tenant added concurrently; editing it instead");
                existing
                    .update(manager)
                    .map_err(|source| AgentError::UpdateFailed {
                        tenant: id.clone(),
                        source,
                    })?;
                TenantChange::Updated
            }
            None => {
                inner.tenants.insert(id.clone(), manager);
                TenantChange::Added
            }
        };
        self.publish(inner);
        info!(tenant = %id, ?change, "tenant applied");
        Ok(change)
    }

    /// Remove a tenant, or ask its workers to stop when any are still running.
    pub fn delete(&self, id: &str) -> Result<DeleteOutcome, AgentError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.shutdown != ShutdownState::Running {
            warn!(tenant = %id, state = %inner.shutdown, "rejecting tenant delete");
            return Err(AgentError::NotRunning(inner.shutdown));
        }

        let Some(manager) = inner.tenants.get_mut(id) else {
            return Err(AgentError::TenantNotFound(id.to_owned()));
        };
        let outcome = if manager.num_workers() == 0 {
            inner.tenants.remove(id);
            inner.terminating.remove(id);
            DeleteOutcome::Removed
        } else {
            if !inner.terminating.contains(id) {
                manager.delete();
                inner.terminating.insert(id.to_owned());
            }
            DeleteOutcome::Terminating
        };
        self.publish(inner);
        info!(tenant = %id, ?outcome, "tenant delete requested");
        Ok(outcome)
    }

    /// Reconcile every manager against OS state, then purge tenants that were
    /// pending deletion and have no workers left. Returns the purged ids.
    pub fn verify(&self) -> Vec<String> {
        let mut inner = self.inner.lock();
        let StateInner {
            tenants,
            terminating,
            ..
        } = &mut *inner;

        for manager in tenants.values_mut() {
            manager.verify_workers();
        }

        let purged: Vec<String> = terminating
            .iter()
            .filter(|id| tenants.get(*id).map_or(true, |m| m.num_workers() == 0))
            .cloned()
            .collect();
        for id in &purged {
            tenants.remove(id);
            terminating.remove(id);
            info!(tenant = %id, "tenant workers reaped; tenant removed");
        }
        self.publish(&inner);
        purged
    }

    pub fn snapshot(&self) -> HeartbeatSnapshot {
        let inner = self.inner.lock();
        inner
            .tenants
            .iter()
            .map(|(id, manager)| (id.clone(), manager.num_workers()))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().tenants.contains_key(id)
    }

    pub fn is_terminating(&self, id: &str) -> bool {
        self.inner.lock().terminating.contains(id)
    }

    pub fn tenant_count(&self) -> usize {
        self.inner.lock().tenants.len()
    }

    pub fn terminating_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().terminating.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Live workers across every registered tenant.
    pub fn live_workers(&self) -> usize {
        self.inner
            .lock()
            .tenants
            .values()
            .map(TenantManager::num_workers)
            .sum()
    }

    /// Run `f` against the manager registered under `id`.
    pub fn inspect<R>(&self, id: &str, f: impl FnOnce(&M) -> R) -> Option<R> {
        self.inner.lock().tenants.get(id).map(f)
    }

    /// Move from `Running` to `ShuttingDown`. Returns `false` if shutdown
    /// already started.
    pub fn begin_shutdown(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.shutdown != ShutdownState::Running {
            return false;
        }
        inner.shutdown = ShutdownState::ShuttingDown;
        true
    }

    /// Ask every registered tenant to wind down and mark it terminating.
    /// Only valid once shutdown has begun. Returns the number of tenants asked.
    pub fn drain(&self) -> usize {
        let mut inner = self.inner.lock();
        if inner.shutdown == ShutdownState::Running {
            warn!("drain requested while running; ignoring");
            return 0;
        }
        let StateInner {
            tenants,
            terminating,
            ..
        } = &mut *inner;
        let mut asked = 0;
        for (id, manager) in tenants.iter_mut() {
            if terminating.insert(id.clone()) {
                manager.delete();
                asked += 1;
            }
        }
        self.publish(&inner);
        asked
    }

    pub fn mark_terminated(&self) {
        let mut inner = self.inner.lock();
        if inner.shutdown == ShutdownState::ShuttingDown {
            inner.shutdown = ShutdownState::Terminated;
        }
    }

    fn publish(&self, inner: &StateInner<M>) {
        if let Some(metrics) = &self.metrics {
            let workers = inner.tenants.values().map(TenantManager::num_workers).sum();
            metrics.set_population(inner.tenants.len(), inner.terminating.len(), workers);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::{mpsc, Arc};
    use std::thread;

    use loom_common::WorkerConfig;

    use super::*;
    use crate::error::TenantError;

    #[derive(Debug)]
    struct StubTenant {
        id: String,
        workers: usize,
        revision: u32,
        agent: Option<String>,
        deletes: u32,
        fail_spawn: bool,
        gate: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
    }

    impl StubTenant {
        fn new(id: &str, workers: usize) -> Self {
            Self {
                id: id.into(),
                workers,
                revision: 0,
                agent: None,
                deletes: 0,
                fail_spawn: false,
                gate: None,
            }
        }

        /// Tenant whose spawn reports entry and then blocks until released.
        fn gated(id: &str, workers: usize) -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let mut tenant = Self::new(id, workers);
            tenant.gate = Some((entered_tx, release_rx));
            (tenant, entered_rx, release_tx)
        }
    }

    impl TenantManager for StubTenant {
        fn id(&self) -> &str {
            &self.id
        }

        fn attach(&mut self, context: &TenantContext) {
            self.agent = Some(context.agent.to_string());
        }

        fn spawn(&mut self) -> Result<(), TenantError> {
            if self.fail_spawn {
                return Err(TenantError::Configuration("boom".into()));
            }
            if let Some((entered, release)) = &self.gate {
                let _ = entered.send(());
                let _ = release.recv();
            }
            Ok(())
        }

        fn update(&mut self, other: Self) -> Result<(), TenantError> {
            self.revision = other.revision;
            self.workers = other.workers;
            Ok(())
        }

        fn delete(&mut self) {
            self.deletes += 1;
        }

        fn verify_workers(&mut self) {}

        fn num_workers(&self) -> usize {
            self.workers
        }
    }

    fn state() -> AgentState<StubTenant> {
        AgentState::new(TenantContext {
            agent: AgentIdentity::from_parts("host", 7),
            workers: WorkerConfig {
                command: PathBuf::from("true"),
                ..WorkerConfig::default()
            },
        })
    }

    #[test]
    fn add_stamps_identity_and_reapply_edits_in_place() {
        let state = state();
        assert_eq!(
            state.add_or_update(StubTenant::new("t1", 1)).unwrap(),
            TenantChange::Added
        );
        let mut edited = StubTenant::new("t1", 4);
        edited.revision = 2;
        assert_eq!(state.add_or_update(edited).unwrap(), TenantChange::Updated);

        assert_eq!(state.tenant_count(), 1);
        assert_eq!(state.inspect("t1", |t| t.revision), Some(2));
        assert_eq!(
            state.inspect("t1", |t| t.agent.clone()),
            Some(Some("host.7".to_string()))
        );
        assert_eq!(state.snapshot().get("t1"), Some(4));
    }

    #[test]
    fn empty_id_is_invalid_and_leaves_registry_unchanged() {
        let state = state();
        let err = state.add_or_update(StubTenant::new("", 0)).unwrap_err();
        assert!(matches!(err, AgentError::InvalidArgument(_)));
        assert_eq!(state.tenant_count(), 0);
    }

    #[test]
    fn failed_spawn_is_not_registered() {
        let state = state();
        let mut tenant = StubTenant::new("t1", 0);
        tenant.fail_spawn = true;
        assert!(matches!(
            state.add_or_update(tenant),
            Err(AgentError::SpawnFailed { .. })
        ));
        assert!(!state.contains("t1"));
    }

    #[test]
    fn registry_stays_available_while_a_new_tenant_spawns() {
        let state = Arc::new(state());
        state.add_or_update(StubTenant::new("steady", 2)).unwrap();

        let (tenant, entered, release) = StubTenant::gated("big", 5);
        let adder = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.add_or_update(tenant))
        };
        entered.recv().unwrap();

        assert!(state.inner.try_lock().is_some());
        assert_eq!(state.snapshot().get("steady"), Some(2));
        assert!(!state.contains("big"));

        release.send(()).unwrap();
        assert_eq!(adder.join().unwrap().unwrap(), TenantChange::Added);
        assert_eq!(state.snapshot().get("big"), Some(5));
    }

    #[test]
    fn tenant_started_during_shutdown_is_handed_to_the_drain() {
        let state = Arc::new(state());
        let (tenant, entered, release) = StubTenant::gated("late", 3);
        let adder = {
            let state = Arc::clone(&state);
            thread::spawn(move || state.add_or_update(tenant))
        };
        entered.recv().unwrap();

        assert!(state.begin_shutdown());
        assert_eq!(state.drain(), 0);
        release.send(()).unwrap();

        assert!(matches!(
            adder.join().unwrap(),
            Err(AgentError::NotRunning(ShutdownState::ShuttingDown))
        ));
        assert!(state.is_terminating("late"));
        assert_eq!(state.inspect("late", |t| t.deletes), Some(1));
        assert_eq!(state.live_workers(), 3);
        assert_eq!(state.drain(), 0);
    }

    #[test]
    fn delete_of_unknown_tenant_is_not_found() {
        let state = state();
        assert!(matches!(
            state.delete("ghost"),
            Err(AgentError::TenantNotFound(_))
        ));
    }

    #[test]
    fn repeated_delete_signals_manager_once() {
        let state = state();
        state.add_or_update(StubTenant::new("t1", 2)).unwrap();
        assert_eq!(state.delete("t1").unwrap(), DeleteOutcome::Terminating);
        assert_eq!(state.delete("t1").unwrap(), DeleteOutcome::Terminating);
        assert_eq!(state.inspect("t1", |t| t.deletes), Some(1));
        assert_eq!(state.terminating_ids(), vec!["t1".to_string()]);
    }

    #[test]
    fn shutdown_state_is_monotonic() {
        let state = state();
        assert_eq!(state.shutdown_state(), ShutdownState::Running);
        state.mark_terminated();
        assert_eq!(state.shutdown_state(), ShutdownState::Running);
        assert!(state.begin_shutdown());
        assert!(!state.begin_shutdown());
        state.mark_terminated();
        assert_eq!(state.shutdown_state(), ShutdownState::Terminated);
        assert!(!state.begin_shutdown());
        assert_eq!(state.shutdown_state(), ShutdownState::Terminated);
    }

    #[test]
    fn mutations_are_rejected_after_shutdown_begins() {
        let state = state();
        state.add_or_update(StubTenant::new("t1", 0)).unwrap();
        state.begin_shutdown();
        assert!(matches!(
            state.add_or_update(StubTenant::new("t2", 0)),
            Err(AgentError::NotRunning(ShutdownState::ShuttingDown))
        ));
        assert!(matches!(
            state.delete("t1"),
            Err(AgentError::NotRunning(_))
        ));
        assert!(!state.contains("t2"));
    }

    #[test]
    fn drain_asks_every_tenant_and_verify_purges_idle_ones() {
        let state = state();
        state.add_or_update(StubTenant::new("idle", 0)).unwrap();
        state.add_or_update(StubTenant::new("busy", 3)).unwrap();
        assert_eq!(state.drain(), 0);

        state.begin_shutdown();
        assert_eq!(state.drain(), 2);
        assert_eq!(state.drain(), 0);
        assert_eq!(state.inspect("idle", |t| t.deletes), Some(1));

        let purged = state.verify();
        assert_eq!(purged, vec!["idle".to_string()]);
        assert!(state.contains("busy"));
        assert_eq!(state.live_workers(), 3);
    }

    #[test]
    fn snapshot_serializes_as_plain_map() {
        let snapshot: HeartbeatSnapshot = [("a", 1usize), ("b", 0)].into_iter().collect();
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json, serde_json::json!({"a": 1, "b": 0}));
        assert_eq!(snapshot.total_workers(), 1);
    }
}

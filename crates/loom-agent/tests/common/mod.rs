//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Provisioner coordination and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::routing::{post, put};
use axum::Router;
use loom_agent::{
    AgentState, ControlPlaneClient, ServingActivity, TenantContext, TenantError, TenantManager,
};
use loom_common::{AgentIdentity, AgentSettings, ControlPlaneConfig, WorkerConfig};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};

/// One request observed by [`FakeControlPlane`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub user: Option<String>,
    pub body: Option<Value>,
}

#[derive(Debug, Default)]
struct PlaneInner {
    calls: Mutex<Vec<RecordedCall>>,
    heartbeat_statuses: Mutex<VecDeque<StatusCode>>,
}

/// In-process control plane answering the provisioner endpoints with 200
/// unless a heartbeat status has been scripted.
#[derive(Debug, Clone)]
pub struct FakeControlPlane {
    addr: SocketAddr,
    inner: Arc<PlaneInner>,
}

impl FakeControlPlane {
    pub async fn start() -> Self {
        let inner = Arc::new(PlaneInner::default());
        let router = Router::new()
            .route("/v1/provisioners/:id", put(record).delete(record))
            .route("/v1/provisioners/:id/heartbeat", post(heartbeat))
            .with_state(Arc::clone(&inner));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self { addr, inner }
    }

    pub fn uri(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Answer the next heartbeat with `status` instead of 200.
    pub fn script_heartbeat(&self, status: StatusCode) {
        self.inner.heartbeat_statuses.lock().push_back(status);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner.calls.lock().clone()
    }

    pub fn calls_with(&self, method: Method) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method)
            .collect()
    }

    pub fn client(&self, identity: &AgentIdentity) -> ControlPlaneClient {
        let config = ControlPlaneConfig {
            uri: self.uri(),
            request_timeout: Duration::from_secs(2),
            ..ControlPlaneConfig::default()
        };
        ControlPlaneClient::new(&config, &AgentSettings::default(), identity).unwrap()
    }
}

fn capture(method: Method, uri: &Uri, headers: &HeaderMap, body: &Bytes) -> RecordedCall {
    RecordedCall {
        method,
        path: uri.path().to_owned(),
        user: headers
            .get("X-Loom-UserID")
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned),
        body: serde_json::from_slice(body).ok(),
    }
}

async fn record(
    State(inner): State<Arc<PlaneInner>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    inner
        .calls
        .lock()
        .push(capture(method, &uri, &headers, &body));
    StatusCode::OK
}

async fn heartbeat(
    State(inner): State<Arc<PlaneInner>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    inner
        .calls
        .lock()
        .push(capture(method, &uri, &headers, &body));
    inner
        .heartbeat_statuses
        .lock()
        .pop_front()
        .unwrap_or(StatusCode::OK)
}

/// Handle for steering a [`FakeTenant`] after it moved into the registry.
#[derive(Debug, Clone, Default)]
pub struct TenantProbe {
    workers: Arc<AtomicUsize>,
    deletes: Arc<AtomicUsize>,
    updates: Arc<AtomicUsize>,
}

impl TenantProbe {
    pub fn set_workers(&self, workers: usize) {
        self.workers.store(workers, Ordering::SeqCst);
    }

    pub fn workers(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

/// Scripted tenant whose worker count is driven through its [`TenantProbe`].
#[derive(Debug)]
pub struct FakeTenant {
    id: String,
    requested: usize,
    probe: TenantProbe,
}

impl FakeTenant {
    pub fn new(id: &str, workers: usize) -> (Self, TenantProbe) {
        let probe = TenantProbe::default();
        probe.set_workers(workers);
        let tenant = Self {
            id: id.into(),
            requested: workers,
            probe: probe.clone(),
        };
        (tenant, probe)
    }
}

impl TenantManager for FakeTenant {
    fn id(&self) -> &str {
        &self.id
    }

    fn attach(&mut self, _context: &TenantContext) {}

    fn spawn(&mut self) -> Result<(), TenantError> {
        Ok(())
    }

    fn update(&mut self, other: Self) -> Result<(), TenantError> {
        self.probe.updates.fetch_add(1, Ordering::SeqCst);
        self.requested = other.requested;
        self.probe.set_workers(other.requested);
        Ok(())
    }

    fn delete(&mut self) {
        self.probe.deletes.fetch_add(1, Ordering::SeqCst);
    }

    fn verify_workers(&mut self) {}

    fn num_workers(&self) -> usize {
        self.probe.workers()
    }
}

pub fn identity() -> AgentIdentity {
    AgentIdentity::from_parts("test-host", 4242)
}

pub fn agent_state() -> Arc<AgentState<FakeTenant>> {
    Arc::new(AgentState::new(TenantContext {
        agent: identity(),
        workers: WorkerConfig {
            command: PathBuf::from("true"),
            ..WorkerConfig::default()
        },
    }))
}

/// Settings with short intervals suitable for tests.
pub fn fast_settings() -> AgentSettings {
    AgentSettings {
        heartbeat_interval: Duration::from_millis(25),
        readiness_poll_interval: Duration::from_millis(5),
        reap_timeout: Duration::from_secs(10),
        reap_poll_interval: Duration::from_millis(10),
        ..AgentSettings::default()
    }
}

/// API stand-in that is ready immediately and serves forever.
pub fn idle_api<M>(_state: Arc<AgentState<M>>) -> anyhow::Result<ServingActivity> {
    let ready = Arc::new(AtomicBool::new(true));
    let task = tokio::spawn(async {
        std::future::pending::<()>().await;
        Ok(())
    });
    Ok(ServingActivity::new(ready, task))
}

/// Poll `condition` until it holds or five seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Networking API surface for tenant management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use loom_agent::{
    AgentError, AgentState, DeleteOutcome, HeartbeatPayload, ServingActivity, ShutdownState,
    TenantChange, TenantManager, TenantSpec,
};
use loom_metrics::SharedRegistry;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared API state exposed to handlers.
pub struct ApiState<M> {
    agent: Arc<AgentState<M>>,
    registry: Option<SharedRegistry>,
    ready: Arc<AtomicBool>,
}

impl<M: TenantManager> ApiState<M> {
    pub fn new(agent: Arc<AgentState<M>>, registry: Option<SharedRegistry>) -> Self {
        Self {
            agent,
            registry,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    fn status(&self) -> StatusResponse {
        let snapshot = self.agent.snapshot();
        StatusResponse {
            id: self.agent.identity().to_string(),
            state: self.agent.shutdown_state(),
            ready: self.ready.load(Ordering::Acquire),
            tenants: snapshot.len(),
            workers: snapshot.total_workers(),
            terminating: self.agent.terminating_ids(),
        }
    }
}

/// Handle to the running API server.
#[derive(Debug)]
pub struct ApiServer {
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ApiServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(err.into()),
        }
    }
}

/// The agent drives the server through its readiness flag and cancels the
/// task outright; the graceful shutdown channel is released.
impl From<ApiServer> for ServingActivity {
    fn from(server: ApiServer) -> Self {
        ServingActivity::new(server.ready, server.task)
    }
}

/// Bind the tenant API on `addr` and start serving in the background.
///
/// Binding happens before this returns, so an address conflict surfaces here.
pub fn spawn_api_server<M>(
    agent: Arc<AgentState<M>>,
    registry: Option<SharedRegistry>,
    addr: SocketAddr,
) -> Result<ApiServer>
where
    M: TenantManager + From<TenantSpec>,
{
    let state = Arc::new(ApiState::new(agent, registry));
    let ready = Arc::clone(&state.ready);
    let router = router(state);

    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind API listener {addr}"))?;
    listener
        .set_nonblocking(true)
        .context("failed to configure API listener as non-blocking")?;
    let addr = listener
        .local_addr()
        .context("failed to read API listener address")?;
    let tcp_listener =
        TcpListener::from_std(listener).context("failed to create tokio listener")?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let serving = Arc::clone(&ready);
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        info!(address = %addr, "api server listening");
        serving.store(true, Ordering::Release);
        let result = axum::serve(tcp_listener, router)
            .with_graceful_shutdown(async move {
                // A dropped sender leaves the server running until aborted.
                if shutdown_rx.await.is_err() {
                    std::future::pending::<()>().await;
                }
            })
            .await;
        serving.store(false, Ordering::Release);
        if let Err(err) = result {
            error!(address = %addr, error = %err, "api server exited with error");
            return Err(err.into());
        }
        Ok(())
    });

    Ok(ApiServer {
        addr,
        ready,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

fn router<M>(state: Arc<ApiState<M>>) -> Router
where
    M: TenantManager + From<TenantSpec>,
{
    Router::new()
        .route("/status", get(get_status::<M>))
        .route("/heartbeat", get(get_heartbeat::<M>))
        .route("/metrics", get(get_metrics::<M>))
        .route("/v1/tenants", post(post_tenant::<M>))
        .route(
            "/v1/tenants/:id",
            put(put_tenant::<M>).delete(delete_tenant::<M>),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    id: String,
    state: ShutdownState,
    ready: bool,
    tenants: usize,
    workers: usize,
    terminating: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WorkersRequest {
    #[serde(default)]
    workers: u32,
}

#[derive(Debug, Serialize)]
struct TenantChangeResponse {
    id: String,
    change: TenantChange,
}

#[derive(Debug, Serialize)]
struct TenantDeleteResponse {
    id: String,
    outcome: DeleteOutcome,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        let status = match &err {
            AgentError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AgentError::TenantNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::NotRunning(_) => StatusCode::SERVICE_UNAVAILABLE,
            AgentError::SpawnFailed { .. } | AgentError::UpdateFailed { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(error = %err, "tenant request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

async fn get_status<M: TenantManager>(State(state): State<Arc<ApiState<M>>>) -> Json<StatusResponse> {
    Json(state.status())
}

async fn get_heartbeat<M: TenantManager>(
    State(state): State<Arc<ApiState<M>>>,
) -> Json<HeartbeatPayload> {
    Json(HeartbeatPayload::from(state.agent.snapshot()))
}

async fn get_metrics<M: TenantManager>(State(state): State<Arc<ApiState<M>>>) -> Response {
    let Some(registry) = &state.registry else {
        return ApiError::new(StatusCode::NOT_FOUND, "metrics are not enabled").into_response();
    };
    match loom_metrics::render(registry) {
        Some((content_type, body)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static(content_type))],
            body,
        )
            .into_response(),
        None => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error")
            .into_response(),
    }
}

async fn post_tenant<M>(
    State(state): State<Arc<ApiState<M>>>,
    Json(spec): Json<TenantSpec>,
) -> Result<(StatusCode, Json<TenantChangeResponse>), ApiError>
where
    M: TenantManager + From<TenantSpec>,
{
    apply(state, spec).await
}

async fn put_tenant<M>(
    State(state): State<Arc<ApiState<M>>>,
    Path(id): Path<String>,
    Json(request): Json<WorkersRequest>,
) -> Result<(StatusCode, Json<TenantChangeResponse>), ApiError>
where
    M: TenantManager + From<TenantSpec>,
{
    apply(
        state,
        TenantSpec {
            id,
            workers: request.workers,
        },
    )
    .await
}

/// Worker processes are started synchronously, so the change runs on the
/// blocking pool rather than on a runtime worker.
async fn apply<M>(
    state: Arc<ApiState<M>>,
    spec: TenantSpec,
) -> Result<(StatusCode, Json<TenantChangeResponse>), ApiError>
where
    M: TenantManager + From<TenantSpec>,
{
    let id = spec.id.clone();
    let agent = Arc::clone(&state.agent);
    let change = task::spawn_blocking(move || agent.add_or_update(M::from(spec)))
        .await
        .map_err(|err| {
            error!(tenant = %id, error = %err, "tenant change task failed");
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "tenant change task failed")
        })??;
    let status = match change {
        TenantChange::Added => StatusCode::CREATED,
        TenantChange::Updated => StatusCode::OK,
    };
    Ok((status, Json(TenantChangeResponse { id, change })))
}

async fn delete_tenant<M: TenantManager>(
    State(state): State<Arc<ApiState<M>>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<TenantDeleteResponse>), ApiError> {
    let outcome = state.agent.delete(&id)?;
    let status = match outcome {
        DeleteOutcome::Removed => StatusCode::OK,
        DeleteOutcome::Terminating => StatusCode::ACCEPTED,
    };
    Ok((status, Json(TenantDeleteResponse { id, outcome })))
}

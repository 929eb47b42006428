//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Control plane registration and heartbeat transport."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use loom_common::{AgentIdentity, AgentSettings, ControlPlaneConfig};
use loom_metrics::AgentMetrics;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::state::HeartbeatSnapshot;

/// Header carrying the acting user on every control plane call.
pub const USER_HEADER: &str = "X-Loom-UserID";

/// Failures talking to the control plane. Callers log these and move on.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("control plane rejected request with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("control plane does not know this provisioner")]
    NotFound,
    #[error("invalid control plane uri: {0}")]
    InvalidUri(String),
}

/// Registration body sent with `PUT /v1/provisioners/{id}`.
///
/// Capacity and port travel as strings, which is what the control plane
/// codec expects.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: String,
    #[serde_as(as = "DisplayFromStr")]
    pub capacity_total: u32,
    pub host: String,
    #[serde_as(as = "DisplayFromStr")]
    pub port: u16,
}

/// Heartbeat body sent with `POST /v1/provisioners/{id}/heartbeat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub usage: HeartbeatSnapshot,
}

impl From<HeartbeatSnapshot> for HeartbeatPayload {
    fn from(usage: HeartbeatSnapshot) -> Self {
        Self { usage }
    }
}

/// HTTP client for the provisioner endpoints of the control plane.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: Client,
    provisioner_url: String,
    user_id: String,
    registration: Registration,
    metrics: Option<AgentMetrics>,
}

impl ControlPlaneClient {
    pub fn new(
        config: &ControlPlaneConfig,
        settings: &AgentSettings,
        agent: &AgentIdentity,
    ) -> Result<Self, ControlPlaneError> {
        let base = Url::parse(&config.uri)
            .map_err(|err| ControlPlaneError::InvalidUri(format!("{}: {}", config.uri, err)))?;
        let provisioner_url = format!(
            "{}/v1/provisioners/{}",
            base.as_str().trim_end_matches('/'),
            agent
        );
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            http,
            provisioner_url,
            user_id: config.user_id.clone(),
            registration: Registration {
                id: agent.to_string(),
                capacity_total: settings.capacity_total,
                host: settings.host.clone(),
                port: settings.port,
            },
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn provisioner_url(&self) -> &str {
        &self.provisioner_url
    }

    pub fn heartbeat_url(&self) -> String {
        format!("{}/heartbeat", self.provisioner_url)
    }

    /// Idempotent upsert of this agent's registration.
    pub async fn register(&self) -> Result<(), ControlPlaneError> {
        let request = self
            .http
            .put(&self.provisioner_url)
            .json(&self.registration);
        self.execute(request).await
    }

    /// Report usage. A 404 maps to [`ControlPlaneError::NotFound`].
    pub async fn heartbeat(&self, payload: &HeartbeatPayload) -> Result<(), ControlPlaneError> {
        let request = self.http.post(self.heartbeat_url()).json(payload);
        self.execute(request).await
    }

    pub async fn unregister(&self) -> Result<(), ControlPlaneError> {
        let request = self.http.delete(&self.provisioner_url);
        self.execute(request).await
    }

    /// Register and log the outcome. Never fails; returns whether the
    /// control plane accepted the registration.
    pub async fn register_best_effort(&self) -> bool {
        info!(
            uri = %self.provisioner_url,
            capacity = self.registration.capacity_total,
            host = %self.registration.host,
            port = self.registration.port,
            "registering with control plane"
        );
        let accepted = match self.register().await {
            Ok(()) => {
                info!(uri = %self.provisioner_url, "successfully registered");
                true
            }
            Err(err @ (ControlPlaneError::Rejected { .. } | ControlPlaneError::NotFound)) => {
                warn!(uri = %self.provisioner_url, error = %err, "registration not accepted");
                false
            }
            Err(err) => {
                error!(uri = %self.provisioner_url, error = %err, "failed to register with control plane");
                false
            }
        };
        self.record("register", accepted);
        accepted
    }

    /// Unregister and log the outcome. Never retried.
    pub async fn unregister_best_effort(&self) -> bool {
        info!(uri = %self.provisioner_url, "unregistering from control plane");
        let accepted = match self.unregister().await {
            Ok(()) => {
                info!(uri = %self.provisioner_url, "successfully unregistered");
                true
            }
            Err(err @ (ControlPlaneError::Rejected { .. } | ControlPlaneError::NotFound)) => {
                warn!(uri = %self.provisioner_url, error = %err, "unregistration not accepted");
                false
            }
            Err(err) => {
                error!(uri = %self.provisioner_url, error = %err, "failed to unregister from control plane");
                false
            }
        };
        self.record("unregister", accepted);
        accepted
    }

    async fn execute(&self, request: RequestBuilder) -> Result<(), ControlPlaneError> {
        let response = request.header(USER_HEADER, &self.user_id).send().await?;
        let status = response.status();
        debug!(%status, url = %response.url(), "control plane responded");
        match status {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => Err(ControlPlaneError::NotFound),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ControlPlaneError::Rejected { status, body })
            }
        }
    }

    fn record(&self, kind: &str, accepted: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_registration(kind, if accepted { "ok" } else { "failed" });
        }
    }
}

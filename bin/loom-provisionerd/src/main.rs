//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the Loom provisioner daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use loom_agent::{
    AgentState, ControlPlaneClient, ProcessTenantManager, ProvisionerAgent, TenantContext,
};
use loom_api::spawn_api_server;
use loom_common::{init_tracing, AgentConfig, AgentIdentity};
use loom_metrics::{new_registry, AgentMetrics};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Loom provisioner agent", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "LOOM_PROVISIONER_URI", help = "Control plane base URI")]
    uri: Option<String>,

    #[arg(
        long,
        env = "LOOM_PROVISIONER_PORT",
        help = "Port advertised to the control plane and bound by the API"
    )]
    port: Option<u16>,

    #[arg(
        long,
        value_name = "DIR",
        env = "LOOM_PROVISIONER_LOG_DIR",
        help = "Directory for rolling log files"
    )]
    log_directory: Option<PathBuf>,

    #[arg(long, env = "LOOM_PROVISIONER_LOG_LEVEL", help = "Default log level")]
    log_level: Option<String>,

    #[arg(
        long,
        env = "LOOM_PROVISIONER_CAPACITY",
        help = "Total worker capacity advertised to the control plane"
    )]
    capacity: Option<u32>,
}

impl Cli {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(uri) = &self.uri {
            config.control_plane.uri = uri.clone();
        }
        if let Some(port) = self.port {
            config.agent.port = port;
        }
        if let Some(directory) = &self.log_directory {
            config.logging.directory = Some(directory.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(capacity) = self.capacity {
            config.agent.capacity_total = capacity;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        if !path.exists() {
            bail!("configuration file {} does not exist", path.display());
        }
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("/etc/loom/provisioner.toml"));
    candidates.push(PathBuf::from("conf/provisioner.toml"));

    let loaded = AgentConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    cli.apply(&mut config);
    config
        .validate()
        .context("invalid configuration after command line overrides")?;
    init_tracing("loom-provisionerd", &config.logging)?;

    let identity = AgentIdentity::detect()?;
    match &loaded.source {
        Some(path) => info!(agent = %identity, config_path = %path.display(), "configuration loaded"),
        None => info!(agent = %identity, "no configuration file found; using defaults"),
    }

    let registry = new_registry();
    let metrics = AgentMetrics::new(registry.clone())?;
    let context = TenantContext {
        agent: identity.clone(),
        workers: config.workers.clone(),
    };
    let state = Arc::new(
        AgentState::<ProcessTenantManager>::new(context).with_metrics(metrics.clone()),
    );
    let client = ControlPlaneClient::new(&config.control_plane, &config.agent, &identity)
        .context("failed to build control plane client")?
        .with_metrics(metrics);

    let listen = config.agent.api_listen();
    let agent = ProvisionerAgent::new(state, Arc::new(client), &config.agent);
    let report = agent
        .run(move |state| {
            let server = spawn_api_server(state, Some(registry), listen)?;
            info!(address = %server.addr(), "api server started");
            Ok(server.into())
        })
        .await?;

    if report.reap_timed_out {
        warn!("some workers were still running at exit");
    }
    Ok(())
}

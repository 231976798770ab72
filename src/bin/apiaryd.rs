//! The apiary daemon: load config, boot the persisted fleet, serve HTTP.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use apiary::demo::EchoAgent;
use apiary::{
    build_store, AgentClass, AgentHost, AgentRegistry, HostConfig, HostOptions, HttpRpcServer,
    HttpTransport, MethodAllowList,
};

#[derive(Parser)]
#[command(name = "apiaryd", version, about = "Agent hosting daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    apiary::logging::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => HostConfig::from_file(path)?,
        None => HostConfig::default(),
    }
    .apply_env()?;
    config.validate()?;

    let store = build_store(&config.state)?;
    let registry = Arc::new(AgentRegistry::new());
    registry.register::<EchoAgent>();

    let host = AgentHost::new(
        store,
        registry,
        HostOptions {
            request_timeout: config.request_timeout(),
            ..Default::default()
        },
    );
    host.register_transport(Arc::new(HttpTransport::new(host.callbacks().clone())));

    for seed in &config.agents {
        host.instantiation()
            .register(&seed.id, &seed.class_name, seed.params.clone())
            .await?;
        if let Some(allowed) = &seed.allowed_methods {
            host.set_authorizor(&seed.id, Arc::new(MethodAllowList::new(allowed.clone())));
        }
    }
    if config.agents.is_empty() {
        host.instantiation()
            .register("restagent", EchoAgent::CLASS_NAME, json!({}))
            .await?;
    }

    let boot = host.boot(config.scheduler.boot_workers).await;
    tracing::info!(priority_woken = boot.priority_woken, "priority boot done");
    tokio::spawn(async move {
        match boot.deferred.await {
            Ok(stats) => {
                tracing::info!(woken = stats.woken, skipped = stats.skipped, "deferred boot done");
            }
            Err(e) => tracing::error!(error = %e, "deferred boot task failed"),
        }
    });

    let server = HttpRpcServer::new(host.clone(), config.http.clone());
    let (addr, server_handle) = server.start().await?;
    tracing::info!(%addr, "apiaryd up");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    server_handle.abort();
    Ok(())
}

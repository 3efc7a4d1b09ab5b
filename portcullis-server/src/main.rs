//! Portcullis Server - Headless Gateway Daemon
//!
//! A pure Rust reverse proxy that:
//! - Resolves inbound requests to configured services by host+path
//! - Applies access control (API keys, JWT, IP filtering, quotas, sessions)
//! - Load-balances over upstream targets with a signed challenge exchange
//! - Streams bodies both ways and reports live per-service statistics

use anyhow::{Context, Result};
use clap::Parser;
use portcullis_core::env::{GatewayEnv, InstancePosition};
use portcullis_core::server::{build_gateway_router, run_maintenance};
use portcullis_core::store::{ConfigExport, Datastore};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;

use cli::{Cli, Commands};

/// Instance settings, distinct from the routed config entities.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct InstanceConfig {
    host: Option<String>,
    port: Option<u16>,
    provider: Option<String>,
    region: Option<String>,
    zone: Option<String>,
    data_center: Option<String>,
    rack: Option<String>,
    leader: Option<bool>,
    /// Export file loaded into the datastore at boot, before serving.
    /// Explicit only: nothing ever re-imports behind the operator's back.
    import_from: Option<PathBuf>,
}

fn init_logger(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    fmt().with_env_filter(filter).with_target(true).init();
}

fn load_instance_config(path: Option<&Path>) -> Result<InstanceConfig> {
    let Some(path) = path else {
        return Ok(InstanceConfig::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read instance config {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse instance config {}", path.display()))
}

fn load_export(path: &Path) -> Result<ConfigExport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read export {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse export {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level);

    if let Some(Commands::CheckImport { file }) = &cli.command {
        let export = load_export(file)?;
        println!(
            "export ok: {} services, {} api keys, {} groups",
            export.services.len(),
            export.apikeys.len(),
            export.groups.len()
        );
        return Ok(());
    }

    let instance = load_instance_config(cli.config.as_deref())?;
    let port = match &cli.command {
        Some(Commands::Serve { port }) => *port,
        _ => instance.port.unwrap_or(cli.port),
    };
    let host = instance.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());

    let datastore = Arc::new(Datastore::new());
    let import_path = cli.import.clone().or_else(|| instance.import_from.clone());
    if let Some(path) = import_path {
        let export = load_export(&path)?;
        tracing::info!("seeding datastore from {}", path.display());
        datastore.import(export).await;
    }

    let mut position = InstancePosition::default();
    if let Some(provider) = instance.provider {
        position.provider = provider;
    }
    if let Some(region) = instance.region {
        position.region = region;
    }
    if let Some(zone) = instance.zone {
        position.zone = zone;
    }
    if let Some(data_center) = instance.data_center {
        position.data_center = data_center;
    }
    if let Some(rack) = instance.rack {
        position.rack = rack;
    }

    let mut env = GatewayEnv::new(datastore, position);
    env.leader = instance.leader.unwrap_or(true);
    let env = Arc::new(env);

    let app = build_gateway_router(env.clone());
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    tracing::info!("portcullis gateway listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::spawn(run_maintenance(env));

    tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        ) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}

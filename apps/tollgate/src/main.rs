use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;

use tollgate_adapter::{UpstreamClientConfig, WreqUpstreamClient};
use tollgate_common::{GlobalConfig, GlobalConfigPatch, OptionFlags, RatioTables};
use tollgate_core::{AppState, RelayEngine};
use tollgate_router::relay_router;
use tollgate_store::{MemStore, OrmStore, SharedStore, Store};

use crate::cli::Cli;

/// Operator-provided pricing file: option flags plus the ratio tables.
#[derive(Debug, Default, Deserialize)]
struct PricingFile {
    #[serde(default)]
    options: Option<OptionFlags>,
    #[serde(default)]
    ratios: Option<RatioTables>,
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("tollgate failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    let config = merge_config(&cli)?;

    let store: SharedStore = if config.dsn.starts_with("memory://") {
        info!(event = "store_ready", backend = "memory");
        Arc::new(MemStore::new())
    } else {
        let orm = OrmStore::connect(&config.dsn).await?;
        orm.sync().await?;
        info!(event = "store_ready", backend = "sql", dsn = %config.dsn);
        Arc::new(orm)
    };

    let channels = store.load_channels().await?;
    info!(event = "channels_loaded", count = channels.len());

    let (options, ratios) = load_pricing(cli.pricing.as_deref())?;

    let client = WreqUpstreamClient::new(UpstreamClientConfig {
        proxy: config.proxy.clone(),
        connect_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(config.upstream_timeout_secs),
        stream_idle_timeout: Duration::from_secs(30),
    })?;

    let state = AppState::new(
        &config,
        store,
        Arc::new(client),
        options,
        ratios,
        channels,
    );
    let engine = RelayEngine::new(state);
    let router = relay_router(engine);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(event = "listening", addr = %addr);
    axum::serve(listener, router).await?;
    Ok(())
}

fn merge_config(cli: &Cli) -> Result<GlobalConfig, Box<dyn Error + Send + Sync>> {
    let mut patch = GlobalConfigPatch::default();
    patch.overlay(GlobalConfigPatch {
        host: Some(cli.host.clone()),
        port: Some(cli.port),
        dsn: Some(cli.dsn.clone()),
        proxy: cli.proxy.clone(),
        cache_ttl_secs: Some(cli.cache_ttl_secs),
        upstream_timeout_secs: Some(cli.upstream_timeout_secs),
    });
    Ok(patch.into_config()?)
}

fn load_pricing(
    path: Option<&str>,
) -> Result<(OptionFlags, RatioTables), Box<dyn Error + Send + Sync>> {
    let Some(path) = path else {
        return Ok((OptionFlags::default(), RatioTables::default()));
    };
    let text = std::fs::read_to_string(path)?;
    let file: PricingFile = serde_json::from_str(&text)?;
    info!(event = "pricing_loaded", path = %path);
    Ok((
        file.options.unwrap_or_default(),
        file.ratios.unwrap_or_default(),
    ))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::Result;
use crate::clock::SystemClock;
use crate::config::{Config, SourceConfig};
use crate::indexer::IndexingService;
use crate::reporting::Status;
use crate::server;

/// Placeholder shown instead of secrets
const REDACTED: &str = "********";

/// Default output path of `config init`
pub const DEFAULT_CONFIG_PATH: &str = "docsearch.yaml";

/// Reindex in the foreground, retries included
pub async fn reindex(config: &Config) -> Result<Status> {
    let service = IndexingService::from_config(config, Arc::new(SystemClock))?;

    let result = service.reindex().await;
    service.shutdown().await;
    let status = result?;

    match status {
        Status::Success => info!("Reindexing succeeded"),
        Status::Warning => warn!("Reindexing succeeded with warnings"),
        Status::Unstable | Status::Critical => error!("Reindexing failed"),
    }
    Ok(status)
}

/// Repair index aliases left behind by an interrupted reindex
pub async fn recover(config: &Config) -> Result<bool> {
    let service = IndexingService::from_config(config, Arc::new(SystemClock))?;

    let recovered = service.recover().await?;
    if recovered {
        info!("Index aliases recovered");
    } else {
        info!("Index aliases are consistent, nothing to recover");
    }
    Ok(recovered)
}

/// Recover, then serve the admin endpoint until Ctrl-C
pub async fn serve(config: &Config) -> Result<()> {
    let service = Arc::new(IndexingService::from_config(config, Arc::new(SystemClock))?);

    if service.recover().await? {
        info!("Index aliases recovered");
    }

    let listener = TcpListener::bind((
        config.indexing.admin_host.as_str(),
        config.indexing.admin_port,
    ))
    .await?;
    let served = server::serve(listener, service.clone(), shutdown_signal()).await;

    service.shutdown().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        return;
    }
    info!("Shutting down");
}

/// Print the effective configuration with secrets masked
pub fn config_show(config: &Config, json: bool) -> Result<()> {
    println!("{}", render_config(&redacted(config), json)?);
    Ok(())
}

/// Write a starter configuration file
pub fn config_init(output: Option<PathBuf>, force: bool) -> Result<PathBuf> {
    let path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    if path.exists() && !force {
        return Err(crate::Error::Config(format!(
            "{} already exists, use --force to overwrite",
            path.display()
        )));
    }

    let mut config = Config::default();
    config.fetching.primary = Some(SourceConfig::new("https://github.com/acme/site.git"));

    std::fs::write(&path, render_config(&config, is_json(&path))?)?;
    info!("Wrote configuration to {}", path.display());
    Ok(path)
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

fn render_config(config: &Config, json: bool) -> Result<String> {
    if json {
        Ok(serde_json::to_string_pretty(config)?)
    } else {
        Ok(serde_yaml::to_string(config)?)
    }
}

fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if config.backend.password.is_some() {
        config.backend.password = Some(REDACTED.to_string());
    }
    if let Some(github) = config.reporting.github.as_mut() {
        if !github.token.is_empty() {
            github.token = REDACTED.to_string();
        }
    }
    config
}

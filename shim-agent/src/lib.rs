//! Shim Agent Binary
//!
//! Standalone executable that runs the interception proxy in front of the
//! BOM web client. Configuration comes from an optional TOML file, then
//! `BOM_SHIM_*` environment variables, then command line flags.

use anyhow::{Context, Result};
use clap::Parser;
use shim_core::{CertificateAuthority, PolicyVariant, ProxyServer, ShimConfig};
use std::future::Future;
use std::path::{Path, PathBuf};

pub mod logging;


pub const ENV_PREFIX: &str = "BOM_SHIM_";

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Address to listen on for HTTP/HTTPS traffic
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Port to listen on for HTTP/HTTPS traffic
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Port to expose the Admin API (health/metrics)
    #[arg(long)]
    pub admin_port: Option<u16>,

    /// Origin of the self-hosted mirror (e.g. "http://192.168.1.100:8083")
    #[arg(long)]
    pub page_origin: Option<String>,

    /// Overlay sanitize policy: "drop" or "normalize"
    #[arg(long)]
    pub policy: Option<PolicyVariant>,

    /// Directory holding the CA certificate and key
    #[arg(long)]
    pub ca_dir: Option<PathBuf>,

    /// SQLite URL for a persistent tile cache
    #[arg(long)]
    pub tile_db: Option<String>,

    /// Disable the tile response cache
    #[arg(long)]
    pub no_tile_cache: bool,

    /// Emit JSON formatted logs
    #[arg(long)]
    pub log_json: bool,

    /// Also write logs to a daily rotated file in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

/// Read a TOML config file; a missing file is an error.
pub fn load_config_file(path: &Path) -> Result<ShimConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Apply `BOM_SHIM_*` overrides from `vars`. Unknown keys are ignored.
pub fn apply_env_overrides<I>(config: &mut ShimConfig, vars: I) -> Result<()>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        let Some(name) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        match name {
            "LISTEN_ADDRESS" => config.listen_address = value,
            "LISTEN_PORT" => config.listen_port = parse_env(&key, &value)?,
            "ADMIN_PORT" => config.admin_port = parse_env(&key, &value)?,
            "PAGE_ORIGIN" => config.page_origin = value,
            "CA_DIR" => config.ca_dir = value,
            "SANITIZE_POLICY" => {
                config.sanitize_policy = value
                    .parse()
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("Invalid {}", key))?
            }
            "TILE_CACHE_ENABLED" => config.tile_cache.enabled = parse_env(&key, &value)?,
            "TILE_CACHE_VERSION" => config.tile_cache.version = value,
            "TILE_CACHE_DB" => config.tile_cache.database_url = Some(value),
            "OVERLAY_MAX_ATTEMPTS" => config.overlay.max_attempts = parse_env(&key, &value)?,
            _ => tracing::debug!("Ignoring unknown setting {}", key),
        }
    }
    Ok(())
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, value))
}

pub fn apply_cli_overrides(config: &mut ShimConfig, args: &Args) {
    if let Some(addr) = &args.listen_addr {
        config.listen_address = addr.clone();
    }
    if let Some(port) = args.listen_port {
        config.listen_port = port;
    }
    if let Some(port) = args.admin_port {
        config.admin_port = port;
    }
    if let Some(origin) = &args.page_origin {
        config.page_origin = origin.clone();
    }
    if let Some(policy) = args.policy {
        config.sanitize_policy = policy;
    }
    if let Some(dir) = &args.ca_dir {
        config.ca_dir = dir.display().to_string();
    }
    if let Some(url) = &args.tile_db {
        config.tile_cache.database_url = Some(url.clone());
    }
    if args.no_tile_cache {
        config.tile_cache.enabled = false;
    }
}

/// File, then environment, then flags.
pub fn load_config<I>(args: &Args, vars: I) -> Result<ShimConfig>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut config = match &args.config {
        Some(path) => load_config_file(path)?,
        None => ShimConfig::default(),
    };
    apply_env_overrides(&mut config, vars)?;
    apply_cli_overrides(&mut config, args);

    // Fail early rather than on the first request.
    config
        .origin()
        .with_context(|| format!("Invalid page origin {}", config.page_origin))?;
    Ok(config)
}

pub async fn run_agent<F>(config: ShimConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!("Starting BOM shim agent...");
    tracing::info!("  Listen: {}:{}", config.listen_address, config.listen_port);
    tracing::info!("  Admin:  0.0.0.0:{}", config.admin_port);
    tracing::info!("  Mirror: {}", config.page_origin);
    tracing::info!(
        "  Tiles:  {}",
        if config.tile_cache.enabled {
            config.tile_cache.store_name()
        } else {
            "disabled".to_string()
        }
    );

    let ca = CertificateAuthority::load_or_create(Path::new(&config.ca_dir))
        .context("Failed to load or create CA")?;

    ProxyServer::new(config, ca)
        .run_until(shutdown)
        .await
        .context("Proxy server failed")
}

//! Configuration types and utilities

use crate::context::PageOrigin;
use crate::sanitizer::PolicyVariant;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Startup configuration for the shim.
/// Set once at startup; a page load never changes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShimConfig {
    /// Address the MITM proxy listens on
    pub listen_address: String,
    /// Port the MITM proxy listens on
    pub listen_port: u16,
    /// Admin API port
    pub admin_port: u16,
    /// Origin of the self-hosted mirror that replaces the vendor API
    pub page_origin: String,
    /// Directory holding the proxy CA certificate and key
    pub ca_dir: String,
    /// How the towns-and-cities overlay node is sanitized
    pub sanitize_policy: PolicyVariant,
    pub tile_cache: TileCacheConfig,
    pub overlay: OverlayConfig,
    /// Delay before the one-off sweep of cached base URL globals
    pub globals_sweep_delay_ms: u64,
    /// Upstream request timeout
    pub upstream_timeout_secs: u64,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 8080,
            admin_port: 9091,
            page_origin: "http://127.0.0.1:8083".to_string(),
            ca_dir: "./certs".to_string(),
            sanitize_policy: PolicyVariant::default(),
            tile_cache: TileCacheConfig::default(),
            overlay: OverlayConfig::default(),
            globals_sweep_delay_ms: 50,
            upstream_timeout_secs: 30,
        }
    }
}

impl ShimConfig {
    pub fn origin(&self) -> crate::Result<PageOrigin> {
        PageOrigin::parse(&self.page_origin)
    }

    pub fn globals_sweep_delay(&self) -> Duration {
        Duration::from_millis(self.globals_sweep_delay_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileCacheConfig {
    pub enabled: bool,
    /// Stores sharing this prefix belong to the tile cache
    pub store_prefix: String,
    pub version: String,
    /// TTL when a response has no usable `max-age`
    pub default_ttl_secs: u64,
    /// SQLite URL for a persistent cache; in-memory when unset
    pub database_url: Option<String>,
}

impl Default for TileCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store_prefix: "bom-map-tiles-".to_string(),
            version: "v1".to_string(),
            default_ttl_secs: 60,
            database_url: None,
        }
    }
}

impl TileCacheConfig {
    /// e.g. `bom-map-tiles-v1`
    pub fn store_name(&self) -> String {
        format!("{}{}", self.store_prefix, self.version)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_attempts: 120,
        }
    }
}

impl OverlayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

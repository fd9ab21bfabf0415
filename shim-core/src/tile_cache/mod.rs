//! Tile response cache
//!
//! Keeps recently fetched map tile images so the animation timeline can
//! replay frames without a network round trip. Entries are fresh while their
//! `date` header is within the TTL (`max-age` or the configured default);
//! stale entries are still served when the network fails or answers with an
//! error status.

mod storage;
mod worker;

pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use worker::{CacheWorker, WorkerMessage, WorkerState};

use crate::admin::Metrics;
use crate::config::TileCacheConfig;
use crate::context::PageOrigin;
use crate::error::NetworkError;
use crate::host::{FetchRequest, FetchResponse, Network};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

lazy_static! {
    static ref TILE_PATH: Regex =
        Regex::new(r"(?i)^/(apikey/v1/mapping/)?(timeseries|overlays|basemaps)/")
            .expect("tile path pattern is valid");
    static ref TILE_EXTENSION: Regex =
        Regex::new(r"(?i)\.(png|jpe?g|webp)$").expect("tile extension pattern is valid");
    static ref MAX_AGE: Regex =
        Regex::new(r"(?i)(?:^|[,\s])max-age\s*=\s*(\d+)").expect("max-age pattern is valid");
}

/// `METHOD url`, with any fragment removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &str, url: &str) -> Self {
        let url = url.split_once('#').map(|(head, _)| head).unwrap_or(url);
        CacheKey(format!("{}:{}", method.to_ascii_uppercase(), url))
    }

    pub fn for_request(request: &FetchRequest) -> Self {
        Self::new(&request.method, &request.url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// GET, same origin, tile path and image extension.
pub fn is_cacheable(request: &FetchRequest, origin: &PageOrigin) -> bool {
    if !request.method.eq_ignore_ascii_case("GET") {
        return false;
    }
    let Ok(url) = Url::parse(&request.url) else {
        return false;
    };
    origin.is_same_origin(&url)
        && TILE_PATH.is_match(url.path())
        && TILE_EXTENSION.is_match(url.path())
}

/// `max-age` in seconds, when present and positive.
pub fn parse_max_age(cache_control: Option<&str>) -> Option<u64> {
    let caps = MAX_AGE.captures(cache_control?)?;
    caps.get(1)?
        .as_str()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
}

pub fn ttl_for(response: &FetchResponse, default_ttl: Duration) -> Duration {
    parse_max_age(response.header("cache-control"))
        .map(Duration::from_secs)
        .unwrap_or(default_ttl)
}

/// Whether `response` may be served from cache at `now`.
///
/// Entries without a parseable `date`, or dated in the future, are never fresh.
pub fn is_fresh_at(response: &FetchResponse, now: DateTime<Utc>, default_ttl: Duration) -> bool {
    let Some(date) = response
        .header("date")
        .and_then(|raw| DateTime::parse_from_rfc2822(raw.trim()).ok())
    else {
        return false;
    };

    let age = now.signed_duration_since(date.with_timezone(&Utc));
    let Ok(age) = age.to_std() else {
        return false;
    };
    age <= ttl_for(response, default_ttl)
}

pub struct TileCache {
    origin: PageOrigin,
    config: TileCacheConfig,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    metrics: Arc<Metrics>,
}

impl TileCache {
    pub fn new(
        origin: PageOrigin,
        config: TileCacheConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
    ) -> Self {
        Self {
            origin,
            config,
            storage,
            network,
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store_name(&self) -> String {
        self.config.store_name()
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    pub fn is_cacheable(&self, request: &FetchRequest) -> bool {
        self.config.enabled && is_cacheable(request, &self.origin)
    }

    pub async fn handle(&self, request: FetchRequest) -> Result<FetchResponse, NetworkError> {
        self.handle_at(request, Utc::now()).await
    }

    /// `handle` with an explicit clock.
    pub async fn handle_at(
        &self,
        request: FetchRequest,
        now: DateTime<Utc>,
    ) -> Result<FetchResponse, NetworkError> {
        if !self.is_cacheable(&request) {
            return self.network.fetch(request).await;
        }

        let store = self.store_name();
        let key = CacheKey::for_request(&request);
        let default_ttl = self.config.default_ttl();

        let cached = match self.storage.get(&store, &key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Tile cache read failed for {}: {}", key, e);
                None
            }
        };

        if let Some(entry) = &cached {
            if is_fresh_at(entry, now, default_ttl) {
                debug!("Tile cache hit {}", key);
                self.metrics.tile_cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.clone());
            }
        }
        self.metrics.tile_cache_misses.fetch_add(1, Ordering::Relaxed);

        match self.network.fetch(request).await {
            Ok(response) if response.is_ok() => {
                let mut stored = response.clone();
                if stored.header("date").is_none() {
                    stored.set_header("date", now.to_rfc2822());
                }
                if let Err(e) = self.storage.put(&store, &key, &stored).await {
                    warn!("Tile cache write failed for {}: {}", key, e);
                }
                Ok(response)
            }
            Ok(response) => match cached {
                Some(stale) => {
                    debug!("Serving stale {} over status {}", key, response.status);
                    self.metrics
                        .tile_cache_stale_fallbacks
                        .fetch_add(1, Ordering::Relaxed);
                    Ok(stale)
                }
                None => Ok(response),
            },
            Err(e) => match cached {
                Some(stale) => {
                    warn!("Serving stale {} after network error: {}", key, e);
                    self.metrics
                        .tile_cache_stale_fallbacks
                        .fetch_add(1, Ordering::Relaxed);
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }
}

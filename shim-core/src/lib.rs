//! Shim Core Library
//!
//! Lets the unmodified BOM web client and its mapping library run against a
//! self-hosted mirror: vendor API calls are rewritten to the page origin,
//! telemetry is blocked, settings payloads are sanitized, the town-label
//! overlay is restored on demand and map tiles are cached.

pub mod admin;
pub mod blocked;
pub mod ca;
pub mod context;
pub mod flags;
pub mod handlers;
pub mod host;
pub mod interceptor;
pub mod overlay;
pub mod policy;
/// Core proxy functionality
pub mod proxy;
pub mod rewrite;
pub mod sanitizer;
pub mod session;
pub mod settings;
pub mod tile_cache;
pub mod widget;

/// Configuration types and utilities
pub mod config;

/// Error types for shim operations
pub mod error;

pub use admin::{Metrics, MetricsSnapshot};
pub use ca::CertificateAuthority;
pub use config::{OverlayConfig, ShimConfig, TileCacheConfig};
pub use context::{PageOrigin, RuleSet, RuntimeContext};
pub use error::{HostError, NetworkError, ShimError, StorageError};
pub use flags::{FlagSource, FlagSources, Resolution};
pub use handlers::InterceptHandler;
pub use host::{Element, FetchRequest, FetchResponse, GlobalScope, GlobalValue, Network, ReqwestNetwork};
pub use interceptor::{FetchOutcome, InterceptionLayer, Interceptor, InterceptorChain};
pub use overlay::{OverlayEngine, PollHandle, PollReport};
pub use policy::{BlockPolicy, BlockedKind, InteractionBlocker, ScriptVerdict};
pub use proxy::ProxyServer;
pub use rewrite::RewriteRule;
pub use sanitizer::{ActivePolicy, PolicyVariant, Sanitizer};
pub use session::PageSession;
pub use tile_cache::{CacheKey, CacheStorage, CacheWorker, MemoryStorage, SqliteStorage, TileCache};

/// Result type alias for shim operations
pub type Result<T> = std::result::Result<T, ShimError>;

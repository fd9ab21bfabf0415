use crate::{
    admin::{start_admin_server, Metrics},
    ca::CertificateAuthority,
    config::ShimConfig,
    context::RuntimeContext,
    error::ShimError,
    handlers::InterceptHandler,
    host::{Network, ReqwestNetwork},
    tile_cache::{CacheStorage, CacheWorker, MemoryStorage, SqliteStorage, TileCache},
    Result,
};
use hudsucker::{certificate_authority::RcgenAuthority, rustls, ProxyBuilder};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info};

pub struct ProxyServer {
    config: ShimConfig,
    ca: CertificateAuthority,
    metrics: Arc<Metrics>,
}

impl ProxyServer {
    pub fn new(config: ShimConfig, ca: CertificateAuthority) -> Self {
        Self {
            config,
            ca,
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Open the configured storage and run the worker's install/activate steps.
    async fn build_tile_cache(&self, ctx: &RuntimeContext) -> Result<Option<Arc<TileCache>>> {
        let config = &self.config.tile_cache;
        if !config.enabled {
            info!("Tile cache disabled");
            return Ok(None);
        }

        let storage: Arc<dyn CacheStorage> = match &config.database_url {
            Some(url) => Arc::new(SqliteStorage::connect(url).await?),
            None => Arc::new(MemoryStorage::new()),
        };
        let network: Arc<dyn Network> =
            Arc::new(ReqwestNetwork::new(self.config.upstream_timeout())?);

        let cache = Arc::new(
            TileCache::new(ctx.origin().clone(), config.clone(), storage, network)
                .with_metrics(Arc::clone(&self.metrics)),
        );

        let worker = CacheWorker::new(Arc::clone(&cache), config.store_prefix.clone());
        worker.install();
        worker.activate().await?;
        Ok(Some(cache))
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending::<()>()).await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let ip: IpAddr = self.config.listen_address.parse().map_err(|e| {
            ShimError::Configuration(format!(
                "Invalid listen address {}: {}",
                self.config.listen_address, e
            ))
        })?;
        let addr = SocketAddr::new(ip, self.config.listen_port);

        let origin = self.config.origin()?;
        let ctx = Arc::new(RuntimeContext::new(
            origin,
            self.config.sanitize_policy,
            false,
        ));
        info!(
            "Rewriting vendor API to {} ({:?} policy)",
            ctx.origin(),
            self.config.sanitize_policy
        );

        let admin_port = self.config.admin_port;
        let metrics = Arc::clone(&self.metrics);
        tokio::spawn(async move {
            if let Err(e) = start_admin_server(admin_port, metrics).await {
                error!("Admin server failed: {}", e);
            }
        });

        let mut handler = InterceptHandler::new(Arc::clone(&ctx), Arc::clone(&self.metrics));
        if let Some(cache) = self.build_tile_cache(&ctx).await? {
            handler = handler.with_tile_cache(cache);
        }

        // Hudsucker/Rustls expects DER, not PEM.
        let private_key = rustls::PrivateKey(self.ca.key_der());
        let ca_cert = rustls::Certificate(self.ca.cert_der()?);
        let authority = RcgenAuthority::new(private_key, ca_cert, 1000).map_err(|e| {
            ShimError::Certificate(format!("Failed to create CA authority: {}", e))
        })?;
        info!(
            "Starting interception proxy on {} (trust {})",
            addr,
            self.ca.cert_path().display()
        );

        let proxy = ProxyBuilder::new()
            .with_addr(addr)
            .with_rustls_client()
            .with_ca(authority)
            .with_http_handler(handler)
            .build();

        proxy
            .start(shutdown)
            .await
            .map_err(|e| ShimError::Proxy(e.to_string()))?;

        info!("Interception proxy stopped");
        Ok(())
    }
}

//! Process wiring: providers, configuration watcher, router manager and entrypoint.
//!
//! Lifecycle is `build -> start -> wait -> close`. [`GatewayServer::start`] loads the first
//! configuration synchronously through every provider's `get_config`, installs the resulting
//! routers, then hands live updates over to the [`ConfigurationWatcher`].
use std::{net::SocketAddr, sync::Arc};

use eyre::{Result, WrapErr, eyre};
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{
        config_providers::FileProvider, entrypoint::EntrypointServer,
        http_client::HttpClientAdapter, http_proxy::HttpProxyHandler,
        middleware::BuiltinMiddleware, route_data::SnapshotRouteData,
    },
    config::{
        ConfigurationValidator, validate_settings,
        models::Configuration,
        settings::Settings,
    },
    core::{
        aggregator::ProviderAggregator, load_balancer::BalancerFactory,
        protocol::ProtocolFactory, router_manager::RouterManager,
        watcher::ConfigurationWatcher,
    },
    ports::{
        config_provider::Provider, http_client::HttpClient, middleware::MiddlewareCatalog,
        route_data::RouteResourceData,
    },
    utils::{
        buffer_pool::BufferPool,
        graceful_shutdown::GracefulShutdown,
        routines::{PoolError, RoutinePool},
    },
};

pub struct GatewayServerBuilder {
    settings: Settings,
    providers: Vec<Arc<dyn Provider>>,
    http_client: Option<Arc<dyn HttpClient>>,
    protocols: Option<ProtocolFactory>,
    balancers: Option<BalancerFactory>,
    route_data: Option<Arc<dyn RouteResourceData>>,
    middleware: Option<Arc<dyn MiddlewareCatalog>>,
    token: Option<CancellationToken>,
}

impl GatewayServerBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            providers: Vec::new(),
            http_client: None,
            protocols: None,
            balancers: None,
            route_data: None,
            middleware: None,
            token: None,
        }
    }

    /// Register a provider in addition to the one described by the settings
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Replace the default protocol handlers (reverse proxy only)
    pub fn with_protocols(mut self, protocols: ProtocolFactory) -> Self {
        self.protocols = Some(protocols);
        self
    }

    pub fn with_balancers(mut self, balancers: BalancerFactory) -> Self {
        self.balancers = Some(balancers);
        self
    }

    pub fn with_route_data(mut self, route_data: Arc<dyn RouteResourceData>) -> Self {
        self.route_data = Some(route_data);
        self
    }

    /// Replace the built-in middleware catalog
    pub fn with_middleware(mut self, middleware: Arc<dyn MiddlewareCatalog>) -> Self {
        self.middleware = Some(middleware);
        self
    }

    /// Root cancellation token; cancelling it shuts the gateway down
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub async fn build(self) -> Result<GatewayServer> {
        validate_settings(&self.settings).wrap_err("Invalid gateway settings")?;
        let settings = self.settings;

        let mut aggregator = ProviderAggregator::new(settings.providers.throttle_duration);
        if let Some(file) = &settings.providers.file {
            let provider = FileProvider::from_settings(file)?;
            aggregator.add_provider(Arc::new(provider)).await?;
        }
        for provider in self.providers {
            aggregator.add_provider(provider).await?;
        }
        if aggregator.is_empty() {
            return Err(eyre!("No configuration provider configured"));
        }
        if let Some(required) = &settings.providers.required {
            if !aggregator.provider_names().iter().any(|name| name == required) {
                return Err(eyre!(
                    "Required provider '{required}' is not configured (have: {:?})",
                    aggregator.provider_names()
                ));
            }
        }

        let protocols = match self.protocols {
            Some(protocols) => protocols,
            None => {
                let client = self
                    .http_client
                    .unwrap_or_else(|| Arc::new(HttpClientAdapter::new()));
                let proxy = HttpProxyHandler::new(
                    client,
                    settings.backend.timeout,
                    BufferPool::new(settings.backend.max_idle_buffers),
                )
                .with_max_body_bytes(settings.backend.max_body_bytes);
                ProtocolFactory::new().with_handler(Arc::new(proxy))
            }
        };
        let route_data = self
            .route_data
            .unwrap_or_else(|| Arc::new(SnapshotRouteData));
        let router_manager = RouterManager::new(
            Arc::new(protocols),
            Arc::new(self.balancers.unwrap_or_default()),
            route_data,
            self.middleware
                .unwrap_or_else(|| Arc::new(BuiltinMiddleware)),
        );

        let token = self.token.unwrap_or_default();
        let entrypoint = EntrypointServer::new(&settings.entrypoint, token.child_token());

        Ok(GatewayServer {
            pool: RoutinePool::new(token.clone()),
            shutdown: GracefulShutdown::new(token.clone()),
            token,
            aggregator: Arc::new(aggregator),
            router_manager: Arc::new(router_manager),
            entrypoint: Arc::new(entrypoint),
            settings,
        })
    }
}

pub struct GatewayServer {
    settings: Settings,
    token: CancellationToken,
    pool: RoutinePool,
    shutdown: GracefulShutdown,
    aggregator: Arc<ProviderAggregator>,
    router_manager: Arc<RouterManager>,
    entrypoint: Arc<EntrypointServer>,
}

impl GatewayServer {
    pub fn builder(settings: Settings) -> GatewayServerBuilder {
        GatewayServerBuilder::new(settings)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn entrypoint(&self) -> &Arc<EntrypointServer> {
        &self.entrypoint
    }

    /// Load, validate and install the initial configuration. Any failure here is fatal.
    pub async fn bootstrap(&self) -> Result<Arc<Configuration>> {
        let message = self
            .aggregator
            .get_config()
            .await
            .wrap_err("Failed to load initial configuration")?;
        let config = message.configuration.unwrap_or_default();
        ConfigurationValidator::validate(&config).wrap_err("Invalid initial configuration")?;

        let handler = self
            .router_manager
            .create_routers(&config)
            .wrap_err("Failed to build initial routers")?;
        self.entrypoint.switch_router(handler);
        tracing::info!(services = config.services.len(), "Initial configuration applied");
        Ok(config)
    }

    /// Bootstrap, start watching for changes and begin accepting connections.
    pub async fn start(&self) -> Result<SocketAddr> {
        let initial = self.bootstrap().await?;

        let provider: Arc<dyn Provider> = self.aggregator.clone();
        let mut watcher = ConfigurationWatcher::new(
            self.pool.clone(),
            provider,
            self.settings.providers.required.clone(),
        )
        .with_panic_policy(self.settings.listener_panic_policy)
        .with_applied(initial);

        let manager = self.router_manager.clone();
        let entrypoint = self.entrypoint.clone();
        watcher.add_listener(move |config| match manager.create_routers(config) {
            Ok(handler) => entrypoint.switch_router(handler),
            Err(e) => tracing::error!(
                error = ?e,
                "Failed to rebuild routers, keeping the active ones"
            ),
        });

        let addr = self.entrypoint.start().await?;
        watcher.start()?;

        let shutdown = self.shutdown.clone();
        self.pool.go_ctx("signal-handler", move |_token| async move {
            if let Some(reason) = shutdown.run_signal_handler().await {
                tracing::info!(?reason, "Shutdown requested");
            }
        });

        Ok(addr)
    }

    /// Resolve once the root token is cancelled
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Drain the entrypoint, then stop background tasks within the shutdown timeout.
    pub async fn close(&self) -> Result<(), PoolError> {
        self.token.cancel();
        self.entrypoint.stop().await;
        self.pool.stop(self.settings.shutdown.timeout).await?;
        tracing::info!("Gateway stopped");
        Ok(())
    }

    /// Start, serve until shutdown, then close; aborts the process if tasks do not stop in time.
    pub async fn run(&self) -> Result<()> {
        let addr = self.start().await?;
        tracing::info!(address = %addr, "Gateway ready");
        self.wait().await;

        if let Err(e) = self.close().await {
            tracing::error!(error = %e, "Background tasks did not stop, aborting");
            std::process::abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use tempfile::tempdir;

    use super::*;
    use crate::config::settings::FileProviderSettings;

    fn settings_for(file: std::path::PathBuf) -> Settings {
        let mut settings = Settings::default();
        settings.entrypoint.address = "127.0.0.1:0".to_string();
        settings.shutdown.timeout = Duration::from_secs(2);
        settings.providers.file = Some(FileProviderSettings {
            filename: Some(file),
            directory: None,
            watch: false,
            throttle_duration: None,
        });
        settings
    }

    #[tokio::test]
    async fn test_build_requires_a_provider() {
        let mut settings = Settings::default();
        settings.providers.required = None;
        let err = GatewayServer::builder(settings).build().await.err().unwrap();
        assert!(err.to_string().contains("No configuration provider"));
    }

    #[tokio::test]
    async fn test_build_rejects_unknown_required_provider() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dynamic.yaml");
        fs::write(&path, "services: {}\n").unwrap();

        let mut settings = settings_for(path);
        settings.providers.required = Some("consul".to_string());
        let err = GatewayServer::builder(settings).build().await.err().unwrap();
        assert!(err.to_string().contains("consul"));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dynamic.yaml");
        fs::write(&path, "services: [not, a, map]\n").unwrap();

        let server = GatewayServer::builder(settings_for(path)).build().await.unwrap();
        assert!(server.start().await.is_err());
    }

    #[tokio::test]
    async fn test_start_and_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dynamic.yaml");
        fs::write(
            &path,
            "services:\n  orders:\n    routers:\n      - path: /orders\n    servers:\n      - host: 127.0.0.1\n        port: 9\n",
        )
        .unwrap();

        let server = GatewayServer::builder(settings_for(path)).build().await.unwrap();
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);

        server.close().await.unwrap();
        assert!(server.token().is_cancelled());
    }
}

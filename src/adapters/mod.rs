pub mod config_providers;
pub mod entrypoint;
pub mod http_client;
pub mod http_proxy;
pub mod middleware;
pub mod route_data;

/// Re-export commonly used types from adapters
pub use config_providers::FileProvider;
pub use entrypoint::EntrypointServer;
pub use http_client::HttpClientAdapter;
pub use http_proxy::HttpProxyHandler;
pub use middleware::BuiltinMiddleware;
pub use route_data::SnapshotRouteData;

pub mod config_provider;
pub mod http_client;
pub mod middleware;
pub mod route_data;

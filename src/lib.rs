//! Portway - an API gateway and reverse proxy with live configuration reload.
//!
//! Dynamic configuration (services, routes, backends, middleware) arrives from one or more
//! providers, is merged into a single snapshot and compiled into a dispatch handler that
//! replaces the active one atomically. Requests already in flight finish on the handler they
//! started with.
//!
//! # Features
//! - Static, param (`:id`, optionally `:id(regex)`), wildcard and nested subrouter routes
//! - Round-robin, weighted-random, ip-hash and random load balancing per service
//! - Built-in middleware (`recovery`, `errorhandler`, `logging`, `requestid`, `securityheaders`)
//!   selected by name at global, service or route level
//! - File and directory providers with filesystem watching, SIGHUP re-read and throttling
//! - Stable JSON error codes for every gateway-generated failure
//! - Structured tracing via `tracing`
//! - Graceful shutdown with bounded drain
//!
//! # Quick Example
//! ```no_run
//! use portway::{GatewayServer, config::load_settings};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let settings = load_settings("portway.yaml")?;
//! let server = GatewayServer::builder(settings).build().await?;
//! server.run().await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! routing, balancing and the configuration pipeline inside `core`.
//!
//! # Error Handling
//! Fallible APIs return `eyre::Result<T>` or a domain specific error type. Errors returned to
//! clients are [`core::errors::GatewayError`] values rendered as `{code, message}`.
//!
//! # Concurrency & Data Structures
//! The active handler lives behind `arc_swap::ArcSwap`; the service to balancer map uses
//! `scc::HashMap` so one service's refresh does not block traffic to the others.

pub mod adapters;
pub mod config;
pub mod core;
pub mod ports;
pub mod server;
pub mod tracing_setup;
pub mod utils;

pub use crate::{
    adapters::{EntrypointServer, FileProvider, HttpClientAdapter, HttpProxyHandler},
    config::{Configuration, Settings},
    core::{
        ConfigurationWatcher, GatewayError, ProviderAggregator, RouterManager, SharedHandler,
    },
    server::{GatewayServer, GatewayServerBuilder},
};

//! HTTP entrypoint whose request handler can be replaced while it serves traffic.
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use arc_swap::ArcSwap;
use axum::{extract::Request, response::IntoResponse};
use eyre::{Result, WrapErr};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::{
    config::settings::EntrypointSettings,
    core::{
        errors::{ErrorCode, GatewayError},
        handler::{HandlerFuture, SharedHandler, handler_fn},
    },
};

/// Handler installed until the first configuration is applied
fn unconfigured() -> SharedHandler {
    handler_fn(|_req: Request| async {
        GatewayError::with_detail(ErrorCode::ROUTE_NOT_FOUND, "no configuration applied yet")
            .into_response()
    })
}

pub struct EntrypointServer {
    address: String,
    drain_timeout: Duration,
    handler: Arc<ArcSwap<SharedHandler>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EntrypointServer {
    /// `token` stops accepting connections when cancelled
    pub fn new(settings: &EntrypointSettings, token: CancellationToken) -> Self {
        Self {
            address: settings.address.clone(),
            drain_timeout: settings.drain_timeout,
            handler: Arc::new(ArcSwap::from_pointee(unconfigured())),
            shutdown: token,
            task: Mutex::new(None),
        }
    }

    /// Atomically replace the live dispatch handler.
    ///
    /// In-flight requests finish on the handler they started with.
    pub fn switch_router(&self, handler: SharedHandler) {
        self.handler.store(Arc::new(handler));
        tracing::info!(address = %self.address, "Router switched");
    }

    /// Bind and start serving in the background, returning the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.address)
            .await
            .wrap_err_with(|| format!("Failed to bind entrypoint on {}", self.address))?;
        let local_addr = listener
            .local_addr()
            .wrap_err("Failed to read entrypoint local address")?;

        let current = self.handler.clone();
        let app = axum::Router::new()
            .fallback(move |req: Request| current.load_full().call(req))
            .layer(TraceLayer::new_for_http());

        let shutdown = self.shutdown.clone();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await });

        let task = tokio::spawn(async move {
            if let Err(e) = server.await {
                tracing::error!(error = %e, "Entrypoint server error");
            }
        });
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        tracing::info!(address = %local_addr, "Entrypoint listening");
        Ok(local_addr)
    }

    /// Stop accepting connections and drain in-flight requests within the drain timeout.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut task) = task else {
            return;
        };

        match tokio::time::timeout(self.drain_timeout, &mut task).await {
            Ok(_) => tracing::info!(address = %self.address, "Entrypoint stopped"),
            Err(_) => {
                tracing::warn!(
                    address = %self.address,
                    timeout = ?self.drain_timeout,
                    "Drain timeout exceeded, aborting open connections"
                );
                task.abort();
            }
        }
    }

    /// Serve one request with the currently installed handler
    pub fn dispatch(&self, req: Request) -> HandlerFuture {
        self.handler.load_full().call(req)
    }
}

//! Terminal request handling for matched routes.
use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::Request, response::Response};

use crate::{config::models::ServiceRoute, core::upstream::UpstreamResolver};

/// Everything a protocol handler needs to dispatch one matched route
#[derive(Clone)]
pub struct DispatchContext {
    pub service_name: String,
    pub service: Arc<ServiceRoute>,
    /// Backend path template (`:name` / `*` are filled from the route match)
    pub proxy_path: Option<String>,
    pub upstreams: Arc<UpstreamResolver>,
}

/// Forwards a matched request to a backend.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Whether this handler should process `req`
    fn supports(&self, req: &Request) -> bool;

    async fn handle(&self, req: Request, ctx: Arc<DispatchContext>) -> Response;
}

/// Ordered list of protocol handlers
#[derive(Default, Clone)]
pub struct ProtocolFactory {
    handlers: Vec<Arc<dyn ProtocolHandler>>,
}

impl ProtocolFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        tracing::debug!(handler = handler.name(), "Registered protocol handler");
        self.handlers.push(handler);
    }

    /// First handler whose `supports` accepts `req`
    pub fn get_handler(&self, req: &Request) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.iter().find(|h| h.supports(req)).cloned()
    }

    /// First registered handler, regardless of the request
    pub fn default_handler(&self) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.first().cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::{Method, header};

    use super::*;
    use crate::core::handler::empty_request;

    struct Named {
        name: &'static str,
        upgrade_only: bool,
    }

    #[async_trait]
    impl ProtocolHandler for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn supports(&self, req: &Request) -> bool {
            req.headers().contains_key(header::UPGRADE) == self.upgrade_only
        }

        async fn handle(&self, _req: Request, _ctx: Arc<DispatchContext>) -> Response {
            Response::new(Body::from(self.name))
        }
    }

    #[test]
    fn test_first_supporting_handler_wins() {
        let factory = ProtocolFactory::new()
            .with_handler(Arc::new(Named {
                name: "http",
                upgrade_only: false,
            }))
            .with_handler(Arc::new(Named {
                name: "websocket",
                upgrade_only: true,
            }));

        let plain = empty_request(Method::GET, "/");
        assert_eq!(factory.get_handler(&plain).unwrap().name(), "http");

        let mut upgrade = empty_request(Method::GET, "/");
        upgrade
            .headers_mut()
            .insert(header::UPGRADE, "websocket".parse().unwrap());
        assert_eq!(factory.get_handler(&upgrade).unwrap().name(), "websocket");
        assert_eq!(factory.default_handler().unwrap().name(), "http");
    }

    #[test]
    fn test_empty_factory() {
        let factory = ProtocolFactory::new();
        assert!(factory.is_empty());
        assert!(factory.get_handler(&empty_request(Method::GET, "/")).is_none());
        assert!(factory.default_handler().is_none());
    }
}

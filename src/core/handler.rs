//! Request handler abstraction shared by the router, middleware and entrypoint.
use std::{future::Future, sync::Arc};

use axum::{body::Body, extract::Request, response::Response};
use futures_util::future::{BoxFuture, FutureExt};

/// Future returned by every [`Handler`]
pub type HandlerFuture = BoxFuture<'static, Response>;

/// Something that turns a request into a response.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request) -> HandlerFuture;
}

/// Reference-counted, type-erased handler
pub type SharedHandler = Arc<dyn Handler>;

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn call(&self, req: Request) -> HandlerFuture {
        (self.0)(req).boxed()
    }
}

/// Wrap an async closure into a [`SharedHandler`].
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Build a `Request` for tests and internal probes.
pub fn empty_request(method: http::Method, uri: &str) -> Request {
    let mut req = Request::new(Body::empty());
    *req.method_mut() = method;
    if let Ok(uri) = uri.parse() {
        *req.uri_mut() = uri;
    }
    req
}

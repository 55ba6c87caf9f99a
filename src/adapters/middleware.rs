//! Built-in middleware available by name in dynamic configuration.
//!
//! | name              | effect                                                         |
//! |-------------------|----------------------------------------------------------------|
//! | `recovery`        | turns a panic below it into a `1001` JSON response              |
//! | `errorhandler`    | logs gateway errors with request context and internal detail    |
//! | `logging`         | request span plus start/finish log lines with latency           |
//! | `requestid`       | ensures an `X-Request-ID` on the request and the response       |
//! | `securityheaders` | adds common hardening headers to responses                      |
use std::{
    any::Any,
    backtrace::Backtrace,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Instant,
};

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use futures_util::FutureExt;
use tracing::Instrument;

use crate::{
    core::{
        errors::GatewayError,
        handler::{SharedHandler, handler_fn},
        middleware::Middleware,
    },
    ports::middleware::MiddlewareCatalog,
    tracing_setup::create_request_span,
};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Look up a built-in wrapper by lower-case name
pub fn builtin(name: &str) -> Option<Middleware> {
    let wrapper: Middleware = match name {
        "recovery" => Arc::new(recovery),
        "errorhandler" => Arc::new(error_handler),
        "logging" => Arc::new(logging),
        "requestid" => Arc::new(request_id),
        "securityheaders" => Arc::new(security_headers),
        _ => return None,
    };
    Some(wrapper)
}

/// Catalog of the wrappers listed in the module table
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinMiddleware;

impl MiddlewareCatalog for BuiltinMiddleware {
    fn lookup(&self, name: &str) -> Option<Middleware> {
        builtin(name)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn recovered(payload: Box<dyn Any + Send>, method: &str, path: &str) -> Response {
    tracing::error!(
        http.method = method,
        http.path = path,
        panic = %panic_message(payload.as_ref()),
        backtrace = %Backtrace::force_capture(),
        "Recovered from panic while handling request"
    );
    GatewayError::internal(panic_message(payload.as_ref())).into_response()
}

/// Catch panics raised while building or polling the inner handler's future.
pub fn recovery(next: SharedHandler) -> SharedHandler {
    handler_fn(move |req: Request| {
        let next = next.clone();
        async move {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();

            let future = match catch_unwind(AssertUnwindSafe(|| next.call(req))) {
                Ok(future) => future,
                Err(payload) => return recovered(payload, &method, &path),
            };
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(response) => response,
                Err(payload) => recovered(payload, &method, &path),
            }
        }
    })
}

/// Log every gateway error passing through, including the detail withheld from clients.
pub fn error_handler(next: SharedHandler) -> SharedHandler {
    handler_fn(move |req: Request| {
        let next = next.clone();
        async move {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let response = next.call(req).await;

            if let Some(err) = response.extensions().get::<GatewayError>() {
                let detail = err.detail.as_deref().unwrap_or("");
                if err.status().is_server_error() {
                    tracing::error!(
                        http.method = %method,
                        http.path = %path,
                        error.code = err.code.code,
                        http.status_code = err.status().as_u16(),
                        detail,
                        "{}",
                        err.code.message
                    );
                } else {
                    tracing::warn!(
                        http.method = %method,
                        http.path = %path,
                        error.code = err.code.code,
                        http.status_code = err.status().as_u16(),
                        detail,
                        "{}",
                        err.code.message
                    );
                }
            }
            response
        }
    })
}

/// Log start/end of a request including latency.
pub fn logging(next: SharedHandler) -> SharedHandler {
    handler_fn(move |req: Request| {
        let next = next.clone();
        let request_id = req
            .headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        let span = create_request_span(req.method().as_str(), req.uri().path(), &request_id);
        async move {
            let start = Instant::now();
            let method = req.method().clone();
            let uri = req.uri().clone();
            tracing::info!("Started processing {} {}", method, uri);

            let response = next.call(req).await;
            let elapsed = start.elapsed();

            let span = tracing::Span::current();
            span.record("http.status_code", response.status().as_u16());
            span.record("duration_ms", elapsed.as_millis() as u64);
            tracing::info!(
                "Completed {} {} - {} in {:?}",
                method,
                uri,
                response.status(),
                elapsed
            );
            response
        }
        .instrument(span)
    })
}

/// Reuse the caller's `X-Request-ID` or generate one, and echo it on the response.
pub fn request_id(next: SharedHandler) -> SharedHandler {
    handler_fn(move |mut req: Request| {
        let next = next.clone();
        async move {
            let value = match req.headers().get(&REQUEST_ID_HEADER) {
                Some(existing) => existing.clone(),
                None => {
                    let generated = uuid::Uuid::new_v4().to_string();
                    match HeaderValue::from_str(&generated) {
                        Ok(value) => value,
                        Err(_) => return next.call(req).await,
                    }
                }
            };
            req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());

            let mut response = next.call(req).await;
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
            response
        }
    })
}

/// Add common security hardening headers.
pub fn security_headers(next: SharedHandler) -> SharedHandler {
    handler_fn(move |req: Request| {
        let next = next.clone();
        async move {
            let mut response = next.call(req).await;
            let headers = response.headers_mut();
            headers.insert(
                "X-Content-Type-Options",
                HeaderValue::from_static("nosniff"),
            );
            headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
            headers.insert(
                "Referrer-Policy",
                HeaderValue::from_static("strict-origin-when-cross-origin"),
            );
            response
        }
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::{Method, StatusCode};
    use http_body_util::BodyExt;

    use super::*;
    use crate::core::{
        errors::{ErrorBody, ErrorCode},
        handler::empty_request,
    };

    fn ok_handler() -> SharedHandler {
        handler_fn(|_req: Request| async { Response::new(Body::from("ok")) })
    }

    fn panicking_handler() -> SharedHandler {
        handler_fn(|req: Request| async move {
            if req.uri().path() == "/boom" {
                panic!("terminal handler exploded");
            }
            Response::new(Body::empty())
        })
    }

    #[tokio::test]
    async fn test_recovery_converts_async_panic() {
        let handler = recovery(panicking_handler());
        let response = handler.call(empty_request(Method::GET, "/boom")).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: ErrorBody = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, ErrorCode::INTERNAL_SERVER_ERROR.code);
        assert!(!String::from_utf8_lossy(&bytes).contains("exploded"));
    }

    #[tokio::test]
    async fn test_recovery_converts_sync_panic() {
        struct Exploding;
        impl crate::core::handler::Handler for Exploding {
            fn call(&self, _req: Request) -> crate::core::handler::HandlerFuture {
                panic!("before the future exists")
            }
        }

        let handler = recovery(Arc::new(Exploding));
        let response = handler.call(empty_request(Method::GET, "/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_recovery_passes_through_normal_responses() {
        let handler = recovery(ok_handler());
        let response = handler.call(empty_request(Method::GET, "/")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_error_handler_keeps_structured_errors() {
        let failing = handler_fn(|_req: Request| async {
            GatewayError::with_detail(ErrorCode::BACKEND_TIMEOUT, "10.0.0.9:80").into_response()
        });
        let response = error_handler(failing)
            .call(empty_request(Method::GET, "/slow"))
            .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(response.extensions().get::<GatewayError>().is_some());
    }

    #[tokio::test]
    async fn test_request_id_generated_and_propagated() {
        let echo = handler_fn(|req: Request| async move {
            let seen = req
                .headers()
                .get(&REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Response::new(Body::from(seen))
        });
        let response = request_id(echo).call(empty_request(Method::GET, "/")).await;

        let header = response
            .headers()
            .get(&REQUEST_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(uuid::Uuid::parse_str(&header).is_ok());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(String::from_utf8_lossy(&bytes), header);
    }

    #[tokio::test]
    async fn test_request_id_reuses_incoming_value() {
        let mut req = empty_request(Method::GET, "/");
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        let response = request_id(ok_handler()).call(req).await;
        assert_eq!(response.headers()[&REQUEST_ID_HEADER], "abc-123");
    }

    #[tokio::test]
    async fn test_security_headers() {
        let response = security_headers(ok_handler())
            .call(empty_request(Method::GET, "/"))
            .await;
        let headers = response.headers();
        assert!(headers.contains_key("X-Content-Type-Options"));
        assert!(headers.contains_key("X-Frame-Options"));
        assert!(headers.contains_key("Referrer-Policy"));
    }

    #[tokio::test]
    async fn test_logging_passes_response_through() {
        let response = logging(ok_handler())
            .call(empty_request(Method::POST, "/orders"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_builtin_names() {
        for name in ["recovery", "errorhandler", "logging", "requestid", "securityheaders"] {
            assert!(builtin(name).is_some(), "{name}");
        }
        assert!(builtin("cors").is_none());
        assert!(BuiltinMiddleware.lookup("requestid").is_some());
        assert!(BuiltinMiddleware.lookup("cors").is_none());
    }
}

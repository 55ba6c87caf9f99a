use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Pooled plain-HTTP client for backend calls.
///
/// * Rewrites `Host` to the backend authority
/// * Sends HTTP/1.1 upstream regardless of the inbound version
/// * Strips `Transfer-Encoding` from responses; the downstream server re-frames the body
#[derive(Clone)]
pub struct HttpClientAdapter {
    client: Client<HttpConnector, AxumBody>,
}

impl HttpClientAdapter {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build::<_, AxumBody>(connector);

        tracing::debug!("Created backend HTTP client");
        Self { client }
    }
}

impl Default for HttpClientAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let Some(host) = req.uri().host() else {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        };
        let authority = match req.uri().port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let host_value = HeaderValue::from_str(&authority)
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        req.headers_mut().insert(header::HOST, host_value);

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        tracing::debug!("Sending request: {} {}", parts.method, parts.uri);

        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| HttpClientError::ConnectionError(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        parts.headers.remove(header::TRANSFER_ENCODING);
        Ok(Response::from_parts(parts, AxumBody::new(body)))
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, routing::get};
    use http_body_util::BodyExt;

    use super::*;

    #[tokio::test]
    async fn test_rejects_relative_uri() {
        let client = HttpClientAdapter::new();
        let req = Request::builder()
            .uri("/relative")
            .body(AxumBody::empty())
            .unwrap();
        let err = client.send_request(req).await.unwrap_err();
        assert!(matches!(err, HttpClientError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_connection_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = HttpClientAdapter::new();
        let req = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(AxumBody::empty())
            .unwrap();
        let err = client.send_request(req).await.unwrap_err();
        assert!(matches!(err, HttpClientError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_sets_host_to_backend_authority() {
        let app = Router::new().route(
            "/host",
            get(|headers: axum::http::HeaderMap| async move {
                headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let client = HttpClientAdapter::new();
        let mut req = Request::builder()
            .uri(format!("http://{addr}/host"))
            .body(AxumBody::empty())
            .unwrap();
        req.headers_mut()
            .insert(header::HOST, HeaderValue::from_static("gateway.example"));
        let response = client.send_request(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(String::from_utf8_lossy(&body), addr.to_string());
    }
}

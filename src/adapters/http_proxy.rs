//! Reverse-proxy protocol handler for `http` / `https` services.
use std::{
    net::SocketAddr,
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use regex::Regex;
use tokio::time::timeout;
use tracing::Instrument;

use crate::{
    core::{
        errors::{ErrorCode, GatewayError},
        protocol::{DispatchContext, ProtocolHandler},
        router::RouteParams,
    },
    ports::http_client::{HttpClient, HttpClientError},
    tracing_setup::create_backend_span,
    utils::buffer_pool::{BufferPool, PooledBuffer},
};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");

/// Headers meaningful for a single hop only
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

static PATH_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*([A-Za-z_][A-Za-z0-9_]*)?|:([A-Za-z_][A-Za-z0-9_]*)")
        .expect("Invalid proxy path placeholder regex")
});

/// Default cap on a buffered request or response body
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct HttpProxyHandler {
    client: Arc<dyn HttpClient>,
    timeout: Duration,
    buffers: BufferPool,
    max_body_bytes: usize,
}

impl HttpProxyHandler {
    pub fn new(client: Arc<dyn HttpClient>, timeout: Duration, buffers: BufferPool) -> Self {
        Self {
            client,
            timeout,
            buffers,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    async fn forward(
        &self,
        outbound: Request,
    ) -> Result<(axum::http::response::Parts, Bytes), HttpClientError> {
        let response = self.client.send_request(outbound).await?;
        let (parts, body) = response.into_parts();
        let mut buffer = self.buffers.acquire();
        match read_body(body, self.max_body_bytes, &mut buffer).await {
            Ok(()) => Ok((parts, buffer.split().freeze())),
            Err(BodyError::TooLarge) => Err(HttpClientError::BodyError(format!(
                "response body exceeds {} bytes",
                self.max_body_bytes
            ))),
            Err(BodyError::Read(e)) => Err(HttpClientError::BodyError(e)),
        }
    }
}

#[derive(Debug)]
enum BodyError {
    TooLarge,
    Read(String),
}

/// True for requests asking to switch protocols
pub fn is_upgrade(req: &Request) -> bool {
    req.headers().contains_key(header::UPGRADE)
        || req
            .headers()
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
}

/// Key used by hash-based balancers: first `X-Forwarded-For` entry, `X-Real-IP`, then peer.
pub fn client_key(req: &Request) -> String {
    let header_value = |name: &HeaderName| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first) = header_value(&X_FORWARDED_FOR)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    if let Some(real_ip) = header_value(&X_REAL_IP) {
        return real_ip.to_string();
    }
    peer_addr(req)
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

fn peer_addr(req: &Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Backend path: the `proxy_path` template filled from `params`, or the inbound path.
pub fn backend_path(path: &str, proxy_path: Option<&str>, params: Option<&RouteParams>) -> String {
    let Some(template) = proxy_path.filter(|t| !t.is_empty()) else {
        return path.to_string();
    };
    let lookup = |key: &str| {
        params
            .and_then(|p| p.get(key))
            .unwrap_or_default()
            .to_string()
    };

    let mut filled = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PATH_PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        push_joined(&mut filled, &template[last..whole.start()]);
        let name = caps.get(2).or_else(|| caps.get(1)).map_or("*", |m| m.as_str());
        push_joined(&mut filled, &lookup(name));
        last = whole.end();
    }
    push_joined(&mut filled, &template[last..]);
    if filled.starts_with('/') {
        filled
    } else {
        format!("/{filled}")
    }
}

/// Appends `segment`, dropping one slash where two would meet at the seam.
fn push_joined(out: &mut String, segment: &str) {
    if out.ends_with('/') {
        out.push_str(segment.strip_prefix('/').unwrap_or(segment));
    } else {
        out.push_str(segment);
    }
}

async fn read_body(body: Body, limit: usize, buffer: &mut PooledBuffer) -> Result<(), BodyError> {
    let mut body = Limited::new(body, limit);
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| {
            if e.is::<LengthLimitError>() {
                BodyError::TooLarge
            } else {
                BodyError::Read(e.to_string())
            }
        })?;
        if let Ok(data) = frame.into_data() {
            buffer.extend_from_slice(&data);
        }
    }
    Ok(())
}

/// Scheme the client used: an inbound `X-Forwarded-Proto` from an earlier hop wins, then the
/// request URI scheme, then `http`.
fn forwarded_proto(inbound: &HeaderMap, scheme: Option<&str>) -> HeaderValue {
    if let Some(existing) = inbound.get(&X_FORWARDED_PROTO).filter(|v| !v.is_empty()) {
        return existing.clone();
    }
    match scheme {
        Some(scheme) if scheme.eq_ignore_ascii_case("https") => HeaderValue::from_static("https"),
        _ => HeaderValue::from_static("http"),
    }
}

fn outbound_headers(inbound: &HeaderMap, peer: Option<SocketAddr>, scheme: Option<&str>) -> HeaderMap {
    let mut headers = inbound.clone();
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(header::CONTENT_LENGTH);

    if let Some(peer) = peer {
        let chain = match inbound.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {}", peer.ip()),
            None => peer.ip().to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    headers.insert(X_FORWARDED_PROTO, forwarded_proto(inbound, scheme));
    if let Some(host) = inbound.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    headers
}

#[async_trait]
impl ProtocolHandler for HttpProxyHandler {
    fn name(&self) -> &str {
        "http"
    }

    fn supports(&self, req: &Request) -> bool {
        !is_upgrade(req)
    }

    async fn handle(&self, req: Request, ctx: Arc<DispatchContext>) -> Response {
        if is_upgrade(&req) {
            return GatewayError::with_detail(
                ErrorCode::UPGRADE_NOT_SUPPORTED,
                format!("upgrade requested for service '{}'", ctx.service_name),
            )
            .into_response();
        }

        let key = client_key(&req);
        let address = match ctx
            .upstreams
            .next(&ctx.service_name, &ctx.service, &key)
            .await
        {
            Ok(address) => address,
            Err(e) => return GatewayError::from(e).into_response(),
        };

        let path = backend_path(
            req.uri().path(),
            ctx.proxy_path.as_deref(),
            req.extensions().get::<RouteParams>(),
        );
        let target = match req.uri().query() {
            Some(query) => format!("http://{address}{path}?{query}"),
            None => format!("http://{address}{path}"),
        };
        let peer = peer_addr(&req);

        let (parts, body) = req.into_parts();
        let mut request_buffer = self.buffers.acquire();
        match read_body(body, self.max_body_bytes, &mut request_buffer).await {
            Ok(()) => {}
            Err(BodyError::TooLarge) => {
                return GatewayError::with_detail(
                    ErrorCode::PAYLOAD_TOO_LARGE,
                    format!("request body exceeds {} bytes", self.max_body_bytes),
                )
                .into_response();
            }
            Err(BodyError::Read(e)) => {
                return GatewayError::with_detail(
                    ErrorCode::INTERNAL_SERVER_ERROR,
                    format!("failed to read request body: {e}"),
                )
                .into_response();
            }
        }

        let mut outbound = Request::new(Body::from(request_buffer.split().freeze()));
        drop(request_buffer);
        *outbound.method_mut() = parts.method.clone();
        *outbound.headers_mut() = outbound_headers(&parts.headers, peer, parts.uri.scheme_str());
        *outbound.uri_mut() = match target.parse() {
            Ok(uri) => uri,
            Err(e) => {
                return GatewayError::with_detail(
                    ErrorCode::INTERNAL_SERVER_ERROR,
                    format!("invalid backend uri '{target}': {e}"),
                )
                .into_response();
            }
        };

        let span = create_backend_span(&ctx.service_name, &target, parts.method.as_str());
        let started = Instant::now();
        let result = timeout(self.timeout, self.forward(outbound))
            .instrument(span.clone())
            .await;
        span.record("duration_ms", started.elapsed().as_millis() as u64);

        match result {
            Err(_) => GatewayError::with_detail(
                ErrorCode::BACKEND_TIMEOUT,
                format!("{target} did not answer within {:?}", self.timeout),
            )
            .into_response(),
            Ok(Err(e)) => GatewayError::with_detail(
                ErrorCode::INTERNAL_SERVER_ERROR,
                format!("{target}: {e}"),
            )
            .into_response(),
            Ok(Ok((parts, bytes))) => {
                span.record("http.status_code", parts.status.as_u16());
                Response::from_parts(parts, Body::from(bytes))
            }
        }
    }
}

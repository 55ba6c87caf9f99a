// End-to-end proxying through a live entrypoint to loopback backends
#[cfg(test)]
mod test {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use axum::{Router, body::Body, routing::get};
    use http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use portway::{
        adapters::{
            BuiltinMiddleware, EntrypointServer, HttpClientAdapter, HttpProxyHandler,
            SnapshotRouteData,
        },
        config::{
            models::{Configuration, RouteNode, Server, ServiceRoute},
            settings::EntrypointSettings,
        },
        core::{
            BalancerFactory, ProtocolFactory, RouterManager,
            errors::{ErrorBody, ErrorCode},
        },
        ports::http_client::HttpClient,
        utils::BufferPool,
    };
    use tokio_util::sync::CancellationToken;

    async fn spawn_backend(name: &'static str) -> SocketAddr {
        let app = Router::new()
            .route("/orders", get(move || async move { name }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    "late"
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    fn server(addr: SocketAddr) -> Server {
        Server::new(addr.ip().to_string(), addr.port())
    }

    async fn start_gateway(config: &Configuration, timeout: Duration) -> (EntrypointServer, SocketAddr) {
        let proxy = HttpProxyHandler::new(
            Arc::new(HttpClientAdapter::new()),
            timeout,
            BufferPool::new(8),
        );
        let manager = RouterManager::new(
            Arc::new(ProtocolFactory::new().with_handler(Arc::new(proxy))),
            Arc::new(BalancerFactory::default()),
            Arc::new(SnapshotRouteData),
            Arc::new(BuiltinMiddleware),
        );
        let settings = EntrypointSettings {
            address: "127.0.0.1:0".to_string(),
            drain_timeout: Duration::from_secs(1),
        };
        let entrypoint = EntrypointServer::new(&settings, CancellationToken::new());
        entrypoint.switch_router(manager.create_routers(config).unwrap());
        let addr = entrypoint.start().await.unwrap();
        (entrypoint, addr)
    }

    async fn get_text(
        client: &HttpClientAdapter,
        gateway: SocketAddr,
        path: &str,
        forwarded_for: Option<&str>,
    ) -> (StatusCode, String) {
        let mut builder = Request::builder().uri(format!("http://{gateway}{path}"));
        if let Some(ip) = forwarded_for {
            builder = builder.header("x-forwarded-for", ip);
        }
        let response = client
            .send_request(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_robin_alternates_backends() {
        let a = spawn_backend("A").await;
        let b = spawn_backend("B").await;
        let config = Configuration::builder()
            .service(
                "orders",
                ServiceRoute::new()
                    .with_route(RouteNode::new("/orders"))
                    .with_server(server(a).with_weight(1))
                    .with_server(server(b).with_weight(1)),
            )
            .build();
        let (entrypoint, gateway) = start_gateway(&config, Duration::from_secs(5)).await;

        let client = HttpClientAdapter::new();
        let mut seen = Vec::new();
        for _ in 0..4 {
            let (status, body) = get_text(&client, gateway, "/orders", None).await;
            assert_eq!(status, StatusCode::OK);
            seen.push(body);
        }
        assert_eq!(seen, vec!["A", "B", "A", "B"]);

        entrypoint.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ip_hash_is_sticky_per_client() {
        let a = spawn_backend("A").await;
        let b = spawn_backend("B").await;
        let config = Configuration::builder()
            .service(
                "orders",
                ServiceRoute::new()
                    .with_balance_mode("ipHash")
                    .with_route(RouteNode::new("/orders"))
                    .with_server(server(a))
                    .with_server(server(b)),
            )
            .build();
        let (entrypoint, gateway) = start_gateway(&config, Duration::from_secs(5)).await;

        let client = HttpClientAdapter::new();
        for ip in ["203.0.113.7", "198.51.100.20"] {
            let (_, first) = get_text(&client, gateway, "/orders", Some(ip)).await;
            for _ in 0..3 {
                let (_, again) = get_text(&client, gateway, "/orders", Some(ip)).await;
                assert_eq!(again, first, "client {ip} moved between backends");
            }
        }

        entrypoint.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_backend_yields_timeout_response() {
        let a = spawn_backend("A").await;
        let config = Configuration::builder()
            .global_middleware(["recovery", "errorhandler"])
            .service(
                "orders",
                ServiceRoute::new()
                    .with_route(RouteNode::new("/slow"))
                    .with_server(server(a)),
            )
            .build();
        let (entrypoint, gateway) = start_gateway(&config, Duration::from_millis(200)).await;

        let client = HttpClientAdapter::new();
        let started = std::time::Instant::now();
        let (status, body) = get_text(&client, gateway, "/slow", None).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        let body: ErrorBody = serde_json::from_str(&body).unwrap();
        assert_eq!(body.code, ErrorCode::BACKEND_TIMEOUT.code);
        assert!(!body.message.contains("127.0.0.1"));

        entrypoint.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_service_without_servers_reports_missing_upstream() {
        let config = Configuration::builder()
            .service("orders", ServiceRoute::new().with_route(RouteNode::new("/orders")))
            .build();
        let (entrypoint, gateway) = start_gateway(&config, Duration::from_secs(1)).await;

        let client = HttpClientAdapter::new();
        let (status, body) = get_text(&client, gateway, "/orders", None).await;
        assert!(status.is_server_error());
        let body: ErrorBody = serde_json::from_str(&body).unwrap();
        assert!(
            [ErrorCode::NO_UPSTREAM.code, ErrorCode::UPSTREAM_NOT_INIT.code].contains(&body.code)
        );

        entrypoint.stop().await;
    }
}
